//! Autopilot daemon.
//!
//! Loads the deployment configuration, builds the device stack and runs
//! the supervisor until SIGINT/SIGTERM. With `--log-dir` the application
//! log also goes to a daily-rotating file next to the data.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use hypersas::config::Config;
use hypersas::registry::SerialRegistry;
use hypersas::runner::{Runner, Supervisor};

/// CLI options
#[derive(Parser, Debug)]
#[clap(name = "hypersasd", about = "Shipboard radiometer tower autopilot")]
struct Opts {
    /// Configuration file.
    #[clap(short, long, default_value = "hypersas_cfg.toml")]
    config: PathBuf,
    /// Directory receiving the rotating application log.
    #[clap(short, long)]
    log_dir: Option<PathBuf>,
    /// Verbose mode.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(opts: &Opts) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    match &opts.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "hypersas.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            None
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let _guard = init_tracing(&opts);

    // Uncaught panics land in the rotating log too.
    std::panic::set_hook(Box::new(|info| {
        error!("uncaught panic: {info}");
    }));

    let cfg = Config::load(&opts.config)
        .with_context(|| format!("loading {}", opts.config.display()))?;
    let registry = SerialRegistry::new();
    let runner = Runner::new(&cfg, &registry).context("building device stack")?;
    let mut supervisor = Supervisor::new(runner, &cfg);
    supervisor.start();
    info!("supervisor started in {:?} mode", supervisor.mode());

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("installing signal handler")?;
    let _ = rx.recv();

    info!("shutting down");
    supervisor.halt();
    Ok(())
}
