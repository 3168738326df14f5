//! Offline reassembler CLI.
//!
//! Converts a directory of autopilot output (radiometer binaries, GPS and
//! indexing-table CSV logs) into merged, timestamp-sorted binary records,
//! one file per UTC day or hour.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use hypersas::prep::{Converter, Window};

/// CLI options
#[derive(Parser, Debug)]
#[clap(name = "sasprep", about = "Reassemble autopilot output into merged records")]
struct Opts {
    /// Radiometer calibration bundle (.sip, directory, or .cal).
    #[clap(long)]
    cal: PathBuf,
    /// Deployment configuration file.
    #[clap(long)]
    cfg: PathBuf,
    /// Directory of files to process.
    #[clap(short, long)]
    directory: PathBuf,
    /// Group output by day or hour.
    #[clap(short, long, default_value = "day")]
    mode: String,
    /// Prefix of output file names.
    #[clap(short, long)]
    file_out_prefix: Option<String>,
    /// Name of the experiment.
    #[clap(short, long)]
    experiment: Option<String>,
    /// Name of the cruise.
    #[clap(short, long)]
    cruise: Option<String>,
    /// Compute the magnetic variation per GPS row (slow).
    #[clap(long)]
    per_row_declination: bool,
    /// Output directory.
    out: PathBuf,
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let mode = Window::from_str(&opts.mode)?;
    let prefix = match &opts.file_out_prefix {
        Some(p) => format!("{p}_"),
        None => {
            let parts: Vec<&str> = [opts.experiment.as_deref(), opts.cruise.as_deref()]
                .into_iter()
                .flatten()
                .collect();
            if parts.is_empty() {
                String::new()
            } else {
                format!("{}_", parts.join("_"))
            }
        }
    };

    let converter = Converter::new(&opts.cal, &opts.cfg).context("loading calibration")?;
    converter
        .run(
            &opts.directory,
            &opts.out,
            &prefix,
            mode,
            opts.per_row_declination,
        )
        .context("reassembling")?;
    Ok(())
}
