//! # hypersas - Autonomous above-water radiometer tower control
//!
//! A Rust library for operating a shipboard HyperSAS hyperspectral
//! radiometer assembly: two radiance heads, an irradiance head, a
//! tilt-heading sensor, a two-antenna RTK GPS and a motorized indexing
//! table, all kept pointed at a configured azimuth away from the sun while
//! the ship yaws.
//!
//! ## Features
//!
//! - Calibration-driven Satlantic frame parsing and merged binary logging
//! - UBX `NAV-PVT` / `NAV-RELPOSNED` decoding for position and RTK heading
//! - Pure steering geometry with blind-zone limits and hysteresis
//! - Supervisor state machine with night sleep, debounced wake-up and GPS
//!   time synchronization
//! - Offline reassembly of per-sensor logs into the merged record
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use hypersas::config::Config;
//! use hypersas::registry::SerialRegistry;
//! use hypersas::runner::{Runner, Supervisor};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::load(Path::new("hypersas.toml"))?;
//!     let registry = SerialRegistry::new();
//!     let runner = Runner::new(&cfg, &registry)?;
//!     let mut supervisor = Supervisor::new(runner, &cfg);
//!     supervisor.start();
//!     // ... run until shutdown ...
//!     supervisor.halt();
//!     Ok(())
//! }
//! ```

pub mod angle;
pub mod autopilot;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod declination;
pub mod error;
pub mod gps;
pub mod logger;
pub mod parser;
pub mod prep;
pub mod protocol;
pub mod radiometer;
pub mod registry;
pub mod relay;
pub mod runner;
pub mod solar;
pub mod table;
pub mod ubx;

pub use autopilot::AutoPilot;
pub use calibration::{Calibration, Channel};
pub use config::Config;
pub use error::{Result, SasError};
pub use gps::{Gps, GpsSnapshot};
pub use logger::{CsvLogger, SatLogger};
pub use parser::SatParser;
pub use prep::Converter;
pub use radiometer::{Radiometer, RadiometerSnapshot};
pub use registry::{SerialRegistry, SharedPort};
pub use runner::{Runner, RunnerState, Supervisor};
pub use table::{IndexingTable, TableState};
