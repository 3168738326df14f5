use thiserror::Error;

pub type Result<T> = std::result::Result<T, SasError>;

#[derive(Error, Debug)]
pub enum SasError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Device not running")]
    NotRunning,

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("No calibration loaded")]
    NoCalibration,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Position {requested:.2} outside limits [{min:.1}, {max:.1}]")]
    PositionOutOfRange {
        requested: f64,
        min: f64,
        max: f64,
    },

    #[error("Timeout waiting for {0}")]
    Timeout(&'static str),

    #[error("Log writer is closed")]
    LoggerClosed,
}
