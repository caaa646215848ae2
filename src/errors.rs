//! Error types for the fan control daemon

use thiserror::Error;

/// Result type alias for the fan control daemon
pub type Result<T> = std::result::Result<T, FanControlError>;

/// Main error type for the fan control daemon
#[derive(Error, Debug)]
pub enum FanControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("DBus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("GPIO error on pin {pin}: {message}")]
    Gpio { pin: u8, message: String },

    #[error("I2C error at address 0x{address:02x}: {message}")]
    I2c { address: u16, message: String },

    #[error("Temperature read error: {0}")]
    Temperature(String),

    #[error("Fan backend not ready: {name}")]
    NotReady { name: &'static str },

    #[error("Daemon not running")]
    DaemonNotRunning,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Helper function to convert display errors to zbus errors
pub fn zbus_error_from_display(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}", err))
}
