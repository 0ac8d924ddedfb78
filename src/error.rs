//! Custom error types for the gateway.
//!
//! This module defines the primary error type, `GatewayError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures the gateway runs into, from configuration issues to
//! serial bus faults and unreachable cloud endpoints.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: loading failures from `figment` and semantic
//!   validation failures of an otherwise well-formed file.
//! - **`SerialOpen`**, **`Timeout`**, **`ModbusException`**, **`MalformedFrame`**: field bus
//!   transport errors. These are always recovered locally by skipping the current tick.
//! - **`Decode`**: a response that was transported fine but cannot be interpreted with the
//!   configured register descriptor. Treated like a transport error by the scheduler.
//! - **`Storage`**: failures of the persistence backend.
//! - **`Http`** / **`Remote`**: prediction, export and config-sync endpoint failures.
//!
//! No variant is fatal to a running gateway; callers log and degrade.

use thiserror::Error;

/// Convenience alias for results using the gateway error type.
pub type AppResult<T> = std::result::Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open serial port '{port}': {reason}")]
    SerialOpen { port: String, reason: String },

    #[error("Connection '{0}' is not open")]
    ConnectionNotOpen(String),

    #[error("Bus transaction timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Modbus exception from unit {unit}: function 0x{function:02X}, code 0x{code:02X}")]
    ModbusException { unit: u8, function: u8, code: u8 },

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Register decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote endpoint rejected request: {0}")]
    Remote(String),

    #[error("Unknown sensor '{0}'")]
    UnknownSensor(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl GatewayError {
    /// Whether retrying the same bus transaction may succeed.
    ///
    /// Timeouts, I/O hiccups and garbled frames are line noise on a shared bus.
    /// Exception responses and decode failures are answers from the device and
    /// will not change on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Timeout(_) | GatewayError::Io(_) | GatewayError::MalformedFrame(_)
        )
    }
}

impl From<figment::Error> for GatewayError {
    fn from(value: figment::Error) -> Self {
        GatewayError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_sqlite")]
impl From<rusqlite::Error> for GatewayError {
    fn from(value: rusqlite::Error) -> Self {
        GatewayError::Storage(value.to_string())
    }
}
