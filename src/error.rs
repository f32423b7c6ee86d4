//! # Error Types
//!
//! Custom error types for Road Recorder using `thiserror`.

use thiserror::Error;

/// Main error type for Road Recorder
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Sensor bus errors (read timeout, NACK, short transfer)
    #[error("Sensor bus error: {0}")]
    Bus(String),

    /// GPIO line control errors during bus recovery
    #[error("GPIO error: {0}")]
    Gpio(String),

    /// Durable store errors
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Store is structurally unusable
    #[error("Storage integrity error: {0}")]
    Integrity(String),

    /// Store was used after `close`
    #[error("Storage is closed")]
    StorageClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Record payload encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A component's channel was closed underneath it
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Road Recorder
pub type Result<T> = std::result::Result<T, RecorderError>;
