//! # Error Types
//!
//! Custom error types for Rover Link using `thiserror`.

use thiserror::Error;

/// Main error type for Rover Link
#[derive(Debug, Error)]
pub enum RoverLinkError {
    /// Transport open/send/receive failures
    #[error("transport error: {0}")]
    Transport(String),

    /// No vehicle link established, or the heartbeat has been lost
    #[error("not connected to vehicle")]
    NotConnected,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Rover Link
pub type Result<T> = std::result::Result<T, RoverLinkError>;
