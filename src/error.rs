//! Error types for the Cartwheel reservation cart

use thiserror::Error;

/// Main cart error type
///
/// Recoverable business outcomes (capacity reached, equipment unavailable,
/// partial booking failure) are *not* errors: they are returned as data from
/// the operations that produce them. This enum covers construction mistakes,
/// storage faults and collaborator transport failures.
#[derive(Error, Debug)]
pub enum CartError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Availability check failed: {0}")]
    Availability(String),

    #[error("Booking submission failed: {0}")]
    Submission(String),

    #[error("Configuration load error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

/// Result type alias for cart operations
pub type CartResult<T> = Result<T, CartError>;
