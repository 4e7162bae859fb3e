//! Errors for the DCP monitor
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DcpMonError {
    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Database error")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Invalid station address '{0}'")]
    InvalidAddress(String),

    #[error("No such group '{0}'")]
    NoSuchGroup(String),

    /// Malformed or unrecognized report protocol request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Scrub(#[from] ScrubError),
}

/// Domain error for the retention scrubber.
///
/// A scrub request for a day outside the retention range is surfaced to
/// the caller, never silently ignored.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubError {
    #[error("Scrub day {day} outside valid range [{earliest}, {latest}]")]
    DayOutOfRange {
        day: i32,
        earliest: i32,
        latest: i32,
    },
}
