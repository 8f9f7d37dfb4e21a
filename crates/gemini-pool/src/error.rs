//! Error types for key pool operations

/// Errors from key pool operations.
///
/// The rotator's own operations never return these; persistence failures are
/// logged and swallowed there. They surface from the store backends and from
/// `with_rotation`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("state parse error: {0}")]
    StateParse(String),

    #[error("no Gemini API key available: service at capacity")]
    NoCredentialAvailable,

    #[error("high demand, try again later (gave up after {attempts} attempts: {last_error})")]
    HighDemand { attempts: usize, last_error: String },
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
