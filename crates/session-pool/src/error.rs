//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The desired-credential document could not be read or written. The
    /// current pass is abandoned and the next trigger retries.
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
