//! Domain errors. Used by ports and use cases.
//!
//! Adapters map infrastructure errors into these.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Telegram gateway error: {0}")]
    Gateway(String),

    #[error("media download failed at offset {offset}: {reason}")]
    Download { offset: u64, reason: String },

    #[error("state error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// FloodWait error: the server asked us to back off for `seconds`.
    #[error("FloodWait: retry after {seconds} seconds")]
    FloodWait { seconds: u64 },
}
