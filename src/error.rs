//! Error kinds for the memory engine.
//!
//! The set is closed on purpose: callers (HTTP layer, CLI) match on kinds to
//! pick status codes and exit codes, so new variants are a breaking change.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No active session with the given id.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// A storage operation failed. The enclosing transaction was rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// LLM transport failure that survived all retries.
    #[error("transient llm error: {0}")]
    TransientLlm(String),

    /// LLM returned output that does not match the requested schema.
    /// Not retried; the extractor falls back immediately.
    #[error("llm schema error: {0}")]
    Schema(String),

    /// The caller's cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit code for the CLI wrapper.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 2,
            Error::Storage(_) => 3,
            Error::TransientLlm(_) | Error::Schema(_) | Error::Cancelled => 4,
            Error::UnknownSession(_) => 4,
        }
    }
}
