//! # Shared Error Types
//!
//! Transport-level failures that abort startup or a single accept, kept
//! separate from the per-crate protocol (`ParseError`) and contract
//! (`GuardError`) errors. Only bind/listen failures are process-fatal;
//! everything else stays local to one connection.

use std::io;

use thiserror::Error;

/// Result type used across OnceServe components.
pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Fatal: the configured port could not be bound (in use, permission).
    #[error("failed to bind 0.0.0.0:{port}: {source}")]
    Bind { port: u16, source: io::Error },

    /// Fatal: the bound socket could not enter the listening state.
    #[error("failed to listen with backlog {backlog}: {source}")]
    Listen { backlog: i32, source: io::Error },

    /// Non-fatal transport error on an individual connection.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// True for errors that must abort startup rather than a single
    /// connection.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Bind { .. } | ServerError::Listen { .. })
    }
}
