// once-common - Shared types for the OnceServe workspace
//
// This crate defines the HTTP message model, resolved configuration, and
// the shared error taxonomy used by the guard and server crates.

pub mod config;
pub mod error;
pub mod http;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use http::*;
