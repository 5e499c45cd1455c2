//! # Resolved Configuration
//!
//! Values are resolved once at startup (environment variables at the binary
//! boundary) and are immutable afterwards; the core components only ever see
//! the resolved struct.

use std::time::Duration;

/// Size limits applied while parsing a request.
///
/// Defaults match the original deployment: 64 headers, 2 KiB URIs, 8 KiB
/// header values, 1 MiB bodies.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum total size of the request line + header section.
    pub max_head_bytes: usize,
    /// Maximum number of headers; exceeding this fails the parse.
    pub max_headers: usize,
    pub max_uri_length: usize,
    /// Over-length names fail the parse.
    pub max_header_name_length: usize,
    /// Over-length values are truncated, not rejected.
    pub max_header_value_length: usize,
    /// Over-length keys are rejected; truncation could alias distinct keys.
    pub max_idempotency_key_length: usize,
    /// Bodies larger than this are rejected with 413 before being read.
    pub max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_head_bytes: 8192,
            max_headers: 64,
            max_uri_length: 2048,
            max_header_name_length: 256,
            max_header_value_length: 8192,
            max_idempotency_key_length: 256,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Server-wide configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Listen backlog passed to the socket.
    pub backlog: i32,
    /// Number of pre-spawned workers draining the task queue.
    pub workers: usize,
    /// Task queue capacity; 0 means unbounded.
    pub queue_capacity: usize,
    /// How long a completed idempotency record stays replayable.
    pub idempotency_ttl: Duration,
    /// Interval between background sweeps of expired records.
    pub sweep_interval: Duration,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            backlog: 128,
            workers: 4,
            queue_capacity: 256,
            idempotency_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            limits: Limits::default(),
        }
    }
}

impl ServerConfig {
    /// Resolves configuration from `ONCE_*` environment variables, falling
    /// back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        ServerConfig {
            port: env_parse("ONCE_PORT", defaults.port),
            backlog: env_parse("ONCE_BACKLOG", defaults.backlog),
            workers: env_parse("ONCE_WORKERS", defaults.workers),
            queue_capacity: env_parse("ONCE_QUEUE_CAPACITY", defaults.queue_capacity),
            idempotency_ttl: Duration::from_secs(env_parse(
                "ONCE_IDEMPOTENCY_TTL_SECS",
                defaults.idempotency_ttl.as_secs(),
            )),
            sweep_interval: Duration::from_millis(env_parse(
                "ONCE_SWEEP_INTERVAL_MS",
                defaults.sweep_interval.as_millis() as u64,
            )),
            limits: defaults.limits,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
