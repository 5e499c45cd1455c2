// once-server - Concurrent HTTP/1.1 server with exactly-once semantics for
// mutating requests. Dispatch (listener, bounded queue, worker pool), wire
// codec, and the per-connection pipeline live here; the idempotency store
// lives in once-guard.

pub mod codec;
pub mod connection;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod queue;
pub mod server;
