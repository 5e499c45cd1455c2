// once-guard - Idempotency guard: a sharded in-memory store mapping
// idempotency keys to pending reservations or cached responses, plus a
// background sweeper that evicts expired records.

pub mod store;
pub mod sweeper;

pub use store::{GuardError, IdempotencyStore, Reservation, ShardedStore};
pub use sweeper::SweeperHandle;
