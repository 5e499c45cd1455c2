//! # Idempotency Store
//!
//! Deduplicates retried mutating requests by their client-supplied key and
//! replays the cached response instead of re-executing side effects.
//!
//! ## Design Principles
//!
//! 1. **Strategy Pattern**: The store sits behind a trait so the server can
//!    swap implementations without touching the pipeline.
//! 2. **Sharded Locking**: Keys hash to a fixed set of buckets, each behind
//!    its own mutex, so unrelated keys never contend.
//! 3. **Linearizable Per-Key States**: Every observer of a key sees the
//!    sequence `absent -> Pending -> Completed`; a record never reverts.
//! 4. **Fail-Fast Duplicates**: A second request arriving while the first is
//!    still `Pending` is refused immediately (`InFlight` -> 409) instead of
//!    blocking, for predictable latency.
//!
//! ## Reservation lifecycle
//!
//! `check_and_reserve` either replays a completed record (`Hit`), refuses a
//! concurrent duplicate (`InFlight`), or inserts a `Pending` reservation
//! (`Reserved`). The caller that holds the reservation must resolve it with
//! exactly one of `complete` (success snapshot, now replayable) or `release`
//! (handler failed, a retry may execute again). Expiry applies to completed
//! records only; reservations are cleared exclusively by their owner, which
//! is what lets the background sweep run without ever touching an in-flight
//! request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;

use once_common::Response;

/// Number of independently locked buckets.
const SHARD_COUNT: usize = 16;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// A completed, unexpired record exists; replay this response and do not
    /// run the handler.
    Hit(Response),
    /// A fresh `Pending` record was inserted; the caller must run the handler
    /// and then resolve the reservation.
    Reserved,
    /// Another request with the same key is mid-flight; refuse the duplicate.
    InFlight,
}

/// Contract violations surfaced to the caller rather than swallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    /// `complete` was called for a key with no reservation.
    #[error("no reservation exists for this key")]
    UnknownKey,
    /// `complete` was called twice; a record transitions exactly once.
    #[error("reservation was already completed")]
    AlreadyCompleted,
}

/// Behavior surface of the idempotency guard.
pub trait IdempotencyStore: Send + Sync {
    /// Looks up the key and atomically reserves it when absent or expired.
    fn check_and_reserve(&self, key: &str) -> Reservation;

    /// Transitions a `Pending` reservation to `Completed` with the response
    /// snapshot that future retries will replay.
    fn complete(&self, key: &str, response: Response) -> Result<(), GuardError>;

    /// Drops a `Pending` reservation after a handler failure so a retry can
    /// execute again. Only success results are ever cached.
    fn release(&self, key: &str);

    /// Removes expired completed records. Returns how many were reclaimed.
    fn sweep_expired(&self) -> usize;
}

#[derive(Debug, Clone)]
enum RecordState {
    Pending,
    Completed(Response),
}

#[derive(Debug, Clone)]
struct Record {
    state: RecordState,
    expires_at: Instant,
}

impl Record {
    fn pending(now: Instant, ttl: Duration) -> Self {
        Record {
            state: RecordState::Pending,
            // Expiry is anchored at creation, not completion.
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Shard = Mutex<HashMap<String, Record>>;

/// Sharded in-memory implementation of [`IdempotencyStore`].
pub struct ShardedStore {
    shards: Vec<Shard>,
    hasher: RandomState,
    ttl: Duration,
}

impl ShardedStore {
    /// Creates a store with the default shard count.
    pub fn new(ttl: Duration) -> Arc<Self> {
        Self::with_shards(ttl, SHARD_COUNT)
    }

    pub fn with_shards(ttl: Duration, shards: usize) -> Arc<Self> {
        let shards = shards.max(1);
        Arc::new(ShardedStore {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
            ttl,
        })
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash % self.shards.len()]
    }

    /// Total number of live records, for diagnostics and tests.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdempotencyStore for ShardedStore {
    fn check_and_reserve(&self, key: &str) -> Reservation {
        let now = Instant::now();
        let mut shard = self.shard_for(key).lock();

        match shard.get_mut(key) {
            Some(record) => match &record.state {
                RecordState::Pending => Reservation::InFlight,
                RecordState::Completed(response) => {
                    if record.is_expired(now) {
                        tracing::debug!(key, "expired record reclaimed by retry");
                        *record = Record::pending(now, self.ttl);
                        Reservation::Reserved
                    } else {
                        Reservation::Hit(response.clone())
                    }
                }
            },
            None => {
                shard.insert(key.to_string(), Record::pending(now, self.ttl));
                Reservation::Reserved
            }
        }
    }

    fn complete(&self, key: &str, response: Response) -> Result<(), GuardError> {
        let mut shard = self.shard_for(key).lock();

        match shard.get_mut(key) {
            None => Err(GuardError::UnknownKey),
            Some(record) => match record.state {
                RecordState::Completed(_) => Err(GuardError::AlreadyCompleted),
                RecordState::Pending => {
                    record.state = RecordState::Completed(response);
                    Ok(())
                }
            },
        }
    }

    fn release(&self, key: &str) {
        let mut shard = self.shard_for(key).lock();

        match shard.get(key) {
            Some(record) if matches!(record.state, RecordState::Pending) => {
                shard.remove(key);
            }
            Some(_) => {
                tracing::warn!(key, "release called on a completed record; ignoring");
            }
            None => {
                tracing::warn!(key, "release called on an unknown key; ignoring");
            }
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            // Reservations are exempt: only their owner may clear them.
            shard.retain(|_, record| {
                matches!(record.state, RecordState::Pending) || !record.is_expired(now)
            });
            removed += before - shard.len();
        }

        if removed > 0 {
            tracing::debug!(removed, "swept expired idempotency records");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn ok_response(body: &str) -> Response {
        Response::new(200).with_body(body.to_string())
    }

    #[test]
    fn reserve_complete_then_hit() {
        let store = ShardedStore::new(Duration::from_secs(60));

        assert_eq!(store.check_and_reserve("k1"), Reservation::Reserved);
        store.complete("k1", ok_response("payment done")).unwrap();

        match store.check_and_reserve("k1") {
            Reservation::Hit(response) => {
                assert_eq!(response, ok_response("payment done"));
            }
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn pending_duplicate_is_refused() {
        let store = ShardedStore::new(Duration::from_secs(60));

        assert_eq!(store.check_and_reserve("k1"), Reservation::Reserved);
        assert_eq!(store.check_and_reserve("k1"), Reservation::InFlight);
    }

    #[test]
    fn release_allows_retry_to_execute() {
        let store = ShardedStore::new(Duration::from_secs(60));

        assert_eq!(store.check_and_reserve("k1"), Reservation::Reserved);
        store.release("k1");
        assert_eq!(store.check_and_reserve("k1"), Reservation::Reserved);
    }

    #[test]
    fn complete_without_reservation_is_an_error() {
        let store = ShardedStore::new(Duration::from_secs(60));
        assert_eq!(
            store.complete("ghost", ok_response("x")),
            Err(GuardError::UnknownKey)
        );
    }

    #[test]
    fn double_complete_is_an_error() {
        let store = ShardedStore::new(Duration::from_secs(60));
        store.check_and_reserve("k1");
        store.complete("k1", ok_response("first")).unwrap();
        assert_eq!(
            store.complete("k1", ok_response("second")),
            Err(GuardError::AlreadyCompleted)
        );

        // The original snapshot survives.
        match store.check_and_reserve("k1") {
            Reservation::Hit(response) => assert_eq!(response, ok_response("first")),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn distinct_keys_never_share_state() {
        let store = ShardedStore::new(Duration::from_secs(60));

        assert_eq!(store.check_and_reserve("a"), Reservation::Reserved);
        assert_eq!(store.check_and_reserve("b"), Reservation::Reserved);

        store.complete("a", ok_response("for a")).unwrap();
        assert_eq!(store.check_and_reserve("b"), Reservation::InFlight);
        match store.check_and_reserve("a") {
            Reservation::Hit(response) => assert_eq!(response, ok_response("for a")),
            other => panic!("expected Hit, got {other:?}"),
        }
    }

    #[test]
    fn expired_record_is_treated_as_absent() {
        let store = ShardedStore::new(Duration::from_millis(20));

        store.check_and_reserve("k1");
        store.complete("k1", ok_response("old")).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.check_and_reserve("k1"), Reservation::Reserved);
    }

    #[test]
    fn sweep_reclaims_expired_but_never_pending() {
        let store = ShardedStore::new(Duration::from_millis(20));

        store.check_and_reserve("done");
        store.complete("done", ok_response("x")).unwrap();
        store.check_and_reserve("in-flight");

        thread::sleep(Duration::from_millis(40));
        let removed = store.sweep_expired();

        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        // The reservation is still held, even past its nominal expiry.
        assert_eq!(store.check_and_reserve("in-flight"), Reservation::InFlight);
    }

    #[test]
    fn concurrent_reservations_grant_exactly_one() {
        let store = ShardedStore::new(Duration::from_secs(60));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                matches!(store.check_and_reserve("same-key"), Reservation::Reserved)
            }));
        }

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&granted| granted)
            .count();
        assert_eq!(granted, 1);
    }
}
