//! Coordination store backends for courierq.
//!
//! A backend holds every piece of shared mutable state of the queue:
//! - the **durable stream** of ready jobs, read through a consumer group
//! - the **scheduled set** of jobs that are not due yet
//! - the **dead letter store** of jobs that used up their retry budget
//! - the **dedup claims**, short-lived keys with a TTL
//!
//! Every mutation is a single atomic operation or atomic batch, so any number
//! of workers and processes may share one backend.
//!
//! - **In-Memory**: single process, for development and tests
//! - **Redis**: Redis Streams, sorted set and `SET NX PX` keys (`redis-queue` feature)

use crate::error::CourierResult;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;
pub use memory::InMemoryBackend;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisBackend;

/// Cursor value meaning "start of the pending list" and, when returned from
/// [`QueueBackend::claim_stale`], "no more entries".
pub const CURSOR_START: &str = "0-0";

/// Field name holding the job JSON inside stream entries.
pub const JOB_FIELD: &str = "job";

/// One entry read from the durable stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Stream entry id, used to acknowledge the entry
    pub id: String,
    /// Raw job JSON; `None` when the entry carries no job field
    pub payload: Option<String>,
}

/// Result of one stale-entry claim round.
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    /// Where the next round starts; [`CURSOR_START`] when the scan is complete
    pub next_cursor: String,
    /// Entries now owned by the claiming consumer
    pub records: Vec<StreamRecord>,
}

impl ClaimBatch {
    /// Whether the pending list has been scanned to the end.
    pub fn is_last(&self) -> bool {
        self.next_cursor == CURSOR_START
    }
}

/// Number of jobs in each part of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Entries in the durable stream (not yet acknowledged)
    pub ready: u64,
    /// Jobs waiting in the scheduled set
    pub scheduled: u64,
    /// Jobs in the dead letter store
    pub dead_letter: u64,
}

/// Trait that all coordination store backends must implement.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Create the consumer group (and the stream) if missing. Idempotent.
    async fn ensure_group(&self) -> CourierResult<()>;

    /// Append a job to the stream, trimming the oldest entries approximately
    /// past the configured maximum length. Returns the entry id.
    async fn stream_append(&self, payload: &str) -> CourierResult<String>;

    /// Read up to `count` never-delivered entries for `consumer`, waiting at most
    /// `block` for new ones to arrive.
    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CourierResult<Vec<StreamRecord>>;

    /// Acknowledge and remove an entry.
    async fn ack(&self, entry_id: &str) -> CourierResult<()>;

    /// Acknowledge an entry and put its job back into the scheduled set, atomically.
    async fn ack_and_schedule(&self, entry_id: &str, payload: &str, due_ms: u64)
    -> CourierResult<()>;

    /// Acknowledge an entry and append its job to the dead letter store, atomically.
    async fn ack_and_dead_letter(&self, entry_id: &str, payload: &str) -> CourierResult<()>;

    /// Transfer entries that have been pending longer than `min_idle` to
    /// `consumer`, scanning the pending list from `cursor`.
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> CourierResult<ClaimBatch>;

    /// Add a job to the scheduled set, due at `due_ms` (epoch milliseconds).
    async fn schedule(&self, payload: &str, due_ms: u64) -> CourierResult<()>;

    /// Move up to `limit` jobs due at `now_ms` from the scheduled set into the
    /// stream. Each move is atomic and a job is moved by exactly one caller.
    /// Returns the moved payloads.
    async fn promote_due(&self, now_ms: u64, limit: usize) -> CourierResult<Vec<String>>;

    /// Oldest dead letters, left in place.
    async fn peek_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>>;

    /// Oldest dead letters, removed from the store.
    async fn drain_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>>;

    /// Set `key` to `value` with a TTL unless it already exists.
    /// Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> CourierResult<bool>;

    /// Current value of a key.
    async fn get_key(&self, key: &str) -> CourierResult<Option<String>>;

    /// Extend the TTL of `key` if it is missing or owned by `owner`.
    /// Returns `false` when another owner holds it.
    async fn refresh_key(&self, key: &str, owner: &str, ttl_ms: u64) -> CourierResult<bool>;

    /// Delete `key` if it is owned by `owner`.
    async fn release_key(&self, key: &str, owner: &str) -> CourierResult<bool>;

    /// Current queue depth.
    async fn depth(&self) -> CourierResult<QueueDepth>;

    /// Health check for the backend
    async fn health_check(&self) -> CourierResult<()>;

    /// Delete the stream, scheduled set and dead letter store (dangerous operation).
    /// Returns the number of jobs removed.
    async fn purge(&self) -> CourierResult<u64>;
}
