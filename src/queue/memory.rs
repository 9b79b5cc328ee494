//! In-memory backend for courierq.
//!
//! Mirrors the Redis layout inside one process: a stream with a single
//! consumer group and per-consumer pending entries, a scored scheduled set, a
//! dead letter list and TTL keys. All state sits behind one async mutex, so
//! every trait method is atomic.
//!
//! Good for development, tests and single-process deployments that accept
//! losing the queue on restart.

use super::{CURSOR_START, ClaimBatch, QueueBackend, QueueDepth, StreamRecord};
use crate::config::QueueConfig;
use crate::error::{CourierError, CourierResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// Delivery bookkeeping for an entry handed to a consumer but not acknowledged.
#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    /// Unacknowledged entries by sequence number
    entries: BTreeMap<u64, String>,
    /// Highest sequence handed out to the group
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
    group_created: bool,
}

#[derive(Debug, Default)]
struct State {
    stream: StreamState,
    /// Scheduled payload -> due time (epoch ms)
    scheduled: HashMap<String, u64>,
    dead: VecDeque<String>,
    /// Key -> (value, expiry)
    keys: HashMap<String, (String, Instant)>,
}

fn entry_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_entry_id(id: &str) -> CourierResult<u64> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse().ok())
        .ok_or_else(|| CourierError::store_msg(format!("invalid stream id '{id}'")))
}

impl State {
    fn append(&mut self, payload: String, max_len: usize) -> String {
        let stream = &mut self.stream;
        stream.next_seq += 1;
        let seq = stream.next_seq;
        stream.entries.insert(seq, payload);

        while stream.entries.len() > max_len {
            if let Some((oldest, _)) = stream.entries.pop_first() {
                stream.pending.remove(&oldest);
            }
        }

        entry_id(seq)
    }

    fn deliver_new(&mut self, consumer: &str, count: usize) -> Vec<StreamRecord> {
        let stream = &mut self.stream;
        let now = Instant::now();
        let fresh: Vec<(u64, String)> = stream
            .entries
            .range(stream.last_delivered + 1..)
            .take(count)
            .map(|(seq, payload)| (*seq, payload.clone()))
            .collect();

        let mut records = Vec::with_capacity(fresh.len());
        for (seq, payload) in fresh {
            stream.last_delivered = seq;
            stream.pending.insert(
                seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            records.push(StreamRecord {
                id: entry_id(seq),
                payload: Some(payload),
            });
        }
        records
    }

    fn ack(&mut self, seq: u64) {
        self.stream.entries.remove(&seq);
        self.stream.pending.remove(&seq);
    }

    /// Drop every claim key past its expiry.
    fn prune_expired_keys(&mut self) {
        let now = Instant::now();
        self.keys.retain(|_, (_, expires_at)| *expires_at > now);
    }

    /// Value of a key unless it has expired; expired keys are dropped.
    fn live_key(&mut self, key: &str) -> Option<&String> {
        let expired = self
            .keys
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= Instant::now());
        if expired {
            self.keys.remove(key);
        }
        self.keys.get(key).map(|(value, _)| value)
    }
}

/// Instant a key with the given TTL expires, clamped far in the future.
fn expiry(ttl_ms: u64) -> Instant {
    let now = Instant::now();
    now.checked_add(Duration::from_millis(ttl_ms))
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 86_400))
}

/// In-memory backend implementation
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    /// Wakes blocked readers when entries are appended
    appended: Notify,
    config: QueueConfig,
    offline: AtomicBool,
    /// Fail stream and scheduled-set writes while claims keep working
    writes_failing: AtomicBool,
}

impl InMemoryBackend {
    /// Create a new in-memory backend with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a new in-memory backend with custom configuration
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
            config,
            offline: AtomicBool::new(false),
            writes_failing: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: while offline every call fails with a store error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate a partial outage where job writes fail but claim keys work.
    pub fn set_writes_failing(&self, failing: bool) {
        self.writes_failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> CourierResult<()> {
        self.check_online()?;
        if self.writes_failing.load(Ordering::SeqCst) {
            return Err(CourierError::store_msg("in-memory backend rejected the write"));
        }
        Ok(())
    }

    fn check_online(&self) -> CourierResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CourierError::store_msg("in-memory backend is offline"));
        }
        Ok(())
    }

    /// Number of times the entry has been handed to a consumer, if pending.
    pub async fn delivery_count(&self, entry_id: &str) -> Option<u32> {
        let seq = parse_entry_id(entry_id).ok()?;
        let state = self.state.lock().await;
        state.stream.pending.get(&seq).map(|p| p.deliveries)
    }

    /// Consumer currently owning a pending entry.
    pub async fn pending_owner(&self, entry_id: &str) -> Option<String> {
        let seq = parse_entry_id(entry_id).ok()?;
        let state = self.state.lock().await;
        state.stream.pending.get(&seq).map(|p| p.consumer.clone())
    }

    /// Payloads currently in the scheduled set with their due times, soonest first.
    pub async fn scheduled_entries(&self) -> Vec<(String, u64)> {
        let state = self.state.lock().await;
        let mut entries: Vec<(String, u64)> = state
            .scheduled
            .iter()
            .map(|(payload, due)| (payload.clone(), *due))
            .collect();
        entries.sort_by_key(|(_, due)| *due);
        entries
    }

    /// Payloads currently in the stream, oldest first.
    pub async fn stream_entries(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.stream.entries.values().cloned().collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryBackend {
    async fn ensure_group(&self) -> CourierResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.stream.group_created = true;
        Ok(())
    }

    async fn stream_append(&self, payload: &str) -> CourierResult<String> {
        self.check_writable()?;
        let id = {
            let mut state = self.state.lock().await;
            state.append(payload.to_string(), self.config.max_stream_length)
        };
        self.appended.notify_waiters();
        tracing::trace!(entry_id = %id, "Appended stream entry");
        Ok(id)
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CourierResult<Vec<StreamRecord>> {
        let deadline = Instant::now() + block;

        loop {
            // Registered before checking so an append in between is not missed
            let appended = self.appended.notified();
            {
                self.check_online()?;
                let mut state = self.state.lock().await;
                if !state.stream.group_created {
                    return Err(CourierError::store_msg(format!(
                        "NOGROUP no consumer group '{}'",
                        self.config.group
                    )));
                }
                let records = state.deliver_new(consumer, count);
                if !records.is_empty() {
                    return Ok(records);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, entry_id: &str) -> CourierResult<()> {
        self.check_online()?;
        let seq = parse_entry_id(entry_id)?;
        self.state.lock().await.ack(seq);
        Ok(())
    }

    async fn ack_and_schedule(
        &self,
        entry_id: &str,
        payload: &str,
        due_ms: u64,
    ) -> CourierResult<()> {
        self.check_online()?;
        let seq = parse_entry_id(entry_id)?;
        let mut state = self.state.lock().await;
        state.ack(seq);
        state.scheduled.insert(payload.to_string(), due_ms);
        Ok(())
    }

    async fn ack_and_dead_letter(&self, entry_id: &str, payload: &str) -> CourierResult<()> {
        self.check_online()?;
        let seq = parse_entry_id(entry_id)?;
        let mut state = self.state.lock().await;
        state.ack(seq);
        state.dead.push_back(payload.to_string());
        Ok(())
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> CourierResult<ClaimBatch> {
        self.check_online()?;
        let start = parse_entry_id(cursor)?;
        let now = Instant::now();

        let mut state = self.state.lock().await;
        let StreamState {
            entries, pending, ..
        } = &mut state.stream;

        let mut batch = ClaimBatch {
            next_cursor: CURSOR_START.to_string(),
            records: Vec::new(),
        };

        for (seq, entry) in pending.range_mut(start..) {
            if batch.records.len() == count {
                batch.next_cursor = entry_id(*seq);
                break;
            }
            if now.duration_since(entry.delivered_at) < min_idle {
                continue;
            }
            entry.consumer = consumer.to_string();
            entry.delivered_at = now;
            entry.deliveries += 1;
            batch.records.push(StreamRecord {
                id: entry_id(*seq),
                payload: entries.get(seq).cloned(),
            });
        }

        Ok(batch)
    }

    async fn schedule(&self, payload: &str, due_ms: u64) -> CourierResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        state.scheduled.insert(payload.to_string(), due_ms);
        Ok(())
    }

    async fn promote_due(&self, now_ms: u64, limit: usize) -> CourierResult<Vec<String>> {
        self.check_online()?;
        let promoted = {
            let mut state = self.state.lock().await;
            let mut due: Vec<(u64, String)> = state
                .scheduled
                .iter()
                .filter(|(_, at)| **at <= now_ms)
                .map(|(payload, at)| (*at, payload.clone()))
                .collect();
            due.sort();
            due.truncate(limit);

            let mut promoted = Vec::with_capacity(due.len());
            for (_, payload) in due {
                if state.scheduled.remove(&payload).is_some() {
                    state.append(payload.clone(), self.config.max_stream_length);
                    promoted.push(payload);
                }
            }
            promoted
        };

        if !promoted.is_empty() {
            self.appended.notify_waiters();
        }
        Ok(promoted)
    }

    async fn peek_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>> {
        self.check_online()?;
        let state = self.state.lock().await;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn drain_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let n = limit.min(state.dead.len());
        Ok(state.dead.drain(..n).collect())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> CourierResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.prune_expired_keys();
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        let expires_at = expiry(ttl_ms);
        state
            .keys
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(true)
    }

    async fn get_key(&self, key: &str) -> CourierResult<Option<String>> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        Ok(state.live_key(key).cloned())
    }

    async fn refresh_key(&self, key: &str, owner: &str, ttl_ms: u64) -> CourierResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.live_key(key).is_some_and(|current| current != owner) {
            return Ok(false);
        }
        let expires_at = expiry(ttl_ms);
        state
            .keys
            .insert(key.to_string(), (owner.to_string(), expires_at));
        Ok(true)
    }

    async fn release_key(&self, key: &str, owner: &str) -> CourierResult<bool> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        if state.live_key(key).is_some_and(|current| current == owner) {
            state.keys.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn depth(&self) -> CourierResult<QueueDepth> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        state.prune_expired_keys();
        Ok(QueueDepth {
            ready: state.stream.entries.len() as u64,
            scheduled: state.scheduled.len() as u64,
            dead_letter: state.dead.len() as u64,
        })
    }

    async fn health_check(&self) -> CourierResult<()> {
        self.check_online()?;
        let state = self.state.lock().await;
        tracing::debug!(
            ready = state.stream.entries.len(),
            pending = state.stream.pending.len(),
            scheduled = state.scheduled.len(),
            dead = state.dead.len(),
            "In-memory backend health check"
        );
        Ok(())
    }

    async fn purge(&self) -> CourierResult<u64> {
        self.check_online()?;
        let mut state = self.state.lock().await;
        let purged =
            state.stream.entries.len() + state.scheduled.len() + state.dead.len();

        state.stream.entries.clear();
        state.stream.pending.clear();
        state.scheduled.clear();
        state.dead.clear();

        tracing::warn!("Purged {} jobs from in-memory backend", purged);
        Ok(purged as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn backend() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend.ensure_group().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_append_read_ack() {
        let backend = backend().await;
        let id = backend.stream_append("{\"id\":\"a\"}").await.unwrap();

        let records = backend
            .read_group("c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].payload.as_deref(), Some("{\"id\":\"a\"}"));

        // Delivered entries are not handed out twice
        let again = backend
            .read_group("c2", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(again.is_empty());

        backend.ack(&id).await.unwrap();
        assert_eq!(backend.depth().await.unwrap().ready, 0);
        assert_eq!(backend.delivery_count(&id).await, None);
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let backend = InMemoryBackend::new();
        let err = backend
            .read_group("c1", 1, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("NOGROUP"));
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_append() {
        let backend = Arc::new(backend().await);

        let reader = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move {
                backend
                    .read_group("c1", 10, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.stream_append("late").await.unwrap();

        let records = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader should wake up")
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_stale_respects_idle_time() {
        let backend = backend().await;
        let id = backend.stream_append("job").await.unwrap();
        backend
            .read_group("crashed", 1, Duration::from_millis(1))
            .await
            .unwrap();

        let early = backend
            .claim_stale("rescuer", Duration::from_millis(50), CURSOR_START, 10)
            .await
            .unwrap();
        assert!(early.records.is_empty());
        assert!(early.is_last());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claimed = backend
            .claim_stale("rescuer", Duration::from_millis(50), CURSOR_START, 10)
            .await
            .unwrap();
        assert_eq!(claimed.records.len(), 1);
        assert_eq!(claimed.records[0].id, id);
        assert_eq!(backend.pending_owner(&id).await.as_deref(), Some("rescuer"));
        assert_eq!(backend.delivery_count(&id).await, Some(2));

        // Claiming resets the idle clock
        let immediate = backend
            .claim_stale("other", Duration::from_millis(50), CURSOR_START, 10)
            .await
            .unwrap();
        assert!(immediate.records.is_empty());
    }

    #[tokio::test]
    async fn test_claim_stale_pages_with_cursor() {
        let backend = backend().await;
        for i in 0..3 {
            backend.stream_append(&format!("job-{i}")).await.unwrap();
        }
        backend
            .read_group("crashed", 10, Duration::from_millis(1))
            .await
            .unwrap();

        let first = backend
            .claim_stale("rescuer", Duration::ZERO, CURSOR_START, 2)
            .await
            .unwrap();
        assert_eq!(first.records.len(), 2);
        assert!(!first.is_last());

        let second = backend
            .claim_stale("rescuer", Duration::ZERO, &first.next_cursor, 2)
            .await
            .unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.is_last());
    }

    #[tokio::test]
    async fn test_promote_due_boundary() {
        let backend = backend().await;
        let now = 1_000_000;
        backend.schedule("later", now + 1_000).await.unwrap();

        let promoted = backend.promote_due(now, 100).await.unwrap();
        assert!(promoted.is_empty());
        assert!(backend.stream_entries().await.is_empty());

        let promoted = backend.promote_due(now + 1_001, 100).await.unwrap();
        assert_eq!(promoted, vec!["later".to_string()]);
        assert_eq!(backend.stream_entries().await, vec!["later".to_string()]);
        assert!(backend.scheduled_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_promote_due_limit_takes_soonest() {
        let backend = backend().await;
        backend.schedule("b", 20).await.unwrap();
        backend.schedule("a", 10).await.unwrap();
        backend.schedule("c", 30).await.unwrap();

        let promoted = backend.promote_due(100, 2).await.unwrap();
        assert_eq!(promoted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(backend.depth().await.unwrap().scheduled, 1);
    }

    #[tokio::test]
    async fn test_ack_and_move() {
        let backend = backend().await;
        let first = backend.stream_append("one").await.unwrap();
        let second = backend.stream_append("two").await.unwrap();

        backend.ack_and_schedule(&first, "one-retry", 42).await.unwrap();
        backend.ack_and_dead_letter(&second, "two-dead").await.unwrap();

        let depth = backend.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { ready: 0, scheduled: 1, dead_letter: 1 });
        assert_eq!(
            backend.scheduled_entries().await,
            vec![("one-retry".to_string(), 42)]
        );
    }

    #[tokio::test]
    async fn test_dead_letter_peek_and_drain() {
        let backend = backend().await;
        for i in 0..3 {
            let id = backend.stream_append("x").await.unwrap();
            backend
                .ack_and_dead_letter(&id, &format!("dead-{i}"))
                .await
                .unwrap();
        }

        assert_eq!(backend.peek_dead_letters(2).await.unwrap(), vec!["dead-0", "dead-1"]);
        assert_eq!(backend.depth().await.unwrap().dead_letter, 3);

        assert_eq!(backend.drain_dead_letters(2).await.unwrap(), vec!["dead-0", "dead-1"]);
        assert_eq!(backend.drain_dead_letters(10).await.unwrap(), vec!["dead-2"]);
        assert!(backend.peek_dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_trimmed() {
        let backend = InMemoryBackend::with_config(QueueConfig::default().with_max_stream_length(2));
        backend.ensure_group().await.unwrap();
        for i in 0..4 {
            backend.stream_append(&format!("job-{i}")).await.unwrap();
        }
        assert_eq!(backend.stream_entries().await, vec!["job-2", "job-3"]);
    }

    #[tokio::test]
    async fn test_keys_with_ttl() {
        let backend = backend().await;
        assert!(backend.set_if_absent("k", "job-1", 30).await.unwrap());
        assert!(!backend.set_if_absent("k", "job-2", 30).await.unwrap());
        assert_eq!(backend.get_key("k").await.unwrap().as_deref(), Some("job-1"));

        assert!(!backend.refresh_key("k", "job-2", 30).await.unwrap());
        assert!(backend.refresh_key("k", "job-1", 30).await.unwrap());

        assert!(!backend.release_key("k", "job-2").await.unwrap());
        assert!(backend.release_key("k", "job-1").await.unwrap());
        assert_eq!(backend.get_key("k").await.unwrap(), None);

        assert!(backend.set_if_absent("short", "job-3", 10).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.get_key("short").await.unwrap(), None);
        assert!(backend.set_if_absent("short", "job-4", 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let backend = backend().await;
        backend.set_offline(true);
        assert!(backend.stream_append("x").await.unwrap_err().is_store_unavailable());
        assert!(backend.health_check().await.is_err());

        backend.set_offline(false);
        assert!(backend.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_failing_writes_keep_claims_working() {
        let backend = backend().await;
        backend.set_writes_failing(true);
        assert!(backend.stream_append("x").await.unwrap_err().is_store_unavailable());
        assert!(backend.schedule("x", 1).await.is_err());
        assert!(backend.set_if_absent("k", "owner", 1_000).await.unwrap());

        backend.set_writes_failing(false);
        assert!(backend.stream_append("x").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_claims_are_pruned() {
        let backend = backend().await;
        assert!(backend.set_if_absent("stale-1", "a", 10).await.unwrap());
        assert!(backend.set_if_absent("stale-2", "b", 10).await.unwrap());
        assert!(backend.set_if_absent("live", "c", 60_000).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Claiming an unrelated key sweeps the expired ones
        assert!(backend.set_if_absent("fresh", "d", 60_000).await.unwrap());
        let keys = backend.state.lock().await.keys.len();
        assert_eq!(keys, 2);

        assert!(backend.set_if_absent("gone", "e", 10).await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        backend.depth().await.unwrap();
        assert_eq!(backend.state.lock().await.keys.len(), 2);
    }

    #[tokio::test]
    async fn test_purge() {
        let backend = backend().await;
        backend.stream_append("a").await.unwrap();
        backend.schedule("b", 10).await.unwrap();

        assert_eq!(backend.purge().await.unwrap(), 2);
        assert_eq!(backend.depth().await.unwrap(), QueueDepth::default());
    }
}
