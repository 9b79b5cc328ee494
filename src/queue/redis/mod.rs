//! Redis backend for courierq.
//!
//! Layout:
//! - **Stream** (`XADD MAXLEN ~`, `XREADGROUP`, `XACK` + `XDEL`, `XAUTOCLAIM`)
//! - **Scheduled set**: sorted set scored by due time (epoch ms)
//! - **Dead letter store**: a second stream, never consumed automatically
//! - **Dedup claims**: plain keys written with `SET NX PX`
//!
//! Multi-key changes go through `MULTI`/`EXEC` pipelines or Lua scripts so
//! concurrent workers in different processes never observe half-applied moves.

use super::{ClaimBatch, JOB_FIELD, QueueBackend, QueueDepth, StreamRecord};
use crate::config::QueueConfig;
use crate::error::{CourierError, CourierResult};
use async_trait::async_trait;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisResult, Script};

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Redis backend implementation
pub struct RedisBackend {
    client: Client,
    /// Shared connection for non-blocking commands
    conn: ConnectionManager,
    /// One connection per consumer for `XREADGROUP BLOCK`, which would stall
    /// every other command queued on a shared connection
    blocking: Mutex<HashMap<String, MultiplexedConnection>>,
    config: QueueConfig,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .field("scripts", &self.scripts)
            .finish_non_exhaustive()
    }
}

/// Pre-compiled Lua scripts for atomic Redis operations
#[derive(Debug)]
struct RedisScripts {
    /// Move due scheduled jobs into the stream
    promote_due: Script,
    /// Extend a claim owned by the caller
    refresh_claim: Script,
    /// Compare-and-delete a claim
    release_claim: Script,
    /// Remove and return dead letters
    drain_dead: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            promote_due: Script::new(include_str!("scripts/promote_due.lua")),
            refresh_claim: Script::new(include_str!("scripts/refresh_claim.lua")),
            release_claim: Script::new(include_str!("scripts/release_claim.lua")),
            drain_dead: Script::new(include_str!("scripts/drain_dead.lua")),
        }
    }
}

fn record_from(entry: StreamId) -> StreamRecord {
    let payload = entry.get::<String>(JOB_FIELD);
    StreamRecord {
        id: entry.id,
        payload,
    }
}

impl RedisBackend {
    /// Connect to Redis using the connection string in the queue configuration.
    pub async fn connect(config: QueueConfig) -> CourierResult<Self> {
        let url = config
            .redis_url
            .clone()
            .ok_or_else(|| CourierError::config("Redis URL not set in queue config"))?;
        Self::new(&url, config).await
    }

    /// Create a new Redis backend with the given connection string and configuration
    pub async fn new(connection_string: &str, config: QueueConfig) -> CourierResult<Self> {
        let client = Client::open(connection_string)
            .map_err(|e| CourierError::store(format!("Failed to create Redis client: {e}"), e))?;

        let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
            .await
            .map_err(|e| CourierError::store("Timed out connecting to Redis", e))?
            .map_err(|e| {
                CourierError::store(format!("Failed to create Redis connection manager: {e}"), e)
            })?;

        info!(stream = %config.stream, group = %config.group, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(HashMap::new()),
            config,
            scripts: RedisScripts::new(),
        })
    }

    async fn blocking_conn(&self, consumer: &str) -> CourierResult<MultiplexedConnection> {
        let mut conns = self.blocking.lock().await;
        if let Some(conn) = conns.get(consumer) {
            return Ok(conn.clone());
        }

        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CourierError::store("Failed to open blocking Redis connection", e))?;
        conns.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    async fn forget_blocking_conn(&self, consumer: &str) {
        self.blocking.lock().await.remove(consumer);
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    async fn ensure_group(&self) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        let created: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;

        match created {
            Ok(()) => {
                info!(group = %self.config.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(CourierError::store(
                format!("Failed to create consumer group {}", self.config.group),
                e,
            )),
        }
    }

    async fn stream_append(&self, payload: &str) -> CourierResult<String> {
        let mut conn = self.conn.clone();

        let id: String = conn
            .xadd_maxlen(
                &self.config.stream,
                StreamMaxlen::Approx(self.config.max_stream_length),
                "*",
                &[(JOB_FIELD, payload)],
            )
            .await?;

        Ok(id)
    }

    async fn read_group(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CourierResult<Vec<StreamRecord>> {
        let mut conn = self.blocking_conn(consumer).await?;

        let options = StreamReadOptions::default()
            .group(&self.config.group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: RedisResult<Option<StreamReadReply>> = conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                // The connection may be dead; open a fresh one next time
                self.forget_blocking_conn(consumer).await;
                return Err(CourierError::store("Failed to read from consumer group", e));
            }
        };

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(record_from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, entry_id: &str) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .ignore()
            .xdel(&self.config.stream, &[entry_id])
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CourierError::store(format!("Failed to ack entry {entry_id}"), e))
    }

    async fn ack_and_schedule(
        &self,
        entry_id: &str,
        payload: &str,
        due_ms: u64,
    ) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .ignore()
            .xdel(&self.config.stream, &[entry_id])
            .ignore()
            .zadd(&self.config.scheduled_key, payload, due_ms)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| CourierError::store(format!("Failed to reschedule entry {entry_id}"), e))
    }

    async fn ack_and_dead_letter(&self, entry_id: &str, payload: &str) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .xack(&self.config.stream, &self.config.group, &[entry_id])
            .ignore()
            .xdel(&self.config.stream, &[entry_id])
            .ignore()
            .xadd(&self.config.dead_letter_key, "*", &[(JOB_FIELD, payload)])
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| {
                CourierError::store(format!("Failed to dead-letter entry {entry_id}"), e)
            })
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        cursor: &str,
        count: usize,
    ) -> CourierResult<ClaimBatch> {
        let mut conn = self.conn.clone();

        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.config.stream,
                &self.config.group,
                consumer,
                min_idle.as_millis() as u64,
                cursor,
                StreamAutoClaimOptions::default().count(count),
            )
            .await
            .map_err(|e| CourierError::store("Failed to claim stale entries", e))?;

        if !reply.deleted_ids.is_empty() {
            debug!(
                deleted = reply.deleted_ids.len(),
                "Pending entries were trimmed before they could be claimed"
            );
        }

        Ok(ClaimBatch {
            next_cursor: reply.next_stream_id,
            records: reply.claimed.into_iter().map(record_from).collect(),
        })
    }

    async fn schedule(&self, payload: &str, due_ms: u64) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        conn.zadd::<_, _, _, ()>(&self.config.scheduled_key, payload, due_ms)
            .await
            .map_err(|e| CourierError::store("Failed to add to scheduled set", e))
    }

    async fn promote_due(&self, now_ms: u64, limit: usize) -> CourierResult<Vec<String>> {
        let mut conn = self.conn.clone();

        let moved: Vec<String> = self
            .scripts
            .promote_due
            .key(&self.config.scheduled_key)
            .key(&self.config.stream)
            .arg(now_ms)
            .arg(limit)
            .arg(self.config.max_stream_length)
            .arg(JOB_FIELD)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::store("Failed to promote due jobs", e))?;

        if !moved.is_empty() {
            debug!("Promoted {} scheduled jobs to the stream", moved.len());
        }
        Ok(moved)
    }

    async fn peek_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>> {
        let mut conn = self.conn.clone();

        let reply: StreamRangeReply = conn
            .xrange_count(&self.config.dead_letter_key, "-", "+", limit)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .filter_map(|entry| entry.get::<String>(JOB_FIELD))
            .collect())
    }

    async fn drain_dead_letters(&self, limit: usize) -> CourierResult<Vec<String>> {
        let mut conn = self.conn.clone();

        let drained: Vec<String> = self
            .scripts
            .drain_dead
            .key(&self.config.dead_letter_key)
            .arg(limit)
            .arg(JOB_FIELD)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::store("Failed to drain dead letters", e))?;

        if !drained.is_empty() {
            warn!("Drained {} dead letters", drained.len());
        }
        Ok(drained)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl_ms: u64) -> CourierResult<bool> {
        let mut conn = self.conn.clone();

        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| CourierError::store(format!("Failed to claim key {key}"), e))?;

        Ok(set.is_some())
    }

    async fn get_key(&self, key: &str) -> CourierResult<Option<String>> {
        let mut conn = self.conn.clone();

        Ok(conn.get(key).await?)
    }

    async fn refresh_key(&self, key: &str, owner: &str, ttl_ms: u64) -> CourierResult<bool> {
        let mut conn = self.conn.clone();

        let refreshed: i32 = self
            .scripts
            .refresh_claim
            .key(key)
            .arg(owner)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::store(format!("Failed to refresh key {key}"), e))?;

        Ok(refreshed == 1)
    }

    async fn release_key(&self, key: &str, owner: &str) -> CourierResult<bool> {
        let mut conn = self.conn.clone();

        let released: i32 = self
            .scripts
            .release_claim
            .key(key)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::store(format!("Failed to release key {key}"), e))?;

        Ok(released == 1)
    }

    async fn depth(&self) -> CourierResult<QueueDepth> {
        let mut conn = self.conn.clone();

        let (ready, scheduled, dead_letter): (u64, u64, u64) = redis::pipe()
            .xlen(&self.config.stream)
            .zcard(&self.config.scheduled_key)
            .xlen(&self.config.dead_letter_key)
            .query_async(&mut conn)
            .await?;

        Ok(QueueDepth {
            ready,
            scheduled,
            dead_letter,
        })
    }

    async fn health_check(&self) -> CourierResult<()> {
        let mut conn = self.conn.clone();

        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await?;

        if pong != "PONG" {
            return Err(CourierError::store_msg(
                "Redis health check failed: unexpected response",
            ));
        }

        Ok(())
    }

    async fn purge(&self) -> CourierResult<u64> {
        let depth = self.depth().await?;
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .del(&[
                &self.config.stream,
                &self.config.scheduled_key,
                &self.config.dead_letter_key,
            ])
            .query_async::<()>(&mut conn)
            .await?;

        let purged = depth.ready + depth.scheduled + depth.dead_letter;
        warn!("Purged {} jobs from Redis backend", purged);
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CURSOR_START;

    // These tests require a running Redis instance:
    // cargo test --features redis-queue -- --ignored

    async fn backend(prefix: &str) -> RedisBackend {
        let config = QueueConfig {
            stream: format!("{prefix}:stream"),
            group: format!("{prefix}-group"),
            scheduled_key: format!("{prefix}:scheduled"),
            dead_letter_key: format!("{prefix}:dead"),
            ..QueueConfig::redis("redis://localhost:6379")
        };
        let backend = RedisBackend::connect(config)
            .await
            .expect("Failed to connect to Redis");
        let _ = backend.purge().await;
        backend.ensure_group().await.unwrap();
        backend
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_stream_roundtrip() {
        let backend = backend("courierq-test-stream").await;

        // Creating the group twice is fine
        backend.ensure_group().await.unwrap();

        let id = backend.stream_append("{\"id\":\"r1\"}").await.unwrap();
        let records = backend
            .read_group("c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);

        backend.ack(&id).await.unwrap();
        assert_eq!(backend.depth().await.unwrap().ready, 0);

        let _ = backend.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_reclaim_after_idle() {
        let backend = backend("courierq-test-reclaim").await;

        let id = backend.stream_append("job").await.unwrap();
        backend
            .read_group("crashed", 1, Duration::from_millis(100))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let batch = backend
            .claim_stale("rescuer", Duration::from_millis(100), CURSOR_START, 10)
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, id);
        assert!(batch.is_last());

        let _ = backend.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_promote_and_dead_letters() {
        let backend = backend("courierq-test-promote").await;

        backend.schedule("later", 2_000).await.unwrap();
        assert!(backend.promote_due(1_000, 10).await.unwrap().is_empty());
        assert_eq!(backend.promote_due(2_001, 10).await.unwrap(), vec!["later"]);

        let records = backend
            .read_group("c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        backend
            .ack_and_dead_letter(&records[0].id, "buried")
            .await
            .unwrap();

        assert_eq!(backend.peek_dead_letters(10).await.unwrap(), vec!["buried"]);
        assert_eq!(backend.drain_dead_letters(10).await.unwrap(), vec!["buried"]);
        assert_eq!(backend.depth().await.unwrap(), QueueDepth::default());

        let _ = backend.purge().await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_claim_keys() {
        let backend = backend("courierq-test-keys").await;
        let key = "courierq-test-keys:dedupe:abc";
        let _ = backend.release_key(key, "job-1").await;

        assert!(backend.set_if_absent(key, "job-1", 10_000).await.unwrap());
        assert!(!backend.set_if_absent(key, "job-2", 10_000).await.unwrap());
        assert!(!backend.refresh_key(key, "job-2", 10_000).await.unwrap());
        assert!(backend.refresh_key(key, "job-1", 20_000).await.unwrap());
        assert!(backend.release_key(key, "job-1").await.unwrap());
        assert_eq!(backend.get_key(key).await.unwrap(), None);
    }
}
