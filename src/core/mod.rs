//! The courier: producer, worker pool and dead letter tooling around one
//! coordination store.
//!
//! [`Courier`] is constructed once per process and shared by reference. It
//! owns the backend handle, the dedup lock and the injected collaborators, and
//! starts or stops the worker pool on request.

use crate::audit::{AuditEvent, JobAuditLog, NoopAuditLog};
use crate::config::CourierConfig;
use crate::error::{CourierError, CourierResult};
use crate::job::{EmailPayload, EnqueueOptions, EnqueueResult, Job, JobDefaults};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::queue::{InMemoryBackend, QueueBackend, QueueDepth, StreamRecord};
use crate::transport::Transport;
use crate::utils::log_and_ignore;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod dedup;
pub mod engine;
mod producer;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dedup::{DedupClaim, DedupLock};
pub use worker::{RecordOutcome, WorkerStats};

use engine::{Shutdown, WorkerPool};
use worker::StatsCounters;

/// Backend plus the dedup lock built on it.
pub(crate) struct QueueParts {
    pub(crate) backend: Arc<dyn QueueBackend>,
    pub(crate) dedup: DedupLock,
}

/// State shared by the producer, the workers and the sampler.
pub(crate) struct CourierInner {
    pub(crate) config: CourierConfig,
    /// `None` runs in direct-delivery mode
    pub(crate) queue: Option<QueueParts>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) audit: Arc<dyn JobAuditLog>,
    pub(crate) stats: StatsCounters,
}

impl CourierInner {
    pub(crate) fn queue(&self) -> CourierResult<&QueueParts> {
        self.queue
            .as_ref()
            .ok_or_else(|| CourierError::config("No queue backend configured"))
    }

    pub(crate) fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            max_attempts: self.config.retry.max_attempts,
            dedupe_ttl_ms: self.config.dedupe.ttl_ms,
            dedupe_enabled: self.config.dedupe.enabled,
        }
    }

    pub(crate) async fn audit(&self, job: &Job, event: AuditEvent) {
        log_and_ignore("audit", self.audit.record(job, event).await);
    }

    /// Read queue depth and hand it to the metrics sink.
    pub(crate) async fn sample_depth(&self) -> Option<QueueDepth> {
        let queue = self.queue.as_ref()?;
        let depth = log_and_ignore("queue depth", queue.backend.depth().await)?;
        log_and_ignore("metrics", self.metrics.record_depth(&depth));
        Some(depth)
    }
}

/// Builder for [`Courier`].
pub struct CourierBuilder {
    config: CourierConfig,
    transport: Arc<dyn Transport>,
    backend: Option<Arc<dyn QueueBackend>>,
    metrics: Arc<dyn MetricsSink>,
    audit: Arc<dyn JobAuditLog>,
}

impl CourierBuilder {
    /// Use the given coordination store.
    pub fn backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a fresh in-memory store built from the queue configuration.
    pub fn in_memory(self) -> Self {
        let backend = Arc::new(InMemoryBackend::with_config(self.config.queue.clone()));
        self.backend(backend)
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn JobAuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Validate the configuration and build the courier.
    pub fn build(self) -> CourierResult<Courier> {
        self.config
            .validate()
            .map_err(|errors| CourierError::config(errors.join("; ")))?;

        let queue = self.backend.map(|backend| QueueParts {
            dedup: DedupLock::new(Arc::clone(&backend), self.config.dedupe.clone()),
            backend,
        });
        if queue.is_none() {
            warn!("No queue backend configured, messages will be delivered directly");
        }

        Ok(Courier {
            inner: Arc::new(CourierInner {
                config: self.config,
                queue,
                transport: self.transport,
                metrics: self.metrics,
                audit: self.audit,
                stats: StatsCounters::default(),
            }),
            pool: RwLock::new(None),
        })
    }
}

/// The email delivery queue.
///
/// # Examples
///
/// ```rust
/// use courierq::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> CourierResult<()> {
///     let courier = Courier::builder(CourierConfig::testing(), Arc::new(LogTransport))
///         .in_memory()
///         .build()?;
///
///     let result = courier
///         .enqueue(
///             EmailPayload::new("a@example.com", "Welcome").with_text("Hello!"),
///             EnqueueOptions::purpose("verification"),
///         )
///         .await;
///     assert!(result.accepted);
///
///     courier.start_workers(2).await?;
///     courier.stop_workers().await?;
///     Ok(())
/// }
/// ```
pub struct Courier {
    inner: Arc<CourierInner>,
    pool: RwLock<Option<WorkerPool>>,
}

impl Courier {
    /// Start building a courier around a transport.
    pub fn builder(config: CourierConfig, transport: Arc<dyn Transport>) -> CourierBuilder {
        CourierBuilder {
            config,
            transport,
            backend: None,
            metrics: Arc::new(NoopMetrics),
            audit: Arc::new(NoopAuditLog),
        }
    }

    /// Build a courier from configuration alone: Redis when a URL is set,
    /// direct delivery otherwise.
    pub async fn connect(config: CourierConfig, transport: Arc<dyn Transport>) -> CourierResult<Self> {
        let builder = Self::builder(config.clone(), transport);

        match config.queue.redis_url {
            #[cfg(feature = "redis-queue")]
            Some(_) => {
                let backend = crate::queue::RedisBackend::connect(config.queue.clone()).await?;
                builder.backend(Arc::new(backend)).build()
            }
            #[cfg(not(feature = "redis-queue"))]
            Some(_) => Err(CourierError::config(
                "A Redis URL is configured but the redis-queue feature is disabled",
            )),
            None => builder.build(),
        }
    }

    /// Queue a message.
    ///
    /// Never fails: problems are reported through the result, and the message
    /// is delivered directly when the queue cannot take it.
    pub async fn enqueue(&self, payload: EmailPayload, options: EnqueueOptions) -> EnqueueResult {
        self.inner.enqueue(payload, options).await
    }

    /// Start `concurrency` workers.
    ///
    /// Returns immediately; errors creating the consumer group propagate.
    pub async fn start_workers(&self, concurrency: usize) -> CourierResult<()> {
        let mut pool = self.pool.write().await;
        if pool.is_some() {
            return Err(CourierError::AlreadyRunning);
        }

        *pool = Some(WorkerPool::start(Arc::clone(&self.inner), concurrency).await?);
        Ok(())
    }

    /// Start workers with the configured concurrency.
    pub async fn start(&self) -> CourierResult<()> {
        self.start_workers(self.inner.config.workers.concurrency)
            .await
    }

    /// Stop the workers, letting in-flight deliveries finish.
    pub async fn stop_workers(&self) -> CourierResult<()> {
        let pool = self.pool.write().await.take();
        match pool {
            Some(pool) => pool.shutdown().await,
            None => Err(CourierError::NotRunning),
        }
    }

    /// Check if the workers are currently running.
    pub async fn is_running(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Wait for Ctrl+C, then stop the workers.
    pub async fn wait_for_shutdown(&self) -> CourierResult<()> {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C, stopping now");
        } else {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }

        match self.stop_workers().await {
            Err(CourierError::NotRunning) => Ok(()),
            other => other,
        }
    }

    /// Move up to `limit` due jobs from the scheduled set to the stream.
    pub async fn promote_due(&self, limit: usize) -> CourierResult<usize> {
        let queue = self.inner.queue()?;
        self.inner.promote_due(queue, limit).await
    }

    /// Claim and process entries abandoned by other consumers, acting as
    /// `consumer`. Returns how many entries were processed.
    pub async fn reclaim_stale(&self, consumer: &str) -> CourierResult<usize> {
        let queue = self.inner.queue()?;
        self.inner
            .reclaim_stale(queue, consumer, &Shutdown::default())
            .await
    }

    /// Process one stream record: deliver, retry or dead-letter it.
    pub async fn process_record(&self, record: StreamRecord) -> CourierResult<RecordOutcome> {
        let queue = self.inner.queue()?;
        self.inner.process_record(queue, record).await
    }

    /// Oldest dead letters, left in place. Unreadable entries are skipped.
    pub async fn peek_dead_letters(&self, limit: usize) -> CourierResult<Vec<Job>> {
        let raw = self.inner.queue()?.backend.peek_dead_letters(limit).await?;
        Ok(parse_dead_letters(raw))
    }

    /// Oldest dead letters, removed from the store. Unreadable entries are
    /// removed too.
    pub async fn drain_dead_letters(&self, limit: usize) -> CourierResult<Vec<Job>> {
        let raw = self.inner.queue()?.backend.drain_dead_letters(limit).await?;
        Ok(parse_dead_letters(raw))
    }

    /// Enqueue a dead job again under a new id with a fresh retry budget.
    pub async fn replay_dead_letter(&self, mut job: Job) -> EnqueueResult {
        let previous = job.id.clone();
        job.reset_for_replay(uuid::Uuid::new_v4().to_string());
        job.queued_at = crate::utils::now_millis();
        info!(previous = %previous, job_id = %job.id, "Replaying dead letter");
        self.inner.submit(job).await
    }

    /// Current queue depth; also reported to the metrics sink.
    pub async fn depth(&self) -> CourierResult<QueueDepth> {
        let depth = self.inner.queue()?.backend.depth().await?;
        log_and_ignore("metrics", self.inner.metrics.record_depth(&depth));
        Ok(depth)
    }

    /// Remove every queued, scheduled and dead job. Refused while workers run.
    pub async fn purge(&self) -> CourierResult<u64> {
        if self.is_running().await {
            return Err(CourierError::AlreadyRunning);
        }
        let removed = self.inner.queue()?.backend.purge().await?;
        warn!(removed, "Queue purged");
        Ok(removed)
    }

    /// The dedup lock, when a backend is configured.
    pub fn dedup(&self) -> Option<&DedupLock> {
        self.inner.queue.as_ref().map(|queue| &queue.dedup)
    }

    /// Get worker statistics.
    pub fn worker_stats(&self) -> WorkerStats {
        self.inner.stats.snapshot()
    }

    /// Perform a health check on the store and, if running, the workers.
    pub async fn health_check(&self) -> CourierResult<()> {
        if let Some(queue) = &self.inner.queue {
            queue.backend.health_check().await?;
        }

        if let Some(pool) = self.pool.read().await.as_ref() {
            pool.health_check()?;
        }
        Ok(())
    }

    /// Get the configuration used by this courier.
    pub fn config(&self) -> &CourierConfig {
        &self.inner.config
    }
}

fn parse_dead_letters(raw: Vec<String>) -> Vec<Job> {
    raw.into_iter()
        .filter_map(|entry| match Job::from_json(&entry) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable dead letter");
                None
            }
        })
        .collect()
}
