//! Worker loop and per-record processing.
//!
//! Each worker is one consumer in the group. An iteration promotes due
//! scheduled jobs, reads a batch of new entries, and falls back to reclaiming
//! stale entries from crashed consumers when nothing new arrived.

use super::engine::Shutdown;
use super::{CourierInner, QueueParts};
use crate::audit::AuditEvent;
use crate::error::{CourierResult, TransportError};
use crate::job::{Job, LastError};
use crate::queue::{CURSOR_START, StreamRecord};
use crate::utils::{log_and_ignore, now_millis};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Transport accepted the message
    Delivered,
    /// Delivery failed; the job is back in the scheduled set
    Retried,
    /// Delivery failed for the last time; the job is in the dead letter store
    DeadLettered,
    /// The job was not due yet and went back to the scheduled set
    Rescheduled,
    /// The record was unreadable and was discarded
    Dropped,
}

/// Statistics about worker performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Number of worker loops currently running
    pub active_workers: usize,
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub rescheduled: u64,
    pub dropped: u64,
    /// Records recovered from other consumers
    pub reclaimed: u64,
    /// Loop iterations or records that failed on a store error
    pub errors: u64,
    /// Worker tasks restarted after a panic
    pub worker_restarts: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) active_workers: AtomicUsize,
    delivered: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    rescheduled: AtomicU64,
    dropped: AtomicU64,
    reclaimed: AtomicU64,
    errors: AtomicU64,
    pub(crate) worker_restarts: AtomicU64,
}

impl StatsCounters {
    fn record(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Delivered => &self.delivered,
            RecordOutcome::Retried => &self.retried,
            RecordOutcome::DeadLettered => &self.dead_lettered,
            RecordOutcome::Rescheduled => &self.rescheduled,
            RecordOutcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Individual worker that processes records as one consumer of the group
#[derive(Clone)]
pub(crate) struct Worker {
    id: usize,
    consumer: String,
    inner: Arc<CourierInner>,
    shutdown: Arc<Shutdown>,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        consumer: String,
        inner: Arc<CourierInner>,
        shutdown: Arc<Shutdown>,
    ) -> Self {
        Self {
            id,
            consumer,
            inner,
            shutdown,
        }
    }

    pub(crate) fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Run until shutdown. Store errors never end the loop.
    pub(crate) async fn run(self) {
        let Ok(queue) = self.inner.queue() else {
            error!(worker = self.id, "Worker started without a queue backend");
            return;
        };

        info!(worker = self.id, consumer = %self.consumer, "Worker started");
        let _active = ActiveGuard::new(&self.inner.stats.active_workers);
        let error_backoff = Duration::from_millis(self.inner.config.workers.error_backoff_ms);

        while !self.shutdown.is_triggered() {
            if let Err(e) = self.iteration(queue).await {
                self.inner.stats.error();
                error!(worker = self.id, consumer = %self.consumer, error = %e, "Worker iteration failed");
                self.shutdown.sleep(error_backoff).await;
            }
        }

        info!(worker = self.id, consumer = %self.consumer, "Worker stopped");
    }

    async fn iteration(&self, queue: &QueueParts) -> CourierResult<()> {
        let workers = &self.inner.config.workers;

        self.inner
            .promote_due(queue, workers.schedule_drain_limit)
            .await?;

        let records = queue
            .backend
            .read_group(
                &self.consumer,
                workers.batch_size,
                Duration::from_millis(workers.block_ms),
            )
            .await?;

        if records.is_empty() {
            self.inner
                .reclaim_stale(queue, &self.consumer, &self.shutdown)
                .await?;
            return Ok(());
        }

        for record in records {
            // Unprocessed records stay pending and are reclaimed later
            if self.shutdown.is_triggered() {
                break;
            }
            self.inner.process_logged(queue, record).await;
        }
        Ok(())
    }
}

/// Keeps the active worker count accurate even if the loop panics.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl CourierInner {
    /// Move due jobs from the scheduled set to the stream and refresh their
    /// dedup claims.
    pub(crate) async fn promote_due(&self, queue: &QueueParts, limit: usize) -> CourierResult<usize> {
        let moved = queue.backend.promote_due(now_millis(), limit).await?;

        for raw in &moved {
            match Job::from_json(raw) {
                Ok(job) => {
                    log_and_ignore("refresh dedup claim", queue.dedup.refresh(&job).await);
                }
                Err(e) => warn!(error = %e, "Promoted a malformed job"),
            }
        }

        if !moved.is_empty() {
            debug!(count = moved.len(), "Promoted due jobs");
        }
        Ok(moved.len())
    }

    /// Claim entries other consumers left unacknowledged past the visibility
    /// timeout and process them as if freshly read.
    pub(crate) async fn reclaim_stale(
        &self,
        queue: &QueueParts,
        consumer: &str,
        shutdown: &Shutdown,
    ) -> CourierResult<usize> {
        let min_idle = self.config.queue.visibility_timeout();
        let count = self.config.workers.batch_size;
        let mut cursor = CURSOR_START.to_string();
        let mut processed = 0;

        loop {
            let batch = queue
                .backend
                .claim_stale(consumer, min_idle, &cursor, count)
                .await?;

            let last = batch.is_last();
            for record in batch.records {
                if shutdown.is_triggered() {
                    break;
                }
                info!(consumer, entry_id = %record.id, "Reclaimed stale entry");
                self.stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                self.process_logged(queue, record).await;
                processed += 1;
            }

            if last || shutdown.is_triggered() {
                break;
            }
            cursor = batch.next_cursor;
        }

        Ok(processed)
    }

    /// Process a record, logging store errors. The entry stays pending on
    /// error and is picked up again by recovery.
    pub(crate) async fn process_logged(&self, queue: &QueueParts, record: StreamRecord) {
        let entry_id = record.id.clone();
        match self.process_record(queue, record).await {
            Ok(outcome) => self.stats.record(outcome),
            Err(e) => {
                self.stats.error();
                error!(entry_id = %entry_id, error = %e, "Failed to process record");
            }
        }
    }

    pub(crate) async fn process_record(
        &self,
        queue: &QueueParts,
        record: StreamRecord,
    ) -> CourierResult<RecordOutcome> {
        let parsed = match record.payload.as_deref() {
            Some(raw) => Job::from_json(raw).map_err(|e| e.to_string()),
            None => Err("entry has no job field".to_string()),
        };
        let mut job = match parsed {
            Ok(job) => job,
            Err(reason) => {
                error!(entry_id = %record.id, reason = %reason, "Dropping malformed record");
                queue.backend.ack(&record.id).await?;
                return Ok(RecordOutcome::Dropped);
            }
        };

        let now = now_millis();
        if let Some(due) = job.available_after.filter(|_| !job.is_due(now)) {
            job.queued_at = now;
            queue
                .backend
                .ack_and_schedule(&record.id, &job.to_json()?, due)
                .await?;
            log_and_ignore("refresh dedup claim", queue.dedup.refresh(&job).await);
            debug!(job_id = %job.id, due, "Job not due yet, rescheduled");
            return Ok(RecordOutcome::Rescheduled);
        }

        match self.transport.deliver(&job).await {
            Ok(()) => {
                queue.backend.ack(&record.id).await?;
                queue.dedup.release(&job).await;
                log_and_ignore("metrics", self.metrics.record_delivered(job.purpose_label()));
                self.audit(&job, AuditEvent::Delivered).await;
                info!(
                    job_id = %job.id,
                    purpose = job.purpose_label(),
                    attempt = job.attempt + 1,
                    "Delivered job"
                );
                Ok(RecordOutcome::Delivered)
            }
            Err(e) => self.handle_failure(queue, &record.id, job, e).await,
        }
    }

    async fn handle_failure(
        &self,
        queue: &QueueParts,
        entry_id: &str,
        mut job: Job,
        error: TransportError,
    ) -> CourierResult<RecordOutcome> {
        job.attempt += 1;
        let now = now_millis();

        if job.is_exhausted() {
            job.failed_at = Some(now);
            job.last_error = Some(LastError {
                message: error.to_string(),
                stack: Some(format!("{}: {error:?}", error.kind())),
            });

            queue
                .backend
                .ack_and_dead_letter(entry_id, &job.to_json()?)
                .await?;
            queue.dedup.release(&job).await;
            log_and_ignore("metrics", self.metrics.record_failure(job.purpose_label()));
            self.audit(&job, AuditEvent::DeadLettered).await;
            error!(
                job_id = %job.id,
                purpose = job.purpose_label(),
                attempts = job.attempt,
                error = %error,
                "Job exhausted its retries, moved to dead letter store"
            );
            return Ok(RecordOutcome::DeadLettered);
        }

        let delay_ms = self.config.retry.delay_for(job.attempt).as_millis() as u64;
        let due = now.saturating_add(delay_ms);
        job.available_after = Some(due);
        job.delay_ms = delay_ms;
        job.queued_at = now;

        queue
            .backend
            .ack_and_schedule(entry_id, &job.to_json()?, due)
            .await?;
        log_and_ignore("refresh dedup claim", queue.dedup.refresh(&job).await);
        log_and_ignore("metrics", self.metrics.record_retry(job.purpose_label()));
        self.audit(&job, AuditEvent::Retried { delay_ms }).await;
        warn!(
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            delay_ms,
            kind = error.kind(),
            error = %error,
            "Delivery failed, retrying"
        );
        Ok(RecordOutcome::Retried)
    }
}
