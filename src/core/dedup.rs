//! Dedup claims.
//!
//! A claim is a key `prefix:fingerprint` whose value is the owning job id.
//! It is taken once at enqueue, refreshed every time the job is written back to
//! the stream or the scheduled set, and released when the job is delivered or
//! dead-lettered.

use crate::config::DedupeConfig;
use crate::error::CourierResult;
use crate::job::{Job, JobId};
use crate::queue::QueueBackend;
use crate::utils::now_millis;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of [`DedupLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupClaim {
    pub acquired: bool,
    /// Owner of the live claim when `acquired` is false
    pub existing_job_id: Option<JobId>,
}

impl DedupClaim {
    fn acquired() -> Self {
        Self {
            acquired: true,
            existing_job_id: None,
        }
    }
}

/// Dedup claim manager on top of a backend's TTL keys.
#[derive(Clone)]
pub struct DedupLock {
    backend: Arc<dyn QueueBackend>,
    config: DedupeConfig,
}

impl DedupLock {
    pub fn new(backend: Arc<dyn QueueBackend>, config: DedupeConfig) -> Self {
        Self { backend, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Claim key for a job, `None` when the job carries no fingerprint or
    /// dedup is off.
    pub fn key_for(&self, job: &Job) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        job.dedupe_key
            .as_deref()
            .map(|fingerprint| format!("{}:{}", self.config.prefix, fingerprint))
    }

    /// Claim lifetime: long enough to outlive the job's next appearance.
    pub fn ttl_ms(&self, job: &Job, now_ms: u64) -> u64 {
        let base = if job.dedupe_ttl_ms > 0 {
            job.dedupe_ttl_ms
        } else {
            self.config.ttl_ms
        };
        let until_due = job
            .available_after
            .map(|at| at.saturating_sub(now_ms).saturating_add(self.config.grace_ms))
            .unwrap_or(0);
        let delayed = job.delay_ms.saturating_add(self.config.grace_ms);

        base.max(until_due).max(delayed).max(1)
    }

    /// Take the claim for `job`. A claim already owned by the same job id
    /// counts as acquired, so replays of an enqueue are idempotent.
    pub async fn acquire(&self, job: &Job) -> CourierResult<DedupClaim> {
        let Some(key) = self.key_for(job) else {
            return Ok(DedupClaim::acquired());
        };

        let ttl = self.ttl_ms(job, now_millis());
        if self.backend.set_if_absent(&key, &job.id, ttl).await? {
            debug!(job_id = %job.id, key = %key, ttl_ms = ttl, "Dedup claim acquired");
            return Ok(DedupClaim::acquired());
        }

        let existing = self.backend.get_key(&key).await?;
        if existing.as_deref() == Some(job.id.as_str()) {
            return Ok(DedupClaim::acquired());
        }

        // The claim expired between the two calls
        if existing.is_none() && self.backend.set_if_absent(&key, &job.id, ttl).await? {
            return Ok(DedupClaim::acquired());
        }

        Ok(DedupClaim {
            acquired: false,
            existing_job_id: existing,
        })
    }

    /// Extend the claim to cover the job's next due time. Returns `false`
    /// when another job now owns the fingerprint.
    pub async fn refresh(&self, job: &Job) -> CourierResult<bool> {
        let Some(key) = self.key_for(job) else {
            return Ok(true);
        };

        let refreshed = self
            .backend
            .refresh_key(&key, &job.id, self.ttl_ms(job, now_millis()))
            .await?;
        if !refreshed {
            warn!(job_id = %job.id, key = %key, "Dedup claim is held by another job");
        }
        Ok(refreshed)
    }

    /// Drop the claim. Failures are logged; the TTL cleans up eventually.
    pub async fn release(&self, job: &Job) {
        let Some(key) = self.key_for(job) else {
            return;
        };

        match self.backend.release_key(&key, &job.id).await {
            Ok(true) => debug!(job_id = %job.id, key = %key, "Dedup claim released"),
            Ok(false) => debug!(job_id = %job.id, key = %key, "Dedup claim was not ours"),
            Err(e) => warn!(job_id = %job.id, key = %key, error = %e, "Failed to release dedup claim"),
        }
    }
}
