//! Enqueue path: validate, build, claim, write. Falls back to direct delivery
//! when there is no queue or the store cannot be reached.

use super::{CourierInner, QueueParts};
use crate::audit::AuditEvent;
use crate::error::CourierResult;
use crate::job::{DEFAULT_PURPOSE, EmailPayload, EnqueueOptions, EnqueueReason, EnqueueResult, Job};
use crate::utils::{log_and_ignore, now_millis};
use tracing::{debug, error, info, warn};

impl CourierInner {
    pub(crate) async fn enqueue(&self, payload: EmailPayload, options: EnqueueOptions) -> EnqueueResult {
        let invalid = payload.validate().err().or_else(|| {
            (options.max_attempts == Some(0)).then(|| "max attempts must be greater than 0".to_string())
        });
        if let Some(message) = invalid {
            let purpose = options.purpose.as_deref().unwrap_or(DEFAULT_PURPOSE);
            debug!(purpose, reason = %message, "Rejected invalid enqueue");
            let result = EnqueueResult::invalid(message);
            log_and_ignore("metrics", self.metrics.record_queued(result.outcome(), purpose));
            return result;
        }

        let job = Job::build(payload, options, self.job_defaults(), now_millis());
        self.submit(job).await
    }

    /// Put an already built job into the queue, or deliver it directly when
    /// the queue is unavailable.
    pub(crate) async fn submit(&self, job: Job) -> EnqueueResult {
        let purpose = job.purpose_label().to_string();

        let result = match &self.queue {
            None => {
                self.deliver_directly(job, EnqueueReason::TransportUnconfigured)
                    .await
            }
            Some(queue) => match self.write(queue, &job).await {
                Ok(result) => result,
                Err(e) => {
                    if e.is_store_unavailable() {
                        warn!(job_id = %job.id, error = %e, "Queue store unavailable, delivering directly (degraded mode)");
                    } else {
                        error!(job_id = %job.id, error = %e, "Failed to enqueue job, delivering directly");
                    }
                    self.deliver_directly(job, EnqueueReason::StoreUnavailable)
                        .await
                }
            },
        };

        log_and_ignore("metrics", self.metrics.record_queued(result.outcome(), &purpose));
        if result.delivered.is_none() {
            self.sample_depth().await;
        }
        result
    }

    async fn write(&self, queue: &QueueParts, job: &Job) -> CourierResult<EnqueueResult> {
        let claim = queue.dedup.acquire(job).await?;
        if !claim.acquired {
            info!(
                job_id = %job.id,
                existing = ?claim.existing_job_id,
                purpose = job.purpose_label(),
                "Suppressed duplicate enqueue"
            );
            return Ok(EnqueueResult::duplicate(claim.existing_job_id));
        }

        let raw = job.to_json()?;
        let now = now_millis();
        let written = match job.available_after.filter(|at| *at > now) {
            Some(due) => queue
                .backend
                .schedule(&raw, due)
                .await
                .map(|()| (EnqueueResult::scheduled(job.id.clone(), due), AuditEvent::Scheduled)),
            None => queue
                .backend
                .stream_append(&raw)
                .await
                .map(|_| (EnqueueResult::queued(job.id.clone()), AuditEvent::Queued)),
        };

        match written {
            Ok((result, event)) => {
                debug!(job_id = %job.id, outcome = result.outcome(), "Job enqueued");
                self.audit(job, event).await;
                Ok(result)
            }
            Err(e) => {
                queue.dedup.release(job).await;
                Err(e)
            }
        }
    }

    async fn deliver_directly(&self, job: Job, reason: EnqueueReason) -> EnqueueResult {
        let delivered = match self.transport.deliver(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, transport = self.transport.name(), "Delivered directly");
                true
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, kind = e.kind(), "Direct delivery failed");
                false
            }
        };

        self.audit(&job, AuditEvent::Fallback { delivered }).await;
        EnqueueResult::fallback(job.id, delivered, reason)
    }
}
