//! Per-job audit trail.
//!
//! Applications that persist a job log (for support tooling, say) plug in a
//! [`JobAuditLog`]. Failures are logged and never affect delivery.

use crate::error::CourierResult;
use crate::job::Job;
use async_trait::async_trait;

/// Lifecycle event recorded for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    /// Written to the stream
    Queued,
    /// Written to the scheduled set
    Scheduled,
    /// Transport accepted the message
    Delivered,
    /// Delivery failed and the job was rescheduled
    Retried { delay_ms: u64 },
    /// Retry budget exhausted
    DeadLettered,
    /// Sent synchronously because the queue was unavailable
    Fallback { delivered: bool },
}

impl AuditEvent {
    /// Short status label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Delivered => "delivered",
            Self::Retried { .. } => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::Fallback { .. } => "fallback",
        }
    }
}

/// Sink for job lifecycle events.
#[async_trait]
pub trait JobAuditLog: Send + Sync {
    async fn record(&self, job: &Job, event: AuditEvent) -> CourierResult<()>;
}

/// Audit log that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditLog;

#[async_trait]
impl JobAuditLog for NoopAuditLog {
    async fn record(&self, _job: &Job, _event: AuditEvent) -> CourierResult<()> {
        Ok(())
    }
}
