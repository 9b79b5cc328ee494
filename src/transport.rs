//! The delivery seam: whatever actually hands a message to a mail server.

use crate::error::TransportError;
use crate::job::Job;
use async_trait::async_trait;
use tracing::info;

/// Sends one message.
///
/// Implementations report failures through [`TransportError`]; every error
/// consumes one delivery attempt. A transport must be safe to call from many
/// workers at once.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the job's payload.
    async fn deliver(&self, job: &Job) -> Result<(), TransportError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        "transport"
    }
}

/// Transport that only logs the message. Useful in development.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, job: &Job) -> Result<(), TransportError> {
        info!(
            job_id = %job.id,
            purpose = job.purpose_label(),
            to = ?job.payload.to,
            subject = %job.payload.subject,
            "Delivered message to log"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EmailPayload, EnqueueOptions, JobDefaults};

    #[tokio::test]
    async fn test_log_transport_always_succeeds() {
        let job = Job::build(
            EmailPayload::new("a@x.com", "hello"),
            EnqueueOptions::default(),
            JobDefaults {
                max_attempts: 1,
                dedupe_ttl_ms: 1_000,
                dedupe_enabled: false,
            },
            0,
        );
        assert!(LogTransport.deliver(&job).await.is_ok());
        assert_eq!(LogTransport.name(), "log");
    }
}
