//! Job definition, enqueue options and the payload fingerprint.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Unique identifier for a job
pub type JobId = String;

/// Header stamped on every job so duplicate sends can be detected downstream.
pub const JOB_ID_HEADER: &str = "X-Courier-Job-Id";

/// Purpose label used when the caller gives none.
pub const DEFAULT_PURPOSE: &str = "general";

/// The message to deliver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    /// Primary recipients
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub subject: String,
    /// Plain text body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Rich (HTML) body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl EmailPayload {
    /// Create a payload for a single recipient.
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            ..Default::default()
        }
    }

    /// Add another primary recipient.
    pub fn with_recipient(mut self, to: impl Into<String>) -> Self {
        self.to.push(to.into());
        self
    }

    /// Set the plain text body.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Set the HTML body.
    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Check the payload carries a recipient and some content.
    pub fn validate(&self) -> Result<(), String> {
        if !self.to.iter().any(|to| !to.trim().is_empty()) {
            return Err("at least one recipient is required".to_string());
        }
        let has_body = self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
            || self.html.as_deref().is_some_and(|h| !h.trim().is_empty());
        if self.subject.trim().is_empty() && !has_body {
            return Err("a subject or body is required".to_string());
        }
        Ok(())
    }

    /// Drop blank recipients and surrounding whitespace.
    fn normalize(&mut self) {
        for list in [&mut self.to, &mut self.cc, &mut self.bcc] {
            list.iter_mut().for_each(|r| *r = r.trim().to_string());
            list.retain(|r| !r.is_empty());
        }
    }
}

/// Error context stored on a dead-lettered job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastError {
    pub message: String,
    /// Error chain, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// The unit of work owned by the queue from enqueue until it is acked or
/// dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub payload: EmailPayload,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Failed deliveries so far
    #[serde(default)]
    pub attempt: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds
    pub created_at: u64,
    /// Epoch milliseconds of the last write to the stream or scheduled set
    pub queued_at: u64,
    /// Epoch milliseconds before which the job must not be delivered
    #[serde(default)]
    pub available_after: Option<u64>,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub dedupe_ttl_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
}

impl Job {
    /// Purpose label for metrics and logs.
    pub fn purpose_label(&self) -> &str {
        self.purpose.as_deref().unwrap_or(DEFAULT_PURPOSE)
    }

    /// Whether the job may be delivered at `now_ms`.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.available_after.is_none_or(|at| at <= now_ms)
    }

    /// Whether the retry budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse from the JSON wire format.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Reset a dead job so it can be enqueued again from scratch.
    pub fn reset_for_replay(&mut self, id: JobId) {
        self.id = id;
        self.attempt = 0;
        self.failed_at = None;
        self.last_error = None;
        self.available_after = None;
        self.delay_ms = 0;
        self.payload
            .headers
            .insert(JOB_ID_HEADER.to_string(), self.id.clone());
    }
}

/// Per-call knobs for [`Courier::enqueue`](crate::core::Courier::enqueue).
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-supplied job id
    pub job_id: Option<JobId>,
    pub purpose: Option<String>,
    pub metadata: Map<String, Value>,
    /// Delay before the first delivery attempt
    pub delay_ms: Option<u64>,
    /// Absolute epoch milliseconds before which the job must not run
    pub available_after: Option<u64>,
    pub max_attempts: Option<u32>,
    /// Explicit fingerprint override
    pub dedupe_key: Option<String>,
    pub dedupe_ttl_ms: Option<u64>,
}

impl EnqueueOptions {
    /// Options tagged with a purpose.
    pub fn purpose(purpose: impl Into<String>) -> Self {
        Self {
            purpose: Some(purpose.into()),
            ..Default::default()
        }
    }

    /// Set the job id.
    pub fn with_job_id(mut self, id: impl Into<JobId>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Delay the first delivery attempt.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Do not deliver before the given epoch milliseconds.
    pub fn with_available_after(mut self, at_ms: u64) -> Self {
        self.available_after = Some(at_ms);
        self
    }

    /// Override the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the dedup fingerprint.
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Override how long the dedup claim lives.
    pub fn with_dedupe_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.dedupe_ttl_ms = Some(ttl_ms);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Defaults applied when building a job.
#[derive(Debug, Clone, Copy)]
pub struct JobDefaults {
    pub max_attempts: u32,
    pub dedupe_ttl_ms: u64,
    pub dedupe_enabled: bool,
}

impl Job {
    /// Build a job from a request. Validation is the caller's concern.
    pub fn build(
        mut payload: EmailPayload,
        options: EnqueueOptions,
        defaults: JobDefaults,
        now_ms: u64,
    ) -> Self {
        payload.normalize();

        let id = options
            .job_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        payload.headers.insert(JOB_ID_HEADER.to_string(), id.clone());

        let delay_ms = options.delay_ms.unwrap_or(0);
        let available_after = match (options.available_after, delay_ms) {
            (Some(at), _) => Some(at),
            (None, 0) => None,
            (None, delay) => Some(now_ms.saturating_add(delay)),
        };

        let dedupe_key = if defaults.dedupe_enabled {
            Some(
                options
                    .dedupe_key
                    .filter(|key| !key.trim().is_empty())
                    .unwrap_or_else(|| {
                        fingerprint(
                            options.purpose.as_deref(),
                            &payload,
                            &options.metadata,
                        )
                    }),
            )
        } else {
            None
        };

        Self {
            id,
            dedupe_key,
            payload,
            purpose: options.purpose,
            metadata: options.metadata,
            attempt: 0,
            max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts),
            created_at: now_ms,
            queued_at: now_ms,
            available_after,
            delay_ms,
            dedupe_ttl_ms: options.dedupe_ttl_ms.unwrap_or(defaults.dedupe_ttl_ms),
            failed_at: None,
            last_error: None,
        }
    }
}

/// Stable SHA-256 fingerprint over the semantic content of a message.
///
/// Object keys are ordered, so logically identical requests hash the same
/// regardless of how their metadata maps were built.
pub fn fingerprint(purpose: Option<&str>, payload: &EmailPayload, metadata: &Map<String, Value>) -> String {
    let canonical = json!({
        "purpose": purpose,
        "to": payload.to,
        "subject": payload.subject,
        "text": payload.text,
        "html": payload.html,
        "metadata": metadata,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Why an enqueue was not accepted, or why it went through the fallback path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueReason {
    /// A live claim already covers this fingerprint
    Duplicate,
    /// No queue store is configured; the message was sent directly
    TransportUnconfigured,
    /// The queue store could not be reached; the message was sent directly
    StoreUnavailable,
    /// The request was rejected before anything was attempted
    Invalid(String),
}

impl EnqueueReason {
    /// Outcome label used for the `queued` counter.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::TransportUnconfigured | Self::StoreUnavailable => "fallback",
            Self::Invalid(_) => "invalid",
        }
    }
}

/// Outcome of [`Courier::enqueue`](crate::core::Courier::enqueue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueResult {
    /// The job now lives in the queue
    pub accepted: bool,
    /// Set only on the synchronous fallback path
    pub delivered: Option<bool>,
    /// New job id, or the owner's id for duplicates
    pub job_id: Option<JobId>,
    pub reason: Option<EnqueueReason>,
    /// Epoch milliseconds the job becomes due, for scheduled jobs
    pub scheduled_for: Option<u64>,
}

impl EnqueueResult {
    pub(crate) fn queued(job_id: JobId) -> Self {
        Self {
            accepted: true,
            delivered: None,
            job_id: Some(job_id),
            reason: None,
            scheduled_for: None,
        }
    }

    pub(crate) fn scheduled(job_id: JobId, at_ms: u64) -> Self {
        Self {
            scheduled_for: Some(at_ms),
            ..Self::queued(job_id)
        }
    }

    pub(crate) fn duplicate(existing: Option<JobId>) -> Self {
        Self {
            accepted: false,
            delivered: None,
            job_id: existing,
            reason: Some(EnqueueReason::Duplicate),
            scheduled_for: None,
        }
    }

    pub(crate) fn fallback(job_id: JobId, delivered: bool, reason: EnqueueReason) -> Self {
        Self {
            accepted: false,
            delivered: Some(delivered),
            job_id: Some(job_id),
            reason: Some(reason),
            scheduled_for: None,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            delivered: None,
            job_id: None,
            reason: Some(EnqueueReason::Invalid(message.into())),
            scheduled_for: None,
        }
    }

    /// Whether this is a duplicate suppression.
    pub fn is_duplicate(&self) -> bool {
        self.reason == Some(EnqueueReason::Duplicate)
    }

    /// Outcome label used for the `queued` counter.
    pub fn outcome(&self) -> &'static str {
        match (&self.reason, self.scheduled_for) {
            (Some(reason), _) => reason.outcome(),
            (None, Some(_)) => "scheduled",
            (None, None) => "queued",
        }
    }
}
