//! Test doubles for the collaborator traits.

use crate::error::{CourierResult, TransportError};
use crate::job::{Job, JobId};
use crate::metrics::MetricsSink;
use crate::queue::QueueDepth;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

/// Transport that records every call and fails on demand.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    calls: Mutex<Vec<JobId>>,
    delivered: Mutex<Vec<JobId>>,
    failures_left: Mutex<u32>,
    always_fail: Mutex<bool>,
}

impl RecordingTransport {
    pub(crate) async fn fail_next(&self, count: u32) {
        *self.failures_left.lock().await = count;
    }

    pub(crate) async fn fail_always(&self) {
        *self.always_fail.lock().await = true;
    }

    /// Job ids of every attempt, successful or not.
    pub(crate) async fn calls(&self) -> Vec<JobId> {
        self.calls.lock().await.clone()
    }

    /// Job ids of successful deliveries.
    pub(crate) async fn delivered(&self) -> Vec<JobId> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, job: &Job) -> Result<(), TransportError> {
        self.calls.lock().await.push(job.id.clone());

        if *self.always_fail.lock().await {
            return Err(TransportError::Network("connection refused".to_string()));
        }
        let mut left = self.failures_left.lock().await;
        if *left > 0 {
            *left -= 1;
            return Err(TransportError::Network("connection reset".to_string()));
        }

        self.delivered.lock().await.push(job.id.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Metrics sink that keeps everything in memory.
#[derive(Default)]
pub(crate) struct RecordingMetrics {
    queued: StdMutex<Vec<(String, String)>>,
    delivered: StdMutex<u64>,
    retries: StdMutex<u64>,
    failures: StdMutex<u64>,
    depths: StdMutex<Vec<QueueDepth>>,
}

impl RecordingMetrics {
    pub(crate) async fn queued(&self) -> Vec<(String, String)> {
        self.queued.lock().unwrap().clone()
    }

    pub(crate) async fn depth_samples(&self) -> usize {
        self.depths.lock().unwrap().len()
    }

    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        (
            *self.delivered.lock().unwrap(),
            *self.retries.lock().unwrap(),
            *self.failures.lock().unwrap(),
        )
    }
}

impl MetricsSink for RecordingMetrics {
    fn record_queued(&self, outcome: &str, purpose: &str) -> CourierResult<()> {
        self.queued
            .lock()
            .unwrap()
            .push((outcome.to_string(), purpose.to_string()));
        Ok(())
    }

    fn record_delivered(&self, _purpose: &str) -> CourierResult<()> {
        *self.delivered.lock().unwrap() += 1;
        Ok(())
    }

    fn record_retry(&self, _purpose: &str) -> CourierResult<()> {
        *self.retries.lock().unwrap() += 1;
        Ok(())
    }

    fn record_failure(&self, _purpose: &str) -> CourierResult<()> {
        *self.failures.lock().unwrap() += 1;
        Ok(())
    }

    fn record_depth(&self, depth: &QueueDepth) -> CourierResult<()> {
        self.depths.lock().unwrap().push(*depth);
        Ok(())
    }
}
