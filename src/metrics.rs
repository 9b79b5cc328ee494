//! Queue metrics.
//!
//! The queue reports through a [`MetricsSink`] injected at construction time.
//! [`NoopMetrics`] is the default; enable the `metrics` feature for a
//! Prometheus-backed sink.

use crate::error::CourierResult;
use crate::queue::QueueDepth;

/// Receives outcome counters and depth gauges.
///
/// Implementations must be cheap and non-blocking; they are called inline by
/// the producer and workers. Errors are logged and ignored by the caller.
pub trait MetricsSink: Send + Sync {
    /// An enqueue finished with `outcome` (`queued`, `scheduled`, `duplicate`,
    /// `fallback` or `invalid`).
    fn record_queued(&self, outcome: &str, purpose: &str) -> CourierResult<()>;

    /// A delivery succeeded.
    fn record_delivered(&self, purpose: &str) -> CourierResult<()>;

    /// A delivery failed and was rescheduled.
    fn record_retry(&self, purpose: &str) -> CourierResult<()>;

    /// A job exhausted its retry budget and was dead-lettered.
    fn record_failure(&self, purpose: &str) -> CourierResult<()>;

    /// Latest queue depth sample.
    fn record_depth(&self, depth: &QueueDepth) -> CourierResult<()>;
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_queued(&self, _outcome: &str, _purpose: &str) -> CourierResult<()> {
        Ok(())
    }

    fn record_delivered(&self, _purpose: &str) -> CourierResult<()> {
        Ok(())
    }

    fn record_retry(&self, _purpose: &str) -> CourierResult<()> {
        Ok(())
    }

    fn record_failure(&self, _purpose: &str) -> CourierResult<()> {
        Ok(())
    }

    fn record_depth(&self, _depth: &QueueDepth) -> CourierResult<()> {
        Ok(())
    }
}

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub use self::prometheus_sink::PrometheusMetrics;

#[cfg(feature = "metrics")]
mod prometheus_sink {
    use super::MetricsSink;
    use crate::error::CourierResult;
    use crate::queue::QueueDepth;
    use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

    /// Prometheus sink. Register [`registry`](Self::registry) with your
    /// exporter, or pass an existing registry to [`with_registry`](Self::with_registry).
    #[derive(Clone)]
    pub struct PrometheusMetrics {
        registry: Registry,
        queued: IntCounterVec,
        delivered: IntCounterVec,
        retry: IntCounterVec,
        failure: IntCounterVec,
        depth: IntGaugeVec,
    }

    impl PrometheusMetrics {
        /// Create a sink with its own registry.
        pub fn new() -> CourierResult<Self> {
            Self::with_registry(Registry::new())
        }

        /// Create a sink registering its collectors in `registry`.
        pub fn with_registry(registry: Registry) -> CourierResult<Self> {
            let queued = IntCounterVec::new(
                Opts::new("courier_email_queued_total", "Enqueue outcomes"),
                &["outcome", "purpose"],
            )?;
            let delivered = IntCounterVec::new(
                Opts::new("courier_email_delivered_total", "Successful deliveries"),
                &["purpose"],
            )?;
            let retry = IntCounterVec::new(
                Opts::new("courier_email_retry_total", "Failed deliveries rescheduled"),
                &["purpose"],
            )?;
            let failure = IntCounterVec::new(
                Opts::new("courier_email_failure_total", "Jobs moved to the dead letter store"),
                &["purpose"],
            )?;
            let depth = IntGaugeVec::new(
                Opts::new("courier_email_queue_depth", "Jobs per queue state"),
                &["state"],
            )?;

            registry.register(Box::new(queued.clone()))?;
            registry.register(Box::new(delivered.clone()))?;
            registry.register(Box::new(retry.clone()))?;
            registry.register(Box::new(failure.clone()))?;
            registry.register(Box::new(depth.clone()))?;

            Ok(Self {
                registry,
                queued,
                delivered,
                retry,
                failure,
                depth,
            })
        }

        /// The registry holding the collectors.
        pub fn registry(&self) -> &Registry {
            &self.registry
        }
    }

    impl MetricsSink for PrometheusMetrics {
        fn record_queued(&self, outcome: &str, purpose: &str) -> CourierResult<()> {
            self.queued.get_metric_with_label_values(&[outcome, purpose])?.inc();
            Ok(())
        }

        fn record_delivered(&self, purpose: &str) -> CourierResult<()> {
            self.delivered.get_metric_with_label_values(&[purpose])?.inc();
            Ok(())
        }

        fn record_retry(&self, purpose: &str) -> CourierResult<()> {
            self.retry.get_metric_with_label_values(&[purpose])?.inc();
            Ok(())
        }

        fn record_failure(&self, purpose: &str) -> CourierResult<()> {
            self.failure.get_metric_with_label_values(&[purpose])?.inc();
            Ok(())
        }

        fn record_depth(&self, depth: &QueueDepth) -> CourierResult<()> {
            for (state, value) in [
                ("ready", depth.ready),
                ("scheduled", depth.scheduled),
                ("dead_letter", depth.dead_letter),
            ] {
                self.depth
                    .get_metric_with_label_values(&[state])?
                    .set(value as i64);
            }
            Ok(())
        }
    }

}
