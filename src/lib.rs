//! # courierq
//!
//! A durable asynchronous email delivery queue for Rust applications.
//!
//! ## Features
//!
//! - **Durable queuing**: jobs live in a stream read through a consumer group
//! - **Deduplication**: a fingerprint claim suppresses repeated enqueues
//! - **Retries with backoff**: failed deliveries wait in a scheduled set
//! - **Dead-lettering**: jobs that use up their retries are kept for operators
//! - **Crash recovery**: entries abandoned by dead workers are reclaimed
//! - **Graceful degradation**: without a reachable store, messages are sent directly
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use courierq::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> CourierResult<()> {
//!     let config = CourierConfig::from_env()?;
//!     init_logging(&config.logging)?;
//!
//!     let courier = Courier::connect(config, Arc::new(LogTransport)).await?;
//!     courier.start().await?;
//!
//!     courier
//!         .enqueue(
//!             EmailPayload::new("user@example.com", "Your code").with_text("123456"),
//!             EnqueueOptions::purpose("verification"),
//!         )
//!         .await;
//!
//!     courier.wait_for_shutdown().await
//! }
//! ```

pub mod audit;
pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod transport;
pub mod utils;

pub mod prelude {
    pub use crate::audit::{AuditEvent, JobAuditLog, NoopAuditLog};
    pub use crate::config::*;
    pub use crate::core::{Courier, CourierBuilder, RecordOutcome, WorkerStats};
    pub use crate::error::{CourierError, CourierResult, TransportError};
    pub use crate::job::{
        EmailPayload, EnqueueOptions, EnqueueReason, EnqueueResult, Job, JobId, LastError,
    };
    pub use crate::metrics::{MetricsSink, NoopMetrics};
    pub use crate::queue::{InMemoryBackend, QueueBackend, QueueDepth};
    pub use crate::transport::{LogTransport, Transport};
    pub use crate::utils::init_logging;
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::PrometheusMetrics;

    #[cfg(feature = "redis-queue")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
    pub use crate::queue::RedisBackend;
}

pub use crate::config::CourierConfig;
pub use crate::core::{Courier, CourierBuilder};
pub use crate::error::{CourierError, CourierResult, TransportError};
pub use crate::job::{EmailPayload, EnqueueOptions, EnqueueResult, Job, JobId};
pub use crate::queue::QueueBackend;
pub use crate::transport::Transport;
pub use async_trait::async_trait;
