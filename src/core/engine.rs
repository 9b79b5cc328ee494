//! The worker pool: spawns the workers and the depth sampler, restarts
//! workers that panic, and coordinates graceful shutdown.

use super::CourierInner;
use super::worker::Worker;
use crate::error::{CourierError, CourierResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Global stop signal shared by every loop of one pool.
#[derive(Debug, Default)]
pub(crate) struct Shutdown {
    triggered: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub(crate) fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on shutdown.
    pub(crate) async fn sleep(&self, duration: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_triggered() {
            return;
        }

        tokio::select! {
            _ = sleep(duration) => {}
            _ = notified => {}
        }
    }
}

/// A running set of workers sharing one consumer group.
pub(crate) struct WorkerPool {
    inner: Arc<CourierInner>,
    shutdown: Arc<Shutdown>,
    workers: Vec<JoinHandle<()>>,
    sampler: Option<JoinHandle<()>>,
    concurrency: usize,
    started_at: Instant,
}

impl WorkerPool {
    /// Create the consumer group and spawn `concurrency` workers.
    ///
    /// Fails when there is no queue backend or the group cannot be created;
    /// nothing is spawned in that case.
    pub(crate) async fn start(inner: Arc<CourierInner>, concurrency: usize) -> CourierResult<Self> {
        if concurrency == 0 {
            return Err(CourierError::config("Worker concurrency must be greater than 0"));
        }

        let queue = inner.queue()?;
        queue.backend.ensure_group().await?;

        let shutdown = Arc::new(Shutdown::default());
        let instance = uuid::Uuid::new_v4().simple().to_string();
        let prefix = &inner.config.workers.consumer_prefix;

        let workers = (0..concurrency)
            .map(|id| {
                let consumer = format!("{prefix}-{}-{id}", &instance[..8]);
                let worker = Worker::new(id, consumer, Arc::clone(&inner), Arc::clone(&shutdown));
                tokio::spawn(supervise(worker, Arc::clone(&inner), Arc::clone(&shutdown)))
            })
            .collect();

        let sampler = inner
            .config
            .metrics
            .enable_sampler
            .then(|| tokio::spawn(run_sampler(Arc::clone(&inner), Arc::clone(&shutdown))));

        info!(concurrency, group = %inner.config.queue.group, "Worker pool started");

        Ok(Self {
            inner,
            shutdown,
            workers,
            sampler,
            concurrency,
            started_at: Instant::now(),
        })
    }

    /// Signal every loop to stop after its current record and wait for them,
    /// up to the configured shutdown timeout.
    pub(crate) async fn shutdown(mut self) -> CourierResult<()> {
        info!("Shutting down worker pool...");
        self.shutdown.trigger();

        let handles = std::mem::take(&mut self.workers);
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let limit = Duration::from_secs(self.inner.config.workers.shutdown_timeout_secs);

        match timeout(limit, futures::future::join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task ended abnormally");
                    }
                }
            }
            Err(_) => {
                warn!(
                    timeout_secs = limit.as_secs(),
                    "Workers did not stop in time, aborting"
                );
                aborts.iter().for_each(|handle| handle.abort());
            }
        }

        if let Some(sampler) = self.sampler.take() {
            sampler.abort();
        }

        info!(uptime = ?self.started_at.elapsed(), "Worker pool stopped");
        Ok(())
    }

    /// Healthy while at least one worker loop is running.
    pub(crate) fn health_check(&self) -> CourierResult<()> {
        let active = self.inner.stats.snapshot().active_workers;
        if active == 0 {
            return Err(CourierError::config("No active workers"));
        }
        if active < self.concurrency {
            warn!(active, expected = self.concurrency, "Worker pool is degraded");
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Loops exit on their own once they see the flag
        self.shutdown.trigger();
    }
}

/// Run a worker, restarting it with backoff if it panics.
async fn supervise(worker: Worker, inner: Arc<CourierInner>, shutdown: Arc<Shutdown>) {
    let mut restarts = 0u32;

    loop {
        let handle = tokio::spawn(worker.clone().run());
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() && !shutdown.is_triggered() => {
                restarts += 1;
                inner.stats.worker_restarts.fetch_add(1, Ordering::Relaxed);
                let backoff = crate::utils::calculate_backoff(restarts, 100, 30_000);
                error!(
                    consumer = worker.consumer(),
                    restarts,
                    backoff_ms = backoff,
                    "Worker panicked, restarting"
                );
                shutdown.sleep(Duration::from_millis(backoff)).await;
                if shutdown.is_triggered() {
                    break;
                }
            }
            Err(e) => {
                debug!(consumer = worker.consumer(), error = %e, "Worker task ended");
                break;
            }
        }
    }
}

/// Report queue depth on a fixed interval.
async fn run_sampler(inner: Arc<CourierInner>, shutdown: Arc<Shutdown>) {
    let interval = Duration::from_millis(inner.config.metrics.interval_ms);
    debug!(interval_ms = interval.as_millis() as u64, "Depth sampler started");

    while !shutdown.is_triggered() {
        inner.sample_depth().await;
        shutdown.sleep(interval).await;
    }

    debug!("Depth sampler stopped");
}
