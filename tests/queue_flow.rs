use courierq::prelude::*;
use courierq::utils::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Records attempts; fails the first `failures` of them.
#[derive(Default)]
struct ScriptedTransport {
    attempts: Mutex<Vec<JobId>>,
    failures: Mutex<u32>,
}

impl ScriptedTransport {
    fn failing(failures: u32) -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            failures: Mutex::new(failures),
        }
    }

    async fn attempts(&self) -> Vec<JobId> {
        self.attempts.lock().await.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, job: &Job) -> Result<(), TransportError> {
        self.attempts.lock().await.push(job.id.clone());
        let mut failures = self.failures.lock().await;
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError::Rejected("mailbox unavailable".to_string()));
        }
        Ok(())
    }
}

fn config() -> CourierConfig {
    CourierConfig::testing()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn end_to_end_delivery_leaves_nothing_behind() {
    let backend = Arc::new(InMemoryBackend::with_config(config().queue));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = Courier::builder(config(), transport.clone())
        .backend(backend.clone())
        .build()
        .unwrap();

    let result = courier
        .enqueue(
            EmailPayload::new("a@x.com", "S"),
            EnqueueOptions::purpose("verification"),
        )
        .await;
    assert!(result.accepted);
    let job_id = result.job_id.clone().unwrap();
    assert_eq!(backend.depth().await.unwrap().ready, 1);

    courier.start_workers(1).await.unwrap();
    wait_until("delivery", || courier.worker_stats().delivered == 1).await;
    courier.stop_workers().await.unwrap();

    assert_eq!(transport.attempts().await, vec![job_id]);
    assert_eq!(backend.depth().await.unwrap(), QueueDepth::default());

    // The claim is gone, so the same message is accepted again
    let again = courier
        .enqueue(
            EmailPayload::new("a@x.com", "S"),
            EnqueueOptions::purpose("verification"),
        )
        .await;
    assert!(again.accepted);
}

#[tokio::test]
async fn failing_job_is_retried_then_dead_lettered() {
    let backend = Arc::new(InMemoryBackend::with_config(config().queue));
    let transport = Arc::new(ScriptedTransport::failing(u32::MAX));
    let courier = Courier::builder(config(), transport.clone())
        .backend(backend.clone())
        .build()
        .unwrap();

    // testing() allows 3 attempts with a fixed 10ms delay
    let result = courier
        .enqueue(EmailPayload::new("a@x.com", "S"), EnqueueOptions::default())
        .await;
    courier.start_workers(2).await.unwrap();
    wait_until("dead letter", || {
        courier.worker_stats().dead_lettered == 1
    })
    .await;
    courier.stop_workers().await.unwrap();

    let stats = courier.worker_stats();
    assert_eq!(stats.retried, 2);
    assert_eq!(transport.attempts().await.len(), 3);

    let dead = courier.peek_dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(Some(dead[0].id.clone()), result.job_id);
    assert_eq!(dead[0].attempt, 3);
    assert_eq!(dead[0].attempt, dead[0].max_attempts);
    assert!(dead[0].last_error.is_some());

    let depth = backend.depth().await.unwrap();
    assert_eq!((depth.ready, depth.scheduled, depth.dead_letter), (0, 0, 1));
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let transport = Arc::new(ScriptedTransport::failing(1));
    let courier = Courier::builder(config(), transport.clone())
        .in_memory()
        .build()
        .unwrap();

    let result = courier
        .enqueue(EmailPayload::new("a@x.com", "S"), EnqueueOptions::default())
        .await;
    courier.start_workers(1).await.unwrap();
    wait_until("delivery", || courier.worker_stats().delivered == 1).await;
    courier.stop_workers().await.unwrap();

    let job_id = result.job_id.unwrap();
    assert_eq!(transport.attempts().await, vec![job_id.clone(), job_id]);
    assert_eq!(courier.worker_stats().retried, 1);
    assert!(courier.peek_dead_letters(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn scheduled_job_is_promoted_only_when_due() {
    let backend = Arc::new(InMemoryBackend::with_config(config().queue));
    let courier = Courier::builder(config(), Arc::new(LogTransport))
        .backend(backend.clone())
        .build()
        .unwrap();

    let now = now_millis();
    let result = courier
        .enqueue(
            EmailPayload::new("a@x.com", "S"),
            EnqueueOptions::default().with_available_after(now + 1_000),
        )
        .await;
    assert_eq!(result.scheduled_for, Some(now + 1_000));

    // Promotion at `now` moves nothing
    assert!(backend.promote_due(now, 100).await.unwrap().is_empty());
    assert!(backend.stream_entries().await.is_empty());

    // One cycle at now + 1001 makes it deliverable
    assert_eq!(backend.promote_due(now + 1_001, 100).await.unwrap().len(), 1);
    assert_eq!(backend.depth().await.unwrap().ready, 1);
    assert_eq!(backend.depth().await.unwrap().scheduled, 0);
}

#[tokio::test]
async fn abandoned_entry_is_recovered_by_another_process() {
    let backend = Arc::new(InMemoryBackend::with_config(config().queue));
    let transport = Arc::new(ScriptedTransport::default());
    let courier = Courier::builder(config(), transport.clone())
        .backend(backend.clone())
        .build()
        .unwrap();

    let result = courier
        .enqueue(EmailPayload::new("a@x.com", "S"), EnqueueOptions::default())
        .await;

    // A consumer in a crashed process read the entry and never acked it
    backend.ensure_group().await.unwrap();
    let taken = backend
        .read_group("crashed-0", 10, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);

    courier.start_workers(1).await.unwrap();
    wait_until("recovery", || courier.worker_stats().delivered == 1).await;
    courier.stop_workers().await.unwrap();

    assert_eq!(transport.attempts().await, vec![result.job_id.unwrap()]);
    assert_eq!(courier.worker_stats().reclaimed, 1);
    assert_eq!(backend.depth().await.unwrap().ready, 0);
}

#[tokio::test]
async fn concurrent_duplicates_yield_one_job() {
    let courier = Arc::new(
        Courier::builder(config(), Arc::new(LogTransport))
            .in_memory()
            .build()
            .unwrap(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let courier = Arc::clone(&courier);
            tokio::spawn(async move {
                courier
                    .enqueue(
                        EmailPayload::new("a@x.com", "Roster").with_text("Week 12"),
                        EnqueueOptions::purpose("roster"),
                    )
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap());
    }

    let accepted: Vec<_> = results.iter().filter(|r| r.accepted).collect();
    assert_eq!(accepted.len(), 1);
    let owner = accepted[0].job_id.clone();
    assert!(
        results
            .iter()
            .filter(|r| !r.accepted)
            .all(|r| r.is_duplicate() && r.job_id == owner)
    );
    assert_eq!(courier.depth().await.unwrap().ready, 1);
}
