use courierq::prelude::*;
use std::sync::Arc;

// COURIER_REDIS_URL=redis://localhost:6379 cargo run --example redis --features redis-queue
#[tokio::main]
async fn main() -> CourierResult<()> {
    tracing_subscriber::fmt::init();

    let mut config = CourierConfig::from_env()?;
    if config.queue.redis_url.is_none() {
        config.queue.redis_url = Some("redis://localhost:6379".to_string());
    }

    let courier = Courier::connect(config, Arc::new(LogTransport)).await?;
    courier.health_check().await?;

    let result = courier
        .enqueue(
            EmailPayload::new("user@example.com", "Reminder").with_text("Your shift starts soon."),
            EnqueueOptions::purpose("reminder").with_delay_ms(5_000),
        )
        .await;
    println!("enqueue: {result:?}");
    println!("depth: {:?}", courier.depth().await?);

    courier.start().await?;
    courier.wait_for_shutdown().await?;

    for job in courier.peek_dead_letters(10).await? {
        println!("dead: {} ({:?})", job.id, job.last_error);
    }
    Ok(())
}
