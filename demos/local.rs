use courierq::prelude::*;
use std::sync::Arc;

#[tokio::main]
async fn main() -> CourierResult<()> {
    tracing_subscriber::fmt::init();

    let config = CourierConfig::from_env()?;
    let courier = Courier::builder(config, Arc::new(LogTransport))
        .in_memory()
        .build()?;

    for shift in 1..=3 {
        let result = courier
            .enqueue(
                EmailPayload::new("crew@example.com", format!("Roster for shift {shift}"))
                    .with_text("See attached roster."),
                EnqueueOptions::purpose("roster").with_metadata("shift", shift.into()),
            )
            .await;
        println!("shift {shift}: {:?}", result.outcome());
    }

    // Same message again is suppressed
    let duplicate = courier
        .enqueue(
            EmailPayload::new("crew@example.com", "Roster for shift 1")
                .with_text("See attached roster."),
            EnqueueOptions::purpose("roster").with_metadata("shift", 1.into()),
        )
        .await;
    println!("repeat: {:?}", duplicate.outcome());

    courier.start().await?;
    println!("Courier is running. Press Ctrl+C to stop...");
    courier.wait_for_shutdown().await?;

    println!("stats: {:?}", courier.worker_stats());
    Ok(())
}
