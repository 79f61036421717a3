//! Worker process with one ad-hoc handler and one recurring schedule
//!
//! Run with: DATABASE_URL=postgres://... cargo run -p rowq --example recurring_worker

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;

use rowq::prelude::*;
use rowq::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "rowq=debug")
    // - ROWQ_LOG_JSON: JSON log lines
    // - ROWQ_CONCURRENCY, ROWQ_POLLING_INTERVAL_MS, ...: queue settings
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "rowq" {
        telemetry_config.service_name = "rowq-recurring-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("rowq=debug,recurring_worker=info".to_string());
    }
    init_telemetry(telemetry_config);

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let store = PostgresTaskStore::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    store.migrate().await.context("Failed to run migrations")?;

    let config = QueueConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        "Starting recurring worker"
    );
    let queue = TaskQueue::new(Arc::new(store), config)?;

    queue.register("send_email", |task| async move {
        let to = task.payload["to"]
            .as_str()
            .context("payload.to must be a string")?
            .to_string();
        tracing::info!(%to, attempt = task.attempts, "sending email");
        Ok(json!({ "delivered_to": to }))
    });

    queue
        .add(
            "send_email",
            json!({ "to": "ops@example.com" }),
            AddOptions::new().with_priority(10),
        )
        .await?;

    let report = RecurringScheduler::new(
        queue.clone(),
        "queue-report",
        every(Duration::from_secs(60)),
        {
            let queue = queue.clone();
            move |_task| {
                let queue = queue.clone();
                async move {
                    let stats = queue.stats().await?;
                    tracing::info!(?stats, "queue report");
                    Ok(serde_json::to_value(stats)?)
                }
            }
        },
    );
    report.start(Utc::now()).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    report.stop().await;
    let deleted = queue.cleanup(7).await?;
    tracing::info!(deleted, "Worker shutdown complete");
    Ok(())
}
