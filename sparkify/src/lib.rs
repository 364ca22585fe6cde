pub mod logging;
pub mod models;
pub mod pipeline;
pub mod processor;
pub mod schema;
pub mod services;

use common::Result;
use common::config::Settings;
use processor::{RunSummary, StarSchemaProcessor};
use services::{OutputFormat, QueryService};
use tracing::info;

/// Runs the native lake transform with the given settings.
pub async fn run_lake_pipeline(settings: &Settings) -> Result<RunSummary> {
    let processor = StarSchemaProcessor::new(settings).await?;
    let summary = processor.run_lake().await?;
    log_summary("lake", &summary);
    Ok(summary)
}

/// Runs the staged SQL load through the warehouse DAG.
pub async fn run_warehouse_pipeline(settings: &Settings) -> Result<RunSummary> {
    let processor = StarSchemaProcessor::new(settings).await?;
    let summary = processor.run_warehouse().await?;
    log_summary("warehouse", &summary);
    Ok(summary)
}

pub async fn run_query(settings: &Settings, sql: &str, format: OutputFormat) -> Result<String> {
    let service = QueryService::new(settings).await?;
    service.execute_formatted(sql, format).await
}

fn log_summary(path: &str, summary: &RunSummary) {
    for table in &summary.tables {
        info!(
            path,
            table = table.table.name(),
            rows = table.rows,
            files = table.files.len(),
            "Table loaded"
        );
    }
    info!(
        path,
        songs = summary.songs_read,
        events = summary.events_read,
        malformed = summary.malformed,
        checks = summary.quality.outcomes.len(),
        "Pipeline finished"
    );
}
