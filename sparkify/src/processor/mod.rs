pub mod quality;
pub mod sql;
pub mod staging;
pub mod storage;
pub mod time;
pub mod transform;
mod udf;
pub mod warehouse;

pub use quality::{QualityChecker, QualityReport};
pub use storage::{StorageManager, TableWriteSummary};
pub use transform::StarSchemaTransformer;
pub use udf::register_udfs;
pub use warehouse::WarehouseLoader;

use crate::models::StarTables;
use crate::pipeline::{DagRunner, PipelineState, TaskRun, warehouse_dag};
use common::Result;
use common::config::Settings;
use common::storage::{ObjectStorage, S3Manager, open_storage};
use datafusion::execution::context::SessionContext;
use etl::utils::retry::retry_with_backoff;
use etl::{EventRecord, Extracted, SongRecord, SourceReader};
use std::sync::Arc;
use tracing::info;

/// Parsed source datasets.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub songs: Extracted<SongRecord>,
    pub events: Extracted<EventRecord>,
}

/// What a lake or warehouse run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub songs_read: usize,
    pub events_read: usize,
    pub malformed: usize,
    pub tables: Vec<TableWriteSummary>,
    pub quality: QualityReport,
    /// Per-task outcomes; empty for lake runs.
    pub tasks: Vec<TaskRun>,
}

/// Coordinates extraction, the two transform paths and the Parquet load.
pub struct StarSchemaProcessor {
    settings: Settings,
    source: Arc<dyn ObjectStorage>,
    output: StorageManager,
}

impl StarSchemaProcessor {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let s3_manager = Arc::new(S3Manager::new(settings.s3.clone()));
        let source = open_storage(&settings.source, &s3_manager).await?;
        let output = open_storage(&settings.output, &s3_manager).await?;
        Ok(Self::with_storage(settings, source, output))
    }

    pub fn with_storage(
        settings: &Settings,
        source: Arc<dyn ObjectStorage>,
        output: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            settings: settings.clone(),
            output: StorageManager::new(output, &settings.output.prefix),
            source,
        }
    }

    pub fn output(&self) -> &StorageManager {
        &self.output
    }

    pub async fn extract(&self) -> Result<SourceData> {
        let reader = SourceReader::new(self.source.clone(), &self.settings.source.prefix);
        let layout = &self.settings.layout;
        let pipeline = &self.settings.pipeline;

        let songs = retry_with_backoff(pipeline.retries, pipeline.retry_delay_ms, || {
            reader.read_songs(&layout.song_pattern)
        })
        .await?;
        let events = retry_with_backoff(pipeline.retries, pipeline.retry_delay_ms, || {
            reader.read_events(&layout.log_pattern)
        })
        .await?;

        Ok(SourceData { songs, events })
    }

    /// Native transform straight to partitioned Parquet.
    pub async fn run_lake(&self) -> Result<RunSummary> {
        let data = self.extract().await?;
        let mut summary = RunSummary::from_source(&data);

        let tables = StarSchemaTransformer::new(&self.settings.transform)?
            .transform(&data.songs.records, &data.events.records)
            .to_tables()?;

        let ctx = SessionContext::new();
        tables.register(&ctx)?;
        summary.quality = QualityChecker::new(&self.settings.quality).run(&ctx).await?;

        summary.tables = self.write(&tables).await?;
        info!(tables = summary.tables.len(), "Lake run finished");
        Ok(summary)
    }

    /// Staged SQL load driven by the warehouse DAG, then the same Parquet load.
    pub async fn run_warehouse(&self) -> Result<RunSummary> {
        let data = self.extract().await?;
        let mut summary = RunSummary::from_source(&data);

        let state = PipelineState::new(
            WarehouseLoader::new(&self.settings.transform),
            QualityChecker::new(&self.settings.quality),
            data.songs.records,
            data.events.records,
        );
        let dag = warehouse_dag()?;
        summary.tasks = DagRunner::new(&self.settings.pipeline).run(&dag, &state).await?;

        let PipelineState { tables, report, .. } = state;
        summary.quality = report.into_inner().unwrap_or_default();
        let tables = tables.into_inner();

        summary.tables = self.write(&tables).await?;
        info!(tables = summary.tables.len(), tasks = summary.tasks.len(), "Warehouse run finished");
        Ok(summary)
    }

    async fn write(&self, tables: &StarTables) -> Result<Vec<TableWriteSummary>> {
        let pipeline = &self.settings.pipeline;
        let mode = self.settings.load.dimension_mode;
        retry_with_backoff(pipeline.retries, pipeline.retry_delay_ms, || {
            self.output.write_all(tables, mode)
        })
        .await
    }
}

impl RunSummary {
    fn from_source(data: &SourceData) -> Self {
        Self {
            songs_read: data.songs.records.len(),
            events_read: data.events.records.len(),
            malformed: data.songs.malformed + data.events.malformed,
            ..Default::default()
        }
    }
}
