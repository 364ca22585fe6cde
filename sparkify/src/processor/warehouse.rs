use super::sql::{dimension_query, fact_query};
use super::staging::{stage_events, stage_songs};
use super::udf::register_udfs;
use crate::models::{StarTables, conform_to_schema, register_batch};
use crate::schema::StarTable;
use arrow::record_batch::RecordBatch;
use common::config::TransformSettings;
use common::{Error, Result};
use datafusion::execution::context::SessionContext;
use etl::{EventRecord, SongRecord};
use tracing::{debug, info};

/// Derives the star schema with SQL over staged raw records.
///
/// Every loaded table is registered back into the session under its own name,
/// so the fact load can join the song and artist dimensions and the quality
/// checks can query any of them.
#[derive(Clone)]
pub struct WarehouseLoader {
    ctx: SessionContext,
    settings: TransformSettings,
}

impl WarehouseLoader {
    pub fn new(settings: &TransformSettings) -> Self {
        let ctx = SessionContext::new();
        register_udfs(&ctx);
        Self {
            ctx,
            settings: settings.clone(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn stage_events(&self, events: &[EventRecord]) -> Result<usize> {
        stage_events(&self.ctx, events)
    }

    pub fn stage_songs(&self, songs: &[SongRecord]) -> Result<usize> {
        stage_songs(&self.ctx, songs)
    }

    pub async fn load_dimension(&self, table: StarTable) -> Result<RecordBatch> {
        let sql = dimension_query(table)?;
        self.load(table, &sql).await
    }

    pub async fn load_fact(&self) -> Result<RecordBatch> {
        for dimension in [StarTable::Songs, StarTable::Artists] {
            if !self.ctx.table_exist(dimension.name())? {
                return Err(Error::Pipeline(format!(
                    "songplays depends on {} which has not been loaded",
                    dimension
                )));
            }
        }
        let sql = fact_query(self.settings.join, self.settings.duration_tolerance)?;
        self.load(StarTable::Songplays, &sql).await
    }

    /// Runs every load in dependency order. The DAG runner is the concurrent
    /// counterpart of this.
    pub async fn load_all(&self) -> Result<StarTables> {
        let mut tables = StarTables::default();
        for table in StarTable::DIMENSIONS {
            tables.insert(table, self.load_dimension(table).await?)?;
        }
        tables.insert(StarTable::Songplays, self.load_fact().await?)?;
        Ok(tables)
    }

    async fn load(&self, table: StarTable, sql: &str) -> Result<RecordBatch> {
        debug!(table = table.name(), sql, "Running load query");
        let batches = self.ctx.sql(sql).await?.collect().await?;
        let batch = conform_to_schema(&batches, &table.schema())?;
        register_batch(&self.ctx, table.name(), batch.clone())?;
        info!(table = table.name(), rows = batch.num_rows(), "Loaded table");
        Ok(batch)
    }
}
