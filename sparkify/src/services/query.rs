use crate::processor::register_udfs;
use crate::processor::storage::{HIVE_DEFAULT_PARTITION, StorageManager};
use crate::schema::StarTable;
use arrow::datatypes::DataType;
use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use common::config::Settings;
use common::storage::{ObjectStorage, S3Manager, open_storage};
use common::{Error, Result};
use datafusion::common::TableReference;
use datafusion::datasource::file_format::parquet::ParquetFormat;
use datafusion::datasource::listing::{
    ListingOptions, ListingTable, ListingTableConfig, ListingTableUrl,
};
use datafusion::datasource::TableProvider;
use datafusion::execution::context::SessionContext;
use datafusion::functions::expr_fn::nullif;
use datafusion::prelude::{Expr, ident, lit};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::InvalidInput(format!("Unknown output format '{}'", other))),
        }
    }
}

/// Ad-hoc SQL over the Parquet tables a previous run loaded.
pub struct QueryService {
    ctx: SessionContext,
    tables: Vec<StarTable>,
}

impl QueryService {
    pub async fn new(settings: &Settings) -> Result<Self> {
        let s3_manager = Arc::new(S3Manager::new(settings.s3.clone()));
        let output = open_storage(&settings.output, &s3_manager).await?;
        Self::with_storage(output, &settings.output.prefix).await
    }

    /// Registers every star table that has a completed load under `prefix`.
    pub async fn with_storage(storage: Arc<dyn ObjectStorage>, prefix: &str) -> Result<Self> {
        let ctx = SessionContext::new();
        register_udfs(&ctx);
        storage.register_with(&ctx).await?;

        let manager = StorageManager::new(storage, prefix);
        let mut tables = Vec::new();
        for table in StarTable::ALL {
            if manager.read_marker(table).await?.is_none() {
                warn!(table = table.name(), "Table has not been loaded, skipping");
                continue;
            }
            register_listing_table(&ctx, &manager, table).await?;
            tables.push(table);
        }

        info!(tables = tables.len(), "Registered lake tables");
        Ok(Self { ctx, tables })
    }

    pub fn tables(&self) -> &[StarTable] {
        &self.tables
    }

    pub async fn execute(&self, sql: &str) -> Result<Vec<RecordBatch>> {
        let batches = self.ctx.sql(sql).await?.collect().await?;
        Ok(batches)
    }

    pub async fn execute_formatted(&self, sql: &str, format: OutputFormat) -> Result<String> {
        let batches = self.execute(sql).await?;
        format_batches(&batches, format)
    }
}

async fn register_listing_table(
    ctx: &SessionContext,
    manager: &StorageManager,
    table: StarTable,
) -> Result<()> {
    let url = manager.storage().table_url(&manager.table_prefix(table))?;
    let table_url = ListingTableUrl::parse(&url)?;

    // Partition values are read back as strings, nulls included
    let partition_cols = table
        .partition_columns()
        .iter()
        .map(|name| (name.to_string(), DataType::Utf8))
        .collect();
    let options = ListingOptions::new(Arc::new(ParquetFormat::default()))
        .with_file_extension(".parquet")
        .with_table_partition_cols(partition_cols);

    let config = ListingTableConfig::new(table_url)
        .with_listing_options(options)
        .with_schema(table.file_schema());
    let provider = ListingTable::try_new(config)?;
    let files_name = format!("{}_parquet", table.name());
    replace_table(ctx, &files_name, Arc::new(provider))?;

    // Null partition values were written as the Hive default partition
    let files = ctx.table(TableReference::bare(files_name.as_str())).await?;
    let columns: Vec<Expr> = files
        .schema()
        .fields()
        .iter()
        .map(|field| {
            let name = field.name();
            if table.partition_columns().contains(&name.as_str()) {
                nullif(ident(name), lit(HIVE_DEFAULT_PARTITION)).alias(name)
            } else {
                ident(name)
            }
        })
        .collect();
    replace_table(ctx, table.name(), files.select(columns)?.into_view())?;

    info!(table = table.name(), url, "Registered listing table");
    Ok(())
}

fn replace_table(ctx: &SessionContext, name: &str, provider: Arc<dyn TableProvider>) -> Result<()> {
    let reference = TableReference::bare(name);
    ctx.deregister_table(reference.clone())?;
    ctx.register_table(reference, provider)?;
    Ok(())
}

pub fn format_batches(batches: &[RecordBatch], format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(pretty_format_batches(batches)?.to_string()),
        OutputFormat::Json => {
            let mut writer = ArrayWriter::new(Vec::new());
            let refs: Vec<&RecordBatch> = batches.iter().collect();
            writer.write_batches(&refs)?;
            writer.finish()?;
            String::from_utf8(writer.into_inner())
                .map_err(|e| Error::Other(format!("Query output is not UTF-8: {}", e)))
        }
    }
}
