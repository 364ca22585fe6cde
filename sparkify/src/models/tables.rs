use crate::schema::StarTable;
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use datafusion::datasource::MemTable;
use datafusion::execution::context::SessionContext;
use datafusion::common::TableReference;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One materialized batch per star table.
#[derive(Debug, Clone, Default)]
pub struct StarTables {
    batches: BTreeMap<StarTable, RecordBatch>,
}

impl StarTables {
    pub fn insert(&mut self, table: StarTable, batch: RecordBatch) -> Result<()> {
        if batch.schema() != table.schema() {
            return Err(Error::SchemaValidation(format!(
                "Batch for {} does not match its schema: {:?}",
                table,
                batch.schema()
            )));
        }
        self.batches.insert(table, batch);
        Ok(())
    }

    pub fn get(&self, table: StarTable) -> Result<&RecordBatch> {
        self.batches
            .get(&table)
            .ok_or_else(|| Error::Pipeline(format!("Table {} has not been loaded", table)))
    }

    pub fn contains(&self, table: StarTable) -> bool {
        self.batches.contains_key(&table)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StarTable, &RecordBatch)> {
        self.batches.iter().map(|(table, batch)| (*table, batch))
    }

    pub fn row_counts(&self) -> BTreeMap<StarTable, usize> {
        self.iter().map(|(table, batch)| (table, batch.num_rows())).collect()
    }

    /// Registers every loaded table in `ctx` under its own name.
    pub fn register(&self, ctx: &SessionContext) -> Result<()> {
        for (table, batch) in self.iter() {
            register_batch(ctx, table.name(), batch.clone())?;
        }
        Ok(())
    }
}

/// Registers `batch` as an in-memory table, replacing any table of that name.
pub fn register_batch(ctx: &SessionContext, name: &str, batch: RecordBatch) -> Result<()> {
    let reference = TableReference::bare(name);
    ctx.deregister_table(reference.clone())?;
    let provider = MemTable::try_new(batch.schema(), vec![vec![batch]])?;
    ctx.register_table(reference, Arc::new(provider))?;
    Ok(())
}

/// Casts query output onto a canonical schema.
///
/// The engine may hand back `Utf8View` strings or unsigned counters where the
/// canonical schema says `Utf8`/`Int64`; columns are matched by name and cast.
/// Non-nullable fields that receive nulls are rejected by `RecordBatch::try_new`.
pub fn conform_to_schema(batches: &[RecordBatch], schema: &SchemaRef) -> Result<RecordBatch> {
    let mut conformed = Vec::with_capacity(batches.len());

    for batch in batches {
        let batch_schema = batch.schema();
        if batch_schema.fields().len() != schema.fields().len() {
            return Err(Error::SchemaValidation(format!(
                "Expected {} columns, query produced {}",
                schema.fields().len(),
                batch_schema.fields().len()
            )));
        }

        let mut columns = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let index = batch_schema.index_of(field.name()).map_err(|_| {
                Error::SchemaValidation(format!("Query output is missing column {}", field.name()))
            })?;
            columns.push(cast(batch.column(index), field.data_type())?);
        }
        conformed.push(RecordBatch::try_new(schema.clone(), columns)?);
    }

    Ok(concat_batches(schema, &conformed)?)
}
