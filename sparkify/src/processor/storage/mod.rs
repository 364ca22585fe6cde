use crate::models::StarTables;
use crate::schema::StarTable;
use arrow::array::{Array, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use common::config::LoadMode;
use common::storage::{ObjectStorage, join_key};
use common::{Error, Result};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const SUCCESS_MARKER: &str = "_SUCCESS";
pub const HIVE_DEFAULT_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";
const OVERWRITE_FILE_NAME: &str = "part-00000.parquet";

/// Contents of the `_SUCCESS` marker written after a table load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMarker {
    pub table: String,
    pub rows: usize,
    /// Keys of the files this load wrote, relative to the storage root.
    pub files: Vec<String>,
    /// SHA-256 over the written files, in key order.
    pub checksum: String,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableWriteSummary {
    pub table: StarTable,
    pub rows: usize,
    pub files: Vec<String>,
    pub replaced: usize,
    pub mode: LoadMode,
}

fn mode_name(mode: LoadMode) -> &'static str {
    match mode {
        LoadMode::Overwrite => "overwrite",
        LoadMode::Append => "append",
    }
}

/// Writes star tables as Hive-partitioned Parquet under `prefix`.
pub struct StorageManager {
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl StorageManager {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: &str) -> Self {
        Self {
            storage,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    pub fn table_prefix(&self, table: StarTable) -> String {
        join_key(&[&self.prefix, table.name()])
    }

    /// Writes every table. Dimensions use `dimension_mode`, the fact table is
    /// always overwritten.
    pub async fn write_all(
        &self,
        tables: &StarTables,
        dimension_mode: LoadMode,
    ) -> Result<Vec<TableWriteSummary>> {
        let mut summaries = Vec::new();
        for (table, batch) in tables.iter() {
            let mode = if table.is_fact() {
                LoadMode::Overwrite
            } else {
                dimension_mode
            };
            summaries.push(self.write_table(table, batch, mode).await?);
        }
        Ok(summaries)
    }

    pub async fn write_table(
        &self,
        table: StarTable,
        batch: &RecordBatch,
        mode: LoadMode,
    ) -> Result<TableWriteSummary> {
        if batch.schema() != table.schema() {
            return Err(Error::SchemaValidation(format!(
                "Refusing to write {} with a foreign schema",
                table
            )));
        }
        let mode = if table.is_fact() && mode == LoadMode::Append {
            warn!(table = table.name(), "Fact table cannot be appended to, overwriting");
            LoadMode::Overwrite
        } else {
            mode
        };

        let table_prefix = self.table_prefix(table);
        let replaced = match mode {
            LoadMode::Overwrite => self.storage.delete_prefix(&table_prefix).await?,
            LoadMode::Append => 0,
        };

        let file_name = match mode {
            LoadMode::Overwrite => OVERWRITE_FILE_NAME.to_string(),
            LoadMode::Append => format!("part-{}.parquet", Uuid::new_v4()),
        };

        let mut hasher = Sha256::new();
        let mut files = Vec::new();
        for (partition_path, part) in partition_batch(table, batch)? {
            let key = join_key(&[&table_prefix, &partition_path, &file_name]);
            let bytes = encode_parquet(&part)?;
            hasher.update(&bytes);
            self.storage.put_object(&key, &bytes).await?;
            files.push(key);
        }

        let marker = TableMarker {
            table: table.name().to_string(),
            rows: batch.num_rows(),
            files: files.clone(),
            checksum: format!("{:x}", hasher.finalize()),
            mode: mode_name(mode).to_string(),
        };
        let marker_key = join_key(&[&table_prefix, SUCCESS_MARKER]);
        self.storage
            .put_object(&marker_key, &serde_json::to_vec_pretty(&marker)?)
            .await?;

        info!(
            table = table.name(),
            rows = marker.rows,
            files = files.len(),
            replaced,
            mode = marker.mode,
            "Wrote table"
        );

        Ok(TableWriteSummary {
            table,
            rows: batch.num_rows(),
            files,
            replaced,
            mode,
        })
    }

    /// The marker of the last completed load, if any.
    pub async fn read_marker(&self, table: StarTable) -> Result<Option<TableMarker>> {
        let key = join_key(&[&self.table_prefix(table), SUCCESS_MARKER]);
        if !self.storage.check_file_exists(&key).await? {
            return Ok(None);
        }
        let bytes = self.storage.get_object(&key).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Splits `batch` by the table's partition columns, dropping those columns.
///
/// Partitions come back in path order; rows keep their relative order. An
/// unpartitioned table yields a single entry with an empty path, even when
/// the batch has no rows.
pub fn partition_batch(table: StarTable, batch: &RecordBatch) -> Result<Vec<(String, RecordBatch)>> {
    let schema = batch.schema();
    let partition_columns = table.partition_columns();

    let file_columns: Vec<usize> = (0..schema.fields().len())
        .filter(|i| !partition_columns.contains(&schema.field(*i).name().as_str()))
        .collect();
    let projected = batch.project(&file_columns)?;

    if partition_columns.is_empty() {
        return Ok(vec![(String::new(), projected)]);
    }

    let key_arrays = partition_columns
        .iter()
        .map(|name| {
            batch.column_by_name(name).ok_or_else(|| {
                Error::SchemaValidation(format!("{} has no partition column {}", table, name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let mut segments = Vec::with_capacity(key_arrays.len());
        for (name, array) in partition_columns.iter().zip(&key_arrays) {
            let value = if array.is_null(row) {
                HIVE_DEFAULT_PARTITION.to_string()
            } else {
                escape_partition_value(&array_value_to_string(array, row)?)
            };
            segments.push(format!("{}={}", name, value));
        }
        groups.entry(segments.join("/")).or_default().push(row as u32);
    }

    groups
        .into_iter()
        .map(|(path, rows)| {
            let indices = UInt32Array::from(rows);
            Ok((path, take_record_batch(&projected, &indices)?))
        })
        .collect()
}

/// Percent-encodes characters that would break a `key=value` path segment.
pub fn escape_partition_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_control() || "\"#%'*/:=?\\{[]^".contains(c) {
            for byte in c.to_string().bytes() {
                escaped.push_str(&format!("%{:02X}", byte));
            }
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer: Vec<u8> = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::transform::StarSchemaTransformer;
    use crate::processor::transform::tests::{sample_events, sample_songs};
    use bytes::Bytes;
    use common::config::TransformSettings;
    use common::storage::LocalStorage;
    use etl::SongRecord;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn sample_tables() -> StarTables {
        StarSchemaTransformer::new(&TransformSettings::default())
            .unwrap()
            .transform(&sample_songs(), &sample_events())
            .to_tables()
            .unwrap()
    }

    async fn manager(dir: &TempDir) -> StorageManager {
        let storage = LocalStorage::new(dir.path()).await.unwrap();
        StorageManager::new(Arc::new(storage), "lake")
    }

    async fn snapshot(storage: &Arc<dyn ObjectStorage>) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for key in storage.list_objects("lake").await.unwrap() {
            let data = storage.get_object(&key).await.unwrap();
            files.push((key, data));
        }
        files
    }

    #[test]
    fn test_escape_partition_value() {
        assert_eq!(escape_partition_value("AR1"), "AR1");
        assert_eq!(escape_partition_value("a/b=c"), "a%2Fb%3Dc");
        assert_eq!(escape_partition_value("100%"), "100%25");
    }

    #[test]
    fn test_partition_batch_drops_partition_columns() {
        let tables = sample_tables();
        let songs = tables.get(StarTable::Songs).unwrap();
        let parts = partition_batch(StarTable::Songs, songs).unwrap();

        let paths: Vec<_> = parts.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "year=2001/artist_id=AR1",
                "year=2001/artist_id=AR2",
                "year=2001/artist_id=__HIVE_DEFAULT_PARTITION__",
            ]
        );
        assert_eq!(parts[0].1.num_rows(), 2);
        assert_eq!(parts[0].1.schema(), StarTable::Songs.file_schema());
    }

    #[test]
    fn test_unknown_song_year_lands_in_default_partition() {
        let songs = vec![SongRecord {
            song_id: Some("SOX".to_string()),
            title: Some("Untitled".to_string()),
            artist_id: Some("AR1".to_string()),
            artist_name: Some("The Band".to_string()),
            duration: Some(120.0),
            year: None,
            ..Default::default()
        }];
        let tables = StarSchemaTransformer::new(&TransformSettings::default())
            .unwrap()
            .transform(&songs, &[])
            .to_tables()
            .unwrap();
        let batch = tables.get(StarTable::Songs).unwrap();
        assert!(batch.column_by_name("year").unwrap().is_null(0));

        let parts = partition_batch(StarTable::Songs, batch).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, "year=__HIVE_DEFAULT_PARTITION__/artist_id=AR1");
        assert_eq!(parts[0].1.num_rows(), 1);
    }

    #[test]
    fn test_unpartitioned_empty_table_still_yields_a_file() {
        let empty = RecordBatch::new_empty(StarTable::Users.schema());
        let parts = partition_batch(StarTable::Users, &empty).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, "");

        let empty = RecordBatch::new_empty(StarTable::Time.schema());
        assert!(partition_batch(StarTable::Time, &empty).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let tables = sample_tables();

        manager.write_all(&tables, LoadMode::Overwrite).await.unwrap();
        let first = snapshot(manager.storage()).await;
        let summaries = manager.write_all(&tables, LoadMode::Overwrite).await.unwrap();
        let second = snapshot(manager.storage()).await;

        assert_eq!(first, second);
        assert!(summaries.iter().all(|s| s.replaced > 0));
        assert!(first.iter().any(|(k, _)| k == "lake/songplays/year=2018/month=11/part-00000.parquet"));
        assert!(first.iter().any(|(k, _)| k == "lake/users/part-00000.parquet"));
    }

    #[tokio::test]
    async fn test_marker_and_parquet_contents() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let tables = sample_tables();
        let users = tables.get(StarTable::Users).unwrap();

        let summary = manager
            .write_table(StarTable::Users, users, LoadMode::Overwrite)
            .await
            .unwrap();
        let marker = manager.read_marker(StarTable::Users).await.unwrap().unwrap();
        assert_eq!(marker.rows, users.num_rows());
        assert_eq!(marker.files, summary.files);
        assert_eq!(marker.mode, "overwrite");
        assert_eq!(marker.checksum.len(), 64);

        let data = manager.storage().get_object(&summary.files[0]).await.unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))
            .unwrap()
            .build()
            .unwrap();
        let read: Vec<RecordBatch> = reader.collect::<std::result::Result<_, _>>().unwrap();
        assert_eq!(read[0].columns(), users.columns());

        assert!(manager.read_marker(StarTable::Songs).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_keeps_previous_files() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let tables = sample_tables();
        let artists = tables.get(StarTable::Artists).unwrap();

        manager
            .write_table(StarTable::Artists, artists, LoadMode::Overwrite)
            .await
            .unwrap();
        let appended = manager
            .write_table(StarTable::Artists, artists, LoadMode::Append)
            .await
            .unwrap();
        assert_eq!(appended.replaced, 0);

        let keys = manager.storage().list_objects("lake/artists").await.unwrap();
        let parquet: Vec<_> = keys.iter().filter(|k| k.ends_with(".parquet")).collect();
        assert_eq!(parquet.len(), 2);
    }

    #[tokio::test]
    async fn test_fact_append_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir).await;
        let tables = sample_tables();
        let facts = tables.get(StarTable::Songplays).unwrap();

        manager
            .write_table(StarTable::Songplays, facts, LoadMode::Append)
            .await
            .unwrap();
        let summary = manager
            .write_table(StarTable::Songplays, facts, LoadMode::Append)
            .await
            .unwrap();

        assert_eq!(summary.mode, LoadMode::Overwrite);
        let keys = manager.storage().list_objects("lake/songplays").await.unwrap();
        assert_eq!(keys.iter().filter(|k| k.ends_with(".parquet")).count(), 1);
    }
}
