use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use lazy_static::lazy_static;
use std::fmt;
use std::sync::Arc;

pub const UTC: &str = "UTC";

pub fn start_time_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some(UTC.into()))
}

// Staging schemas: raw source fields in snake_case plus the input position
pub fn staging_events_schema() -> Schema {
    Schema::new(vec![
        Field::new("record_index", DataType::Int64, false),
        Field::new("artist", DataType::Utf8, true),
        Field::new("auth", DataType::Utf8, true),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("item_in_session", DataType::Int32, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("length", DataType::Float64, true),
        Field::new("level", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("method", DataType::Utf8, true),
        Field::new("page", DataType::Utf8, true),
        Field::new("registration", DataType::Float64, true),
        Field::new("session_id", DataType::Int64, true),
        Field::new("song", DataType::Utf8, true),
        Field::new("status", DataType::Int32, true),
        Field::new("ts", DataType::Int64, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("user_id", DataType::Int64, true),
    ])
}

pub fn staging_songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("record_index", DataType::Int64, false),
        Field::new("num_songs", DataType::Int32, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("artist_latitude", DataType::Float64, true),
        Field::new("artist_longitude", DataType::Float64, true),
        Field::new("artist_location", DataType::Utf8, true),
        Field::new("artist_name", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, true),
        Field::new("title", DataType::Utf8, true),
        Field::new("duration", DataType::Float64, true),
        Field::new("year", DataType::Int32, true),
    ])
}

// Star schema
pub fn songplays_schema() -> Schema {
    Schema::new(vec![
        Field::new("songplay_id", DataType::Int64, false),
        Field::new("start_time", start_time_type(), false),
        Field::new("user_id", DataType::Int64, false),
        Field::new("level", DataType::Utf8, true),
        Field::new("song_id", DataType::Utf8, false),
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("session_id", DataType::Int64, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("user_agent", DataType::Utf8, true),
        Field::new("year", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
    ])
}

pub fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("user_id", DataType::Int64, false),
        Field::new("first_name", DataType::Utf8, true),
        Field::new("last_name", DataType::Utf8, true),
        Field::new("gender", DataType::Utf8, true),
        Field::new("level", DataType::Utf8, true),
    ])
}

pub fn songs_schema() -> Schema {
    Schema::new(vec![
        Field::new("song_id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, true),
        Field::new("artist_id", DataType::Utf8, true),
        Field::new("year", DataType::Int32, true),
        Field::new("duration", DataType::Float64, true),
    ])
}

pub fn artists_schema() -> Schema {
    Schema::new(vec![
        Field::new("artist_id", DataType::Utf8, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("location", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
    ])
}

pub fn time_schema() -> Schema {
    Schema::new(vec![
        Field::new("start_time", start_time_type(), false),
        Field::new("hour", DataType::Int32, false),
        Field::new("day", DataType::Int32, false),
        Field::new("week", DataType::Int32, false),
        Field::new("month", DataType::Int32, false),
        Field::new("year", DataType::Int32, false),
        Field::new("weekday", DataType::Int32, false),
    ])
}

// Lazy-loaded static schemas
lazy_static! {
    static ref STAGING_EVENTS_SCHEMA: SchemaRef = Arc::new(staging_events_schema());
    static ref STAGING_SONGS_SCHEMA: SchemaRef = Arc::new(staging_songs_schema());
    static ref SONGPLAYS_SCHEMA: SchemaRef = Arc::new(songplays_schema());
    static ref USERS_SCHEMA: SchemaRef = Arc::new(users_schema());
    static ref SONGS_SCHEMA: SchemaRef = Arc::new(songs_schema());
    static ref ARTISTS_SCHEMA: SchemaRef = Arc::new(artists_schema());
    static ref TIME_SCHEMA: SchemaRef = Arc::new(time_schema());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingTable {
    Events,
    Songs,
}

impl StagingTable {
    pub fn name(self) -> &'static str {
        match self {
            StagingTable::Events => "staging_events",
            StagingTable::Songs => "staging_songs",
        }
    }

    pub fn schema(self) -> SchemaRef {
        match self {
            StagingTable::Events => STAGING_EVENTS_SCHEMA.clone(),
            StagingTable::Songs => STAGING_SONGS_SCHEMA.clone(),
        }
    }
}

/// A fact-table column that must resolve in a dimension table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references: StarTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StarTable {
    Songplays,
    Users,
    Songs,
    Artists,
    Time,
}

impl StarTable {
    pub const ALL: [StarTable; 5] = [
        StarTable::Songplays,
        StarTable::Users,
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Time,
    ];

    pub const DIMENSIONS: [StarTable; 4] = [
        StarTable::Users,
        StarTable::Songs,
        StarTable::Artists,
        StarTable::Time,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StarTable::Songplays => "songplays",
            StarTable::Users => "users",
            StarTable::Songs => "songs",
            StarTable::Artists => "artists",
            StarTable::Time => "time",
        }
    }

    pub fn schema(self) -> SchemaRef {
        match self {
            StarTable::Songplays => SONGPLAYS_SCHEMA.clone(),
            StarTable::Users => USERS_SCHEMA.clone(),
            StarTable::Songs => SONGS_SCHEMA.clone(),
            StarTable::Artists => ARTISTS_SCHEMA.clone(),
            StarTable::Time => TIME_SCHEMA.clone(),
        }
    }

    pub fn primary_key(self) -> &'static str {
        match self {
            StarTable::Songplays => "songplay_id",
            StarTable::Users => "user_id",
            StarTable::Songs => "song_id",
            StarTable::Artists => "artist_id",
            StarTable::Time => "start_time",
        }
    }

    /// Hive partition columns, outermost first.
    pub fn partition_columns(self) -> &'static [&'static str] {
        match self {
            StarTable::Songplays | StarTable::Time => &["year", "month"],
            StarTable::Songs => &["year", "artist_id"],
            StarTable::Users | StarTable::Artists => &[],
        }
    }

    pub fn foreign_keys(self) -> &'static [ForeignKey] {
        const SONGPLAY_KEYS: [ForeignKey; 4] = [
            ForeignKey { column: "start_time", references: StarTable::Time },
            ForeignKey { column: "user_id", references: StarTable::Users },
            ForeignKey { column: "song_id", references: StarTable::Songs },
            ForeignKey { column: "artist_id", references: StarTable::Artists },
        ];
        match self {
            StarTable::Songplays => &SONGPLAY_KEYS,
            _ => &[],
        }
    }

    pub fn is_fact(self) -> bool {
        self == StarTable::Songplays
    }

    /// Schema of the Parquet files, i.e. without the partition columns.
    pub fn file_schema(self) -> SchemaRef {
        let partitions = self.partition_columns();
        let schema = self.schema();
        let fields: Vec<Field> = schema
            .fields()
            .iter()
            .filter(|f| !partitions.contains(&f.name().as_str()))
            .map(|f| f.as_ref().clone())
            .collect();
        Arc::new(Schema::new(fields))
    }
}

impl fmt::Display for StarTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_and_partitions_exist_in_schema() {
        for table in StarTable::ALL {
            let schema = table.schema();
            assert!(schema.index_of(table.primary_key()).is_ok(), "{}", table);
            for column in table.partition_columns() {
                assert!(schema.index_of(column).is_ok(), "{}.{}", table, column);
            }
            for fk in table.foreign_keys() {
                let fact_type = schema.field_with_name(fk.column).unwrap().data_type().clone();
                let dim_schema = fk.references.schema();
                let dim_key = dim_schema.field_with_name(fk.references.primary_key()).unwrap();
                assert_eq!(&fact_type, dim_key.data_type());
            }
        }
    }

    #[test]
    fn test_file_schema_drops_partition_columns() {
        let songs = StarTable::Songs.file_schema();
        let names: Vec<_> = songs.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["song_id", "title", "duration"]);

        assert_eq!(StarTable::Users.file_schema(), StarTable::Users.schema());
    }

    #[test]
    fn test_only_songplays_has_foreign_keys() {
        assert_eq!(StarTable::Songplays.foreign_keys().len(), 4);
        assert!(StarTable::DIMENSIONS.iter().all(|t| t.foreign_keys().is_empty()));
    }
}
