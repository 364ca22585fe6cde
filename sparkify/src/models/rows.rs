use super::tables::StarTables;
use crate::processor::time::TimeParts;
use crate::schema::{StarTable, UTC};
use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray, TimestampMillisecondArray};
use arrow::record_batch::RecordBatch;
use common::Result;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct SongRow {
    pub song_id: String,
    pub title: Option<String>,
    pub artist_id: Option<String>,
    pub year: Option<i32>,
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtistRow {
    pub artist_id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub user_id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub gender: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRow {
    /// Epoch milliseconds.
    pub start_time: i64,
    pub parts: TimeParts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SongplayRow {
    pub songplay_id: i64,
    pub start_time: i64,
    pub user_id: i64,
    pub level: Option<String>,
    pub song_id: String,
    pub artist_id: String,
    pub session_id: Option<i64>,
    pub location: Option<String>,
    pub user_agent: Option<String>,
    pub year: i32,
    pub month: i32,
}

/// Typed rows of all five tables, each sorted by its primary key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StarSchema {
    pub songplays: Vec<SongplayRow>,
    pub users: Vec<UserRow>,
    pub songs: Vec<SongRow>,
    pub artists: Vec<ArtistRow>,
    pub time: Vec<TimeRow>,
}

fn strings<'a>(values: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
    Arc::new(values.collect::<StringArray>())
}

fn timestamps(values: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(TimestampMillisecondArray::from_iter_values(values).with_timezone(UTC))
}

impl StarSchema {
    pub fn to_tables(&self) -> Result<StarTables> {
        let mut tables = StarTables::default();
        tables.insert(StarTable::Songplays, self.songplays_batch()?)?;
        tables.insert(StarTable::Users, self.users_batch()?)?;
        tables.insert(StarTable::Songs, self.songs_batch()?)?;
        tables.insert(StarTable::Artists, self.artists_batch()?)?;
        tables.insert(StarTable::Time, self.time_batch()?)?;
        Ok(tables)
    }

    fn songplays_batch(&self) -> Result<RecordBatch> {
        let rows = &self.songplays;
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.songplay_id))),
            timestamps(rows.iter().map(|r| r.start_time)),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.user_id))),
            strings(rows.iter().map(|r| r.level.as_deref())),
            strings(rows.iter().map(|r| Some(r.song_id.as_str()))),
            strings(rows.iter().map(|r| Some(r.artist_id.as_str()))),
            Arc::new(rows.iter().map(|r| r.session_id).collect::<Int64Array>()),
            strings(rows.iter().map(|r| r.location.as_deref())),
            strings(rows.iter().map(|r| r.user_agent.as_deref())),
            Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.year))),
            Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| r.month))),
        ];
        Ok(RecordBatch::try_new(StarTable::Songplays.schema(), columns)?)
    }

    fn users_batch(&self) -> Result<RecordBatch> {
        let rows = &self.users;
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.user_id))),
            strings(rows.iter().map(|r| r.first_name.as_deref())),
            strings(rows.iter().map(|r| r.last_name.as_deref())),
            strings(rows.iter().map(|r| r.gender.as_deref())),
            strings(rows.iter().map(|r| r.level.as_deref())),
        ];
        Ok(RecordBatch::try_new(StarTable::Users.schema(), columns)?)
    }

    fn songs_batch(&self) -> Result<RecordBatch> {
        let rows = &self.songs;
        let columns: Vec<ArrayRef> = vec![
            strings(rows.iter().map(|r| Some(r.song_id.as_str()))),
            strings(rows.iter().map(|r| r.title.as_deref())),
            strings(rows.iter().map(|r| r.artist_id.as_deref())),
            Arc::new(rows.iter().map(|r| r.year).collect::<Int32Array>()),
            Arc::new(rows.iter().map(|r| r.duration).collect::<Float64Array>()),
        ];
        Ok(RecordBatch::try_new(StarTable::Songs.schema(), columns)?)
    }

    fn artists_batch(&self) -> Result<RecordBatch> {
        let rows = &self.artists;
        let columns: Vec<ArrayRef> = vec![
            strings(rows.iter().map(|r| Some(r.artist_id.as_str()))),
            strings(rows.iter().map(|r| r.name.as_deref())),
            strings(rows.iter().map(|r| r.location.as_deref())),
            Arc::new(rows.iter().map(|r| r.latitude).collect::<Float64Array>()),
            Arc::new(rows.iter().map(|r| r.longitude).collect::<Float64Array>()),
        ];
        Ok(RecordBatch::try_new(StarTable::Artists.schema(), columns)?)
    }

    fn time_batch(&self) -> Result<RecordBatch> {
        let rows = &self.time;
        let part = |f: fn(&TimeParts) -> i32| -> ArrayRef {
            Arc::new(Int32Array::from_iter_values(rows.iter().map(|r| f(&r.parts))))
        };
        let columns: Vec<ArrayRef> = vec![
            timestamps(rows.iter().map(|r| r.start_time)),
            part(|p| p.hour),
            part(|p| p.day),
            part(|p| p.week),
            part(|p| p.month),
            part(|p| p.year),
            part(|p| p.weekday),
        ];
        Ok(RecordBatch::try_new(StarTable::Time.schema(), columns)?)
    }
}
