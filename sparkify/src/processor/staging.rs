use crate::models::register_batch;
use crate::schema::StagingTable;
use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use common::Result;
use datafusion::execution::context::SessionContext;
use etl::{EventRecord, SongRecord};
use std::sync::Arc;
use tracing::info;

fn record_indexes(len: usize) -> ArrayRef {
    Arc::new(Int64Array::from_iter_values(0..len as i64))
}

fn strings<'a, T: 'a>(records: &'a [T], f: impl Fn(&'a T) -> &'a Option<String>) -> ArrayRef {
    Arc::new(records.iter().map(|r| f(r).as_deref()).collect::<StringArray>())
}

/// Raw events as the `staging_events` table; `record_index` is the input position.
pub fn events_batch(events: &[EventRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        record_indexes(events.len()),
        strings(events, |e| &e.artist),
        strings(events, |e| &e.auth),
        strings(events, |e| &e.first_name),
        strings(events, |e| &e.gender),
        Arc::new(events.iter().map(|e| e.item_in_session).collect::<Int32Array>()),
        strings(events, |e| &e.last_name),
        Arc::new(events.iter().map(|e| e.length).collect::<Float64Array>()),
        strings(events, |e| &e.level),
        strings(events, |e| &e.location),
        strings(events, |e| &e.method),
        strings(events, |e| &e.page),
        Arc::new(events.iter().map(|e| e.registration).collect::<Float64Array>()),
        Arc::new(events.iter().map(|e| e.session_id).collect::<Int64Array>()),
        strings(events, |e| &e.song),
        Arc::new(events.iter().map(|e| e.status).collect::<Int32Array>()),
        Arc::new(events.iter().map(|e| e.ts).collect::<Int64Array>()),
        strings(events, |e| &e.user_agent),
        Arc::new(events.iter().map(|e| e.user_id).collect::<Int64Array>()),
    ];
    Ok(RecordBatch::try_new(StagingTable::Events.schema(), columns)?)
}

/// Raw song metadata as the `staging_songs` table.
pub fn songs_batch(songs: &[SongRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        record_indexes(songs.len()),
        Arc::new(songs.iter().map(|s| s.num_songs).collect::<Int32Array>()),
        strings(songs, |s| &s.artist_id),
        Arc::new(songs.iter().map(|s| s.artist_latitude).collect::<Float64Array>()),
        Arc::new(songs.iter().map(|s| s.artist_longitude).collect::<Float64Array>()),
        strings(songs, |s| &s.artist_location),
        strings(songs, |s| &s.artist_name),
        strings(songs, |s| &s.song_id),
        strings(songs, |s| &s.title),
        Arc::new(songs.iter().map(|s| s.duration).collect::<Float64Array>()),
        Arc::new(songs.iter().map(|s| s.year).collect::<Int32Array>()),
    ];
    Ok(RecordBatch::try_new(StagingTable::Songs.schema(), columns)?)
}

pub fn stage_events(ctx: &SessionContext, events: &[EventRecord]) -> Result<usize> {
    let batch = events_batch(events)?;
    let rows = batch.num_rows();
    register_batch(ctx, StagingTable::Events.name(), batch)?;
    info!(table = StagingTable::Events.name(), rows, "Staged events");
    Ok(rows)
}

pub fn stage_songs(ctx: &SessionContext, songs: &[SongRecord]) -> Result<usize> {
    let batch = songs_batch(songs)?;
    let rows = batch.num_rows();
    register_batch(ctx, StagingTable::Songs.name(), batch)?;
    info!(table = StagingTable::Songs.name(), rows, "Staged songs");
    Ok(rows)
}
