//! Extraction side of the pipeline: source record models and the reader
//! that pulls song-catalog and activity-log JSON out of object storage.

pub mod extract;
pub mod models;
pub mod utils;

pub use extract::{Extracted, SourceReader};
pub use models::{EventRecord, SongRecord};
