mod rows;
mod tables;

pub use rows::{ArtistRow, SongRow, SongplayRow, StarSchema, TimeRow, UserRow};
pub use tables::{StarTables, conform_to_schema, register_batch};
