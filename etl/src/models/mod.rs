pub mod event;
mod song;

pub use event::EventRecord;
pub use song::SongRecord;
