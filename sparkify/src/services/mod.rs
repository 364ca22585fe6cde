pub mod query;

pub use query::{OutputFormat, QueryService, format_batches};
