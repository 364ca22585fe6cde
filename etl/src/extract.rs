use crate::models::{EventRecord, SongRecord};
use common::storage::{ObjectStorage, join_key};
use common::{Error, Result};
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Deserializer, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FETCH_CONCURRENCY: usize = 8;

/// Records parsed from one source dataset, in key order then file order.
#[derive(Debug, Clone)]
pub struct Extracted<T> {
    pub records: Vec<T>,
    pub files: usize,
    pub malformed: usize,
}

impl<T> Default for Extracted<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            files: 0,
            malformed: 0,
        }
    }
}

/// Reads JSON datasets out of object storage.
pub struct SourceReader {
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl SourceReader {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: &str) -> Self {
        Self {
            storage,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    pub async fn read_songs(&self, pattern: &str) -> Result<Extracted<SongRecord>> {
        self.read_records(pattern).await
    }

    pub async fn read_events(&self, pattern: &str) -> Result<Extracted<EventRecord>> {
        self.read_records(pattern).await
    }

    /// Keys matching `pattern` (relative to the reader prefix), sorted.
    pub async fn list_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let full_pattern = join_key(&[&self.prefix, pattern]);
        let matcher = glob_to_regex(&full_pattern)?;
        let listing_prefix = literal_prefix(&full_pattern);

        let mut keys: Vec<String> = self
            .storage
            .list_objects(&listing_prefix)
            .await?
            .into_iter()
            .filter(|key| matcher.is_match(key))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn read_records<T: DeserializeOwned>(&self, pattern: &str) -> Result<Extracted<T>> {
        let keys = self.list_matching(pattern).await?;
        if keys.is_empty() {
            warn!(pattern, location = self.storage.bucket(), "No source files matched");
            return Ok(Extracted::default());
        }

        let contents: Vec<Vec<u8>> = futures::stream::iter(keys.iter())
            .map(|key| self.storage.get_object(key))
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut extracted = Extracted {
            records: Vec::new(),
            files: keys.len(),
            malformed: 0,
        };

        for (key, data) in keys.iter().zip(contents) {
            let (records, malformed) = parse_json_values::<T>(&data);
            if malformed > 0 {
                debug!(key = %key, malformed, "Dropped malformed rows");
            }
            extracted.malformed += malformed;
            extracted.records.extend(records);
        }

        info!(
            pattern,
            files = extracted.files,
            records = extracted.records.len(),
            malformed = extracted.malformed,
            "Extracted source dataset"
        );
        Ok(extracted)
    }
}

/// Parses every JSON value in `data`. Values may be concatenated, spread
/// over several lines or one per line. Values that are not objects or that
/// do not fit `T` are counted as malformed and skipped; after a syntax error
/// parsing resumes on the line following the error.
pub fn parse_json_values<T: DeserializeOwned>(data: &[u8]) -> (Vec<T>, usize) {
    let mut records = Vec::new();
    let mut malformed = 0;
    let mut offset = 0;

    while offset < data.len() {
        let rest = &data[offset..];
        let mut stream = Deserializer::from_slice(rest).into_iter::<Value>();

        match stream.next() {
            None => break,
            Some(Ok(value)) => {
                offset += stream.byte_offset();
                let parsed = match value {
                    Value::Object(_) => serde_json::from_value::<T>(value).ok(),
                    _ => None,
                };
                match parsed {
                    Some(record) => records.push(record),
                    None => malformed += 1,
                }
            }
            Some(Err(e)) => {
                malformed += 1;
                match end_of_line(rest, e.line()) {
                    Some(end) => offset += end + 1,
                    None => break,
                }
            }
        }
    }

    (records, malformed)
}

// Index of the newline closing 1-based `line`, if there is one.
fn end_of_line(data: &[u8], line: usize) -> Option<usize> {
    data.iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i)
        .nth(line.saturating_sub(1))
}

/// Translates a path glob into an anchored regex. `*` and `?` stay inside
/// one path segment, `**` crosses segments.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut expr = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                expr.push_str(".*");
            }
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|e| Error::InvalidInput(format!("Bad source pattern '{}': {}", pattern, e)))
}

// Everything before the first wildcard, cut back to a whole segment.
fn literal_prefix(pattern: &str) -> String {
    let literal = match pattern.find(['*', '?']) {
        Some(idx) => &pattern[..idx],
        None => pattern,
    };
    match literal.rfind('/') {
        Some(idx) => literal[..=idx].to_string(),
        None => String::new(),
    }
}
