use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// The page value that marks a song play in the activity log.
pub const NEXT_SONG_PAGE: &str = "NextSong";

/// One line of the user activity log in `log_data`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventRecord {
    pub artist: Option<String>,
    pub auth: Option<String>,
    pub first_name: Option<String>,
    pub gender: Option<String>,
    pub item_in_session: Option<i32>,
    pub last_name: Option<String>,
    pub length: Option<f64>,
    pub level: Option<String>,
    pub location: Option<String>,
    pub method: Option<String>,
    pub page: Option<String>,
    pub registration: Option<f64>,
    pub session_id: Option<i64>,
    pub song: Option<String>,
    pub status: Option<i32>,
    /// Epoch milliseconds.
    pub ts: Option<i64>,
    pub user_agent: Option<String>,
    #[serde(deserialize_with = "lenient_id")]
    pub user_id: Option<i64>,
}

impl EventRecord {
    pub fn is_song_play(&self) -> bool {
        self.page.as_deref() == Some(NEXT_SONG_PAGE)
    }
}

// Logged-out sessions carry `"userId": ""`; logged-in ones a number or a numeric string.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(v), _) => Ok(Some(v)),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Some(f as i64)),
            _ => Err(D::Error::custom(format!("user id {} is not an integer", n))),
        },
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("user id '{}' is not numeric", s))),
        other => Err(D::Error::custom(format!("unexpected user id {}", other))),
    }
}
