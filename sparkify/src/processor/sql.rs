use crate::schema::StarTable;
use common::config::{JoinPredicate, validate_duration_tolerance};
use common::{Error, Result};

// A staged event counts as a play when it is a NextSong page view by a known
// user with a timestamp inside the calendar range.
const PLAY_FILTER: &str = "e.page = 'NextSong' \
     AND e.user_id IS NOT NULL \
     AND e.ts IS NOT NULL \
     AND utc_timestamp(e.ts) IS NOT NULL";

pub const SONG_TABLE_INSERT: &str = "
SELECT ranked.song_id, ranked.title, ranked.artist_id, ranked.\"year\", ranked.duration
FROM (
    SELECT s.song_id, s.title, s.artist_id, s.\"year\", s.duration,
           ROW_NUMBER() OVER (PARTITION BY s.song_id ORDER BY s.record_index) AS rn
    FROM staging_songs s
    WHERE s.song_id IS NOT NULL
) ranked
WHERE ranked.rn = 1
ORDER BY ranked.song_id";

pub const ARTIST_TABLE_INSERT: &str = "
SELECT ranked.artist_id, ranked.name, ranked.location, ranked.latitude, ranked.longitude
FROM (
    SELECT s.artist_id,
           s.artist_name AS name,
           s.artist_location AS location,
           s.artist_latitude AS latitude,
           s.artist_longitude AS longitude,
           ROW_NUMBER() OVER (PARTITION BY s.artist_id ORDER BY s.record_index) AS rn
    FROM staging_songs s
    WHERE s.artist_id IS NOT NULL
) ranked
WHERE ranked.rn = 1
ORDER BY ranked.artist_id";

pub const USER_TABLE_INSERT: &str = "
SELECT ranked.user_id, ranked.first_name, ranked.last_name, ranked.gender, ranked.level
FROM (
    SELECT e.user_id, e.first_name, e.last_name, e.gender, e.level,
           ROW_NUMBER() OVER (
               PARTITION BY e.user_id
               ORDER BY e.ts DESC NULLS LAST, e.record_index DESC
           ) AS rn
    FROM staging_events e
    WHERE e.page = 'NextSong' AND e.user_id IS NOT NULL
) ranked
WHERE ranked.rn = 1
ORDER BY ranked.user_id";

/// Query deriving a dimension table from the staging tables.
pub fn dimension_query(table: StarTable) -> Result<String> {
    match table {
        StarTable::Songs => Ok(SONG_TABLE_INSERT.to_string()),
        StarTable::Artists => Ok(ARTIST_TABLE_INSERT.to_string()),
        StarTable::Users => Ok(USER_TABLE_INSERT.to_string()),
        StarTable::Time => Ok(time_table_insert()),
        StarTable::Songplays => Err(Error::InvalidInput(
            "songplays is a fact table, use fact_query".to_string(),
        )),
    }
}

fn time_table_insert() -> String {
    format!(
        "
SELECT utc_timestamp(p.ts) AS start_time,
       utc_hour(p.ts) AS \"hour\",
       utc_day(p.ts) AS \"day\",
       iso_week(p.ts) AS \"week\",
       utc_month(p.ts) AS \"month\",
       utc_year(p.ts) AS \"year\",
       utc_weekday(p.ts) AS weekday
FROM (
    SELECT DISTINCT e.ts
    FROM staging_events e
    WHERE {PLAY_FILTER}
) p
ORDER BY p.ts"
    )
}

/// Query deriving `songplays` from `staging_events` and the loaded `songs`
/// and `artists` dimensions.
pub fn fact_query(predicate: JoinPredicate, duration_tolerance: f64) -> Result<String> {
    validate_duration_tolerance(duration_tolerance)?;

    let artist_join = match predicate {
        JoinPredicate::Title => "",
        JoinPredicate::TitleArtist | JoinPredicate::TitleArtistDuration => {
            "JOIN artists a ON s.artist_id = a.artist_id AND e.artist = a.name"
        }
    };
    let duration_filter = match predicate {
        JoinPredicate::TitleArtistDuration => format!(
            "AND (e.length - s.duration) BETWEEN -{tol} AND {tol}",
            tol = duration_tolerance
        ),
        _ => String::new(),
    };

    Ok(format!(
        "
SELECT CAST(ROW_NUMBER() OVER (ORDER BY m.ts, m.record_index) AS BIGINT) - 1 AS songplay_id,
       utc_timestamp(m.ts) AS start_time,
       m.user_id,
       m.level,
       m.song_id,
       m.artist_id,
       m.session_id,
       m.location,
       m.user_agent,
       utc_year(m.ts) AS \"year\",
       utc_month(m.ts) AS \"month\"
FROM (
    SELECT e.record_index, e.ts, e.user_id, e.level, e.session_id, e.location, e.user_agent,
           s.song_id, s.artist_id,
           ROW_NUMBER() OVER (PARTITION BY e.record_index ORDER BY s.song_id) AS rn
    FROM staging_events e
    JOIN songs s ON e.song = s.title
    {artist_join}
    WHERE {PLAY_FILTER}
      AND s.artist_id IS NOT NULL
      {duration_filter}
) m
WHERE m.rn = 1
ORDER BY songplay_id"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_dimension_has_a_query() {
        for table in StarTable::DIMENSIONS {
            assert!(dimension_query(table).is_ok(), "{}", table);
        }
        assert!(dimension_query(StarTable::Songplays).is_err());
    }

    #[test]
    fn test_fact_query_follows_predicate() {
        let title = fact_query(JoinPredicate::Title, 1e-3).unwrap();
        assert!(!title.contains("JOIN artists"));

        let artist = fact_query(JoinPredicate::TitleArtist, 1e-3).unwrap();
        assert!(artist.contains("JOIN artists"));
        assert!(!artist.contains("BETWEEN"));

        let duration = fact_query(JoinPredicate::TitleArtistDuration, 1e-3).unwrap();
        assert!(duration.contains("BETWEEN -0.001 AND 0.001"));
    }

    #[test]
    fn test_invalid_tolerance_is_rejected() {
        assert!(fact_query(JoinPredicate::TitleArtistDuration, -1.0).is_err());
        assert!(fact_query(JoinPredicate::TitleArtistDuration, f64::NAN).is_err());
    }
}
