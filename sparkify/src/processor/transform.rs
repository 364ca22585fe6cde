use super::time::TimeParts;
use crate::models::{ArtistRow, SongRow, SongplayRow, StarSchema, TimeRow, UserRow};
use common::Result;
use common::config::{JoinPredicate, TransformSettings};
use etl::{EventRecord, SongRecord};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// A NextSong event with the fields every derived table relies on.
#[derive(Debug, Clone, Copy)]
struct Play<'a> {
    record_index: usize,
    ts: i64,
    user_id: i64,
    parts: TimeParts,
    event: &'a EventRecord,
}

/// Native single-pass derivation of the star schema from parsed records.
#[derive(Debug, Clone)]
pub struct StarSchemaTransformer {
    predicate: JoinPredicate,
    duration_tolerance: f64,
}

impl StarSchemaTransformer {
    pub fn new(settings: &TransformSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            predicate: settings.join,
            duration_tolerance: settings.duration_tolerance,
        })
    }

    pub fn transform(&self, songs: &[SongRecord], events: &[EventRecord]) -> StarSchema {
        let song_rows = song_dimension(songs);
        let artist_rows = artist_dimension(songs);
        let user_rows = user_dimension(events);

        let plays = song_plays(events);
        let time_rows = time_dimension(&plays);
        let songplays = self.songplays(&plays, &song_rows, &artist_rows);

        info!(
            songs = song_rows.len(),
            artists = artist_rows.len(),
            users = user_rows.len(),
            time = time_rows.len(),
            songplays = songplays.len(),
            unmatched = plays.len() - songplays.len(),
            "Derived star schema"
        );

        StarSchema {
            songplays,
            users: user_rows,
            songs: song_rows,
            artists: artist_rows,
            time: time_rows,
        }
    }

    fn songplays(
        &self,
        plays: &[Play<'_>],
        songs: &[SongRow],
        artists: &[ArtistRow],
    ) -> Vec<SongplayRow> {
        let artist_names: HashMap<&str, Option<&str>> = artists
            .iter()
            .map(|a| (a.artist_id.as_str(), a.name.as_deref()))
            .collect();

        // `songs` is sorted by song_id, so each bucket is too
        let mut by_title: HashMap<&str, Vec<&SongRow>> = HashMap::new();
        for song in songs.iter().filter(|s| s.artist_id.is_some()) {
            if let Some(title) = song.title.as_deref() {
                by_title.entry(title).or_default().push(song);
            }
        }

        let mut matched: Vec<(&Play<'_>, &SongRow)> = plays
            .iter()
            .filter_map(|play| {
                let title = play.event.song.as_deref()?;
                let candidates = by_title.get(title)?;
                candidates
                    .iter()
                    .find(|song| self.matches(play.event, song, &artist_names))
                    .map(|song| (play, *song))
            })
            .collect();
        matched.sort_by_key(|(play, _)| (play.ts, play.record_index));

        matched
            .into_iter()
            .enumerate()
            .filter_map(|(songplay_id, (play, song))| {
                let artist_id = song.artist_id.clone()?;
                Some(SongplayRow {
                    songplay_id: songplay_id as i64,
                    start_time: play.ts,
                    user_id: play.user_id,
                    level: play.event.level.clone(),
                    song_id: song.song_id.clone(),
                    artist_id,
                    session_id: play.event.session_id,
                    location: play.event.location.clone(),
                    user_agent: play.event.user_agent.clone(),
                    year: play.parts.year,
                    month: play.parts.month,
                })
            })
            .collect()
    }

    fn matches(
        &self,
        event: &EventRecord,
        song: &SongRow,
        artist_names: &HashMap<&str, Option<&str>>,
    ) -> bool {
        let artist_matches = || {
            let name = song
                .artist_id
                .as_deref()
                .and_then(|id| artist_names.get(id).copied().flatten());
            matches!((event.artist.as_deref(), name), (Some(a), Some(b)) if a == b)
        };
        let duration_matches = || match (event.length, song.duration) {
            (Some(length), Some(duration)) => {
                let delta = length - duration;
                delta >= -self.duration_tolerance && delta <= self.duration_tolerance
            }
            _ => false,
        };

        match self.predicate {
            JoinPredicate::Title => true,
            JoinPredicate::TitleArtist => artist_matches(),
            JoinPredicate::TitleArtistDuration => artist_matches() && duration_matches(),
        }
    }
}

/// First occurrence of each song_id wins; sorted by song_id.
fn song_dimension(songs: &[SongRecord]) -> Vec<SongRow> {
    let mut seen = HashSet::new();
    let mut rows: Vec<SongRow> = songs
        .iter()
        .filter_map(|song| {
            let song_id = song.song_id.as_ref()?;
            if !seen.insert(song_id.as_str()) {
                return None;
            }
            Some(SongRow {
                song_id: song_id.clone(),
                title: song.title.clone(),
                artist_id: song.artist_id.clone(),
                year: song.year,
                duration: song.duration,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.song_id.cmp(&b.song_id));
    rows
}

/// First occurrence of each artist_id wins; sorted by artist_id.
fn artist_dimension(songs: &[SongRecord]) -> Vec<ArtistRow> {
    let mut seen = HashSet::new();
    let mut rows: Vec<ArtistRow> = songs
        .iter()
        .filter_map(|song| {
            let artist_id = song.artist_id.as_ref()?;
            if !seen.insert(artist_id.as_str()) {
                return None;
            }
            Some(ArtistRow {
                artist_id: artist_id.clone(),
                name: song.artist_name.clone(),
                location: song.artist_location.clone(),
                latitude: song.artist_latitude,
                longitude: song.artist_longitude,
            })
        })
        .collect();
    rows.sort_by(|a, b| a.artist_id.cmp(&b.artist_id));
    rows
}

/// The user's latest NextSong event wins: largest ts (null lowest), then
/// largest input position.
fn user_dimension(events: &[EventRecord]) -> Vec<UserRow> {
    let mut latest: BTreeMap<i64, (Option<i64>, usize)> = BTreeMap::new();
    for (index, event) in events.iter().enumerate() {
        if !event.is_song_play() {
            continue;
        }
        let Some(user_id) = event.user_id else {
            continue;
        };
        let rank = (event.ts, index);
        latest
            .entry(user_id)
            .and_modify(|current| {
                if rank > *current {
                    *current = rank;
                }
            })
            .or_insert(rank);
    }

    latest
        .into_iter()
        .map(|(user_id, (_, index))| {
            let event = &events[index];
            UserRow {
                user_id,
                first_name: event.first_name.clone(),
                last_name: event.last_name.clone(),
                gender: event.gender.clone(),
                level: event.level.clone(),
            }
        })
        .collect()
}

/// NextSong events with a user and a decodable timestamp, in input order.
fn song_plays(events: &[EventRecord]) -> Vec<Play<'_>> {
    let candidates = events.iter().filter(|event| event.is_song_play()).count();
    let plays: Vec<Play<'_>> = events
        .iter()
        .enumerate()
        .filter(|(_, event)| event.is_song_play())
        .filter_map(|(record_index, event)| to_play(record_index, event))
        .collect();

    if plays.len() < candidates {
        debug!(
            skipped = candidates - plays.len(),
            "NextSong events without user or valid timestamp"
        );
    }
    plays
}

fn to_play(record_index: usize, event: &EventRecord) -> Option<Play<'_>> {
    let ts = event.ts?;
    Some(Play {
        record_index,
        ts,
        user_id: event.user_id?,
        parts: TimeParts::from_epoch_millis(ts)?,
        event,
    })
}

fn time_dimension(plays: &[Play<'_>]) -> Vec<TimeRow> {
    let distinct: BTreeMap<i64, TimeParts> = plays.iter().map(|p| (p.ts, p.parts)).collect();
    distinct
        .into_iter()
        .map(|(start_time, parts)| TimeRow { start_time, parts })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn song(id: &str, title: &str, artist_id: Option<&str>, artist: &str, duration: f64) -> SongRecord {
        SongRecord {
            num_songs: Some(1),
            artist_id: artist_id.map(str::to_string),
            artist_latitude: None,
            artist_longitude: None,
            artist_location: Some("Oslo".to_string()),
            artist_name: Some(artist.to_string()),
            song_id: Some(id.to_string()),
            title: Some(title.to_string()),
            duration: Some(duration),
            year: Some(2001),
        }
    }

    pub(crate) fn play(user_id: i64, ts: i64, song: &str, artist: &str, length: f64, level: &str) -> EventRecord {
        EventRecord {
            artist: Some(artist.to_string()),
            first_name: Some(format!("First{}", user_id)),
            last_name: Some(format!("Last{}", user_id)),
            gender: Some("F".to_string()),
            length: Some(length),
            level: Some(level.to_string()),
            location: Some("Tampa, FL".to_string()),
            page: Some("NextSong".to_string()),
            session_id: Some(100 + user_id),
            song: Some(song.to_string()),
            ts: Some(ts),
            user_agent: Some("Mozilla/5.0".to_string()),
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub(crate) fn sample_songs() -> Vec<SongRecord> {
        vec![
            song("SOB", "Harmony", Some("AR1"), "The Band", 200.0),
            song("SOA", "Harmony", Some("AR1"), "The Band", 180.0),
            song("SOC", "Echoes", Some("AR2"), "Second Act", 240.5),
            song("SOD", "Orphan", None, "Nobody", 100.0),
            // duplicate ids: first occurrence wins
            song("SOC", "Echoes (live)", Some("AR2"), "Second Act Renamed", 300.0),
        ]
    }

    pub(crate) fn sample_events() -> Vec<EventRecord> {
        let mut home = EventRecord {
            page: Some("Home".to_string()),
            user_id: Some(9),
            ts: Some(1541903000000),
            ..Default::default()
        };
        home.level = Some("free".to_string());

        vec![
            play(7, 1541903636796, "Harmony", "The Band", 180.0, "free"),
            play(8, 1541903636796, "Echoes", "Second Act", 240.5, "paid"),
            play(7, 1542241826796, "Echoes", "Second Act", 240.5, "paid"),
            play(8, 1541990000000, "Unknown", "Nobody Famous", 10.0, "paid"),
            play(7, 1541000000000, "Orphan", "Nobody", 100.0, "free"),
            home,
            EventRecord {
                user_id: None,
                ..play(0, 1541903636000, "Harmony", "The Band", 180.0, "free")
            },
        ]
    }

    fn transformer(predicate: JoinPredicate) -> StarSchemaTransformer {
        StarSchemaTransformer::new(&TransformSettings {
            join: predicate,
            duration_tolerance: 1e-3,
        })
        .unwrap()
    }

    #[test]
    fn test_dimension_keys_are_unique_and_sorted() {
        let star = transformer(JoinPredicate::TitleArtist).transform(&sample_songs(), &sample_events());

        let song_ids: Vec<_> = star.songs.iter().map(|s| s.song_id.as_str()).collect();
        assert_eq!(song_ids, vec!["SOA", "SOB", "SOC", "SOD"]);
        let echoes = star.songs.iter().find(|s| s.song_id == "SOC").unwrap();
        assert_eq!(echoes.title.as_deref(), Some("Echoes"));

        let artist_ids: Vec<_> = star.artists.iter().map(|a| a.artist_id.as_str()).collect();
        assert_eq!(artist_ids, vec!["AR1", "AR2"]);
        assert_eq!(star.artists[1].name.as_deref(), Some("Second Act"));

        let user_ids: Vec<_> = star.users.iter().map(|u| u.user_id).collect();
        assert_eq!(user_ids, vec![7, 8]);
    }

    #[test]
    fn test_user_level_comes_from_latest_event() {
        let star = transformer(JoinPredicate::TitleArtist).transform(&sample_songs(), &sample_events());
        let user7 = star.users.iter().find(|u| u.user_id == 7).unwrap();
        assert_eq!(user7.level.as_deref(), Some("paid"));
    }

    #[test]
    fn test_user_tie_on_ts_prefers_later_record() {
        let events = vec![
            play(3, 1541903636796, "x", "y", 1.0, "free"),
            play(3, 1541903636796, "x", "y", 1.0, "paid"),
            EventRecord {
                ts: None,
                ..play(3, 0, "x", "y", 1.0, "gold")
            },
        ];
        let star = transformer(JoinPredicate::Title).transform(&[], &events);
        assert_eq!(star.users.len(), 1);
        assert_eq!(star.users[0].level.as_deref(), Some("paid"));
    }

    #[test]
    fn test_time_dimension_covers_every_play() {
        let star = transformer(JoinPredicate::TitleArtist).transform(&sample_songs(), &sample_events());

        let starts: Vec<_> = star.time.iter().map(|t| t.start_time).collect();
        assert_eq!(
            starts,
            vec![1541000000000, 1541903636796, 1541990000000, 1542241826796]
        );
        for row in &star.time {
            assert_eq!(Some(row.parts), TimeParts::from_epoch_millis(row.start_time));
        }
    }

    #[test]
    fn test_songplays_match_title_and_artist() {
        let star = transformer(JoinPredicate::TitleArtist).transform(&sample_songs(), &sample_events());

        let facts: Vec<_> = star
            .songplays
            .iter()
            .map(|f| (f.songplay_id, f.user_id, f.song_id.as_str(), f.artist_id.as_str()))
            .collect();
        // ts tie between the first two plays is broken by input position;
        // "Harmony" resolves to the smallest song_id
        assert_eq!(
            facts,
            vec![
                (0, 7, "SOA", "AR1"),
                (1, 8, "SOC", "AR2"),
                (2, 7, "SOC", "AR2"),
            ]
        );
        assert_eq!(star.songplays[0].year, 2018);
        assert_eq!(star.songplays[0].month, 11);
        assert_eq!(star.songplays[1].session_id, Some(108));
    }

    #[test]
    fn test_duration_predicate_narrows_matches() {
        let mut events = sample_events();
        events[0].length = Some(200.0005);
        let star = transformer(JoinPredicate::TitleArtistDuration).transform(&sample_songs(), &events);

        let first = &star.songplays[0];
        assert_eq!(first.song_id, "SOB");

        events[0].length = Some(200.01);
        let star = transformer(JoinPredicate::TitleArtistDuration).transform(&sample_songs(), &events);
        assert!(star.songplays.iter().all(|f| f.user_id != 7 || f.song_id != "SOB"));
    }

    #[test]
    fn test_title_predicate_ignores_artist() {
        let mut events = sample_events();
        events[1].artist = Some("Somebody Else".to_string());

        let strict = transformer(JoinPredicate::TitleArtist).transform(&sample_songs(), &events);
        let loose = transformer(JoinPredicate::Title).transform(&sample_songs(), &events);
        assert_eq!(strict.songplays.len(), 2);
        assert_eq!(loose.songplays.len(), 3);
    }

    #[test]
    fn test_foreign_keys_resolve() {
        let star = transformer(JoinPredicate::Title).transform(&sample_songs(), &sample_events());

        let songs: HashSet<_> = star.songs.iter().map(|s| s.song_id.as_str()).collect();
        let artists: HashSet<_> = star.artists.iter().map(|a| a.artist_id.as_str()).collect();
        let users: HashSet<_> = star.users.iter().map(|u| u.user_id).collect();
        let times: HashSet<_> = star.time.iter().map(|t| t.start_time).collect();

        assert!(!star.songplays.is_empty());
        for fact in &star.songplays {
            assert!(songs.contains(fact.song_id.as_str()));
            assert!(artists.contains(fact.artist_id.as_str()));
            assert!(users.contains(&fact.user_id));
            assert!(times.contains(&fact.start_time));
        }
    }

    #[test]
    fn test_transform_is_deterministic() {
        let t = transformer(JoinPredicate::TitleArtist);
        assert_eq!(
            t.transform(&sample_songs(), &sample_events()),
            t.transform(&sample_songs(), &sample_events())
        );
    }

    #[test]
    fn test_empty_input() {
        let star = transformer(JoinPredicate::TitleArtist).transform(&[], &[]);
        assert_eq!(star, StarSchema::default());
    }

    #[test]
    fn test_invalid_tolerance_is_rejected() {
        for tolerance in [-1.0, f64::NAN, f64::INFINITY] {
            let settings = TransformSettings {
                join: JoinPredicate::TitleArtistDuration,
                duration_tolerance: tolerance,
            };
            assert!(matches!(
                StarSchemaTransformer::new(&settings),
                Err(common::Error::InvalidInput(_))
            ));
        }
    }
}
