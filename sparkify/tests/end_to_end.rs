use arrow::array::AsArray;
use arrow::datatypes::Int64Type;
use common::config::Settings;
use common::storage::{LocalStorage, ObjectStorage};
use serde_json::json;
use sparkify::processor::storage::StorageManager;
use sparkify::schema::StarTable;
use sparkify::services::{OutputFormat, QueryService};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_json_lines(path: &Path, values: &[serde_json::Value]) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let body: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    std::fs::write(path, body.join("\n")).unwrap();
}

fn song(song_id: &str, title: &str, artist_id: &str, artist_name: &str, duration: f64, year: i32) -> serde_json::Value {
    json!({
        "num_songs": 1,
        "artist_id": artist_id,
        "artist_latitude": null,
        "artist_longitude": null,
        "artist_location": "",
        "artist_name": artist_name,
        "song_id": song_id,
        "title": title,
        "duration": duration,
        "year": year
    })
}

fn event(user_id: serde_json::Value, page: &str, song: &str, artist: &str, length: f64, ts: i64, level: &str) -> serde_json::Value {
    json!({
        "artist": artist,
        "auth": "Logged In",
        "firstName": "Kaylee",
        "gender": "F",
        "itemInSession": 0,
        "lastName": "Summers",
        "length": length,
        "level": level,
        "location": "Phoenix-Mesa-Scottsdale, AZ",
        "method": "PUT",
        "page": page,
        "registration": 1540344794796.0,
        "sessionId": 139,
        "song": song,
        "status": 200,
        "ts": ts,
        "userAgent": "Mozilla/5.0",
        "userId": user_id
    })
}

/// Three catalog songs, five plays (two unmatched) and some noise.
fn seed_source(root: &Path) {
    let songs = root.join("song_data/A/B/C");
    write_json_lines(&songs.join("TRAAA.json"), &[song("SOA", "Song A", "AR1", "Artist One", 200.0, 2001)]);
    write_json_lines(&songs.join("TRAAB.json"), &[song("SOB", "Song B", "AR1", "Artist One", 150.0, 0)]);
    write_json_lines(&songs.join("TRAAC.json"), &[song("SOC", "Song C", "AR2", "Artist Two", 180.0, 2005)]);
    std::fs::write(songs.join("TRAAD.json"), "{not json").unwrap();

    write_json_lines(
        &root.join("log_data/2018/11/2018-11-01-events.json"),
        &[
            event(json!(7), "NextSong", "Song A", "Artist One", 200.0, 1541105830796, "free"),
            event(json!("8"), "NextSong", "Song C", "Artist Two", 180.0, 1541106106796, "paid"),
            event(json!(7), "Home", "", "", 0.0, 1541106200000, "free"),
            event(json!(""), "NextSong", "Song A", "Artist One", 200.0, 1541106300000, "free"),
            event(json!(7), "NextSong", "Song C", "Artist Two", 180.0, 1541107053796, "paid"),
            event(json!(8), "NextSong", "Song A", "Someone Else", 200.0, 1541107100000, "paid"),
        ],
    );
    write_json_lines(
        &root.join("log_data/2018/12/2018-12-01-events.json"),
        &[event(json!(9), "NextSong", "Unknown", "Nobody", 10.0, 1543622400000, "free")],
    );
}

fn settings(source: &Path, output: &Path) -> Settings {
    Settings::from_toml(&format!(
        r#"
        [source]
        kind = "local"
        location = "{}"

        [output]
        kind = "local"
        location = "{}"
        prefix = "lake"

        [pipeline]
        retries = 0
        retry_delay_ms = 0
        "#,
        source.display(),
        output.display()
    ))
    .unwrap()
}

async fn snapshot(root: &Path) -> Vec<(String, Vec<u8>)> {
    let storage = LocalStorage::new(root).await.unwrap();
    let mut files = Vec::new();
    for key in storage.list_objects("lake").await.unwrap() {
        let data = storage.get_object(&key).await.unwrap();
        files.push((key, data));
    }
    files.sort();
    files
}

#[tokio::test]
async fn test_lake_and_warehouse_runs_agree() {
    let source = TempDir::new().unwrap();
    seed_source(source.path());
    let lake_out = TempDir::new().unwrap();
    let warehouse_out = TempDir::new().unwrap();

    let lake = sparkify::run_lake_pipeline(&settings(source.path(), lake_out.path()))
        .await
        .unwrap();
    assert_eq!(lake.songs_read, 3);
    assert_eq!(lake.events_read, 7);
    assert_eq!(lake.malformed, 1);
    assert!(lake.quality.passed());
    assert!(lake.tasks.is_empty());

    let rows: Vec<(StarTable, usize)> = lake.tables.iter().map(|t| (t.table, t.rows)).collect();
    assert!(rows.contains(&(StarTable::Songplays, 3)));
    assert!(rows.contains(&(StarTable::Users, 3)));
    assert!(rows.contains(&(StarTable::Songs, 3)));
    assert!(rows.contains(&(StarTable::Artists, 2)));
    assert!(rows.contains(&(StarTable::Time, 5)));

    let warehouse = sparkify::run_warehouse_pipeline(&settings(source.path(), warehouse_out.path()))
        .await
        .unwrap();
    assert!(warehouse.quality.passed());
    assert_eq!(warehouse.tasks.len(), 10);

    let lake_files = snapshot(lake_out.path()).await;
    let warehouse_files = snapshot(warehouse_out.path()).await;
    assert!(!lake_files.is_empty());
    assert_eq!(lake_files, warehouse_files);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let source = TempDir::new().unwrap();
    seed_source(source.path());
    let output = TempDir::new().unwrap();
    let settings = settings(source.path(), output.path());

    sparkify::run_lake_pipeline(&settings).await.unwrap();
    let first = snapshot(output.path()).await;
    sparkify::run_lake_pipeline(&settings).await.unwrap();
    assert_eq!(first, snapshot(output.path()).await);
}

#[tokio::test]
async fn test_partitioned_layout_and_markers() {
    let source = TempDir::new().unwrap();
    seed_source(source.path());
    let output = TempDir::new().unwrap();
    sparkify::run_lake_pipeline(&settings(source.path(), output.path()))
        .await
        .unwrap();

    let keys: Vec<String> = snapshot(output.path()).await.into_iter().map(|(k, _)| k).collect();
    assert!(keys.contains(&"lake/songplays/year=2018/month=11/part-00000.parquet".to_string()));
    assert!(keys.contains(&"lake/songs/year=2001/artist_id=AR1/part-00000.parquet".to_string()));
    assert!(keys.contains(&"lake/songs/year=0/artist_id=AR1/part-00000.parquet".to_string()));
    assert!(keys.contains(&"lake/time/year=2018/month=12/part-00000.parquet".to_string()));
    assert!(keys.contains(&"lake/users/part-00000.parquet".to_string()));
    assert!(keys.contains(&"lake/artists/_SUCCESS".to_string()));

    let storage: Arc<dyn ObjectStorage> = Arc::new(LocalStorage::new(output.path()).await.unwrap());
    let marker = StorageManager::new(storage, "lake")
        .read_marker(StarTable::Songplays)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(marker.rows, 3);
    assert_eq!(marker.mode, "overwrite");
    assert_eq!(marker.files.len(), 1);
}

#[tokio::test]
async fn test_query_service_reads_the_lake() {
    let source = TempDir::new().unwrap();
    seed_source(source.path());
    let output = TempDir::new().unwrap();
    let settings = settings(source.path(), output.path());
    sparkify::run_lake_pipeline(&settings).await.unwrap();

    let service = QueryService::new(&settings).await.unwrap();
    assert_eq!(service.tables().len(), 5);

    let batches = service
        .execute(
            "SELECT COUNT(*) FROM songplays sp \
             JOIN songs s ON sp.song_id = s.song_id \
             WHERE s.title = 'Song C'",
        )
        .await
        .unwrap();
    assert_eq!(batches[0].column(0).as_primitive::<Int64Type>().value(0), 2);

    let json = sparkify::run_query(
        &settings,
        "SELECT user_id, level FROM users ORDER BY user_id",
        OutputFormat::Json,
    )
    .await
    .unwrap();
    let users: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
    assert_eq!(users.len(), 3);
    assert_eq!(users[0]["user_id"], 7);
    assert_eq!(users[0]["level"], "paid");
    assert_eq!(users[1]["user_id"], 8);
}
