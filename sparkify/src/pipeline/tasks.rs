use super::{Dag, Task};
use crate::models::StarTables;
use crate::processor::quality::{QualityChecker, QualityReport};
use crate::processor::warehouse::WarehouseLoader;
use crate::schema::StarTable;
use async_trait::async_trait;
use common::Result;
use etl::{EventRecord, SongRecord};
use tokio::sync::Mutex;
use tracing::info;

pub const BEGIN_EXECUTION: &str = "begin_execution";
pub const STAGE_EVENTS: &str = "stage_events";
pub const STAGE_SONGS: &str = "stage_songs";
pub const LOAD_SONGPLAYS_FACT: &str = "load_songplays_fact";
pub const LOAD_SONG_DIM: &str = "load_song_dim";
pub const LOAD_ARTIST_DIM: &str = "load_artist_dim";
pub const LOAD_USER_DIM: &str = "load_user_dim";
pub const LOAD_TIME_DIM: &str = "load_time_dim";
pub const RUN_QUALITY_CHECKS: &str = "run_quality_checks";
pub const STOP_EXECUTION: &str = "stop_execution";

/// Everything the warehouse tasks share during one run.
pub struct PipelineState {
    pub loader: WarehouseLoader,
    pub checker: QualityChecker,
    pub songs: Vec<SongRecord>,
    pub events: Vec<EventRecord>,
    pub tables: Mutex<StarTables>,
    pub report: Mutex<Option<QualityReport>>,
}

impl PipelineState {
    pub fn new(
        loader: WarehouseLoader,
        checker: QualityChecker,
        songs: Vec<SongRecord>,
        events: Vec<EventRecord>,
    ) -> Self {
        Self {
            loader,
            checker,
            songs,
            events,
            tables: Mutex::new(StarTables::default()),
            report: Mutex::new(None),
        }
    }
}

/// No-op boundary task.
struct Marker(&'static str);

#[async_trait]
impl Task<PipelineState> for Marker {
    fn name(&self) -> &str {
        self.0
    }

    async fn run(&self, _state: &PipelineState) -> Result<()> {
        info!(task = self.0, "Reached pipeline boundary");
        Ok(())
    }
}

struct StageEvents;

#[async_trait]
impl Task<PipelineState> for StageEvents {
    fn name(&self) -> &str {
        STAGE_EVENTS
    }

    async fn run(&self, state: &PipelineState) -> Result<()> {
        state.loader.stage_events(&state.events)?;
        Ok(())
    }
}

struct StageSongs;

#[async_trait]
impl Task<PipelineState> for StageSongs {
    fn name(&self) -> &str {
        STAGE_SONGS
    }

    async fn run(&self, state: &PipelineState) -> Result<()> {
        state.loader.stage_songs(&state.songs)?;
        Ok(())
    }
}

/// Loads one star table; the fact table goes through its own query.
struct LoadTable {
    name: &'static str,
    table: StarTable,
}

#[async_trait]
impl Task<PipelineState> for LoadTable {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, state: &PipelineState) -> Result<()> {
        let batch = if self.table.is_fact() {
            state.loader.load_fact().await?
        } else {
            state.loader.load_dimension(self.table).await?
        };
        state.tables.lock().await.insert(self.table, batch)
    }
}

struct RunQualityChecks;

#[async_trait]
impl Task<PipelineState> for RunQualityChecks {
    fn name(&self) -> &str {
        RUN_QUALITY_CHECKS
    }

    async fn run(&self, state: &PipelineState) -> Result<()> {
        let report = state.checker.run(state.loader.context()).await?;
        *state.report.lock().await = Some(report);
        Ok(())
    }
}

/// The staged-load DAG. The fact load waits for the song and artist
/// dimensions it joins against; every load feeds the quality checks.
pub fn warehouse_dag() -> Result<Dag<PipelineState>> {
    let mut dag = Dag::new("sparkify_warehouse");

    dag.add_task(Marker(BEGIN_EXECUTION))?;
    dag.add_task(StageEvents)?;
    dag.add_task(StageSongs)?;
    for (name, table) in [
        (LOAD_SONG_DIM, StarTable::Songs),
        (LOAD_ARTIST_DIM, StarTable::Artists),
        (LOAD_USER_DIM, StarTable::Users),
        (LOAD_TIME_DIM, StarTable::Time),
        (LOAD_SONGPLAYS_FACT, StarTable::Songplays),
    ] {
        dag.add_task(LoadTable { name, table })?;
    }
    dag.add_task(RunQualityChecks)?;
    dag.add_task(Marker(STOP_EXECUTION))?;

    let dimensions = [LOAD_SONG_DIM, LOAD_ARTIST_DIM, LOAD_USER_DIM, LOAD_TIME_DIM];
    dag.connect(&[BEGIN_EXECUTION], &[STAGE_EVENTS, STAGE_SONGS])?;
    dag.connect(&[STAGE_EVENTS, STAGE_SONGS], &dimensions)?;
    dag.connect(&[LOAD_SONG_DIM, LOAD_ARTIST_DIM], &[LOAD_SONGPLAYS_FACT])?;
    dag.connect(&dimensions, &[RUN_QUALITY_CHECKS])?;
    dag.connect(&[LOAD_SONGPLAYS_FACT], &[RUN_QUALITY_CHECKS])?;
    dag.connect(&[RUN_QUALITY_CHECKS], &[STOP_EXECUTION])?;

    Ok(dag)
}
