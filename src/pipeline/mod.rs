//! The hourly star schema pipeline: two staging copies, one fact load, four
//! dimension loads and a quality gate over the five star tables.

pub mod sql;
pub mod transforms;

use crate::config::PipelineConfig;
use crate::error::DefinitionError;
use crate::graph::Graph;
use crate::memory::{MemoryObjectStore, MemoryWarehouse, Row, Tables};
use crate::operators::{LoadConfig, QualityCheckConfig, StageConfig};
use crate::statement::Identifier;
use crate::task::Task;

pub const BEGIN_EXECUTION: &str = "Begin_execution";
pub const STAGE_EVENTS: &str = "Stage_events";
pub const STAGE_SONGS: &str = "Stage_songs";
pub const LOAD_SONGPLAYS: &str = "Load_songplays_fact_table";
pub const LOAD_USER_DIM: &str = "Load_user_dim_table";
pub const LOAD_SONG_DIM: &str = "Load_song_dim_table";
pub const LOAD_ARTIST_DIM: &str = "Load_artist_dim_table";
pub const LOAD_TIME_DIM: &str = "Load_time_dim_table";
pub const RUN_QUALITY_CHECKS: &str = "Run_data_quality_checks";

pub const STAGING_TABLES: [&str; 2] = ["staging_events", "staging_songs"];
pub const STAR_TABLES: [&str; 5] = ["songplays", "users", "songs", "artists", "time"];

/// Builds and validates the pipeline graph for `config`.
pub fn star_schema(config: &PipelineConfig) -> Result<Graph, DefinitionError> {
    let storage = &config.storage;
    let dimensions = [
        (LOAD_USER_DIM, "users", sql::USER_TABLE_INSERT),
        (LOAD_SONG_DIM, "songs", sql::SONG_TABLE_INSERT),
        (LOAD_ARTIST_DIM, "artists", sql::ARTIST_TABLE_INSERT),
        (LOAD_TIME_DIM, "time", sql::TIME_TABLE_INSERT),
    ];

    let mut tasks = vec![
        Task::barrier(BEGIN_EXECUTION),
        Task::stage(
            STAGE_EVENTS,
            StageConfig {
                table: Identifier::new("staging_events")?,
                bucket: storage.bucket.clone(),
                key_template: storage.events_key.clone(),
                region: storage.region.clone(),
                format_spec: storage.events_format.clone(),
            },
        )
        .depends_on([BEGIN_EXECUTION]),
        Task::stage(
            STAGE_SONGS,
            StageConfig {
                table: Identifier::new("staging_songs")?,
                bucket: storage.bucket.clone(),
                key_template: storage.songs_key.clone(),
                region: storage.region.clone(),
                format_spec: storage.songs_format.clone(),
            },
        )
        .depends_on([BEGIN_EXECUTION]),
        Task::load_fact(
            LOAD_SONGPLAYS,
            LoadConfig::fact(Identifier::new("songplays")?, sql::SONGPLAY_TABLE_INSERT),
        )
        .depends_on([STAGE_EVENTS, STAGE_SONGS]),
    ];

    for (task_id, table, select) in dimensions {
        tasks.push(
            Task::load_dimension(task_id, LoadConfig::dimension(Identifier::new(table)?, select))
                .depends_on([LOAD_SONGPLAYS]),
        );
    }

    let quality_tables = STAR_TABLES
        .iter()
        .map(|table| Identifier::new(*table))
        .collect::<Result<Vec<_>, _>>()?;
    tasks.push(
        Task::quality_check(RUN_QUALITY_CHECKS, QualityCheckConfig::non_empty(quality_tables))
            .depends_on([LOAD_SONGPLAYS])
            .depends_on(dimensions.iter().map(|(task_id, _, _)| *task_id)),
    );

    let policy = config.retry.policy();
    let graph = Graph::from_tasks(tasks.into_iter().map(|task| task.retry_policy(policy)))?;
    graph.validate_quality_gate()?;
    Ok(graph)
}

/// A warehouse with the staging and star tables created and every load's
/// `SELECT` answered by its in-memory transform.
pub fn memory_warehouse(store: MemoryObjectStore) -> MemoryWarehouse {
    let warehouse = MemoryWarehouse::new().with_object_store(store);
    for table in STAGING_TABLES.iter().chain(STAR_TABLES.iter()) {
        warehouse.create_table(table);
    }

    let loads: [(&str, fn(&Tables) -> Vec<Row>); 5] = [
        ("songplays", transforms::songplays),
        ("users", transforms::users),
        ("songs", transforms::songs),
        ("artists", transforms::artists),
        ("time", transforms::time),
    ];
    for (table, transform) in loads {
        warehouse.register_transform(table, transform);
    }
    warehouse
}
