pub mod config;
pub mod connector;
pub mod context;
pub mod cycle_check;
pub mod error;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod operators;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod statement;
pub mod task;

pub use config::{PipelineConfig, load_config};
pub use connector::{
    AwsCredentials, BulkLoadRequest, BulkLoader, Connectors, CopyCommandLoader,
    CredentialsProvider, Rows, StaticCredentials, WarehousePool, WarehouseSession,
};
pub use context::{CredentialsRef, RunContext, object_uri};
pub use cycle_check::find_cycle;
pub use error::{
    BulkLoadError, ConfigError, DefinitionError, GraphError, InvalidIdentifier, InvalidWindow,
    QualityCheckError, TaskError, TemplateError, WarehouseError,
};
pub use executor::Executor;
pub use graph::Graph;
pub use memory::{MemoryObjectStore, MemoryWarehouse, Row};
pub use operators::{
    Barrier, LoadConfig, Operator, QualityCheckConfig, QualityPredicate, QualityRule, StageConfig,
};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};
pub use state::{RunResult, RunStatus, TaskState, TaskStatus};
pub use statement::{Identifier, Statement};
pub use task::{Task, TaskKind};
