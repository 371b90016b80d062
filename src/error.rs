use chrono::{DateTime, Utc};
use thiserror::Error;

/// Rejections raised while assembling a [`Graph`](crate::Graph). No run starts
/// from a definition that produced one of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("task {task} depends on unknown task {upstream}")]
    UnknownDependency { task: String, upstream: String },
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),
    #[error("invalid task id: {0:?}")]
    InvalidTaskId(String),
    #[error("graph must contain at least one task")]
    Empty,
    #[error("quality gate violation: {0}")]
    QualityGate(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid SQL identifier: {0:?}")]
pub struct InvalidIdentifier(pub String);

/// Errors raised while turning configuration into a pipeline graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Identifier(#[from] InvalidIdentifier),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("window end {end} precedes window start {start}")]
pub struct InvalidWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("unterminated placeholder in template {0:?}")]
    Unterminated(String),
    #[error("invalid bucket name {0:?}")]
    InvalidBucket(String),
    #[error("unsafe object key {0:?}")]
    UnsafeKey(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    #[error("warehouse connection error: {0}")]
    Connection(String),
    #[error("warehouse rejected statement: {0}")]
    Syntax(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BulkLoadError {
    #[error("bulk load from {source_uri} into {table} failed: {reason}")]
    Load {
        source_uri: String,
        table: String,
        reason: String,
    },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

/// Quality gate failures. A missing result set and an empty table are
/// reported as different conditions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QualityCheckError {
    #[error("data quality check failed for {table}: row count query returned no result")]
    NoResult { table: String },
    #[error("data quality check failed for {table}: table contains 0 rows")]
    EmptyTable { table: String },
    #[error("data quality check failed for {table}: {count} rows, expected at least {min}")]
    BelowMinimum { table: String, count: u64, min: u64 },
    #[error("data quality check failed for {table}: row count is not an integer: {value}")]
    UnexpectedValue { table: String, value: String },
    #[error("data quality check for {table} could not run: {source}")]
    Query {
        table: String,
        #[source]
        source: WarehouseError,
    },
}

/// Failure of a single task attempt. All variants are retried up to the
/// task's `max_attempts`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    BulkLoad(#[from] BulkLoadError),
    #[error("sql execution failed: {0}")]
    SqlExecution(#[from] WarehouseError),
    #[error(transparent)]
    QualityCheck(#[from] QualityCheckError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(String),
    #[error(transparent)]
    Figment(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
