use crate::connector::Connectors;
use crate::context::RunContext;
use crate::error::TaskError;
use crate::operators::{Barrier, LoadConfig, Operator, QualityCheckConfig, StageConfig};
use crate::retry::RetryPolicy;
use crate::statement::Statement;
use std::collections::BTreeSet;

/// The closed set of things a task can do, each with its own configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    Stage(StageConfig),
    LoadFact(LoadConfig),
    LoadDimension(LoadConfig),
    QualityCheck(QualityCheckConfig),
    Barrier,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stage(_) => "stage",
            Self::LoadFact(_) => "load_fact",
            Self::LoadDimension(_) => "load_dimension",
            Self::QualityCheck(_) => "quality_check",
            Self::Barrier => "barrier",
        }
    }

    pub fn is_load(&self) -> bool {
        matches!(self, Self::LoadFact(_) | Self::LoadDimension(_))
    }

    fn operator(&self) -> &dyn Operator {
        match self {
            Self::Stage(config) => config,
            Self::LoadFact(config) | Self::LoadDimension(config) => config,
            Self::QualityCheck(config) => config,
            Self::Barrier => &Barrier,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: String,
    kind: TaskKind,
    upstream_ids: BTreeSet<String>,
    retry_policy: RetryPolicy,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            id: id.into(),
            kind,
            upstream_ids: BTreeSet::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn stage(id: impl Into<String>, config: StageConfig) -> Self {
        Self::new(id, TaskKind::Stage(config))
    }

    pub fn load_fact(id: impl Into<String>, config: LoadConfig) -> Self {
        Self::new(id, TaskKind::LoadFact(config))
    }

    pub fn load_dimension(id: impl Into<String>, config: LoadConfig) -> Self {
        Self::new(id, TaskKind::LoadDimension(config))
    }

    pub fn quality_check(id: impl Into<String>, config: QualityCheckConfig) -> Self {
        Self::new(id, TaskKind::QualityCheck(config))
    }

    pub fn barrier(id: impl Into<String>) -> Self {
        Self::new(id, TaskKind::Barrier)
    }

    /// Adds upstream task ids.
    pub fn depends_on<I, S>(mut self, upstream_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upstream_ids
            .extend(upstream_ids.into_iter().map(Into::into));
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub(crate) fn add_upstream(&mut self, upstream_id: String) {
        self.upstream_ids.insert(upstream_id);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn upstream_ids(&self) -> &BTreeSet<String> {
        &self.upstream_ids
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Runs one attempt of the task.
    pub async fn execute(&self, ctx: &RunContext, connectors: &Connectors) -> Result<(), TaskError> {
        self.kind.operator().execute(ctx, connectors).await
    }

    pub fn plan(&self, ctx: &RunContext) -> Result<Vec<Statement>, TaskError> {
        self.kind.operator().plan(ctx)
    }
}
