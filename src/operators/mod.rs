mod load;
mod quality;
mod stage;

pub use load::LoadConfig;
pub use quality::{QualityCheckConfig, QualityPredicate, QualityRule};
pub use stage::StageConfig;

use crate::connector::Connectors;
use crate::context::RunContext;
use crate::error::TaskError;
use crate::statement::Statement;
use async_trait::async_trait;

/// Body of a task: one attempt against the run's connectors.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn execute(&self, ctx: &RunContext, connectors: &Connectors) -> Result<(), TaskError>;

    /// Statements an attempt would issue for `ctx`, without touching any
    /// connector. Credentials are masked.
    fn plan(&self, ctx: &RunContext) -> Result<Vec<Statement>, TaskError>;
}

/// Join point that does no work of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Barrier;

#[async_trait]
impl Operator for Barrier {
    async fn execute(&self, _ctx: &RunContext, _connectors: &Connectors) -> Result<(), TaskError> {
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> Result<Vec<Statement>, TaskError> {
        Ok(Vec::new())
    }
}
