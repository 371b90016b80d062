use super::Operator;
use crate::connector::Connectors;
use crate::context::RunContext;
use crate::error::TaskError;
use crate::statement::{Identifier, Statement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Inserts the result of `select` into `table`, optionally clearing it first.
///
/// Dimension loads truncate by default and are therefore safe to re-run.
/// Fact loads append by default; re-running one without `truncate` inserts
/// the rows again, so avoiding duplicates is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub table: Identifier,
    pub select: String,
    pub truncate: bool,
}

impl LoadConfig {
    pub fn fact(table: Identifier, select: impl Into<String>) -> Self {
        Self {
            table,
            select: select.into(),
            truncate: false,
        }
    }

    pub fn dimension(table: Identifier, select: impl Into<String>) -> Self {
        Self {
            table,
            select: select.into(),
            truncate: true,
        }
    }

    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    fn statements(&self) -> Vec<Statement> {
        let mut statements = Vec::with_capacity(2);
        if self.truncate {
            statements.push(Statement::Truncate {
                table: self.table.clone(),
            });
        }
        statements.push(Statement::InsertSelect {
            table: self.table.clone(),
            select: self.select.clone(),
        });
        statements
    }
}

#[async_trait]
impl Operator for LoadConfig {
    async fn execute(&self, ctx: &RunContext, connectors: &Connectors) -> Result<(), TaskError> {
        let mut session = connectors.warehouse.acquire(ctx.credentials_ref()).await?;

        for statement in self.statements() {
            match &statement {
                Statement::Truncate { table } => info!(table = %table, "clearing target table"),
                _ => info!(table = %self.table, "inserting from staging tables"),
            }
            session.execute(&statement).await?;
        }

        info!(table = %self.table, "load finished");
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> Result<Vec<Statement>, TaskError> {
        Ok(self.statements())
    }
}
