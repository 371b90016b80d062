use super::Operator;
use crate::connector::{Connectors, Rows};
use crate::context::RunContext;
use crate::error::{QualityCheckError, TaskError};
use crate::statement::{Identifier, Statement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QualityPredicate {
    /// `row_count > 0`
    NonEmpty,
    /// `row_count >= n`
    MinRows(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRule {
    pub table: Identifier,
    pub predicate: QualityPredicate,
}

impl QualityRule {
    pub fn non_empty(table: Identifier) -> Self {
        Self {
            table,
            predicate: QualityPredicate::NonEmpty,
        }
    }

    /// Checks the result of `SELECT COUNT(*)` and returns the row count.
    pub fn evaluate(&self, rows: &Rows) -> Result<u64, QualityCheckError> {
        let table = self.table.to_string();
        let value = rows
            .first()
            .and_then(|row| row.first())
            .filter(|value| !value.is_null())
            .ok_or_else(|| QualityCheckError::NoResult {
                table: table.clone(),
            })?;

        let count = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| QualityCheckError::UnexpectedValue {
            table: table.clone(),
            value: value.to_string(),
        })?;

        match self.predicate {
            QualityPredicate::NonEmpty if count == 0 => Err(QualityCheckError::EmptyTable { table }),
            QualityPredicate::MinRows(min) if count < min => {
                Err(QualityCheckError::BelowMinimum { table, count, min })
            }
            _ => Ok(count),
        }
    }
}

/// Terminal gate: every rule must pass, the first failure aborts the check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheckConfig {
    pub rules: Vec<QualityRule>,
}

impl QualityCheckConfig {
    pub fn non_empty<I>(tables: I) -> Self
    where
        I: IntoIterator<Item = Identifier>,
    {
        Self {
            rules: tables.into_iter().map(QualityRule::non_empty).collect(),
        }
    }
}

#[async_trait]
impl Operator for QualityCheckConfig {
    async fn execute(&self, ctx: &RunContext, connectors: &Connectors) -> Result<(), TaskError> {
        let mut session = connectors.warehouse.acquire(ctx.credentials_ref()).await?;

        for rule in &self.rules {
            let rows = session
                .execute(&Statement::CountRows {
                    table: rule.table.clone(),
                })
                .await
                .map_err(|source| QualityCheckError::Query {
                    table: rule.table.to_string(),
                    source,
                })?;

            match rule.evaluate(&rows) {
                Ok(count) => {
                    info!(table = %rule.table, records = count, "data quality check passed");
                }
                Err(e) => {
                    error!(table = %rule.table, error = %e, "data quality check failed");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    fn plan(&self, _ctx: &RunContext) -> Result<Vec<Statement>, TaskError> {
        Ok(self
            .rules
            .iter()
            .map(|rule| Statement::CountRows {
                table: rule.table.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryObjectStore, MemoryWarehouse};
    use crate::operators::testing::{connectors, ctx, row, warehouse_with};
    use serde_json::json;

    fn ident(name: &str) -> Identifier {
        Identifier::new(name).unwrap()
    }

    fn warehouse() -> MemoryWarehouse {
        let warehouse = warehouse_with(MemoryObjectStore::new());
        warehouse.insert_rows("songplays", vec![row(json!({"id": 1}))]);
        warehouse.insert_rows("users", vec![row(json!({"id": 1}))]);
        warehouse.create_table("songs");
        warehouse
    }

    #[test]
    fn evaluates_count_results() {
        let rule = QualityRule::non_empty(ident("users"));
        assert_eq!(rule.evaluate(&vec![vec![json!(42)]]), Ok(42));
        assert_eq!(rule.evaluate(&vec![vec![json!("7")]]), Ok(7));
        assert_eq!(
            rule.evaluate(&vec![vec![json!(0)]]),
            Err(QualityCheckError::EmptyTable {
                table: "users".to_string()
            })
        );
        assert_eq!(
            rule.evaluate(&vec![]),
            Err(QualityCheckError::NoResult {
                table: "users".to_string()
            })
        );
        assert_eq!(
            rule.evaluate(&vec![vec![]]),
            Err(QualityCheckError::NoResult {
                table: "users".to_string()
            })
        );
        assert!(matches!(
            rule.evaluate(&vec![vec![json!("many")]]),
            Err(QualityCheckError::UnexpectedValue { .. })
        ));
    }

    #[test]
    fn min_rows_predicate() {
        let rule = QualityRule {
            table: ident("users"),
            predicate: QualityPredicate::MinRows(10),
        };
        assert_eq!(
            rule.evaluate(&vec![vec![json!(3)]]),
            Err(QualityCheckError::BelowMinimum {
                table: "users".to_string(),
                count: 3,
                min: 10
            })
        );
        assert_eq!(rule.evaluate(&vec![vec![json!(10)]]), Ok(10));
    }

    #[tokio::test]
    async fn passes_when_every_table_has_rows() {
        let warehouse = warehouse();
        let check = QualityCheckConfig::non_empty([ident("songplays"), ident("users")]);
        check
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_table_fails_and_stops_checking() {
        let warehouse = warehouse();
        let check =
            QualityCheckConfig::non_empty([ident("songplays"), ident("songs"), ident("users")]);

        let err = check
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::QualityCheck(QualityCheckError::EmptyTable {
                table: "songs".to_string()
            })
        );
        assert_eq!(warehouse.executed().len(), 2);
    }

    #[tokio::test]
    async fn missing_result_is_distinct_from_empty_table() {
        let warehouse = warehouse();
        warehouse.return_no_rows_for_count("users");
        let check = QualityCheckConfig::non_empty([ident("users")]);

        let err = check
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::QualityCheck(QualityCheckError::NoResult {
                table: "users".to_string()
            })
        );
    }

    #[tokio::test]
    async fn query_failure_names_the_table() {
        let warehouse = warehouse();
        let check = QualityCheckConfig::non_empty([ident("artists")]);

        let err = check
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TaskError::QualityCheck(QualityCheckError::Query { ref table, .. }) if table == "artists"
        ));
    }
}
