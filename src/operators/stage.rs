use super::Operator;
use crate::connector::{BulkLoadRequest, Connectors};
use crate::context::{RunContext, object_uri};
use crate::error::{BulkLoadError, TaskError, TemplateError};
use crate::statement::{Identifier, Statement};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Copies raw objects for the run window into a staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub table: Identifier,
    pub bucket: String,
    /// Object key, may contain window placeholders such as `{year}/{month}`.
    pub key_template: String,
    pub region: String,
    /// Serialization clause handed to the loader, e.g. `JSON 'auto'`.
    pub format_spec: String,
}

impl StageConfig {
    pub fn source_uri(&self, ctx: &RunContext) -> Result<String, TemplateError> {
        let key = ctx.render(&self.key_template)?;
        object_uri(&self.bucket, &key)
    }
}

#[async_trait]
impl Operator for StageConfig {
    async fn execute(&self, ctx: &RunContext, connectors: &Connectors) -> Result<(), TaskError> {
        let source_uri = self.source_uri(ctx)?;
        let credentials = connectors
            .credentials
            .resolve(ctx.credentials_ref())
            .await?;

        {
            let mut session = connectors
                .warehouse
                .acquire(ctx.credentials_ref())
                .await
                .map_err(BulkLoadError::from)?;
            info!(table = %self.table, "clearing staging table");
            session
                .execute(&Statement::Truncate {
                    table: self.table.clone(),
                })
                .await
                .map_err(BulkLoadError::from)?;
        }

        info!(table = %self.table, source = %source_uri, "copying objects into staging table");
        connectors
            .bulk_loader
            .load(&BulkLoadRequest {
                credentials_ref: ctx.credentials_ref().clone(),
                source_uri,
                target_table: self.table.clone(),
                format_spec: self.format_spec.clone(),
                region: self.region.clone(),
                access_key: credentials.access_key,
                secret_key: credentials.secret_key,
            })
            .await?;

        info!(table = %self.table, "staging finished");
        Ok(())
    }

    fn plan(&self, ctx: &RunContext) -> Result<Vec<Statement>, TaskError> {
        Ok(vec![
            Statement::Truncate {
                table: self.table.clone(),
            },
            Statement::Copy {
                table: self.table.clone(),
                source_uri: self.source_uri(ctx)?,
                access_key: "***".to_string(),
                secret_key: "***".to_string(),
                format_spec: self.format_spec.clone(),
                region: self.region.clone(),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{
        AwsCredentials, StaticCredentials, WarehousePool, WarehouseSession,
    };
    use crate::context::CredentialsRef;
    use crate::error::WarehouseError;
    use crate::memory::{MemoryObjectStore, MemoryWarehouse};
    use crate::operators::testing::{connectors, ctx, row, warehouse_with};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Remembers the reference every session was opened with.
    struct RecordingPool {
        inner: MemoryWarehouse,
        acquired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WarehousePool for RecordingPool {
        async fn acquire(
            &self,
            credentials: &CredentialsRef,
        ) -> Result<Box<dyn WarehouseSession>, WarehouseError> {
            self.acquired
                .lock()
                .unwrap()
                .push(credentials.as_str().to_string());
            self.inner.acquire(credentials).await
        }
    }

    fn events_stage() -> StageConfig {
        StageConfig {
            table: Identifier::new("staging_events").unwrap(),
            bucket: "udacity-dend".to_string(),
            key_template: "log_data/{year}/{month}/".to_string(),
            region: "us-west-2".to_string(),
            format_spec: "JSON 's3://udacity-dend/log_json_path.json'".to_string(),
        }
    }

    fn store() -> MemoryObjectStore {
        let store = MemoryObjectStore::new();
        store.put(
            "s3://udacity-dend/log_data/2018/11/2018-11-01-events.json",
            vec![row(json!({"userId": "1"})), row(json!({"userId": "2"}))],
        );
        store.put(
            "s3://udacity-dend/log_data/2018/10/2018-10-31-events.json",
            vec![row(json!({"userId": "9"}))],
        );
        store
    }

    #[test]
    fn source_uri_uses_window_start() {
        assert_eq!(
            events_stage().source_uri(&ctx()).unwrap(),
            "s3://udacity-dend/log_data/2018/11/"
        );
    }

    #[tokio::test]
    async fn rerunning_stage_yields_identical_table() {
        let warehouse = warehouse_with(store());
        warehouse.create_table("staging_events");
        let connectors = connectors(&warehouse);
        let stage = events_stage();

        stage.execute(&ctx(), &connectors).await.unwrap();
        let first = warehouse.rows("staging_events");
        stage.execute(&ctx(), &connectors).await.unwrap();
        let second = warehouse.rows("staging_events");

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(warehouse.open_sessions(), 0);
    }

    #[tokio::test]
    async fn truncates_before_copy() {
        let warehouse = warehouse_with(store());
        warehouse.insert_rows("staging_events", vec![row(json!({"stale": true}))]);

        events_stage()
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap();

        let executed = warehouse.executed();
        assert!(matches!(executed[0], Statement::Truncate { .. }));
        assert!(matches!(executed[1], Statement::Copy { .. }));
        assert!(
            warehouse
                .rows("staging_events")
                .iter()
                .all(|r| !r.contains_key("stale"))
        );
    }

    #[tokio::test]
    async fn january_prefix_stops_at_the_month_segment() {
        let store = store();
        store.put(
            "s3://udacity-dend/log_data/2018/1/2018-01-15-events.json",
            vec![row(json!({"userId": "42"}))],
        );
        let warehouse = warehouse_with(store);
        warehouse.create_table("staging_events");
        let january = RunContext::hourly(
            Utc.with_ymd_and_hms(2018, 1, 15, 9, 0, 0).unwrap(),
            CredentialsRef::new("aws_credentials"),
        );

        events_stage()
            .execute(&january, &connectors(&warehouse))
            .await
            .unwrap();

        let rows = warehouse.rows("staging_events");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["userId"], json!("42"));
    }

    #[tokio::test]
    async fn missing_prefix_is_a_bulk_load_error() {
        let warehouse = warehouse_with(MemoryObjectStore::new());
        warehouse.create_table("staging_events");

        let err = events_stage()
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::BulkLoad(BulkLoadError::Load { .. })));
    }

    #[tokio::test]
    async fn bad_template_fails_before_touching_the_warehouse() {
        let warehouse = warehouse_with(store());
        warehouse.create_table("staging_events");
        let stage = StageConfig {
            key_template: "log_data/{execution_date.year}".to_string(),
            ..events_stage()
        };

        let err = stage
            .execute(&ctx(), &connectors(&warehouse))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Template(_)));
        assert!(warehouse.executed().is_empty());
    }

    #[tokio::test]
    async fn every_session_uses_the_run_credentials() {
        let warehouse = warehouse_with(store());
        warehouse.create_table("staging_events");
        let pool = Arc::new(RecordingPool {
            inner: warehouse.clone(),
            acquired: Mutex::new(Vec::new()),
        });
        let connectors = Connectors::with_copy_loader(
            pool.clone(),
            Arc::new(StaticCredentials::new(AwsCredentials::new("AKIA", "secret"))),
        );
        let ctx = RunContext::hourly(
            Utc.with_ymd_and_hms(2018, 11, 1, 0, 0, 0).unwrap(),
            CredentialsRef::new("tenant_b"),
        );

        events_stage().execute(&ctx, &connectors).await.unwrap();

        let acquired = pool.acquired.lock().unwrap().clone();
        assert_eq!(acquired, vec!["tenant_b", "tenant_b"]);
        assert_eq!(warehouse.row_count("staging_events"), Some(2));
    }

    #[test]
    fn plan_masks_credentials() {
        let plan = events_stage().plan(&ctx()).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[1].to_sql().contains("ACCESS_KEY_ID '***'"));
    }
}
