use crate::context::CredentialsRef;
use crate::error::{BulkLoadError, TaskError, WarehouseError};
use crate::statement::{Identifier, Statement};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Result rows of a warehouse statement, column values in select order.
pub type Rows = Vec<Vec<Value>>;

/// A connection checked out of a [`WarehousePool`]. Dropping the session
/// returns it to the pool.
#[async_trait]
pub trait WarehouseSession: Send {
    async fn execute(&mut self, statement: &Statement) -> Result<Rows, WarehouseError>;
}

/// Shared access to the destination warehouse. Each task attempt acquires its
/// own session for the duration of the attempt.
#[async_trait]
pub trait WarehousePool: Send + Sync {
    async fn acquire(
        &self,
        credentials: &CredentialsRef,
    ) -> Result<Box<dyn WarehouseSession>, WarehouseError>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl AwsCredentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}

#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn resolve(&self, reference: &CredentialsRef) -> Result<AwsCredentials, TaskError>;
}

/// Hands out one fixed key pair for every reference.
pub struct StaticCredentials {
    credentials: AwsCredentials,
}

impl StaticCredentials {
    pub fn new(credentials: AwsCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn resolve(&self, reference: &CredentialsRef) -> Result<AwsCredentials, TaskError> {
        if self.credentials.access_key.is_empty() || self.credentials.secret_key.is_empty() {
            return Err(TaskError::Credentials(format!(
                "no key pair configured for {reference}"
            )));
        }
        Ok(self.credentials.clone())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BulkLoadRequest {
    /// Connection the load runs over; the same one the run's other
    /// statements use.
    pub credentials_ref: CredentialsRef,
    pub source_uri: String,
    pub target_table: Identifier,
    pub format_spec: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for BulkLoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkLoadRequest")
            .field("credentials_ref", &self.credentials_ref)
            .field("source_uri", &self.source_uri)
            .field("target_table", &self.target_table)
            .field("format_spec", &self.format_spec)
            .field("region", &self.region)
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}

/// Copies every object under a source prefix into a warehouse table.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load(&self, request: &BulkLoadRequest) -> Result<(), BulkLoadError>;
}

/// Bulk loader that asks the warehouse to pull the objects itself with a
/// `COPY ... FROM 's3://...'` statement.
pub struct CopyCommandLoader {
    warehouse: Arc<dyn WarehousePool>,
}

impl CopyCommandLoader {
    pub fn new(warehouse: Arc<dyn WarehousePool>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl BulkLoader for CopyCommandLoader {
    async fn load(&self, request: &BulkLoadRequest) -> Result<(), BulkLoadError> {
        let statement = Statement::Copy {
            table: request.target_table.clone(),
            source_uri: request.source_uri.clone(),
            access_key: request.access_key.clone(),
            secret_key: request.secret_key.clone(),
            format_spec: request.format_spec.clone(),
            region: request.region.clone(),
        };
        debug!(statement = %statement, "issuing copy");

        let mut session = self.warehouse.acquire(&request.credentials_ref).await?;
        session
            .execute(&statement)
            .await
            .map_err(|e| BulkLoadError::Load {
                source_uri: request.source_uri.clone(),
                table: request.target_table.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// External collaborators handed to every task attempt.
#[derive(Clone)]
pub struct Connectors {
    pub warehouse: Arc<dyn WarehousePool>,
    pub bulk_loader: Arc<dyn BulkLoader>,
    pub credentials: Arc<dyn CredentialsProvider>,
}

impl Connectors {
    pub fn new(
        warehouse: Arc<dyn WarehousePool>,
        bulk_loader: Arc<dyn BulkLoader>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            warehouse,
            bulk_loader,
            credentials,
        }
    }

    /// Connectors that stage through the warehouse's own `COPY` command.
    pub fn with_copy_loader(
        warehouse: Arc<dyn WarehousePool>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        let bulk_loader = Arc::new(CopyCommandLoader::new(Arc::clone(&warehouse)));
        Self::new(warehouse, bulk_loader, credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_reject_empty_keys() {
        let provider = StaticCredentials::new(AwsCredentials::new("", ""));
        let err = provider
            .resolve(&CredentialsRef::new("aws_credentials"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Credentials(_)));
    }

    #[test]
    fn debug_output_masks_secrets() {
        let creds = AwsCredentials::new("AKIA", "topsecret");
        assert!(!format!("{creds:?}").contains("topsecret"));

        let request = BulkLoadRequest {
            credentials_ref: CredentialsRef::new("aws_credentials"),
            source_uri: "s3://b/k".to_string(),
            target_table: Identifier::new("staging_songs").unwrap(),
            format_spec: "JSON 'auto'".to_string(),
            region: "us-west-2".to_string(),
            access_key: "AKIA".to_string(),
            secret_key: "topsecret".to_string(),
        };
        assert!(!format!("{request:?}").contains("topsecret"));
    }
}
