use crate::connector::AwsCredentials;
use crate::context::CredentialsRef;
use crate::error::ConfigError;
use crate::executor::DEFAULT_MAX_CONCURRENCY;
use crate::retry::RetryPolicy;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for one deployment of the star schema pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub storage: StorageConfig,
    pub credentials: CredentialsConfig,
    pub executor: ExecutorConfig,
    pub retry: RetryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub events_key: String,
    pub events_format: String,
    pub songs_key: String,
    pub songs_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "udacity-dend".to_string(),
            region: "us-west-2".to_string(),
            events_key: "log_data/{year}/{month}/".to_string(),
            events_format: "JSON 's3://udacity-dend/log_json_path.json'".to_string(),
            songs_key: "song_data/".to_string(),
            songs_format: "JSON 'auto'".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Opaque name of the warehouse connection and key pair, carried on every
    /// run context.
    pub reference: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            reference: "aws_credentials".to_string(),
            access_key: None,
            secret_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per task, the first try included.
    pub max_attempts: u32,
    pub backoff_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_secs: policy.backoff_delay.as_secs(),
            multiplier: policy.multiplier,
            max_delay_secs: policy.max_delay.as_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.backoff_secs))
            .with_multiplier(self.multiplier, Duration::from_secs(self.max_delay_secs))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn credentials_ref(&self) -> CredentialsRef {
        CredentialsRef::new(self.credentials.reference.clone())
    }

    /// Keys configured inline, if both halves are present.
    pub fn static_credentials(&self) -> Option<AwsCredentials> {
        match (&self.credentials.access_key, &self.credentials.secret_key) {
            (Some(access), Some(secret)) => Some(AwsCredentials::new(access, secret)),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.bucket must not be empty".into()));
        }
        if self.storage.region.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.region must not be empty".into()));
        }
        if self.credentials.reference.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "credentials.reference must not be empty".into(),
            ));
        }
        if self.credentials.access_key.is_some() != self.credentials.secret_key.is_some() {
            return Err(ConfigError::Invalid(
                "credentials.access_key and credentials.secret_key must be set together".into(),
            ));
        }
        if self.executor.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrency must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Loads configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables prefixed with `STARDAG_` (`STARDAG_RETRY__MAX_ATTEMPTS`)
/// 2. The TOML file at `path`, when given
/// 3. Built-in defaults
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Missing(path.display().to_string()));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("STARDAG_").split("__"));

    let config: PipelineConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_the_hourly_pipeline() {
        let config = PipelineConfig::default();
        assert_eq!(config.storage.bucket, "udacity-dend");
        assert_eq!(config.storage.events_key, "log_data/{year}/{month}/");
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.executor.max_concurrency, 16);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.static_credentials().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.credentials.reference, "aws_credentials");
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stardag.toml");
        std::fs::write(
            &path,
            r#"
[storage]
bucket = "sparkify-raw"
region = "eu-west-1"

[credentials]
reference = "tenant_b"
access_key = "AKIA123"
secret_key = "shh"

[retry]
max_attempts = 2
backoff_secs = 10

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.storage.bucket, "sparkify-raw");
        assert_eq!(config.storage.songs_key, "song_data/");
        assert_eq!(config.retry.policy().max_attempts, 2);
        assert_eq!(config.retry.policy().backoff_delay, Duration::from_secs(10));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.credentials_ref(), CredentialsRef::new("tenant_b"));
        assert_eq!(
            config.static_credentials(),
            Some(AwsCredentials::new("AKIA123", "shh"))
        );
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stardag.toml");
        std::fs::write(&path, "[executor]\nmax_concurrency = 0\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)).unwrap_err(),
            ConfigError::Invalid(_)
        ));

        let mut config = PipelineConfig::default();
        config.credentials.access_key = Some("AKIA".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_figment_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stardag.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = \"many\"\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)).unwrap_err(),
            ConfigError::Figment(_)
        ));
    }
}
