//! Per-stage configuration documents.
//!
//! Stage configs live at `<home>/config/<stage>.yaml` and are re-read at the
//! start of every cycle, so edits take effect without a restart. A document
//! passes three gates in order: its optional JSON Schema, typed parsing,
//! then the stage's own semantic rules.

use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::core::schema::SchemaGate;

/// Why a stage configuration was rejected
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("{path} violates its schema: {reason}")]
    SchemaViolation { path: PathBuf, reason: String },

    #[error("{path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// A typed stage configuration
pub trait StageConfig: DeserializeOwned + Send + Sync + 'static {
    /// Rules a schema cannot express, such as fields that must sum to a total
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Where a stage reads its configuration from
#[derive(Debug)]
pub struct ConfigSource<C> {
    path: PathBuf,
    schema_path: Option<PathBuf>,
    _config: PhantomData<fn() -> C>,
}

impl<C> Clone for ConfigSource<C> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            schema_path: self.schema_path.clone(),
            _config: PhantomData,
        }
    }
}

impl<C: StageConfig> ConfigSource<C> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_path: None,
            _config: PhantomData,
        }
    }

    /// Check documents against this schema file when it exists
    pub fn with_schema(mut self, schema_path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(schema_path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the current document
    pub async fn load(&self) -> Result<C, ConfigError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.parse(&content)
    }

    /// Validate an in-memory document as if it were read from `path`
    pub fn parse(&self, content: &str) -> Result<C, ConfigError> {
        let document: Value = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        if let Some(schema_path) = &self.schema_path {
            let gate = SchemaGate::load_optional(schema_path).map_err(|e| {
                ConfigError::SchemaViolation {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
            })?;
            if let Some(gate) = gate {
                gate.check(&document)
                    .map_err(|reason| ConfigError::SchemaViolation {
                        path: self.path.clone(),
                        reason,
                    })?;
            }
        }

        let config: C = serde_json::from_value(document).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        config.validate().map_err(|reason| ConfigError::Invalid {
            path: self.path.clone(),
            reason,
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Sample {
        period_ms: u64,
        #[serde(default)]
        ratio: u32,
    }

    impl StageConfig for Sample {
        fn validate(&self) -> Result<(), String> {
            if self.ratio > 100 {
                return Err(format!("ratio {} exceeds 100", self.ratio));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sample.yaml");
        std::fs::write(&path, "period_ms: 500\nratio: 40\n").unwrap();

        let config = ConfigSource::<Sample>::new(&path).load().await.unwrap();
        assert_eq!(config.period_ms, 500);
        assert_eq!(config.ratio, 40);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let source = ConfigSource::<Sample>::new(dir.path().join("absent.yaml"));

        assert!(matches!(source.load().await, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_semantic_rule_rejects() {
        let source = ConfigSource::<Sample>::new("sample.yaml");
        let result = source.parse("period_ms: 1\nratio: 101\n");

        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_schema_gate_runs_first() {
        let dir = TempDir::new().unwrap();
        let schema_path = dir.path().join("sample.schema.json");
        std::fs::write(
            &schema_path,
            r#"{"type": "object", "properties": {"period_ms": {"type": "integer", "minimum": 100}}}"#,
        )
        .unwrap();

        let source = ConfigSource::<Sample>::new("sample.yaml").with_schema(&schema_path);
        let result = source.parse("period_ms: 5\n");

        assert!(matches!(result, Err(ConfigError::SchemaViolation { .. })));
    }

    #[test]
    fn test_missing_schema_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let source = ConfigSource::<Sample>::new("sample.yaml")
            .with_schema(dir.path().join("absent.schema.json"));

        assert!(source.parse("period_ms: 5\n").is_ok());
    }
}
