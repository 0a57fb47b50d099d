//! JSON Schema gate applied to mailbox documents and stage configuration.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

/// Errors loading or compiling a schema
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read schema {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("schema {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("schema {origin} does not compile: {message}")]
    Invalid { origin: String, message: String },
}

/// A compiled JSON Schema
#[derive(Debug)]
pub struct SchemaGate {
    validator: jsonschema::Validator,
    origin: String,
}

impl SchemaGate {
    /// Compile `schema`; `origin` names it in error messages
    pub fn new(schema: &Value, origin: impl Into<String>) -> Result<Self, SchemaError> {
        let origin = origin.into();
        let validator = jsonschema::options()
            .build(schema)
            .map_err(|e| SchemaError::Invalid {
                origin: origin.clone(),
                message: e.to_string(),
            })?;

        Ok(Self { validator, origin })
    }

    /// Load and compile a schema file
    pub fn from_file(path: &Path) -> Result<Self, SchemaError> {
        let bytes = fs::read(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let schema: Value = serde_json::from_slice(&bytes).map_err(|source| SchemaError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Self::new(&schema, path.display().to_string())
    }

    /// Like [`SchemaGate::from_file`], but a missing file means "no schema"
    pub fn load_optional(path: &Path) -> Result<Option<Self>, SchemaError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::from_file(path).map(Some)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Validate an instance, joining every violation into one message
    pub fn check(&self, instance: &Value) -> Result<(), String> {
        let violations: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations.join("; "))
        }
    }
}
