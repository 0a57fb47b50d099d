//! External-program collaborator.
//!
//! Spawns `<program> <args..> <operation>` with a JSON request on stdin and
//! reads a JSON reply from stdout:
//!
//! | operation | stdin                         | stdout                    |
//! |-----------|-------------------------------|---------------------------|
//! | `embed`   | `{"sentences": ["..", ..]}`   | `{"vectors": [[..], ..]}` |
//! | `predict` | `{"differences": [[..], ..]}` | `{"scores": [.., ..]}`    |
//! | `train`   | `{"training": set, "validation": set}` | `{"model": .., "score": ..}` |
//! | `test`    | `{"model": .., "test": set}`  | `{"score": ..}`           |
//!
//! A `set` is `{"differences": [[..], ..], "labels": [0 | 1, ..]}`.
//!
//! Lets a trained model in any language stand in for the local defaults.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{CollaboratorError, Embedder, LabelledSet, Predictor, TrainedModel, Trainer};

/// How to launch the external program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl CommandConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Deserialize)]
struct EmbedReply {
    vectors: Vec<Vec<f64>>,
}

#[derive(Deserialize)]
struct PredictReply {
    scores: Vec<f64>,
}

#[derive(Deserialize)]
struct TestReply {
    score: f64,
}

/// Collaborator backed by a subprocess
pub struct CommandAdapter {
    name: String,
    config: CommandConfig,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, config: CommandConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Run one operation and decode its reply
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: serde_json::Value,
    ) -> Result<T, CollaboratorError> {
        let input = serde_json::to_vec(&request)
            .map_err(|e| CollaboratorError::invalid(&self.name, e))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(operation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CollaboratorError::unavailable(
                    &self.name,
                    format!("failed to spawn '{}': {}", self.config.program, e),
                )
            })?;

        // Feed stdin while collecting output, all under the time limit; a
        // child that never reads its input cannot stall the caller
        let stdin = child.stdin.take();
        let exchange = async move {
            let feed = async move {
                if let Some(mut stdin) = stdin {
                    stdin.write_all(&input).await?;
                }
                // Dropping stdin signals EOF
                Ok::<_, std::io::Error>(())
            };
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            fed.map(|_| output)
        };

        let limit = Duration::from_secs(self.config.timeout_seconds);
        let output = timeout(limit, exchange)
            .await
            .map_err(|_| {
                CollaboratorError::unavailable(
                    &self.name,
                    format!("'{}' timed out after {:?}", operation, limit),
                )
            })?
            .map_err(|e| CollaboratorError::unavailable(&self.name, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::unavailable(
                &self.name,
                format!(
                    "'{}' exited with code {}: {}",
                    operation,
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ));
        }

        debug!(collaborator = %self.name, operation, bytes = output.stdout.len(), "Command replied");
        serde_json::from_slice(&output.stdout).map_err(|e| CollaboratorError::invalid(&self.name, e))
    }
}

#[async_trait]
impl Embedder for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, sentences: &[String]) -> Result<Vec<Vec<f64>>, CollaboratorError> {
        let reply: EmbedReply = self.call("embed", json!({ "sentences": sentences })).await?;

        if reply.vectors.len() != sentences.len() {
            return Err(CollaboratorError::invalid(
                &self.name,
                format!(
                    "expected {} vectors, got {}",
                    sentences.len(),
                    reply.vectors.len()
                ),
            ));
        }
        if let Some(first) = reply.vectors.first() {
            if reply.vectors.iter().any(|v| v.len() != first.len()) {
                return Err(CollaboratorError::invalid(&self.name, "vectors differ in length"));
            }
        }

        Ok(reply.vectors)
    }
}

#[async_trait]
impl Predictor for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn predict(&self, differences: &[Vec<f64>]) -> Result<Vec<f64>, CollaboratorError> {
        let reply: PredictReply = self
            .call("predict", json!({ "differences": differences }))
            .await?;

        if reply.scores.len() != differences.len() {
            return Err(CollaboratorError::invalid(
                &self.name,
                format!(
                    "expected {} scores, got {}",
                    differences.len(),
                    reply.scores.len()
                ),
            ));
        }

        Ok(reply.scores)
    }
}

#[async_trait]
impl Trainer for CommandAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn train(
        &self,
        training: &LabelledSet,
        validation: &LabelledSet,
    ) -> Result<TrainedModel, CollaboratorError> {
        self.call(
            "train",
            json!({ "training": training, "validation": validation }),
        )
        .await
    }

    async fn test(
        &self,
        model: &serde_json::Value,
        test: &LabelledSet,
    ) -> Result<f64, CollaboratorError> {
        let reply: TestReply = self.call("test", json!({ "model": model, "test": test })).await?;
        Ok(reply.score)
    }
}
