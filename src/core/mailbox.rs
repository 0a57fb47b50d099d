//! Schema-validated JSON mailboxes.
//!
//! A mailbox is one JSON document of the form `{ "<collection>": [ ... ] }`.
//! Producers append; a single designated consumer drains. Every access
//! holds an advisory lock on a sidecar `<file>.lock` (shared for reads,
//! exclusive for mutations) and every mutation commits by renaming a temp
//! file over the document. A consumer additionally holds `<file>.consumer`
//! for the whole of its cycle, so a second consumer fails fast with
//! [`MailboxError::ConsumerBusy`] instead of interleaving. A read either returns fully valid records or
//! fails with [`MailboxError::SchemaViolation`]; it never returns a partial
//! view.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::durable;
use super::schema::SchemaGate;
use crate::domain::Record;

/// Errors from mailbox access
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox {path} violates its schema: {reason}")]
    SchemaViolation { path: PathBuf, reason: String },

    #[error("mailbox {path} already has an active consumer")]
    ConsumerBusy { path: PathBuf },

    #[error("mailbox {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode mailbox entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("mailbox worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl MailboxError {
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaViolation { .. })
    }

    pub fn is_consumer_busy(&self) -> bool {
        matches!(self, Self::ConsumerBusy { .. })
    }
}

/// Exclusive consumer rights on a mailbox, released on drop
#[derive(Debug)]
pub struct ConsumerClaim {
    _file: File,
}

/// Durable ordered container of `R` records
pub struct Mailbox<R> {
    path: PathBuf,
    lock_path: PathBuf,
    consumer_path: PathBuf,
    schema: Option<Arc<SchemaGate>>,
    capacity: Option<usize>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Mailbox<R> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock_path: self.lock_path.clone(),
            consumer_path: self.consumer_path.clone(),
            schema: self.schema.clone(),
            capacity: self.capacity,
            _record: PhantomData,
        }
    }
}

impl<R> fmt::Debug for Mailbox<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("path", &self.path)
            .field("schema", &self.schema.as_ref().map(|s| s.origin()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<R: Record> Mailbox<R> {
    /// A mailbox backed by `path`; the file need not exist yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sidecar = |suffix: &str| {
            let mut name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default();
            name.push(suffix);
            path.with_file_name(name)
        };
        let lock_path = sidecar(".lock");
        let consumer_path = sidecar(".consumer");

        Self {
            path,
            lock_path,
            consumer_path,
            schema: None,
            capacity: None,
            _record: PhantomData,
        }
    }

    /// Keep at most `capacity` records; appends beyond it evict the oldest
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    /// Validate the whole document against `gate` on every read and write
    pub fn with_schema(mut self, gate: Arc<SchemaGate>) -> Self {
        self.schema = Some(gate);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an empty mailbox if none exists, otherwise validate it
    pub async fn ensure(&self) -> Result<(), MailboxError> {
        self.locked(true, |mailbox| {
            if mailbox.path.exists() {
                mailbox.load().map(|_| ())
            } else {
                debug!(path = %mailbox.path.display(), "Creating empty mailbox");
                mailbox.store(&[])
            }
        })
        .await
    }

    /// Read every record without consuming anything
    pub async fn peek(&self) -> Result<Vec<R>, MailboxError> {
        self.locked(false, |mailbox| mailbox.load()).await
    }

    pub async fn append(&self, record: R) -> Result<(), MailboxError> {
        self.append_all(vec![record]).await
    }

    /// Append records in order; nothing is written if the result is invalid
    pub async fn append_all(&self, records: Vec<R>) -> Result<(), MailboxError> {
        if records.is_empty() {
            return Ok(());
        }
        self.locked(true, move |mailbox| {
            let mut entries = mailbox.load()?;
            entries.extend(records);
            if let Some(capacity) = mailbox.capacity {
                let overflow = entries.len().saturating_sub(capacity);
                if overflow > 0 {
                    warn!(
                        path = %mailbox.path.display(),
                        evicted = overflow,
                        capacity,
                        "Mailbox full, dropping oldest records"
                    );
                    entries.drain(..overflow);
                }
            }
            mailbox.store(&entries)
        })
        .await
    }

    /// Become the mailbox's consumer until the claim is dropped
    pub async fn claim_consumer(&self) -> Result<ConsumerClaim, MailboxError> {
        let mailbox = self.clone();
        tokio::task::spawn_blocking(move || mailbox.try_claim()).await?
    }

    /// Read and validate the backlog, then reset the mailbox to empty
    ///
    /// Fails with [`MailboxError::ConsumerBusy`] while another consumer
    /// holds the mailbox.
    pub async fn drain_and_reset(&self) -> Result<Vec<R>, MailboxError> {
        let mailbox = self.clone();
        let drained = tokio::task::spawn_blocking(move || {
            let _claim = mailbox.try_claim()?;
            let _lock = mailbox.lock(true)?;
            let entries = mailbox.load()?;
            mailbox.store(&[])?;
            Ok::<_, MailboxError>(entries)
        })
        .await??;

        debug!(path = %self.path.display(), count = drained.len(), "Drained mailbox");
        Ok(drained)
    }

    /// Remove the records a consumer processed, keeping everything else
    ///
    /// Each consumed record removes one equal entry, searched from the
    /// front. Entries appended meanwhile survive, and records already
    /// gone (withdrawn by their producer) are skipped.
    pub async fn remove_consumed(&self, consumed: Vec<R>) -> Result<usize, MailboxError> {
        if consumed.is_empty() {
            return Ok(0);
        }
        self.locked(true, move |mailbox| {
            let entries = mailbox.load()?;
            let mut encoded = entries
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()?;
            let mut keep = vec![true; entries.len()];

            let mut removed = 0;
            for record in &consumed {
                let target = serde_json::to_value(record)?;
                if let Some(index) = encoded.iter().position(|entry| *entry == target) {
                    encoded[index] = Value::Null;
                    keep[index] = false;
                    removed += 1;
                }
            }

            if removed < consumed.len() {
                warn!(
                    path = %mailbox.path.display(),
                    expected = consumed.len(),
                    removed,
                    "Consumed records missing from mailbox"
                );
            }
            if removed > 0 {
                let remaining: Vec<R> = entries
                    .into_iter()
                    .zip(keep)
                    .filter_map(|(entry, keep)| keep.then_some(entry))
                    .collect();
                mailbox.store(&remaining)?;
            }
            Ok(removed)
        })
        .await
    }

    /// Remove and return every record matching `predicate`
    pub async fn remove_where<F>(&self, predicate: F) -> Result<Vec<R>, MailboxError>
    where
        F: Fn(&R) -> bool + Send + 'static,
    {
        self.locked(true, move |mailbox| {
            let (removed, kept): (Vec<R>, Vec<R>) =
                mailbox.load()?.into_iter().partition(|record| predicate(record));
            if !removed.is_empty() {
                mailbox.store(&kept)?;
            }
            Ok(removed)
        })
        .await
    }

    /// Overwrite the mailbox with exactly `records`
    pub async fn replace(&self, records: Vec<R>) -> Result<(), MailboxError> {
        self.locked(true, move |mailbox| mailbox.store(&records))
            .await
    }

    /// Run `op` on the blocking pool while holding the sidecar lock
    async fn locked<T, F>(&self, exclusive: bool, op: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, MailboxError> + Send + 'static,
    {
        let mailbox = self.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = mailbox.lock(exclusive)?;
            op(&mailbox)
        })
        .await?
    }

    fn try_claim(&self) -> Result<ConsumerClaim, MailboxError> {
        let file = self.open_sidecar(&self.consumer_path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(ConsumerClaim { _file: file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(MailboxError::ConsumerBusy {
                    path: self.path.clone(),
                })
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn open_sidecar(&self, path: &Path) -> Result<File, MailboxError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| self.io_error(e))
    }

    /// The lock is released when the returned file is dropped
    fn lock(&self, exclusive: bool) -> Result<File, MailboxError> {
        let file = self.open_sidecar(&self.lock_path)?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| self.io_error(e))?;

        Ok(file)
    }

    fn load(&self) -> Result<Vec<R>, MailboxError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let document: Value = serde_json::from_slice(&bytes)
            .map_err(|e| self.violation(format!("not valid JSON: {}", e)))?;

        self.decode(document)
    }

    /// Encode, validate the full resulting document, then commit it
    fn store(&self, records: &[R]) -> Result<(), MailboxError> {
        let document = self.encode(records)?;
        self.decode(document.clone())?;

        durable::write_json_atomic(&self.path, &document).map_err(|e| self.io_error(e))
    }

    fn encode(&self, records: &[R]) -> Result<Value, MailboxError> {
        let entries = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;

        let mut document = Map::new();
        document.insert(R::COLLECTION.to_string(), Value::Array(entries));
        Ok(Value::Object(document))
    }

    fn decode(&self, document: Value) -> Result<Vec<R>, MailboxError> {
        if let Some(gate) = &self.schema {
            gate.check(&document).map_err(|reason| self.violation(reason))?;
        }

        let Value::Object(mut fields) = document else {
            return Err(self.violation("document is not a JSON object"));
        };

        let entries = match fields.remove(R::COLLECTION) {
            Some(Value::Array(entries)) => entries,
            Some(_) => {
                return Err(self.violation(format!("`{}` is not an array", R::COLLECTION)));
            }
            None => {
                return Err(self.violation(format!("missing `{}` collection", R::COLLECTION)));
            }
        };

        if let Some(extra) = fields.keys().next() {
            return Err(self.violation(format!("unexpected field `{}`", extra)));
        }

        entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let record: R = serde_json::from_value(entry)
                    .map_err(|e| self.violation(format!("entry {}: {}", index, e)))?;
                record
                    .check()
                    .map_err(|reason| self.violation(format!("entry {}: {}", index, reason)))?;
                Ok(record)
            })
            .collect()
    }

    fn violation(&self, reason: impl Into<String>) -> MailboxError {
        MailboxError::SchemaViolation {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    fn io_error(&self, source: io::Error) -> MailboxError {
        MailboxError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IngestCandidate, SolvedReport};
    use tempfile::TempDir;

    fn candidate(id: &str) -> IngestCandidate {
        IngestCandidate {
            id: id.to_string(),
            description: format!("problem {}", id),
            solution_ref: format!("solution-{}", id),
        }
    }

    #[test]
    fn test_lock_file_sits_beside_mailbox() {
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new("/tmp/x/new_records.json");
        assert_eq!(
            mailbox.lock_path,
            PathBuf::from("/tmp/x/new_records.json.lock")
        );
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("absent.json"));

        assert!(mailbox.peek().await.unwrap().is_empty());
        assert!(mailbox.drain_and_reset().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_writes_empty_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports.json");
        let mailbox: Mailbox<SolvedReport> = Mailbox::new(&path);

        mailbox.ensure().await.unwrap();

        let raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({"reports": []}));
    }

    #[tokio::test]
    async fn test_wrong_collection_is_violation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.json");
        fs::write(&path, r#"{"reports": []}"#).unwrap();

        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(&path);
        let err = mailbox.peek().await.unwrap_err();
        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn test_invalid_append_leaves_content() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("records.json"));
        mailbox.append(candidate("1")).await.unwrap();

        let err = mailbox.append(candidate("")).await.unwrap_err();
        assert!(err.is_schema_violation());
        assert_eq!(mailbox.peek().await.unwrap(), vec![candidate("1")]);
    }

    #[tokio::test]
    async fn test_remove_consumed_keeps_tail() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("records.json"));
        mailbox
            .append_all(vec![candidate("1"), candidate("2"), candidate("3")])
            .await
            .unwrap();

        let removed = mailbox
            .remove_consumed(vec![candidate("1"), candidate("2")])
            .await
            .unwrap();

        assert_eq!(removed, 2);
        assert_eq!(mailbox.peek().await.unwrap(), vec![candidate("3")]);
    }

    #[tokio::test]
    async fn test_remove_consumed_skips_records_already_gone() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("records.json"));
        mailbox
            .append_all(vec![candidate("1"), candidate("2")])
            .await
            .unwrap();
        mailbox.remove_where(|c| c.id == "1").await.unwrap();
        mailbox.append(candidate("3")).await.unwrap();

        let removed = mailbox
            .remove_consumed(vec![candidate("1"), candidate("2")])
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert_eq!(mailbox.peek().await.unwrap(), vec![candidate("3")]);
    }

    #[tokio::test]
    async fn test_second_consumer_is_refused() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("records.json"));
        mailbox.append(candidate("1")).await.unwrap();

        let claim = mailbox.claim_consumer().await.unwrap();
        let err = mailbox.clone().drain_and_reset().await.unwrap_err();
        assert!(err.is_consumer_busy(), "{}", err);
        assert_eq!(mailbox.peek().await.unwrap().len(), 1);

        drop(claim);
        assert_eq!(mailbox.drain_and_reset().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> =
            Mailbox::new(dir.path().join("records.json")).with_capacity(2);

        mailbox.append(candidate("1")).await.unwrap();
        mailbox
            .append_all(vec![candidate("2"), candidate("3")])
            .await
            .unwrap();

        assert_eq!(
            mailbox.peek().await.unwrap(),
            vec![candidate("2"), candidate("3")]
        );
    }

    #[tokio::test]
    async fn test_remove_where_returns_matches() {
        let dir = TempDir::new().unwrap();
        let mailbox: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("records.json"));
        mailbox
            .append_all(vec![candidate("1"), candidate("2"), candidate("3")])
            .await
            .unwrap();

        let removed = mailbox.remove_where(|c| c.id == "2").await.unwrap();

        assert_eq!(removed, vec![candidate("2")]);
        assert_eq!(
            mailbox.peek().await.unwrap(),
            vec![candidate("1"), candidate("3")]
        );
    }
}
