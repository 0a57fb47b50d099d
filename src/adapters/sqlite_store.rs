//! SQLite-backed solved-problem store.
//!
//! Solutions are deduplicated by content; problems get a fresh uuid the
//! first time a (description, solution) pair is seen, and a repeat report
//! only refreshes its timestamp. Text is stored lowercased.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use glob::Pattern;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CollaboratorError, SolvedStore};
use crate::domain::IngestCandidate;

const STORE: &str = "sqlite store";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS solutions (
    id          TEXT PRIMARY KEY,
    description TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS problems (
    id          TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    solution_id TEXT NOT NULL REFERENCES solutions(id),
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_problems_created_at ON problems(created_at);
";

/// Content address of a solution text
fn solution_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// True if any word of `description` matches a banned pattern
fn is_banned(description: &str, banned: &[Pattern]) -> bool {
    description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .any(|word| banned.iter().any(|pattern| pattern.matches(word)))
}

fn open(path: &Path) -> Result<Connection, CollaboratorError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CollaboratorError::unavailable(STORE, e))?;
        }
    }

    let conn = Connection::open(path).map_err(|e| CollaboratorError::unavailable(STORE, e))?;
    conn.execute_batch(SCHEMA)
        .map_err(|e| CollaboratorError::unavailable(STORE, e))?;

    info!(path = %path.display(), "Opened solved-problem store");
    Ok(conn)
}

/// [`SolvedStore`] over a single SQLite file, opened on first use
pub struct SqliteStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// A private in-memory database
    pub fn in_memory() -> Result<Self, CollaboratorError> {
        let conn =
            Connection::open_in_memory().map_err(|e| CollaboratorError::unavailable(STORE, e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| CollaboratorError::unavailable(STORE, e))?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, op: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CollaboratorError::unavailable(STORE, "connection lock poisoned"))?;

            if guard.is_none() {
                *guard = Some(open(&path)?);
            }
            let Some(connection) = guard.as_ref() else {
                return Err(CollaboratorError::unavailable(STORE, "connection not open"));
            };

            op(connection).map_err(|e| CollaboratorError::unavailable(STORE, e))
        })
        .await
        .map_err(|e| CollaboratorError::unavailable(STORE, e))?
    }
}

#[async_trait]
impl SolvedStore for SqliteStore {
    fn name(&self) -> &str {
        STORE
    }

    async fn upsert_solved(&self, problem: &str, solution: &str) -> Result<String, CollaboratorError> {
        let problem = problem.trim().to_lowercase();
        let solution = solution.trim().to_lowercase();
        if problem.is_empty() {
            return Err(CollaboratorError::invalid(STORE, "empty problem description"));
        }

        self.with_conn(move |conn| {
            let solution_id = solution_id(&solution);
            let now = timestamp_now();

            conn.execute(
                "INSERT OR IGNORE INTO solutions (id, description) VALUES (?1, ?2)",
                params![solution_id, solution],
            )?;

            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM problems WHERE description = ?1 AND solution_id = ?2",
                    params![problem, solution_id],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE problems SET created_at = ?1 WHERE id = ?2",
                        params![now, id],
                    )?;
                    id
                }
                None => {
                    let id = Uuid::new_v4().to_string();
                    conn.execute(
                        "INSERT INTO problems (id, description, solution_id, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, problem, solution_id, now],
                    )?;
                    id
                }
            };

            debug!(problem_id = %id, "Stored solved problem");
            Ok(id)
        })
        .await
    }

    async fn fetch_eligible(
        &self,
        max_age_days: u32,
        max_count: usize,
        exclude_keywords: &[String],
    ) -> Result<Vec<IngestCandidate>, CollaboratorError> {
        let banned = exclude_keywords
            .iter()
            .map(|keyword| Pattern::new(&keyword.to_lowercase()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CollaboratorError::invalid(STORE, format!("banned keyword: {}", e)))?;

        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(max_age_days)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, description, solution_id FROM problems
                 WHERE created_at >= ?1
                 ORDER BY created_at DESC, rowid DESC",
            )?;

            let rows = stmt.query_map(params![cutoff], |row| {
                Ok(IngestCandidate {
                    id: row.get(0)?,
                    description: row.get(1)?,
                    solution_ref: row.get(2)?,
                })
            })?;

            let mut eligible = Vec::new();
            for row in rows {
                let candidate = row?;
                if is_banned(&candidate.description, &banned) {
                    continue;
                }
                eligible.push(candidate);
                if eligible.len() >= max_count {
                    break;
                }
            }
            Ok(eligible)
        })
        .await
    }

    async fn solution_for(&self, problem_id: &str) -> Result<Option<String>, CollaboratorError> {
        let problem_id = problem_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT s.description FROM problems p
                 JOIN solutions s ON s.id = p.solution_id
                 WHERE p.id = ?1",
                params![problem_id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }
}
