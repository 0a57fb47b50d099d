//! Per-cycle outcome records.
//!
//! Each periodic task overwrites `reports/<task>.json` after every cycle,
//! so the file always describes the most recent run.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::Status;
use crate::core::durable;

/// Outcome of one task cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl Report {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            error_message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Overwrite the report file atomically
    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        durable::write_json(path.to_path_buf(), self.clone()).await
    }

    /// The last report written to `path`, if any
    pub async fn read_from(path: &Path) -> io::Result<Option<Self>> {
        durable::load_json(path.to_path_buf()).await
    }
}
