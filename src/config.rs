//! Configuration for troubleshoot.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variable (TROUBLESHOOT_HOME)
//! 2. Config file (.troubleshoot/config.yaml)
//! 3. Defaults (~/.troubleshoot)
//!
//! Config file discovery:
//! - Searches current directory and parents for .troubleshoot/config.yaml
//! - `paths.home` is relative to the .troubleshoot/ directory
//!
//! Per-stage settings are not here; they live in `<home>/config/<stage>.yaml`
//! and are re-read every cycle (see [`stage`]).

pub mod layout;
pub mod schemas;
pub mod stage;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use layout::{Layout, MailboxName, Mailboxes};
pub use stage::{ConfigError, ConfigSource, StageConfig};

use crate::adapters::CollaboratorsConfig;
use crate::core::periodic::DEFAULT_FALLBACK_PERIOD;
use crate::core::policy::PollPolicy;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
    #[serde(default)]
    pub intake: Option<PollPolicy>,
    #[serde(default)]
    pub fallback_period_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the .troubleshoot/ directory)
    pub home: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to the troubleshoot home
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Embedder, predictor and store selection
    pub collaborators: CollaboratorsConfig,
    /// Poll budget for intake sessions
    pub intake_poll: PollPolicy,
    /// Period used when a stage config cannot be read
    #[serde(with = "seconds")]
    pub fallback_period: Duration,
}

impl ResolvedConfig {
    /// Configuration rooted at `home` with every other setting defaulted
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            config_file: None,
            collaborators: CollaboratorsConfig::default(),
            intake_poll: PollPolicy::default(),
            fallback_period: DEFAULT_FALLBACK_PERIOD,
        }
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.home)
    }
}

mod seconds {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".troubleshoot").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".troubleshoot");

    let config_file = find_config_file();
    let env_home = std::env::var("TROUBLESHOOT_HOME").ok().map(PathBuf::from);

    let Some(ref config_path) = config_file else {
        return Ok(ResolvedConfig::with_home(env_home.unwrap_or(default_home)));
    };

    let config = load_config_file(config_path)?;
    let dot_dir = config_path.parent().unwrap_or(Path::new("."));

    let home = match (env_home, config.paths.home.as_deref()) {
        (Some(home), _) => home,
        (None, Some(home_path)) => resolve_path(dot_dir, home_path),
        (None, None) => default_home,
    };

    Ok(ResolvedConfig {
        home,
        config_file: config_file.clone(),
        collaborators: config.collaborators,
        intake_poll: config.intake.unwrap_or_default(),
        fallback_period: config
            .fallback_period_seconds
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_FALLBACK_PERIOD),
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the troubleshoot home directory.
pub fn troubleshoot_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the on-disk layout under the home directory.
pub fn layout() -> Result<Layout> {
    Ok(config()?.layout())
}
