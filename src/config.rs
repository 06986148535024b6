//! Server configuration
//!
//! The core crate only *consumes* a validated `Config` record. Loading it
//! from a YAML file on disk, wiring signal handlers, and exposing an HTTP
//! admin endpoint are external collaborators. This module still owns the
//! record's shape, its defaults, and a convenience YAML loader so the
//! binary entry point has something real to call.

use std::path::PathBuf;

use serde::Deserialize;

use crate::acl::Role;
use crate::error::{FerroError, Result};

const DEFAULT_BIND_ADDR: &str = ":6380";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_LOG_FILE: &str = "ferrodb.aol";
const DEFAULT_DB_COUNT: usize = 16;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 1;

/// One entry in the configured user table.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

/// Raw, as-deserialized config shape. Every field is optional so a partial
/// YAML document still parses; [`Config::from_raw`] fills in defaults and
/// rejects what it cannot.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    listen_addr: Option<String>,
    users: Vec<UserConfig>,
    data_dir: Option<String>,
    log_file: Option<String>,
    db_count: Option<i64>,
    cleanup_interval_secs: Option<i64>,
}

/// Validated server configuration consumed by [`crate::engine::Engine`] and
/// [`crate::server::listener::Listener`].
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub users: Vec<UserConfig>,
    pub data_dir: PathBuf,
    pub log_file: String,
    pub db_count: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_BIND_ADDR.to_string(),
            users: Vec::new(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log_file: DEFAULT_LOG_FILE.to_string(),
            db_count: DEFAULT_DB_COUNT,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl Config {
    /// Path to the append-only log file (`<data_dir>/<log_file>`).
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_file)
    }

    /// Parse every configured user's role, failing fast on an unknown one.
    ///
    /// This is a thin validation helper the engine calls at construction
    /// time; the YAML loader itself does not reject unknown roles so that a
    /// single bad entry does not prevent the rest of the config from being
    /// inspected by the caller.
    pub fn parsed_roles(&self) -> Result<Vec<(UserConfig, Role)>> {
        self.users
            .iter()
            .map(|u| {
                Role::from_name(&u.role)
                    .map(|role| (u.clone(), role))
                    .ok_or_else(|| {
                        FerroError::Fatal(format!(
                            "unknown role '{}' for user '{}'",
                            u.role, u.username
                        ))
                    })
            })
            .collect()
    }

    /// Load and validate a config from a YAML file, falling back to defaults
    /// for invalid or missing values.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse a YAML document into a validated `Config`.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text)
            .map_err(|e| FerroError::Fatal(format!("invalid config: {}", e)))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = Config::default();
        Config {
            listen_addr: raw.listen_addr.unwrap_or(defaults.listen_addr),
            users: raw.users,
            data_dir: raw
                .data_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_file: raw.log_file.unwrap_or(defaults.log_file),
            db_count: raw
                .db_count
                .filter(|&n| n > 0)
                .map(|n| n as usize)
                .unwrap_or(defaults.db_count),
            cleanup_interval_secs: raw
                .cleanup_interval_secs
                .filter(|&n| n > 0)
                .map(|n| n as u64)
                .unwrap_or(defaults.cleanup_interval_secs),
        }
    }
}
