use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use ulid::Ulid;

use crate::engine::EngineOptions;
use crate::limits::DEFAULT_STORAGE_TIMEOUT_MS;

/// Server settings, read once from `SPOTD_*` environment variables.
/// Anything missing or unparseable falls back to its default.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub storage_timeout: Duration,
    pub compact_threshold: usize,
    pub admins: Vec<Ulid>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "spotd".into(),
            max_connections: 256,
            metrics_port: None,
            storage_timeout: Duration::from_millis(DEFAULT_STORAGE_TIMEOUT_MS),
            compact_threshold: 1000,
            admins: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            port: parsed(&get, "SPOTD_PORT").unwrap_or(defaults.port),
            bind: get("SPOTD_BIND").unwrap_or(defaults.bind),
            data_dir: get("SPOTD_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("SPOTD_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "SPOTD_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            metrics_port: parsed(&get, "SPOTD_METRICS_PORT"),
            storage_timeout: parsed(&get, "SPOTD_STORAGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.storage_timeout),
            compact_threshold: parsed(&get, "SPOTD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            admins: get("SPOTD_ADMINS").map(|s| parse_admins(&s)).unwrap_or_default(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("spotd.wal")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            storage_timeout: self.storage_timeout,
            compact_threshold: self.compact_threshold,
        }
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Comma-separated ULIDs. Bad entries are skipped with a warning.
fn parse_admins(raw: &str) -> Vec<Ulid> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match Ulid::from_string(s) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(entry = s, error = %e, "ignoring bad SPOTD_ADMINS entry");
                None
            }
        })
        .collect()
}
