//! Layered CLI settings
//!
//! Built-in defaults, then `~/.queuectl/config.json` (or `--config`), then
//! `QUEUECTL_*` environment variables.

use anyhow::{bail, Context, Result};
use queuectl_persist::{SqliteConfig, SqliteJobStore};
use queuectl_queue::{QueueConfig, WorkerRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_DASHBOARD_PORT: u16 = 8080;

/// Keys accepted by `config set`
pub const KEYS: [&str; 7] = [
    "max_retries",
    "backoff_base",
    "default_timeout",
    "worker_poll_interval",
    "db_path",
    "registry_path",
    "dashboard_port",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(flatten)]
    pub queue: QueueConfig,
    pub db_path: PathBuf,
    pub registry_path: PathBuf,
    pub dashboard_port: u16,
}

/// `~/.queuectl`, or `./.queuectl` without a home directory
pub fn queuectl_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".queuectl")
}

impl Settings {
    /// Defaults rooted at `home`
    pub fn defaults_in(home: &Path) -> Self {
        Self {
            queue: QueueConfig::default(),
            db_path: home.join("queuectl.db"),
            registry_path: home.join("workers.json"),
            dashboard_port: DEFAULT_DASHBOARD_PORT,
        }
    }

    pub fn default_file() -> PathBuf {
        queuectl_home().join("config.json")
    }

    /// Load and validate the effective settings
    pub fn load(file: &Path) -> Result<Self> {
        let defaults = Self::defaults_in(&queuectl_home());
        let settings: Settings = config::Config::builder()
            .add_source(
                config::Config::try_from(&defaults)
                    .context("Failed to encode default settings")?,
            )
            .add_source(
                config::File::from(file)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("QUEUECTL").try_parsing(true))
            .build()
            .context("Failed to build settings")?
            .try_deserialize()
            .context("Failed to deserialize settings")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.db_path.as_os_str().is_empty() {
            bail!("db_path must not be empty");
        }
        Ok(())
    }

    /// Open (creating if needed) the job database
    pub async fn open_store(&self) -> Result<SqliteJobStore> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        SqliteJobStore::open(&SqliteConfig::file(&self.db_path))
            .await
            .with_context(|| format!("Failed to open database {}", self.db_path.display()))
    }

    pub fn registry(&self) -> WorkerRegistry {
        WorkerRegistry::new(&self.registry_path)
    }

    /// Key/value pairs in display order
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let value = serde_json::to_value(self)?;
        Ok(KEYS
            .iter()
            .map(|key| {
                let shown = match value.get(*key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                (key.to_string(), shown)
            })
            .collect())
    }
}

/// Accept `max-retries` as well as `max_retries`
pub fn normalize_key(key: &str) -> Result<String> {
    let key = key.trim().replace('-', "_").to_lowercase();
    if !KEYS.contains(&key.as_str()) {
        bail!(
            "Unknown config key '{}'. Valid keys: {}",
            key,
            KEYS.join(", ")
        );
    }
    Ok(key)
}

/// Numbers and booleans are stored as JSON values, everything else as text
fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// Persist one key to the config file after checking the result is valid.
/// Returns the new effective settings.
pub fn set_value(file: &Path, current: &Settings, key: &str, raw: &str) -> Result<Settings> {
    let key = normalize_key(key)?;
    let value = parse_value(raw);

    let mut effective = serde_json::to_value(current)?;
    effective[&key] = value.clone();
    let updated: Settings = serde_json::from_value(effective)
        .with_context(|| format!("Invalid value '{}' for {}", raw, key))?;
    updated.validate()?;

    let mut stored: Map<String, Value> = match fs::read_to_string(file) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", file.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
    };
    stored.insert(key, value);

    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(file, serde_json::to_string_pretty(&stored)?)
        .with_context(|| format!("Failed to write {}", file.display()))?;

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("max-retries").unwrap(), "max_retries");
        assert_eq!(normalize_key("BACKOFF_BASE").unwrap(), "backoff_base");
        assert!(normalize_key("colour").is_err());
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("5"), Value::from(5));
        assert_eq!(parse_value("1.5"), Value::from(1.5));
        assert_eq!(parse_value("/var/q.db"), Value::from("/var/q.db"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        fs::write(&file, r#"{"max_retries": 7, "backoff_base": 1.5}"#).unwrap();

        let settings = Settings::load(&file).unwrap();
        assert_eq!(settings.queue.max_retries, 7);
        assert_eq!(settings.queue.backoff_base, 1.5);
        assert_eq!(settings.queue.default_timeout, 300);
    }

    #[test]
    fn test_set_value_persists_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("config.json");
        let current = Settings::defaults_in(dir.path());

        let updated = set_value(&file, &current, "max-retries", "5").unwrap();
        assert_eq!(updated.queue.max_retries, 5);

        let stored: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(stored["max_retries"], 5);

        assert!(set_value(&file, &current, "backoff_base", "0.5").is_err());
        assert!(set_value(&file, &current, "max_retries", "lots").is_err());
        let stored: Value = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert!(stored.get("backoff_base").is_none());
    }

    #[test]
    fn test_entries_cover_every_key() {
        let settings = Settings::defaults_in(Path::new("/tmp/q"));
        let entries = settings.entries().unwrap();
        assert_eq!(entries.len(), KEYS.len());
        assert_eq!(entries[0], ("max_retries".to_string(), "3".to_string()));
        assert_eq!(entries[4].1, "/tmp/q/queuectl.db");
    }
}
