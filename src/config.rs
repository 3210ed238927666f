use std::{
    collections::{BTreeMap, HashMap},
    env, fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_CHAIN_STEPS: &str = "CHATFLOW_MAX_CHAIN_STEPS";
pub const SWEEP_MAX_AGE_SECS: &str = "CHATFLOW_SWEEP_MAX_AGE_SECS";
pub const SWEEP_INTERVAL_SECS: &str = "CHATFLOW_SWEEP_INTERVAL_SECS";
pub const WEBHOOK_TIMEOUT_MS: &str = "CHATFLOW_WEBHOOK_TIMEOUT_MS";
pub const TYPING_MAX_DELAY_MS: &str = "CHATFLOW_TYPING_MAX_DELAY_MS";
pub const OPENAI_KEY: &str = "OPENAI_KEY";
pub const OPENAI_URL: &str = "OPENAI_URL";
pub const OPENAI_MODEL: &str = "OPENAI_MODEL";

/// Every setting the engine reads, with a one-line description.
pub const SETTINGS: [(&str, &str); 8] = [
    (MAX_CHAIN_STEPS, "node executions per call when a flow sets no maxSteps (100)"),
    (SWEEP_MAX_AGE_SECS, "idle seconds before a finished thread is swept (86400)"),
    (SWEEP_INTERVAL_SECS, "seconds between sweeps (300)"),
    (WEBHOOK_TIMEOUT_MS, "default webhook timeout in ms (30000)"),
    (TYPING_MAX_DELAY_MS, "cap for typing delays in ms (5000)"),
    (OPENAI_KEY, "enables the AI condition classifier"),
    (OPENAI_URL, "OpenAI-compatible base URL"),
    (OPENAI_MODEL, "classifier model"),
];

/// Settings whose values are never printed.
pub fn is_secret(key: &str) -> bool {
    key == OPENAI_KEY
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings file is malformed: {0}")]
    Parse(#[from] dotenvy::Error),

    #[error("`{0}` is not a valid setting name (use A-Z, 0-9 and _)")]
    InvalidKey(String),
}

/// Where engine settings are read from.
#[async_trait]
pub trait SettingsSource: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> Option<String>;
}

#[async_trait]
impl SettingsSource for HashMap<String, String> {
    async fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// `<root>/config/.env`, with the process environment as fallback.
///
/// Changes are written to the file only; a running process keeps the values
/// it started with.
#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

fn check_key(key: &str) -> Result<(), ConfigError> {
    let valid = !key.is_empty()
        && !key.starts_with(|c: char| c.is_ascii_digit())
        && key.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidKey(key.to_string()))
    }
}

fn line_key(line: &str) -> Option<&str> {
    let line = line.trim_start();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    line.split_once('=').map(|(k, _)| k.trim())
}

impl EnvFile {
    /// Read the file if it exists; a missing file is an empty one.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut entries = BTreeMap::new();
        if path.exists() {
            for item in dotenvy::from_path_iter(&path)? {
                let (key, value) = item?;
                entries.insert(key, value);
            }
            debug!("Loaded {} settings from {}", entries.len(), path.display());
        } else {
            debug!("no settings file at {}, using the process environment", path.display());
        }
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Settings present in the file, sorted by key.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.entries
    }

    /// Write `key=value`, replacing an existing line in place. Comments and
    /// other lines are kept.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        check_key(key)?;
        let content = self.read_raw()?;
        let mut lines: Vec<String> = Vec::new();
        let mut replaced = false;
        for line in content.lines() {
            if line_key(line) == Some(key) {
                if !replaced {
                    lines.push(format!("{}={}", key, quote(value)));
                    replaced = true;
                }
            } else {
                lines.push(line.to_string());
            }
        }
        if !replaced {
            lines.push(format!("{}={}", key, quote(value)));
        }
        self.write_raw(&lines)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Remove `key` from the file. Returns false if it was not there.
    pub fn unset(&mut self, key: &str) -> Result<bool, ConfigError> {
        check_key(key)?;
        if self.entries.remove(key).is_none() {
            return Ok(false);
        }
        let content = self.read_raw()?;
        let lines: Vec<String> = content
            .lines()
            .filter(|line| line_key(line) != Some(key))
            .map(str::to_string)
            .collect();
        self.write_raw(&lines)?;
        Ok(true)
    }

    fn read_raw(&self) -> Result<String, ConfigError> {
        if self.path.exists() {
            Ok(fs::read_to_string(&self.path)?)
        } else {
            Ok(String::new())
        }
    }

    fn write_raw(&self, lines: &[String]) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content)?;
        Ok(())
    }
}

fn quote(value: &str) -> String {
    if value.chars().any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'') {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

#[async_trait]
impl SettingsSource for EnvFile {
    async fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned().or_else(|| env::var(key).ok())
    }
}

/// Engine tunables, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Node executions allowed in one external call when a flow sets no `maxSteps`.
    pub max_chain_steps: usize,
    pub sweep_max_age: Duration,
    pub sweep_interval: Duration,
    pub webhook_timeout: Duration,
    pub typing_max_delay: Duration,
    pub openai_key: Option<String>,
    pub openai_url: Option<String>,
    pub openai_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_steps: 100,
            sweep_max_age: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(300),
            webhook_timeout: Duration::from_millis(30_000),
            typing_max_delay: Duration::from_millis(5_000),
            openai_key: None,
            openai_url: None,
            openai_model: None,
        }
    }
}

async fn number(source: &dyn SettingsSource, key: &str) -> Option<u64> {
    let raw = source.get(key).await?;
    match raw.trim().parse::<u64>() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("ignoring {}={:?}: not a number", key, raw);
            None
        }
    }
}

async fn text(source: &dyn SettingsSource, key: &str) -> Option<String> {
    source.get(key).await.filter(|v| !v.trim().is_empty())
}

impl EngineConfig {
    /// Unset or unparsable keys keep their defaults.
    pub async fn from_source(source: &dyn SettingsSource) -> Self {
        let defaults = Self::default();
        Self {
            max_chain_steps: number(source, MAX_CHAIN_STEPS)
                .await
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_chain_steps),
            sweep_max_age: number(source, SWEEP_MAX_AGE_SECS)
                .await
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_max_age),
            sweep_interval: number(source, SWEEP_INTERVAL_SECS)
                .await
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            webhook_timeout: number(source, WEBHOOK_TIMEOUT_MS)
                .await
                .map(Duration::from_millis)
                .unwrap_or(defaults.webhook_timeout),
            typing_max_delay: number(source, TYPING_MAX_DELAY_MS)
                .await
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_max_delay),
            openai_key: text(source, OPENAI_KEY).await,
            openai_url: text(source, OPENAI_URL).await,
            openai_model: text(source, OPENAI_MODEL).await,
        }
    }
}
