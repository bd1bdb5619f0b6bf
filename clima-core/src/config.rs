use anyhow::{Context, Result, anyhow, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::worker::WorkerOptions;

/// Environment variable that overrides the API key stored on disk.
pub const API_KEY_ENV: &str = "OPENWEATHER_API_KEY";

/// How to reach the OpenWeather current-weather endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub units: String,
    pub lang: String,
    /// Per-request timeout; must stay below the invocation budget.
    pub timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            units: "metric".to_string(),
            lang: "es".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub invocation_budget_secs: u64,
    pub batch_concurrency: usize,
    /// Lets work items carrying `mock: true` use the canned weather table.
    pub allow_simulation: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            invocation_budget_secs: 30,
            batch_concurrency: 1,
            allow_simulation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Where the table and queue files live; defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// When off, unresolved items are logged and dropped instead of queued.
    pub dead_letter_queue: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            dead_letter_queue: true,
        }
    }
}

/// Top-level configuration stored on disk.
///
/// Example TOML:
/// ```toml
/// [provider]
/// api_key = "..."
/// lang = "es"
///
/// [worker]
/// invocation_budget_secs = 30
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderSettings,
    pub worker: WorkerSettings,
    pub storage: StorageSettings,
}

impl Config {
    /// Load config from disk (or defaults on first run), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_file_path()?;
        let mut cfg = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        cfg.apply_env_overrides(std::env::var(API_KEY_ENV).ok());
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Invalid configuration TOML")
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(&path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Directory holding the record table and queue files.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(Self::project_dirs()?.data_dir().to_path_buf()),
        }
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "clima", "clima")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// A non-empty key from the environment wins over the one on disk.
    pub fn apply_env_overrides(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.provider.api_key = Some(key);
        }
    }

    pub fn set_api_key(&mut self, api_key: String) {
        self.provider.api_key = Some(api_key);
    }

    pub fn worker_options(&self) -> Result<WorkerOptions> {
        let provider_timeout = Duration::from_secs(self.provider.timeout_secs);
        let invocation_budget = Duration::from_secs(self.worker.invocation_budget_secs);

        if provider_timeout.is_zero() {
            bail!("provider.timeout_secs must be greater than zero");
        }
        if provider_timeout >= invocation_budget {
            bail!(
                "provider.timeout_secs ({}) must be shorter than \
                 worker.invocation_budget_secs ({}).\n\
                 Hint: a hung provider call would otherwise consume the whole invocation.",
                self.provider.timeout_secs,
                self.worker.invocation_budget_secs
            );
        }
        if self.worker.batch_concurrency == 0 {
            bail!("worker.batch_concurrency must be at least 1");
        }

        Ok(WorkerOptions {
            provider_timeout,
            invocation_budget,
            batch_concurrency: self.worker.batch_concurrency,
            allow_simulation: self.worker.allow_simulation,
        })
    }
}
