use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::ExecutorConfig;
use crate::{twlog_debug, Error, Result};

/// Default number of worker calls allowed in flight at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;

/// Default time a task waits for its dependencies before failing.
pub const DEFAULT_DEPENDENCY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// SQLite file holding run records. Defaults to `~/.taskweave/runs.db`.
    pub store_path: Option<String>,
    /// Agent catalog TOML used when `--registry` is not given.
    pub registry_path: Option<String>,
    pub max_concurrent_tasks: Option<usize>,
    pub dependency_timeout_secs: Option<u64>,
}

impl Config {
    pub fn base_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".taskweave"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("taskweave.toml"))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        match &self.store_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::base_dir()?.join("runs.db")),
        }
    }

    pub fn registry_path(&self) -> Option<PathBuf> {
        self.registry_path.as_deref().map(expand_tilde)
    }

    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent_tasks
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_TASKS)
    }

    pub fn effective_dependency_timeout(&self) -> Duration {
        Duration::from_secs(
            self.dependency_timeout_secs
                .unwrap_or(DEFAULT_DEPENDENCY_TIMEOUT_SECS),
        )
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent_tasks: self.effective_max_concurrent(),
            dependency_timeout: self.effective_dependency_timeout(),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        twlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            twlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        twlog_debug!(
            "Config loaded: store_path={:?}, registry_path={:?}, max_concurrent={:?}, dep_timeout={:?}",
            config.store_path,
            config.registry_path,
            config.max_concurrent_tasks,
            config.dependency_timeout_secs
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        twlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let base_dir = Self::base_dir()?;
        if !base_dir.exists() {
            twlog_debug!("Creating base directory: {}", base_dir.display());
            fs::create_dir_all(&base_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
