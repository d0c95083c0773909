use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::BackendKind;
use crate::error::HarvestError;

pub const DEFAULT_CONFIG_FILE: &str = "paper-harvest.json";
pub const MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backends: Option<Vec<BackendKind>>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub backoff_base_ms: Option<u64>,
    #[serde(default)]
    pub backoff_max_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn delay_before(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub root: Utf8PathBuf,
    pub workers: usize,
    pub attempt_timeout: Duration,
    pub max_attempts: u32,
    pub backends: Vec<BackendKind>,
    pub queue_capacity: usize,
    pub backoff: BackoffPolicy,
}

impl PipelineConfig {
    pub fn with_root(root: Utf8PathBuf) -> Self {
        Self {
            root,
            workers: 5,
            attempt_timeout: Duration::from_secs(300),
            max_attempts: 3,
            backends: default_backends(),
            queue_capacity: 64,
            backoff: BackoffPolicy {
                base: Duration::from_secs(3),
                max: Duration::from_secs(30),
            },
        }
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.workers == 0 {
            return Err(HarvestError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(HarvestError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(HarvestError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(HarvestError::InvalidConfig(
                "attempt timeout must be positive".to_string(),
            ));
        }
        if self.attempt_timeout > MAX_ATTEMPT_TIMEOUT {
            return Err(HarvestError::InvalidConfig(format!(
                "attempt timeout must not exceed {}s",
                MAX_ATTEMPT_TIMEOUT.as_secs()
            )));
        }
        if self.backends.is_empty() {
            return Err(HarvestError::InvalidConfig(
                "at least one backend is required".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for kind in &self.backends {
            if !seen.insert(kind) {
                return Err(HarvestError::InvalidConfig(format!(
                    "backend listed twice: {kind}"
                )));
            }
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, HarvestError> {
        Self::resolve_config(Self::load(path)?)
    }

    /// Reads the raw file. An explicit path that cannot be read is an error; a
    /// missing default file yields an empty config.
    pub fn load(path: Option<&str>) -> Result<Config, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<PipelineConfig, HarvestError> {
        let root = match config.root {
            Some(root) => Utf8PathBuf::from(expand_home(&root)?),
            None => default_root()?,
        };
        let mut resolved = PipelineConfig::with_root(root);

        if let Some(workers) = config.workers {
            resolved.workers = workers;
        }
        if let Some(secs) = config.attempt_timeout_secs {
            resolved.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = config.max_attempts {
            resolved.max_attempts = attempts;
        }
        if let Some(backends) = config.backends {
            resolved.backends = backends;
        }
        if let Some(capacity) = config.queue_capacity {
            resolved.queue_capacity = capacity;
        }
        if let Some(ms) = config.backoff_base_ms {
            resolved.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = config.backoff_max_ms {
            resolved.backoff.max = Duration::from_millis(ms);
        }

        resolved.validate()?;
        Ok(resolved)
    }
}

pub fn default_backends() -> Vec<BackendKind> {
    if cfg!(windows) {
        vec![BackendKind::Managed, BackendKind::Direct]
    } else {
        vec![BackendKind::Segmented, BackendKind::Direct]
    }
}

pub fn default_root() -> Result<Utf8PathBuf, HarvestError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join("papers")).ok())
        .ok_or_else(|| HarvestError::InvalidConfig("unable to resolve home directory".to_string()))
}

fn expand_home(path: &str) -> Result<String, HarvestError> {
    let Some(rest) = path.strip_prefix("~") else {
        return Ok(path.to_string());
    };
    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| HarvestError::InvalidConfig("unable to resolve home directory".to_string()))?;
    let home = home
        .to_str()
        .ok_or_else(|| HarvestError::InvalidConfig("non-utf8 home directory".to_string()))?;
    Ok(format!("{home}{rest}"))
}
