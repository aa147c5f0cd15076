use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::PoolConfig;
use sandbox_docker::DockerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

pub(crate) const DEFAULT_LISTEN: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_LANGUAGES_FILE: &str = "languages.json";
/// Upper bound applied to caller-supplied timeouts at the HTTP boundary.
pub(crate) const DEFAULT_MAX_TIMEOUT_SECS: u64 = 20;
pub(crate) const DEFAULT_POOL_SIZE: usize = 1;
pub(crate) const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;
pub(crate) const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeeConfig {
    /// JSON language registry.
    pub languages: PathBuf,
    /// Where per-request code and stdin files are written. System temp dir
    /// when unset.
    pub staging_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub pool: PoolSection,
    pub docker: DockerSection,
}

impl Default for CeeConfig {
    fn default() -> Self {
        Self {
            languages: PathBuf::from(DEFAULT_LANGUAGES_FILE),
            staging_dir: None,
            server: ServerConfig::default(),
            pool: PoolSection::default(),
            docker: DockerSection::default(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub max_timeout_secs: u64,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
            cors_origins: Vec::new(),
        }
    }
}

/// What to do when a request finds no idle pooled container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExhausted {
    /// Fail with a capacity error.
    #[default]
    Reject,
    /// Run in a one-off container.
    Ephemeral,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub size: usize,
    /// Per-language override of `size`, keyed by language id.
    pub sizes: HashMap<String, usize>,
    pub health_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long a request may wait for a container to be released. Zero
    /// means fail immediately.
    pub acquire_wait_ms: u64,
    pub on_exhausted: OnExhausted,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            sizes: HashMap::new(),
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            acquire_wait_ms: 0,
            on_exhausted: OnExhausted::Reject,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub socket: Option<String>,
    pub pull_missing: bool,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            socket: None,
            pull_missing: true,
        }
    }
}

/// Load and validate a service config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ServiceResult<CeeConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServiceError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: CeeConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServiceError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    check_path_exists(&config.languages, "languages file").await?;
    Ok(config)
}

async fn check_path_exists(path: &Path, label: &str) -> ServiceResult<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| ServiceError::Config(format!("check {label}: {e}")))?;
    if !exists {
        return Err(ServiceError::Config(format!(
            "{label} not found: {}",
            path.display()
        )));
    }
    Ok(())
}

impl CeeConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.languages);
        if let Some(dir) = &mut self.staging_dir {
            resolve(dir);
        }
    }

    fn validate(&self) -> ServiceResult<()> {
        if self.pool.size == 0 {
            return Err(ServiceError::Config("pool.size must be at least 1".into()));
        }
        if let Some((lang, _)) = self.pool.sizes.iter().find(|(_, size)| **size == 0) {
            return Err(ServiceError::Config(format!(
                "pool.sizes.{lang} must be at least 1"
            )));
        }
        for (name, value) in [
            ("pool.health_interval_secs", self.pool.health_interval_secs),
            ("pool.probe_timeout_secs", self.pool.probe_timeout_secs),
            ("pool.sweep_interval_secs", self.pool.sweep_interval_secs),
            ("server.max_timeout_secs", self.server.max_timeout_secs),
        ] {
            if value == 0 {
                return Err(ServiceError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.server.max_timeout_secs)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.pool.acquire_wait_ms)
    }

    /// Build a `sandbox::PoolConfig` from the pool section.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            default_size: self.pool.size,
            sizes: self.pool.sizes.clone(),
            health_interval: Duration::from_secs(self.pool.health_interval_secs),
            probe_timeout: Duration::from_secs(self.pool.probe_timeout_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
            ..PoolConfig::default()
        }
    }

    /// Build a `sandbox_docker::DockerConfig` from the docker section.
    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            socket: self.docker.socket.clone(),
            pull_missing: self.docker.pull_missing,
            ..DockerConfig::default()
        }
    }
}
