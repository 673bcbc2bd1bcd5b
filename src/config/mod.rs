// Configuration file loading

use crate::coordination::{LockSettings, ResourceLimits};
use crate::models::{default_profiles, AgentCapabilityProfile, CapabilityRegistry};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordinator configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    /// Capability profiles in declaration order; built-in profiles when empty
    #[serde(default)]
    pub profiles: Vec<AgentCapabilityProfile>,
}

impl CoordinatorConfig {
    /// Registry from the configured profiles, or the built-ins
    pub fn capability_registry(&self) -> CapabilityRegistry {
        if self.profiles.is_empty() {
            CapabilityRegistry::new(default_profiles())
        } else {
            CapabilityRegistry::new(self.profiles.clone())
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Storage root; `<project>/.fleet` when unset
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Lock manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(rename = "leaseSecs", alias = "lease_secs", default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(rename = "baseBackoffMs", alias = "base_backoff_ms", default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(rename = "maxBackoffMs", alias = "max_backoff_ms", default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Default wait for blocking acquisitions
    #[serde(rename = "acquireTimeoutSecs", alias = "acquire_timeout_secs", default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_lease_secs() -> u64 { 300 }
fn default_base_backoff_ms() -> u64 { 50 }
fn default_max_backoff_ms() -> u64 { 1000 }
fn default_acquire_timeout_secs() -> u64 { crate::coordination::lock::DEFAULT_ACQUIRE_TIMEOUT_SECS }

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            lease_secs: default_lease_secs(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl LocksConfig {
    pub fn settings(&self) -> LockSettings {
        LockSettings {
            lease: Duration::from_secs(self.lease_secs),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
        }
    }
}

/// Agent registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(rename = "heartbeatIntervalSecs", alias = "heartbeat_interval_secs", default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age after which an agent is reaped
    #[serde(rename = "staleTimeoutSecs", alias = "stale_timeout_secs", default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

fn default_heartbeat_interval_secs() -> u64 { 10 }
fn default_stale_timeout_secs() -> u64 { 60 }

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
        }
    }
}

/// Message queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesConfig {
    #[serde(rename = "pollIntervalMs", alias = "poll_interval_ms", default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 { 250 }

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Resource monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(rename = "sampleIntervalSecs", alias = "sample_interval_secs", default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(rename = "windowSize", alias = "window_size", default = "default_window_size")]
    pub window_size: usize,
}

fn default_sample_interval_secs() -> u64 { 5 }
fn default_window_size() -> usize { crate::coordination::resources::DEFAULT_WINDOW_SIZE }

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            sample_interval_secs: default_sample_interval_secs(),
            window_size: default_window_size(),
        }
    }
}

/// Planning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningConfig {
    /// Concurrency cap applied after planning
    #[serde(rename = "maxAgents", alias = "max_agents", default)]
    pub max_agents: Option<usize>,
    #[serde(rename = "unsupportedTaskPenaltyHours", alias = "unsupported_task_penalty_hours", default = "default_penalty_hours")]
    pub unsupported_task_penalty_hours: f64,
}

fn default_penalty_hours() -> f64 { crate::distribution::DEFAULT_UNSUPPORTED_TASK_PENALTY_HOURS }

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            max_agents: None,
            unsupported_task_penalty_hours: default_penalty_hours(),
        }
    }
}

/// Config loader
pub struct ConfigLoader {
    /// Global config path
    global_path: Option<PathBuf>,
    /// Project config path
    project_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            global_path: Self::get_global_config_path(),
            project_path: None,
        }
    }

    /// Set the project path
    pub fn with_project_path(mut self, path: &Path) -> Self {
        self.project_path = Some(crate::file_storage::get_fleet_dir(path).join("config.toml"));
        self
    }

    fn get_global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fleet-coordinator").join("config.toml"))
    }

    /// Project config if present, else global config, else defaults
    pub fn load(&self) -> Result<CoordinatorConfig> {
        for path in [&self.project_path, &self.global_path].into_iter().flatten() {
            if let Some(config) = self.load_from_path(path)? {
                log::debug!("Loaded config from: {}", path.display());
                return Ok(config);
            }
        }
        Ok(CoordinatorConfig::default())
    }

    /// Load config from a specific path
    pub fn load_from_path(&self, path: &Path) -> Result<Option<CoordinatorConfig>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: CoordinatorConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;

        self.validate_config(&config)?;

        Ok(Some(config))
    }

    /// Validate config values
    fn validate_config(&self, config: &CoordinatorConfig) -> Result<()> {
        if config.locks.lease_secs == 0 {
            return Err(anyhow!("lease_secs must be greater than 0"));
        }

        if config.locks.base_backoff_ms > config.locks.max_backoff_ms {
            return Err(anyhow!("base_backoff_ms cannot exceed max_backoff_ms"));
        }

        if config.registry.heartbeat_interval_secs == 0 {
            return Err(anyhow!("heartbeat_interval_secs must be greater than 0"));
        }

        if config.registry.stale_timeout_secs <= config.registry.heartbeat_interval_secs {
            return Err(anyhow!("stale_timeout_secs must exceed heartbeat_interval_secs"));
        }

        if config.messages.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than 0"));
        }

        if config.resources.sample_interval_secs == 0 || config.resources.window_size == 0 {
            return Err(anyhow!("sample_interval_secs and window_size must be greater than 0"));
        }

        if config.planning.unsupported_task_penalty_hours < 0.0 {
            return Err(anyhow!("unsupported_task_penalty_hours cannot be negative"));
        }

        if let Some(profile) = config
            .profiles
            .iter()
            .find(|p| p.performance_multiplier <= 0.0)
        {
            return Err(anyhow!(
                "performance_multiplier for profile '{}' must be greater than 0",
                profile.agent_type
            ));
        }

        Ok(())
    }

    pub fn global_config_path(&self) -> Option<&Path> {
        self.global_path.as_deref()
    }

    pub fn project_config_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
