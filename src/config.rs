//! TOML configuration for tripwatch.
//!
//! Describes the deployments under test, the suites mapped onto each
//! deployment with their schedules, and the knobs of the scheduling engine.
//! Loading is layered: explicit path, `TRIPWATCH_CONFIG`, the system
//! location, then compiled-in defaults.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TRIPWATCH_CONFIG";

/// Standard system location of the configuration file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/tripwatch/tripwatch.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the tripwatch process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmokeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Deployments keyed by their unique key.
    #[serde(default)]
    pub deployments: BTreeMap<String, DeploymentSpec>,
}

impl SmokeConfig {
    /// Parse a configuration document, injecting each deployment's key from
    /// its map key.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.inject_keys();
        Ok(config)
    }

    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        info!(
            path = %path.display(),
            deployments = config.deployments.len(),
            "loaded tripwatch configuration"
        );
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `TRIPWATCH_CONFIG` environment variable.
    /// 2. `/etc/tripwatch/tripwatch.toml`.
    /// 3. Fall back to compiled-in defaults (no deployments).
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TRIPWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    fn inject_keys(&mut self) {
        for (key, deployment) in self.deployments.iter_mut() {
            deployment.key = key.clone();
        }
    }

    /// Iterate every `(deployment, suite)` pair in declaration order.
    pub fn suite_entries(&self) -> impl Iterator<Item = (&DeploymentSpec, &TestSuiteSpec)> {
        self.deployments
            .values()
            .flat_map(|d| d.test_suites.iter().map(move |s| (d, s)))
    }

    pub fn suite_count(&self) -> usize {
        self.suite_entries().count()
    }

    pub fn enabled_suite_count(&self) -> usize {
        self.suite_entries().filter(|(_, s)| s.enabled).count()
    }
}

// ---------------------------------------------------------------------------
// Deployments
// ---------------------------------------------------------------------------

/// One target environment under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Unique key (injected from the map key).
    #[serde(skip)]
    pub key: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Base endpoint URL of the planning API.
    #[serde(default, alias = "otpUrl")]
    pub url: String,
    /// Suites run against this deployment, in declaration order.
    #[serde(default, alias = "testSuites")]
    pub test_suites: Vec<TestSuiteSpec>,
}

impl DeploymentSpec {
    pub fn new(key: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            url: url.into(),
            test_suites: Vec::new(),
        }
    }

    pub fn with_suite(mut self, suite: TestSuiteSpec) -> Self {
        self.test_suites.push(suite);
        self
    }

    /// Find the suite entry declared under `identifier`.
    pub fn suite(&self, identifier: &str) -> Option<&TestSuiteSpec> {
        self.test_suites.iter().find(|s| s.identifier == identifier)
    }
}

/// Maps one suite identifier onto a deployment with a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuiteSpec {
    /// Fully-qualified suite identifier, resolved through the suite registry.
    #[serde(default)]
    pub identifier: String,
    /// Calendar (six-field cron) or interval (`30s`, `10m`, `2h`) expression.
    #[serde(default)]
    pub schedule: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TestSuiteSpec {
    pub fn new(identifier: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            schedule: schedule.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The identifier's last path segment, `a.b.ExampleSuite` -> `ExampleSuite`.
    pub fn simple_name(&self) -> &str {
        simple_name(&self.identifier)
    }
}

/// Strip any `.` or `::` qualified prefix from a suite identifier.
pub fn simple_name(identifier: &str) -> &str {
    let tail = identifier.rsplit("::").next().unwrap_or(identifier);
    tail.rsplit('.').next().unwrap_or(tail)
}

/// Deterministic task identity of a `(deployment, suite)` pair.
pub fn task_id(deployment_key: &str, suite_identifier: &str) -> String {
    format!("{}-{}", deployment_key, simple_name(suite_identifier))
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Worker pool and timing configuration of the scheduling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of suite runs executing at once, across all deployments.
    pub pool_size: usize,
    /// Bounded wait for in-flight runs on shutdown (seconds).
    pub shutdown_timeout_secs: u64,
    /// Per test-method timeout (seconds); exceeding it counts as a failure.
    pub test_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            shutdown_timeout_secs: 30,
            test_timeout_secs: 120,
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
