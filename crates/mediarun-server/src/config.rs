//! Server configuration.
//!
//! Every field has a default so a deployment only needs to spell out what it
//! changes. Configuration is read from YAML and then patched with CLI flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use mediarun_core::{Endpoint, ModelKind, Queue};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address.
    pub bind_addr: String,

    /// Directory generated artifacts are written to.
    pub outputs_dir: PathBuf,

    /// Public URL prefix under which `outputs_dir` is served.
    pub public_base_url: String,

    /// Shared secret guarding the admin endpoints. `None` disables them.
    pub admin_secret: Option<String>,

    /// Credits granted to newly created API keys when none are specified.
    pub default_credit_balance: u64,

    /// Timeout for a single webhook delivery attempt (seconds).
    pub webhook_timeout_secs: u64,

    pub pool: PoolConfig,

    pub billing: BillingConfig,

    /// Worker pool sizing per queue.
    pub queues: BTreeMap<Queue, QueueConfig>,

    pub simulation: SimulationConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            outputs_dir: PathBuf::from("./outputs"),
            public_base_url: "http://localhost:8000/outputs".to_string(),
            admin_secret: None,
            default_credit_balance: 10_000,
            webhook_timeout_secs: 10,
            pool: PoolConfig::default(),
            billing: BillingConfig::default(),
            queues: Queue::ALL
                .into_iter()
                .map(|q| (q, QueueConfig::default_for(q)))
                .collect(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sizing for `queue`, falling back to its default.
    pub fn queue(&self, queue: Queue) -> QueueConfig {
        self.queues
            .get(&queue)
            .copied()
            .unwrap_or_else(|| QueueConfig::default_for(queue))
    }

    /// Check values that serde cannot express.
    ///
    /// Model footprints against the budget are checked separately when the
    /// pool is built, since that depends on which loaders are registered.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.budget == 0 {
            return Err(ConfigError::Invalid("pool.budget must be positive".into()));
        }
        for (queue, q) in &self.queues {
            if q.workers == 0 || q.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "queues.{queue}: workers and capacity must be positive"
                )));
            }
        }
        if self.billing.costs.values().any(|&cost| cost == 0) {
            return Err(ConfigError::Invalid(
                "billing.costs: endpoint costs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Model pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Total memory units available to resident models.
    pub budget: u64,

    /// Per-model footprint overrides. Models not listed use their default.
    pub footprints: BTreeMap<ModelKind, u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            budget: 24,
            footprints: BTreeMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn footprint(&self, model: ModelKind) -> u64 {
        self.footprints
            .get(&model)
            .copied()
            .unwrap_or_else(|| model.default_footprint())
    }
}

/// Cost table, in credits per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    pub costs: BTreeMap<Endpoint, u64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            costs: Endpoint::ALL
                .into_iter()
                .map(|e| (e, e.default_cost()))
                .collect(),
        }
    }
}

impl BillingConfig {
    /// Cost of `endpoint`, or `None` if the endpoint is not offered.
    pub fn cost(&self, endpoint: Endpoint) -> Option<u64> {
        self.costs.get(&endpoint).copied()
    }
}

/// Worker pool sizing for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of tasks executed concurrently.
    pub workers: usize,

    /// Tasks that may wait for a worker before admission refuses new ones.
    pub capacity: usize,
}

impl QueueConfig {
    pub fn default_for(queue: Queue) -> Self {
        match queue {
            Queue::Image => Self {
                workers: 1,
                capacity: 64,
            },
            Queue::Video => Self {
                workers: 1,
                capacity: 16,
            },
            Queue::Audio => Self {
                workers: 2,
                capacity: 64,
            },
        }
    }
}

/// Timing of the built-in simulated backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time taken to "load" a model (milliseconds).
    pub load_delay_ms: u64,

    /// Time per reported progress step (milliseconds).
    pub step_delay_ms: u64,

    /// Number of progress steps per request.
    pub steps: u8,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            load_delay_ms: 1_000,
            step_delay_ms: 500,
            steps: 4,
        }
    }
}
