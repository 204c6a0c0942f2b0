//! Configuration structures for StyleFlow
//!
//! This module defines the configuration for the pipeline and the cluster.
//! Configuration is loaded from a YAML file and overlaid with values from
//! the cluster-launch environment (rank, world size, node count, master
//! address). One `StyleFlowConfig` value is constructed at process start and
//! passed into the bootstrap and the dispatch loop; nothing reads the
//! environment after that.

use crate::error::{Result, StyleFlowError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the YAML configuration file.
pub const CONFIG_ENV: &str = "STYLEFLOW_CONFIG";

/// Environment variable carrying the coordinator's host:port.
pub const MASTER_ADDR_ENV: &str = "STYLEFLOW_MASTER_ADDR";

/// Default coordinator address when the launch environment provides none.
pub const DEFAULT_MASTER_ADDR: &str = "10.0.0.4:6000";

/// Rank environment variables, highest precedence first. The `OMPI_`/`PMI_`
/// names are what MPI launchers export for each spawned process.
const RANK_ENVS: &[&str] = &["STYLEFLOW_RANK", "OMPI_COMM_WORLD_RANK", "PMI_RANK"];

/// World-size environment variables, highest precedence first.
const WORLD_SIZE_ENVS: &[&str] = &["STYLEFLOW_WORLD_SIZE", "OMPI_COMM_WORLD_SIZE", "PMI_SIZE"];

/// Node-count environment variables, highest precedence first.
const NODE_COUNT_ENVS: &[&str] = &["STYLEFLOW_NODE_COUNT", "AZUREML_NODE_COUNT"];

/// Top-level configuration for a StyleFlow process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StyleFlowConfig {
    /// Pipeline parameters (discovery, batching, termination)
    pub pipeline: PipelineConfig,

    /// Cluster topology and worker sizing
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory polled for new input images
    pub input_dir: PathBuf,

    /// Glob-style filename pattern for inputs
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Directory outputs are written to, one file per input
    pub output_dir: PathBuf,

    /// Path to the style model weights file
    pub model_path: PathBuf,

    /// Maximum number of files per submitted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle seconds without new files before the pipeline may terminate
    #[serde(default = "default_patience_secs")]
    pub patience_secs: f64,

    /// Seconds slept between dispatch loop iterations
    #[serde(default = "default_sleep_period_secs")]
    pub sleep_period_secs: f64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Coordinator host:port; workers connect here, rank 0 binds its port
    #[serde(default = "default_master_addr")]
    pub master_addr: String,

    /// This process's rank; rank 0 is the coordinator
    #[serde(default)]
    pub rank: usize,

    /// Total number of processes in the cluster
    #[serde(default = "default_world_size")]
    pub world_size: usize,

    /// Number of nodes the processes are spread over
    #[serde(default = "default_node_count")]
    pub node_count: usize,

    /// CPUs on this node (detected from the host by default)
    #[serde(default = "default_cpus_per_node")]
    pub cpus_per_node: usize,

    /// Advisory cores per worker; computed from the cluster CPU budget
    /// when absent
    #[serde(default)]
    pub cores_per_worker: Option<usize>,

    /// Advisory worker memory limit
    #[serde(default)]
    pub memory_limit: MemoryLimit,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master_addr: default_master_addr(),
            rank: 0,
            world_size: default_world_size(),
            node_count: default_node_count(),
            cpus_per_node: default_cpus_per_node(),
            cores_per_worker: None,
            memory_limit: MemoryLimit::default(),
        }
    }
}

/// Advisory worker memory limit: explicit bytes or "auto"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MemoryLimitRepr", into = "MemoryLimitRepr")]
pub enum MemoryLimit {
    /// Let the worker size itself
    Auto,

    /// Hard advisory cap in bytes
    Bytes(u64),
}

impl Default for MemoryLimit {
    fn default() -> Self {
        MemoryLimit::Auto
    }
}

impl MemoryLimit {
    /// The explicit byte value, if any.
    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            MemoryLimit::Auto => None,
            MemoryLimit::Bytes(b) => Some(*b),
        }
    }
}

/// Serialized form of [`MemoryLimit`]: a number or the string "auto".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum MemoryLimitRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<MemoryLimitRepr> for MemoryLimit {
    type Error = String;

    fn try_from(repr: MemoryLimitRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            MemoryLimitRepr::Bytes(b) => Ok(MemoryLimit::Bytes(b)),
            MemoryLimitRepr::Text(s) if s.eq_ignore_ascii_case("auto") => Ok(MemoryLimit::Auto),
            MemoryLimitRepr::Text(s) => Err(format!(
                "invalid memory limit {:?}: expected \"auto\" or a byte count",
                s
            )),
        }
    }
}

impl From<MemoryLimit> for MemoryLimitRepr {
    fn from(limit: MemoryLimit) -> Self {
        match limit {
            MemoryLimit::Auto => MemoryLimitRepr::Text("auto".to_string()),
            MemoryLimit::Bytes(b) => MemoryLimitRepr::Bytes(b),
        }
    }
}

/// Default value functions
fn default_pattern() -> String {
    "*.jpg".to_string()
}

fn default_batch_size() -> usize {
    4
}

fn default_patience_secs() -> f64 {
    60.0
}

fn default_sleep_period_secs() -> f64 {
    0.1
}

fn default_master_addr() -> String {
    DEFAULT_MASTER_ADDR.to_string()
}

fn default_world_size() -> usize {
    1
}

fn default_node_count() -> usize {
    1
}

fn default_cpus_per_node() -> usize {
    num_cpus::get()
}

impl StyleFlowConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            StyleFlowError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: StyleFlowConfig = serde_yaml::from_str(&content).map_err(|e| {
            StyleFlowError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        Ok(config)
    }

    /// Validate configuration
    ///
    /// Invalid configuration is fatal before the dispatch loop starts.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            return Err(StyleFlowError::config("batch_size must be at least 1"));
        }
        if self.pipeline.sleep_period_secs <= 0.0 || !self.pipeline.sleep_period_secs.is_finite() {
            return Err(StyleFlowError::config("sleep_period_secs must be positive"));
        }
        if self.pipeline.patience_secs < 0.0 || !self.pipeline.patience_secs.is_finite() {
            return Err(StyleFlowError::config("patience_secs must be non-negative"));
        }
        if self.pipeline.pattern.is_empty() {
            return Err(StyleFlowError::config("pattern must not be empty"));
        }

        if self.cluster.world_size == 0 {
            return Err(StyleFlowError::config("world_size must be at least 1"));
        }
        if self.cluster.rank >= self.cluster.world_size {
            return Err(StyleFlowError::config(format!(
                "rank {} is out of range for world size {}",
                self.cluster.rank, self.cluster.world_size
            )));
        }
        if self.cluster.node_count == 0 {
            return Err(StyleFlowError::config("node_count must be at least 1"));
        }
        if self.cluster.cores_per_worker == Some(0) {
            return Err(StyleFlowError::config("cores_per_worker must be at least 1"));
        }
        if self.cluster.master_addr.is_empty() {
            return Err(StyleFlowError::config(
                "master address not set: workers cannot locate the coordinator",
            ));
        }
        self.cluster.master_port()?;

        Ok(())
    }
}

impl PipelineConfig {
    /// Idle patience as a Duration
    pub fn patience(&self) -> Duration {
        Duration::from_secs_f64(self.patience_secs)
    }

    /// Dispatch loop sleep period as a Duration
    pub fn sleep_period(&self) -> Duration {
        Duration::from_secs_f64(self.sleep_period_secs)
    }
}

impl ClusterConfig {
    /// Overlay values from the cluster-launch environment.
    ///
    /// Unset variables leave the current value untouched; a present but
    /// unparsable value is a fatal configuration error.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_string(&[MASTER_ADDR_ENV]) {
            self.master_addr = addr;
        }
        if let Some(rank) = env_usize(RANK_ENVS)? {
            self.rank = rank;
        }
        if let Some(world_size) = env_usize(WORLD_SIZE_ENVS)? {
            self.world_size = world_size;
        }
        if let Some(node_count) = env_usize(NODE_COUNT_ENVS)? {
            self.node_count = node_count;
        }
        Ok(())
    }

    /// Advisory cores for this process's worker.
    ///
    /// Defaults to an even division of the whole cluster's CPU budget:
    /// floor(cpus_per_node * node_count / world_size), never below 1.
    pub fn effective_cores_per_worker(&self) -> usize {
        match self.cores_per_worker {
            Some(cores) => cores,
            None => (self.cpus_per_node * self.node_count / self.world_size.max(1)).max(1),
        }
    }

    /// The coordinator's TCP port, parsed from the master address.
    pub fn master_port(&self) -> Result<u16> {
        let port = self
            .master_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                StyleFlowError::config(format!(
                    "master address {:?} is not a host:port pair",
                    self.master_addr
                ))
            })?;
        Ok(port)
    }

    /// The address the coordinator's scheduler binds.
    pub fn scheduler_bind_addr(&self) -> Result<String> {
        Ok(format!("0.0.0.0:{}", self.master_port()?))
    }
}

fn env_string(keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| std::env::var(key).ok())
        .filter(|v| !v.is_empty())
}

fn env_usize(keys: &[&str]) -> Result<Option<usize>> {
    for key in keys {
        if let Ok(value) = std::env::var(key) {
            if value.is_empty() {
                continue;
            }
            let parsed = value.parse::<usize>().map_err(|_| {
                StyleFlowError::config(format!("{} has invalid value {:?}", key, value))
            })?;
            return Ok(Some(parsed));
        }
    }
    Ok(None)
}
