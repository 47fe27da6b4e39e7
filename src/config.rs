//! Engine configuration
//!
//! This module contains all configuration options for the transfer engine:
//! congestion control, block store batching, session pacing and storage.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::congestion::LedbatMode;
use crate::error::{EngineError, Result};

/// Main configuration for the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// LEDBAT settings
    #[serde(default)]
    pub congestion: CongestionConfig,

    /// Block store batching
    #[serde(default)]
    pub store: BlockStoreConfig,

    /// Peer session pacing and limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Storage backend selection
    #[serde(default)]
    pub storage: StorageConfig,

    /// Files a torrent may have ongoing at once
    #[serde(default = "default_max_ongoing_files")]
    pub max_ongoing_files: usize,
}

/// LEDBAT congestion control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CongestionConfig {
    /// Decision policy
    #[serde(default)]
    pub mode: LedbatMode,

    /// Base-delay rounds and current-delay samples kept
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Target queuing delay in milliseconds
    #[serde(default = "default_target_delay_ms")]
    pub target_delay_ms: u64,

    /// Base-delay round length in milliseconds.
    /// Unset means 60s for the deterministic policy and 1s for the probabilistic one.
    #[serde(default)]
    pub base_round_ms: Option<u64>,

    /// Multiplier on the off-target ratio. 1.0 is `GAIN = 1/TARGET`.
    #[serde(default = "default_gain")]
    pub gain: f64,
}

/// Block store batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStoreConfig {
    /// Missing blocks fetched from storage per refill
    #[serde(default = "default_batch_size")]
    pub next_batch_size: usize,

    /// Hashes handed out per hash request
    #[serde(default = "default_batch_size")]
    pub hash_batch_size: usize,

    /// Blocks past a cache hint to prefetch for a reader
    #[serde(default = "default_read_ahead_blocks")]
    pub read_ahead_blocks: u32,
}

/// Peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Time to wait for a response before the request times out
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Congestion window at session start
    #[serde(default = "default_initial_cwnd")]
    pub initial_cwnd: u32,

    /// Smallest congestion window
    #[serde(default = "default_min_cwnd")]
    pub min_cwnd: u32,

    /// Largest congestion window
    #[serde(default = "default_max_cwnd")]
    pub max_cwnd: u32,

    /// Blocks a leecher may hold in flight (on the wire or being stored)
    #[serde(default = "default_max_active_blocks")]
    pub max_active_blocks: usize,

    /// Session tick interval in milliseconds (timeouts, refills)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Activity report interval in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Consecutive timeouts before a session is reported unhealthy
    #[serde(default = "default_timeout_health_threshold")]
    pub timeout_health_threshold: u32,

    /// Whether leechers ask for hashes along with blocks
    #[serde(default = "default_true")]
    pub with_hashes: bool,

    /// Capacity of each session's inbound queue
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
}

/// Which storage backend holds file data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Keep data in memory
    Memory,
    /// Local disk under `data_dir`
    #[default]
    Disk,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "disk" | "local" => Ok(Self::Disk),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Primary backend
    #[serde(default)]
    pub backend: StorageBackend,

    /// Root directory for the disk backend
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Mirror directories receiving a copy of every write
    #[serde(default)]
    pub mirrors: Vec<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_max_ongoing_files() -> usize {
    4
}

fn default_history_size() -> usize {
    crate::congestion::HISTORY_SIZE
}

fn default_target_delay_ms() -> u64 {
    100
}

fn default_gain() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    20
}

fn default_read_ahead_blocks() -> u32 {
    8
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_initial_cwnd() -> u32 {
    4
}

fn default_min_cwnd() -> u32 {
    1
}

fn default_max_cwnd() -> u32 {
    256
}

fn default_max_active_blocks() -> usize {
    64
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_report_interval_ms() -> u64 {
    1000
}

fn default_timeout_health_threshold() -> u32 {
    3
}

fn default_inbound_queue() -> usize {
    256
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            mode: LedbatMode::default(),
            history_size: default_history_size(),
            target_delay_ms: default_target_delay_ms(),
            base_round_ms: None,
            gain: default_gain(),
        }
    }
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            next_batch_size: 20,
            hash_batch_size: 20,
            read_ahead_blocks: 8,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2000,
            initial_cwnd: 4,
            min_cwnd: 1,
            max_cwnd: 256,
            max_active_blocks: 64,
            tick_interval_ms: 100,
            report_interval_ms: 1000,
            timeout_health_threshold: 3,
            with_hashes: true,
            inbound_queue: 256,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Disk,
            data_dir: default_data_dir(),
            mirrors: Vec::new(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            congestion: CongestionConfig::default(),
            store: BlockStoreConfig::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            max_ongoing_files: default_max_ongoing_files(),
        }
    }
}

impl CongestionConfig {
    pub fn target_delay(&self) -> Duration {
        Duration::from_millis(self.target_delay_ms)
    }

    /// Base-delay round length, falling back to the policy default
    pub fn base_round(&self) -> Duration {
        self.base_round_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.mode.default_round_time())
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

impl TransferConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the LEDBAT decision policy
    pub fn ledbat_mode(mut self, mode: LedbatMode) -> Self {
        self.congestion.mode = mode;
        self
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.session.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the in-flight block memory budget per session
    pub fn max_active_blocks(mut self, max: usize) -> Self {
        self.session.max_active_blocks = max;
        self
    }

    /// Set the storage backend
    pub fn storage_backend(mut self, backend: StorageBackend) -> Self {
        self.storage.backend = backend;
        self
    }

    /// Set the disk backend root directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.data_dir = path.into();
        self
    }

    /// Add a mirror directory
    pub fn add_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.mirrors.push(path.into());
        self
    }

    /// Set how many files a torrent may have ongoing at once
    pub fn max_ongoing_files(mut self, max: usize) -> Self {
        self.max_ongoing_files = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.congestion.history_size == 0 {
            return Err(EngineError::invalid_input("history_size", "Must be at least 1"));
        }

        if self.congestion.target_delay_ms == 0 {
            return Err(EngineError::invalid_input("target_delay_ms", "Must be at least 1"));
        }

        if self.congestion.base_round_ms == Some(0) {
            return Err(EngineError::invalid_input("base_round_ms", "Must be at least 1"));
        }

        if !(self.congestion.gain.is_finite() && self.congestion.gain > 0.0) {
            return Err(EngineError::invalid_input("gain", "Must be a positive number"));
        }

        if self.store.next_batch_size == 0 {
            return Err(EngineError::invalid_input("next_batch_size", "Must be at least 1"));
        }

        if self.store.hash_batch_size == 0 {
            return Err(EngineError::invalid_input("hash_batch_size", "Must be at least 1"));
        }

        let session = &self.session;
        if session.min_cwnd == 0 {
            return Err(EngineError::invalid_input("min_cwnd", "Must be at least 1"));
        }

        if session.min_cwnd > session.max_cwnd {
            return Err(EngineError::invalid_input("min_cwnd", "Must be <= max_cwnd"));
        }

        if session.initial_cwnd < session.min_cwnd || session.initial_cwnd > session.max_cwnd {
            return Err(EngineError::invalid_input(
                "initial_cwnd",
                "Must lie within [min_cwnd, max_cwnd]",
            ));
        }

        if session.max_active_blocks == 0 {
            return Err(EngineError::invalid_input("max_active_blocks", "Must be at least 1"));
        }

        if session.request_timeout_ms == 0 || session.tick_interval_ms == 0 {
            return Err(EngineError::invalid_input(
                "request_timeout_ms",
                "Timeouts and intervals must be non-zero",
            ));
        }

        if session.report_interval_ms == 0 {
            return Err(EngineError::invalid_input("report_interval_ms", "Must be non-zero"));
        }

        if session.inbound_queue == 0 {
            return Err(EngineError::invalid_input("inbound_queue", "Must be at least 1"));
        }

        if self.max_ongoing_files == 0 {
            return Err(EngineError::invalid_input("max_ongoing_files", "Must be at least 1"));
        }

        Ok(())
    }
}
