//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyvault_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_TRANSFER_CHUNK_SIZE};

use crate::retry::RetryPolicy;

/// Tunables for the transfer engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root for stored objects, staging files and task records.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Size of client upload chunks, in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Read size for server-side transfers, in bytes.
    #[serde(default = "default_transfer_chunk_size")]
    pub transfer_chunk_size: usize,

    /// Transfers allowed to move bytes at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,

    /// Upload sessions idle this long may be reclaimed.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub quota: QuotaSettings,
}

/// Backoff schedule for transient I/O failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

/// Storage allowance applied to every principal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaSettings {
    /// Bytes each principal may upload; absent means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_per_principal: Option<u64>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_transfer_chunk_size() -> usize {
    DEFAULT_TRANSFER_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    4
}

fn default_session_idle_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chunk_size: default_chunk_size(),
            transfer_chunk_size: default_transfer_chunk_size(),
            max_concurrent_transfers: default_max_concurrent(),
            session_idle_secs: default_session_idle_secs(),
            retry: RetrySettings::default(),
            quota: QuotaSettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
        }
    }
}

impl EngineConfig {
    /// Directory holding the object store.
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Directory holding task records.
    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// Path of the content index journal.
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join("content-index.json")
    }

    pub fn session_idle_window(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}
