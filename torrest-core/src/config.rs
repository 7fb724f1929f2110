//! Centralized configuration for Torrest.
//!
//! All tunable parameters are defined here so the storage, scheduling and
//! session layers never carry their own hard-coded values.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TorrestError;
use crate::storage::StorageType;

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Extra memory kept on top of the head and tail buffers when sizing memory storage.
pub const MEMORY_HEADROOM: u64 = 8 * MIB;

/// Central configuration for all Torrest components.
///
/// Groups related settings into sections. Supports environment variable
/// overrides and is exchanged as JSON by the settings endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrestConfig {
    pub storage: StorageConfig,
    pub streaming: StreamingConfig,
    pub session: SessionConfig,
    pub web: WebConfig,
}

/// How the memory budget is picked when automatic sizing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStrategy {
    /// Always use the configured minimum.
    Min,
    /// 8 percent of physical memory.
    #[default]
    Standard,
    /// 15 percent of physical memory.
    Max,
}

/// Piece storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage used when a torrent is added with `StorageType::Automatic`
    pub download_storage: StorageType,
    /// Memory budget per memory-backed torrent, in bytes
    pub memory_size: u64,
    /// Pick `memory_size` from physical memory at startup
    pub auto_memory_size: bool,
    pub auto_memory_strategy: MemoryStrategy,
    /// Lower bound used by the `min` strategy
    pub memory_size_min: u64,
    /// Upper bound for automatically picked sizes
    pub memory_size_max: u64,
    /// Refuse buffer slots for pieces no reader currently wants
    pub readers_only_allocation: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            download_storage: StorageType::Memory,
            memory_size: 100 * MIB,
            auto_memory_size: false,
            auto_memory_strategy: MemoryStrategy::Standard,
            memory_size_min: 40 * MIB,
            memory_size_max: 300 * MIB,
            readers_only_allocation: false,
        }
    }
}

/// Buffering and reader scheduling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Head budget prefetched by `File::start_buffer`, in bytes
    pub buffer_size: u64,
    /// Tail budget prefetched by `File::start_buffer`, in bytes
    pub end_buffer_size: u64,
    /// Upper bound for a single piece wait
    #[serde(with = "duration_millis")]
    pub buffer_timeout: Duration,
    /// Slice between piece availability checks while a reader waits
    #[serde(with = "duration_millis")]
    pub piece_wait_interval: Duration,
    /// Share of the memory buffers handed to reader read-ahead
    pub readahead_percent: u32,
    /// Read-ahead budget for file-backed torrents, in pieces
    pub file_readahead_pieces: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: 20 * MIB,
            end_buffer_size: 4 * MIB,
            buffer_timeout: Duration::from_secs(60),
            piece_wait_interval: Duration::from_millis(300),
            readahead_percent: 80,
            file_readahead_pieces: 20,
        }
    }
}

/// Session loops and persistence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where file-backed torrents keep their data
    pub download_path: PathBuf,
    /// Where `.torrent` and resume files are kept
    pub torrents_path: PathBuf,
    /// Re-add file-backed torrents found in `torrents_path` on startup
    pub autoload_torrents: bool,
    #[serde(with = "duration_millis")]
    pub prioritize_interval: Duration,
    #[serde(with = "duration_millis")]
    pub alerts_interval: Duration,
    #[serde(with = "duration_millis")]
    pub resume_data_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_path: PathBuf::from("downloads"),
            torrents_path: PathBuf::from("downloads/torrents"),
            autoload_torrents: true,
            prioritize_interval: Duration::from_millis(500),
            alerts_interval: Duration::from_millis(500),
            resume_data_interval: Duration::from_secs(30),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub interface: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            interface: "0.0.0.0".to_string(),
            port: 65225,
        }
    }
}

impl TorrestConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Sizes are given in MiB, timeouts in seconds.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(storage) = std::env::var("TORREST_DOWNLOAD_STORAGE") {
            if let Ok(storage) = storage.parse::<StorageType>() {
                config.storage.download_storage = storage;
            }
        }

        if let Ok(size) = std::env::var("TORREST_MEMORY_SIZE") {
            if let Ok(mib) = size.parse::<u64>() {
                config.storage.memory_size = mib * MIB;
            }
        }

        if let Ok(auto) = std::env::var("TORREST_AUTO_MEMORY_SIZE") {
            config.storage.auto_memory_size = auto.parse().unwrap_or(false);
        }

        if let Ok(size) = std::env::var("TORREST_BUFFER_SIZE") {
            if let Ok(mib) = size.parse::<u64>() {
                config.streaming.buffer_size = mib * MIB;
            }
        }

        if let Ok(size) = std::env::var("TORREST_END_BUFFER_SIZE") {
            if let Ok(mib) = size.parse::<u64>() {
                config.streaming.end_buffer_size = mib * MIB;
            }
        }

        if let Ok(timeout) = std::env::var("TORREST_BUFFER_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.streaming.buffer_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(percent) = std::env::var("TORREST_READAHEAD_PERCENT") {
            if let Ok(percent) = percent.parse::<u32>() {
                config.streaming.readahead_percent = percent;
            }
        }

        if let Ok(path) = std::env::var("TORREST_DOWNLOAD_PATH") {
            config.session.download_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("TORREST_TORRENTS_PATH") {
            config.session.torrents_path = PathBuf::from(path);
        }

        if let Ok(port) = std::env::var("TORREST_WEB_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.web.port = port;
            }
        }

        config
    }

    /// Creates a configuration with small buffers and fast loops for tests.
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig {
                memory_size: 4 * MIB,
                ..Default::default()
            },
            streaming: StreamingConfig {
                buffer_size: 64 * 1024,
                end_buffer_size: 16 * 1024,
                buffer_timeout: Duration::from_secs(2),
                piece_wait_interval: Duration::from_millis(20),
                ..Default::default()
            },
            session: SessionConfig {
                autoload_torrents: false,
                prioritize_interval: Duration::from_millis(20),
                alerts_interval: Duration::from_millis(20),
                resume_data_interval: Duration::from_millis(200),
                ..Default::default()
            },
            web: WebConfig {
                interface: "127.0.0.1".to_string(),
                port: 0,
            },
        }
    }

    /// Checks the values that would otherwise stall the scheduling loops.
    ///
    /// # Errors
    ///
    /// - `TorrestError::Configuration` - A size, percentage or interval is out of range
    pub fn validate(&self) -> Result<(), TorrestError> {
        let fail = |reason: &str| {
            Err(TorrestError::Configuration {
                reason: reason.to_string(),
            })
        };

        if self.storage.memory_size == 0 && !self.storage.auto_memory_size {
            return fail("memory_size must be greater than zero");
        }
        if self.storage.memory_size_min > self.storage.memory_size_max {
            return fail("memory_size_min must not exceed memory_size_max");
        }
        if self.streaming.readahead_percent == 0 || self.streaming.readahead_percent > 100 {
            return fail("readahead_percent must be within 1..=100");
        }
        if self.streaming.buffer_timeout.is_zero() || self.streaming.piece_wait_interval.is_zero() {
            return fail("buffer_timeout and piece_wait_interval must be positive");
        }
        if self.session.prioritize_interval.is_zero() || self.session.alerts_interval.is_zero() {
            return fail("session loop intervals must be positive");
        }
        Ok(())
    }

    /// Smallest memory budget that still fits the head and tail buffers.
    pub fn required_memory_size(&self) -> u64 {
        self.streaming.buffer_size + self.streaming.end_buffer_size + MEMORY_HEADROOM
    }

    /// Memory budget handed to new memory-backed torrents.
    ///
    /// Applies automatic sizing from physical memory when enabled, then raises
    /// the result to `required_memory_size`.
    pub fn effective_memory_size(&self) -> u64 {
        let size = if self.storage.auto_memory_size {
            let picked = auto_memory_size(
                self.storage.auto_memory_strategy,
                total_system_memory(),
                self.storage.memory_size_min,
                self.storage.memory_size_max,
            );
            tracing::info!(
                strategy = ?self.storage.auto_memory_strategy,
                size_mib = picked / MIB,
                "Automatically selected memory size"
            );
            picked
        } else {
            self.storage.memory_size
        };

        size.max(self.required_memory_size())
    }
}

/// Picks a memory budget from the physical memory size.
///
/// `min` always yields `minimum`; the other strategies take a share of
/// `total_memory` and are capped at `maximum`.
pub fn auto_memory_size(
    strategy: MemoryStrategy,
    total_memory: u64,
    minimum: u64,
    maximum: u64,
) -> u64 {
    let percent = match strategy {
        MemoryStrategy::Min => return minimum,
        MemoryStrategy::Standard => 8,
        MemoryStrategy::Max => 15,
    };

    let share = total_memory / 100 * percent;
    if share == 0 {
        return minimum;
    }
    share.min(maximum)
}

fn total_system_memory() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
