//! Tunables of the simulated swarm.

use std::time::Duration;

/// Configuration for the development engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Interval between downloader ticks
    pub tick_interval: Duration,
    /// Payload bytes per second shared by all downloading torrents
    pub download_rate: u64,
    /// Pieces worked on concurrently per torrent
    pub pieces_per_tick: usize,
    /// Delay before a seeded magnet receives its metadata
    pub metadata_delay: Duration,
    /// Peer count reported in status and tracker replies
    pub peers: u32,
    /// Random seed for deterministic piece choice
    pub seed: u64,
    /// Index window non-sequential torrents shuffle their piece choice within
    pub jitter: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            download_rate: 8 * 1024 * 1024,
            pieces_per_tick: 4,
            metadata_delay: Duration::from_millis(500),
            peers: 25,
            seed: 12345,
            jitter: 3,
        }
    }
}

impl SimConfig {
    /// Near-instant delivery for tests and fast local iteration.
    pub fn instant() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            download_rate: 1024 * 1024 * 1024,
            pieces_per_tick: 16,
            metadata_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Slow swarm where readers regularly wait for pieces.
    pub fn poor() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            download_rate: 512 * 1024,
            pieces_per_tick: 2,
            metadata_delay: Duration::from_secs(3),
            peers: 3,
            ..Self::default()
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Self::default()
        }
    }

    /// Bytes the whole engine may deliver in one tick, at least one.
    pub fn bytes_per_tick(&self) -> u64 {
        let per_tick = self.download_rate as u128 * self.tick_interval.as_millis() / 1000;
        per_tick.clamp(1, u64::MAX as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_tick_follows_rate() {
        let config = SimConfig {
            tick_interval: Duration::from_millis(100),
            download_rate: 1_000_000,
            ..SimConfig::default()
        };
        assert_eq!(config.bytes_per_tick(), 100_000);
    }

    #[test]
    fn test_bytes_per_tick_never_zero() {
        let config = SimConfig {
            tick_interval: Duration::ZERO,
            ..SimConfig::default()
        };
        assert_eq!(config.bytes_per_tick(), 1);
    }
}
