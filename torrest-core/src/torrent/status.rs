//! Status snapshots reported to API clients.

use serde::{Deserialize, Serialize};

use crate::engine::EngineStatus;
use crate::torrent::TorrentState;

/// Transfer status of one torrent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentStatus {
    pub total: u64,
    pub total_done: u64,
    pub total_wanted: u64,
    pub total_wanted_done: u64,
    /// Percent, 0 to 100
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub state: TorrentState,
    pub state_string: String,
    pub seeders: u32,
    pub seeders_total: u32,
    pub peers: u32,
    pub peers_total: u32,
    /// Seconds
    pub seeding_time: u64,
    pub finished_time: u64,
    pub active_time: u64,
    pub total_download: u64,
    pub total_upload: u64,
}

impl TorrentStatus {
    pub fn from_engine(status: &EngineStatus, state: TorrentState) -> Self {
        Self {
            total: status.total,
            total_done: status.total_done,
            total_wanted: status.total_wanted,
            total_wanted_done: status.total_wanted_done,
            progress: status.progress * 100.0,
            download_rate: status.download_rate,
            upload_rate: status.upload_rate,
            state,
            state_string: state.as_str().to_string(),
            seeders: status.num_seeds,
            seeders_total: status.num_complete,
            peers: status.num_peers,
            peers_total: status.num_incomplete,
            seeding_time: status.seeding_duration.as_secs(),
            finished_time: status.finished_duration.as_secs(),
            active_time: status.active_duration.as_secs(),
            total_download: status.all_time_download,
            total_upload: status.all_time_upload,
        }
    }
}

/// Download and buffering status of one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStatus {
    pub total: u64,
    pub total_done: u64,
    /// Percent, 0 to 100
    pub progress: f64,
    pub priority: u8,
    /// Bytes selected for initial buffering
    pub buffering_total: u64,
    pub buffering_progress: f64,
}

/// Session-wide summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub torrents_count: usize,
    pub is_paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reports_percent_progress() {
        let engine = EngineStatus {
            progress: 0.25,
            num_peers: 3,
            ..EngineStatus::default()
        };
        let status = TorrentStatus::from_engine(&engine, TorrentState::Downloading);

        assert_eq!(status.progress, 25.0);
        assert_eq!(status.peers, 3);
        assert_eq!(status.state_string, "Downloading");

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], 2);
    }
}
