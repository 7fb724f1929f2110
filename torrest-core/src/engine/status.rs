//! Raw status counters reported by the engine.

use std::time::Duration;

use crate::torrent::PieceIndex;

/// Coarse lifecycle state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    CheckingFiles,
    #[default]
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    CheckingResumeData,
}

/// Snapshot of one torrent as the engine sees it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Last engine error, `None` while healthy
    pub error: Option<String>,
    pub is_paused: bool,
    pub is_auto_managed: bool,
    pub has_metadata: bool,
    pub is_seeding: bool,
    pub is_finished: bool,
    pub total: u64,
    pub total_done: u64,
    pub total_wanted: u64,
    pub total_wanted_done: u64,
    /// Fraction in `0.0..=1.0`
    pub progress: f64,
    /// Payload bytes per second
    pub download_rate: u64,
    pub upload_rate: u64,
    pub num_seeds: u32,
    pub num_complete: u32,
    pub num_peers: u32,
    pub num_incomplete: u32,
    pub active_duration: Duration,
    pub finished_duration: Duration,
    pub seeding_duration: Duration,
    pub all_time_download: u64,
    pub all_time_upload: u64,
}

/// A piece that is partially downloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialPiece {
    pub piece: PieceIndex,
    pub bytes_downloaded: u64,
}
