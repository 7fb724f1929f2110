//! Mock engine for testing the streaming layer without a real download engine.
//!
//! `MockTorrent` keeps the piece bitmap, priorities and deadlines in memory and
//! only completes pieces when a test calls `complete_piece`. Piece content is
//! the deterministic pattern produced by `content_byte`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::engine::{
    AddTorrentParams, Alert, EngineError, EngineSession, EngineState, EngineStatus,
    EngineTorrent, PartialPiece, SessionCounters, TorrentSource, magnet_info_hash, priority,
};
use crate::storage::PieceStorage;
use crate::torrent::metainfo::info_hash_of;
use crate::torrent::{InfoHash, PieceIndex, TorrentCreator, TorrentInfo};

/// Byte stored at `offset` of every mock torrent's content.
pub fn content_byte(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Mock content for the byte range `[start, start + len)`.
pub fn content_range(start: u64, len: u64) -> Vec<u8> {
    (start..start + len).map(content_byte).collect()
}

/// Real bencoded metainfo for `info` filled with the mock content.
///
/// Paths below `info.name` become the file paths of a multi-file torrent; a
/// single file named like the torrent becomes a single-file torrent.
pub fn mock_metainfo(info: &TorrentInfo) -> Vec<u8> {
    let creator = TorrentCreator::new().with_piece_length(info.piece_length);
    let single = info.files.len() == 1 && info.files[0].path == info.name;
    let built = if single {
        creator.create_from_bytes(&info.name, &content_range(0, info.total_size))
    } else {
        let prefix = format!("{}/", info.name);
        let files = info
            .files
            .iter()
            .map(|file| {
                let relative = file.path.strip_prefix(&prefix).unwrap_or(&file.path);
                (
                    relative.split('/').map(str::to_string).collect(),
                    content_range(file.offset, file.size),
                )
            })
            .collect();
        creator.create_from_files(&info.name, files)
    };
    built.unwrap_or_default()
}

/// Info hash of `mock_metainfo(info)`.
pub fn mock_info_hash(info: &TorrentInfo) -> InfoHash {
    info_hash_of(&mock_metainfo(info)).unwrap_or_else(|_| {
        let mut hash = [0u8; 20];
        for (i, byte) in info.name.bytes().enumerate() {
            hash[i % 20] = hash[i % 20].wrapping_mul(31).wrapping_add(byte);
        }
        InfoHash::new(hash)
    })
}

/// In-memory torrent handle driven by tests.
pub struct MockTorrent {
    info_hash: InfoHash,
    info: RwLock<Option<Arc<TorrentInfo>>>,
    have: Mutex<Vec<bool>>,
    priorities: Mutex<Vec<u8>>,
    deadlines: Mutex<HashMap<PieceIndex, Duration>>,
    forgotten: Mutex<Vec<PieceIndex>>,
    file_priorities: Mutex<Vec<u8>>,
    download_queue: Mutex<Vec<PartialPiece>>,
    status: Mutex<EngineStatus>,
    storage: Mutex<Option<Arc<dyn PieceStorage>>>,
    alerts: Arc<Mutex<Vec<Alert>>>,
    paused: AtomicBool,
    sequential: AtomicBool,
    resume_requests: AtomicUsize,
    priority_batches: AtomicUsize,
    loaded_resume_data: Mutex<Option<Vec<u8>>>,
    /// Makes `read_piece` fail while set
    pub fail_reads: Arc<AtomicBool>,
}

impl MockTorrent {
    /// Creates a torrent with metadata and a private alert queue.
    pub fn new(info: TorrentInfo) -> Arc<Self> {
        let info_hash = mock_info_hash(&info);
        let torrent = Self::without_metadata(info_hash, Arc::new(Mutex::new(Vec::new())));
        torrent.set_info(info);
        Arc::new(torrent)
    }

    /// Creates a torrent still waiting for metadata, posting alerts to `alerts`.
    pub fn without_metadata(info_hash: InfoHash, alerts: Arc<Mutex<Vec<Alert>>>) -> Self {
        Self {
            info_hash,
            info: RwLock::new(None),
            have: Mutex::new(Vec::new()),
            priorities: Mutex::new(Vec::new()),
            deadlines: Mutex::new(HashMap::new()),
            forgotten: Mutex::new(Vec::new()),
            file_priorities: Mutex::new(Vec::new()),
            download_queue: Mutex::new(Vec::new()),
            status: Mutex::new(EngineStatus::default()),
            storage: Mutex::new(None),
            alerts,
            paused: AtomicBool::new(false),
            sequential: AtomicBool::new(false),
            resume_requests: AtomicUsize::new(0),
            priority_batches: AtomicUsize::new(0),
            loaded_resume_data: Mutex::new(None),
            fail_reads: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs metadata, sizing the piece tables.
    pub fn set_info(&self, info: TorrentInfo) {
        let pieces = info.piece_count() as usize;
        *self.have.lock() = vec![false; pieces];
        *self.priorities.lock() = vec![priority::DEFAULT; pieces];
        *self.file_priorities.lock() = vec![priority::DEFAULT; info.files.len()];
        {
            let mut status = self.status.lock();
            status.has_metadata = true;
            status.state = EngineState::Downloading;
            status.is_auto_managed = true;
            status.total = info.total_size;
            status.total_wanted = info.total_size;
        }
        *self.info.write() = Some(Arc::new(info));
    }

    /// Marks `piece` downloaded, writing it into the attached storage first.
    ///
    /// Returns false if the storage did not accept the whole piece.
    pub fn complete_piece(&self, piece: PieceIndex) -> bool {
        let Some(info) = self.torrent_info() else {
            return false;
        };
        let len = info.piece_size(piece);
        if len == 0 {
            return false;
        }
        let data = content_range(info.piece_offset(piece), len as u64);

        let storage = self.storage.lock().clone();
        if let Some(storage) = storage {
            if storage.write(piece, 0, &data) < data.len() {
                return false;
            }
        }

        if let Some(had) = self.have.lock().get_mut(piece.as_usize()) {
            *had = true;
        }
        self.alerts.lock().push(Alert::PieceFinished {
            info_hash: self.info_hash,
            piece,
        });
        true
    }

    pub fn set_status(&self, status: EngineStatus) {
        *self.status.lock() = status;
    }

    pub fn set_download_queue(&self, queue: Vec<PartialPiece>) {
        *self.download_queue.lock() = queue;
    }

    pub fn push_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }

    pub fn deadline(&self, piece: PieceIndex) -> Option<Duration> {
        self.deadlines.lock().get(&piece).copied()
    }

    pub fn forgotten(&self) -> Vec<PieceIndex> {
        self.forgotten.lock().clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_sequential(&self) -> bool {
        self.sequential.load(Ordering::SeqCst)
    }

    pub fn resume_requests(&self) -> usize {
        self.resume_requests.load(Ordering::SeqCst)
    }

    pub fn priority_batches(&self) -> usize {
        self.priority_batches.load(Ordering::SeqCst)
    }

    pub fn loaded_resume_data(&self) -> Option<Vec<u8>> {
        self.loaded_resume_data.lock().clone()
    }

    pub fn has_storage(&self) -> bool {
        self.storage.lock().is_some()
    }
}

impl EngineTorrent for MockTorrent {
    fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    fn torrent_info(&self) -> Option<Arc<TorrentInfo>> {
        self.info.read().clone()
    }

    fn status(&self) -> EngineStatus {
        let mut status = self.status.lock().clone();
        status.is_paused = self.is_paused();
        status
    }

    fn have_piece(&self, piece: PieceIndex) -> bool {
        self.have
            .lock()
            .get(piece.as_usize())
            .copied()
            .unwrap_or(false)
    }

    fn piece_priority(&self, piece: PieceIndex) -> u8 {
        self.priorities
            .lock()
            .get(piece.as_usize())
            .copied()
            .unwrap_or(priority::DONT_DOWNLOAD)
    }

    fn piece_priorities(&self) -> Vec<u8> {
        self.priorities.lock().clone()
    }

    fn set_piece_priority(&self, piece: PieceIndex, value: u8) {
        if let Some(slot) = self.priorities.lock().get_mut(piece.as_usize()) {
            *slot = value;
        }
    }

    fn prioritize_pieces(&self, priorities: &[(PieceIndex, u8)]) {
        self.priority_batches.fetch_add(1, Ordering::SeqCst);
        let mut current = self.priorities.lock();
        for &(piece, value) in priorities {
            if let Some(slot) = current.get_mut(piece.as_usize()) {
                *slot = value;
            }
        }
    }

    fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration) {
        self.deadlines.lock().insert(piece, deadline);
    }

    fn reset_piece_deadline(&self, piece: PieceIndex) {
        self.deadlines.lock().remove(&piece);
    }

    fn forget_piece(&self, piece: PieceIndex) {
        if let Some(had) = self.have.lock().get_mut(piece.as_usize()) {
            *had = false;
        }
        self.forgotten.lock().push(piece);
    }

    fn download_queue(&self) -> Vec<PartialPiece> {
        self.download_queue.lock().clone()
    }

    fn file_priority(&self, file: usize) -> u8 {
        self.file_priorities
            .lock()
            .get(file)
            .copied()
            .unwrap_or(priority::DONT_DOWNLOAD)
    }

    fn set_file_priority(&self, file: usize, value: u8) {
        if let Some(slot) = self.file_priorities.lock().get_mut(file) {
            *slot = value;
        }
    }

    fn file_progress(&self) -> Vec<u64> {
        let Some(info) = self.torrent_info() else {
            return Vec::new();
        };
        let have = self.have.lock();
        let piece_length = info.piece_length as u64;

        info.files
            .iter()
            .map(|file| {
                let end = file.offset + file.size;
                have.iter()
                    .enumerate()
                    .filter(|(_, had)| **had)
                    .map(|(index, _)| {
                        let start = index as u64 * piece_length;
                        let stop = (start + piece_length).min(info.total_size);
                        stop.min(end).saturating_sub(start.max(file.offset))
                    })
                    .sum()
            })
            .collect()
    }

    fn attach_storage(&self, storage: Arc<dyn PieceStorage>) {
        *self.storage.lock() = Some(storage);
    }

    fn read_piece(
        &self,
        piece: PieceIndex,
        offset: u32,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::ReadFailed {
                piece,
                reason: "Mock read failure".to_string(),
            });
        }
        let Some(info) = self.torrent_info() else {
            return Ok(0);
        };
        if !self.have_piece(piece) {
            return Ok(0);
        }

        let len = info.piece_size(piece).saturating_sub(offset).min(out.len() as u32) as usize;
        let start = info.piece_offset(piece) + offset as u64;
        out[..len].copy_from_slice(&content_range(start, len as u64));
        Ok(len)
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn set_sequential_download(&self, sequential: bool) {
        self.sequential.store(sequential, Ordering::SeqCst);
    }

    fn save_resume_data(&self) {
        self.resume_requests.fetch_add(1, Ordering::SeqCst);
        self.alerts.lock().push(Alert::SaveResumeData {
            info_hash: self.info_hash,
            data: format!("resume:{}", self.info_hash).into_bytes(),
        });
    }

    fn metainfo(&self) -> Option<Vec<u8>> {
        self.torrent_info().map(|info| mock_metainfo(&info))
    }
}

/// Mock session that resolves sources against content published by tests.
pub struct MockEngine {
    published: Mutex<HashMap<InfoHash, TorrentInfo>>,
    torrents: Mutex<HashMap<InfoHash, Arc<MockTorrent>>>,
    alerts: Arc<Mutex<Vec<Alert>>>,
    added: Mutex<Vec<AddTorrentParams>>,
    removed: Mutex<Vec<(InfoHash, bool)>>,
    paused: AtomicBool,
    /// Makes `add_torrent` fail while set
    pub fail_add: Arc<AtomicBool>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(HashMap::new()),
            torrents: Mutex::new(HashMap::new()),
            alerts: Arc::new(Mutex::new(Vec::new())),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            fail_add: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Makes `info` resolvable by magnet link or metainfo.
    pub fn publish(&self, info: TorrentInfo) -> InfoHash {
        let info_hash = mock_info_hash(&info);
        self.published.lock().insert(info_hash, info);
        info_hash
    }

    /// Hands a magnet torrent its metadata and posts `MetadataReceived`.
    pub fn deliver_metadata(&self, info_hash: InfoHash) -> bool {
        let info = self.published.lock().get(&info_hash).cloned();
        let torrent = self.torrent(info_hash);
        match (info, torrent) {
            (Some(info), Some(torrent)) => {
                torrent.set_info(info);
                self.push_alert(Alert::MetadataReceived { info_hash });
                true
            }
            _ => false,
        }
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<MockTorrent>> {
        self.torrents.lock().get(&info_hash).cloned()
    }

    pub fn push_alert(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }

    /// Parameters of every successful `add_torrent` call, oldest first.
    pub fn added(&self) -> Vec<AddTorrentParams> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<(InfoHash, bool)> {
        self.removed.lock().clone()
    }

    fn resolve(&self, source: &TorrentSource) -> Result<(InfoHash, Option<TorrentInfo>), EngineError> {
        match source {
            TorrentSource::Magnet(uri) => Ok((magnet_info_hash(uri)?, None)),
            TorrentSource::Metainfo(bytes) => {
                let info_hash = info_hash_of(bytes)?;
                let info = self.published.lock().get(&info_hash).cloned().ok_or_else(|| {
                    EngineError::Metainfo {
                        reason: format!("Unknown content {info_hash}"),
                    }
                })?;
                Ok((info_hash, Some(info)))
            }
        }
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineSession for MockEngine {
    fn add_torrent(&self, params: AddTorrentParams) -> Result<Arc<dyn EngineTorrent>, EngineError> {
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidSource {
                reason: "Mock add failure".to_string(),
            });
        }

        let (info_hash, info) = self.resolve(&params.source)?;
        let mut torrents = self.torrents.lock();
        if torrents.contains_key(&info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash });
        }

        let torrent = Arc::new(MockTorrent::without_metadata(
            info_hash,
            Arc::clone(&self.alerts),
        ));
        if let Some(info) = info {
            torrent.set_info(info);
        }
        if params.paused {
            torrent.pause();
        }
        torrent.set_sequential_download(params.sequential_download);
        *torrent.loaded_resume_data.lock() = params.resume_data.clone();

        torrents.insert(info_hash, Arc::clone(&torrent));
        self.added.lock().push(params);
        Ok(torrent)
    }

    fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError> {
        self.torrents
            .lock()
            .remove(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;
        self.removed.lock().push((info_hash, delete_files));
        Ok(())
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    fn post_torrent_updates(&self) {
        let statuses = self
            .torrents
            .lock()
            .values()
            .map(|torrent| (torrent.info_hash(), torrent.status()))
            .collect();
        self.push_alert(Alert::StateUpdate { statuses });
    }

    fn post_session_stats(&self) {
        let num_torrents = self.torrents.lock().len();
        self.push_alert(Alert::SessionStats(SessionCounters {
            num_torrents,
            ..SessionCounters::default()
        }));
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
