//! A torrent inside the session: files, readers and piece scheduling.
//!
//! The torrent turns the positions of its live readers into engine piece
//! priorities and deadlines once per scheduling tick, and wakes blocked
//! readers whenever a piece finishes.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::{StreamingConfig, TorrestConfig};
use crate::engine::{Alert, EngineState, EngineStatus, EngineTorrent, priority};
use crate::session::persistence;
use crate::storage::{
    FileStorage, MemoryStorage, PieceSet, PieceStorage, StorageBackend, StorageType,
};
use crate::streaming::{File, ReaderCursor, ReaderRegistry};
use crate::torrent::priority::{DEADLINE_STEP, ReaderWindow, plan_pieces};
use crate::torrent::{
    FileStatus, InfoHash, PieceIndex, TorrentError, TorrentInfo, TorrentState, TorrentStatus,
    derive_state,
};

/// Peer counts and last message reported by one tracker (or the DHT).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackerInfo {
    pub last_message: String,
    /// Highest peer count seen
    pub num_peers: u32,
}

/// How a torrent is set up when it is added.
#[derive(Debug, Clone)]
pub struct TorrentOptions {
    /// Already resolved, never `StorageType::Automatic`
    pub storage: StorageType,
    pub streaming: StreamingConfig,
    /// Memory budget in bytes for memory storage
    pub memory_size: u64,
    pub readers_only: bool,
    pub torrents_path: PathBuf,
    pub paused: bool,
}

impl TorrentOptions {
    pub fn from_config(config: &TorrestConfig, storage: StorageType, paused: bool) -> Self {
        Self {
            storage: storage.resolve(config.storage.download_storage),
            streaming: config.streaming.clone(),
            memory_size: config.effective_memory_size(),
            readers_only: config.storage.readers_only_allocation,
            torrents_path: config.session.torrents_path.clone(),
            paused,
        }
    }
}

pub struct Torrent {
    info_hash: InfoHash,
    handle: Arc<dyn EngineTorrent>,
    storage_type: StorageType,
    backend: RwLock<Option<StorageBackend>>,
    info: RwLock<Option<Arc<TorrentInfo>>>,
    files: RwLock<Vec<Arc<File>>>,
    readers: ReaderRegistry,
    trackers: Mutex<BTreeMap<String, TrackerInfo>>,
    /// Pieces holding a deadline set by us
    deadlines: Mutex<HashSet<PieceIndex>>,
    streaming: RwLock<StreamingConfig>,
    memory_size: AtomicU64,
    readers_only: AtomicBool,
    torrents_path: PathBuf,
    status: RwLock<EngineStatus>,
    state: RwLock<TorrentState>,
    has_seed_status: AtomicBool,
    closing: AtomicBool,
    stopped: AtomicBool,
    prioritize_lock: Mutex<()>,
    piece_events: Mutex<u64>,
    piece_arrived: Condvar,
    added_at: DateTime<Utc>,
}

impl Torrent {
    /// Wraps an engine torrent, building files and storage if metadata is known.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - The storage for the metadata could not be set up
    pub fn new(
        handle: Arc<dyn EngineTorrent>,
        options: TorrentOptions,
    ) -> Result<Arc<Self>, TorrentError> {
        let storage_type = options.storage.resolve(StorageType::Memory);
        let torrent = Arc::new(Self {
            info_hash: handle.info_hash(),
            handle,
            storage_type,
            backend: RwLock::new(None),
            info: RwLock::new(None),
            files: RwLock::new(Vec::new()),
            readers: ReaderRegistry::new(),
            trackers: Mutex::new(BTreeMap::new()),
            deadlines: Mutex::new(HashSet::new()),
            streaming: RwLock::new(options.streaming),
            memory_size: AtomicU64::new(options.memory_size),
            readers_only: AtomicBool::new(options.readers_only),
            torrents_path: options.torrents_path,
            status: RwLock::new(EngineStatus::default()),
            state: RwLock::new(TorrentState::Unknown),
            has_seed_status: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            stopped: AtomicBool::new(options.paused),
            prioritize_lock: Mutex::new(()),
            piece_events: Mutex::new(0),
            piece_arrived: Condvar::new(),
            added_at: Utc::now(),
        });

        info!(info_hash = %torrent.info_hash, storage = %storage_type, "Created torrent");

        if torrent.handle.torrent_info().is_some() {
            torrent.on_metadata_received()?;
        }
        torrent.refresh_status();
        Ok(torrent)
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    pub fn engine(&self) -> &Arc<dyn EngineTorrent> {
        &self.handle
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn is_memory_storage(&self) -> bool {
        self.storage_type == StorageType::Memory
    }

    /// Storage of the torrent, `None` until metadata is known.
    pub fn backend(&self) -> Option<StorageBackend> {
        self.backend.read().clone()
    }

    pub fn memory_storage(&self) -> Option<Arc<MemoryStorage>> {
        self.backend
            .read()
            .as_ref()
            .and_then(|backend| backend.memory().cloned())
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn streaming_config(&self) -> StreamingConfig {
        self.streaming.read().clone()
    }

    pub fn set_streaming_config(&self, config: StreamingConfig) {
        *self.streaming.write() = config;
    }

    pub fn set_readers_only(&self, enabled: bool) {
        self.readers_only.store(enabled, Ordering::Release);
        if let Some(storage) = self.memory_storage() {
            storage.set_readers_only(enabled);
        }
    }

    pub fn has_metadata(&self) -> bool {
        self.info.read().is_some()
    }

    pub fn info(&self) -> Option<Arc<TorrentInfo>> {
        self.info.read().clone()
    }

    /// Torrent name, or the hex info hash while metadata is missing.
    pub fn name(&self) -> String {
        self.info()
            .map(|info| info.name.clone())
            .unwrap_or_else(|| self.info_hash.to_string())
    }

    /// Content size in bytes, zero without metadata.
    pub fn size(&self) -> u64 {
        self.info().map(|info| info.total_size).unwrap_or(0)
    }

    pub fn piece_length(&self) -> u32 {
        self.info().map(|info| info.piece_length).unwrap_or(0)
    }

    pub fn piece_count(&self) -> u32 {
        self.info().map(|info| info.piece_count()).unwrap_or(0)
    }

    pub fn piece_size(&self, piece: PieceIndex) -> u32 {
        self.info().map(|info| info.piece_size(piece)).unwrap_or(0)
    }

    pub fn have_piece(&self, piece: PieceIndex) -> bool {
        self.handle.have_piece(piece)
    }

    pub fn piece_priority(&self, piece: PieceIndex) -> u8 {
        self.handle.piece_priority(piece)
    }

    /// Builds files and storage from freshly received metadata.
    ///
    /// Does nothing if the torrent is already set up.
    ///
    /// # Errors
    ///
    /// - `TorrentError::MetadataUnavailable` - The engine has no metadata yet
    pub fn on_metadata_received(&self) -> Result<(), TorrentError> {
        let info = self
            .handle
            .torrent_info()
            .ok_or(TorrentError::MetadataUnavailable {
                info_hash: self.info_hash,
            })?;
        if self.backend.read().is_some() {
            return Ok(());
        }

        let backend = match self.storage_type {
            StorageType::Memory => {
                let storage = Arc::new(MemoryStorage::new(
                    self.info_hash,
                    &info,
                    self.memory_size.load(Ordering::Acquire),
                    Arc::downgrade(&self.handle),
                ));
                storage.set_readers_only(self.readers_only.load(Ordering::Acquire));
                self.handle
                    .attach_storage(Arc::clone(&storage) as Arc<dyn PieceStorage>);
                storage.initialize();
                StorageBackend::Memory(storage)
            }
            StorageType::File | StorageType::Automatic => {
                StorageBackend::File(FileStorage::new(Arc::clone(&self.handle)))
            }
        };

        let streaming = self.streaming_config();
        let files = info
            .files
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let selected = self.handle.file_priority(index) > priority::DONT_DOWNLOAD;
                Arc::new(File::new(
                    self.info_hash,
                    index,
                    entry,
                    &info,
                    &streaming,
                    selected,
                ))
            })
            .collect();

        self.deadlines.lock().clear();
        *self.files.write() = files;
        *self.info.write() = Some(Arc::clone(&info));
        *self.backend.write() = Some(backend);

        info!(
            info_hash = %self.info_hash,
            name = %info.name,
            pieces = info.piece_count(),
            files = info.files.len(),
            "Metadata received"
        );

        self.save_torrent_file();
        self.save_resume_data();
        Ok(())
    }

    pub fn files(&self) -> Vec<Arc<File>> {
        self.files.read().clone()
    }

    /// # Errors
    ///
    /// - `TorrentError::FileNotFound` - No file with this index
    pub fn get_file(&self, index: usize) -> Result<Arc<File>, TorrentError> {
        self.files
            .read()
            .iter()
            .find(|file| file.index() == index)
            .cloned()
            .ok_or(TorrentError::FileNotFound {
                info_hash: self.info_hash,
                index,
            })
    }

    pub fn register_reader(&self, cursor: &Arc<ReaderCursor>) {
        self.readers.register(cursor);
    }

    pub fn unregister_reader(&self, id: u64) {
        self.readers.unregister(id);
    }

    pub fn has_readers(&self) -> bool {
        !self.readers.is_empty()
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Read-ahead budget in pieces for one scheduling tick.
    pub fn readahead_pieces(&self) -> usize {
        match self.memory_storage() {
            Some(storage) => {
                storage.buffer_count() * self.streaming.read().readahead_percent as usize / 100
            }
            None => self.streaming.read().file_readahead_pieces,
        }
    }

    /// Runs one scheduling tick over all live readers.
    ///
    /// With memory storage every positive priority outside this tick's
    /// reader windows is dropped to zero first. Collected pieces are only
    /// ever raised, never lowered.
    pub fn prioritize(&self) {
        let _tick = self.prioritize_lock.lock();
        let Some(backend) = self.backend() else {
            return;
        };

        let windows: Vec<ReaderWindow> = self
            .readers
            .cursors()
            .iter()
            .map(|cursor| cursor.window())
            .collect();
        let plan = plan_pieces(&windows, self.readahead_pieces());
        let wanted: HashSet<PieceIndex> = plan.iter().map(|planned| planned.piece).collect();

        let mut requests = Vec::new();
        let mut dropped = Vec::new();
        if backend.memory().is_some() {
            for (index, &current) in self.handle.piece_priorities().iter().enumerate() {
                let piece = PieceIndex(index as u32);
                if current > priority::DONT_DOWNLOAD && !wanted.contains(&piece) {
                    requests.push((piece, priority::DONT_DOWNLOAD));
                    dropped.push(piece);
                }
            }
        }

        let mut raised = Vec::new();
        for planned in &plan {
            if self.have_piece(planned.piece) {
                continue;
            }
            let current = self.handle.piece_priority(planned.piece);
            if current == priority::DONT_DOWNLOAD || current < planned.priority {
                requests.push((planned.piece, planned.priority));
                raised.push((planned.piece, planned.deadline(), current));
            }
        }

        if !requests.is_empty() {
            debug!(
                info_hash = %self.info_hash,
                requested = raised.len(),
                dropped = dropped.len(),
                readahead = self.readahead_pieces(),
                "Prioritizing pieces"
            );
            self.handle.prioritize_pieces(&requests);
        }

        for piece in dropped {
            self.clear_piece_deadline(piece);
        }
        for (piece, deadline, previous) in raised {
            if previous == priority::DONT_DOWNLOAD {
                self.deadlines.lock().remove(&piece);
            }
            self.set_piece_deadline(piece, deadline);
        }

        if let Some(storage) = backend.memory() {
            storage.update_reader_pieces(PieceSet::from_pieces(storage.piece_count(), wanted));
        }
    }

    /// Bumps the pieces right behind a read cursor: `start` at top priority
    /// with deadline zero, the rest one level lower with growing deadlines.
    pub fn prioritize_pieces(&self, start: PieceIndex, end: PieceIndex) {
        for index in start.as_u32()..=end.as_u32() {
            let piece = PieceIndex(index);
            if self.have_piece(piece) {
                continue;
            }
            if piece == start {
                self.set_piece_priority(piece, Duration::ZERO, priority::TOP);
            } else {
                let distance = index - start.as_u32();
                self.set_piece_priority(piece, DEADLINE_STEP * distance, priority::READER_NEXT);
            }
        }
    }

    /// Raises `piece` to `value` with `deadline`; lower requests are ignored.
    pub fn set_piece_priority(&self, piece: PieceIndex, deadline: Duration, value: u8) {
        let current = self.handle.piece_priority(piece);
        if current >= value {
            return;
        }
        if current == priority::DONT_DOWNLOAD {
            self.deadlines.lock().remove(&piece);
        }
        trace!(info_hash = %self.info_hash, piece = %piece, priority = value, "Setting piece priority");
        self.handle.set_piece_priority(piece, value.min(priority::TOP));
        self.set_piece_deadline(piece, deadline);
    }

    /// Sets `value` and `deadline` on `piece` regardless of its current priority.
    pub fn request_piece(&self, piece: PieceIndex, value: u8, deadline: Duration) {
        self.handle.set_piece_priority(piece, value.min(priority::TOP));
        self.deadlines.lock().remove(&piece);
        self.set_piece_deadline(piece, deadline);
    }

    /// Sets a deadline unless one is already pending for the piece.
    pub fn set_piece_deadline(&self, piece: PieceIndex, deadline: Duration) {
        if !self.deadlines.lock().insert(piece) {
            trace!(info_hash = %self.info_hash, piece = %piece, "Skipping deadline");
            return;
        }
        self.handle.set_piece_deadline(piece, deadline);
    }

    pub fn clear_piece_deadline(&self, piece: PieceIndex) {
        if self.deadlines.lock().remove(&piece) {
            self.handle.reset_piece_deadline(piece);
        }
    }

    pub fn has_piece_deadline(&self, piece: PieceIndex) -> bool {
        self.deadlines.lock().contains(&piece)
    }

    /// True while any file is still collecting its initial buffer.
    pub fn is_buffering(&self) -> bool {
        self.files
            .read()
            .iter()
            .any(|file| file.is_buffering() && file.buffer_progress() < 100.0)
    }

    /// Recomputes buffering progress of buffering files.
    ///
    /// Bytes already received for pieces in the download queue count as done.
    pub fn update_buffer_progress(&self) {
        if !self.is_buffering() {
            return;
        }
        let queue = self.handle.download_queue();

        for file in self.files() {
            let total = file.buffer_size();
            if !file.is_buffering() || file.buffer_progress() >= 100.0 || total == 0 {
                continue;
            }
            let pieces = file.buffer_pieces();

            let mut missing: u64 = pieces
                .iter()
                .filter(|&&piece| !self.have_piece(piece))
                .map(|&piece| self.piece_size(piece) as u64)
                .sum();
            if missing > 0 {
                let in_flight: u64 = queue
                    .iter()
                    .filter(|partial| pieces.contains(&partial.piece))
                    .map(|partial| partial.bytes_downloaded)
                    .sum();
                missing = missing.saturating_sub(in_flight);
            }

            file.set_buffer_progress((total - missing.min(total)) as f64 / total as f64 * 100.0);
        }
    }

    /// Stores an engine status snapshot and rederives the state.
    pub fn update_status(&self, status: EngineStatus) {
        if matches!(status.state, EngineState::Finished | EngineState::Seeding) {
            self.has_seed_status.store(true, Ordering::Release);
        }
        let state = derive_state(
            &status,
            self.is_paused(),
            self.has_seed_status.load(Ordering::Acquire),
        );
        *self.status.write() = status;
        *self.state.write() = state;
    }

    pub fn refresh_status(&self) {
        self.update_status(self.handle.status());
    }

    pub fn state(&self) -> TorrentState {
        *self.state.read()
    }

    pub fn engine_status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Fraction of wanted bytes downloaded, the engine's own figure while checking.
    pub fn progress(&self) -> f64 {
        let status = self.status.read();
        if matches!(
            status.state,
            EngineState::CheckingFiles | EngineState::CheckingResumeData
        ) {
            return status.progress;
        }
        if status.total_wanted == 0 {
            return 0.0;
        }
        status.total_wanted_done as f64 / status.total_wanted as f64
    }

    pub fn status(&self) -> TorrentStatus {
        let mut status = TorrentStatus::from_engine(&self.status.read(), self.state());
        status.progress = self.progress() * 100.0;
        status
    }

    /// Downloaded bytes and percent done per file.
    pub fn files_progress(&self) -> Vec<(u64, f64)> {
        let done = self.handle.file_progress();
        self.files()
            .iter()
            .map(|file| {
                let completed = done.get(file.index()).copied().unwrap_or(0);
                let percent = if file.size() == 0 || completed >= file.size() {
                    100.0
                } else {
                    completed as f64 / file.size() as f64 * 100.0
                };
                (completed, percent)
            })
            .collect()
    }

    pub fn file_status(&self, file: &File) -> FileStatus {
        let (total_done, progress) = self
            .files_progress()
            .get(file.index())
            .copied()
            .unwrap_or((0, 0.0));

        FileStatus {
            total: file.size(),
            total_done,
            progress,
            priority: file.priority(self),
            buffering_total: file.buffer_size(),
            buffering_progress: file.buffer_progress(),
        }
    }

    pub fn pause(&self) {
        self.stopped.store(true, Ordering::Release);
        self.handle.pause();
        self.refresh_status();
        info!(info_hash = %self.info_hash, "Paused torrent");
    }

    pub fn resume(&self) {
        self.stopped.store(false, Ordering::Release);
        self.handle.resume();
        self.refresh_status();
        info!(info_hash = %self.info_hash, "Resumed torrent");
    }

    pub fn is_paused(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Memory budget of the torrent in bytes.
    pub fn memory_size(&self) -> u64 {
        match self.memory_storage() {
            Some(storage) => storage.capacity(),
            None => self.memory_size.load(Ordering::Acquire),
        }
    }

    /// Raises the memory budget; memory storage grows immediately.
    pub fn set_memory_size(&self, bytes: u64) {
        self.memory_size.fetch_max(bytes, Ordering::AcqRel);
        if let Some(storage) = self.memory_storage() {
            storage.set_memory_size(bytes);
        }
    }

    pub fn torrent_file_path(&self) -> PathBuf {
        persistence::torrent_file_path(&self.torrents_path, self.info_hash)
    }

    pub fn resume_file_path(&self) -> PathBuf {
        persistence::resume_file_path(&self.torrents_path, self.info_hash)
    }

    /// Asks the engine for resume data; memory torrents have nothing to resume.
    pub fn save_resume_data(&self) {
        if !self.is_memory_storage() {
            self.handle.save_resume_data();
        }
    }

    /// Persists resume data produced by the engine.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - The resume file could not be written
    pub fn on_resume_data(&self, data: &[u8]) -> Result<(), TorrentError> {
        if self.is_memory_storage() {
            return Ok(());
        }
        let path = self.resume_file_path();
        debug!(info_hash = %self.info_hash, path = %path.display(), "Saving resume data");
        std::fs::create_dir_all(&self.torrents_path)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Writes the `.torrent` file of a file-backed torrent once.
    pub fn save_torrent_file(&self) {
        let path = self.torrent_file_path();
        if self.is_memory_storage() || path.exists() {
            return;
        }
        let Some(metainfo) = self.handle.metainfo() else {
            return;
        };

        info!(info_hash = %self.info_hash, path = %path.display(), "Saving torrent file");
        let written = std::fs::create_dir_all(&self.torrents_path)
            .and_then(|_| std::fs::write(&path, metainfo));
        if let Err(e) = written {
            warn!(info_hash = %self.info_hash, error = %e, "Failed to save torrent file");
        }
    }

    pub fn trackers(&self) -> BTreeMap<String, TrackerInfo> {
        self.trackers.lock().clone()
    }

    fn update_tracker(&self, name: &str, message: String, num_peers: u32) {
        let mut trackers = self.trackers.lock();
        let tracker = trackers.entry(name.to_string()).or_default();
        tracker.last_message = message;
        tracker.num_peers = tracker.num_peers.max(num_peers);
    }

    /// Applies a torrent-scoped engine alert.
    pub fn dispatch_alert(&self, alert: &Alert) {
        match alert {
            Alert::MetadataReceived { .. } => {
                if let Err(e) = self.on_metadata_received() {
                    warn!(info_hash = %self.info_hash, error = %e, "Failed to apply metadata");
                }
            }
            Alert::PieceFinished { piece, .. } => {
                trace!(info_hash = %self.info_hash, piece = %piece, "Piece finished");
                self.notify_piece_waiters();
            }
            Alert::SaveResumeData { data, .. } => {
                if let Err(e) = self.on_resume_data(data) {
                    warn!(info_hash = %self.info_hash, error = %e, "Failed to save resume data");
                }
            }
            Alert::SaveResumeDataFailed { reason, .. } => {
                debug!(info_hash = %self.info_hash, reason = %reason, "Resume data not saved");
            }
            Alert::DhtReply { num_peers, .. } => {
                self.update_tracker("DHT", String::new(), *num_peers);
            }
            Alert::TrackerReply { url, num_peers, .. } => {
                self.update_tracker(url, String::new(), *num_peers);
            }
            Alert::TrackerWarning { url, message, .. } | Alert::TrackerError { url, message, .. } => {
                self.update_tracker(url, message.clone(), 0);
            }
            Alert::TrackerAnnounce { url, .. } => {
                trace!(info_hash = %self.info_hash, tracker = %url, "Announcing");
            }
            Alert::TorrentError { message, .. } => {
                warn!(info_hash = %self.info_hash, error = %message, "Engine reported torrent error");
            }
            Alert::StateUpdate { .. } | Alert::SessionStats(_) => {}
        }
    }

    /// Counter bumped on every piece event, used to avoid missed wakeups.
    pub fn piece_event_count(&self) -> u64 {
        *self.piece_events.lock()
    }

    /// Wakes readers blocked in `wait_piece_event`.
    pub fn notify_piece_waiters(&self) {
        let mut events = self.piece_events.lock();
        *events = events.wrapping_add(1);
        self.piece_arrived.notify_all();
    }

    /// Blocks until the event counter moves past `seen` or `timeout` elapses.
    pub fn wait_piece_event(&self, seen: u64, timeout: Duration) -> bool {
        let mut events = self.piece_events.lock();
        if *events == seen {
            self.piece_arrived
                .wait_while_for(&mut events, |events| *events == seen, timeout);
        }
        *events != seen
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the torrent closing, releases its readers and deletes persisted files.
    ///
    /// Resume data is always dropped for memory torrents; the `.torrent` file
    /// only when `delete_files` is set.
    pub fn remove(&self, delete_files: bool) {
        self.closing.store(true, Ordering::Release);
        self.readers.close_all();
        self.notify_piece_waiters();

        let mut doomed = Vec::new();
        if delete_files {
            doomed.push(self.torrent_file_path());
        }
        if delete_files || self.is_memory_storage() {
            doomed.push(self.resume_file_path());
        }
        for path in doomed.into_iter().filter(|path| path.exists()) {
            info!(info_hash = %self.info_hash, path = %path.display(), "Removing file");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to remove file");
            }
        }

        info!(info_hash = %self.info_hash, "Removed torrent");
    }

    /// Plain-text report of the torrent for the debug endpoint.
    pub fn dump(&self) -> String {
        let status = self.engine_status();
        let mut out = String::new();

        let _ = writeln!(out, "    Name:               {}", self.name());
        let _ = writeln!(out, "    Storage:            {}", self.storage_type);
        let _ = writeln!(out, "    Infohash:           {}", self.info_hash);
        let _ = writeln!(out, "    Status:             {}", self.state());
        let _ = writeln!(out, "    Added:              {}", self.added_at.to_rfc3339());
        let _ = writeln!(out, "    Pieces count:       {}", self.piece_count());
        let _ = writeln!(out, "    Piece length:       {}", humanize_bytes(self.piece_length() as u64));
        if let Some(storage) = self.memory_storage() {
            let _ = writeln!(
                out,
                "    Memory:             {} ({} buffers, {} used)",
                humanize_bytes(storage.capacity()),
                storage.buffer_count(),
                storage.used_count()
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "    Speed:");
        let _ = writeln!(out, "        Download:   {}/s", humanize_bytes(status.download_rate));
        let _ = writeln!(out, "        Upload:     {}/s", humanize_bytes(status.upload_rate));
        let _ = writeln!(out);
        let _ = writeln!(out, "    Size:");
        let _ = writeln!(out, "        Total:          {}", humanize_bytes(self.size()));
        let _ = writeln!(out, "        Done:           {}", humanize_bytes(status.total_done));
        let _ = writeln!(out, "        Wanted:         {}", humanize_bytes(status.total_wanted));
        let _ = writeln!(out, "        Wanted done:    {} ({:.2}%)", humanize_bytes(status.total_wanted_done), self.progress() * 100.0);
        let _ = writeln!(out);
        let _ = writeln!(out, "    Peers:");
        let _ = writeln!(out, "        Connected seeds:    {}", status.num_seeds);
        let _ = writeln!(out, "        Connected peers:    {}", status.num_peers);
        let _ = writeln!(out, "        All seeds:          {}", status.num_complete);
        let _ = writeln!(out, "        All peers:          {}", status.num_complete + status.num_incomplete);
        let _ = writeln!(out);

        let _ = writeln!(out, "    Files (Priority):");
        for file in self.files() {
            let file_priority = file.priority(self);
            let shown = if file_priority > 0 { file_priority.to_string() } else { "-".to_string() };
            let _ = writeln!(
                out,
                "        {} ({}): {}  {}",
                file.path(),
                humanize_bytes(file.size()),
                shown,
                file.stream_uri()
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "    Trackers:");
        for (url, tracker) in self.trackers() {
            let _ = writeln!(out, "        {url:<60}: {:<3} peers, message: {}", tracker.num_peers, tracker.last_message);
        }
        let _ = writeln!(out);

        let _ = write!(out, "    Pieces:\n        ");
        let reader_starts: HashSet<PieceIndex> = self
            .readers
            .cursors()
            .iter()
            .map(|cursor| cursor.piece_start())
            .collect();
        let priorities = self.handle.piece_priorities();
        let (mut stored, mut prioritized) = (0, 0);
        for index in 0..self.piece_count() {
            let piece = PieceIndex(index);
            let had = self.have_piece(piece);
            let current = priorities.get(index as usize).copied().unwrap_or(0);
            let mark = if reader_starts.contains(&piece) {
                prioritized += 1;
                if had { '*' } else { '?' }
            } else if had {
                if current > 0 {
                    prioritized += 1;
                }
                '+'
            } else if current == 0 {
                '-'
            } else {
                prioritized += 1;
                char::from_digit(current as u32, 10).unwrap_or('#')
            };
            if had {
                stored += 1;
            }
            out.push(mark);
            if (index + 1) % 100 == 0 {
                out.push_str("\n        ");
            }
        }
        let _ = writeln!(
            out,
            "\n        Readers: {}, Stored: {}, Prioritized: {}",
            self.reader_count(),
            stored,
            prioritized
        );
        out
    }
}

fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PartialPiece;
    use crate::engine::test_mocks::MockTorrent;

    const PIECE: u32 = 1024;

    struct Fixture {
        engine: Arc<MockTorrent>,
        torrent: Arc<Torrent>,
        _dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new(storage: StorageType) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let info = TorrentInfo::new(
                "movie",
                PIECE,
                vec![("movie/movie.mp4".to_string(), 64 * PIECE as u64)],
            );
            let engine = MockTorrent::new(info);
            let options = TorrentOptions {
                storage,
                streaming: StreamingConfig {
                    buffer_size: PIECE as u64,
                    end_buffer_size: PIECE as u64,
                    ..TorrestConfig::for_testing().streaming
                },
                memory_size: 10 * PIECE as u64,
                readers_only: false,
                torrents_path: dir.path().to_path_buf(),
                paused: false,
            };
            let handle: Arc<dyn EngineTorrent> = engine.clone();
            let torrent = Torrent::new(handle, options).unwrap();
            Self {
                engine,
                torrent,
                _dir: dir,
            }
        }

        fn cursor(&self, id: u64, start: u32, end_limit: u32) -> Arc<ReaderCursor> {
            let cursor = Arc::new(ReaderCursor::new(id, PieceIndex(start), PieceIndex(end_limit)));
            self.torrent.register_reader(&cursor);
            cursor
        }
    }

    #[test]
    fn test_memory_torrent_attaches_storage() {
        let fixture = Fixture::new(StorageType::Memory);
        assert!(fixture.engine.has_storage());
        assert_eq!(fixture.torrent.memory_storage().unwrap().buffer_count(), 10);
        assert_eq!(fixture.torrent.readahead_pieces(), 8);
        assert_eq!(fixture.torrent.files().len(), 1);
    }

    #[test]
    fn test_file_torrent_persists_metainfo() {
        let fixture = Fixture::new(StorageType::File);
        assert!(!fixture.engine.has_storage());
        assert!(fixture.torrent.torrent_file_path().exists());
        assert_eq!(fixture.torrent.readahead_pieces(), 20);
    }

    #[test]
    fn test_prioritize_requests_reader_window() {
        let fixture = Fixture::new(StorageType::Memory);
        let _cursor = fixture.cursor(1, 10, 63);

        fixture.torrent.prioritize();

        assert_eq!(fixture.engine.piece_priority(PieceIndex(10)), 5);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(11)), 5);
        // planned at 3, already higher
        assert_eq!(fixture.engine.piece_priority(PieceIndex(17)), priority::DEFAULT);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(18)), 0);
        assert_eq!(fixture.engine.deadline(PieceIndex(10)), Some(Duration::ZERO));
        assert_eq!(fixture.engine.deadline(PieceIndex(11)), Some(Duration::from_millis(10)));
        assert_eq!(fixture.engine.deadline(PieceIndex(12)), None);

        let storage = fixture.torrent.memory_storage().unwrap();
        assert_eq!(storage.reader_pieces().len(), 8);
    }

    #[test]
    fn test_stale_priorities_are_dropped() {
        let fixture = Fixture::new(StorageType::Memory);
        let cursor = fixture.cursor(1, 0, 63);
        fixture.torrent.prioritize();
        assert!(fixture.engine.piece_priority(PieceIndex(0)) > 0);

        cursor.set_window(PieceIndex(30), PieceIndex(30));
        fixture.torrent.prioritize();

        for piece in 0..8 {
            assert_eq!(fixture.engine.piece_priority(PieceIndex(piece)), 0);
        }
        assert_eq!(fixture.engine.deadline(PieceIndex(0)), None);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(30)), 5);
    }

    #[test]
    fn test_file_storage_keeps_other_priorities() {
        let fixture = Fixture::new(StorageType::File);
        let _cursor = fixture.cursor(1, 0, 63);
        fixture.torrent.prioritize();

        assert_eq!(fixture.engine.piece_priority(PieceIndex(40)), priority::DEFAULT);
    }

    #[test]
    fn test_prioritize_never_lowers() {
        let fixture = Fixture::new(StorageType::File);
        fixture.engine.set_piece_priority(PieceIndex(5), priority::TOP);
        let _cursor = fixture.cursor(1, 0, 63);

        fixture.torrent.prioritize();

        assert_eq!(fixture.engine.piece_priority(PieceIndex(5)), priority::TOP);
    }

    #[test]
    fn test_reader_bump_sets_top_and_next() {
        let fixture = Fixture::new(StorageType::File);
        fixture.engine.complete_piece(PieceIndex(4));

        fixture.torrent.prioritize_pieces(PieceIndex(3), PieceIndex(5));

        assert_eq!(fixture.engine.piece_priority(PieceIndex(3)), priority::TOP);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(4)), priority::DEFAULT);
        assert_eq!(fixture.engine.piece_priority(PieceIndex(5)), priority::READER_NEXT);
        assert_eq!(fixture.engine.deadline(PieceIndex(5)), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_pending_deadline_is_not_reset() {
        let fixture = Fixture::new(StorageType::File);
        fixture.torrent.set_piece_deadline(PieceIndex(2), Duration::from_millis(50));
        fixture.torrent.set_piece_deadline(PieceIndex(2), Duration::ZERO);
        assert_eq!(fixture.engine.deadline(PieceIndex(2)), Some(Duration::from_millis(50)));

        fixture.torrent.clear_piece_deadline(PieceIndex(2));
        assert!(!fixture.torrent.has_piece_deadline(PieceIndex(2)));
        assert_eq!(fixture.engine.deadline(PieceIndex(2)), None);
    }

    #[test]
    fn test_deadline_is_renewed_after_priority_drop() {
        let fixture = Fixture::new(StorageType::File);
        fixture.torrent.set_piece_priority(PieceIndex(2), Duration::from_millis(50), priority::READER_NEXT);
        fixture.engine.set_piece_priority(PieceIndex(2), priority::DONT_DOWNLOAD);

        fixture.torrent.set_piece_priority(PieceIndex(2), Duration::ZERO, priority::TOP);

        assert_eq!(fixture.engine.deadline(PieceIndex(2)), Some(Duration::ZERO));
    }

    #[test]
    fn test_buffer_progress_counts_in_flight_bytes() {
        let fixture = Fixture::new(StorageType::Memory);
        let file = fixture.torrent.get_file(0).unwrap();
        file.start_buffer(&fixture.torrent).unwrap();
        assert_eq!(file.buffer_pieces(), vec![PieceIndex(0), PieceIndex(63)]);
        assert!(fixture.torrent.is_buffering());

        fixture.engine.complete_piece(PieceIndex(0));
        fixture.engine.set_download_queue(vec![PartialPiece {
            piece: PieceIndex(63),
            bytes_downloaded: PIECE as u64 / 2,
        }]);
        fixture.torrent.update_buffer_progress();
        assert_eq!(file.buffer_progress(), 75.0);

        fixture.engine.complete_piece(PieceIndex(63));
        fixture.torrent.update_buffer_progress();
        assert_eq!(file.buffer_progress(), 100.0);
        assert!(!fixture.torrent.is_buffering());
    }

    #[test]
    fn test_tracker_keeps_highest_peer_count() {
        let fixture = Fixture::new(StorageType::File);
        let info_hash = fixture.torrent.info_hash();
        let url = "udp://tracker.example:6969".to_string();

        fixture.torrent.dispatch_alert(&Alert::TrackerReply {
            info_hash,
            url: url.clone(),
            num_peers: 12,
        });
        fixture.torrent.dispatch_alert(&Alert::TrackerWarning {
            info_hash,
            url: url.clone(),
            message: "slow down".to_string(),
        });

        let tracker = fixture.torrent.trackers()[&url].clone();
        assert_eq!(tracker.num_peers, 12);
        assert_eq!(tracker.last_message, "slow down");
    }

    #[test]
    fn test_resume_data_written_for_file_storage_only() {
        let file_backed = Fixture::new(StorageType::File);
        file_backed.torrent.on_resume_data(b"resume").unwrap();
        assert_eq!(std::fs::read(file_backed.torrent.resume_file_path()).unwrap(), b"resume");

        let memory_backed = Fixture::new(StorageType::Memory);
        memory_backed.torrent.on_resume_data(b"resume").unwrap();
        assert!(!memory_backed.torrent.resume_file_path().exists());
    }

    #[test]
    fn test_remove_closes_readers_and_files() {
        let fixture = Fixture::new(StorageType::File);
        let cursor = fixture.cursor(1, 0, 10);
        assert!(fixture.torrent.torrent_file_path().exists());

        fixture.torrent.remove(true);

        assert!(fixture.torrent.is_closing());
        assert!(cursor.is_closing());
        assert!(!fixture.torrent.torrent_file_path().exists());
    }

    #[test]
    fn test_pause_updates_state() {
        let fixture = Fixture::new(StorageType::File);
        fixture.torrent.pause();
        assert!(fixture.engine.is_paused());
        assert_eq!(fixture.torrent.state(), TorrentState::PausedDownloading);

        fixture.torrent.resume();
        assert_eq!(fixture.torrent.state(), TorrentState::StalledDownloading);
    }

    #[test]
    fn test_wait_piece_event_wakes_on_notify() {
        let fixture = Fixture::new(StorageType::File);
        let seen = fixture.torrent.piece_event_count();
        let torrent = Arc::clone(&fixture.torrent);
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            torrent.notify_piece_waiters();
        });

        assert!(fixture.torrent.wait_piece_event(seen, Duration::from_secs(5)));
        waker.join().unwrap();
    }

    #[test]
    fn test_dump_lists_files() {
        let fixture = Fixture::new(StorageType::Memory);
        let dump = fixture.torrent.dump();
        assert!(dump.contains("movie/movie.mp4"));
        assert!(dump.contains("Readers: 0"));
    }
}
