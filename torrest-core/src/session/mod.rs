//! The session: one engine, every torrent added to it and the loops driving them.
//!
//! Engine alerts are drained by a dedicated thread and dispatched to the
//! torrent they belong to; alerts for unknown torrents are dropped. A second
//! thread runs the scheduling tick of every torrent with readers, or updates
//! buffering progress while a torrent is still buffering.

pub mod loops;
pub mod persistence;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::TorrestError;
use crate::config::TorrestConfig;
use crate::engine::{
    AddTorrentParams, Alert, EngineError, EngineSession, SessionCounters, TorrentSource,
    magnet_info_hash,
};
use crate::shutdown::Shutdown;
use crate::storage::StorageType;
use crate::torrent::{
    InfoHash, Metainfo, SessionStatus, Torrent, TorrentError, TorrentOptions,
};

pub struct Session {
    engine: Arc<dyn EngineSession>,
    config: RwLock<TorrestConfig>,
    torrents: RwLock<HashMap<InfoHash, Arc<Torrent>>>,
    counters: Mutex<SessionCounters>,
    shutdown: Shutdown,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Creates a session without background loops.
    ///
    /// # Errors
    ///
    /// - `TorrestError::Configuration` - The configuration does not validate
    pub fn new(
        engine: Arc<dyn EngineSession>,
        config: TorrestConfig,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, TorrestError> {
        config.validate()?;
        Ok(Arc::new(Self {
            engine,
            config: RwLock::new(config),
            torrents: RwLock::new(HashMap::new()),
            counters: Mutex::new(SessionCounters::default()),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }))
    }

    /// Creates a session, reloads persisted torrents and starts the alert and
    /// prioritize loops.
    ///
    /// # Errors
    ///
    /// - `TorrestError::Configuration` - The configuration does not validate
    /// - `TorrestError::Io` - A loop thread could not be spawned
    pub fn start(
        engine: Arc<dyn EngineSession>,
        config: TorrestConfig,
        shutdown: Shutdown,
    ) -> Result<Arc<Self>, TorrestError> {
        info!("Starting session");
        let session = Self::new(engine, config, shutdown)?;
        session.load_previous_torrents();

        let alerts = loops::spawn_alert_loop(Arc::downgrade(&session), session.shutdown.clone())?;
        let prioritize =
            loops::spawn_prioritize_loop(Arc::downgrade(&session), session.shutdown.clone())?;
        session.workers.lock().extend([alerts, prioritize]);
        Ok(session)
    }

    pub fn config(&self) -> TorrestConfig {
        self.config.read().clone()
    }

    pub fn shutdown_context(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Replaces the runtime configuration and pushes it to every torrent.
    ///
    /// Memory budgets of existing torrents only grow.
    ///
    /// # Errors
    ///
    /// - `TorrestError::Configuration` - The configuration does not validate
    pub fn reconfigure(&self, config: TorrestConfig) -> Result<(), TorrestError> {
        config.validate()?;
        let memory_size = config.effective_memory_size();

        for torrent in self.torrents() {
            torrent.set_streaming_config(config.streaming.clone());
            torrent.set_readers_only(config.storage.readers_only_allocation);
            if torrent.is_memory_storage() {
                torrent.set_memory_size(memory_size);
            }
        }

        *self.config.write() = config;
        info!("Applied new configuration");
        Ok(())
    }

    /// Adds a magnet link or a local `.torrent` path.
    ///
    /// A local file whose content is a magnet link is added as that magnet.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidSource` - Empty URI, unreadable file or bad magnet link
    /// - `EngineError::Metainfo` - The file is not valid metainfo
    /// - `EngineError::DuplicateTorrent` - The torrent is already added
    pub fn add_torrent(
        &self,
        uri: &str,
        paused: bool,
        storage: StorageType,
    ) -> Result<Arc<Torrent>, TorrestError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(EngineError::InvalidSource {
                reason: "Empty uri parameter".to_string(),
            }
            .into());
        }

        let source = if uri.starts_with("magnet:") {
            TorrentSource::Magnet(uri.to_string())
        } else {
            let body = std::fs::read(uri).map_err(|e| EngineError::InvalidSource {
                reason: format!("Failed to read torrent file '{uri}': {e}"),
            })?;
            if body.starts_with(b"magnet:") {
                TorrentSource::Magnet(String::from_utf8_lossy(&body).trim().to_string())
            } else {
                TorrentSource::Metainfo(body)
            }
        };

        self.add_source(source, paused, storage)
    }

    /// Adds a torrent from raw `.torrent` content.
    ///
    /// # Errors
    ///
    /// - `EngineError::Metainfo` - The content is not valid metainfo
    /// - `EngineError::DuplicateTorrent` - The torrent is already added
    pub fn add_metainfo(
        &self,
        metainfo: Vec<u8>,
        paused: bool,
        storage: StorageType,
    ) -> Result<Arc<Torrent>, TorrestError> {
        self.add_source(TorrentSource::Metainfo(metainfo), paused, storage)
    }

    fn add_source(
        &self,
        source: TorrentSource,
        paused: bool,
        storage: StorageType,
    ) -> Result<Arc<Torrent>, TorrestError> {
        let config = self.config();
        let requested = storage;
        let storage = storage.resolve(config.storage.download_storage);

        let info_hash = match &source {
            TorrentSource::Magnet(uri) => magnet_info_hash(uri)?,
            TorrentSource::Metainfo(bytes) => Metainfo::from_bytes(bytes)?.info_hash,
        };
        info!(info_hash = %info_hash, storage = %storage, requested = %requested, "Adding torrent");

        if self.has_torrent(info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash }.into());
        }
        if storage == StorageType::File && config.session.download_path.as_os_str().is_empty() {
            return Err(TorrestError::Configuration {
                reason: "Missing download path for using file storage".to_string(),
            });
        }

        let resume_data = match storage {
            StorageType::Memory => None,
            _ => persistence::load_resume_data(&config.session.torrents_path, info_hash),
        };

        debug!(
            info_hash = %info_hash,
            sequential = storage != StorageType::Memory,
            "Setting sequential download"
        );
        let handle = self.engine.add_torrent(AddTorrentParams {
            source,
            save_path: config.session.download_path.clone(),
            storage,
            paused,
            sequential_download: storage != StorageType::Memory,
            resume_data,
        })?;

        let torrent = match Torrent::new(handle, TorrentOptions::from_config(&config, storage, paused)) {
            Ok(torrent) => torrent,
            Err(e) => {
                if let Err(remove_error) = self.engine.remove_torrent(info_hash, false) {
                    warn!(info_hash = %info_hash, error = %remove_error, "Failed to roll back torrent");
                }
                return Err(e.into());
            }
        };

        self.torrents.write().insert(info_hash, Arc::clone(&torrent));
        info!(info_hash = %info_hash, name = %torrent.name(), "Added torrent");
        Ok(torrent)
    }

    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No torrent with this hash
    pub fn get_torrent(&self, info_hash: InfoHash) -> Result<Arc<Torrent>, TorrentError> {
        self.torrents
            .read()
            .get(&info_hash)
            .cloned()
            .ok_or(TorrentError::TorrentNotFound { info_hash })
    }

    pub fn has_torrent(&self, info_hash: InfoHash) -> bool {
        self.torrents.read().contains_key(&info_hash)
    }

    /// All torrents, oldest first.
    pub fn torrents(&self) -> Vec<Arc<Torrent>> {
        let mut torrents: Vec<Arc<Torrent>> = self.torrents.read().values().cloned().collect();
        torrents.sort_by_key(|torrent| torrent.added_at());
        torrents
    }

    /// Removes a torrent, closing its readers.
    ///
    /// `delete_files` drops the persisted `.torrent` and resume files;
    /// `delete_data` asks the engine to delete downloaded data of file-backed
    /// torrents.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TorrentNotFound` - No torrent with this hash
    /// - `EngineError::TorrentNotFound` - The engine no longer knows the torrent
    pub fn remove_torrent(
        &self,
        info_hash: InfoHash,
        delete_files: bool,
        delete_data: bool,
    ) -> Result<(), TorrestError> {
        let torrent = self
            .torrents
            .write()
            .remove(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;

        torrent.remove(delete_files);
        self.engine
            .remove_torrent(info_hash, delete_data && !torrent.is_memory_storage())?;

        info!(info_hash = %info_hash, "Removed torrent");
        Ok(())
    }

    pub fn pause(&self) {
        info!("Pausing session");
        self.engine.pause();
    }

    pub fn resume(&self) {
        info!("Resuming session");
        self.engine.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.engine.is_paused()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            torrents_count: self.torrents.read().len(),
            is_paused: self.is_paused(),
        }
    }

    /// Latest session-wide transfer counters reported by the engine.
    pub fn counters(&self) -> SessionCounters {
        *self.counters.lock()
    }

    /// Re-adds file-backed torrents persisted under `torrents_path`.
    pub fn load_previous_torrents(&self) {
        let config = self.config();
        if !config.session.autoload_torrents {
            return;
        }

        let torrents_path = config.session.torrents_path.as_path();
        info!(path = %torrents_path.display(), "Loading previous torrents");
        for path in persistence::list_torrent_files(torrents_path) {
            if let Err(e) = self.add_torrent_file(&path) {
                error!(path = %path.display(), error = %e, "Failed to load torrent");
            }
        }
    }

    fn add_torrent_file(&self, path: &Path) -> Result<Arc<Torrent>, TorrestError> {
        let metainfo = std::fs::read(path)?;
        self.add_metainfo(metainfo, false, StorageType::File)
    }

    /// Drains engine alerts and applies them.
    pub fn consume_alerts(&self) {
        for alert in self.engine.pop_alerts() {
            if self.shutdown.is_triggered() {
                debug!("Stop alert processing due to closing application");
                return;
            }
            self.dispatch_alert(alert);
        }
    }

    fn dispatch_alert(&self, alert: Alert) {
        match alert {
            Alert::StateUpdate { statuses } => {
                for (info_hash, status) in statuses {
                    if let Ok(torrent) = self.get_torrent(info_hash) {
                        torrent.update_status(status);
                    }
                }
            }
            Alert::SessionStats(counters) => {
                *self.counters.lock() = counters;
            }
            alert => {
                let Some(info_hash) = alert.info_hash() else {
                    return;
                };
                match self.get_torrent(info_hash) {
                    Ok(torrent) => torrent.dispatch_alert(&alert),
                    Err(_) => trace!(info_hash = %info_hash, ?alert, "Dropping alert for unknown torrent"),
                }
            }
        }
    }

    /// Asks the engine for fresh torrent statuses and session counters.
    pub fn request_update(&self) {
        self.engine.post_torrent_updates();
        self.engine.post_session_stats();
    }

    /// Requests resume data for every file-backed torrent.
    pub fn trigger_resume_data(&self) {
        for torrent in self.torrents() {
            torrent.save_resume_data();
        }
    }

    /// One prioritize tick over all torrents.
    pub fn prioritize_torrents(&self) {
        for torrent in self.torrents() {
            if torrent.is_buffering() {
                torrent.update_buffer_progress();
                continue;
            }
            if torrent.has_readers() {
                torrent.prioritize();
            }
        }
    }

    /// Triggers shutdown, joins the loops and flushes resume data.
    pub fn shutdown(&self) {
        info!("Closing session");
        self.shutdown.trigger();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() == thread::current().id() {
                continue;
            }
            if worker.join().is_err() {
                error!("Session loop panicked");
            }
        }

        self.trigger_resume_data();
        for alert in self.engine.pop_alerts() {
            if let Alert::SaveResumeData { info_hash, data } = &alert {
                if let Ok(torrent) = self.get_torrent(*info_hash) {
                    if let Err(e) = torrent.on_resume_data(data) {
                        warn!(info_hash = %info_hash, error = %e, "Failed to save resume data");
                    }
                }
            }
        }
        info!("Session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_mocks::{MockEngine, mock_metainfo};
    use crate::torrent::{TorrentInfo, TorrentState};

    struct Fixture {
        engine: Arc<MockEngine>,
        session: Arc<Session>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = TorrestConfig::for_testing();
            config.session.download_path = dir.path().join("downloads");
            config.session.torrents_path = dir.path().join("torrents");
            let engine = Arc::new(MockEngine::new());
            let session = Session::new(
                Arc::clone(&engine) as Arc<dyn EngineSession>,
                config,
                Shutdown::new(),
            )
            .unwrap();
            Self {
                engine,
                session,
                dir,
            }
        }

        fn torrent_file(&self, info: &TorrentInfo) -> String {
            let path = self.dir.path().join(format!("{}.torrent", info.name));
            std::fs::write(&path, mock_metainfo(info)).unwrap();
            path.to_string_lossy().into_owned()
        }
    }

    fn info(name: &str) -> TorrentInfo {
        TorrentInfo::new(name, 16384, vec![(name.to_string(), 100_000)])
    }

    fn magnet(info_hash: InfoHash) -> String {
        format!("magnet:?xt=urn:btih:{info_hash}&dn=clip")
    }

    #[test]
    fn test_add_magnet_waits_for_metadata() {
        let fixture = Fixture::new();
        let info_hash = fixture.engine.publish(info("clip.mp4"));

        let torrent = fixture
            .session
            .add_torrent(&magnet(info_hash), false, StorageType::Memory)
            .unwrap();
        assert!(!torrent.has_metadata());
        assert!(!fixture.engine.added()[0].sequential_download);

        assert!(fixture.engine.deliver_metadata(info_hash));
        fixture.session.consume_alerts();

        assert!(torrent.has_metadata());
        assert!(torrent.memory_storage().is_some());
        assert_eq!(torrent.files().len(), 1);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let fixture = Fixture::new();
        let info_hash = fixture.engine.publish(info("clip.mp4"));
        fixture
            .session
            .add_torrent(&magnet(info_hash), false, StorageType::Automatic)
            .unwrap();

        let err = fixture
            .session
            .add_torrent(&magnet(info_hash), false, StorageType::Automatic)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TorrestError::Engine(EngineError::DuplicateTorrent { .. })
        ));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_add_rejects_empty_uri() {
        let fixture = Fixture::new();
        let err = fixture.session.add_torrent("  ", false, StorageType::Memory).err().unwrap();
        assert!(matches!(err, TorrestError::Engine(EngineError::InvalidSource { .. })));
    }

    #[test]
    fn test_file_storage_uses_sequential_download_and_persists() {
        let fixture = Fixture::new();
        let content = info("movie.mp4");
        fixture.engine.publish(content.clone());
        let path = fixture.torrent_file(&content);

        let torrent = fixture.session.add_torrent(&path, false, StorageType::File).unwrap();

        assert!(fixture.engine.added()[0].sequential_download);
        assert!(torrent.torrent_file_path().exists());
        assert_eq!(torrent.storage_type(), StorageType::File);
    }

    #[test]
    fn test_resume_data_round_trip() {
        let fixture = Fixture::new();
        let content = info("movie.mp4");
        let info_hash = fixture.engine.publish(content.clone());
        let path = fixture.torrent_file(&content);
        let torrent = fixture.session.add_torrent(&path, false, StorageType::File).unwrap();

        fixture.session.trigger_resume_data();
        fixture.session.consume_alerts();
        let resume = std::fs::read(torrent.resume_file_path()).unwrap();
        assert_eq!(resume, format!("resume:{info_hash}").into_bytes());

        fixture.session.remove_torrent(info_hash, false, false).unwrap();
        fixture.session.add_torrent(&path, false, StorageType::File).unwrap();
        assert_eq!(fixture.engine.added()[1].resume_data, Some(resume));
    }

    #[test]
    fn test_remove_memory_torrent_keeps_engine_data_flag_off() {
        let fixture = Fixture::new();
        let info_hash = fixture.engine.publish(info("clip.mp4"));
        fixture
            .session
            .add_torrent(&magnet(info_hash), false, StorageType::Memory)
            .unwrap();

        fixture.session.remove_torrent(info_hash, true, true).unwrap();

        assert_eq!(fixture.engine.removed(), vec![(info_hash, false)]);
        assert!(!fixture.session.has_torrent(info_hash));
        assert!(matches!(
            fixture.session.get_torrent(info_hash),
            Err(TorrentError::TorrentNotFound { .. })
        ));
    }

    #[test]
    fn test_state_updates_reach_torrents() {
        let fixture = Fixture::new();
        let info_hash = fixture.engine.publish(info("clip.mp4"));
        let path = fixture.torrent_file(&info("clip.mp4"));
        let torrent = fixture.session.add_torrent(&path, false, StorageType::Memory).unwrap();
        assert_eq!(torrent.info_hash(), info_hash);

        fixture.session.request_update();
        fixture.session.consume_alerts();

        assert_eq!(torrent.state(), TorrentState::StalledDownloading);
        assert_eq!(fixture.session.counters().num_torrents, 1);
        assert_eq!(fixture.session.status().torrents_count, 1);
    }

    #[test]
    fn test_alerts_for_unknown_torrents_are_dropped() {
        let fixture = Fixture::new();
        fixture.engine.push_alert(Alert::PieceFinished {
            info_hash: InfoHash::new([9; 20]),
            piece: crate::torrent::PieceIndex(0),
        });
        fixture.session.consume_alerts();
        assert!(fixture.engine.pop_alerts().is_empty());
    }

    #[test]
    fn test_reconfigure_grows_memory() {
        let fixture = Fixture::new();
        let info_hash = fixture.engine.publish(info("clip.mp4"));
        let path = fixture.torrent_file(&info("clip.mp4"));
        let torrent = fixture.session.add_torrent(&path, false, StorageType::Memory).unwrap();
        let before = torrent.memory_size();

        let mut config = fixture.session.config();
        config.storage.memory_size = before * 2;
        fixture.session.reconfigure(config).unwrap();

        assert!(torrent.memory_size() >= before * 2);
        assert!(fixture.session.has_torrent(info_hash));

        let mut bad = fixture.session.config();
        bad.streaming.readahead_percent = 0;
        assert!(fixture.session.reconfigure(bad).is_err());
    }

    #[test]
    fn test_pause_is_forwarded() {
        let fixture = Fixture::new();
        fixture.session.pause();
        assert!(fixture.session.status().is_paused);
        fixture.session.resume();
        assert!(!fixture.session.is_paused());
    }

    #[test]
    fn test_start_and_shutdown_join_loops() {
        let fixture = Fixture::new();
        let config = fixture.session.config();
        let shutdown = Shutdown::new();
        let session = Session::start(
            Arc::clone(&fixture.engine) as Arc<dyn EngineSession>,
            config,
            shutdown.clone(),
        )
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(60));
        session.shutdown();
        assert!(shutdown.is_triggered());
        assert!(session.workers.lock().is_empty());
    }
}
