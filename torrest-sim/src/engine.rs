//! Session half of the development engine.
//!
//! `SimEngine` owns the torrents and one downloader thread. Each tick splits
//! the configured byte budget across torrents and lets every torrent spend
//! its share on the pieces the streaming layer currently wants.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use torrest_core::Shutdown;
use torrest_core::engine::{
    AddTorrentParams, Alert, EngineError, EngineSession, EngineTorrent, SessionCounters,
    TorrentSource, magnet_info_hash,
};
use torrest_core::torrent::{InfoHash, Metainfo};
use tracing::{debug, info};

use crate::config::SimConfig;
use crate::swarm::Swarm;
use crate::torrent::{AlertQueue, SimTorrent, SimTorrentParams};

/// In-process engine serving seeded content.
pub struct SimEngine {
    swarm: Arc<Swarm>,
    config: SimConfig,
    torrents: RwLock<HashMap<InfoHash, Arc<SimTorrent>>>,
    alerts: AlertQueue,
    rng: Mutex<ChaCha8Rng>,
    paused: AtomicBool,
    stop: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimEngine {
    /// Creates an engine without a downloader thread; call `tick` to make progress.
    pub fn new(swarm: Arc<Swarm>, config: SimConfig) -> Arc<Self> {
        Arc::new(Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(config.seed)),
            swarm,
            config,
            torrents: RwLock::new(HashMap::new()),
            alerts: Arc::new(Mutex::new(Vec::new())),
            paused: AtomicBool::new(false),
            stop: Shutdown::new(),
            worker: Mutex::new(None),
        })
    }

    /// Creates an engine and starts its downloader thread.
    ///
    /// # Errors
    ///
    /// - `io::Error` - The thread could not be spawned
    pub fn start(swarm: Arc<Swarm>, config: SimConfig) -> std::io::Result<Arc<Self>> {
        let engine = Self::new(swarm, config);
        let weak = Arc::downgrade(&engine);
        let stop = engine.stop.clone();
        let handle = thread::Builder::new()
            .name("torrest-sim".to_string())
            .spawn(move || run_downloader(weak, stop))?;
        *engine.worker.lock() = Some(handle);
        Ok(engine)
    }

    pub fn swarm(&self) -> &Arc<Swarm> {
        &self.swarm
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<SimTorrent>> {
        self.torrents.read().get(&info_hash).cloned()
    }

    /// Runs one downloader step.
    ///
    /// Returns the bytes delivered across all torrents.
    pub fn tick(&self) -> u64 {
        let torrents: Vec<Arc<SimTorrent>> = self.torrents.read().values().cloned().collect();
        if torrents.is_empty() {
            return 0;
        }
        let paused = self.paused.load(Ordering::Acquire);
        let share = if paused {
            0
        } else {
            (self.config.bytes_per_tick() / torrents.len() as u64).max(1)
        };

        let mut rng = self.rng.lock();
        torrents
            .iter()
            .map(|torrent| torrent.tick(share, &self.config, &mut rng))
            .sum()
    }

    /// Stops the downloader thread and waits for it.
    pub fn stop(&self) {
        self.stop.trigger();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn announce(&self, torrent: &SimTorrent, trackers: &[String]) {
        let peers = if self.swarm.lookup(torrent.info_hash()).is_some() {
            self.config.peers
        } else {
            0
        };
        let mut alerts = self.alerts.lock();
        for url in trackers {
            alerts.push(Alert::TrackerAnnounce {
                info_hash: torrent.info_hash(),
                url: url.clone(),
            });
            alerts.push(Alert::TrackerReply {
                info_hash: torrent.info_hash(),
                url: url.clone(),
                num_peers: peers,
            });
        }
        alerts.push(Alert::DhtReply {
            info_hash: torrent.info_hash(),
            num_peers: peers,
        });
    }
}

impl Drop for SimEngine {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

fn run_downloader(engine: Weak<SimEngine>, stop: Shutdown) {
    info!("Starting simulated downloader");
    loop {
        let interval = {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            engine.tick();
            engine.config.tick_interval
        };
        if stop.wait_timeout(interval) {
            break;
        }
    }
    info!("Stopped simulated downloader");
}

fn magnet_trackers(uri: &str) -> Vec<String> {
    uri.split_once('?')
        .map(|(_, query)| query)
        .unwrap_or_default()
        .split('&')
        .filter_map(|param| param.strip_prefix("tr="))
        .filter_map(|value| urlencoding::decode(value).ok())
        .map(|value| value.into_owned())
        .collect()
}

impl EngineSession for SimEngine {
    fn add_torrent(&self, params: AddTorrentParams) -> Result<Arc<dyn EngineTorrent>, EngineError> {
        let (info_hash, metainfo, trackers) = match &params.source {
            TorrentSource::Magnet(uri) => (magnet_info_hash(uri)?, None, magnet_trackers(uri)),
            TorrentSource::Metainfo(bytes) => {
                let metainfo = Metainfo::from_bytes(bytes)?;
                let trackers = metainfo.trackers.clone();
                (metainfo.info_hash, Some((metainfo, bytes.clone())), trackers)
            }
        };

        let mut torrents = self.torrents.write();
        if torrents.contains_key(&info_hash) {
            return Err(EngineError::DuplicateTorrent { info_hash });
        }

        let torrent = Arc::new(SimTorrent::new(
            SimTorrentParams {
                info_hash,
                content: self.swarm.lookup(info_hash),
                metainfo,
                storage: params.storage,
                save_path: params.save_path.clone(),
                paused: params.paused,
                sequential: params.sequential_download,
                resume_data: params.resume_data.clone(),
                metadata_delay: self.config.metadata_delay,
            },
            Arc::clone(&self.alerts),
        ));
        torrents.insert(info_hash, Arc::clone(&torrent));
        drop(torrents);

        self.announce(&torrent, &trackers);
        info!(
            info_hash = %info_hash,
            storage = ?params.storage,
            seeded = self.swarm.lookup(info_hash).is_some(),
            "Added simulated torrent"
        );
        Ok(torrent)
    }

    fn remove_torrent(&self, info_hash: InfoHash, delete_files: bool) -> Result<(), EngineError> {
        let torrent = self
            .torrents
            .write()
            .remove(&info_hash)
            .ok_or(EngineError::TorrentNotFound { info_hash })?;
        if delete_files {
            torrent.delete_files();
        }
        debug!(info_hash = %info_hash, delete_files, "Removed simulated torrent");
        Ok(())
    }

    fn pop_alerts(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    fn post_torrent_updates(&self) {
        let statuses = self
            .torrents
            .read()
            .iter()
            .map(|(&info_hash, torrent)| (info_hash, torrent.status_with(&self.config)))
            .collect();
        self.alerts.lock().push(Alert::StateUpdate { statuses });
    }

    fn post_session_stats(&self) {
        let torrents = self.torrents.read();
        let counters = SessionCounters {
            download_rate: torrents.values().map(|torrent| torrent.download_rate()).sum(),
            upload_rate: 0,
            total_download: torrents.values().map(|torrent| torrent.total_download()).sum(),
            total_upload: 0,
            num_torrents: torrents.len(),
        };
        drop(torrents);
        self.alerts.lock().push(Alert::SessionStats(counters));
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use torrest_core::StorageType;
    use torrest_core::engine::priority;
    use torrest_core::torrent::PieceIndex;

    use super::*;

    fn params(source: TorrentSource) -> AddTorrentParams {
        AddTorrentParams {
            source,
            save_path: PathBuf::from("unused"),
            storage: StorageType::Memory,
            paused: false,
            sequential_download: false,
            resume_data: None,
        }
    }

    fn engine_with_content() -> (Arc<SimEngine>, Vec<u8>) {
        let swarm = Arc::new(Swarm::with_piece_length(1024));
        let content = swarm.seed_bytes("clip.mp4", vec![7u8; 8 * 1024]).unwrap();
        let bytes = content.torrent_bytes.clone();
        (SimEngine::new(swarm, SimConfig::default()), bytes)
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let (engine, bytes) = engine_with_content();
        engine.add_torrent(params(TorrentSource::Metainfo(bytes.clone()))).unwrap();

        let result = engine.add_torrent(params(TorrentSource::Metainfo(bytes)));
        assert!(matches!(result, Err(EngineError::DuplicateTorrent { .. })));
    }

    #[test]
    fn test_add_announces_magnet_trackers() {
        let (engine, _) = engine_with_content();
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
                   &tr=udp%3A%2F%2Ftracker.example%3A80";
        engine.add_torrent(params(TorrentSource::Magnet(uri.to_string()))).unwrap();

        let alerts = engine.pop_alerts();
        assert!(alerts.iter().any(|alert| matches!(
            alert,
            Alert::TrackerReply { url, num_peers: 0, .. } if url == "udp://tracker.example:80"
        )));
        assert!(alerts.iter().any(|alert| matches!(alert, Alert::DhtReply { .. })));
        assert!(engine.pop_alerts().is_empty());
    }

    #[test]
    fn test_session_pause_stops_delivery() {
        let (engine, bytes) = engine_with_content();
        let handle = engine.add_torrent(params(TorrentSource::Metainfo(bytes))).unwrap();
        handle.set_piece_priority(PieceIndex(0), priority::TOP);

        engine.pause();
        assert!(engine.is_paused());
        assert_eq!(engine.tick(), 0);

        engine.resume();
        assert!(engine.tick() > 0);
    }

    #[test]
    fn test_updates_report_every_torrent() {
        let (engine, bytes) = engine_with_content();
        let handle = engine.add_torrent(params(TorrentSource::Metainfo(bytes))).unwrap();
        engine.pop_alerts();

        engine.post_torrent_updates();
        engine.post_session_stats();
        let alerts = engine.pop_alerts();

        let Some(Alert::StateUpdate { statuses }) = alerts.first() else {
            panic!("expected a state update, got {alerts:?}");
        };
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, handle.info_hash());
        assert_eq!(statuses[0].1.num_peers, SimConfig::default().peers);
        assert!(matches!(
            alerts.get(1),
            Some(Alert::SessionStats(SessionCounters { num_torrents: 1, .. }))
        ));
    }

    #[test]
    fn test_remove_unknown_torrent_fails() {
        let (engine, _) = engine_with_content();
        let result = engine.remove_torrent(InfoHash::new([9; 20]), false);
        assert!(matches!(result, Err(EngineError::TorrentNotFound { .. })));
    }

    #[test]
    fn test_started_engine_stops() {
        let swarm = Arc::new(Swarm::new());
        let engine = SimEngine::start(swarm, SimConfig::instant()).unwrap();
        engine.stop();
        assert!(engine.worker.lock().is_none());
    }
}
