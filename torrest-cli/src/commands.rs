//! CLI command implementations

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use torrest_core::config::MIB;
use torrest_core::engine::EngineSession;
use torrest_core::torrent::{Metainfo, TorrentCreator};
use torrest_core::{Session, Shutdown, StorageType, TorrestConfig};
use torrest_sim::{SimConfig, SimEngine, Swarm};
use torrest_web::{AppState, run_server};
use tracing::{info, warn};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the session and the HTTP server
    Serve {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
        /// Default storage for added torrents (automatic, file, memory)
        #[arg(long)]
        storage: Option<StorageType>,
        /// Memory budget per memory-backed torrent, in MiB
        #[arg(long)]
        memory_size: Option<u64>,
        /// Directory whose entries are seeded by the development engine
        #[arg(long)]
        content_dir: Option<PathBuf>,
        /// Where file-backed torrents are downloaded
        #[arg(long)]
        download_path: Option<PathBuf>,
    },
    /// Write a .torrent for a local file or directory
    Create {
        /// File or directory to describe
        path: PathBuf,
        /// Piece length in bytes
        #[arg(long)]
        piece_length: Option<u32>,
        /// Output path, defaults to `<name>.torrent` in the current directory
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Tracker announce URL, may be repeated
        #[arg(long = "tracker")]
        trackers: Vec<String>,
    },
    /// Print the effective configuration as JSON
    Config,
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve {
            host,
            port,
            storage,
            memory_size,
            content_dir,
            download_path,
        } => {
            let mut config = TorrestConfig::from_env();
            if let Some(host) = host {
                config.web.interface = host;
            }
            if let Some(port) = port {
                config.web.port = port;
            }
            if let Some(storage) = storage {
                config.storage.download_storage = storage;
            }
            if let Some(memory_size) = memory_size {
                config.storage.memory_size = memory_size * MIB;
            }
            if let Some(download_path) = download_path {
                config.session.download_path = download_path;
            }
            serve(config, content_dir).await
        }
        Commands::Create {
            path,
            piece_length,
            out,
            trackers,
        } => create_torrent(&path, piece_length, out, trackers),
        Commands::Config => print_config(),
    }
}

/// Runs session and server until `/shutdown` or Ctrl-C.
async fn serve(config: TorrestConfig, content_dir: Option<PathBuf>) -> anyhow::Result<()> {
    config.validate()?;
    let ip: IpAddr = config
        .web
        .interface
        .parse()
        .with_context(|| format!("invalid interface '{}'", config.web.interface))?;
    let addr = SocketAddr::new(ip, config.web.port);

    let swarm = Arc::new(Swarm::new());
    if let Some(dir) = content_dir {
        let seeded = swarm
            .seed_entries(&dir)
            .with_context(|| format!("failed to seed {}", dir.display()))?;
        for content in seeded {
            info!(
                name = %content.metainfo.info.name,
                info_hash = %content.info_hash(),
                magnet = %content.magnet_uri(),
                "Seeded content"
            );
        }
    }

    let engine = SimEngine::start(swarm, SimConfig::default())?;
    let shutdown = Shutdown::new();
    let session = Session::start(
        Arc::clone(&engine) as Arc<dyn EngineSession>,
        config,
        shutdown.clone(),
    )?;

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            signal.trigger();
        }
    });

    let served = run_server(AppState::new(Arc::clone(&session), shutdown.clone()), addr).await;
    if served.is_err() {
        shutdown.trigger();
    }

    // Joining the loop threads blocks.
    tokio::task::spawn_blocking(move || {
        session.shutdown();
        engine.stop();
    })
    .await?;

    served?;
    Ok(())
}

fn create_torrent(
    path: &Path,
    piece_length: Option<u32>,
    out: Option<PathBuf>,
    trackers: Vec<String>,
) -> anyhow::Result<()> {
    let mut creator = TorrentCreator::new().with_trackers(trackers);
    if let Some(piece_length) = piece_length {
        creator = creator.with_piece_length(piece_length);
    }

    let bytes = if path.is_dir() {
        creator.create_from_directory(path)?
    } else {
        creator.create_from_file(path)?
    };
    let metainfo = Metainfo::from_bytes(&bytes)?;

    let out = out.unwrap_or_else(|| PathBuf::from(format!("{}.torrent", metainfo.info.name)));
    std::fs::write(&out, &bytes).with_context(|| format!("failed to write {}", out.display()))?;

    if metainfo.info.piece_count() > 10_000 {
        warn!(
            pieces = metainfo.info.piece_count(),
            "Many small pieces, consider a larger --piece-length"
        );
    }
    println!("Wrote {}", out.display());
    println!("  Info hash: {}", metainfo.info_hash);
    println!("  Pieces:    {} x {} bytes", metainfo.info.piece_count(), metainfo.info.piece_length);
    println!("  Magnet:    {}", metainfo.magnet_uri());
    Ok(())
}

fn print_config() -> anyhow::Result<()> {
    let config = TorrestConfig::from_env();
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    info!(
        bytes = config.effective_memory_size(),
        "Effective memory size per torrent"
    );
    Ok(())
}
