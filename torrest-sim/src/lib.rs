//! Torrest Sim - in-process download engine for development and tests
//!
//! Implements the core engine traits over a simulated swarm that serves
//! locally seeded content. Pieces arrive out of order under a byte budget,
//! honouring the priorities and deadlines set by the streaming layer, so the
//! whole server runs end to end without a native BitTorrent engine.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::path::Path;
//!
//! use torrest_sim::{SimConfig, SimEngine, Swarm};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let swarm = Arc::new(Swarm::new());
//! let content = swarm.seed_file(Path::new("movie.mp4"))?;
//! let engine = SimEngine::start(swarm, SimConfig::default())?;
//! println!("Add {} to stream it", content.magnet_uri());
//! # engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod resume;
pub mod swarm;
pub mod torrent;

pub use config::SimConfig;
pub use engine::SimEngine;
pub use resume::ResumeData;
pub use swarm::{SeededContent, Swarm, SwarmError};
pub use torrent::SimTorrent;
