//! HTTP request handlers

pub mod files;
pub mod session;
pub mod settings;
pub mod streaming;
pub mod torrents;

use std::sync::Arc;

use torrest_core::{File, InfoHash, Torrent};

use crate::error::ApiResult;
use crate::server::AppState;

pub use files::{download_file, file_info, file_status, stop_file};
pub use session::{
    add_file, add_uri, pause_session, resume_session, session_info, session_status, shutdown,
};
pub use settings::{get_settings, set_settings};
pub use streaming::{stream_file, stream_file_head};
pub use torrents::{
    pause_torrent, remove_torrent, resume_torrent, torrent_files, torrent_info, torrent_status,
    torrents,
};

fn lookup_torrent(state: &AppState, hash: &str) -> ApiResult<Arc<Torrent>> {
    let info_hash: InfoHash = hash.parse()?;
    Ok(state.session.get_torrent(info_hash)?)
}

fn lookup_file(state: &AppState, hash: &str, index: usize) -> ApiResult<(Arc<Torrent>, Arc<File>)> {
    let torrent = lookup_torrent(state, hash)?;
    let file = torrent.get_file(index)?;
    Ok((torrent, file))
}
