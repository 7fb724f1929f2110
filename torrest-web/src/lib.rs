//! Torrest Web - JSON API and streaming server
//!
//! Exposes a running `torrest_core::Session` over HTTP: adding and removing
//! torrents, file selection and buffering, status reporting, runtime settings
//! and byte-range streaming of files while they download.

pub mod error;
pub mod handlers;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, ServerError, router, run_server};
