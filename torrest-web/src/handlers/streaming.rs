//! Byte-range streaming of torrent files.
//!
//! The body of a GET is pulled from a blocking `Reader` on the blocking
//! thread pool in fixed chunks. The reader's close guard lives inside the
//! body stream, so a client hanging up drops the body and releases a reader
//! that is still waiting for a piece.

use std::io;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;
use torrest_core::{ByteRange, File, Reader};
use tracing::{debug, info};

use super::lookup_file;
use crate::error::ApiResult;
use crate::server::AppState;

/// Bytes pulled from the reader per body chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the reader thread and the response body.
const CHUNK_QUEUE: usize = 4;

/// Resolves a `Range` header against a file of `size` bytes.
///
/// A missing or malformed header means `bytes=0-`. Only the first range of a
/// multi-range request is served. Returns `None` when the range cannot be
/// satisfied.
pub fn parse_range_header(range: Option<&str>, size: u64) -> Option<ByteRange> {
    let full = ByteRange::full(size);
    if size == 0 {
        return None;
    }

    let Some(ranges) = range.and_then(|value| value.trim().strip_prefix("bytes=")) else {
        return Some(full);
    };
    let first = ranges.split(',').next().unwrap_or_default().trim();
    let Some((start, end)) = first.split_once('-') else {
        return Some(full);
    };

    let last = size - 1;
    match (start.trim(), end.trim()) {
        ("", "") => Some(full),
        ("", suffix) => match suffix.parse::<u64>() {
            Ok(0) => None,
            Ok(suffix) => Some(ByteRange::new(size.saturating_sub(suffix), last)),
            Err(_) => Some(full),
        },
        (start, end) => {
            let Ok(start) = start.parse::<u64>() else {
                return Some(full);
            };
            let end = if end.is_empty() {
                last
            } else {
                match end.parse::<u64>() {
                    Ok(end) if end >= start => end.min(last),
                    _ => return Some(full),
                }
            };
            if start > last {
                return None;
            }
            Some(ByteRange::new(start, end))
        }
    }
}

fn content_type(file: &File) -> String {
    mime_guess::from_path(file.name())
        .first_or_octet_stream()
        .to_string()
}

/// HEAD: size and type of the file, no body.
pub async fn stream_file_head(
    State(state): State<AppState>,
    Path((hash, index, _name)): Path<(String, usize, String)>,
) -> ApiResult<Response> {
    let (_, file) = lookup_file(&state, &hash, index)?;
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type(&file)),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_LENGTH, file.size().to_string()),
        ],
    )
        .into_response())
}

/// GET: the requested range of the file as `206 Partial Content`.
pub async fn stream_file(
    State(state): State<AppState>,
    Path((hash, index, _name)): Path<(String, usize, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let (torrent, file) = lookup_file(&state, &hash, index)?;
    let size = file.size();
    let mime = content_type(&file);

    if size == 0 {
        return Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime),
                (header::ACCEPT_RANGES, "bytes".to_string()),
                (header::CONTENT_LENGTH, "0".to_string()),
            ],
        )
            .into_response());
    }

    let requested = headers.get(header::RANGE).and_then(|value| value.to_str().ok());
    let Some(range) = parse_range_header(requested, size) else {
        debug!(info_hash = %torrent.info_hash(), file = index, range = ?requested, "Unsatisfiable range");
        return Ok((
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_RANGE, format!("bytes */{size}")),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
        )
            .into_response());
    };

    info!(
        info_hash = %torrent.info_hash(),
        file = %file.name(),
        start = range.start,
        end = range.end,
        "Streaming file"
    );
    let reader = Reader::open(torrent, file, range, state.shutdown.clone())?;

    Ok((
        StatusCode::PARTIAL_CONTENT,
        [
            (header::CONTENT_TYPE, mime),
            (header::ACCEPT_RANGES, "bytes".to_string()),
            (header::CONTENT_LENGTH, range.len().to_string()),
            (
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, size),
            ),
        ],
        reader_body(reader),
    )
        .into_response())
}

/// Streams `reader` to the end of its range.
///
/// A reader that stops early ends the body with an error so the client sees
/// a truncated transfer instead of a short success.
fn reader_body(mut reader: Reader) -> Body {
    let guard = reader.close_handle();
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHUNK_QUEUE);
    let end = reader.range().end + 1;

    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let read = reader.read(&mut buf);
            if read == 0 {
                break;
            }
            if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..read]))).is_err() {
                debug!(reader = reader.id(), "Client went away");
                return;
            }
        }

        if reader.position() < end {
            debug!(
                reader = reader.id(),
                position = reader.position(),
                state = ?reader.state(),
                "Reader stopped before the end of its range"
            );
            let _ = tx.blocking_send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream stopped at byte {}", reader.position()),
            )));
        }
    });

    let chunks = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let chunk = rx.recv().await?;
        Some((chunk, (rx, guard)))
    });
    Body::from_stream(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_header_is_whole_file() {
        assert_eq!(parse_range_header(None, 1000), Some(ByteRange::new(0, 999)));
    }

    #[test]
    fn test_closed_and_open_ranges() {
        assert_eq!(
            parse_range_header(Some("bytes=100-199"), 1000),
            Some(ByteRange::new(100, 199))
        );
        assert_eq!(
            parse_range_header(Some("bytes=500-"), 1000),
            Some(ByteRange::new(500, 999))
        );
    }

    #[test]
    fn test_end_is_clamped_to_file() {
        assert_eq!(
            parse_range_header(Some("bytes=900-5000"), 1000),
            Some(ByteRange::new(900, 999))
        );
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(
            parse_range_header(Some("bytes=-100"), 1000),
            Some(ByteRange::new(900, 999))
        );
        assert_eq!(
            parse_range_header(Some("bytes=-5000"), 1000),
            Some(ByteRange::new(0, 999))
        );
        assert_eq!(parse_range_header(Some("bytes=-0"), 1000), None);
    }

    #[test]
    fn test_start_past_end_is_unsatisfiable() {
        assert_eq!(parse_range_header(Some("bytes=1000-"), 1000), None);
        assert_eq!(parse_range_header(Some("bytes=2000-2100"), 1000), None);
    }

    #[test]
    fn test_malformed_header_falls_back_to_whole_file() {
        for header in ["items=0-10", "bytes=abc-", "bytes=50-10", "bytes=10"] {
            assert_eq!(
                parse_range_header(Some(header), 1000),
                Some(ByteRange::new(0, 999)),
                "header {header}"
            );
        }
    }

    #[test]
    fn test_only_first_range_is_served() {
        assert_eq!(
            parse_range_header(Some("bytes=0-9, 20-29"), 1000),
            Some(ByteRange::new(0, 9))
        );
    }
}
