//! The download-side server.
//!
//! One [`DownloadServer`] is one sharing session: it snapshots the shared
//! files, binds the first free port in the probe range, and serves a file
//! catalog, image thumbnails, and full or ranged file streams until the
//! operator stops it or the session expiration fires.
//!
//! The landing page is always served (it is what triggers the first
//! confirmation prompt); actual file downloads require the source to be
//! confirmed through the [`ConnectionGate`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, StatusCode},
    middleware,
    response::Response,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use tokio::io::AsyncSeekExt;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::config::Config;
use crate::error::Result;
use crate::file::{format_size, snapshot_files, FileKind, SharedFileEntry};
use crate::gate::{ConnectionGate, GateConfig};
use crate::limit::RateLimiter;

use super::error::{ApiError, ApiResult};
use super::{assets, bind_probe, cors_layer, local_ip, not_found, rate_limit};

/// Read size for ranged streaming.
const STREAM_CHUNK: usize = 64 * 1024;

/// Telemetry emitted while serving downloads.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A download response is about to stream
    Started {
        /// Source address of the client
        source: String,
        /// File index in the session snapshot
        index: usize,
        /// File name
        name: String,
    },
    /// A download stream finished
    Completed {
        /// File index in the session snapshot
        index: usize,
        /// File name
        name: String,
        /// Bytes actually streamed
        bytes: u64,
    },
}

struct DownloadState {
    files: Vec<SharedFileEntry>,
    gate: ConnectionGate,
    events: broadcast::Sender<DownloadEvent>,
}

/// One sharing session's HTTP server.
#[derive(Debug)]
pub struct DownloadServer {
    state: Arc<DownloadState>,
    url: String,
    port: u16,
    shutdown: Arc<Notify>,
    serve_handle: JoinHandle<()>,
    expiry_handle: JoinHandle<()>,
}

impl std::fmt::Debug for DownloadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadState")
            .field("files", &self.files.len())
            .finish_non_exhaustive()
    }
}

impl DownloadServer {
    /// Start a sharing session for the given paths.
    ///
    /// Stats every file once, binds the first free port in the configured
    /// probe range, and arms the session-expiration timer.
    ///
    /// # Errors
    ///
    /// Returns an error if a path cannot be read or no port in the probe
    /// range is free.
    pub async fn start(paths: &[PathBuf], config: &Config) -> Result<Self> {
        let files = snapshot_files(paths)?;

        let limiter = Arc::new(RateLimiter::new(
            config.limits.rate_limit,
            config.limits.rate_window(),
        ));
        let gate = ConnectionGate::new(
            GateConfig {
                enabled: config.share.require_confirmation,
                confirmation_timeout: config.share.confirmation_timeout(),
                registry_cap: config.share.registry_cap,
                session_expiration: config.share.session_expiration(),
                sweep_interval: config.share.sweep_interval(),
            },
            Arc::clone(&limiter),
        );
        gate.start_sweeper();

        let (listener, port) =
            bind_probe(config.share.start_port, config.share.port_attempts).await?;
        let url = format!("http://{}:{port}", local_ip());

        let (events, _) = broadcast::channel(64);
        let state = Arc::new(DownloadState {
            files,
            gate: gate.clone(),
            events,
        });

        let app = Router::new()
            .route("/", get(index))
            .route("/index.html", get(index))
            .route("/api/files", get(list_files))
            .route("/thumbnail/{index}", get(thumbnail))
            .route("/download/{index}/{name}", get(download))
            .fallback(not_found)
            .with_state(Arc::clone(&state))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&limiter),
                rate_limit,
            ))
            .layer(cors_layer());

        let shutdown = Arc::new(Notify::new());
        let signal = Arc::clone(&shutdown);
        let serve_handle = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, service)
                .with_graceful_shutdown(async move { signal.notified().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "download server terminated");
            }
        });

        let expiry_shutdown = Arc::clone(&shutdown);
        let expiry_gate = gate;
        let expiration = config.share.session_expiration();
        let expiry_handle = tokio::spawn(async move {
            tokio::time::sleep(expiration).await;
            tracing::info!("sharing session expired");
            expiry_shutdown.notify_waiters();
            expiry_gate.shutdown();
        });

        tracing::info!(port, files = state.files.len(), %url, "sharing session started");

        Ok(Self {
            state,
            url,
            port,
            shutdown,
            serve_handle,
            expiry_handle,
        })
    }

    /// The reachable URL clients should open.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The bound port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The session's file snapshot.
    #[must_use]
    pub fn files(&self) -> &[SharedFileEntry] {
        &self.state.files
    }

    /// Handle to the session's confirmation gate.
    #[must_use]
    pub fn gate(&self) -> ConnectionGate {
        self.state.gate.clone()
    }

    /// Subscribe to download telemetry.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.state.events.subscribe()
    }

    /// Subscribe to the active-connection count.
    #[must_use]
    pub fn subscribe_active_count(&self) -> watch::Receiver<usize> {
        self.state.gate.subscribe_active_count()
    }

    /// Tear the session down.
    ///
    /// Stops accepting new connections, force-closes in-flight responses,
    /// then cancels the session timers before releasing shared state.
    pub async fn stop(self) {
        self.shutdown.notify_waiters();
        self.serve_handle.abort();
        self.expiry_handle.abort();
        self.state.gate.shutdown();
        let _ = self.serve_handle.await;
        tracing::info!(port = self.port, "sharing session stopped");
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET /` and `GET /index.html`.
///
/// Registers the caller with the gate (first contact) and serves the
/// landing page; always permitted regardless of confirmation state.
async fn index(
    State(state): State<Arc<DownloadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    state
        .gate
        .request_access(&addr.ip().to_string(), identity);

    assets::serve_page("index.html")
}

/// One catalog entry of `GET /api/files`.
#[derive(Debug, Serialize)]
struct CatalogEntry {
    index: usize,
    name: String,
    size: u64,
    size_display: String,
    kind: FileKind,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thumbnail_url: Option<String>,
}

/// Response of `GET /api/files`.
#[derive(Debug, Serialize)]
struct Catalog {
    files: Vec<CatalogEntry>,
}

/// `GET /api/files`: the catalog, straight from the session snapshot.
async fn list_files(State(state): State<Arc<DownloadState>>) -> Json<Catalog> {
    let files = state
        .files
        .iter()
        .map(|entry| {
            let kind = entry.kind();
            CatalogEntry {
                index: entry.index,
                name: entry.name.clone(),
                size: entry.size,
                size_display: format_size(entry.size),
                kind,
                url: format!(
                    "/download/{}/{}",
                    entry.index,
                    utf8_percent_encode(&entry.name, NON_ALPHANUMERIC)
                ),
                thumbnail_url: (kind == FileKind::Image)
                    .then(|| format!("/thumbnail/{}", entry.index)),
            }
        })
        .collect();

    Json(Catalog { files })
}

/// `GET /thumbnail/{index}`: raw image bytes with a long cache lifetime.
async fn thumbnail(
    State(state): State<Arc<DownloadState>>,
    Path(index): Path<usize>,
) -> ApiResult<Response> {
    let entry = state
        .files
        .get(index)
        .ok_or_else(|| ApiError::not_found(format!("no file at index {index}")))?;

    if entry.kind() != FileKind::Image {
        return Err(ApiError::bad_request("thumbnails exist for images only"));
    }

    let file = tokio::fs::File::open(&entry.path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, entry.mime_type())
        .header(header::CONTENT_LENGTH, entry.size)
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(body)
        .map_err(|e| ApiError::internal(e.to_string()))?)
}

/// Outcome of parsing a `Range` header against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// No (or malformed) range: serve the whole file
    Full,
    /// A satisfiable `bytes=start-end` window
    Window {
        /// First byte, inclusive
        start: u64,
        /// Last byte, inclusive
        end: u64,
    },
    /// Syntactically valid but unsatisfiable
    Unsatisfiable,
}

/// Parse `Range: bytes=start-end` (open-ended end allowed).
///
/// Malformed syntax falls back to the whole file; a valid range with
/// `start ≥ size` or `start > end` is unsatisfiable.
fn parse_range(header: Option<&str>, size: u64) -> RangeSpec {
    let Some(raw) = header else {
        return RangeSpec::Full;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeSpec::Full;
    };
    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };
    let Ok(start) = start_raw.trim().parse::<u64>() else {
        return RangeSpec::Full;
    };

    let end = if end_raw.trim().is_empty() {
        size.saturating_sub(1)
    } else {
        match end_raw.trim().parse::<u64>() {
            Ok(end) => end,
            Err(_) => return RangeSpec::Full,
        }
    };

    if start >= size || start > end {
        return RangeSpec::Unsatisfiable;
    }

    RangeSpec::Window {
        start,
        end: end.min(size.saturating_sub(1)),
    }
}

/// `GET /download/{index}/{name}`: full or ranged file streaming.
async fn download(
    State(state): State<Arc<DownloadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((index, _name)): Path<(usize, String)>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let source = addr.ip().to_string();
    if !state.gate.is_allowed(&source) {
        return Err(ApiError::forbidden(&source));
    }

    let entry = state
        .files
        .get(index)
        .ok_or_else(|| ApiError::not_found(format!("no file at index {index}")))?
        .clone();

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    match parse_range(range, entry.size) {
        RangeSpec::Unsatisfiable => Ok(Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", entry.size))
            .body(Body::empty())
            .map_err(|e| ApiError::internal(e.to_string()))?),
        RangeSpec::Full => serve_window(&state, &source, &entry, 0, entry.size, false).await,
        RangeSpec::Window { start, end } => {
            serve_window(&state, &source, &entry, start, end - start + 1, true).await
        }
    }
}

/// Stream `len` bytes of `entry` starting at `start`.
///
/// Emits the download-started event before streaming and the completed
/// event once the body is fully written. The body is read positionally in
/// bounded chunks so a request never holds more than one chunk in memory.
async fn serve_window(
    state: &Arc<DownloadState>,
    source: &str,
    entry: &SharedFileEntry,
    start: u64,
    len: u64,
    partial: bool,
) -> ApiResult<Response> {
    let mut file = tokio::fs::File::open(&entry.path).await?;
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start)).await?;
    }

    let _ = state.events.send(DownloadEvent::Started {
        source: source.to_string(),
        index: entry.index,
        name: entry.name.clone(),
    });

    let events = state.events.clone();
    let index = entry.index;
    let name = entry.name.clone();
    let inner = ReaderStream::with_capacity(tokio::io::AsyncReadExt::take(file, len), STREAM_CHUNK);
    let tapped = async_stream::stream! {
        futures::pin_mut!(inner);
        let mut sent: u64 = 0;
        while let Some(item) = inner.next().await {
            if let Ok(bytes) = &item {
                sent += bytes.len() as u64;
            }
            yield item;
        }
        let _ = events.send(DownloadEvent::Completed { index, name, bytes: sent });
    };

    let mut response = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_TYPE, entry.mime_type())
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, content_disposition(&entry.name))
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate");

    if partial {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, entry.size),
        );
    }

    Ok(response
        .body(Body::from_stream(tapped))
        .map_err(|e| ApiError::internal(e.to_string()))?)
}

/// RFC 5987-style content disposition: an ASCII-sanitized filename plus a
/// UTF-8 percent-encoded `filename*`.
fn content_disposition(name: &str) -> String {
    let ascii: String = name
        .chars()
        .map(|c| {
            if c.is_ascii() && c != '"' && c != '\\' && !c.is_ascii_control() {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(name, NON_ALPHANUMERIC);
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_absent() {
        assert_eq!(parse_range(None, 100), RangeSpec::Full);
    }

    #[test]
    fn test_parse_range_window() {
        assert_eq!(
            parse_range(Some("bytes=0-99"), 500_000),
            RangeSpec::Window { start: 0, end: 99 }
        );
        assert_eq!(
            parse_range(Some("bytes=10-19"), 100),
            RangeSpec::Window { start: 10, end: 19 }
        );
    }

    #[test]
    fn test_parse_range_open_ended() {
        assert_eq!(
            parse_range(Some("bytes=90-"), 100),
            RangeSpec::Window { start: 90, end: 99 }
        );
    }

    #[test]
    fn test_parse_range_end_clamped_to_size() {
        assert_eq!(
            parse_range(Some("bytes=50-1000"), 100),
            RangeSpec::Window { start: 50, end: 99 }
        );
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range(Some("bytes=100-200"), 100), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=500-"), 100), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=20-10"), 100), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-0"), 0), RangeSpec::Unsatisfiable);
    }

    #[test]
    fn test_parse_range_malformed_falls_back_to_full() {
        assert_eq!(parse_range(Some("bytes=abc-def"), 100), RangeSpec::Full);
        assert_eq!(parse_range(Some("items=0-10"), 100), RangeSpec::Full);
        assert_eq!(parse_range(Some("bytes=-500"), 100), RangeSpec::Full);
        assert_eq!(parse_range(Some("bytes=0-1,5-6"), 100), RangeSpec::Full);
        assert_eq!(parse_range(Some("garbage"), 100), RangeSpec::Full);
    }

    #[test]
    fn test_content_disposition_ascii_passthrough() {
        let value = content_disposition("report.pdf");
        assert!(value.contains("filename=\"report.pdf\""));
        assert!(value.contains("filename*=UTF-8''report%2Epdf"));
    }

    #[test]
    fn test_content_disposition_sanitizes_non_ascii() {
        let value = content_disposition("r\u{e9}sum\u{e9}.pdf");
        assert!(value.contains("filename=\"r_sum_.pdf\""));
        assert!(value.contains("filename*=UTF-8''r%C3%A9sum%C3%A9%2Epdf"));
    }
}
