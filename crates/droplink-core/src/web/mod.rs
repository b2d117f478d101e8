//! The browser-facing HTTP servers.
//!
//! Droplink exposes two independent servers, each one session long:
//!
//! - [`DownloadServer`] lists, thumbnails, and streams the host's shared
//!   files with resumable ranged transfer.
//! - [`UploadServer`] accepts multipart and chunked uploads and stages the
//!   received files for an explicit save/discard decision.
//!
//! Both sit behind the same cross-cutting concerns: per-IP rate limiting,
//! permissive CORS with preflight handling, and (where enabled) the
//! connection confirmation gate. Every accepted connection is handled
//! concurrently; shared session state lives behind coarse per-map locks.

pub mod assets;
pub mod download;
pub mod error;
pub mod upload;

pub use download::{DownloadEvent, DownloadServer};
pub use error::{ApiError, ApiResult};
pub use upload::UploadServer;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Error, Result};
use crate::limit::RateLimiter;

/// Bind the first free port starting from `start_port`.
///
/// Tries up to `attempts` increasing ports before giving up; bind-port
/// probing is the only automatic retry in this subsystem.
pub(crate) async fn bind_probe(
    start_port: u16,
    attempts: u16,
) -> Result<(tokio::net::TcpListener, u16)> {
    for offset in 0..attempts.max(1) {
        let port = start_port.saturating_add(offset);
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                // Asking for port 0 lets the OS pick one; report what we got.
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                if offset > 0 {
                    tracing::debug!(port = bound, skipped = offset, "bound after probing");
                }
                return Ok((listener, bound));
            }
            Err(e) => tracing::debug!(port, error = %e, "port unavailable"),
        }
    }

    Err(Error::BindExhausted {
        start: start_port,
        end: start_port.saturating_add(attempts),
    })
}

/// Best-effort LAN address of this host.
///
/// Opens a UDP socket towards a public address to learn which local
/// interface would route there; no packet is sent.
#[must_use]
pub(crate) fn local_ip() -> String {
    if let Ok(socket) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if socket.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }
    "127.0.0.1".to_string()
}

/// Permissive CORS for browser clients on arbitrary origins.
///
/// Exposes the range/disposition/length/type headers so cross-origin
/// scripts can read them, and answers `OPTIONS` preflights with 200.
pub(crate) fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_DISPOSITION,
            header::CONTENT_LENGTH,
            header::CONTENT_TYPE,
            header::ACCEPT_RANGES,
        ])
}

/// Source key (client IP) for a request.
pub(crate) fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map_or_else(|| "unknown".to_string(), |info| info.0.ip().to_string())
}

/// Per-IP sliding-window admission, applied to every route.
pub(crate) async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let source = client_ip(&request);
    if limiter.admit(&source) {
        next.run(request).await
    } else {
        ApiError::rate_limited(&source).into_response()
    }
}

/// Fallback for unknown paths.
pub(crate) async fn not_found() -> ApiError {
    ApiError::not_found("no such resource")
}
