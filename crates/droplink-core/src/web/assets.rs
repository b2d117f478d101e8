//! Static landing pages served from embedded assets.
//!
//! The download and upload landing pages are embedded into the binary at
//! compile time with rust-embed, so the servers need no files on disk.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::Response,
};
use rust_embed::RustEmbed;

/// Embedded static assets for the browser UI.
#[derive(RustEmbed)]
#[folder = "src/web/assets/"]
#[include = "*.html"]
pub struct Assets;

/// Serve an embedded page by name.
///
/// Unknown names yield a plain 404; pages are served with `no-cache` since
/// they reflect per-session URLs.
#[must_use]
pub fn serve_page(name: &str) -> Response {
    Assets::get(name).map_or_else(
        || {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("Not Found"))
                .expect("static response")
        },
        |content| {
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .body(Body::from(content.data.to_vec()))
                .expect("static response")
        },
    )
}
