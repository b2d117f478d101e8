//! The upload-side server.
//!
//! One [`UploadServer`] is one receiving session. Browsers post plain
//! multipart forms to `/upload`; the chunked client drives the three
//! `/transfer/*` endpoints instead. Either way a received file lands in the
//! session temp directory and is handed to the [`StagingArea`], never to
//! the final destination directly.
//!
//! Multipart bodies are streamed to an on-disk spool while counting bytes,
//! so an oversized request is rejected the moment it crosses the cap
//! instead of after the fact. The spool is then read back for parsing;
//! peak memory is bounded by one buffered request rather than the whole
//! connection lifetime, at the cost of a second pass.
// TODO: parse multipart boundaries incrementally during the streaming pass
// to drop the second full read.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path as StdPath, PathBuf};
use std::sync::{Arc, Mutex};

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, DefaultBodyLimit, Request, State},
    http::{header, HeaderMap},
    middleware,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{Config, LimitConfig};
use crate::error::Result;
use crate::file::sanitize_file_name;
use crate::gate::{ConnectionGate, GateConfig};
use crate::limit::RateLimiter;
use crate::multipart;
use crate::staging::StagingArea;
use crate::transfer::{
    plan_chunks, verify_declared_hash, ChunkCipher, CompleteRequest, CompleteResponse,
    InitiateRequest, InitiateResponse, HEADER_CHUNK_CHECKSUM, HEADER_CHUNK_ENCRYPTED,
    HEADER_CHUNK_INDEX, HEADER_CHUNK_SIZE, HEADER_TRANSFER_ID,
};

use super::error::{ApiError, ApiResult};
use super::{assets, bind_probe, cors_layer, local_ip, not_found, rate_limit};

/// One in-flight chunked transfer.
#[derive(Debug)]
struct ChunkedTransfer {
    file_name: String,
    file_size: u64,
    chunk_size: u64,
    total_chunks: u64,
    encrypted: bool,
    temp_path: PathBuf,
    received: HashSet<u64>,
}

struct UploadState {
    staging: StagingArea,
    temp_dir: PathBuf,
    gate: ConnectionGate,
    limits: LimitConfig,
    cipher: Option<ChunkCipher>,
    transfers: Mutex<HashMap<Uuid, ChunkedTransfer>>,
}

impl UploadState {
    /// 403 unless the gate allows this source (or is disabled).
    fn check_gate(&self, source: &str) -> ApiResult<()> {
        if self.gate.is_allowed(source) {
            Ok(())
        } else {
            Err(ApiError::forbidden(source))
        }
    }
}

/// One receiving session's HTTP server.
pub struct UploadServer {
    state: Arc<UploadState>,
    url: String,
    port: u16,
    shutdown: Arc<Notify>,
    serve_handle: JoinHandle<()>,
    expiry_handle: JoinHandle<()>,
}

impl std::fmt::Debug for UploadServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadServer")
            .field("url", &self.url)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl UploadServer {
    /// Start a receiving session.
    ///
    /// Received files are written under `temp_dir` and staged towards
    /// `final_dir`; nothing reaches `final_dir` without an explicit save.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created or no port in
    /// the probe range is free.
    pub async fn start(temp_dir: &StdPath, final_dir: &StdPath, config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(temp_dir).await?;
        let staging = StagingArea::new(final_dir)?;

        let limiter = Arc::new(RateLimiter::new(
            config.limits.rate_limit,
            config.limits.rate_window(),
        ));
        let gate = ConnectionGate::new(
            GateConfig {
                enabled: config.receive.require_confirmation,
                session_expiration: config.receive.session_expiration(),
                ..GateConfig::default()
            },
            Arc::clone(&limiter),
        );
        gate.start_sweeper();

        let (listener, port) =
            bind_probe(config.receive.start_port, config.receive.port_attempts).await?;
        let url = format!("http://{}:{port}", local_ip());

        let state = Arc::new(UploadState {
            staging,
            temp_dir: temp_dir.to_path_buf(),
            gate: gate.clone(),
            limits: config.limits.clone(),
            cipher: config
                .chunked
                .shared_secret
                .as_deref()
                .map(ChunkCipher::from_secret),
            transfers: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/", get(upload_form))
            .route("/upload", post(ingest_multipart))
            .route("/transfer/parallel/initiate", post(initiate_transfer))
            .route("/transfer/chunk", post(receive_chunk))
            .route("/transfer/parallel/complete", post(complete_transfer))
            .fallback(not_found)
            .with_state(Arc::clone(&state))
            .layer(DefaultBodyLimit::disable())
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
                tracing::error!(error = %e, "upload server terminated");
            }
        });

        let expiry_shutdown = Arc::clone(&shutdown);
        let expiry_state = Arc::clone(&state);
        let expiration = config.receive.session_expiration();
        let expiry_handle = tokio::spawn(async move {
            tokio::time::sleep(expiration).await;
            tracing::info!("receiving session expired");
            expiry_shutdown.notify_waiters();
            expiry_state.gate.shutdown();
            teardown_files(&expiry_state).await;
        });

        tracing::info!(port, %url, "receiving session started");

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

    /// Handle to the session's staging area.
    #[must_use]
    pub fn staging(&self) -> StagingArea {
        self.state.staging.clone()
    }

    /// Handle to the session's confirmation gate.
    #[must_use]
    pub fn gate(&self) -> ConnectionGate {
        self.state.gate.clone()
    }

    /// Tear the session down.
    ///
    /// Stops accepting new connections, force-closes in-flight requests,
    /// cancels the session timers, then deletes unresolved staged files and
    /// incomplete chunked transfers.
    pub async fn stop(self) {
        self.shutdown.notify_waiters();
        self.serve_handle.abort();
        self.expiry_handle.abort();
        self.state.gate.shutdown();
        let _ = self.serve_handle.await;
        teardown_files(&self.state).await;
        tracing::info!(port = self.port, "receiving session stopped");
    }
}

/// Delete unresolved staged files and incomplete transfer temp files.
async fn teardown_files(state: &UploadState) {
    state.staging.dispose().await;

    let leftovers: Vec<PathBuf> = {
        let mut transfers = state.transfers.lock().expect("transfer lock poisoned");
        transfers.drain().map(|(_, t)| t.temp_path).collect()
    };
    for path in leftovers {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove transfer temp");
            }
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET /`: the upload form; first contact registers with the gate.
async fn upload_form(
    State(state): State<Arc<UploadState>>,
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

    assets::serve_page("upload.html")
}

/// One accepted file in the `/upload` response.
#[derive(Debug, Serialize)]
struct AcceptedFile {
    name: String,
    size: u64,
    temp_path: String,
}

/// Response of `POST /upload`.
#[derive(Debug, Serialize)]
struct UploadSummary {
    count: usize,
    files: Vec<AcceptedFile>,
}

/// `POST /upload`: multipart ingestion.
async fn ingest_multipart(
    State(state): State<Arc<UploadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> ApiResult<Json<UploadSummary>> {
    let source = addr.ip().to_string();
    state.check_gate(&source)?;

    let boundary = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(multipart::boundary_from_content_type)
        .ok_or_else(|| ApiError::bad_request("expected multipart/form-data with a boundary"))?;

    let spool = state
        .temp_dir
        .join(format!("spool-{}.tmp", Uuid::new_v4().simple()));

    let result = match spool_body(request.into_body(), &spool, state.limits.max_request_bytes).await
    {
        Ok(total) => {
            tracing::debug!(total, "request body spooled");
            ingest_spool(&state, &spool, &boundary).await
        }
        Err(e) => Err(e),
    };

    // The spool never outlives the request, whatever the outcome.
    let _ = tokio::fs::remove_file(&spool).await;

    result.map(Json)
}

/// Stream the request body to the spool, enforcing the total-upload cap
/// after every chunk.
async fn spool_body(body: Body, spool: &StdPath, cap: u64) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(spool).await?;
    let mut stream = body.into_data_stream();
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| ApiError::bad_request(format!("failed to read body: {e}")))?;
        total += chunk.len() as u64;
        if total > cap {
            tracing::warn!(total, cap, "upload aborted over total-size cap");
            return Err(ApiError::payload_too_large(cap));
        }
        file.write_all(&chunk).await?;
    }

    file.flush().await?;
    Ok(total)
}

/// Parse the spooled body and stage every surviving part.
async fn ingest_spool(
    state: &Arc<UploadState>,
    spool: &StdPath,
    boundary: &str,
) -> ApiResult<UploadSummary> {
    let body = tokio::fs::read(spool).await?;
    let parts = multipart::parse(&body, boundary);

    let mut files = Vec::new();
    for part in parts {
        let size = part.data.len() as u64;
        if size > state.limits.max_file_bytes {
            tracing::warn!(
                name = part.filename,
                size,
                cap = state.limits.max_file_bytes,
                "part over per-file cap skipped"
            );
            continue;
        }

        let name = sanitize_file_name(&part.filename);
        let temp_path = state.temp_dir.join(temp_file_name(&name));
        tokio::fs::write(&temp_path, &part.data).await?;

        let staged = state.staging.stage(&name, &temp_path, size);
        files.push(AcceptedFile {
            name: staged.name,
            size,
            temp_path: temp_path.display().to_string(),
        });
    }

    Ok(UploadSummary {
        count: files.len(),
        files,
    })
}

/// Collision-resistant temp file name: receipt time plus a random tag.
fn temp_file_name(name: &str) -> String {
    let tag = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &tag[..8],
        name
    )
}

/// `POST /transfer/parallel/initiate`: open a chunked transfer.
async fn initiate_transfer(
    State(state): State<Arc<UploadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<Json<InitiateResponse>> {
    let source = addr.ip().to_string();
    state.check_gate(&source)?;

    if request.chunk_size == 0 {
        return Err(ApiError::bad_request("chunk_size must be positive"));
    }
    if request.file_size > state.limits.max_file_bytes {
        return Err(ApiError::payload_too_large(state.limits.max_file_bytes));
    }
    let expected_chunks = plan_chunks(request.file_size, request.chunk_size).len() as u64;
    if request.total_chunks != expected_chunks {
        return Err(ApiError::bad_request(format!(
            "total_chunks {} does not match size/chunk_size ({expected_chunks})",
            request.total_chunks
        )));
    }
    if request.encrypted && state.cipher.is_none() {
        return Err(ApiError::bad_request(
            "encrypted transfer needs a shared secret configured on the receiver",
        ));
    }

    let transfer_id = Uuid::new_v4();
    let temp_path = state
        .temp_dir
        .join(format!("transfer-{}.part", transfer_id.simple()));
    let file = tokio::fs::File::create(&temp_path).await?;
    file.set_len(request.file_size).await?;

    let file_name = sanitize_file_name(&request.file_name);
    tracing::info!(
        %transfer_id,
        file = file_name,
        size = request.file_size,
        chunks = request.total_chunks,
        encrypted = request.encrypted,
        "chunked transfer initiated"
    );

    state.transfers.lock().expect("transfer lock poisoned").insert(
        transfer_id,
        ChunkedTransfer {
            file_name,
            file_size: request.file_size,
            chunk_size: request.chunk_size,
            total_chunks: request.total_chunks,
            encrypted: request.encrypted,
            temp_path,
            received: HashSet::new(),
        },
    );

    Ok(Json(InitiateResponse { transfer_id }))
}

/// Response of `POST /transfer/chunk`.
#[derive(Debug, Serialize)]
struct ChunkAck {
    received: u64,
    total: u64,
}

fn header_value<'h>(headers: &'h HeaderMap, name: &str) -> ApiResult<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::bad_request(format!("missing {name} header")))
}

/// `POST /transfer/chunk`: one raw chunk body, written at its offset.
async fn receive_chunk(
    State(state): State<Arc<UploadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<ChunkAck>> {
    let source = addr.ip().to_string();
    state.check_gate(&source)?;

    let transfer_id: Uuid = header_value(&headers, HEADER_TRANSFER_ID)?
        .parse()
        .map_err(|_| ApiError::bad_request("malformed transfer id"))?;
    let index: u64 = header_value(&headers, HEADER_CHUNK_INDEX)?
        .parse()
        .map_err(|_| ApiError::bad_request("malformed chunk index"))?;

    // Copy what the write needs out of the table; the disk I/O happens
    // without holding the lock.
    let (temp_path, offset, expected_len, encrypted, total_chunks) = {
        let transfers = state.transfers.lock().expect("transfer lock poisoned");
        let transfer = transfers
            .get(&transfer_id)
            .ok_or_else(|| ApiError::not_found(format!("unknown transfer '{transfer_id}'")))?;
        if index >= transfer.total_chunks {
            return Err(ApiError::bad_request(format!(
                "chunk index {index} out of range ({} chunks)",
                transfer.total_chunks
            )));
        }
        let offset = index * transfer.chunk_size;
        (
            transfer.temp_path.clone(),
            offset,
            transfer.chunk_size.min(transfer.file_size - offset),
            transfer.encrypted,
            transfer.total_chunks,
        )
    };

    let plaintext = if header_value(&headers, HEADER_CHUNK_ENCRYPTED).unwrap_or("0") == "1" {
        if !encrypted {
            return Err(ApiError::bad_request(
                "transfer was not initiated as encrypted",
            ));
        }
        let cipher = state
            .cipher
            .as_ref()
            .ok_or_else(|| ApiError::bad_request("no shared secret configured"))?;
        cipher.open(&body).map_err(ApiError::from)?
    } else {
        body.to_vec()
    };

    if let Ok(declared) = header_value(&headers, HEADER_CHUNK_SIZE) {
        let declared: u64 = declared
            .parse()
            .map_err(|_| ApiError::bad_request("malformed chunk size"))?;
        if declared != plaintext.len() as u64 {
            return Err(ApiError::bad_request(format!(
                "chunk size mismatch: declared {declared}, got {}",
                plaintext.len()
            )));
        }
    }
    if plaintext.len() as u64 != expected_len {
        return Err(ApiError::bad_request(format!(
            "chunk {index} must be {expected_len} bytes, got {}",
            plaintext.len()
        )));
    }

    if let Ok(checksum) = header_value(&headers, HEADER_CHUNK_CHECKSUM) {
        let declared: u64 = checksum
            .parse()
            .map_err(|_| ApiError::bad_request("malformed chunk checksum"))?;
        if declared != xxhash_rust::xxh64::xxh64(&plaintext, 0) {
            return Err(crate::error::Error::ChunkChecksumMismatch { chunk: index }.into());
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&temp_path)
        .await?;
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    file.write_all(&plaintext).await?;
    file.flush().await?;

    let received = {
        let mut transfers = state.transfers.lock().expect("transfer lock poisoned");
        let transfer = transfers
            .get_mut(&transfer_id)
            .ok_or_else(|| ApiError::not_found(format!("unknown transfer '{transfer_id}'")))?;
        transfer.received.insert(index);
        transfer.received.len() as u64
    };

    Ok(Json(ChunkAck {
        received,
        total: total_chunks,
    }))
}

/// `POST /transfer/parallel/complete`: verify the declared hash, then
/// stage the assembled file.
async fn complete_transfer(
    State(state): State<Arc<UploadState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<Json<CompleteResponse>> {
    let source = addr.ip().to_string();
    state.check_gate(&source)?;

    let (file_name, file_size, temp_path) = {
        let transfers = state.transfers.lock().expect("transfer lock poisoned");
        let transfer = transfers.get(&request.transfer_id).ok_or_else(|| {
            ApiError::not_found(format!("unknown transfer '{}'", request.transfer_id))
        })?;
        let received = transfer.received.len() as u64;
        if received != transfer.total_chunks {
            return Err(crate::error::Error::TransferIncomplete {
                received,
                total: transfer.total_chunks,
            }
            .into());
        }
        (
            transfer.file_name.clone(),
            transfer.file_size,
            transfer.temp_path.clone(),
        )
    };

    verify_declared_hash(&temp_path, &request.hash)
        .await
        .map_err(ApiError::from)?;

    state
        .transfers
        .lock()
        .expect("transfer lock poisoned")
        .remove(&request.transfer_id);

    let staged = state.staging.stage(&file_name, &temp_path, file_size);
    tracing::info!(name = staged.name, size = file_size, "chunked transfer completed");

    Ok(Json(CompleteResponse {
        name: staged.name,
        size: file_size,
    }))
}
