//! End-to-end tests for the upload server: multipart ingestion, size caps,
//! the staging workflow, and the chunked/parallel protocol.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;

use droplink_core::config::Config;
use droplink_core::staging::StagedStatus;
use droplink_core::transfer::{
    ChunkedUploadClient, ChunkedUploadConfig, UploadEncryption,
};
use droplink_core::web::UploadServer;

const BOUNDARY: &str = "----DroplinkTestBoundary4242";

/// Config suited to tests: ephemeral port, confirmation off.
fn open_config() -> Config {
    let mut config = Config::default();
    config.receive.start_port = 0;
    config.receive.port_attempts = 1;
    config.receive.require_confirmation = false;
    config
}

fn base_url(server: &UploadServer) -> String {
    format!("http://127.0.0.1:{}", server.port())
}

/// Encode files into a multipart body with the test boundary.
fn multipart_body(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, data) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n")
                .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

async fn post_multipart(base: &str, body: Vec<u8>) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base}/upload"))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(body)
        .send()
        .await
        .expect("post upload")
}

/// No spool or staged temp files left behind under the temp dir.
fn leftover_files(temp_dir: &Path) -> Vec<String> {
    std::fs::read_dir(temp_dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_multipart_upload_stages_file() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);

    let staging = server.staging();
    let mut staged_events = staging.subscribe();

    let payload = vec![42u8; 1024];
    let response = post_multipart(&base, multipart_body(&[("report.pdf", &payload)])).await;
    assert_eq!(response.status(), 200);

    let summary: serde_json::Value = response.json().await.expect("summary");
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["files"][0]["name"], "report.pdf");
    assert_eq!(summary["files"][0]["size"], 1024);

    // The staged file shows up on the event stream, still pending.
    let staged = tokio::time::timeout(Duration::from_secs(2), staged_events.recv())
        .await
        .expect("timely")
        .expect("staged event");
    assert_eq!(staged.name, "report.pdf");
    assert_eq!(staged.status, StagedStatus::Pending);
    assert_eq!(
        std::fs::read(&staged.temp_path).expect("temp file"),
        payload
    );

    // Discard deletes the temp artifact and flips the status.
    assert!(staging.discard(staged.id).await);
    assert!(!staged.temp_path.exists());
    assert_eq!(
        staging.get(staged.id).expect("entry").status,
        StagedStatus::Discarded
    );

    server.stop().await;
}

#[tokio::test]
async fn test_save_places_file_in_final_dir() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);
    let staging = server.staging();

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
    let response = post_multipart(&base, multipart_body(&[("data.bin", &payload)])).await;
    assert_eq!(response.status(), 200);

    let staged = &staging.list()[0];
    assert!(staging.save(staged.id).await);

    let saved = staging.get(staged.id).expect("entry");
    assert_eq!(saved.status, StagedStatus::Saved);
    let final_path = saved.final_path.expect("final path");
    assert!(final_path.starts_with(out.path()));
    assert_eq!(std::fs::read(&final_path).expect("read"), payload);

    server.stop().await;
}

#[tokio::test]
async fn test_non_multipart_request_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);

    let response = reqwest::Client::new()
        .post(format!("{base}/upload"))
        .header("Content-Type", "application/json")
        .body("{}")
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);

    // Multipart without a boundary is just as malformed.
    let response = reqwest::Client::new()
        .post(format!("{base}/upload"))
        .header("Content-Type", "multipart/form-data")
        .body("x")
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);

    server.stop().await;
}

#[tokio::test]
async fn test_total_cap_rejects_with_413_and_no_residue() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let mut config = open_config();
    config.limits.max_request_bytes = 1000;

    let server = UploadServer::start(temp.path(), out.path(), &config)
        .await
        .expect("start server");
    let base = base_url(&server);

    let oversized = vec![1u8; 4000];
    let response = post_multipart(&base, multipart_body(&[("big.bin", &oversized)])).await;
    assert_eq!(response.status(), 413);

    assert!(
        leftover_files(temp.path()).is_empty(),
        "rejected upload must leave no temp artifacts"
    );
    assert!(server.staging().list().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_per_file_cap_skips_part_but_keeps_siblings() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let mut config = open_config();
    config.limits.max_file_bytes = 100;

    let server = UploadServer::start(temp.path(), out.path(), &config)
        .await
        .expect("start server");
    let base = base_url(&server);

    let big = vec![1u8; 500];
    let small = vec![2u8; 50];
    let response = post_multipart(
        &base,
        multipart_body(&[("too-big.bin", &big), ("fits.bin", &small)]),
    )
    .await;
    assert_eq!(response.status(), 200);

    let summary: serde_json::Value = response.json().await.expect("summary");
    assert_eq!(summary["count"], 1, "oversized part silently skipped");
    assert_eq!(summary["files"][0]["name"], "fits.bin");

    let staged = server.staging().list();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].name, "fits.bin");

    server.stop().await;
}

#[tokio::test]
async fn test_upload_gating_when_enabled() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let mut config = open_config();
    config.receive.require_confirmation = true;

    let server = UploadServer::start(temp.path(), out.path(), &config)
        .await
        .expect("start server");
    let base = base_url(&server);

    let response = post_multipart(&base, multipart_body(&[("a.txt", b"hi")])).await;
    assert_eq!(response.status(), 403, "unconfirmed sources cannot upload");

    // The form page registers the first contact, then the operator approves.
    assert_eq!(reqwest::get(format!("{base}/")).await.expect("form").status(), 200);
    let gate = server.gate();
    let pending = gate.pending_requests();
    assert_eq!(pending.len(), 1);
    assert!(gate.resolve(&pending[0].source, true));

    let response = post_multipart(&base, multipart_body(&[("a.txt", b"hi")])).await;
    assert_eq!(response.status(), 200);

    server.stop().await;
}

// ============================================================================
// Chunked protocol
// ============================================================================

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[tokio::test]
async fn test_chunked_upload_roundtrip() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let src = TempDir::new().expect("src dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");

    let content = patterned(10_000);
    let source = src.path().join("dataset.bin");
    std::fs::write(&source, &content).expect("write source");

    let client = ChunkedUploadClient::new(
        base_url(&server),
        ChunkedUploadConfig {
            chunk_size: 1024,
            workers: 3,
            encryption: None,
        },
    );
    let report = client.upload(&source).await.expect("upload");
    assert_eq!(report.chunks, 10);
    assert_eq!(report.bytes, 10_000);
    assert!(report.hash.starts_with("sha256:"));

    let staging = server.staging();
    let staged = staging.list();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].name, "dataset.bin");
    assert_eq!(staged[0].size, 10_000);
    assert_eq!(
        std::fs::read(&staged[0].temp_path).expect("assembled"),
        content
    );

    assert!(staging.save(staged[0].id).await);
    let final_path = staging.get(staged[0].id).expect("entry").final_path.expect("path");
    assert_eq!(std::fs::read(final_path).expect("saved"), content);

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_upload_encrypted_with_shared_secret() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let src = TempDir::new().expect("src dir");
    let mut config = open_config();
    config.chunked.shared_secret = Some("orange-battery-plinth".into());

    let server = UploadServer::start(temp.path(), out.path(), &config)
        .await
        .expect("start server");

    let content = patterned(5_000);
    let source = src.path().join("secret.bin");
    std::fs::write(&source, &content).expect("write source");

    let client = ChunkedUploadClient::new(
        base_url(&server),
        ChunkedUploadConfig {
            chunk_size: 2048,
            workers: 2,
            encryption: Some(UploadEncryption::SharedSecret("orange-battery-plinth".into())),
        },
    );
    client.upload(&source).await.expect("encrypted upload");

    let staged = server.staging().list();
    assert_eq!(staged.len(), 1);
    assert_eq!(
        std::fs::read(&staged[0].temp_path).expect("assembled"),
        content,
        "server stores plaintext after opening each chunk"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_chunked_upload_wrong_secret_fails() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let src = TempDir::new().expect("src dir");
    let mut config = open_config();
    config.chunked.shared_secret = Some("right-secret".into());

    let server = UploadServer::start(temp.path(), out.path(), &config)
        .await
        .expect("start server");

    let source = src.path().join("f.bin");
    std::fs::write(&source, patterned(3000)).expect("write source");

    let client = ChunkedUploadClient::new(
        base_url(&server),
        ChunkedUploadConfig {
            chunk_size: 1024,
            workers: 1,
            encryption: Some(UploadEncryption::SharedSecret("wrong-secret".into())),
        },
    );
    assert!(
        client.upload(&source).await.is_err(),
        "chunks sealed with the wrong key must be rejected"
    );
    assert!(server.staging().list().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_initiate_validates_chunk_math() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);

    let response = reqwest::Client::new()
        .post(format!("{base}/transfer/parallel/initiate"))
        .json(&serde_json::json!({
            "file_name": "x.bin",
            "file_size": 10_000,
            "chunk_size": 1024,
            "total_chunks": 3,
            "encrypted": false,
        }))
        .send()
        .await
        .expect("initiate");
    assert_eq!(response.status(), 400, "total_chunks must match size/chunk_size");

    let response = reqwest::Client::new()
        .post(format!("{base}/transfer/parallel/initiate"))
        .json(&serde_json::json!({
            "file_name": "x.bin",
            "file_size": 10_000,
            "chunk_size": 1024,
            "total_chunks": 10,
            "encrypted": true,
        }))
        .send()
        .await
        .expect("initiate");
    assert_eq!(
        response.status(),
        400,
        "encrypted transfers need a shared secret on the receiver"
    );

    server.stop().await;
}

#[tokio::test]
async fn test_complete_before_all_chunks_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);
    let client = reqwest::Client::new();

    let initiate: serde_json::Value = client
        .post(format!("{base}/transfer/parallel/initiate"))
        .json(&serde_json::json!({
            "file_name": "partial.bin",
            "file_size": 4096,
            "chunk_size": 1024,
            "total_chunks": 4,
            "encrypted": false,
        }))
        .send()
        .await
        .expect("initiate")
        .json()
        .await
        .expect("parse");
    let transfer_id = initiate["transfer_id"].as_str().expect("id");

    let response = client
        .post(format!("{base}/transfer/parallel/complete"))
        .json(&serde_json::json!({
            "transfer_id": transfer_id,
            "hash": format!("sha256:{}", "0".repeat(64)),
        }))
        .send()
        .await
        .expect("complete");
    assert_eq!(response.status(), 400);

    let response = client
        .post(format!("{base}/transfer/parallel/complete"))
        .json(&serde_json::json!({
            "transfer_id": uuid::Uuid::new_v4(),
            "hash": "sha256:00",
        }))
        .send()
        .await
        .expect("complete");
    assert_eq!(response.status(), 404, "unknown transfer id");

    server.stop().await;
}

#[tokio::test]
async fn test_hash_mismatch_is_rejected() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);
    let client = reqwest::Client::new();

    let initiate: serde_json::Value = client
        .post(format!("{base}/transfer/parallel/initiate"))
        .json(&serde_json::json!({
            "file_name": "tampered.bin",
            "file_size": 8,
            "chunk_size": 1024,
            "total_chunks": 1,
            "encrypted": false,
        }))
        .send()
        .await
        .expect("initiate")
        .json()
        .await
        .expect("parse");
    let transfer_id = initiate["transfer_id"].as_str().expect("id").to_string();

    let response = client
        .post(format!("{base}/transfer/chunk"))
        .header("x-transfer-id", &transfer_id)
        .header("x-chunk-index", "0")
        .header("x-chunk-size", "8")
        .header("x-chunk-encrypted", "0")
        .body(b"AAAABBBB".to_vec())
        .send()
        .await
        .expect("chunk");
    assert_eq!(response.status(), 200);

    let response = client
        .post(format!("{base}/transfer/parallel/complete"))
        .json(&serde_json::json!({
            "transfer_id": transfer_id,
            "hash": format!("sha256:{}", "f".repeat(64)),
        }))
        .send()
        .await
        .expect("complete");
    assert_eq!(response.status(), 422, "declared hash must match the bytes");
    assert!(server.staging().list().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_stop_disposes_pending_files() {
    let temp = TempDir::new().expect("temp dir");
    let out = TempDir::new().expect("out dir");
    let server = UploadServer::start(temp.path(), out.path(), &open_config())
        .await
        .expect("start server");
    let base = base_url(&server);

    let response = post_multipart(&base, multipart_body(&[("doomed.txt", b"bye")])).await;
    assert_eq!(response.status(), 200);
    assert_eq!(server.staging().list().len(), 1);

    server.stop().await;

    assert!(
        leftover_files(temp.path()).is_empty(),
        "teardown deletes unresolved staged files"
    );
}
