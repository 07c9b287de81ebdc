#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use devmetrics_common::codec::{self, RsaEncryptor};
use devmetrics_common::sign::Signer;
use devmetrics_common::types::MetricRecord;
use devmetrics_server::app;
use devmetrics_server::config::ServerConfig;
use devmetrics_server::grpc::MetricCollectorImpl;
use devmetrics_server::lifecycle;
use devmetrics_server::service::MetricsService;
use devmetrics_server::state::AppState;
use rsa::RsaPrivateKey;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tonic::metadata::{Ascii, MetadataValue};
use tower::util::ServiceExt;

pub const SECRET: &str = "test-secret";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: ServerConfig,
    pub service: Arc<MetricsService>,
    pub app: axum::Router,
    pub grpc: MetricCollectorImpl,
}

pub fn base_config(temp_dir: &TempDir) -> ServerConfig {
    ServerConfig {
        store_file: Some(temp_dir.path().join("metrics.json").display().to_string()),
        store_interval: Duration::from_secs(300),
        ..Default::default()
    }
}

pub fn build_test_context() -> Result<TestContext> {
    build_test_context_with(|_| {})
}

pub fn build_test_context_with(customize: impl FnOnce(&mut ServerConfig)) -> Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;
    let mut config = base_config(&temp_dir);
    customize(&mut config);
    let service = Arc::new(lifecycle::build_service(&config)?);
    let app = app::build_http_app(AppState::new(service.clone()));
    let grpc = MetricCollectorImpl::new(service.clone());
    Ok(TestContext {
        temp_dir,
        config,
        service,
        app,
        grpc,
    })
}

/// A 1024-bit key shared by every test in the binary.
pub fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation"))
}

/// Writes the shared private key to `dir` and returns its path.
pub fn write_private_key(dir: &TempDir) -> std::path::PathBuf {
    use rsa::pkcs1::EncodeRsaPrivateKey;
    let path = dir.path().join("private.pem");
    let pem = test_key()
        .to_pkcs1_pem(rsa::pkcs8::LineEnding::LF)
        .expect("pem encoding");
    std::fs::write(&path, pem.as_bytes()).expect("write key");
    path
}

pub fn encryptor() -> RsaEncryptor {
    RsaEncryptor::new(test_key().to_public_key())
}

pub fn signer() -> Signer {
    Signer::new(Some(SECRET))
}

pub struct RawResponse {
    pub status: StatusCode,
    pub headers: axum::http::HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> RawResponse {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read")
        .to_vec();
    RawResponse {
        status,
        headers,
        body,
    }
}

pub async fn request_no_body(app: &axum::Router, method: &str, uri: &str) -> RawResponse {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    send(app, req).await
}

/// POSTs `body` with the given extra headers.
pub async fn post_bytes(
    app: &axum::Router,
    uri: &str,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> RawResponse {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(Body::from(body))
        .expect("request should build");
    send(app, req).await
}

/// POSTs records the way the agent does: gzipped, optionally encrypted.
pub async fn post_envelope(
    app: &axum::Router,
    uri: &str,
    records: &[MetricRecord],
    encryptor: Option<&RsaEncryptor>,
) -> RawResponse {
    let env = codec::encode_batch(records, encryptor).expect("encode");
    let pairs = env.headers.pairs();
    let headers: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    post_bytes(app, uri, &headers, env.body).await
}

pub fn grpc_request<T>(message: T, metadata: &[(&'static str, &str)]) -> tonic::Request<T> {
    let mut req = tonic::Request::new(message);
    for (name, value) in metadata {
        let value: MetadataValue<Ascii> = value.parse().expect("metadata value");
        req.metadata_mut().insert(*name, value);
    }
    req
}
