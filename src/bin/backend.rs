#![forbid(unsafe_code)]

//! Axum backend exposing the token-gated video download API.
//!
//! Admin endpoints mint and list quota-limited credentials; the download
//! endpoint validates a credential, drives one headless browser session to
//! pull the video, streams the artifact back, and only charges quota once the
//! final byte has been handed off.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use clipgate::browser::{self, AutomationConfig, AutomationError};
use clipgate::config::{self, RuntimeConfig, RuntimeOverrides};
use clipgate::security::{ensure_not_root, secrets_match};
use clipgate::store::{SqliteTokenStore, TokenRecord, TokenStore};
use clipgate::tokens::{CredentialError, TokenSigner};
use futures::Stream;
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::{fs::File, signal};
use tokio_util::bytes::Bytes;
use tokio_util::io::ReaderStream;

const API_TOKEN_HEADER: &str = "x-api-token";

// Each automation session downloads into its own subdirectory under the
// downloads root, so concurrent sessions never race on the newest-file scan.
const SESSION_DIR_PREFIX: &str = "session-";

#[derive(Debug, Clone)]
struct BackendArgs {
    data_root: Option<PathBuf>,
    port: Option<u16>,
    host: Option<String>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root: Option<PathBuf> = None;
        let mut port: Option<u16> = None;
        let mut host: Option<String> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host = Some(value.to_string());
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--data-root requires a value"))?;
                    data_root = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host = Some(value);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self {
            data_root,
            port,
            host,
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/CLIPGATE_HOST")
}

/// Seam between the HTTP layer and the browser automation so handler tests
/// can swap in a stub instead of a real Chrome process.
#[async_trait]
trait VideoFetcher: Send + Sync {
    async fn fetch(&self, url: &str, workdir: &Path) -> Result<PathBuf, AutomationError>;
}

struct BrowserFetcher {
    config: AutomationConfig,
}

#[async_trait]
impl VideoFetcher for BrowserFetcher {
    async fn fetch(&self, url: &str, workdir: &Path) -> Result<PathBuf, AutomationError> {
        browser::fetch_video(&self.config, url, workdir).await
    }
}

struct AdminCredentials {
    email: String,
    password: String,
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn TokenStore>,
    signer: Arc<TokenSigner>,
    fetcher: Arc<dyn VideoFetcher>,
    admin: Arc<AdminCredentials>,
    downloads_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    fn quota_exhausted() -> Self {
        Self::new(StatusCode::PAYMENT_REQUIRED, "Request limit exceeded")
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    fn store_failure(err: anyhow::Error) -> Self {
        Self::internal(format!("token store failure: {err}"))
    }

    /// Automation failures all collapse into one 500 shape; the stage detail
    /// only travels in `details`.
    fn automation(err: &AutomationError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Failed to download video".into(),
            details: Some(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = serde_json::Value::String(details);
        }
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTokenRequest {
    email: Option<String>,
    password: Option<String>,
    allowed_requests: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
    allowed_requests: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminAuthRequest {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListTokensResponse {
    tokens: Vec<TokenRecord>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateTokenResponse {
    email: String,
    remaining_requests: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    service: &'static str,
    version: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let runtime = config::resolve_runtime_config(RuntimeOverrides {
        data_root: args.data_root,
        port: args.port,
        host: args.host,
        env_path: None,
    })?;

    let host = parse_host_arg(&runtime.host)?;
    let store = SqliteTokenStore::open(&runtime.tokens_db_path())
        .await
        .context("initializing token store")?;
    let signer =
        TokenSigner::load_or_create(&runtime.signing_key_path).context("loading signing key")?;

    let downloads_root = runtime.downloads_root();
    std::fs::create_dir_all(&downloads_root)
        .with_context(|| format!("creating {}", downloads_root.display()))?;

    let state = AppState {
        store: Arc::new(store),
        signer: Arc::new(signer),
        fetcher: Arc::new(BrowserFetcher {
            config: automation_config(&runtime),
        }),
        admin: Arc::new(AdminCredentials {
            email: runtime.admin_email.clone(),
            password: runtime.admin_password.clone(),
        }),
        downloads_root: Arc::new(downloads_root),
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/generate-token", post(generate_token))
        .route("/admin/tokens", post(list_tokens))
        .route("/validate-token", get(validate_token))
        .route("/download", post(download))
        .with_state(state);

    let addr = SocketAddr::new(host, runtime.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("clipgate API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // A failed handler install only costs us graceful shutdown; the process
    // still terminates when the signal arrives.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

fn automation_config(runtime: &RuntimeConfig) -> AutomationConfig {
    AutomationConfig {
        chrome_bin: runtime.chrome_bin.clone(),
        poll_interval: Duration::from_millis(runtime.poll_interval_ms),
        poll_attempts: runtime.poll_attempts,
        ..AutomationConfig::default()
    }
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "clipgate",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn required_field(value: Option<String>, name: &str) -> ApiResult<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("{name} is required")))
}

fn check_admin(state: &AppState, email: &str, password: &str) -> ApiResult<()> {
    let email_ok = secrets_match(email, &state.admin.email);
    let password_ok = secrets_match(password, &state.admin.password);
    if email_ok && password_ok {
        Ok(())
    } else {
        Err(ApiError::unauthorized("Invalid admin credentials"))
    }
}

async fn generate_token(
    State(state): State<AppState>,
    Json(payload): Json<GenerateTokenRequest>,
) -> ApiResult<Json<GenerateTokenResponse>> {
    let email = required_field(payload.email, "email")?;
    let password = required_field(payload.password, "password")?;
    let allowed_requests = payload
        .allowed_requests
        .ok_or_else(|| ApiError::bad_request("allowedRequests is required"))?;
    if allowed_requests <= 0 {
        return Err(ApiError::bad_request("allowedRequests must be positive"));
    }

    check_admin(&state, &email, &password)?;

    let (token, claims) = state
        .signer
        .issue(&email)
        .map_err(|err| ApiError::internal(format!("minting credential: {err}")))?;

    let record = TokenRecord {
        credential: token.clone(),
        owner: claims.owner,
        remaining: allowed_requests,
        issued_at: claims.issued_at,
        expires_at: claims.expires_at,
    };
    state
        .store
        .save(&record)
        .await
        .map_err(ApiError::store_failure)?;

    Ok(Json(GenerateTokenResponse {
        token,
        expires_at: record.expires_at,
        allowed_requests,
    }))
}

async fn list_tokens(
    State(state): State<AppState>,
    Json(payload): Json<AdminAuthRequest>,
) -> ApiResult<Json<ListTokensResponse>> {
    let email = required_field(payload.email, "email")?;
    let password = required_field(payload.password, "password")?;
    check_admin(&state, &email, &password)?;

    let tokens = state.store.list().await.map_err(ApiError::store_failure)?;
    Ok(Json(ListTokensResponse { tokens }))
}

/// Two-layer credential check: the signature proves we minted the token and
/// it is inside its signed validity window; the store lookup covers
/// revocation and quota independently of the signature.
async fn authorize_credential(state: &AppState, headers: &HeaderMap) -> ApiResult<TokenRecord> {
    let credential = headers
        .get(API_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::unauthorized("API token is required"))?;

    state.signer.verify(credential).map_err(|err| match err {
        CredentialError::Expired(_) => ApiError::unauthorized("API token has expired"),
        CredentialError::Malformed | CredentialError::BadSignature => {
            ApiError::unauthorized("Invalid API token")
        }
    })?;

    state
        .store
        .fetch(credential)
        .await
        .map_err(ApiError::store_failure)?
        .filter(|record| !record.is_expired(Utc::now()))
        .ok_or_else(|| ApiError::forbidden("API token has been revoked"))
}

async fn validate_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<ValidateTokenResponse>> {
    let record = authorize_credential(&state, &headers).await?;
    Ok(Json(ValidateTokenResponse {
        email: record.owner,
        remaining_requests: record.remaining,
        expires_at: record.expires_at,
    }))
}

async fn download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<DownloadRequest>,
) -> ApiResult<Response> {
    let url = payload
        .url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("url is required"))?;

    let record = authorize_credential(&state, &headers).await?;
    if record.remaining <= 0 {
        return Err(ApiError::quota_exhausted());
    }

    let workdir = tempfile::Builder::new()
        .prefix(SESSION_DIR_PREFIX)
        .tempdir_in(state.downloads_root.as_ref())
        .map_err(|err| ApiError::internal(format!("creating session directory: {err}")))?;

    let artifact = state
        .fetcher
        .fetch(&url, workdir.path())
        .await
        .map_err(|err| {
            eprintln!("Automation session failed for {url}: {err}");
            ApiError::automation(&err)
        })?;

    deliver(
        state.store.clone(),
        record.credential.clone(),
        workdir,
        &artifact,
    )
    .await
}

/// Streams the artifact back. Quota is charged only when the stream reaches a
/// clean end; the session directory (artifact included) is removed when the
/// stream is dropped, delivered or not.
async fn deliver(
    store: Arc<dyn TokenStore>,
    credential: String,
    workdir: TempDir,
    artifact: &Path,
) -> ApiResult<Response> {
    let file = File::open(artifact)
        .await
        .map_err(|err| ApiError::internal(format!("opening artifact: {err}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("reading artifact metadata: {err}")))?
        .len();

    let mime = MimeGuess::from_path(artifact).first_or_octet_stream();
    let filename = artifact
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("video")
        .replace('"', "_");

    let stream = DeliveryStream::new(ReaderStream::new(file), workdir, store, credential);
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    if let Ok(value) = mime.to_string().parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = size.to_string().parse() {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = format!("attachment; filename=\"{filename}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// Wrapper around the file stream that owns the session directory and fires
/// the quota decrement exactly once, on clean end-of-stream. An IO error or
/// an early drop (caller gone) leaves the quota untouched.
struct DeliveryStream {
    inner: ReaderStream<File>,
    _workdir: TempDir,
    store: Arc<dyn TokenStore>,
    credential: String,
    failed: bool,
    finished: bool,
}

impl DeliveryStream {
    fn new(
        inner: ReaderStream<File>,
        workdir: TempDir,
        store: Arc<dyn TokenStore>,
        credential: String,
    ) -> Self {
        Self {
            inner,
            _workdir: workdir,
            store,
            credential,
            failed: false,
            finished: false,
        }
    }
}

impl Stream for DeliveryStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    if !this.failed {
                        let store = this.store.clone();
                        let credential = this.credential.clone();
                        tokio::spawn(async move {
                            match store.decrement(&credential).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    eprintln!("Quota decrement found no remaining requests")
                                }
                                Err(err) => eprintln!("Failed to decrement quota: {err}"),
                            }
                        });
                    }
                }
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                this.failed = true;
                Poll::Ready(Some(Err(err)))
            }
            other => other,
        }
    }
}
