use hyper::StatusCode;
use hyper::body::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::config::get_config;
use crate::error::Error;
use crate::format::{ChatCompletionRequest, ModelsResponse, error_body};
use crate::http::{HttpRequest, HttpResponse, parse_request};
use crate::log_sink::LogSink;
use crate::models::resolve_model;
use crate::store::{ModelStore, RequestLogEntry, ServerSettings};
use crate::upstream::UpstreamClient;

/// Upper bound for the single receive issued per connection.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Shared server state passed to all connection tasks.
///
/// Contains:
/// - `store`: model configurations, settings, and the request log
/// - `upstream`: HTTP client for provider APIs
/// - `log`: bounded operator-facing event log
/// - `connection_slots`: caps how many connections are served at once
pub struct ServerState {
    pub store: Arc<dyn ModelStore>,
    pub upstream: UpstreamClient,
    pub log: LogSink,
    pub connection_slots: Arc<Semaphore>,
}

impl ServerState {
    pub fn new(store: Arc<dyn ModelStore>, log: LogSink, max_connections: usize) -> Self {
        Self {
            store,
            upstream: UpstreamClient::new(),
            log,
            connection_slots: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }
}

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Receiving,
    Processing,
    Responding,
    Failed,
    Closed,
}

struct Connection {
    state: ConnectionState,
    remote: SocketAddr,
}

impl Connection {
    fn new(remote: SocketAddr) -> Self {
        Self {
            state: ConnectionState::Connecting,
            remote,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(remote = %self.remote, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
    }
}

/// Serve one connection: a single bounded receive, one response, close.
pub async fn handle_connection(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
) {
    let mut conn = Connection::new(remote_addr);

    let Ok(_slot) = state.connection_slots.clone().acquire_owned().await else {
        conn.transition(ConnectionState::Failed);
        conn.transition(ConnectionState::Closed);
        return;
    };
    conn.transition(ConnectionState::Ready);

    let mut buf = vec![0u8; MAX_REQUEST_BYTES];
    let received = match stream.read(&mut buf).await {
        Ok(0) => {
            debug!(remote = %remote_addr, "Peer closed before sending a request");
            conn.transition(ConnectionState::Closed);
            return;
        }
        Ok(n) => n,
        Err(e) => {
            state
                .log
                .push(format!("Connection from {remote_addr} failed: {e}"));
            conn.transition(ConnectionState::Failed);
            conn.transition(ConnectionState::Closed);
            return;
        }
    };
    conn.transition(ConnectionState::Receiving);

    let response = match parse_request(&buf[..received]) {
        Ok(request) => {
            conn.transition(ConnectionState::Processing);
            route(&request, &state).await
        }
        Err(e) => {
            state.log.push(format!("Rejected request from {remote_addr}: {e}"));
            error_to_response(&e)
        }
    };

    conn.transition(ConnectionState::Responding);
    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        warn!(remote = %remote_addr, error = %e, "Failed to send response");
    }
    let _ = stream.shutdown().await;
    conn.transition(ConnectionState::Closed);
}

/// Dispatch by path. Every error is logged here before its response is built.
pub async fn route(request: &HttpRequest, state: &ServerState) -> HttpResponse {
    let start = Instant::now();

    let result = match request.path.as_str() {
        "/health" => Ok(handle_health()),
        "/v1/models" => handle_models(state),
        "/v1/chat/completions" | "/api/v1/chat/completions" | "/v1/messages" => {
            handle_chat_completions(request, state).await
        }
        _ => {
            state.log.push(format!(
                "No route for {} {}",
                request.method, request.path
            ));
            Ok(not_found(&request.path))
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            state
                .log
                .push(format!("{} {} failed: {}", request.method, request.path, e));
            error_to_response(&e)
        }
    };

    debug!(
        method = %request.method,
        path = %request.path,
        status = response.status.as_u16(),
        duration_ms = start.elapsed().as_millis(),
        "Request completed"
    );

    response
}

fn handle_health() -> HttpResponse {
    let body = serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    });
    HttpResponse::json(StatusCode::OK, body.to_string())
}

fn handle_models(state: &ServerState) -> Result<HttpResponse, Error> {
    let models = state.store.enabled_models()?;
    let body = serde_json::to_vec(&ModelsResponse::from_models(&models)).map_err(Error::Json)?;
    Ok(HttpResponse::json(StatusCode::OK, body))
}

async fn handle_chat_completions(
    request: &HttpRequest,
    state: &ServerState,
) -> Result<HttpResponse, Error> {
    let chat_request: ChatCompletionRequest =
        serde_json::from_str(&request.body).map_err(Error::BodyDecode)?;

    let model = resolve_model(state.store.as_ref(), &chat_request.model)?;

    let outbound = chat_request.sanitize();
    let body = serde_json::to_vec(&outbound).map_err(Error::Json)?;
    log_if_enabled(&model.model_id, &outbound);

    let timeout = request_timeout(state);
    let mut entry = RequestLogEntry::new(&model.model_id, &request.method, &request.path);

    let start = Instant::now();
    let result = state
        .upstream
        .send_chat(&model, Bytes::from(body), timeout)
        .await;
    let elapsed = start.elapsed();
    entry.duration_ms = Some(elapsed.as_millis() as u64);

    let outcome = match result {
        Ok(response) => {
            entry.status_code = Some(response.status.as_u16());
            state.log.push(format!(
                "{} -> {} ({} ms)",
                model.model_id,
                response.status.as_u16(),
                elapsed.as_millis()
            ));
            info!(
                model = %model.model_id,
                provider = %model.provider,
                status = response.status.as_u16(),
                duration_ms = elapsed.as_millis(),
                "Model used"
            );
            Ok(HttpResponse::json(response.status, response.body))
        }
        Err(failure) => {
            entry.error_message = Some(format!("{}: {}", failure.kind(), failure));
            // The sink line for this failure is written by route()
            warn!(
                model = %model.model_id,
                provider = %model.provider,
                kind = failure.kind(),
                duration_ms = elapsed.as_millis(),
                "Upstream request failed"
            );
            Err(Error::Upstream(failure))
        }
    };

    // A forward that outlives stop() still records its row. The append is
    // file I/O, so it runs on the blocking pool.
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.append_log(entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, model = %model.model_id, "Failed to append request log"),
        Err(e) => warn!(error = %e, model = %model.model_id, "Request log task failed"),
    }

    outcome
}

fn request_timeout(state: &ServerState) -> Duration {
    let secs = match state.store.server_settings() {
        Ok(settings) => settings.request_timeout_secs,
        Err(e) => {
            warn!(error = %e, "Failed to read server settings, using default timeout");
            ServerSettings::default().request_timeout_secs
        }
    };
    Duration::from_secs(secs.max(1))
}

fn not_found(path: &str) -> HttpResponse {
    HttpResponse::json(
        StatusCode::NOT_FOUND,
        error_body(
            &format!("No route for path {path}"),
            "not_found",
            Some(("path", path)),
        ),
    )
}

/// Log the sanitized outbound body if request logging is enabled.
fn log_if_enabled(model_id: &str, request: &ChatCompletionRequest) {
    if get_config().logging.log_requests
        && let Ok(json) = serde_json::to_string_pretty(request)
    {
        info!(model = %model_id, "Outbound request:\n{}", json);
    }
}

fn error_to_response(error: &Error) -> HttpResponse {
    let (status, error_type, detail) = match error {
        Error::Decode(_) | Error::BodyDecode(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request_error", None)
        }
        Error::ModelNotFound(id) => (
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            Some(("model", id.as_str())),
        ),
        Error::Upstream(failure) => (
            StatusCode::BAD_GATEWAY,
            "upstream_error",
            Some(("code", failure.kind())),
        ),
        Error::Store(_) | Error::Json(_) | Error::Io(_) | Error::Bind { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "api_error", None)
        }
    };

    let message = match error.suggestion() {
        Some(suggestion) => format!("{}. {}", error, suggestion),
        None => error.to_string(),
    };

    HttpResponse::json(status, error_body(&message, error_type, detail))
}
