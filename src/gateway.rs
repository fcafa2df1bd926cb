//! Listener lifecycle: port selection, the accept loop, and the observable
//! running state that front ends watch.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::log_sink::LogSink;
use crate::server::{ServerState, handle_connection};
use crate::store::ModelConfig;
use crate::upstream::ConnectionTest;

/// Ports tried, in order, after the preferred one.
pub const FALLBACK_PORTS: [u16; 5] = [3001, 3002, 3003, 8080, 8081];

/// Pause after a failed accept so a persistent error does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Snapshot of the listener published on every start/stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayStatus {
    pub running: bool,
    /// Port actually bound, which may be a fallback
    pub port: Option<u16>,
}

struct ListenerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the listener and exposes start/stop plus connection tests.
pub struct Gateway {
    state: Arc<ServerState>,
    host: String,
    status: watch::Sender<GatewayStatus>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Gateway {
    pub fn new(state: Arc<ServerState>, host: impl Into<String>) -> Self {
        let (status, _) = watch::channel(GatewayStatus::default());
        Self {
            state,
            host: host.into(),
            status,
            listener: Mutex::new(None),
        }
    }

    /// Bind the first free candidate port and begin accepting.
    ///
    /// Calling this while already running returns the active port untouched.
    pub async fn start(&self, preferred_port: u16) -> Result<u16> {
        let mut listener = self.listener.lock().await;
        if listener.is_some()
            && let Some(port) = self.status.borrow().port
        {
            debug!(port, "Gateway already running");
            return Ok(port);
        }

        let candidates = candidate_ports(preferred_port);
        let (tcp, port) = bind_first(&self.host, &candidates, &self.state.log).await?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(tcp, self.state.clone(), shutdown_rx));
        *listener = Some(ListenerHandle { shutdown, task });

        self.status.send_replace(GatewayStatus {
            running: true,
            port: Some(port),
        });
        self.persist_running(true);

        if port != preferred_port && preferred_port != 0 {
            info!(preferred = preferred_port, port, "Using fallback port");
        }
        info!(host = %self.host, port, "Gateway listening");
        Ok(port)
    }

    /// Stop accepting. Connections already accepted run to completion.
    pub async fn stop(&self) {
        let Some(handle) = self.listener.lock().await.take() else {
            return;
        };

        let _ = handle.shutdown.send(());
        if let Err(e) = handle.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        self.status.send_replace(GatewayStatus::default());
        self.persist_running(false);
        self.state.log.push("Server stopped");
    }

    /// Send a minimal completion to `model` and report how it went.
    ///
    /// Writes one log line and no request log row.
    pub async fn test_connection(&self, model: &ModelConfig) -> Result<ConnectionTest> {
        match self.state.upstream.test_connection(model).await {
            Ok(test) => {
                self.state.log.push(format!(
                    "Connection test for {} succeeded: HTTP {} in {} ms",
                    model.model_id,
                    test.status.as_u16(),
                    test.duration.as_millis()
                ));
                Ok(test)
            }
            Err(failure) => {
                self.state.log.push(format!(
                    "Connection test for {} failed ({}): {}",
                    model.model_id,
                    failure.kind(),
                    failure
                ));
                Err(Error::Upstream(failure))
            }
        }
    }

    pub fn status(&self) -> GatewayStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.status.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.status.borrow().running
    }

    pub fn port(&self) -> Option<u16> {
        self.status.borrow().port
    }

    pub fn logs(&self) -> &LogSink {
        &self.state.log
    }

    fn persist_running(&self, running: bool) {
        let result = self.state.store.server_settings().and_then(|mut settings| {
            settings.is_running = running;
            self.state.store.save_server_settings(&settings)
        });
        if let Err(e) = result {
            warn!(error = %e, running, "Failed to persist running state");
        }
    }
}

/// The preferred port followed by the fallbacks, without repeats.
pub fn candidate_ports(preferred: u16) -> Vec<u16> {
    let mut ports = vec![preferred];
    ports.extend(FALLBACK_PORTS.iter().copied().filter(|p| *p != preferred));
    ports
}

/// Bind the first candidate that succeeds, logging every attempt.
///
/// Port 0 asks the OS for a port; the assigned one is returned.
pub async fn bind_first(
    host: &str,
    candidates: &[u16],
    log: &LogSink,
) -> Result<(TcpListener, u16)> {
    let mut last_error = None;

    for &port in candidates {
        log.push(format!("Trying {host}:{port}"));
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                log.push(format!("Listening on {host}:{bound}"));
                return Ok((listener, bound));
            }
            Err(e) => {
                log.push(format!("Port {port} unavailable: {e}"));
                last_error = Some((port, e));
            }
        }
    }

    let (port, source) = last_error.unwrap_or_else(|| {
        (
            0,
            io::Error::new(io::ErrorKind::InvalidInput, "no candidate ports"),
        )
    });
    log.push(format!("Could not bind any port, last error: {source}"));
    Err(Error::Bind { port, source })
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Accept loop shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, remote_addr)) => {
                    tokio::spawn(handle_connection(stream, remote_addr, state.clone()));
                }
                Err(e) => {
                    state.log.push(format!("Accept failed: {e}"));
                    if e.kind() == io::ErrorKind::PermissionDenied {
                        state.log.push(
                            "Hint: incoming connections were refused by the OS; allow modelgate in your firewall or sandbox settings",
                        );
                    }
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonStore, ModelStore};
    use crate::upstream::mock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_gateway(store: Arc<JsonStore>) -> Gateway {
        let state = Arc::new(ServerState::new(store, LogSink::new(), 8));
        Gateway::new(state, "127.0.0.1")
    }

    async fn get(port: u16, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    #[test]
    fn test_candidate_ports_order() {
        assert_eq!(candidate_ports(3000), vec![3000, 3001, 3002, 3003, 8080, 8081]);
    }

    #[test]
    fn test_candidate_ports_skip_duplicate() {
        assert_eq!(candidate_ports(8080), vec![8080, 3001, 3002, 3003, 8081]);
        assert_eq!(candidate_ports(0)[0], 0);
    }

    #[tokio::test]
    async fn test_bind_first_falls_through() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = occupied.local_addr().unwrap().port();
        let free = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap().port()
        };

        let log = LogSink::new();
        let (_listener, port) = bind_first("127.0.0.1", &[taken, free], &log)
            .await
            .unwrap();

        assert_eq!(port, free);
        assert_eq!(log.filtered("Trying").len(), 2);
        assert_eq!(log.filtered(&format!("Port {taken} unavailable")).len(), 1);
        assert_eq!(log.filtered("Listening on").len(), 1);
    }

    #[tokio::test]
    async fn test_bind_first_reports_last_error() {
        let a = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let b = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let (pa, pb) = (
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port(),
        );

        let log = LogSink::new();
        let err = bind_first("127.0.0.1", &[pa, pb], &log).await.unwrap_err();
        assert!(matches!(err, Error::Bind { port, .. } if port == pb));
        assert_eq!(log.filtered("Could not bind").len(), 1);
    }

    #[tokio::test]
    async fn test_start_on_port_zero_records_assigned_port() {
        let store = Arc::new(JsonStore::in_memory());
        let gateway = test_gateway(store.clone());

        let port = gateway.start(0).await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(gateway.port(), Some(port));
        assert!(gateway.is_running());
        assert!(store.server_settings().unwrap().is_running);

        let response = get(port, "/health").await;
        assert!(response.contains(r#""status":"ok""#), "{response}");

        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let gateway = test_gateway(Arc::new(JsonStore::in_memory()));
        let first = gateway.start(0).await.unwrap();
        let second = gateway.start(0).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.logs().filtered("Listening on").len(), 1);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_occupied_preferred_port_uses_first_free_fallback() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let preferred = occupied.local_addr().unwrap().port();

        let expected = candidate_ports(preferred)[1..]
            .iter()
            .copied()
            .find(|&p| std::net::TcpListener::bind(("127.0.0.1", p)).is_ok())
            .expect("every fallback port is taken on this machine");

        let gateway = test_gateway(Arc::new(JsonStore::in_memory()));
        let port = gateway.start(preferred).await.unwrap();

        assert_eq!(port, expected);
        assert_eq!(gateway.port(), Some(expected));
        assert_eq!(
            gateway
                .logs()
                .filtered(&format!("Port {preferred} unavailable"))
                .len(),
            1
        );
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_stop_releases_port_and_publishes_status() {
        let store = Arc::new(JsonStore::in_memory());
        let gateway = test_gateway(store.clone());
        let mut status = gateway.subscribe_status();

        let port = gateway.start(0).await.unwrap();
        status.changed().await.unwrap();
        assert_eq!(
            *status.borrow_and_update(),
            GatewayStatus {
                running: true,
                port: Some(port)
            }
        );

        gateway.stop().await;
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), GatewayStatus::default());
        assert!(!store.server_settings().unwrap().is_running);
        assert_eq!(gateway.logs().filtered("Server stopped").len(), 1);

        assert!(
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .is_err()
        );

        // Stopping twice is harmless
        gateway.stop().await;
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_request_finish() {
        let upstream = mock::spawn(200, r#"{"done":true}"#, Duration::from_millis(500)).await;
        let store = Arc::new(JsonStore::in_memory());
        store
            .upsert_model(ModelConfig::new("slow", "openai", upstream.base_url(), "k"))
            .unwrap();
        let gateway = test_gateway(store.clone());
        let port = gateway.start(0).await.unwrap();

        let in_flight = tokio::spawn(async move {
            let body = r#"{"model":"slow","messages":[]}"#;
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            stream
                .write_all(
                    format!("POST /v1/chat/completions HTTP/1.1\r\n\r\n{body}").as_bytes(),
                )
                .await
                .unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        gateway.stop().await;

        let response = in_flight.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with(r#"{"done":true}"#));
        assert_eq!(store.recent_logs(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_test_success() {
        let upstream = mock::spawn(200, r#"{"choices":[]}"#, Duration::ZERO).await;
        let store = Arc::new(JsonStore::in_memory());
        let gateway = test_gateway(store.clone());
        let model = ModelConfig::new("gpt-4o", "openai", upstream.base_url(), "sk");

        let test = gateway.test_connection(&model).await.unwrap();
        assert_eq!(test.status.as_u16(), 200);
        assert_eq!(gateway.logs().len(), 1);
        assert!(store.recent_logs(10).unwrap().is_empty());

        let received = upstream.received.lock().clone();
        let sent: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(sent["max_tokens"], 5);
        assert_eq!(sent["messages"][0]["content"], "Hello");
    }

    #[tokio::test]
    async fn test_connection_test_failure_status() {
        let upstream = mock::spawn(401, r#"{"error":"bad key"}"#, Duration::ZERO).await;
        let gateway = test_gateway(Arc::new(JsonStore::in_memory()));
        let model = ModelConfig::new("gpt-4o", "openai", upstream.base_url(), "wrong");

        let err = gateway.test_connection(&model).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 401"), "{err}");
        assert_eq!(gateway.logs().filtered("failed").len(), 1);
    }
}
