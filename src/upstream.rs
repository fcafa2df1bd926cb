//! Outbound calls to provider chat-completion APIs.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::UpstreamFailure;
use crate::store::ModelConfig;

/// Fixed timeout for operator-triggered connection tests.
pub const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A completed exchange, whatever its status.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Outcome of a successful connection test.
#[derive(Debug, Clone)]
pub struct ConnectionTest {
    pub status: StatusCode,
    pub duration: Duration,
}

/// HTTP(S) client for provider APIs. One attempt per call; no retries.
pub struct UpstreamClient {
    client: Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client }
    }

    /// `POST {api_url}/chat/completions` with the model's bearer key.
    pub async fn send_chat(
        &self,
        model: &ModelConfig,
        body: Bytes,
        timeout: Duration,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let url = chat_completions_url(&model.api_url);
        debug!(url = %url, model = %model.model_id, bytes = body.len(), "Sending upstream request");

        let request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", model.api_key))
            .body(Full::new(body))
            .map_err(|e| UpstreamFailure::Other(format!("invalid upstream URL {url}: {e}")))?;

        match tokio::time::timeout(timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamFailure::TimedOut(timeout)),
        }
    }

    /// Send a minimal completion to check that the model answers.
    pub async fn test_connection(
        &self,
        model: &ModelConfig,
    ) -> Result<ConnectionTest, UpstreamFailure> {
        let body = serde_json::json!({
            "model": model.model_id,
            "messages": [{"role": "user", "content": "Hello"}],
            "max_tokens": 5,
        });

        let start = Instant::now();
        let response = self
            .send_chat(
                model,
                Bytes::from(body.to_string()),
                CONNECTION_TEST_TIMEOUT,
            )
            .await?;
        let duration = start.elapsed();

        if !response.status.is_success() {
            let message = String::from_utf8_lossy(&response.body);
            return Err(UpstreamFailure::Other(format!(
                "HTTP {}: {}",
                response.status.as_u16(),
                message.trim()
            )));
        }

        Ok(ConnectionTest {
            status: response.status,
            duration,
        })
    }

    async fn exchange(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<UpstreamResponse, UpstreamFailure> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| UpstreamFailure::Other(format!("failed to read response body: {e}")))?
            .to_bytes();

        Ok(UpstreamResponse { status, body })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn chat_completions_url(api_url: &str) -> String {
    format!("{}/chat/completions", api_url.trim_end_matches('/'))
}

/// Map a client error onto the failure classes operators see.
fn classify(err: &hyper_util::client::legacy::Error) -> UpstreamFailure {
    let detail = error_chain(err);
    if certificate_rejected(err) {
        UpstreamFailure::CertificateUntrusted(detail)
    } else if err.is_connect() {
        UpstreamFailure::NotConnected(detail)
    } else {
        UpstreamFailure::Other(detail)
    }
}

/// `io::Error::source` skips the wrapped error, so look inside io errors explicitly.
fn certificate_rejected(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>()
            && matches!(tls, rustls::Error::InvalidCertificate(_))
        {
            return true;
        }
        if let Some(inner) = e
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.get_ref())
            && let Some(tls) = inner.downcast_ref::<rustls::Error>()
            && matches!(tls, rustls::Error::InvalidCertificate(_))
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// "outer: inner: root" rendering of an error and its sources.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        current = e.source();
    }
    parts.join(": ")
}
