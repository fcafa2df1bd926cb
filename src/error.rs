use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed request: {0}")]
    Decode(String),

    #[error("invalid chat completion body: {0}")]
    BodyDecode(#[source] serde_json::Error),

    #[error("model \"{0}\" is not configured or not enabled")]
    ModelNotFound(String),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] UpstreamFailure),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("json error: {0}")]
    Json(#[source] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns a user-friendly suggestion for how to resolve this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::Bind { .. } => {
                Some("Stop the process holding the port or start with a different --port")
            }
            Error::ModelNotFound(_) => Some("Add the model with 'modelgate models add' or enable it"),
            Error::Upstream(UpstreamFailure::TimedOut(_)) => {
                Some("Increase request_timeout_secs or check the provider status")
            }
            Error::Upstream(UpstreamFailure::NotConnected(_)) => {
                Some("Check your internet connection and the model's API URL")
            }
            Error::Upstream(UpstreamFailure::CertificateUntrusted(_)) => {
                Some("The provider's TLS certificate is not trusted; verify the API URL")
            }
            _ => None,
        }
    }
}

/// Transport-level failure talking to a provider. A completed exchange with a
/// non-2xx status is not a failure and never maps to this type.
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    #[error("request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("could not connect to provider: {0}")]
    NotConnected(String),

    #[error("provider certificate is not trusted: {0}")]
    CertificateUntrusted(String),

    #[error("{0}")]
    Other(String),
}

impl UpstreamFailure {
    /// Short classification label recorded with the error.
    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamFailure::TimedOut(_) => "timed-out",
            UpstreamFailure::NotConnected(_) => "not-connected",
            UpstreamFailure::CertificateUntrusted(_) => "certificate-untrusted",
            UpstreamFailure::Other(_) => "upstream-error",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access store {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize store: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_not_found_echoes_id() {
        let err = Error::ModelNotFound("gpt-x".to_string());
        assert!(err.to_string().contains("\"gpt-x\""));
        assert!(err.suggestion().unwrap().contains("models add"));
    }

    #[test]
    fn test_upstream_kinds() {
        assert_eq!(
            UpstreamFailure::TimedOut(Duration::from_secs(1)).kind(),
            "timed-out"
        );
        assert_eq!(
            UpstreamFailure::NotConnected("refused".into()).kind(),
            "not-connected"
        );
        assert_eq!(
            UpstreamFailure::CertificateUntrusted("bad cert".into()).kind(),
            "certificate-untrusted"
        );
        assert_eq!(UpstreamFailure::Other("boom".into()).kind(), "upstream-error");
    }

    #[test]
    fn test_error_suggestion_timeout() {
        let err = Error::Upstream(UpstreamFailure::TimedOut(Duration::from_secs(30)));
        assert!(err.suggestion().unwrap().contains("request_timeout_secs"));
    }

    #[test]
    fn test_error_no_suggestion() {
        let err = Error::Decode("empty request line".to_string());
        assert!(err.suggestion().is_none());
    }

    #[test]
    fn test_bind_error_display() {
        let err = Error::Bind {
            port: 8081,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        let display = format!("{}", err);
        assert!(display.contains("8081"));
    }

    #[test]
    fn test_upstream_other_display_is_verbatim() {
        let err = UpstreamFailure::Other("connection reset".to_string());
        assert_eq!(err.to_string(), "connection reset");
    }
}
