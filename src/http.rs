//! The narrow slice of HTTP/1.1 the gateway speaks: one request chunk in,
//! one complete response out, then the connection closes.

use hyper::StatusCode;
use hyper::body::Bytes;

use crate::error::Error;

/// A request as read from a single receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target with any query string removed
    pub path: String,
    pub body: String,
}

/// Parse one received chunk. Headers are skipped; the body is everything
/// after the first empty line.
pub fn parse_request(raw: &[u8]) -> Result<HttpRequest, Error> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::Decode(format!("request is not valid UTF-8: {e}")))?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut tokens = request_line.split_whitespace();
    let (Some(method), Some(target)) = (tokens.next(), tokens.next()) else {
        return Err(Error::Decode(format!(
            "invalid request line: {:?}",
            truncate(request_line, 80)
        )));
    };

    let path = target.split_once('?').map_or(target, |(path, _)| path);

    let body = lines
        .skip_while(|line| !line.is_empty())
        .skip(1)
        .collect::<Vec<_>>()
        .join("\r\n");

    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        body,
    })
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// A complete JSON response, serialized in one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Status line, fixed headers, blank line, body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        let head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: application/json\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             Access-Control-Allow-Origin: *\r\n\
             \r\n",
            self.status.as_u16(),
            reason,
            self.body.len()
        );

        let mut out = Vec::with_capacity(head.len() + self.body.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_post_with_body() {
        let raw = b"POST /v1/chat/completions HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\r\n{\"model\":\"x\"}";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/v1/chat/completions");
        assert_eq!(req.body, r#"{"model":"x"}"#);
    }

    #[test]
    fn test_query_string_is_stripped() {
        let req = parse_request(b"GET /v1/models?limit=5&x=y HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, "/v1/models");
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_body_keeps_crlf_lines_after_first_blank() {
        let raw = b"POST /v1/messages HTTP/1.1\r\nHost: a\r\n\r\nline one\r\n\r\nline three";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.body, "line one\r\n\r\nline three");
    }

    #[test]
    fn test_no_blank_line_means_empty_body() {
        let req = parse_request(b"GET /health HTTP/1.1\r\nHost: a").unwrap();
        assert_eq!(req.path, "/health");
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_decode_error() {
        let err = parse_request(b"GET /\xff\xfe HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_missing_path_is_decode_error() {
        assert!(matches!(parse_request(b"GET\r\n\r\n"), Err(Error::Decode(_))));
        assert!(matches!(parse_request(b""), Err(Error::Decode(_))));
    }

    #[test]
    fn test_response_headers_and_length() {
        let resp = HttpResponse::json(StatusCode::OK, r#"{"status":"ok"}"#);
        let text = String::from_utf8(resp.to_bytes()).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 15\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"status\":\"ok\"}"));
    }

    #[test]
    fn test_content_length_counts_bytes_not_chars() {
        let resp = HttpResponse::json(StatusCode::OK, "\"héllo\"");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 8\r\n"));
    }

    #[test]
    fn test_uncommon_status_has_reason_fallback() {
        let status = StatusCode::from_u16(599).unwrap();
        let resp = HttpResponse::json(status, "{}");
        let text = String::from_utf8(resp.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 599 Unknown\r\n"));
    }
}
