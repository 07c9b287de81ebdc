use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use devmetrics_common::codec::{CONTENT_ENCRYPTION, REAL_IP};
use rand::Rng;
use std::fmt::Write;
use std::time::Instant;

/// Trace id of the current request, stored in request extensions.
#[derive(Clone)]
pub struct TraceId(pub String);

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

/// Generate a 16-character hex trace ID (8 random bytes).
fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    let mut s = String::with_capacity(16);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Maximum number of characters to log from a request body.
const MAX_BODY_LOG_CHARS: usize = 200;

/// Largest request body the logger buffers. Bigger bodies, and bodies of
/// unknown length, are passed on untouched and without a snippet.
const MAX_BUFFERED_BODY: usize = 4 * 1024 * 1024;

fn truncate_body(bytes: &[u8], max: usize) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) if s.len() > max => {
            let mut end = max;
            while end > 0 && !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
        Ok(s) => s.to_string(),
        Err(_) => format!("<{} binary bytes>", bytes.len()),
    }
}

fn format_elapsed(elapsed_us: u128) -> String {
    if elapsed_us < 1000 {
        format!("{elapsed_us}µs")
    } else if elapsed_us < 1_000_000 {
        format!("{}ms", elapsed_us / 1000)
    } else {
        format!("{:.1}s", elapsed_us as f64 / 1_000_000.0)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

/// Bodies worth a snippet: plain text, neither gzipped nor encrypted.
fn is_loggable_body(headers: &HeaderMap) -> bool {
    headers.get(header::CONTENT_ENCODING).is_none() && headers.get(CONTENT_ENCRYPTION).is_none()
}

fn fits_buffer(body: &Body) -> bool {
    body.size_hint()
        .upper()
        .is_some_and(|len| len <= MAX_BUFFERED_BODY as u64)
}

/// Request/response logging middleware.
///
/// Logs `--> request` and `<-- response` lines sharing a trace id, which is
/// also returned to the client as `X-Trace-Id`.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let real_ip = header_str(req.headers(), REAL_IP).to_string();
    let encoding = header_str(req.headers(), header::CONTENT_ENCODING.as_str()).to_string();

    let buffer = method == "POST" && is_loggable_body(req.headers()) && fits_buffer(req.body());
    let (req, body_snippet) = if buffer {
        let (parts, body) = req.into_parts();
        match axum::body::to_bytes(body, MAX_BUFFERED_BODY).await {
            Ok(bytes) => {
                let snippet = truncate_body(&bytes, MAX_BODY_LOG_CHARS);
                (Request::from_parts(parts, Body::from(bytes)), snippet)
            }
            Err(e) => {
                tracing::warn!(trace_id = %trace_id, method = %method, path = %path, error = %e, "Failed to read request body");
                let mut response = (StatusCode::BAD_REQUEST, "bad request").into_response();
                if let Ok(val) = HeaderValue::from_str(&trace_id) {
                    response.headers_mut().insert("X-Trace-Id", val);
                }
                return response;
            }
        }
    } else {
        (req, String::new())
    };

    tracing::info!(
        trace_id = %trace_id,
        method = %method,
        path = %path,
        real_ip = %real_ip,
        encoding = %encoding,
        body = %body_snippet,
        "--> request"
    );

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = format_elapsed(start.elapsed().as_micros());
    let status = response.status();
    let status_code = status.as_u16();

    if status.is_server_error() {
        tracing::error!(trace_id = %trace_id, status = status_code, elapsed = %elapsed, "<-- response");
    } else if status.is_client_error() {
        tracing::warn!(trace_id = %trace_id, status = status_code, elapsed = %elapsed, "<-- response");
    } else {
        tracing::info!(trace_id = %trace_id, status = status_code, elapsed = %elapsed, "<-- response");
    }

    if let Ok(val) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("X-Trace-Id", val);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_shape() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body(b"short", 10), "short");
        assert_eq!(truncate_body("ééé".as_bytes(), 3), "é...");
        assert_eq!(truncate_body(&[0xff, 0xfe], 10), "<2 binary bytes>");
    }

    #[test]
    fn test_fits_buffer() {
        assert!(fits_buffer(&Body::from("[]")));
        assert!(!fits_buffer(&Body::from(vec![b' '; MAX_BUFFERED_BODY + 1])));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(999), "999µs");
        assert_eq!(format_elapsed(15_000), "15ms");
        assert_eq!(format_elapsed(2_500_000), "2.5s");
    }
}
