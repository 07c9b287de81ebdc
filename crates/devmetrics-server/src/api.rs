use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use devmetrics_common::codec::{self, EnvelopeHeaders, GZIP};
use devmetrics_common::error::{ErrorKind, MetricError};

/// Listing header carrying every `name = value` pair, `;`-separated.
pub static METRICS_VAL_HEADER: HeaderName = HeaderName::from_static("metrics-val");

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const TEXT_HTML: &str = "text/html; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

/// HTTP status for each failure class.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::IpNotAllowed => StatusCode::FORBIDDEN,
        ErrorKind::InternalServer | ErrorKind::Decrypt | ErrorKind::Decompress => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Wraps a [`MetricError`] so handlers can return it with `?`.
///
/// The body only names the failure class; details go to the log.
#[derive(Debug)]
pub struct ApiError(pub MetricError);

impl From<MetricError> for ApiError {
    fn from(err: MetricError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], kind.as_str()).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn envelope_headers(headers: &HeaderMap) -> EnvelopeHeaders {
    EnvelopeHeaders::from_lookup(|name: &str| headers.get(name).and_then(|v| v.to_str().ok()))
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(GZIP))
}

/// Sends `body` gzipped when the client advertised gzip support.
fn negotiated(request: &HeaderMap, content_type: &'static str, body: Vec<u8>) -> ApiResult<Response> {
    if !accepts_gzip(request) {
        return Ok(([(header::CONTENT_TYPE, content_type)], body).into_response());
    }
    let packed = codec::compress(&body).map_err(|e| MetricError::Internal(e.to_string()))?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CONTENT_ENCODING, GZIP),
        ],
        packed,
    )
        .into_response())
}

fn render_listing(lines: &[String]) -> String {
    let mut html = String::from("<html><head><title>Metrics</title></head><body><ul>\n");
    for line in lines {
        html.push_str("<li>");
        html.push_str(&escape_html(line));
        html.push_str("</li>\n");
    }
    html.push_str("</ul></body></html>\n");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// GET / : every metric as an HTML list.
async fn list_metrics(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let mut lines = state.service.list();
    lines.sort();
    let mut response = negotiated(&headers, TEXT_HTML, render_listing(&lines).into_bytes())?;
    if let Ok(val) = HeaderValue::from_str(&lines.join(";")) {
        response.headers_mut().insert(METRICS_VAL_HEADER.clone(), val);
    }
    Ok(response)
}

/// GET /value/:mtype/:name : display text of one metric.
async fn get_value(
    State(state): State<AppState>,
    Path((mtype, name)): Path<(String, String)>,
) -> ApiResult<Response> {
    let text = state.service.value(&mtype, &name)?;
    Ok(([(header::CONTENT_TYPE, TEXT_PLAIN)], text).into_response())
}

/// POST /value : `{id, type}` in, signed record out.
async fn value_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let record = state
        .service
        .value_json(&body, &envelope_headers(&headers))?;
    let json = serde_json::to_vec(&record).map_err(|e| MetricError::Internal(e.to_string()))?;
    negotiated(&headers, APPLICATION_JSON, json)
}

/// POST /update/:mtype/:name/:value
async fn update_value(
    State(state): State<AppState>,
    Path((mtype, name, value)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    state.service.update(&mtype, &name, &value)?;
    state.service.persist_after_ingest().await;
    Ok(StatusCode::OK)
}

/// POST /update : one record in, the stored value echoed back signed.
async fn update_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let record = state
        .service
        .update_json(&body, &envelope_headers(&headers))?;
    state.service.persist_after_ingest().await;
    let json = serde_json::to_vec(&record).map_err(|e| MetricError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, APPLICATION_JSON)], json).into_response())
}

/// POST /updates : batch ingestion.
async fn updates_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    state
        .service
        .updates_json(&body, &envelope_headers(&headers))?;
    state.service.persist_after_ingest().await;
    Ok(StatusCode::OK)
}

/// GET /ping : database liveness.
async fn ping(State(state): State<AppState>) -> ApiResult<&'static str> {
    state.service.ping()?;
    Ok("ok")
}

/// Read-only endpoints, open to every origin.
pub fn query_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_metrics))
        .route("/value/:mtype/:name", get(get_value))
        .route("/value", post(value_json))
}

/// Mutating endpoints and the ping check, subject to the trusted-subnet
/// filter.
pub fn update_routes() -> Router<AppState> {
    Router::new()
        .route("/update/:mtype/:name/:value", post(update_value))
        .route("/update", post(update_json))
        .route("/updates", post(updates_json))
        .route("/ping", get(ping))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::BadRequest), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::NotImplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::IpNotAllowed), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::Decrypt), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::Decompress), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_listing_escapes_names() {
        let html = render_listing(&["<b> = 1".to_string()]);
        assert!(html.contains("<li>&lt;b&gt; = 1</li>"));
    }

    #[test]
    fn test_gzip_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_gzip(&headers));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br, GZip"));
        assert!(accepts_gzip(&headers));
    }
}
