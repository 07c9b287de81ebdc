use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use devmetrics_common::codec::REAL_IP;

use crate::api::ApiError;
use crate::logging::TraceId;
use crate::state::AppState;

/// Middleware that checks the `X-Real-IP` request header against the
/// configured trusted subnet.
///
/// Without a trusted subnet every request passes. With one, requests whose
/// header is missing, unparsable or outside the subnet get 403 Forbidden.
pub async fn trusted_subnet_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let real_ip = req.headers().get(REAL_IP).and_then(|v| v.to_str().ok());

    if let Err(e) = state.service.check_origin(real_ip) {
        let trace_id = req
            .extensions()
            .get::<TraceId>()
            .map(|t| t.0.clone())
            .unwrap_or_default();
        tracing::warn!(
            trace_id = %trace_id,
            real_ip = real_ip.unwrap_or("-"),
            "Request rejected: origin outside trusted subnet"
        );
        return ApiError(e).into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::MetricsService;
    use crate::store::Integrity;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use devmetrics_storage::Persistence;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn build_mock_state(subnet: Option<&str>) -> AppState {
        let service = MetricsService::new(Integrity::default(), Persistence::default())
            .with_trusted_subnet(subnet.map(|s| s.parse().unwrap()));
        AppState::new(Arc::new(service))
    }

    async fn test_handler() -> Response {
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("OK"))
            .unwrap()
    }

    fn build_test_app(state: AppState) -> Router {
        Router::new()
            .route("/test", get(test_handler))
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                trusted_subnet_middleware,
            ))
            .with_state(state)
    }

    async fn call(app: Router, real_ip: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().uri("/test");
        if let Some(ip) = real_ip {
            builder = builder.header("X-Real-IP", ip);
        }
        let resp = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_no_subnet_passes_through() {
        let app = build_test_app(build_mock_state(None));
        let (status, body) = call(app, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_ip_inside_subnet_passes() {
        let app = build_test_app(build_mock_state(Some("192.168.0.0/16")));
        let (status, _) = call(app, Some("192.168.10.4")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ip_outside_subnet_returns_403() {
        let app = build_test_app(build_mock_state(Some("192.168.0.0/16")));
        let (status, _) = call(app, Some("10.1.1.1")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_missing_header_returns_403() {
        let app = build_test_app(build_mock_state(Some("192.168.0.0/16")));
        let (status, _) = call(app, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ipv6_subnet() {
        let app = build_test_app(build_mock_state(Some("fd00::/8")));
        let (status, _) = call(app.clone(), Some("fd12::1")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, Some("192.168.1.1")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
