use crate::state::AppState;
use crate::{api, logging, middleware};
use axum::Router;

pub fn build_http_app(state: AppState) -> Router {
    let gated = api::update_routes().layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::trusted_subnet_middleware,
    ));

    api::query_routes()
        .merge(gated)
        .with_state(state)
        .layer(axum::middleware::from_fn(logging::request_logging))
}
