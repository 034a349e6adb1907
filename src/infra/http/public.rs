use axum::{
    Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
};

use crate::{
    application::error::HttpError,
    cache::{CacheConfig, CacheNode, CacheState, response_cache_layer},
    infra::origin::OriginClient,
};

use super::{
    control::control_verbs,
    middleware::{log_responses, set_request_context},
};

#[derive(Clone)]
pub struct PublicState {
    pub config: CacheConfig,
    pub node: CacheNode,
    pub origin: OriginClient,
    pub request_body_limit: usize,
}

/// Router for the public listener.
///
/// Every path falls through to the origin proxy; the cache layer sits in
/// front of it and the control verbs in front of the cache.
pub fn build_public_router(state: PublicState, cache: CacheState) -> Router {
    Router::new()
        .fallback(proxy_to_origin)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(cache, response_cache_layer))
        .layer(middleware::from_fn_with_state(state, control_verbs))
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn proxy_to_origin(State(state): State<PublicState>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.request_body_limit).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return HttpError::from_error(
                "infra::http::proxy_to_origin",
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
                &err,
            )
            .into_response();
        }
    };

    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.to_string());

    match state
        .origin
        .forward(parts.method, &target, &parts.headers, body)
        .await
    {
        Ok(response) => response,
        Err(err) => HttpError::from_error(
            "infra::http::proxy_to_origin",
            StatusCode::BAD_GATEWAY,
            "Origin unavailable",
            &err,
        )
        .into_response(),
    }
}
