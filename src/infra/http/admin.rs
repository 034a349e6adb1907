use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cachegate_api_types::{CacheStatsBody, ContentMutationEvent, PurgeRequest};

use crate::{
    application::error::HttpError,
    cache::{BanPredicate, Broadcaster, CacheNode, EventQueue, InvalidationTrigger},
};

use super::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct AdminState {
    pub node: CacheNode,
    pub trigger: Arc<InvalidationTrigger>,
    /// Every node of the cluster, this one included.
    pub broadcaster: Broadcaster,
    pub queue: Arc<EventQueue>,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/_health", get(admin_health))
        .route("/_cache/stats", get(cache_stats))
        .route("/_cache/events", post(content_mutated))
        .route("/_cache/broadcast", post(broadcast))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

async fn admin_health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn cache_stats(State(state): State<AdminState>) -> Json<CacheStatsBody> {
    let stats = state.node.store().stats();
    Json(CacheStatsBody {
        node_id: state.node.id().to_string(),
        entries: stats.entries,
        hits: stats.hits,
        misses: stats.misses,
        queued_events: state.queue.len(),
    })
}

async fn content_mutated(
    State(state): State<AdminState>,
    Json(event): Json<ContentMutationEvent>,
) -> Response {
    let outcome = state.trigger.content_mutated(event).await;
    (StatusCode::ACCEPTED, Json(outcome)).into_response()
}

async fn broadcast(
    State(state): State<AdminState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Response, HttpError> {
    if let PurgeRequest::Ban { pattern } = &request {
        BanPredicate::parse(pattern).map_err(|err| {
            HttpError::from_error(
                "infra::http::admin::broadcast",
                StatusCode::BAD_REQUEST,
                "Malformed ban pattern",
                &err,
            )
        })?;
    }

    let report = state.broadcaster.broadcast(&request).await;
    Ok((StatusCode::OK, Json(report.into_body())).into_response())
}
