//! `PURGE` and `BAN` on the public listener.
//!
//! These verbs act on this node's store only. Fan-out to other nodes is the
//! broadcaster's job.

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use cachegate_api_types::PurgeAck;

use crate::{
    application::error::HttpError,
    cache::{self, BanPredicate, INVALIDATE_PATTERN_HEADER},
};

use super::public::PublicState;

const PURGE: &str = "PURGE";
const BAN: &str = "BAN";

/// Intercept control verbs before the cache and proxy see them.
pub async fn control_verbs(
    State(state): State<PublicState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let verb = request.method().as_str();
    if verb != PURGE && verb != BAN {
        return next.run(request).await;
    }

    if !state.config.purging_enabled {
        return HttpError::new(
            "infra::http::control_verbs",
            StatusCode::METHOD_NOT_ALLOWED,
            "Purging is disabled",
            format!("{verb} rejected: purge.enabled is false"),
        )
        .into_response();
    }

    if verb == PURGE {
        let target = request
            .uri()
            .path_and_query()
            .map_or_else(|| request.uri().path().to_string(), |pq| pq.to_string());
        let outcome = cache::purge_exact(&state.node, &target);
        (StatusCode::OK, Json(PurgeAck::from(outcome))).into_response()
    } else {
        match ban(&state, request.headers()) {
            Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

fn ban(state: &PublicState, headers: &HeaderMap) -> Result<PurgeAck, HttpError> {
    let pattern = headers
        .get(INVALIDATE_PATTERN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            HttpError::new(
                "infra::http::control_verbs::ban",
                StatusCode::BAD_REQUEST,
                "Missing ban pattern",
                format!("BAN requires the `{INVALIDATE_PATTERN_HEADER}` header"),
            )
        })?;

    let predicate = BanPredicate::parse(pattern).map_err(|err| {
        HttpError::from_error(
            "infra::http::control_verbs::ban",
            StatusCode::BAD_REQUEST,
            "Malformed ban pattern",
            &err,
        )
    })?;

    Ok(PurgeAck {
        removed: cache::ban(&state.node, &predicate),
        already_absent: false,
    })
}
