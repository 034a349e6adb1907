//! Response cache middleware.
//!
//! Serves cacheable GET/HEAD requests from the node's store and stores
//! successful origin responses on a miss. Every response carries the
//! `x-cache`, `x-hits`, `x-reqtype`, `x-ttl` and `x-auth` diagnostics.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::classifier::{BypassReason, Classification, RequestClassifier};
use super::config::CacheConfig;
use super::keys::{CacheKey, ContentClass};
use super::purge::CacheNode;
use super::store::{CacheHit, EntryMetadata, StoredResponse};

pub const X_CACHE: &str = "x-cache";
pub const X_HITS: &str = "x-hits";
pub const X_REQTYPE: &str = "x-reqtype";
pub const X_TTL: &str = "x-ttl";
pub const X_AUTH: &str = "x-auth";

/// Headers that describe a connection rather than the content.
const UNSTORED_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub node: CacheNode,
    pub classifier: Arc<RequestClassifier>,
}

/// Middleware for the response cache.
///
/// Requests the classifier bypasses are forwarded untouched apart from the
/// diagnostic headers. HEAD requests may be served from an entry stored by
/// a GET but never create one.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let target = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.to_string());

    let (base_key, class) = match cache
        .classifier
        .classify(&method, &target, request.headers())
    {
        Classification::Bypass(reason) => {
            debug!(cache = "response", outcome = "bypass", reason = reason.as_str());
            let mut response = next.run(request).await;
            stamp_bypass(
                response.headers_mut(),
                reason == BypassReason::Authenticated,
            );
            return response;
        }
        Classification::Cacheable { key, class } => (key, class),
    };

    // Headers the origin varied this path on, beyond the configured ones.
    let learned = cache.node.store().learned_vary(base_key.path());
    let key = base_key
        .clone()
        .with_extra_vary(request.headers(), &learned);

    if let Some(hit) = cache.node.store().lookup(&key) {
        debug!(
            cache = "response",
            outcome = "hit",
            key = %key,
            hits = hit.entry.hit_count
        );
        return build_hit_response(hit, method == Method::HEAD);
    }

    debug!(cache = "response", outcome = "miss", key = %key);
    let request_headers = request.headers().clone();
    let response = next.run(request).await;

    let mut response = if method == Method::GET && should_store_response(&response) {
        store_response(&cache, base_key, &request_headers, class, response).await
    } else {
        response
    };
    stamp(
        response.headers_mut(),
        "MISS",
        0,
        class,
        cache.config.ttl_for(class),
    );
    response
}

/// Whether an origin response may be stored.
pub fn should_store_response(response: &Response) -> bool {
    if response.status() != StatusCode::OK {
        return false;
    }

    let headers = response.headers();
    if headers.contains_key(header::SET_COOKIE) {
        return false;
    }

    if headers
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value.split(',').map(str::trim).any(|directive| {
                directive.eq_ignore_ascii_case("no-store")
                    || directive.eq_ignore_ascii_case("private")
            })
        })
    {
        return false;
    }

    if headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
    {
        return false;
    }

    !response_vary(headers).iter().any(|name| name == "*")
}

/// Header names listed in the response's `Vary`, lowercased.
fn response_vary(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Buffer and store an origin response.
///
/// `base_key` carries only the configured vary headers. The stored key also
/// folds in every header the origin has listed in `Vary` for this path.
async fn store_response(
    cache: &CacheState,
    base_key: CacheKey,
    request_headers: &HeaderMap,
    class: ContentClass,
    response: Response,
) -> Response {
    let limit = cache.config.body_limit_bytes;
    let declared = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        debug!(key = %base_key, limit, "response too large to cache");
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match BodyExt::collect(body).await {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            warn!(key = %base_key, error = %error, "failed to buffer origin response");
            let mut failed = Response::new(Body::empty());
            *failed.status_mut() = StatusCode::BAD_GATEWAY;
            return failed;
        }
    };

    if bytes.len() <= limit {
        let extra: Vec<String> = response_vary(&parts.headers)
            .into_iter()
            .filter(|name| base_key.variant().iter().all(|(known, _)| known != name))
            .collect();
        let learned = cache.node.store().learn_vary(base_key.path(), &extra);
        let key = base_key.with_extra_vary(request_headers, &learned);

        let stored = stored_response(parts.status, &parts.headers, bytes.clone());
        let metadata = entry_metadata(&key, class, &stored);
        cache.node.store().insert(key, stored, class, metadata);
    }

    Response::from_parts(parts, Body::from(bytes))
}

fn stored_response(status: StatusCode, headers: &HeaderMap, body: Bytes) -> StoredResponse {
    let stored_headers = headers
        .iter()
        .filter(|(name, _)| !UNSTORED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    StoredResponse {
        status: status.as_u16(),
        headers: stored_headers,
        body,
        content_type,
    }
}

/// Tags a ban predicate can match on.
fn entry_metadata(key: &CacheKey, class: ContentClass, stored: &StoredResponse) -> EntryMetadata {
    let mut metadata = EntryMetadata::new()
        .with("status", stored.status.to_string())
        .with("url", key.path())
        .with("reqtype", class.as_str());
    if let Some(content_type) = &stored.content_type {
        metadata.insert("content-type", content_type.clone());
    }
    for (name, value) in &stored.headers {
        metadata.insert(format!("http.{name}"), value.clone());
    }
    metadata
}

fn build_hit_response(hit: CacheHit, head: bool) -> Response {
    let CacheHit { entry, remaining } = hit;
    let status = StatusCode::from_u16(entry.response.status).unwrap_or(StatusCode::OK);
    let body = if head {
        Body::empty()
    } else {
        Body::from(entry.response.body.clone())
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in &entry.response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    stamp(
        headers,
        "HIT",
        entry.hit_count,
        entry.class,
        remaining,
    );
    response
}

fn stamp(
    headers: &mut HeaderMap,
    outcome: &'static str,
    hits: u64,
    class: ContentClass,
    ttl: Duration,
) {
    headers.insert(X_CACHE, HeaderValue::from_static(outcome));
    headers.insert(X_HITS, HeaderValue::from(hits));
    headers.insert(X_REQTYPE, HeaderValue::from_static(class.as_str()));
    if let Ok(value) = HeaderValue::from_str(&format!("{:.3}", ttl.as_secs_f64())) {
        headers.insert(X_TTL, value);
    }
    stamp_auth(headers, false);
}

fn stamp_bypass(headers: &mut HeaderMap, authenticated: bool) {
    headers.insert(X_CACHE, HeaderValue::from_static("MISS"));
    headers.insert(X_HITS, HeaderValue::from(0u64));
    stamp_auth(headers, authenticated);
}

fn stamp_auth(headers: &mut HeaderMap, authenticated: bool) {
    let value = if authenticated {
        "Logged-in"
    } else {
        "Anonymous"
    };
    headers.insert(X_AUTH, HeaderValue::from_static(value));
}

#[cfg(test)]
mod tests {
    use axum::{Router, middleware, routing::get};
    use tower::ServiceExt;

    use super::*;
    use crate::cache::store::CacheStore;

    fn state() -> CacheState {
        let config = CacheConfig::default();
        CacheState {
            node: CacheNode::new("a", Arc::new(CacheStore::new(&config))),
            classifier: Arc::new(RequestClassifier::new(&config, "++api++")),
            config,
        }
    }

    fn app(state: CacheState) -> Router {
        Router::new()
            .route("/page", get(|| async { "page" }))
            .route(
                "/private",
                get(|| async { ([(header::CACHE_CONTROL, "private, max-age=0")], "secret") }),
            )
            .route(
                "/missing",
                get(|| async { (StatusCode::NOT_FOUND, "missing") }),
            )
            .route(
                "/language",
                get(|headers: HeaderMap| async move {
                    let language = headers
                        .get(header::ACCEPT_LANGUAGE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    ([(header::VARY, "Accept-Encoding, Accept-Language")], language)
                }),
            )
            .route(
                "/anything",
                get(|| async { ([(header::VARY, "*")], "anything") }),
            )
            .route(
                "/broken",
                get(|| async {
                    Body::from_stream(futures::stream::iter([Err::<Bytes, std::io::Error>(
                        std::io::Error::other("origin reset"),
                    )]))
                }),
            )
            .layer(middleware::from_fn_with_state(state, response_cache_layer))
    }

    async fn send(app: &Router, method: Method, uri: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    async fn send_language(app: &Router, language: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .uri("/language")
                    .header(header::ACCEPT_LANGUAGE, language)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response")
    }

    fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let app = app(state());

        let first = send(&app, Method::GET, "/page").await;
        assert_eq!(header_str(&first, X_CACHE), "MISS");
        assert_eq!(header_str(&first, X_HITS), "0");
        assert_eq!(header_str(&first, X_REQTYPE), "express");
        assert_eq!(header_str(&first, X_TTL), "30.000");
        assert_eq!(header_str(&first, X_AUTH), "Anonymous");

        let second = send(&app, Method::GET, "/page").await;
        assert_eq!(header_str(&second, X_CACHE), "HIT");
        assert_eq!(header_str(&second, X_HITS), "1");
        let body = second.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"page"));
    }

    #[tokio::test]
    async fn head_never_creates_entries() {
        let state = state();
        let app = app(state.clone());

        send(&app, Method::HEAD, "/page").await;
        assert!(state.node.store().is_empty());

        send(&app, Method::GET, "/page").await;
        let head = send(&app, Method::HEAD, "/page").await;
        assert_eq!(header_str(&head, X_CACHE), "HIT");
        let body = head.into_body().collect().await.expect("body").to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn uncacheable_responses_are_not_stored() {
        let state = state();
        let app = app(state.clone());

        send(&app, Method::GET, "/private").await;
        send(&app, Method::GET, "/missing").await;
        assert!(state.node.store().is_empty());
    }

    #[tokio::test]
    async fn authenticated_requests_bypass() {
        let state = state();
        let app = app(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/page")
                    .header(header::AUTHORIZATION, "Basic YWRtaW46YWRtaW4=")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(header_str(&response, X_CACHE), "MISS");
        assert_eq!(header_str(&response, X_HITS), "0");
        assert_eq!(header_str(&response, X_AUTH), "Logged-in");
        assert!(state.node.store().is_empty());
    }

    #[tokio::test]
    async fn oversized_bodies_pass_through_uncached() {
        let mut state = state();
        state.config.body_limit_bytes = 2;
        let app = app(state.clone());

        let response = send(&app, Method::GET, "/page").await;
        let body = response.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"page"));
        assert!(state.node.store().is_empty());
    }

    #[tokio::test]
    async fn origin_vary_headers_split_entries() {
        let state = state();
        let app = app(state.clone());

        let fr = send_language(&app, "fr").await;
        assert_eq!(header_str(&fr, X_CACHE), "MISS");

        let en = send_language(&app, "en").await;
        assert_eq!(header_str(&en, X_CACHE), "MISS");
        let body = en.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"en"));

        let fr_again = send_language(&app, "fr").await;
        assert_eq!(header_str(&fr_again, X_CACHE), "HIT");
        let body = fr_again.into_body().collect().await.expect("body").to_bytes();
        assert_eq!(body, Bytes::from_static(b"fr"));

        assert_eq!(state.node.store().len(), 2);
        assert_eq!(
            state.node.store().learned_vary("/language"),
            ["accept-language"]
        );
    }

    #[tokio::test]
    async fn vary_star_is_never_stored() {
        let state = state();
        let app = app(state.clone());

        send(&app, Method::GET, "/anything").await;
        let second = send(&app, Method::GET, "/anything").await;
        assert_eq!(header_str(&second, X_CACHE), "MISS");
        assert!(state.node.store().is_empty());
    }

    #[tokio::test]
    async fn unreadable_origin_body_is_a_bad_gateway() {
        let state = state();
        let app = app(state.clone());

        let response = send(&app, Method::GET, "/broken").await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(state.node.store().is_empty());
    }

    #[test]
    fn metadata_exposes_status_and_headers() {
        let key = CacheKey::new("/page");
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        let stored = stored_response(StatusCode::OK, &headers, Bytes::new());

        let metadata = entry_metadata(&key, ContentClass::Express, &stored);
        assert_eq!(metadata.get("status"), Some("200"));
        assert_eq!(metadata.get("url"), Some("/page"));
        assert_eq!(metadata.get("http.content-type"), Some("text/html"));
        assert_eq!(metadata.get("http.connection"), None);
    }
}
