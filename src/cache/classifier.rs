//! Request classification.
//!
//! Decides whether a request may be served from the cache, and if so which
//! key and content class it belongs to.

use axum::http::{HeaderMap, Method, header};

use super::config::CacheConfig;
use super::keys::{CacheKey, ContentClass};

const AUTH_COOKIES: [&str; 2] = ["__ac", "auth_token"];
const DEFAULT_API_MARKER: &str = "++api++";

/// Why a request skips the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
    Disabled,
    Method,
    Authenticated,
}

impl BypassReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BypassReason::Disabled => "disabled",
            BypassReason::Method => "method",
            BypassReason::Authenticated => "authenticated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Bypass(BypassReason),
    Cacheable { key: CacheKey, class: ContentClass },
}

#[derive(Debug, Clone)]
pub struct RequestClassifier {
    enabled: bool,
    api_marker: String,
    blob_markers: Vec<String>,
    vary_headers: Vec<String>,
}

impl RequestClassifier {
    pub fn new(config: &CacheConfig, api_marker: impl Into<String>) -> Self {
        let marker = api_marker.into();
        let marker = marker.trim_matches('/');
        Self {
            enabled: config.enabled,
            api_marker: if marker.is_empty() {
                DEFAULT_API_MARKER.to_string()
            } else {
                marker.to_string()
            },
            blob_markers: config.blob_markers.clone(),
            vary_headers: config.vary_headers.clone(),
        }
    }

    pub fn vary_headers(&self) -> &[String] {
        &self.vary_headers
    }

    pub fn classify(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
    ) -> Classification {
        if !self.enabled {
            return Classification::Bypass(BypassReason::Disabled);
        }
        if method != Method::GET && method != Method::HEAD {
            return Classification::Bypass(BypassReason::Method);
        }
        if is_authenticated(headers) {
            return Classification::Bypass(BypassReason::Authenticated);
        }

        let key = CacheKey::with_vary(path_and_query, headers, &self.vary_headers);
        let class = self.content_class(key.path());
        Classification::Cacheable { key, class }
    }

    /// Class of a normalized path. Blob markers win over the API prefix so
    /// scales requested through the API still get the long TTL.
    pub fn content_class(&self, path: &str) -> ContentClass {
        let path_only = path.split_once('?').map_or(path, |(p, _)| p);
        if self
            .blob_markers
            .iter()
            .any(|marker| contains_marker(path_only, marker))
        {
            return ContentClass::Blob;
        }
        let first_segment = path_only.trim_start_matches('/').split('/').next();
        if first_segment == Some(self.api_marker.as_str()) {
            return ContentClass::Api;
        }
        ContentClass::Express
    }
}

/// Markers like `/@@images/` also match when they close the path.
fn contains_marker(path: &str, marker: &str) -> bool {
    if path.contains(marker) {
        return true;
    }
    let trimmed = marker.trim_end_matches('/');
    !trimmed.is_empty() && path.ends_with(trimmed)
}

/// Whether the request carries credentials the origin personalises on.
pub fn is_authenticated(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::AUTHORIZATION) {
        return true;
    }
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .any(|(name, value)| AUTH_COOKIES.contains(&name.trim()) && !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn classifier() -> RequestClassifier {
        RequestClassifier::new(&CacheConfig::default(), "++api++")
    }

    fn class_of(path: &str) -> ContentClass {
        match classifier().classify(&Method::GET, path, &HeaderMap::new()) {
            Classification::Cacheable { class, .. } => class,
            Classification::Bypass(reason) => panic!("unexpected bypass: {reason:?}"),
        }
    }

    #[test]
    fn classes_follow_path_shape() {
        assert_eq!(
            class_of("/page/logo-260x260.png/@@images/image/icon"),
            ContentClass::Blob
        );
        assert_eq!(class_of("/file.pdf/@@download/file"), ContentClass::Blob);
        assert_eq!(class_of("/++api++/page"), ContentClass::Api);
        assert_eq!(class_of("/++api++"), ContentClass::Api);
        assert_eq!(
            class_of("/++api++/page/image.png/@@images/image"),
            ContentClass::Blob
        );
        assert_eq!(class_of("/page"), ContentClass::Express);
        assert_eq!(class_of("/not++api++/page"), ContentClass::Express);
    }

    #[test]
    fn only_get_and_head_are_cacheable() {
        let classifier = classifier();
        let headers = HeaderMap::new();
        for method in [Method::POST, Method::PUT, Method::PATCH, Method::DELETE] {
            assert_eq!(
                classifier.classify(&method, "/page", &headers),
                Classification::Bypass(BypassReason::Method)
            );
        }
        assert!(matches!(
            classifier.classify(&Method::HEAD, "/page", &headers),
            Classification::Cacheable { .. }
        ));
    }

    #[test]
    fn credentials_bypass() {
        let classifier = classifier();

        let mut bearer = HeaderMap::new();
        bearer.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        assert_eq!(
            classifier.classify(&Method::GET, "/page", &bearer),
            Classification::Bypass(BypassReason::Authenticated)
        );

        let mut cookie = HeaderMap::new();
        cookie.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; __ac=abc123"),
        );
        assert!(is_authenticated(&cookie));

        let mut anonymous = HeaderMap::new();
        anonymous.insert(header::COOKIE, HeaderValue::from_static("theme=dark; __ac="));
        assert!(!is_authenticated(&anonymous));
    }

    #[test]
    fn disabled_cache_bypasses_everything() {
        let config = CacheConfig {
            enabled: false,
            ..Default::default()
        };
        let classifier = RequestClassifier::new(&config, "++api++");
        assert_eq!(
            classifier.classify(&Method::GET, "/page", &HeaderMap::new()),
            Classification::Bypass(BypassReason::Disabled)
        );
    }

    #[test]
    fn key_is_normalized() {
        let classifier = classifier();
        let Classification::Cacheable { key, .. } =
            classifier.classify(&Method::GET, "//page/?b=1&a=2", &HeaderMap::new())
        else {
            panic!("expected cacheable");
        };
        assert_eq!(key.path(), "/page?a=2&b=1");
    }
}
