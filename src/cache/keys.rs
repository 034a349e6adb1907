//! Cache key and content class definitions.
//!
//! A [`CacheKey`] is the normalized request path plus the values of the vary
//! headers, so requests that differ only in an unlisted header share an entry.

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;

/// Coarse category of a cached response. Drives TTL selection and the
/// `x-reqtype` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentClass {
    /// JSON responses from the origin API prefix.
    Api,
    /// Rendered documents served by the frontend.
    Express,
    /// Derived media (image scales, downloads).
    Blob,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::Api => "api",
            ContentClass::Express => "express",
            ContentClass::Blob => "blob",
        }
    }
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(ContentClass::Api),
            "express" => Ok(ContentClass::Express),
            "blob" => Ok(ContentClass::Blob),
            other => Err(format!("unknown content class `{other}`")),
        }
    }
}

/// Identity of one cached request variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    path: String,
    variant: Vec<(String, String)>,
}

impl CacheKey {
    /// Key for a path with no vary headers.
    pub fn new(path: impl AsRef<str>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            variant: Vec::new(),
        }
    }

    /// Key for a path, folding in the value of every listed header.
    ///
    /// Header names are matched case-insensitively; a missing header folds in
    /// as an empty value so its absence is itself a variant.
    pub fn with_vary(path: impl AsRef<str>, headers: &HeaderMap, vary: &[String]) -> Self {
        let variant = vary
            .iter()
            .map(|name| {
                let name = name.to_ascii_lowercase();
                let value = vary_value(headers, &name);
                (name, value)
            })
            .collect();

        Self {
            path: normalize_path(path.as_ref()),
            variant,
        }
    }

    /// Fold in further headers, skipping names the key already varies on.
    pub fn with_extra_vary(mut self, headers: &HeaderMap, vary: &[String]) -> Self {
        for name in vary {
            let name = name.to_ascii_lowercase();
            if self.variant.iter().any(|(known, _)| *known == name) {
                continue;
            }
            let value = vary_value(headers, &name);
            self.variant.push((name, value));
        }
        self
    }

    /// The normalized path (and sorted query) this key belongs to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Vary header names and the values folded into the key, in order.
    pub fn variant(&self) -> &[(String, String)] {
        &self.variant
    }
}

fn vary_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)?;
        for (name, value) in &self.variant {
            write!(f, "|{name}={value}")?;
        }
        Ok(())
    }
}

/// Normalize a request target into the canonical key space.
///
/// Repeated slashes collapse, a trailing slash is dropped (except for the
/// root), and query parameters are sorted so their order does not split
/// entries.
pub fn normalize_path(path_and_query: &str) -> String {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    normalized.push_str(&segments.join("/"));

    if let Some(query) = query {
        let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        if !params.is_empty() {
            params.sort_unstable();
            normalized.push('?');
            normalized.push_str(&params.join("&"));
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn vary() -> Vec<String> {
        vec!["Accept".to_string(), "Accept-Encoding".to_string()]
    }

    #[test]
    fn normalize_collapses_and_trims_slashes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("//page//"), "/page");
        assert_eq!(normalize_path("/++api++/"), "/++api++");
        assert_eq!(
            normalize_path("/page/logo-260x260.png/@@images/image/icon"),
            "/page/logo-260x260.png/@@images/image/icon"
        );
    }

    #[test]
    fn normalize_sorts_query_parameters() {
        assert_eq!(normalize_path("/search?b=2&a=1"), "/search?a=1&b=2");
        assert_eq!(normalize_path("/search?"), "/search");
        assert_eq!(normalize_path("/search?&&"), "/search");
    }

    #[test]
    fn listed_headers_split_entries() {
        let mut json = HeaderMap::new();
        json.insert("accept", HeaderValue::from_static("application/json"));
        let mut html = HeaderMap::new();
        html.insert("accept", HeaderValue::from_static("text/html"));

        let a = CacheKey::with_vary("/page", &json, &vary());
        let b = CacheKey::with_vary("/page", &html, &vary());
        assert_ne!(a, b);
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn unlisted_headers_share_an_entry() {
        let mut first = HeaderMap::new();
        first.insert("accept", HeaderValue::from_static("application/json"));
        first.insert("user-agent", HeaderValue::from_static("curl"));
        let mut second = HeaderMap::new();
        second.insert("accept", HeaderValue::from_static("application/json"));
        second.insert("user-agent", HeaderValue::from_static("firefox"));

        assert_eq!(
            CacheKey::with_vary("/page", &first, &vary()),
            CacheKey::with_vary("/page", &second, &vary())
        );
    }

    #[test]
    fn display_lists_variant_values() {
        let mut headers = HeaderMap::new();
        headers.insert("accept-encoding", HeaderValue::from_static("gzip"));
        let key = CacheKey::with_vary("/page/", &headers, &vary());
        assert_eq!(key.to_string(), "/page|accept=|accept-encoding=gzip");
    }

    #[test]
    fn content_class_parses_case_insensitively() {
        assert_eq!("BLOB".parse::<ContentClass>(), Ok(ContentClass::Blob));
        assert_eq!(ContentClass::Api.to_string(), "api");
        assert!("image".parse::<ContentClass>().is_err());
    }
}
