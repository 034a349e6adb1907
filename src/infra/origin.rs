//! Forwarding of cache misses to the origin content service.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, Method, header},
    response::Response,
};
use bytes::Bytes;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::debug;

use super::error::InfraError;

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("invalid origin target `{target}`: {source}")]
    InvalidTarget {
        target: String,
        source: url::ParseError,
    },
    #[error("origin request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct OriginClient {
    client: Client,
    base: Url,
}

impl OriginClient {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("cachegate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Forward one request and buffer the origin response.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, OriginError> {
        let url = self
            .base
            .join(path_and_query)
            .map_err(|source| OriginError::InvalidTarget {
                target: path_and_query.to_string(),
                source,
            })?;

        let mut outbound = headers.clone();
        strip_hop_by_hop(&mut outbound);
        outbound.remove(header::HOST);
        outbound.remove(header::CONTENT_LENGTH);

        debug!(method = %method, url = %url, "forwarding to origin");
        let upstream = self
            .client
            .request(method, url)
            .headers(outbound)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);
        let bytes = upstream.bytes().await?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}
