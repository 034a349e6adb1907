#![allow(dead_code)]

use std::{future::IntoFuture, net::SocketAddr};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use cachegate::{
    application::Coordinator,
    config::{self, Settings},
};
use tokio::net::TcpListener;
use tower::ServiceExt;

/// Address nothing listens on.
pub const DEAD_NODE: &str = "http://127.0.0.1:1/";

pub fn settings(node_id: &str, origin: &str, extra: &str) -> Settings {
    config::from_toml(&format!(
        r#"
        [server]
        node_id = "{node_id}"

        [origin]
        url = "{origin}"
        timeout_ms = 2000

        {extra}
        "#
    ))
    .expect("test settings should resolve")
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

pub async fn get(router: &Router, uri: &str) -> Response<Body> {
    send(
        router,
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request should build"),
    )
    .await
}

pub fn header<'a>(response: &'a Response<Body>, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should buffer");
    serde_json::from_slice(&bytes).expect("body should be json")
}

/// A node served on ephemeral local ports.
pub struct RunningNode {
    pub id: String,
    pub public: SocketAddr,
    pub admin: SocketAddr,
    pub coordinator: Coordinator,
}

impl RunningNode {
    pub fn public_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.public)
    }

    pub fn admin_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.admin)
    }
}

/// Start one node per id, each configured with every other node as a peer.
///
/// `extra_nodes` are appended to every node's peer list (for unreachable nodes).
pub async fn start_cluster(
    ids: &[&str],
    origin: &str,
    extra_nodes: &[(&str, &str)],
    extra: &str,
) -> Vec<RunningNode> {
    let mut bound = Vec::with_capacity(ids.len());
    for id in ids {
        let public = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("public listener should bind");
        let admin = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("admin listener should bind");
        bound.push((id.to_string(), public, admin));
    }

    let mut node_table = String::new();
    for (id, public, _) in &bound {
        let addr = public.local_addr().expect("local addr");
        node_table.push_str(&format!(
            "[[purge.nodes]]\nid = \"{id}\"\naddress = \"http://{addr}/\"\n\n"
        ));
    }
    for (id, address) in extra_nodes {
        node_table.push_str(&format!(
            "[[purge.nodes]]\nid = \"{id}\"\naddress = \"{address}\"\n\n"
        ));
    }

    let mut nodes = Vec::with_capacity(bound.len());
    for (id, public, admin) in bound {
        let settings = settings(&id, origin, &format!("{extra}\n{node_table}"));
        let coordinator = Coordinator::from_settings(&settings).expect("coordinator");
        let public_addr = public.local_addr().expect("local addr");
        let admin_addr = admin.local_addr().expect("local addr");

        tokio::spawn(axum::serve(public, coordinator.public_router()).into_future());
        tokio::spawn(axum::serve(admin, coordinator.admin_router()).into_future());

        nodes.push(RunningNode {
            id,
            public: public_addr,
            admin: admin_addr,
            coordinator,
        });
    }
    nodes
}

/// Fetch through a round-robin over `urls` and report whether every response
/// came from one converged store.
///
/// A single store answers each repeated request with `x-hits` exactly one
/// higher than the last. Any other step (a repeat, a jump or a reset) means
/// consecutive requests reached nodes whose caches have diverged.
pub async fn hits_increase_by_one(
    client: &reqwest::Client,
    urls: &[String],
    attempts: usize,
) -> bool {
    let mut last: Option<u64> = None;
    for url in urls.iter().cycle().take(attempts) {
        let response = client.get(url).send().await.expect("request should succeed");
        let hits = response
            .headers()
            .get("x-hits")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        if last.is_some_and(|previous| hits != previous + 1) {
            return false;
        }
        last = Some(hits);
    }
    true
}
