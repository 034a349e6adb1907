//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::{BTreeSet, HashSet},
    net::SocketAddr,
    num::NonZeroUsize,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{BanPredicate, CacheConfig, VirtualHostRewrite};

mod cli;

pub use cli::{BanArgs, CliArgs, ClusterOverrides, Command, PurgeArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "cachegate";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_ADMIN_HOST: &str = "127.0.0.1";
const DEFAULT_PUBLIC_PORT: u16 = 3000;
const DEFAULT_ADMIN_PORT: u16 = 3001;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_NODE_ID: &str = "local";
const DEFAULT_REQUEST_BODY_LIMIT_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_ORIGIN_URL: &str = "http://127.0.0.1:8080/";
const DEFAULT_ORIGIN_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub origin: OriginSettings,
    pub cache: CacheSettings,
    pub purge: PurgeSettings,
    pub vhost: VhostSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Identifier this node reports in stats and broadcast reports.
    pub node_id: String,
    pub public_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    pub graceful_shutdown: Duration,
    pub request_body_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    pub url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_api: Duration,
    pub ttl_express: Duration,
    pub ttl_blob: Duration,
    pub max_entries: NonZeroUsize,
    pub body_limit_bytes: NonZeroUsize,
    /// `None` disables the background expiry sweep.
    pub sweep_interval: Option<Duration>,
    pub vary_headers: Vec<String>,
    pub blob_markers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PurgeSettings {
    pub enabled: bool,
    pub eligible_types: BTreeSet<String>,
    pub nodes: Vec<NodeSettings>,
    pub node_timeout: Duration,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
    pub queue_limit: NonZeroUsize,
    /// Ban broadcast once after startup, validated at load time.
    pub startup_ban: Option<String>,
}

/// A cache node reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    pub id: String,
    pub address: Url,
}

#[derive(Debug, Clone)]
pub struct VhostSettings {
    pub marker: String,
    pub prefix: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("CACHEGATE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_cluster_overrides(&args.cluster),
        Some(Command::Ban(args)) => raw.apply_cluster_overrides(&args.cluster),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve settings from an inline TOML document, ignoring files and environment.
pub fn from_toml(contents: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(contents, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            origin,
            cache,
            purge,
            vhost,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let origin = build_origin_settings(origin)?;
        let cache = build_cache_settings(cache)?;
        let purge = build_purge_settings(purge)?;
        let vhost = build_vhost_settings(vhost)?;

        Ok(Self {
            server,
            logging,
            origin,
            cache,
            purge,
            vhost,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::from(self)
    }

    pub fn vhost_rewrite(&self) -> VirtualHostRewrite {
        VirtualHostRewrite::new(self.vhost.marker.clone(), self.vhost.prefix.clone())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    origin: RawOriginSettings,
    cache: RawCacheSettings,
    purge: RawPurgeSettings,
    vhost: RawVhostSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(id) = overrides.node_id.as_ref() {
            self.server.node_id = Some(id.clone());
        }
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(host) = overrides.server_admin_host.as_ref() {
            self.server.admin_host = Some(host.clone());
        }
        if let Some(port) = overrides.public_port {
            self.server.public_port = Some(port);
        }
        if let Some(port) = overrides.admin_port {
            self.server.admin_port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.url = Some(url.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(enabled) = overrides.purge_enabled {
            self.purge.enabled = Some(enabled);
        }
        if let Some(pattern) = overrides.startup_ban.as_ref() {
            self.purge.startup_ban = Some(pattern.clone());
        }

        self.apply_cluster_overrides(&overrides.cluster);
    }

    fn apply_cluster_overrides(&mut self, overrides: &ClusterOverrides) {
        if !overrides.nodes.is_empty() {
            let nodes = overrides
                .nodes
                .iter()
                .map(|spec| match spec.split_once('=') {
                    Some((id, address)) => RawNodeSettings {
                        id: Some(id.to_string()),
                        address: Some(address.to_string()),
                    },
                    None => RawNodeSettings {
                        id: None,
                        address: Some(spec.clone()),
                    },
                })
                .collect();
            self.purge.nodes = Some(nodes);
        }
        if let Some(timeout) = overrides.node_timeout_ms {
            self.purge.node_timeout_ms = Some(timeout);
        }
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let node_id = non_blank(server.node_id).unwrap_or_else(|| DEFAULT_NODE_ID.to_string());

    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let admin_host = server
        .admin_host
        .unwrap_or_else(|| DEFAULT_ADMIN_HOST.to_string());

    let public_port = server.public_port.unwrap_or(DEFAULT_PUBLIC_PORT);
    if public_port == 0 {
        return Err(LoadError::invalid(
            "server.public_port",
            "port must be greater than zero",
        ));
    }

    let admin_port = server.admin_port.unwrap_or(DEFAULT_ADMIN_PORT);
    if admin_port == 0 {
        return Err(LoadError::invalid(
            "server.admin_port",
            "port must be greater than zero",
        ));
    }

    let public_addr = parse_socket_addr(&host, public_port)
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;
    let admin_addr = parse_socket_addr(&admin_host, admin_port)
        .map_err(|reason| LoadError::invalid("server.admin_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    let request_body_limit = non_zero_usize(
        server
            .request_body_limit_bytes
            .unwrap_or(DEFAULT_REQUEST_BODY_LIMIT_BYTES as u64),
        "server.request_body_limit_bytes",
    )?;

    Ok(ServerSettings {
        node_id,
        public_addr,
        admin_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
        request_body_limit,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let raw_url = non_blank(origin.url).unwrap_or_else(|| DEFAULT_ORIGIN_URL.to_string());
    let url = parse_http_url(&raw_url).map_err(|reason| LoadError::invalid("origin.url", reason))?;

    let timeout_ms = origin.timeout_ms.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "origin.timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(OriginSettings {
        url,
        timeout: Duration::from_millis(timeout_ms),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();

    let ttl_api = ttl_seconds(cache.ttl.api, defaults.ttl.api, "cache.ttl.api")?;
    let ttl_express = ttl_seconds(cache.ttl.express, defaults.ttl.express, "cache.ttl.express")?;
    let ttl_blob = ttl_seconds(cache.ttl.blob, defaults.ttl.blob, "cache.ttl.blob")?;

    let max_entries = non_zero_usize(
        cache.max_entries.unwrap_or(defaults.max_entries as u64),
        "cache.max_entries",
    )?;
    let body_limit_bytes = non_zero_usize(
        cache
            .body_limit_bytes
            .unwrap_or(defaults.body_limit_bytes as u64),
        "cache.body_limit_bytes",
    )?;

    let sweep_secs = cache
        .sweep_interval_secs
        .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
    let sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

    let vary_headers = match cache.vary_headers {
        Some(headers) => {
            let mut normalized: Vec<String> = Vec::with_capacity(headers.len());
            for header in headers {
                let name = header.trim().to_ascii_lowercase();
                if name.is_empty() {
                    continue;
                }
                axum::http::HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
                    LoadError::invalid(
                        "cache.vary_headers",
                        format!("`{name}` is not a header name: {err}"),
                    )
                })?;
                if !normalized.contains(&name) {
                    normalized.push(name);
                }
            }
            normalized
        }
        None => defaults.vary_headers,
    };

    let blob_markers = match cache.blob_markers {
        Some(markers) => {
            let markers: Vec<String> = markers
                .into_iter()
                .filter_map(|marker| non_blank(Some(marker)))
                .collect();
            if markers.is_empty() {
                return Err(LoadError::invalid(
                    "cache.blob_markers",
                    "at least one marker is required",
                ));
            }
            markers
        }
        None => defaults.blob_markers,
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(defaults.enabled),
        ttl_api,
        ttl_express,
        ttl_blob,
        max_entries,
        body_limit_bytes,
        sweep_interval,
        vary_headers,
        blob_markers,
    })
}

fn build_purge_settings(purge: RawPurgeSettings) -> Result<PurgeSettings, LoadError> {
    let defaults = CacheConfig::default();

    let eligible_types = match purge.eligible_types {
        Some(types) => types
            .into_iter()
            .filter_map(|name| non_blank(Some(name)))
            .collect(),
        None => defaults.eligible_types,
    };

    let nodes = build_node_settings(purge.nodes.unwrap_or_default())?;

    let node_timeout_ms = purge.node_timeout_ms.unwrap_or(defaults.node_timeout_ms);
    if node_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "purge.node_timeout_ms",
            "must be greater than zero",
        ));
    }

    let interval_ms = purge
        .auto_consume_interval_ms
        .unwrap_or(defaults.auto_consume_interval_ms);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "purge.auto_consume_interval_ms",
            "must be greater than zero",
        ));
    }

    let consume_batch_limit = non_zero_usize(
        purge
            .consume_batch_limit
            .unwrap_or(defaults.consume_batch_limit as u64),
        "purge.consume_batch_limit",
    )?;
    let queue_limit = non_zero_usize(
        purge.queue_limit.unwrap_or(defaults.queue_limit as u64),
        "purge.queue_limit",
    )?;

    let startup_ban = match non_blank(purge.startup_ban) {
        Some(pattern) => {
            BanPredicate::parse(&pattern)
                .map_err(|err| LoadError::invalid("purge.startup_ban", err.to_string()))?;
            Some(pattern)
        }
        None => None,
    };

    Ok(PurgeSettings {
        enabled: purge.enabled.unwrap_or(defaults.purging_enabled),
        eligible_types,
        nodes,
        node_timeout: Duration::from_millis(node_timeout_ms),
        auto_consume_interval: Duration::from_millis(interval_ms),
        consume_batch_limit,
        queue_limit,
        startup_ban,
    })
}

fn build_node_settings(raw: Vec<RawNodeSettings>) -> Result<Vec<NodeSettings>, LoadError> {
    let mut seen = HashSet::with_capacity(raw.len());
    let mut nodes = Vec::with_capacity(raw.len());

    for node in raw {
        let address = non_blank(node.address)
            .ok_or_else(|| LoadError::invalid("purge.nodes", "node address is required"))?;
        let address = parse_http_url(&address)
            .map_err(|reason| LoadError::invalid("purge.nodes", reason))?;
        let id = non_blank(node.id).unwrap_or_else(|| default_node_id(&address));

        if !seen.insert(id.clone()) {
            return Err(LoadError::invalid(
                "purge.nodes",
                format!("duplicate node id `{id}`"),
            ));
        }

        nodes.push(NodeSettings { id, address });
    }

    Ok(nodes)
}

fn build_vhost_settings(vhost: RawVhostSettings) -> Result<VhostSettings, LoadError> {
    let defaults = VirtualHostRewrite::default();

    let marker = non_blank(vhost.marker).unwrap_or_else(|| defaults.marker().to_string());
    if marker.contains('/') {
        return Err(LoadError::invalid(
            "vhost.marker",
            "marker must be a single path segment",
        ));
    }

    let prefix = non_blank(vhost.prefix).unwrap_or_else(|| defaults.prefix().to_string());
    if !prefix.starts_with('/') {
        return Err(LoadError::invalid(
            "vhost.prefix",
            "prefix must be an absolute path",
        ));
    }

    Ok(VhostSettings { marker, prefix })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    node_id: Option<String>,
    host: Option<String>,
    admin_host: Option<String>,
    public_port: Option<u16>,
    admin_port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
    request_body_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    ttl: RawTtlSettings,
    max_entries: Option<u64>,
    body_limit_bytes: Option<u64>,
    sweep_interval_secs: Option<u64>,
    vary_headers: Option<Vec<String>>,
    blob_markers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTtlSettings {
    api: Option<u64>,
    express: Option<u64>,
    blob: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPurgeSettings {
    enabled: Option<bool>,
    eligible_types: Option<Vec<String>>,
    nodes: Option<Vec<RawNodeSettings>>,
    node_timeout_ms: Option<u64>,
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
    queue_limit: Option<u64>,
    startup_ban: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawNodeSettings {
    id: Option<String>,
    address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawVhostSettings {
    marker: Option<String>,
    prefix: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str) -> Result<Url, String> {
    let url = Url::parse(value).map_err(|err| format!("invalid url `{value}`: {err}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}` in `{value}`")),
    }
}

fn default_node_id(address: &Url) -> String {
    match (address.host_str(), address.port_or_known_default()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        _ => address.to_string(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn ttl_seconds(
    value: Option<u64>,
    default: Duration,
    key: &'static str,
) -> Result<Duration, LoadError> {
    match value {
        Some(0) => Err(LoadError::invalid(key, "must be greater than zero")),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
