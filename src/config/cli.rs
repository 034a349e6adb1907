use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the cachegate binary.
#[derive(Debug, Parser)]
#[command(
    name = "cachegate",
    version,
    about = "Reverse-proxy cache and invalidation coordinator"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "CACHEGATE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the public and admin listeners.
    Serve(Box<ServeArgs>),
    /// Purge one path on every configured node.
    Purge(PurgeArgs),
    /// Ban every entry matching a pattern on every configured node.
    Ban(BanArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override this node's identifier.
    #[arg(long = "node-id", value_name = "ID")]
    pub node_id: Option<String>,

    /// Override the public listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the administrative listener host.
    #[arg(long = "server-admin-host", value_name = "HOST")]
    pub server_admin_host: Option<String>,

    /// Override the public listener port.
    #[arg(long = "server-public-port", value_name = "PORT")]
    pub public_port: Option<u16>,

    /// Override the administrative listener port.
    #[arg(long = "server-admin-port", value_name = "PORT")]
    pub admin_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the origin base URL.
    #[arg(long = "origin-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub origin_url: Option<String>,

    /// Toggle response caching.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Toggle PURGE/BAN handling and automatic invalidation.
    #[arg(
        long = "purge-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub purge_enabled: Option<bool>,

    /// Ban pattern broadcast once the listeners are up.
    #[arg(long = "startup-ban", value_name = "PATTERN")]
    pub startup_ban: Option<String>,

    #[command(flatten)]
    pub cluster: ClusterOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClusterOverrides {
    /// Replace the configured nodes (`id=url`, repeatable).
    #[arg(long = "node", value_name = "ID=URL")]
    pub nodes: Vec<String>,

    /// Override the per-node broadcast timeout.
    #[arg(long = "node-timeout-ms", value_name = "MILLIS")]
    pub node_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct PurgeArgs {
    /// Path to purge, e.g. `/++api++/page`.
    pub path: String,

    /// Re-send once to the nodes that failed.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub retry: bool,

    #[command(flatten)]
    pub cluster: ClusterOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct BanArgs {
    /// Ban pattern, e.g. `obj.status != 0`.
    pub pattern: String,

    /// Re-send once to the nodes that failed.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub retry: bool,

    #[command(flatten)]
    pub cluster: ClusterOverrides,
}
