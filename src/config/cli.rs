use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the tiercache binary.
#[derive(Debug, Parser)]
#[command(name = "tiercache", version, about = "Tiered cache demo server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "TIERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Apply database migrations and exit.
    #[command(name = "migrate")]
    Migrate(MigrateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

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

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the deployment environment name reported by `/env`.
    #[arg(long = "app-environment", value_name = "NAME")]
    pub app_environment: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the hybrid cache's local tier capacity.
    #[arg(long = "cache-object-capacity", value_name = "UNITS")]
    pub object_capacity: Option<u64>,

    /// Override the local tier expiration.
    #[arg(long = "cache-local-expiration-seconds", value_name = "SECONDS")]
    pub local_expiration_seconds: Option<u64>,

    /// Override the remote tier expiration.
    #[arg(long = "cache-remote-expiration-seconds", value_name = "SECONDS")]
    pub remote_expiration_seconds: Option<u64>,

    /// Override the default response cache expiration.
    #[arg(long = "cache-response-expiration-seconds", value_name = "SECONDS")]
    pub response_default_expiration_seconds: Option<u64>,

    /// Toggle coalescing of concurrent response cache misses.
    #[arg(
        long = "cache-allow-locking",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub allow_locking: Option<bool>,
}
