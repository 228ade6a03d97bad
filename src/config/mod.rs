//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    CacheConfig, CachePolicy, DEFAULT_LOCAL_EXPIRATION_SECS, DEFAULT_OBJECT_CAPACITY,
    DEFAULT_REMOTE_EXPIRATION_SECS, DEFAULT_RESPONSE_CAPACITY_BYTES,
    DEFAULT_RESPONSE_EXPIRATION_SECS, DEFAULT_RESPONSE_MAX_BODY_BYTES,
    DEFAULT_SWEEP_INTERVAL_SECS, builtin_policies,
};

mod cli;

pub use cli::{CacheOverrides, CliArgs, Command, MigrateArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "tiercache";
const ENV_PREFIX: &str = "TIERCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_ENVIRONMENT: &str = "Development";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub app: AppSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
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
pub struct DatabaseSettings {
    /// Without a URL the server runs on in-memory backends.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    /// Deployment environment name, e.g. `Development` or `Production`.
    pub environment: String,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
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

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_migrate_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    app: RawAppSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
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
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(environment) = overrides.app_environment.as_ref() {
            self.app.environment = Some(environment.clone());
        }

        self.apply_cache_overrides(&overrides.cache);
    }

    fn apply_migrate_overrides(&mut self, args: &MigrateArgs) {
        if let Some(url) = args.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(capacity) = overrides.object_capacity {
            self.cache.object_capacity = Some(capacity);
        }
        if let Some(seconds) = overrides.local_expiration_seconds {
            self.cache.local_expiration_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.remote_expiration_seconds {
            self.cache.remote_expiration_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.response_default_expiration_seconds {
            self.cache.response_default_expiration_seconds = Some(seconds);
        }
        if let Some(allow) = overrides.allow_locking {
            self.cache.allow_locking = Some(allow);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            app,
            cache,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let app = build_app_settings(app)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            server,
            logging,
            database,
            app,
            cache,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr =
        parse_socket_addr(&host, port).map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
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

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_app_settings(app: RawAppSettings) -> Result<AppSettings, LoadError> {
    let environment = app
        .environment
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());
    let environment = environment.trim();
    if environment.is_empty() {
        return Err(LoadError::invalid("app.environment", "must not be empty"));
    }

    Ok(AppSettings {
        environment: environment.to_string(),
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let object_capacity = non_zero_u64(
        cache.object_capacity.unwrap_or(DEFAULT_OBJECT_CAPACITY),
        "cache.object_capacity",
    )?;

    let local_expiration = seconds(
        cache
            .local_expiration_seconds
            .unwrap_or(DEFAULT_LOCAL_EXPIRATION_SECS),
        "cache.local_expiration_seconds",
    )?;
    let remote_expiration = seconds(
        cache
            .remote_expiration_seconds
            .unwrap_or(DEFAULT_REMOTE_EXPIRATION_SECS),
        "cache.remote_expiration_seconds",
    )?;
    if local_expiration > remote_expiration {
        return Err(LoadError::invalid(
            "cache.local_expiration_seconds",
            format!(
                "must not exceed cache.remote_expiration_seconds ({}s)",
                remote_expiration.as_secs()
            ),
        ));
    }

    let response_default_expiration = seconds(
        cache
            .response_default_expiration_seconds
            .unwrap_or(DEFAULT_RESPONSE_EXPIRATION_SECS),
        "cache.response_default_expiration_seconds",
    )?;

    let response_capacity_bytes = non_zero_u64(
        cache
            .response_capacity_bytes
            .unwrap_or(DEFAULT_RESPONSE_CAPACITY_BYTES),
        "cache.response_capacity_bytes",
    )?;

    let response_max_body_bytes = match cache.response_max_body_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.response_max_body_bytes",
                "must be greater than zero",
            ));
        }
        Some(bytes) => usize::try_from(bytes).map_err(|_| {
            LoadError::invalid(
                "cache.response_max_body_bytes",
                "value exceeds supported range for usize",
            )
        })?,
        None => DEFAULT_RESPONSE_MAX_BODY_BYTES,
    };

    let sweep_interval = seconds(
        cache
            .sweep_interval_seconds
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        "cache.sweep_interval_seconds",
    )?;

    let policies = build_policies(cache.policies, response_default_expiration)?;

    Ok(CacheConfig {
        object_capacity,
        track_statistics: cache.track_statistics.unwrap_or(true),
        local_expiration,
        remote_expiration,
        response_default_expiration,
        response_capacity_bytes,
        response_max_body_bytes,
        allow_locking: cache.allow_locking.unwrap_or(true),
        sweep_interval,
        policies,
    })
}

/// Configured policies plus each built-in policy the configuration does not
/// override by name.
fn build_policies(
    raw: BTreeMap<String, RawPolicySettings>,
    default_expiration: Duration,
) -> Result<Vec<CachePolicy>, LoadError> {
    let mut policies: Vec<CachePolicy> = builtin_policies()
        .into_iter()
        .filter(|builtin| !raw.contains_key(builtin.name()))
        .map(|builtin| {
            CachePolicy::new(
                builtin.name(),
                builtin.vary_by_query_keys(),
                default_expiration,
            )
        })
        .collect();

    for (name, policy) in raw {
        if name.trim().is_empty() {
            return Err(LoadError::invalid(
                "cache.policies",
                "policy name must not be empty",
            ));
        }
        let expiration = match policy.expiration_seconds {
            Some(0) => {
                return Err(LoadError::invalid(
                    format!("cache.policies.{name}.expiration_seconds"),
                    "must be greater than zero",
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => default_expiration,
        };
        policies.push(CachePolicy::new(
            name,
            policy.vary_by_query.unwrap_or_default(),
            expiration,
        ));
    }

    Ok(policies)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAppSettings {
    environment: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    object_capacity: Option<u64>,
    track_statistics: Option<bool>,
    local_expiration_seconds: Option<u64>,
    remote_expiration_seconds: Option<u64>,
    response_default_expiration_seconds: Option<u64>,
    response_capacity_bytes: Option<u64>,
    response_max_body_bytes: Option<u64>,
    allow_locking: Option<bool>,
    sweep_interval_seconds: Option<u64>,
    policies: BTreeMap<String, RawPolicySettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicySettings {
    vary_by_query: Option<Vec<String>>,
    expiration_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}
