//! Environment-driven configuration for the relay binary, with an optional
//! `--config` TOML override for local development. Environment variables
//! always win over the file, matching the layering the client binary uses.

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(
    name = "relay-server",
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Optional TOML file providing the same keys as the environment; env
    /// vars still take precedence over anything set here.
    #[arg(long)]
    pub config: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    relay_internal_secret: Option<String>,
    http_host: Option<String>,
    http_port: Option<u16>,
    control_port: Option<u16>,
    max_request_size: Option<usize>,
    rate_limit_requests: Option<u64>,
    request_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    alias_cache_ttl_ms: Option<u64>,
    alias_cache_neg_ttl_ms: Option<u64>,
    log_level: Option<String>,
    alias_resolver_url: Option<String>,
    reserved_aliases: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid relay configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub struct Config {
    /// Shared secret that gates the `/internal/` endpoints; `None` disables
    /// both the introspection endpoints and the alias resolution shim.
    pub internal_secret: Option<String>,
    pub http_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub max_request_size: usize,
    pub rate_limit_requests: u64,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub alias_cache_ttl: Duration,
    pub alias_cache_neg_ttl: Duration,
    pub log_level: String,
    pub alias_resolver_url: Option<String>,
    pub reserved_aliases: Vec<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(&Cli::parse())
    }

    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError(format!("reading {path}: {e}")))?;
                toml::from_str(&raw).map_err(|e| ConfigError(e.to_string()))?
            }
            None => FileConfig::default(),
        };

        let http_host = env_or("TUNNEL_RELAY_HTTP_HOST", None).unwrap_or_else(|| "127.0.0.1".into());
        let http_port = env_parsed_or("TUNNEL_RELAY_HTTP", file.http_port, 7070)?;
        let control_port = env_parsed_or("TUNNEL_RELAY_CTRL", file.control_port, 7071)?;

        let http_addr = format!("{http_host}:{http_port}")
            .parse()
            .map_err(|e| ConfigError(format!("invalid ingress bind address: {e}")))?;
        let control_addr = format!("{http_host}:{control_port}")
            .parse()
            .map_err(|e| ConfigError(format!("invalid control bind address: {e}")))?;

        Ok(Self {
            internal_secret: env_or("RELAY_INTERNAL_SECRET", file.relay_internal_secret),
            http_addr,
            control_addr,
            max_request_size: env_parsed_or(
                "TUNNEL_MAX_REQUEST_SIZE",
                file.max_request_size,
                10 * 1024 * 1024,
            )?,
            rate_limit_requests: env_parsed_or(
                "TUNNEL_RATE_LIMIT_REQUESTS",
                file.rate_limit_requests,
                1000,
            )?,
            request_timeout: Duration::from_millis(env_parsed_or(
                "TUNNEL_REQUEST_TIMEOUT_MS",
                file.request_timeout_ms,
                30_000,
            )?),
            heartbeat_interval: Duration::from_millis(env_parsed_or(
                "TUNNEL_HEARTBEAT_INTERVAL_MS",
                file.heartbeat_interval_ms,
                15_000,
            )?),
            heartbeat_timeout: Duration::from_millis(env_parsed_or(
                "TUNNEL_HEARTBEAT_TIMEOUT_MS",
                file.heartbeat_timeout_ms,
                45_000,
            )?),
            alias_cache_ttl: Duration::from_millis(env_parsed_or(
                "ALIAS_CACHE_TTL_MS",
                file.alias_cache_ttl_ms,
                60_000,
            )?),
            alias_cache_neg_ttl: Duration::from_millis(env_parsed_or(
                "ALIAS_CACHE_NEG_TTL_MS",
                file.alias_cache_neg_ttl_ms,
                10_000,
            )?),
            log_level: env_or("TUNNEL_LOG_LEVEL", file.log_level).unwrap_or_else(|| "info".into()),
            alias_resolver_url: env_or("ALIAS_RESOLVER_URL", file.alias_resolver_url),
            reserved_aliases: parse_reserved_aliases(env_or(
                "TUNNEL_RESERVED_ALIASES",
                file.reserved_aliases,
            )),
        })
    }
}

fn parse_reserved_aliases(raw: Option<String>) -> Vec<String> {
    let mut reserved: Vec<String> = ["internal", "www", "api", "admin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if let Some(extra) = raw {
        reserved.extend(
            extra
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty()),
        );
    }

    reserved
}

fn env_or(name: &str, fallback: Option<String>) -> Option<String> {
    std::env::var(name).ok().or(fallback)
}

fn env_parsed_or<T: std::str::FromStr>(
    name: &str,
    fallback: Option<T>,
    default: T,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("{name} must be numeric"))),
        Err(_) => Ok(fallback.unwrap_or(default)),
    }
}
