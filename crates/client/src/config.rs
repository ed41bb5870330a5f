use std::{path::PathBuf, time::Duration};

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "tunnel-client", version, about = "Forwards a tunnel to a local HTTP service")]
pub struct Cli {
    /// Optional TOML config file; environment variables override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    relay_host: Option<String>,
    relay_port: Option<u16>,
    token: Option<String>,
    local_port: Option<u16>,
    max_frame_bytes: Option<usize>,
    request_timeout_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    heartbeat_timeout_ms: Option<u64>,
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub relay_host: String,
    pub relay_port: u16,
    pub token: String,
    pub local_port: u16,
    pub max_frame_bytes: usize,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub log_level: String,
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid client configuration: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError(format!("reading {}: {}", path.display(), e)))?;
                toml::from_str(&raw).map_err(|e| ConfigError(e.to_string()))?
            }
            None => FileConfig::default(),
        };

        let relay_host = env_or("TUNNEL_CLIENT_RELAY_HOST", file.relay_host)
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let relay_port = env_parsed_or("TUNNEL_CLIENT_RELAY_PORT", file.relay_port, 7071)?;

        let token = env_or("TUNNEL_CLIENT_TOKEN", file.token)
            .ok_or_else(|| ConfigError("TUNNEL_CLIENT_TOKEN is required".into()))?;
        if !is_valid_token(&token) {
            return Err(ConfigError(
                "token must be 32 lowercase hex characters".into(),
            ));
        }

        let local_port = env_parsed_or("TUNNEL_CLIENT_LOCAL_PORT", file.local_port, 0)?;
        if local_port == 0 {
            return Err(ConfigError("TUNNEL_CLIENT_LOCAL_PORT is required".into()));
        }

        let max_frame_bytes = env_parsed_or(
            "TUNNEL_CLIENT_MAX_FRAME_BYTES",
            file.max_frame_bytes,
            10 * 1024 * 1024,
        )?;

        let request_timeout_ms =
            env_parsed_or("TUNNEL_REQUEST_TIMEOUT_MS", file.request_timeout_ms, 30_000)?;

        let heartbeat_interval_ms = env_parsed_or(
            "TUNNEL_HEARTBEAT_INTERVAL_MS",
            file.heartbeat_interval_ms,
            15_000,
        )?;

        let heartbeat_timeout_ms = env_parsed_or(
            "TUNNEL_HEARTBEAT_TIMEOUT_MS",
            file.heartbeat_timeout_ms,
            45_000,
        )?;

        let log_level =
            env_or("TUNNEL_LOG_LEVEL", file.log_level).unwrap_or_else(|| "info".to_string());

        Ok(Self {
            relay_host,
            relay_port,
            token,
            local_port,
            max_frame_bytes,
            request_timeout: Duration::from_millis(request_timeout_ms),
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
            log_level,
        })
    }
}

fn is_valid_token(token: &str) -> bool {
    token.len() == 32 && token.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
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
            .map_err(|_| ConfigError(format!("{} must be numeric", name))),
        Err(_) => Ok(fallback.unwrap_or(default)),
    }
}
