// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Database pool sizing lives in `db::pool::PoolConfig`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::db::pool::PoolConfig;

const DEFAULT_PORT: u16 = 8086;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
const DEFAULT_LINE_ID: &str = "0";

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. Without one the in-memory store is used.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `bittle_server=debug`).
    pub log_filter: String,
    /// Upper bound on one request's processing time.
    pub request_timeout: Duration,
    /// Largest accepted inbound text frame.
    pub max_frame_bytes: usize,
    /// Seed line id for files created without an explicit `lineId`.
    pub default_line_id: String,
    pub pool: PoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BITTLE_HOST` | `0.0.0.0` |
    /// | `BITTLE_PORT` | `8086` |
    /// | `BITTLE_DATABASE_URL` | *(none: in-memory store)* |
    /// | `BITTLE_LOG_FILTER` | `info` |
    /// | `BITTLE_REQUEST_TIMEOUT_MS` | `30000` |
    /// | `BITTLE_MAX_FRAME_BYTES` | `262144` |
    /// | `BITTLE_DEFAULT_LINE_ID` | `0` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("BITTLE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("BITTLE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("BITTLE_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let log_filter = env("BITTLE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let request_timeout_ms = env("BITTLE_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        let max_frame_bytes = env("BITTLE_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let default_line_id = env("BITTLE_DEFAULT_LINE_ID")
            .ok()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_LINE_ID.into());

        Self {
            listen_addr,
            database_url,
            log_filter,
            request_timeout: Duration::from_millis(request_timeout_ms),
            max_frame_bytes,
            default_line_id,
            pool: PoolConfig::from_env_fn(&env),
        }
    }
}
