//! Endpoint and timing configuration, selected per deployment environment and
//! overridable through `HOSTWATCH_*` environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConfigError;

/// Path prefix of the monitoring API; stripped to find the health endpoint.
pub const API_PREFIX: &str = "/api/monitor";

/// Transport used to reach the monitoring service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    WebSocket,
    Http,
    None,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionType::WebSocket => "websocket",
            ConnectionType::Http => "http",
            ConnectionType::None => "none",
        })
    }
}

impl FromStr for ConnectionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(ConnectionType::WebSocket),
            "http" => Ok(ConnectionType::Http),
            "none" => Ok(ConnectionType::None),
            other => Err(format!("unknown connection type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Docker,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            "docker" => Ok(Environment::Docker),
            other => Err(ConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub polling_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    /// Retry `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
    /// Upper bound on how long an unfinished poll cycle blocks the next tick.
    pub pending_window_ms: u64,
    pub connect_timeout_ms: u64,
    /// Reconnect attempt `n` waits `n * reconnect_interval_ms`.
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reinit_debounce_ms: u64,
    pub initial_transport: ConnectionType,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            api_base_url: format!("http://localhost:8002{API_PREFIX}"),
            ws_base_url: format!("ws://localhost:8002{API_PREFIX}/ws"),
            polling_interval_ms: 3000,
            request_timeout_ms: 5000,
            max_retries: 3,
            retry_backoff_ms: 1000,
            pending_window_ms: 3000,
            connect_timeout_ms: 5000,
            reconnect_interval_ms: 3000,
            max_reconnect_attempts: 5,
            reinit_debounce_ms: 500,
            initial_transport: ConnectionType::WebSocket,
        }
    }
}

fn derived_ws_url(host: &str, tls: bool) -> String {
    let scheme = if tls { "wss" } else { "ws" };
    format!("{scheme}://{host}{API_PREFIX}/ws")
}

impl MonitorConfig {
    /// Defaults for a deployment. Production and docker deployments sit behind
    /// a reverse proxy on `host`, so both URLs are derived from it.
    pub fn for_environment(env: Environment, host: &str, tls: bool) -> Self {
        match env {
            Environment::Development => Self::default(),
            Environment::Production | Environment::Docker => {
                let scheme = if tls { "https" } else { "http" };
                Self {
                    api_base_url: format!("{scheme}://{host}{API_PREFIX}"),
                    ws_base_url: derived_ws_url(host, tls),
                    request_timeout_ms: 8000,
                    ..Self::default()
                }
            }
        }
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let env = match get("HOSTWATCH_ENV") {
            Some(v) => v.parse()?,
            None => Environment::Development,
        };
        let host = get("HOSTWATCH_HOST").unwrap_or_else(|| "localhost:8002".into());
        let tls = matches!(
            get("HOSTWATCH_TLS").as_deref(),
            Some("1") | Some("true") | Some("yes")
        );

        let mut cfg = Self::for_environment(env, &host, tls);
        if let Some(api) = get("HOSTWATCH_API_BASE_URL") {
            cfg.api_base_url = api;
        }
        match get("HOSTWATCH_WS_BASE_URL").as_deref() {
            Some("auto") => cfg.ws_base_url = derived_ws_url(&host, tls),
            Some(ws) => cfg.ws_base_url = ws.to_string(),
            None => {}
        }
        if let Some(v) = get("HOSTWATCH_POLLING_INTERVAL_MS") {
            cfg.polling_interval_ms = parse_num("HOSTWATCH_POLLING_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("HOSTWATCH_REQUEST_TIMEOUT_MS") {
            cfg.request_timeout_ms = parse_num("HOSTWATCH_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("HOSTWATCH_MAX_RETRIES") {
            cfg.max_retries = parse_num("HOSTWATCH_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("HOSTWATCH_TRANSPORT") {
            cfg.initial_transport = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "HOSTWATCH_TRANSPORT".into(),
                value: v.clone(),
            })?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("ws_base_url", &self.ws_base_url, &["ws", "wss"])?;
        if self.polling_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "polling_interval_ms".into(),
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// `{base}/health`, where base is the API URL without its `/api/monitor` suffix.
    pub fn health_url(&self) -> String {
        let trimmed = self.api_base_url.trim_end_matches('/');
        let base = match trimmed.find(API_PREFIX) {
            Some(idx) => &trimmed[..idx],
            None => trimmed,
        };
        format!("{base}/health")
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pending_window(&self) -> Duration {
        Duration::from_millis(self.pending_window_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn reinit_debounce(&self) -> Duration {
        Duration::from_millis(self.reinit_debounce_ms)
    }
}

/// WebSocket URL served next to an API base URL: `http(s)://h/p` becomes
/// `ws(s)://h/p/ws`.
pub fn ws_url_for(api_base_url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        field: "api_base_url",
        value: api_base_url.to_string(),
        reason,
    };
    let mut url = Url::parse(api_base_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch to {scheme}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason,
    };
    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(invalid(format!("expected scheme {}", schemes.join("/"))));
    }
    Ok(())
}
