//! Hub configuration.
//!
//! Loading flow:
//! 1. Start with [`HubConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its JSON over the defaults
//! 3. Apply environment variable overrides (highest priority)
//!
//! Objects merge per key; arrays and primitives are replaced; `null` in the
//! file keeps the default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub server: ServerSection,
    pub rate_limit: RateLimitSection,
    pub database: DatabaseSection,
    pub session: SessionSection,
    pub telemetry: TelemetrySection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Capacity of each connection's outbound queue. A member whose queue
    /// is full when the dispatcher writes to it is evicted.
    pub max_send_queue: usize,
    /// Capacity of the protocol handler -> dispatcher queue.
    pub broadcast_queue: usize,
    /// Largest inbound frame accepted before the connection is closed.
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            max_send_queue: 256,
            broadcast_queue: 1024,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    /// Requests admitted per client address per window.
    pub limit: u32,
    pub window_ms: u64,
    /// Key on `X-Forwarded-For` / `X-Real-IP` instead of the socket peer.
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 20,
            window_ms: 1000,
            trust_proxy_headers: false,
        }
    }
}

impl RateLimitSection {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./db/app.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub cookie_name: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            cookie_name: "session_id".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub level: String,
    pub json: bool,
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: true,
            log_db_path: None,
        }
    }
}

impl HubConfig {
    /// Load from an optional JSON file, then apply process env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        apply_env_overrides(&mut config, |name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults deep-merged with the file at `path`, without env overrides.
    pub fn from_file(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;
        let merged = match path {
            Some(path) if path.exists() => {
                debug!(?path, "loading config file");
                let content = std::fs::read_to_string(path)?;
                let user: Value = serde_json::from_str(&content)?;
                deep_merge(defaults, user)
            }
            Some(path) => {
                debug!(?path, "config file not found, using defaults");
                defaults
            }
            None => defaults,
        };
        Ok(serde_json::from_value(merged)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_send_queue == 0 || self.server.broadcast_queue == 0 {
            return Err(ConfigError::InvalidValue("queue capacities must be non-zero".into()));
        }
        if self.rate_limit.enabled && (self.rate_limit.limit == 0 || self.rate_limit.window_ms == 0) {
            return Err(ConfigError::InvalidValue(
                "rate_limit.limit and rate_limit.window_ms must be non-zero".into(),
            ));
        }
        if self.session.cookie_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("session.cookie_name is empty".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup` (the process env in production).
/// Unparseable or out-of-range values are logged and ignored.
pub fn apply_env_overrides<F>(config: &mut HubConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("ECHOHUB_HOST") {
        config.server.host = v;
    }
    if let Some(v) = env.parsed("PORT", |s| parse_range(s, 1u16, u16::MAX)) {
        config.server.port = v;
    }
    if let Some(v) = env.parsed("ECHOHUB_PORT", |s| parse_range(s, 1u16, u16::MAX)) {
        config.server.port = v;
    }
    if let Some(v) = env.string("ECHOHUB_DB_PATH") {
        config.database.path = PathBuf::from(v);
    }
    if let Some(v) = env.parsed("ECHOHUB_RATE_LIMIT", |s| parse_range(s, 1u32, 1_000_000)) {
        config.rate_limit.limit = v;
    }
    if let Some(v) = env.parsed("ECHOHUB_RATE_WINDOW_MS", |s| parse_range(s, 1u64, 3_600_000)) {
        config.rate_limit.window_ms = v;
    }
    if let Some(v) = env.parsed("ECHOHUB_RATE_LIMIT_ENABLED", parse_bool) {
        config.rate_limit.enabled = v;
    }
    if let Some(v) = env.string("ECHOHUB_LOG_LEVEL") {
        config.telemetry.level = v;
    }
    if let Some(v) = env.parsed("ECHOHUB_LOG_JSON", parse_bool) {
        config.telemetry.json = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let raw = self.string(name)?;
        let parsed = parse(raw.trim());
        if parsed.is_none() {
            tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
        }
        parsed
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
