//! Service configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`ServiceConfig::default()`]
//! 2. If the config file exists (`STRIDER_CONFIG`, else
//!    `~/.strider/config.json`), deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn, Level};

use strider_engine::ExecutorConfig;
use strider_telemetry::{LogFormat, TelemetryConfig};
use strider_upstream::UpstreamConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{key} = {value} is outside {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

// Inclusive bounds, shared by the file and env loaders.
const UPSTREAM_TIMEOUT_MS: (u64, u64) = (100, 300_000);
const PING_INTERVAL_MS: (u64, u64) = (100, 600_000);
const LIVENESS_INTERVAL_MS: (u64, u64) = (100, 600_000);
const RECONCILE_INTERVAL_MS: (u64, u64) = (1_000, 3_600_000);
const STOP_ECHO_MS: (u64, u64) = (0, 60_000);
const MAX_SEND_QUEUE: (u64, u64) = (1, 65_536);
const ERROR_BUDGET: (u64, u64) = (0, 1_000);
const PORT: (u64, u64) = (1, 65_535);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    /// Bind address.
    pub host: String,
    pub port: u16,
    pub upstream_base_url: String,
    pub user_agent: String,
    pub upstream_timeout_ms: u64,
    /// SQLite file for persisted user state.
    pub database_path: String,
    /// File holding the base64 key that seals inbound tokens. Tokens are
    /// accepted as plain text when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_key_path: Option<String>,
    /// App-level `"ping"` text frame period.
    pub ping_interval_ms: u64,
    /// Liveness sweep period; a viewer silent for a whole period is dropped.
    pub liveness_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    /// Delay before a stop request is echoed back to the viewer.
    pub stop_echo_delay_ms: u64,
    pub max_send_queue: usize,
    pub step_error_budget: u32,
    pub log_level: String,
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let upstream = UpstreamConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            upstream_base_url: upstream.base_url,
            user_agent: upstream.user_agent,
            upstream_timeout_ms: upstream.request_timeout.as_millis() as u64,
            database_path: strider_dir().join("strider.db").display().to_string(),
            token_key_path: None,
            ping_interval_ms: 10_000,
            liveness_interval_ms: 30_000,
            reconcile_interval_ms: 30_000,
            stop_echo_delay_ms: 5_000,
            max_send_queue: 256,
            step_error_budget: ExecutorConfig::default().error_budget,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Reject numeric settings the runtime cannot work with, such as a zero
    /// tick period or an empty send queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("upstreamTimeoutMs", self.upstream_timeout_ms, UPSTREAM_TIMEOUT_MS),
            ("pingIntervalMs", self.ping_interval_ms, PING_INTERVAL_MS),
            ("livenessIntervalMs", self.liveness_interval_ms, LIVENESS_INTERVAL_MS),
            ("reconcileIntervalMs", self.reconcile_interval_ms, RECONCILE_INTERVAL_MS),
            ("stopEchoDelayMs", self.stop_echo_delay_ms, STOP_ECHO_MS),
            ("maxSendQueue", self.max_send_queue as u64, MAX_SEND_QUEUE),
            ("stepErrorBudget", u64::from(self.step_error_budget), ERROR_BUDGET),
        ];
        for (key, value, (min, max)) in checks {
            if !(min..=max).contains(&value) {
                return Err(ConfigError::OutOfRange { key, value, min, max });
            }
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn stop_echo_delay(&self) -> Duration {
        Duration::from_millis(self.stop_echo_delay_ms)
    }

    pub fn upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            base_url: self.upstream_base_url.clone(),
            user_agent: self.user_agent.clone(),
            request_timeout: Duration::from_millis(self.upstream_timeout_ms),
            ..UpstreamConfig::default()
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            error_budget: self.step_error_budget,
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.log_level.parse().unwrap_or(Level::INFO),
            format: LogFormat::parse(&self.log_format).unwrap_or_default(),
            ..TelemetryConfig::default()
        }
    }
}

/// `~/.strider`, falling back to `/tmp` without a home directory.
pub fn strider_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".strider")
}

pub fn config_path() -> PathBuf {
    std::env::var("STRIDER_CONFIG")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| strider_dir().join("config.json"))
}

/// Load `path` (usually [`config_path`]) with env var overrides.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let mut config = load_config_from_path(path)?;
    apply_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Defaults with the file at `path` merged over them, then validated. A
/// missing file is not an error.
pub fn load_config_from_path(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let defaults = serde_json::to_value(ServiceConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let config: ServiceConfig = serde_json::from_value(merged)?;
    config.validate()?;
    Ok(config)
}

/// Objects merge per key; everything else is replaced. Nulls in `source`
/// are skipped.
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
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `STRIDER_*` overrides read through `lookup`. Out-of-range or
/// unparsable values are ignored with a warning.
pub fn apply_overrides(config: &mut ServiceConfig, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env { lookup };

    // Plain PORT first so STRIDER_PORT wins when both are set.
    if let Some(v) = env.u64_in("PORT", PORT) {
        config.port = v as u16;
    }
    if let Some(v) = env.u64_in("STRIDER_PORT", PORT) {
        config.port = v as u16;
    }
    if let Some(v) = env.string("STRIDER_HOST") {
        config.host = v;
    }
    if let Some(v) = env.string("STRIDER_UPSTREAM_URL") {
        config.upstream_base_url = v;
    }
    if let Some(v) = env.string("STRIDER_USER_AGENT") {
        config.user_agent = v;
    }
    if let Some(v) = env.u64_in("STRIDER_UPSTREAM_TIMEOUT_MS", UPSTREAM_TIMEOUT_MS) {
        config.upstream_timeout_ms = v;
    }
    if let Some(v) = env.string("STRIDER_DB") {
        config.database_path = v;
    }
    if let Some(v) = env.string("STRIDER_TOKEN_KEY") {
        config.token_key_path = Some(v);
    }
    if let Some(v) = env.u64_in("STRIDER_PING_INTERVAL_MS", PING_INTERVAL_MS) {
        config.ping_interval_ms = v;
    }
    if let Some(v) = env.u64_in("STRIDER_LIVENESS_INTERVAL_MS", LIVENESS_INTERVAL_MS) {
        config.liveness_interval_ms = v;
    }
    if let Some(v) = env.u64_in("STRIDER_RECONCILE_INTERVAL_MS", RECONCILE_INTERVAL_MS) {
        config.reconcile_interval_ms = v;
    }
    if let Some(v) = env.u64_in("STRIDER_STOP_ECHO_MS", STOP_ECHO_MS) {
        config.stop_echo_delay_ms = v;
    }
    if let Some(v) = env.u64_in("STRIDER_MAX_SEND_QUEUE", MAX_SEND_QUEUE) {
        config.max_send_queue = v as usize;
    }
    if let Some(v) = env.u64_in("STRIDER_ERROR_BUDGET", ERROR_BUDGET) {
        config.step_error_budget = v as u32;
    }
    if let Some(v) = env.string("STRIDER_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = env.string("STRIDER_LOG_FORMAT") {
        config.log_format = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64_in(&self, name: &str, (min, max): (u64, u64)) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid numeric env var, ignoring");
        }
        result
    }
}
