//! Server configuration loaded from environment variables.
//!
//! Configuration is captured once at startup into an immutable
//! [`ServerConfig`] that is handed to every component constructor. There are
//! no mutable process-wide settings beyond the metrics registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Deployment environment. Development enables the Echo provider and gRPC
/// reflection; production denies the Echo downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Role attached to an authenticated API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Upstream Gemini configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API key; absent means Gemini cannot be constructed and the factory
    /// falls back to Echo.
    pub api_key: Option<String>,
    /// Model name sent to the generateContent endpoint.
    pub model: String,
    /// Max output tokens per call, capped at 8192.
    pub max_output_tokens: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_GEMINI_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 2048;
const MAX_OUTPUT_TOKENS_CEILING: u32 = 8192;

/// Immutable server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// gRPC listen port.
    pub port: u16,
    pub environment: Environment,
    pub tls_cert_file: PathBuf,
    pub tls_key_file: PathBuf,
    /// API key to role map. Empty means every authenticated endpoint fails.
    pub api_keys: HashMap<String, Role>,
    /// Per-identity daily call cap.
    pub daily_call_limit: u32,
    /// Janitor tick period.
    pub session_cleanup_interval: Duration,
    /// Idle TTL after which a session is swept.
    pub session_idle_timeout: Duration,
    /// Token bucket refill rate in tokens per second.
    pub rate_limit_rps: f64,
    /// Token bucket capacity.
    pub rate_limit_burst: u32,
    pub max_sessions: usize,
    pub max_messages_per_session: usize,
    pub max_session_size_bytes: usize,
    /// Upper bound on a single generated reply, in bytes.
    pub max_response_size_bytes: usize,
    /// Port for the Prometheus metrics HTTP listener.
    pub metrics_port: u16,
    pub gemini: GeminiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            environment: Environment::Development,
            tls_cert_file: PathBuf::from("certs/server.crt"),
            tls_key_file: PathBuf::from("certs/server.key"),
            api_keys: HashMap::new(),
            daily_call_limit: 100,
            session_cleanup_interval: Duration::from_secs(300),
            session_idle_timeout: Duration::from_secs(1800),
            rate_limit_rps: 10.0,
            rate_limit_burst: 20,
            max_sessions: 1000,
            max_messages_per_session: 100,
            max_session_size_bytes: 100 * 1024,
            max_response_size_bytes: 50 * 1024,
            metrics_port: 9090,
            gemini: GeminiConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the environment. PORT, APP_ENV,
    /// SESSION_CLEANUP_INTERVAL and SESSION_IDLE_TIMEOUT are required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = required("PORT")?;
        let port = parse_var("PORT", &port, |v| v.parse::<u16>().ok())?;

        let env_raw = required("APP_ENV")?;
        let environment = match env_raw.as_str() {
            "development" => Environment::Development,
            "production" => Environment::Production,
            _ => {
                return Err(ConfigError::Invalid {
                    var: "APP_ENV",
                    value: env_raw,
                    reason: "must be development or production".into(),
                })
            }
        };

        let cleanup_raw = required("SESSION_CLEANUP_INTERVAL")?;
        let session_cleanup_interval =
            parse_var("SESSION_CLEANUP_INTERVAL", &cleanup_raw, parse_duration)?;

        let idle_raw = required("SESSION_IDLE_TIMEOUT")?;
        let session_idle_timeout = parse_var("SESSION_IDLE_TIMEOUT", &idle_raw, parse_duration)?;

        let rate_limit_rps = optional_parsed("RATE_LIMIT_RPS", 10.0, |v| {
            v.parse::<f64>().ok().filter(|rps| *rps > 0.0)
        })?;
        let rate_limit_burst = optional_parsed("RATE_LIMIT_BURST", 20, |v| {
            v.parse::<u32>().ok().filter(|b| *b > 0)
        })?;

        let daily_call_limit = optional_parsed("DAILY_CALL_LIMIT", 100, |v| {
            v.parse::<u32>().ok().filter(|l| *l > 0)
        })?;

        let max_sessions = optional_parsed("MAX_SESSIONS", 1000, |v| {
            v.parse::<usize>().ok().filter(|n| *n > 0)
        })?;
        let max_messages_per_session = optional_parsed("MAX_MESSAGES_PER_SESSION", 100, |v| {
            v.parse::<usize>().ok().filter(|n| *n > 0)
        })?;
        let max_session_size_kb = optional_parsed("MAX_SESSION_SIZE_KB", 100, |v| {
            v.parse::<usize>().ok().filter(|n| *n > 0)
        })?;
        let max_response_size_kb = optional_parsed("MAX_RESPONSE_SIZE_KB", 50, |v| {
            v.parse::<usize>().ok().filter(|n| *n > 0 && *n <= 1024)
        })?;

        let metrics_port = optional_parsed("METRICS_PORT", 9090, |v| {
            v.parse::<u16>().ok().filter(|p| *p > 0)
        })?;

        Ok(Self {
            port,
            environment,
            tls_cert_file: env_or("TLS_CERT_FILE", "certs/server.crt").into(),
            tls_key_file: env_or("TLS_KEY_FILE", "certs/server.key").into(),
            api_keys: parse_api_keys(&std::env::var("API_KEYS").unwrap_or_default()),
            daily_call_limit,
            session_cleanup_interval,
            session_idle_timeout,
            rate_limit_rps,
            rate_limit_burst,
            max_sessions,
            max_messages_per_session,
            max_session_size_bytes: max_session_size_kb * 1024,
            max_response_size_bytes: max_response_size_kb * 1024,
            metrics_port,
            gemini: GeminiConfig {
                api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
                model: env_or("GEMINI_MODEL", DEFAULT_GEMINI_MODEL),
                max_output_tokens: gemini_max_output_tokens(),
            },
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(var)),
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(
    var: &'static str,
    value: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    parse(value).ok_or_else(|| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: "could not be parsed".into(),
    })
}

fn optional_parsed<T>(
    var: &'static str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => parse_var(var, &raw, parse),
        _ => Ok(default),
    }
}

/// Parse `API_KEYS`: comma-separated tokens, each optionally suffixed with
/// `:admin`. Whitespace around entries is ignored, as are empty segments.
fn parse_api_keys(raw: &str) -> HashMap<String, Role> {
    let mut keys = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.strip_suffix(":admin") {
            Some(key) if !key.is_empty() => keys.insert(key.to_string(), Role::Admin),
            _ => keys.insert(entry.to_string(), Role::User),
        };
    }
    keys
}

/// Parse a duration value: either a bare number of seconds, or a number with
/// an `ms`, `s`, `m` or `h` suffix.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (digits, unit) = raw.split_at(raw.find(|c: char| !c.is_ascii_digit())?);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// GEMINI_MAX_OUTPUT_TOKENS override; out-of-range values fall back to the
/// default silently, matching a cap of 8192.
fn gemini_max_output_tokens() -> u32 {
    std::env::var("GEMINI_MAX_OUTPUT_TOKENS")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|n| *n > 0 && *n <= MAX_OUTPUT_TOKENS_CEILING)
        .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS)
}
