//! Prometheus metrics for the chat proxy.
//!
//! All counters are process-wide and lock-free; gauges describing business
//! state are refreshed by [`run_updater`]. Identity keys never appear as
//! label values, only short hashes of them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ServerConfig;
use crate::quota::QuotaTracker;
use crate::session::SessionStore;

pub mod http;

/// How often business gauges are refreshed.
const UPDATE_INTERVAL: Duration = Duration::from_secs(30);

lazy_static! {
    /// Global Prometheus registry for proxy metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Request duration histogram with method label
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "Duration of gRPC requests in seconds")
            .namespace("termchat")
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method"]
    ).expect("metric can be created");

    /// gRPC errors by method and canonical code
    pub static ref RPC_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("rpc_errors_total", "Total number of gRPC errors by method and code")
            .namespace("termchat"),
        &["method", "code"]
    ).expect("metric can be created");

    // ============== Provider Metrics ==============

    /// LLM call duration histogram with provider label
    pub static ref LLM_CALL_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("llm_call_duration_seconds", "Duration of LLM provider calls in seconds")
            .namespace("termchat")
            .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0]),
        &["provider"]
    ).expect("metric can be created");

    /// LLM provider errors by provider and error class
    pub static ref LLM_ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("llm_errors_total", "Total number of LLM provider errors")
            .namespace("termchat"),
        &["provider", "error_type"]
    ).expect("metric can be created");

    // ============== Session Metrics ==============

    /// Number of currently active sessions
    pub static ref ACTIVE_SESSIONS: Gauge = Gauge::with_opts(
        Opts::new("active_sessions", "Number of currently active sessions")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Total sessions created over the process lifetime
    pub static ref SESSIONS_CREATED_TOTAL: Counter = Counter::with_opts(
        Opts::new("sessions_created_total", "Total number of sessions created")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Aggregate estimated session memory (no per-session labels, which
    /// would be unbounded cardinality)
    pub static ref TOTAL_SESSION_MEMORY_BYTES: Gauge = Gauge::with_opts(
        Opts::new("total_session_memory_bytes", "Total memory usage across all sessions in bytes")
            .namespace("termchat")
    ).expect("metric can be created");

    // ============== Admission Metrics ==============

    /// Requests rejected by the token bucket
    pub static ref RATE_LIMIT_EXCEEDED_TOTAL: Counter = Counter::with_opts(
        Opts::new("rate_limit_exceeded_total", "Total number of rate limit exceeded responses")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Number of configured API keys
    pub static ref API_KEYS_TOTAL: Gauge = Gauge::with_opts(
        Opts::new("api_keys_total", "Total number of configured API keys")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Keys that have reached today's limit
    pub static ref API_KEYS_OVER_LIMIT: Gauge = Gauge::with_opts(
        Opts::new("api_keys_over_limit", "Number of API keys that have exceeded their daily limit")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Configured daily call limit
    pub static ref DAILY_CALL_LIMIT: Gauge = Gauge::with_opts(
        Opts::new("daily_call_limit", "Configured daily call limit per API key")
            .namespace("termchat")
    ).expect("metric can be created");

    /// Calls made today, labelled by key hash for bounded cardinality
    pub static ref API_CALLS_TODAY: GaugeVec = GaugeVec::new(
        Opts::new("api_calls_today", "Number of API calls made today by key hash")
            .namespace("termchat"),
        &["key_hash"]
    ).expect("metric can be created");

    // ============== Server Info ==============

    /// Server limits exposed as labels
    pub static ref SERVER_CONFIG_INFO: GaugeVec = GaugeVec::new(
        Opts::new("server_config_info", "Server configuration information as labels")
            .namespace("termchat"),
        &["max_sessions", "max_messages_per_session", "max_session_size_kb", "rate_limit_rps", "rate_limit_burst"]
    ).expect("metric can be created");

    /// Unix timestamp of process start
    pub static ref SERVER_START_TIME_SECONDS: Gauge = Gauge::with_opts(
        Opts::new("server_start_time_seconds", "Unix timestamp when the server started")
            .namespace("termchat")
    ).expect("metric can be created");
}

/// Register all metrics with the registry. Call once at startup.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(RPC_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LLM_CALL_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(LLM_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_SESSIONS.clone()))?;
    REGISTRY.register(Box::new(SESSIONS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TOTAL_SESSION_MEMORY_BYTES.clone()))?;
    REGISTRY.register(Box::new(RATE_LIMIT_EXCEEDED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(API_KEYS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(API_KEYS_OVER_LIMIT.clone()))?;
    REGISTRY.register(Box::new(DAILY_CALL_LIMIT.clone()))?;
    REGISTRY.register(Box::new(API_CALLS_TODAY.clone()))?;
    REGISTRY.register(Box::new(SERVER_CONFIG_INFO.clone()))?;
    REGISTRY.register(Box::new(SERVER_START_TIME_SECONDS.clone()))?;
    Ok(())
}

/// Observes a request duration when dropped.
pub struct RequestTimer {
    method: &'static str,
    started: Instant,
}

impl RequestTimer {
    pub fn new(method: &'static str) -> Self {
        Self { method, started: Instant::now() }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        REQUEST_DURATION_SECONDS
            .with_label_values(&[self.method])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

pub fn record_rpc_error(method: &'static str, code: tonic::Code) {
    RPC_ERRORS_TOTAL
        .with_label_values(&[method, &format!("{code:?}")])
        .inc();
}

pub fn record_llm_call_duration(provider: &str, elapsed: Duration) {
    LLM_CALL_DURATION_SECONDS
        .with_label_values(&[provider])
        .observe(elapsed.as_secs_f64());
}

pub fn record_llm_error(provider: &str, class: &str) {
    LLM_ERRORS_TOTAL.with_label_values(&[provider, class]).inc();
}

pub fn increment_sessions_created() {
    SESSIONS_CREATED_TOTAL.inc();
}

pub fn increment_rate_limit_exceeded() {
    RATE_LIMIT_EXCEEDED_TOTAL.inc();
}

/// Encode the registry in Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        debug!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// One-time configuration gauges.
pub fn initialize_server_metrics(config: &ServerConfig) {
    SERVER_START_TIME_SECONDS.set(chrono::Utc::now().timestamp() as f64);
    SERVER_CONFIG_INFO
        .with_label_values(&[
            &config.max_sessions.to_string(),
            &config.max_messages_per_session.to_string(),
            &(config.max_session_size_bytes / 1024).to_string(),
            &format!("{:.1}", config.rate_limit_rps),
            &config.rate_limit_burst.to_string(),
        ])
        .set(1.0);
}

/// Refresh gauges derived from store and quota state.
pub fn update_business_metrics(
    store: &SessionStore,
    quota: &QuotaTracker,
    config: &ServerConfig,
) {
    ACTIVE_SESSIONS.set(store.count() as f64);
    TOTAL_SESSION_MEMORY_BYTES.set(store.total_size_bytes() as f64);

    API_KEYS_TOTAL.set(config.api_keys.len() as f64);
    DAILY_CALL_LIMIT.set(f64::from(quota.limit()));
    API_KEYS_OVER_LIMIT.set(quota.over_limit_count() as f64);
    for (key_hash, calls) in quota.usage_by_hash() {
        API_CALLS_TODAY
            .with_label_values(&[&key_hash])
            .set(f64::from(calls));
    }
}

/// Periodic refresh of business gauges until shutdown.
pub async fn run_updater(
    store: Arc<SessionStore>,
    quota: Arc<QuotaTracker>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) {
    initialize_server_metrics(&config);
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + UPDATE_INTERVAL,
        UPDATE_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = ticker.tick() => update_business_metrics(&store, &quota, &config),
            _ = shutdown.cancelled() => {
                debug!("metrics updater stopped");
                return;
            }
        }
    }
}
