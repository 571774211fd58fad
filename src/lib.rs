//! termchat-proxy library.
//!
//! A bandwidth-minimising chat proxy: terminal clients speak a compressed,
//! TLS-encrypted gRPC protocol to this server, which keeps per-session
//! conversation state in memory and forwards accumulated history to an LLM
//! provider. This crate wires the session store, admission pipeline, chat
//! handlers and provider port into a single `run_server` entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Identity, Server, ServerTlsConfig};
use tracing::{info, warn};

pub mod admission;
pub mod config;
pub mod error;
pub mod handlers;
pub mod janitor;
pub mod llm;
pub mod metrics;
pub mod pb;
pub mod quota;
pub mod ratelimit;
pub mod sanitize;
pub mod session;

pub use config::ServerConfig;
pub use handlers::{App, ProviderFactory};

use admission::{AdmissionLayer, Gate};
use pb::chat_service_server::ChatServiceServer;
use quota::QuotaTracker;
use ratelimit::RateLimiter;
use session::SessionStore;

/// How long in-flight requests may drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Register Prometheus metrics. Should be called once before starting the
/// server.
pub fn init_metrics() {
    if let Err(err) = metrics::register_metrics() {
        warn!(error = %err, "failed to register Prometheus metrics");
    }
}

/// The production provider factory: resolves models against the configured
/// environment and Gemini credentials.
pub fn default_provider_factory(
    config: Arc<ServerConfig>,
    http: reqwest::Client,
) -> ProviderFactory {
    Arc::new(move |model| {
        llm::factory::provider_for(model, config.environment, &config.gemini, &http)
    })
}

/// Run the proxy until SIGINT or SIGTERM.
///
/// Starts the TLS gRPC listener with per-call gzip, the admission layer, the
/// janitor, the rate-limit sweeper, the metrics updater and the metrics HTTP
/// listener. Shutdown stops accepting new RPCs, signals every background
/// task, and waits a bounded grace period for in-flight handlers.
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    init_metrics();

    let config = Arc::new(config);
    let store = Arc::new(SessionStore::new(
        config.session_idle_timeout,
        config.max_sessions,
        config.max_messages_per_session,
        config.max_session_size_bytes,
    ));
    let quota = Arc::new(QuotaTracker::new(config.daily_call_limit));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_rps,
        config.rate_limit_burst,
    ));
    let shutdown = CancellationToken::new();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(35))
        .build()
        .context("failed to build HTTP client")?;
    let provider_factory = default_provider_factory(Arc::clone(&config), http);

    let app = App::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&quota),
        provider_factory,
        shutdown.clone(),
    );

    let cert = tokio::fs::read(&config.tls_cert_file).await.with_context(|| {
        format!("failed to read TLS certificate {}", config.tls_cert_file.display())
    })?;
    let key = tokio::fs::read(&config.tls_key_file).await.with_context(|| {
        format!("failed to read TLS key {}", config.tls_key_file.display())
    })?;
    let identity = Identity::from_pem(cert, key);

    let janitor_task = tokio::spawn(janitor::run(
        Arc::clone(&store),
        config.session_cleanup_interval,
        shutdown.clone(),
    ));
    let sweeper_task = tokio::spawn(ratelimit::run_sweeper(
        Arc::clone(&limiter),
        shutdown.clone(),
    ));
    let updater_task = tokio::spawn(metrics::run_updater(
        Arc::clone(&store),
        Arc::clone(&quota),
        Arc::clone(&config),
        shutdown.clone(),
    ));
    let metrics_task = tokio::spawn(metrics::http::serve(
        config.metrics_port,
        config.api_keys.clone(),
        shutdown.clone(),
    ));

    let gate = Gate::new(config.api_keys.clone(), Arc::clone(&quota), Arc::clone(&limiter));
    let chat_service = ChatServiceServer::new(app)
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);

    let mut router = Server::builder()
        .tls_config(ServerTlsConfig::new().identity(identity))
        .context("failed to configure TLS")?
        .layer(AdmissionLayer::new(gate))
        .add_service(chat_service);

    if config.environment.is_development() {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pb::FILE_DESCRIPTOR_SET)
            .build_v1()
            .context("failed to build reflection service")?;
        router = router.add_service(reflection);
        info!("gRPC reflection enabled");
    }

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("invalid listen address")?;
    info!(addr = %addr, env = ?config.environment, "starting gRPC server");

    let signal_token = shutdown.clone();
    let serve = router.serve_with_shutdown(addr, async move {
        shutdown_signal().await;
        info!("shutting down gracefully");
        signal_token.cancel();
    });
    tokio::pin!(serve);

    let grace = {
        let shutdown = shutdown.clone();
        async move {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        }
    };
    tokio::pin!(grace);

    let result = tokio::select! {
        res = &mut serve => res.map_err(anyhow::Error::from),
        _ = &mut grace => {
            warn!("grace period elapsed before all requests drained");
            Ok(())
        }
    };

    // Stop every background task and wait for them to exit.
    shutdown.cancel();
    let _ = tokio::join!(janitor_task, sweeper_task, updater_task, metrics_task);
    info!("server stopped");

    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
