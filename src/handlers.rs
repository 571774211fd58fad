//! gRPC service implementation.
//!
//! Clients follow the delta protocol: they send the message count they
//! believe the session holds, the server appends the user and assistant
//! turns and answers with the canonical count. Handlers are entered
//! concurrently and sessions are not serialised server-side; clients issue
//! one Chat at a time per session.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::llm::Provider;
use crate::metrics;
use crate::pb;
use crate::quota::QuotaTracker;
use crate::sanitize::sanitize;
use crate::session::{MessageRole, SessionStore};

/// Upper bound on a single user message.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// Resolves the provider serving a requested model. Injectable so tests can
/// script upstream behaviour.
pub type ProviderFactory = Arc<dyn Fn(pb::Model) -> Arc<dyn Provider> + Send + Sync>;

/// Shared application state behind the gRPC surface.
pub struct App {
    config: Arc<ServerConfig>,
    store: Arc<SessionStore>,
    quota: Arc<QuotaTracker>,
    provider_factory: ProviderFactory,
    shutdown: CancellationToken,
}

impl App {
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<SessionStore>,
        quota: Arc<QuotaTracker>,
        provider_factory: ProviderFactory,
        shutdown: CancellationToken,
    ) -> Self {
        Self { config, store, quota, provider_factory, shutdown }
    }

    async fn handle_chat(&self, req: pb::ChatRequest) -> Result<pb::ChatResponse, Status> {
        info!(
            session_id = %req.session_id,
            model = req.model,
            message_len = req.message.len(),
            "received chat request"
        );

        validate_chat_args(&req.session_id, &req.message)?;

        if !self.store.is_valid(&req.session_id) {
            return Err(Status::not_found(
                "session not found: call StartSession first",
            ));
        }

        // Delta protocol: the server count always prevails. Zero is the
        // client saying it does not know, which never warns.
        let count = self.store.message_count(&req.session_id) as u32;
        if req.message_index > 0 && req.message_index != count {
            warn!(
                session_id = %req.session_id,
                client_index = req.message_index,
                server_count = count,
                "client message index mismatch"
            );
        }

        self.store
            .append(&req.session_id, MessageRole::User, &req.message)
            .map_err(Status::from)?;

        let model = pb::Model::try_from(req.model).unwrap_or(pb::Model::Unspecified);
        let provider = (self.provider_factory)(model);
        let history = self.store.llm_history(&req.session_id);

        let llm_started = Instant::now();
        let reply = match provider.generate(&self.shutdown, &history).await {
            Ok(reply) => {
                metrics::record_llm_call_duration(provider.name(), llm_started.elapsed());
                reply
            }
            Err(err) => {
                metrics::record_llm_error(provider.name(), err.class());
                return Err(Status::from(err));
            }
        };

        let limit = self.config.max_response_size_bytes;
        if reply.len() > limit {
            warn!(session_id = %req.session_id, size = reply.len(), limit, "response exceeds size limit");
            return Err(Status::resource_exhausted(format!(
                "response too large: {} bytes exceeds {} byte limit",
                reply.len(),
                limit
            )));
        }
        if reply.len() * 5 > limit {
            info!(session_id = %req.session_id, size = reply.len(), limit, "large response detected");
        }

        let clean = sanitize(&reply);
        if clean.len() != reply.len() {
            warn!(
                session_id = %req.session_id,
                removed = reply.len() - clean.len(),
                "control sequences stripped from model response"
            );
        }

        self.store
            .append(&req.session_id, MessageRole::Assistant, &clean)
            .map_err(Status::from)?;

        Ok(pb::ChatResponse {
            session_id: req.session_id,
            reply: clean,
            message_count: count + 2,
        })
    }

    fn handle_get_metrics(&self) -> pb::GetMetricsResponse {
        let sessions = self
            .store
            .sessions_info()
            .into_iter()
            .map(|info| pb::SessionInfo {
                session_id: info.id,
                message_count: info.message_count as u32,
                size_bytes: info.size_bytes as u64,
                last_active: info.last_active,
            })
            .collect();

        pb::GetMetricsResponse {
            active_sessions: self.store.count() as u32,
            total_sessions_created: self.store.lifetime_created(),
            sessions,
            api_usage_stats: Some(pb::ApiUsageStats {
                configured_keys: self.config.api_keys.len() as u32,
                keys_over_limit: self.quota.over_limit_count() as u32,
                daily_call_limit: self.config.daily_call_limit,
            }),
            server_limits: Some(pb::ServerLimits {
                max_sessions: self.config.max_sessions as u32,
                max_messages_per_session: self.config.max_messages_per_session as u32,
                max_session_size_bytes: self.config.max_session_size_bytes as u64,
                rate_limit_rps: self.config.rate_limit_rps,
                rate_limit_burst: self.config.rate_limit_burst,
            }),
        }
    }
}

/// Validate Chat arguments before any state is touched.
pub fn validate_chat_args(session_id: &str, message: &str) -> Result<(), Status> {
    if session_id.is_empty() {
        return Err(Status::invalid_argument("session_id is required"));
    }
    if Uuid::parse_str(session_id).is_err() {
        return Err(Status::invalid_argument("session_id must be a valid UUID"));
    }
    if message.is_empty() {
        return Err(Status::invalid_argument("message is required"));
    }
    if message.len() > MAX_MESSAGE_BYTES {
        return Err(Status::invalid_argument(format!(
            "message exceeds {MAX_MESSAGE_BYTES} byte limit"
        )));
    }
    Ok(())
}

fn finish<T>(method: &'static str, result: Result<T, Status>) -> Result<Response<T>, Status> {
    match result {
        Ok(inner) => Ok(Response::new(inner)),
        Err(status) => {
            metrics::record_rpc_error(method, status.code());
            Err(status)
        }
    }
}

#[tonic::async_trait]
impl pb::chat_service_server::ChatService for App {
    async fn start_session(
        &self,
        _request: Request<pb::StartSessionRequest>,
    ) -> Result<Response<pb::StartSessionResponse>, Status> {
        let _timer = metrics::RequestTimer::new("StartSession");

        let session_id = Uuid::new_v4().to_string();
        self.store.register(&session_id);
        metrics::increment_sessions_created();
        info!(session_id = %session_id, "session started");

        finish(
            "StartSession",
            Ok(pb::StartSessionResponse { session_id }),
        )
    }

    async fn chat(
        &self,
        request: Request<pb::ChatRequest>,
    ) -> Result<Response<pb::ChatResponse>, Status> {
        let _timer = metrics::RequestTimer::new("Chat");
        let result = self.handle_chat(request.into_inner()).await;
        finish("Chat", result)
    }

    async fn get_history(
        &self,
        request: Request<pb::GetHistoryRequest>,
    ) -> Result<Response<pb::GetHistoryResponse>, Status> {
        let _timer = metrics::RequestTimer::new("GetHistory");
        let req = request.into_inner();
        info!(session_id = %req.session_id, "received get history request");

        let messages = self.store.formatted_messages(&req.session_id);
        finish(
            "GetHistory",
            Ok(pb::GetHistoryResponse { session_id: req.session_id, messages }),
        )
    }

    async fn health(
        &self,
        _request: Request<pb::HealthRequest>,
    ) -> Result<Response<pb::HealthResponse>, Status> {
        Ok(Response::new(pb::HealthResponse { ok: true }))
    }

    async fn get_metrics(
        &self,
        _request: Request<pb::GetMetricsRequest>,
    ) -> Result<Response<pb::GetMetricsResponse>, Status> {
        let _timer = metrics::RequestTimer::new("GetMetrics");
        finish("GetMetrics", Ok(self.handle_get_metrics()))
    }
}
