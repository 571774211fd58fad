//! Admission pipeline.
//!
//! A `tower` layer wrapped around the gRPC router that runs, in order:
//! bearer authentication, the admin role gate, daily quota admit+record and
//! token-bucket rate limiting. Every method of the chat service passes
//! through it except Health, which is only rate limited by client IP.
//! Requests outside the chat service (reflection) pass through untouched.
//!
//! Quota cost is charged on admit: a request that is admitted and then
//! fails downstream has still consumed one call.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::Either;
use http::header::AUTHORIZATION;
use tonic::body::{empty_body, BoxBody};
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tonic::Status;
use tower::{Layer, Service};

use crate::config::Role;
use crate::metrics;
use crate::quota::QuotaTracker;
use crate::ratelimit::{extract_ip, RateLimiter};

/// Full method name of the unauthenticated health probe.
pub const HEALTH_METHOD: &str = "/chat.ChatService/Health";

/// Full method name of the admin-only metrics call.
pub const METRICS_METHOD: &str = "/chat.ChatService/GetMetrics";

const SERVICE_PREFIX: &str = "/chat.ChatService/";

/// Authenticated identity attached to request extensions for handlers.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

/// The admission checks shared by every connection.
pub struct Gate {
    api_keys: HashMap<String, Role>,
    quota: Arc<QuotaTracker>,
    limiter: Arc<RateLimiter>,
}

impl Gate {
    pub fn new(
        api_keys: HashMap<String, Role>,
        quota: Arc<QuotaTracker>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self { api_keys, quota, limiter }
    }

    /// Run the filter chain. On success the resolved [`Principal`] is
    /// attached to the request extensions.
    fn admit<B>(&self, req: &mut http::Request<B>) -> Result<(), Status> {
        let path = req.uri().path().to_string();

        if !path.starts_with(SERVICE_PREFIX) {
            return Ok(());
        }

        if path == HEALTH_METHOD {
            let key = format!("ip:{}", client_ip(req));
            if !self.limiter.allow(&key) {
                metrics::increment_rate_limit_exceeded();
                return Err(Status::resource_exhausted("rate limit exceeded"));
            }
            return Ok(());
        }

        if self.api_keys.is_empty() {
            return Err(Status::unauthenticated(
                "no API keys configured - authentication required",
            ));
        }

        let header = req
            .headers()
            .get(AUTHORIZATION)
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;
        let header = header
            .to_str()
            .map_err(|_| Status::unauthenticated("invalid authorization format"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("invalid authorization format"))?
            .to_string();
        let role = *self
            .api_keys
            .get(token.as_str())
            .ok_or_else(|| Status::unauthenticated("invalid API key"))?;

        if path == METRICS_METHOD && role != Role::Admin {
            return Err(Status::permission_denied("admin access required"));
        }

        if !self.quota.admit(&token) {
            return Err(Status::resource_exhausted("daily call limit exceeded"));
        }

        if !self.limiter.allow(&format!("id:{token}")) {
            metrics::increment_rate_limit_exceeded();
            return Err(Status::resource_exhausted("rate limit exceeded"));
        }

        req.extensions_mut().insert(Principal { id: token, role });
        Ok(())
    }
}

fn client_ip<B>(req: &http::Request<B>) -> String {
    let remote = req
        .extensions()
        .get::<TcpConnectInfo>()
        .and_then(|info| info.remote_addr())
        .or_else(|| {
            req.extensions()
                .get::<TlsConnectInfo<TcpConnectInfo>>()
                .and_then(|info| info.get_ref().remote_addr())
        });
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    extract_ip(remote, forwarded)
}

/// Trailers-only gRPC response carrying the denial status.
fn deny(status: &Status) -> http::Response<BoxBody> {
    let mut response = http::Response::new(empty_body());
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    headers.insert("grpc-status", http::HeaderValue::from(status.code() as i32));
    if let Ok(message) = http::HeaderValue::from_str(status.message()) {
        headers.insert("grpc-message", message);
    }
    response
}

/// Tower layer installing the admission pipeline.
#[derive(Clone)]
pub struct AdmissionLayer {
    gate: Arc<Gate>,
}

impl AdmissionLayer {
    pub fn new(gate: Gate) -> Self {
        Self { gate: Arc::new(gate) }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, gate: Arc::clone(&self.gate) }
    }
}

/// Service wrapper produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S, ReqBody> Service<http::Request<ReqBody>> for AdmissionService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<BoxBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<std::future::Ready<Result<Self::Response, Self::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        match self.gate.admit(&mut req) {
            Ok(()) => Either::Right(self.inner.call(req)),
            Err(status) => Either::Left(std::future::ready(Ok(deny(&status)))),
        }
    }
}
