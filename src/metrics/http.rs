//! Prometheus scrape endpoint.
//!
//! A small axum listener, separate from the gRPC port, exposing
//! `GET /metrics` behind Bearer admin authentication.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Role;

#[derive(Clone)]
struct MetricsState {
    api_keys: Arc<HashMap<String, Role>>,
}

/// Serve the metrics listener until the shutdown token fires.
pub async fn serve(
    port: u16,
    api_keys: HashMap<String, Role>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let state = MetricsState { api_keys: Arc::new(api_keys) };
    let app = Router::new()
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "starting metrics server");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!(error = %err, "metrics server failed");
    }
    Ok(())
}

/// GET /metrics, admin only.
async fn metrics(State(state): State<MetricsState>, headers: HeaderMap) -> impl IntoResponse {
    match authorize(&state, &headers) {
        Ok(()) => (StatusCode::OK, super::gather_text()),
        Err(denied) => denied,
    }
}

fn authorize(state: &MetricsState, headers: &HeaderMap) -> Result<(), (StatusCode, String)> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, "Authorization header required".to_string()))?;

    let token = auth.strip_prefix("Bearer ").ok_or((
        StatusCode::UNAUTHORIZED,
        "Authorization must use Bearer token".to_string(),
    ))?;

    match state.api_keys.get(token) {
        Some(Role::Admin) => Ok(()),
        _ => Err((StatusCode::FORBIDDEN, "Admin access required".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(keys: &[(&str, Role)]) -> MetricsState {
        MetricsState {
            api_keys: Arc::new(keys.iter().map(|(k, r)| (k.to_string(), *r)).collect()),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn test_missing_header_is_unauthorized() {
        let err = authorize(&state(&[("root", Role::Admin)]), &HeaderMap::new()).unwrap_err();
        assert_eq!(err.0, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_non_admin_is_forbidden() {
        let err = authorize(&state(&[("alpha", Role::User)]), &bearer("alpha")).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_unknown_key_is_forbidden() {
        let err = authorize(&state(&[("root", Role::Admin)]), &bearer("zzz")).unwrap_err();
        assert_eq!(err.0, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_admin_is_allowed() {
        assert!(authorize(&state(&[("root", Role::Admin)]), &bearer("root")).is_ok());
    }
}
