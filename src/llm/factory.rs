//! Provider selection policy.
//!
//! The factory resolves a requested model to a concrete provider, honouring
//! the environment: Echo is a development convenience and is never served in
//! production, while a Gemini provider that cannot be constructed (missing
//! API key) degrades to Echo as a last resort.

use std::sync::Arc;

use tracing::{info, warn};

use super::{EchoProvider, GeminiProvider, Provider};
use crate::config::{Environment, GeminiConfig};
use crate::pb::Model;

/// Resolve the provider for a requested model.
pub fn provider_for(
    model: Model,
    environment: Environment,
    gemini: &GeminiConfig,
    client: &reqwest::Client,
) -> Arc<dyn Provider> {
    match model {
        Model::Gemini25FlashLite => gemini_or_echo(gemini, client),
        Model::Echo => {
            if environment.is_development() {
                info!(model = "ECHO", "using Echo provider for development");
                Arc::new(EchoProvider::new())
            } else {
                warn!(model = "ECHO", "Echo provider requested in production environment, falling back to Gemini");
                gemini_or_echo(gemini, client)
            }
        }
        Model::Unspecified => {
            if environment.is_development() {
                info!("unspecified model in development, using Echo provider");
                Arc::new(EchoProvider::new())
            } else {
                warn!("unspecified model in production, falling back to Gemini");
                gemini_or_echo(gemini, client)
            }
        }
    }
}

fn gemini_or_echo(gemini: &GeminiConfig, client: &reqwest::Client) -> Arc<dyn Provider> {
    match GeminiProvider::new(gemini, client.clone()) {
        Ok(provider) => Arc::new(provider),
        Err(err) => {
            warn!(error = %err, "failed to create Gemini provider, falling back to Echo");
            Arc::new(EchoProvider::new())
        }
    }
}
