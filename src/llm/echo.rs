//! Echo provider for development and tests.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, Provider};
use crate::error::ProviderError;

/// Replies with the last user message prefixed by `Echo: `.
#[derive(Debug, Default)]
pub struct EchoProvider;

impl EchoProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for EchoProvider {
    async fn generate(
        &self,
        _cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        if messages.is_empty() {
            return Ok("Echo: No message to echo".to_string());
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.text.as_str())
            .unwrap_or_default();

        if last_user.is_empty() {
            return Ok("Echo: No user message found".to_string());
        }

        Ok(format!("Echo: {last_user}"))
    }

    fn name(&self) -> &'static str {
        "Echo"
    }
}
