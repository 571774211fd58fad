//! Scripted provider for exercising handler behaviour in tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{ChatMessage, Provider};
use crate::error::ProviderError;

/// Returns pre-scripted results in order; repeats the last one when the
/// script runs dry.
pub struct MockProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
}

impl MockProvider {
    pub fn new(script: Vec<Result<String, ProviderError>>) -> Self {
        let fallback = script
            .last()
            .cloned()
            .unwrap_or_else(|| Ok("mock reply".to_string()));
        Self { script: Mutex::new(script.into()), fallback }
    }

    /// Provider that always answers with `reply`.
    pub fn always(reply: &str) -> Self {
        Self::new(vec![Ok(reply.to_string())])
    }

    /// Provider that always fails with `err`.
    pub fn failing(err: ProviderError) -> Self {
        Self::new(vec![Err(err)])
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        _cancel: &CancellationToken,
        _messages: &[ChatMessage],
    ) -> Result<String, ProviderError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn name(&self) -> &'static str {
        "Mock"
    }
}
