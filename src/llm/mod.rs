//! LLM provider abstraction.
//!
//! Providers take the full conversation as `(role, text)` pairs and return
//! the generated reply. The closed set of variants is Echo (development
//! only) and Gemini; the factory in [`factory`] applies the environment
//! policy that selects between them.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

mod echo;
mod gemini;
mod mock;

pub mod factory;

pub use echo::EchoProvider;
pub use gemini::GeminiProvider;
pub use mock::MockProvider;

/// One turn of the conversation as handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub text: String,
}

/// Capability implemented by every reply generator.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a reply from the conversation so far. `cancel` is observed
    /// during upstream calls and backoff sleeps so shutdown can abort
    /// in-flight work.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        messages: &[ChatMessage],
    ) -> Result<String, ProviderError>;

    fn name(&self) -> &'static str;
}
