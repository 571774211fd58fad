//! Error types for the chat proxy.
//!
//! Each concern keeps a typed `thiserror` enum; everything that crosses the
//! RPC boundary converts into a `tonic::Status` with a stable canonical code.

use tonic::Status;

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    /// An environment variable is present but unusable.
    #[error("invalid {var} value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Session store mutation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The session id was never registered via StartSession, or has been
    /// evicted or swept since.
    #[error("invalid session ID: session not found or not properly created")]
    InvalidSession,

    /// The per-session message count cap was reached.
    #[error("session message limit exceeded: maximum {max} messages per session")]
    MessageLimit { max: usize },

    /// Appending would push the session past its byte budget.
    #[error("session size limit exceeded: maximum {max} bytes per session")]
    SizeLimit { max: usize },
}

/// Errors surfaced by LLM providers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The request could never succeed (e.g. empty conversation).
    #[error("{0}")]
    InvalidArgument(String),

    /// The caller went away while the call or a backoff sleep was pending.
    #[error("request cancelled")]
    Cancelled,

    /// Every try ran into its per-try deadline.
    #[error("upstream API timeout")]
    DeadlineExceeded,

    /// The upstream answered but produced no text.
    #[error("upstream returned empty response")]
    EmptyResponse,

    /// Any other upstream failure, remembered verbatim.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProviderError {
    /// Short class label for metrics; never carries user content.
    pub fn class(&self) -> &'static str {
        match self {
            ProviderError::InvalidArgument(_) => "invalid_argument",
            ProviderError::Cancelled => "cancelled",
            ProviderError::DeadlineExceeded => "timeout",
            ProviderError::EmptyResponse => "empty_response",
            ProviderError::Upstream(_) => "upstream",
        }
    }
}

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidSession => Status::not_found(err.to_string()),
            StoreError::MessageLimit { .. } | StoreError::SizeLimit { .. } => {
                Status::resource_exhausted(err.to_string())
            }
        }
    }
}

impl From<ProviderError> for Status {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidArgument(msg) => Status::invalid_argument(msg),
            ProviderError::Cancelled => Status::cancelled(err.to_string()),
            ProviderError::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            // Everything that is not a deadline or a cancellation collapses
            // into unavailable, carrying the last remembered message.
            ProviderError::EmptyResponse | ProviderError::Upstream(_) => {
                Status::unavailable(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn store_errors_map_to_canonical_codes() {
        assert_eq!(Status::from(StoreError::InvalidSession).code(), Code::NotFound);
        assert_eq!(
            Status::from(StoreError::MessageLimit { max: 100 }).code(),
            Code::ResourceExhausted
        );
        assert_eq!(
            Status::from(StoreError::SizeLimit { max: 1024 }).code(),
            Code::ResourceExhausted
        );
    }

    #[test]
    fn provider_errors_map_to_canonical_codes() {
        assert_eq!(
            Status::from(ProviderError::Cancelled).code(),
            Code::Cancelled
        );
        assert_eq!(
            Status::from(ProviderError::DeadlineExceeded).code(),
            Code::DeadlineExceeded
        );
        assert_eq!(
            Status::from(ProviderError::EmptyResponse).code(),
            Code::Unavailable
        );
        assert_eq!(
            Status::from(ProviderError::Upstream("boom".into())).code(),
            Code::Unavailable
        );
        assert_eq!(
            Status::from(ProviderError::InvalidArgument("no messages".into())).code(),
            Code::InvalidArgument
        );
    }

    #[test]
    fn upstream_message_is_preserved() {
        let status = Status::from(ProviderError::Upstream("503 from backend".into()));
        assert!(status.message().contains("503 from backend"));
    }

    #[test]
    fn limit_messages_name_the_cap() {
        let err = StoreError::MessageLimit { max: 100 };
        assert!(err.to_string().contains("100"));
        let err = StoreError::SizeLimit { max: 102400 };
        assert!(err.to_string().contains("102400"));
    }
}
