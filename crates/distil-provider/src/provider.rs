use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Context limits published for a model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelLimits {
    /// Maximum token budget the model accepts as input for one invocation.
    pub context_window: u64,
    /// Maximum tokens one invocation may produce.
    pub max_output: u64,
}

/// A provider's published input-token budget per minute. Local and
/// self-hosted providers report `Unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RateLimit {
    Unlimited,
    PerMinute { input_tokens: u64 },
}

impl RateLimit {
    pub fn per_minute(input_tokens: u64) -> Self {
        RateLimit::PerMinute { input_tokens }
    }

    pub fn allowed(&self) -> Option<u64> {
        match self {
            RateLimit::Unlimited => None,
            RateLimit::PerMinute { input_tokens } => Some(*input_tokens),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub model_id: String,
    pub prompt: String,
    pub max_tokens: u64,
    pub temperature: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error (status {status_code}): {message}")]
    ApiErrorWithStatus { message: String, status_code: u16 },

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timeout")]
    Timeout,

    #[error("Empty response from model")]
    EmptyResponse,
}

impl ProviderError {
    pub fn api_error_with_status(message: impl Into<String>, status_code: u16) -> Self {
        ProviderError::ApiErrorWithStatus {
            message: message.into(),
            status_code,
        }
    }

    /// Whether this error is the provider's own rate limit rejection. The
    /// compaction engine treats it the same as a predicted exceedance.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            ProviderError::RateLimit => true,
            ProviderError::ApiErrorWithStatus { status_code, .. } => *status_code == 429,
            _ => false,
        }
    }
}

/// Model-invocation collaborator. The compaction engine uses it only for
/// categorization and is agnostic to which provider backs it.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;

    fn rate_limit(&self) -> RateLimit;
    fn model_limits(&self, model_id: &str) -> Option<ModelLimits>;

    async fn invoke(&self, request: InvokeRequest) -> Result<String, ProviderError>;
}

static BEDROCK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(amazon\.|meta\.|mistral\.|cohere\.|ai21\.)|titan|llama").unwrap());

/// Best-effort provider inference from a bare model id.
pub fn infer_provider(model_id: &str) -> &'static str {
    let lower = model_id.to_lowercase();

    if lower.contains("claude") || lower.contains("anthropic") {
        return "anthropic";
    }
    if BEDROCK_PATTERN.is_match(&lower) {
        return "aws_bedrock";
    }

    // Simple bare names are assumed to be locally hosted.
    "local"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_provider_anthropic() {
        assert_eq!(infer_provider("claude-sonnet-4-20250514"), "anthropic");
        assert_eq!(infer_provider("anthropic.claude-3-haiku"), "anthropic");
    }

    #[test]
    fn test_infer_provider_bedrock() {
        assert_eq!(infer_provider("amazon.titan-text-express"), "aws_bedrock");
        assert_eq!(infer_provider("meta.llama3-70b"), "aws_bedrock");
        assert_eq!(infer_provider("mistral.mixtral-8x7b"), "aws_bedrock");
    }

    #[test]
    fn test_infer_provider_local_fallback() {
        assert_eq!(infer_provider("qwen2.5-coder"), "local");
    }

    #[test]
    fn test_rate_limit_allowed() {
        assert_eq!(RateLimit::Unlimited.allowed(), None);
        assert_eq!(RateLimit::per_minute(30_000).allowed(), Some(30_000));
    }

    #[test]
    fn test_is_rate_limit() {
        assert!(ProviderError::RateLimit.is_rate_limit());
        assert!(ProviderError::api_error_with_status("too many requests", 429).is_rate_limit());
        assert!(!ProviderError::Timeout.is_rate_limit());
    }
}
