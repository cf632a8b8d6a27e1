//! # Model Providers
//!
//! The async side of generation. A provider turns an assembled context into
//! a [`Completion`] carrying the raw response exactly as received; the
//! engine hashes that raw response into the new node.
//!
//! Nothing is written while a provider runs, so dropping the future of
//! [`generate_with_retry`] leaves no partial state behind.

use async_trait::async_trait;
use loomtree_core::{
    AssembledContext, Completion, ContextBody, Content, LoomError, ProviderError,
    ProviderErrorCode, RawResponse, RetryPolicy, TokenUsage,
};

// =============================================================================
// PROVIDER TRAIT
// =============================================================================

/// A model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Name recorded in the evidence row.
    fn name(&self) -> &str;

    /// Produce one completion for `context`.
    async fn generate(&self, context: &AssembledContext) -> Result<Completion, ProviderError>;
}

/// Build the provider named in the configuration.
pub fn provider_by_name(name: &str) -> Result<Box<dyn ModelProvider>, LoomError> {
    match name {
        "echo" => Ok(Box::new(EchoProvider)),
        other => Err(LoomError::Validation(format!(
            "unknown provider '{}' (available: echo)",
            other
        ))),
    }
}

// =============================================================================
// RETRY DRIVER
// =============================================================================

/// Call `provider` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
pub async fn generate_with_retry(
    provider: &dyn ModelProvider,
    context: &AssembledContext,
    policy: &RetryPolicy,
) -> Result<Completion, ProviderError> {
    let mut attempt: u32 = 1;
    loop {
        match provider.generate(context).await {
            Ok(completion) => {
                tracing::debug!(
                    provider = provider.name(),
                    attempt,
                    path = %context.path_id,
                    "generation succeeded"
                );
                return Ok(completion);
            }
            Err(err) => match policy.next_delay(attempt, &err) {
                Some(delay) => {
                    tracing::warn!(
                        provider = provider.name(),
                        attempt,
                        code = err.code.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "generation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => {
                    tracing::error!(
                        provider = provider.name(),
                        attempt,
                        code = err.code.as_str(),
                        retryable = err.retryable,
                        "generation failed"
                    );
                    return Err(err);
                }
            },
        }
    }
}

// =============================================================================
// ECHO PROVIDER
// =============================================================================

/// Repeats the last context entry back. Useful for wiring and demos.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, context: &AssembledContext) -> Result<Completion, ProviderError> {
        let last = match &context.body {
            ContextBody::Messages { messages } => messages
                .iter()
                .rev()
                .find(|m| !m.annotation)
                .map(|m| m.text.clone()),
            ContextBody::Document { text } => Some(text.clone()),
        };
        let Some(text) = last.filter(|t| !t.is_empty()) else {
            return Err(ProviderError::new(
                ProviderErrorCode::InvalidRequest,
                "nothing to echo",
            ));
        };

        let body = serde_json::json!({ "echo": text });
        let body = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::new(ProviderErrorCode::ServerError, e.to_string()))?;
        let words = text.split_whitespace().count() as u64;

        Ok(Completion {
            content: Content::text(text),
            raw_response: RawResponse::Http {
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body,
            },
            provider: Some(self.name().to_string()),
            provider_request_id: None,
            model_identifier: Some("echo-1".to_string()),
            token_usage: Some(TokenUsage {
                input_tokens: words,
                output_tokens: words,
            }),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
