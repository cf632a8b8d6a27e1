//! # Generation Contract
//!
//! Types exchanged with a model provider, and the write that turns a finished
//! completion into a model node plus its raw-response evidence.
//!
//! The provider call itself is async and lives in the app crate. Nothing here
//! is written until a [`Completion`] is in hand, so an abandoned generation
//! leaves no trace in the store.

use crate::graph::LoomWrite;
use crate::hypergraph::{CreatedNode, NodeAuthor, append_node};
use crate::provenance::RawResponse;
use crate::{AgentId, Content, LoomError, NodeId, RawResponseEvidence, Timestamp, TokenUsage, TreeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// PROVIDER OUTPUT
// =============================================================================

/// A finished generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub content: Content,
    /// Captured before any parsing; its hash is chained into the node hash.
    pub raw_response: RawResponse,
    pub provider: Option<String>,
    pub provider_request_id: Option<String>,
    pub model_identifier: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCode {
    Auth,
    RateLimited,
    Timeout,
    InvalidRequest,
    ServerError,
    ContentFiltered,
}

impl ProviderErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidRequest => "invalid_request",
            Self::ServerError => "server_error",
            Self::ContentFiltered => "content_filtered",
        }
    }

    /// Whether a failure with this code is worth retrying by default.
    #[must_use]
    pub const fn default_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::ServerError)
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed generation, as reported by a provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("provider error ({code}): {message}")]
pub struct ProviderError {
    pub code: ProviderErrorCode,
    pub message: String,
    pub retryable: bool,
    /// Provider-suggested wait before the next attempt, in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ProviderError {
    /// Error with the code's default retry flag.
    pub fn new(code: ProviderErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
            retry_after_ms: None,
        }
    }

    #[must_use]
    pub const fn with_retry_after(mut self, millis: u64) -> Self {
        self.retry_after_ms = Some(millis);
        self
    }
}

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based), or `None` when the error is final.
    #[must_use]
    pub fn next_delay(&self, attempt: u32, error: &ProviderError) -> Option<Duration> {
        if !error.retryable || attempt >= self.max_attempts {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(20);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << exponent);
        let millis = error.retry_after_ms.unwrap_or(backoff).min(self.max_delay_ms);
        Some(Duration::from_millis(millis))
    }
}

// =============================================================================
// RECORDING
// =============================================================================

/// A model node together with the evidence stored for it.
#[derive(Debug, Clone)]
pub struct GeneratedNode {
    pub created: CreatedNode,
    pub evidence: RawResponseEvidence,
}

/// Write a completion as a model node continuing from `parent`.
///
/// The evidence row goes into the same transaction as the node. With
/// `keep_raw_bytes` the full response bytes are stored so later
/// verification can re-hash them.
pub fn record_completion(
    store: &mut dyn LoomWrite,
    tree_id: TreeId,
    parent: NodeId,
    agent: AgentId,
    completion: Completion,
    keep_raw_bytes: bool,
) -> Result<GeneratedNode, LoomError> {
    let raw_bytes = completion.raw_response.to_bytes();
    let raw_response_hash = crate::provenance::hash_bytes(&raw_bytes);

    let created = append_node(
        store,
        tree_id,
        completion.content,
        NodeAuthor::Model {
            agent,
            raw_response_hash: &raw_response_hash,
        },
        &[parent],
    )?;

    let evidence = RawResponseEvidence {
        node_id: created.node.id,
        raw_response_hash,
        raw_bytes: keep_raw_bytes.then_some(raw_bytes),
        streamed: completion.raw_response.is_streamed(),
        provider: completion.provider,
        provider_request_id: completion.provider_request_id,
        model_identifier: completion.model_identifier,
        token_usage: completion.token_usage,
        captured_at: Timestamp::now(),
    };
    store.put_evidence(&evidence)?;

    tracing::info!(
        node = %created.node.id,
        parent = %parent,
        model = evidence.model_identifier.as_deref().unwrap_or("-"),
        streamed = evidence.streamed,
        "completion recorded"
    );
    Ok(GeneratedNode { created, evidence })
}
