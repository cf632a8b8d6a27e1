//! # API Request/Response Types
//!
//! This module defines the JSON structures for the HTTP API.
//!
//! Raw provider response bytes travel base64-encoded.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use loomtree_core::{
    AgentId, AuditReport, ContainerId, Content, Edge, EdgeId, InteractionMode, LoomError,
    LoomTree, Node, NodeId, NodeMetadata, NodeView, ParentCandidate, Path, PathSelection, PathState,
    RawResponse, RawResponseEvidence, Timestamp, TokenUsage, TreeId,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// HEALTH / STATUS
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Store status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub persistent: bool,
    pub tree_count: usize,
    pub revision: u64,
}

/// Change counter, polled by clients to notice writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionResponse {
    pub revision: u64,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub code: String,
    pub error: String,
    /// True when the caller can fix the request and retry, e.g. by
    /// recording a selection.
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<ParentCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn from_loom(err: &LoomError) -> Self {
        let candidates = match err {
            LoomError::SelectionRequired { candidates, .. } => candidates.clone(),
            _ => Vec::new(),
        };
        Self {
            success: false,
            code: err.code().to_string(),
            error: err.to_string(),
            recoverable: err.is_recoverable(),
            candidates,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

// =============================================================================
// RECORD VIEWS
// =============================================================================

/// A node as exposed over JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeJson {
    pub id: NodeId,
    pub short_id: String,
    pub tree_id: TreeId,
    pub content: Content,
    pub author_id: AgentId,
    pub author_kind: loomtree_core::AuthorKind,
    pub content_hash: String,
    /// Milliseconds since the Unix epoch, as hashed.
    pub created_at: Timestamp,
    pub parent_ids: Vec<NodeId>,
    pub metadata: NodeMetadata,
    pub edited_from: Option<NodeId>,
    pub version_group: Option<NodeId>,
}

impl From<Node> for NodeJson {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            short_id: node.short_id,
            tree_id: node.tree_id,
            content: node.content,
            author_id: node.author_id,
            author_kind: node.author_kind,
            content_hash: node.content_hash,
            created_at: node.created_at,
            parent_ids: node.parent_ids,
            metadata: node.metadata,
            edited_from: node.edited_from,
            version_group: node.version_group,
        }
    }
}

pub fn nodes_json(nodes: Vec<Node>) -> Vec<NodeJson> {
    nodes.into_iter().map(NodeJson::from).collect()
}

/// A node with its local neighbourhood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeViewResponse {
    pub node: NodeJson,
    pub parent_edges: Vec<Edge>,
    pub children: Vec<NodeId>,
    pub annotations: Vec<NodeId>,
}

impl From<NodeView> for NodeViewResponse {
    fn from(view: NodeView) -> Self {
        Self {
            node: view.node.into(),
            parent_edges: view.parent_edges,
            children: view.children,
            annotations: view.annotations,
        }
    }
}

/// Evidence row with raw bytes base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceJson {
    pub node_id: NodeId,
    pub raw_response_hash: String,
    pub raw_bytes: Option<String>,
    pub streamed: bool,
    pub provider: Option<String>,
    pub provider_request_id: Option<String>,
    pub model_identifier: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub captured_at: Timestamp,
}

impl From<RawResponseEvidence> for EvidenceJson {
    fn from(evidence: RawResponseEvidence) -> Self {
        Self {
            node_id: evidence.node_id,
            raw_response_hash: evidence.raw_response_hash,
            raw_bytes: evidence.raw_bytes.map(|b| STANDARD.encode(b)),
            streamed: evidence.streamed,
            provider: evidence.provider,
            provider_request_id: evidence.provider_request_id,
            model_identifier: evidence.model_identifier,
            token_usage: evidence.token_usage,
            captured_at: evidence.captured_at,
        }
    }
}

/// A path with its cached node sequence and selections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathResponse {
    pub path: Path,
    pub nodes: Vec<NodeId>,
    pub selections: Vec<PathSelection>,
}

/// Result of any write that moves a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathNodesResponse {
    pub path_id: loomtree_core::PathId,
    pub nodes: Vec<NodeId>,
}

/// Result of writing a node through a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub node: NodeJson,
    pub edge_ids: Vec<EdgeId>,
    pub short_id_degraded: bool,
    /// Length of the path after the write.
    pub path_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<EvidenceJson>,
    /// Continuation edges the edit was attached to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extended_edges: Vec<EdgeId>,
}

/// Active node of an agent on a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveNodeResponse {
    pub state: Option<PathState>,
}

// =============================================================================
// TREES
// =============================================================================

/// Create a tree with its root node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTreeRequest {
    pub author: AgentId,
    pub root: Content,
    #[serde(default)]
    pub container_id: Option<ContainerId>,
    #[serde(default)]
    pub mode: Option<InteractionMode>,
    #[serde(default)]
    pub system_context: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Also create a path for the author, seeded with the root.
    #[serde(default = "default_true")]
    pub create_path: bool,
    #[serde(default)]
    pub path_name: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTreeResponse {
    pub tree: LoomTree,
    pub root: NodeJson,
    pub path: Option<Path>,
}

/// Tree export, base64 encoded, with its integrity digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResponse {
    pub tree_id: TreeId,
    pub data: String,
    pub digest: String,
}

impl ExportResponse {
    pub fn new(tree_id: TreeId, data: &[u8], digest: String) -> Self {
        Self {
            tree_id,
            data: STANDARD.encode(data),
            digest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Base64 encoded export.
    pub data: String,
}

impl ImportRequest {
    pub fn decode(&self) -> Result<Vec<u8>, LoomError> {
        STANDARD
            .decode(self.data.trim())
            .map_err(|e| LoomError::Validation(format!("export data is not base64: {}", e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResponse {
    pub clean: bool,
    pub report: AuditReport,
}

// =============================================================================
// NODES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotateRequest {
    pub author: AgentId,
    pub content: Content,
}

// =============================================================================
// PATHS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePathRequest {
    pub owner: AgentId,
    #[serde(default)]
    pub name: Option<String>,
}

/// Move a path onto a node (advance or navigate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub agent: AgentId,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateRequest {
    pub len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRequest {
    pub target_node_id: NodeId,
    #[serde(default)]
    pub selected_edge_id: Option<EdgeId>,
    #[serde(default)]
    pub selected_source_node_id: Option<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveNodeQuery {
    pub agent: AgentId,
    #[serde(default)]
    pub mode: Option<InteractionMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub agent: AgentId,
    pub content: Content,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    pub agent: AgentId,
    pub node_id: NodeId,
    pub content: Content,
}

/// Ask the server's provider to continue the path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Author of the generated node; defaults to the configured model agent.
    #[serde(default)]
    pub agent: Option<AgentId>,
}

/// Raw provider response as sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResponseJson {
    Http {
        #[serde(default)]
        headers: Vec<(String, String)>,
        /// Base64 encoded body bytes.
        body: String,
    },
    Streamed {
        assembled_text: String,
    },
}

impl RawResponseJson {
    pub fn decode(self) -> Result<RawResponse, LoomError> {
        match self {
            Self::Http { headers, body } => {
                let body = STANDARD.decode(body.trim()).map_err(|e| {
                    LoomError::Validation(format!("raw response body is not base64: {}", e))
                })?;
                Ok(RawResponse::Http { headers, body })
            }
            Self::Streamed { assembled_text } => Ok(RawResponse::Streamed { assembled_text }),
        }
    }
}

/// Record a completion produced outside the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub agent: AgentId,
    /// Tail the completion was generated from; stale tails are rejected.
    #[serde(default)]
    pub expected_tail: Option<NodeId>,
    pub content: Content,
    pub raw_response: RawResponseJson,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub provider_request_id: Option<String>,
    #[serde(default)]
    pub model_identifier: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

// =============================================================================
// TESTS
// =============================================================================
