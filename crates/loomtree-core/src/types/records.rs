//! Persisted records.
//!
//! Every struct here is stored with postcard, so no field may use
//! `skip_serializing_if`. Content is routed through the JSON adapter in
//! [`crate::types::content::storage_repr`].

use super::{
    AgentId, AuthorKind, ContainerId, EdgeId, EdgeKind, InteractionMode, NodeId, PathId,
    SourceRole, Timestamp, TreeId,
};
use crate::types::Content;
use serde::{Deserialize, Serialize};

// =============================================================================
// TREE
// =============================================================================

/// A rooted hypergraph of nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoomTree {
    pub id: TreeId,
    pub container_id: ContainerId,
    pub root_node_id: NodeId,
    pub mode: InteractionMode,
    pub system_context: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl LoomTree {
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// =============================================================================
// NODE
// =============================================================================

/// Mutable per-node flags. Never part of the content hash.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub bookmarked: bool,
    pub bookmark_label: Option<String>,
    /// Hidden from default views; still traversable.
    pub pruned: bool,
    /// Left out of assembled context; still traversable.
    pub excluded: bool,
}

/// An immutable content unit.
///
/// `parent_ids` records the nodes whose hashes were chained into
/// `content_hash` at creation time. Edges gained later (edit propagation,
/// added sources) do not change it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub short_id: String,
    pub tree_id: TreeId,
    #[serde(with = "crate::types::content::storage_repr")]
    pub content: Content,
    pub author_id: AgentId,
    pub author_kind: AuthorKind,
    pub content_hash: String,
    pub created_at: Timestamp,
    pub parent_ids: Vec<NodeId>,
    pub metadata: NodeMetadata,
    /// The node this one is an edited version of.
    pub edited_from: Option<NodeId>,
    /// Shared by every version of the same logical span.
    pub version_group: Option<NodeId>,
}

impl Node {
    /// Version group this node belongs to; an unedited node is its own group.
    #[must_use]
    pub fn version_group_id(&self) -> NodeId {
        self.version_group.unwrap_or(self.id)
    }
}

// =============================================================================
// EDGE
// =============================================================================

/// One source of a hyperedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeSource {
    pub node_id: NodeId,
    pub role: SourceRole,
}

/// A directed hyperedge: one or more sources into exactly one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub tree_id: TreeId,
    pub sources: Vec<EdgeSource>,
    pub target_id: NodeId,
    pub kind: EdgeKind,
    pub created_at: Timestamp,
}

impl Edge {
    pub fn source_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.sources.iter().map(|s| s.node_id)
    }

    #[must_use]
    pub fn has_source(&self, node_id: NodeId) -> bool {
        self.sources.iter().any(|s| s.node_id == node_id)
    }

    /// Sort sources by role, keeping insertion order within a role.
    pub fn order_sources(&mut self) {
        self.sources.sort_by_key(|s| s.role);
    }

    #[must_use]
    pub const fn is_continuation(&self) -> bool {
        matches!(self.kind, EdgeKind::Continuation)
    }
}

/// One way to step backward from a node: an edge and a source on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentCandidate {
    pub edge_id: EdgeId,
    pub source_node_id: NodeId,
    pub role: SourceRole,
}

// =============================================================================
// PATHS
// =============================================================================

/// An agent-owned walk through a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub id: PathId,
    pub tree_id: TreeId,
    pub owner_agent_id: AgentId,
    pub name: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

/// One cached position of a path. Positions are `0..n` with no gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub path_id: PathId,
    pub position: usize,
    pub node_id: NodeId,
}

/// Which parent a path follows when stepping back from `target_node_id`.
///
/// At most one per `(path_id, target_node_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSelection {
    pub path_id: PathId,
    pub target_node_id: NodeId,
    pub selected_edge_id: Option<EdgeId>,
    pub selected_source_node_id: Option<NodeId>,
    pub updated_at: Timestamp,
}

impl PathSelection {
    /// Storage key: one selection per path and target.
    #[must_use]
    pub const fn key(&self) -> (PathId, NodeId) {
        (self.path_id, self.target_node_id)
    }
}

/// Key of a path cursor: one per path, agent and optional mode.
///
/// Ordered path first, so the cursors of one path form a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathStateKey {
    pub path_id: PathId,
    pub agent_id: AgentId,
    pub mode: Option<InteractionMode>,
}

/// An agent's cursor on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathState {
    pub path_id: PathId,
    pub agent_id: AgentId,
    pub mode: Option<InteractionMode>,
    pub active_node_id: NodeId,
    pub updated_at: Timestamp,
}

impl PathState {
    #[must_use]
    pub const fn key(&self) -> PathStateKey {
        PathStateKey {
            path_id: self.path_id,
            agent_id: self.agent_id,
            mode: self.mode,
        }
    }
}

// =============================================================================
// PROVENANCE EVIDENCE
// =============================================================================

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Evidence kept for a model-authored node.
///
/// `raw_response_hash` is the value chained into the node hash. When
/// `raw_bytes` is kept, verification re-hashes it instead of trusting the
/// stored digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResponseEvidence {
    pub node_id: NodeId,
    pub raw_response_hash: String,
    pub raw_bytes: Option<Vec<u8>>,
    /// True when the response was assembled from a stream.
    pub streamed: bool,
    pub provider: Option<String>,
    pub provider_request_id: Option<String>,
    pub model_identifier: Option<String>,
    pub token_usage: Option<TokenUsage>,
    pub captured_at: Timestamp,
}

// =============================================================================
// PREFERENCES
// =============================================================================

/// Store-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub default_container_id: ContainerId,
    pub default_mode: InteractionMode,
    pub include_annotations_in_context: bool,
    pub updated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn node_id(n: u128) -> NodeId {
        NodeId(Ulid(n))
    }

    #[test]
    fn order_sources_is_stable_within_role() {
        let mut edge = Edge {
            id: EdgeId(Ulid(1)),
            tree_id: TreeId(Ulid(2)),
            sources: vec![
                EdgeSource {
                    node_id: node_id(10),
                    role: SourceRole::Context,
                },
                EdgeSource {
                    node_id: node_id(11),
                    role: SourceRole::Primary,
                },
                EdgeSource {
                    node_id: node_id(12),
                    role: SourceRole::Context,
                },
            ],
            target_id: node_id(20),
            kind: EdgeKind::Continuation,
            created_at: Timestamp(0),
        };
        edge.order_sources();
        let ids: Vec<NodeId> = edge.source_ids().collect();
        assert_eq!(ids, vec![node_id(11), node_id(10), node_id(12)]);
        assert!(edge.has_source(node_id(12)));
    }

    #[test]
    fn path_state_key_distinguishes_modes() {
        let base = PathStateKey {
            path_id: PathId(Ulid(1)),
            agent_id: AgentId(Ulid(2)),
            mode: None,
        };
        let buffer = PathStateKey {
            mode: Some(InteractionMode::Buffer),
            ..base
        };
        assert_ne!(base, buffer);
        assert!(base < buffer, "the mode-less cursor sorts first");
        let other_path = PathStateKey {
            path_id: PathId(Ulid(2)),
            agent_id: AgentId(Ulid(0)),
            mode: None,
        };
        assert!(buffer < other_path, "cursors group by path before agent");
    }

    #[test]
    fn node_postcard_roundtrip() {
        let node = Node {
            id: node_id(1),
            short_id: "abc123".into(),
            tree_id: TreeId(Ulid(2)),
            content: Content::text("hello"),
            author_id: AgentId(Ulid(3)),
            author_kind: AuthorKind::Human,
            content_hash: "00".repeat(32),
            created_at: Timestamp(5),
            parent_ids: vec![node_id(0)],
            metadata: NodeMetadata::default(),
            edited_from: None,
            version_group: None,
        };
        let bytes = postcard::to_allocvec(&node).expect("encode");
        let back: Node = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(back, node);
        assert_eq!(back.version_group_id(), node.id);
    }
}
