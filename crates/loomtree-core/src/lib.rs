//! # loomtree-core
//!
//! The engine behind Loom Trees: branching, multi-agent conversations kept as
//! an append-mostly hypergraph of immutable content nodes.
//!
//! - **Hypergraph**: nodes, role-tagged multi-source edges, trees.
//! - **Paths**: each agent's deterministic view through the hypergraph, with
//!   stored selections wherever the graph is ambiguous.
//! - **Provenance**: a SHA-256 hash chain over canonical content, parent
//!   hashes, creation time and author or raw provider response.
//! - **Versioning**: buffer-mode edits that never mutate the original.
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies (pure Rust)
//! - `BTreeMap` ordering everywhere, no floats
//! - Every multi-record mutation runs inside one `LoomStore::transact`

// =============================================================================
// MODULES
// =============================================================================

pub mod canonical;
pub mod context;
pub mod export;
pub mod generation;
pub mod graph;
pub mod hypergraph;
pub mod ids;
pub mod path;
pub mod primitives;
pub mod provenance;
pub mod session;
pub mod storage;
pub mod types;
pub mod versioning;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{
    AgentId, AudioContent, AuthorKind, ContainerId, Content, ContentBlock, Edge, EdgeId,
    EdgeKind, EdgeSource, ImageContent, InteractionMode, LoomError, LoomTree, Node, NodeId,
    NodeMetadata, ParentCandidate, Path, PathId, PathNode, PathSelection, PathState, PathStateKey,
    Preferences, RawResponseEvidence, SourceRole, Timestamp, TokenUsage, TreeId,
};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use context::{AssembledContext, ContextBody, ContextMessage, ContextOptions, MessageRole};
pub use export::{TreeSnapshot, decode_snapshot, export_tree, import_tree};
pub use generation::{
    Completion, GeneratedNode, ProviderError, ProviderErrorCode, RetryPolicy, record_completion,
};
pub use graph::{LoomGraph, LoomRead, LoomStore, LoomWrite};
pub use hypergraph::{CreatedNode, MetadataPatch, NewTree, NodeAuthor, TreeDetailsPatch};
pub use provenance::{
    AuditReport, RawResponse, VerificationFailure, VerificationResult, audit_tree, verify_chain,
    verify_node,
};
pub use session::{Appended, NodeView, PreferencesPatch, Session, StorageBackend};
pub use storage::RedbLoom;
pub use versioning::EditOutcome;

#[cfg(feature = "crypto-hash")]
pub use export::tree_digest;
