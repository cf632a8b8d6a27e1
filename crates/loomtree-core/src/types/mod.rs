//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the engine:
//! - Identifiers (`TreeId`, `NodeId`, `EdgeId`, `PathId`, `AgentId`, `ContainerId`)
//! - Millisecond timestamps with the ISO rendering used by the hash chain
//! - Small closed enums (`AuthorKind`, `EdgeKind`, `SourceRole`, `InteractionMode`)
//! - Content values (`content`) and persisted records (`records`)
//! - Error types (`LoomError`)
//!
//! ## Determinism Guarantees
//!
//! All identifiers and enums implement `Ord`, so they can key `BTreeMap`s and
//! produce the same iteration order on every run.

pub mod content;
pub mod records;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use ulid::Ulid;

pub use content::{AudioContent, Content, ContentBlock, ImageContent};
pub use records::{
    Edge, EdgeSource, LoomTree, Node, NodeMetadata, ParentCandidate, Path, PathNode,
    PathSelection, PathState, PathStateKey, Preferences, RawResponseEvidence, TokenUsage,
};

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Allocate a fresh, time-sortable identifier.
            pub fn generate() -> Result<Self, LoomError> {
                crate::ids::new_id().map(Self)
            }

            /// The underlying ULID.
            #[must_use]
            pub const fn ulid(self) -> Ulid {
                self.0
            }

            /// The ULID as a 128-bit integer, the form storage keys use.
            #[must_use]
            pub const fn raw(self) -> u128 {
                self.0.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = LoomError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(s.trim()).map(Self).map_err(|e| {
                    LoomError::Validation(format!("invalid {} id '{}': {}", $label, s, e))
                })
            }
        }
    };
}

ulid_id!(
    /// Identifier of a Loom Tree.
    TreeId,
    "tree"
);
ulid_id!(
    /// Primary identifier of a node. Globally unique, sortable by creation time.
    NodeId,
    "node"
);
ulid_id!(
    /// Identifier of a (hyper)edge.
    EdgeId,
    "edge"
);
ulid_id!(
    /// Identifier of an agent-owned path.
    PathId,
    "path"
);
ulid_id!(
    /// Identifier of an agent (human or model). Authors nodes and owns paths.
    AgentId,
    "agent"
);
ulid_id!(
    /// Identifier of the container (workspace, folder) owning a tree.
    ContainerId,
    "container"
);

// =============================================================================
// TIMESTAMPS
// =============================================================================

/// Milliseconds since the Unix epoch, UTC.
///
/// Millisecond precision is part of the hash chain: the ISO rendering of a
/// node's creation time is a hash input, so sub-millisecond precision must
/// never be stored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time truncated to milliseconds.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Render as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn to_iso(self) -> Result<String, LoomError> {
        DateTime::<Utc>::from_timestamp_millis(self.0)
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .ok_or_else(|| {
                LoomError::Validation(format!("timestamp {} ms is out of range", self.0))
            })
    }

    /// Parse any RFC 3339 timestamp, keeping millisecond precision.
    pub fn parse_iso(s: &str) -> Result<Self, LoomError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self(dt.timestamp_millis()))
            .map_err(|e| LoomError::Validation(format!("invalid timestamp '{}': {}", s, e)))
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Who produced a node. Fixed at creation; selects the hash variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorKind {
    Human,
    Model,
}

impl fmt::Display for AuthorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Human => f.write_str("human"),
            Self::Model => f.write_str("model"),
        }
    }
}

/// Kind of a hyperedge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Traversal edge (parent → child in the conversation).
    Continuation,
    /// Side comment. Not traversed and left out of context by default.
    Annotation,
}

/// Role of one source inside a hyperedge.
///
/// The declaration order is the ordering of sources inside an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRole {
    Primary,
    Context,
    Instruction,
}

/// How a tree is rendered and assembled. Immutable after tree creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum InteractionMode {
    /// Turn-based chat: each node is one message.
    #[default]
    Dialogue,
    /// Free-form document: nodes are spans, edits create versions.
    Buffer,
}

impl InteractionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dialogue => "dialogue",
            Self::Buffer => "buffer",
        }
    }
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionMode {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dialogue" => Ok(Self::Dialogue),
            "buffer" => Ok(Self::Buffer),
            other => Err(LoomError::Validation(format!(
                "unknown interaction mode '{}' (expected dialogue or buffer)",
                other
            ))),
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Loom Tree engine.
///
/// - `InvalidState` means the stored graph broke an integrity rule. It is never
///   recovered locally and always reaches the caller unmodified.
/// - `SelectionRequired` is expected: the caller records a selection and retries.
/// - Hash verification returns structured results; `Unverifiable` and
///   `HashMismatch` only appear here when a caller asks for a strict check.
#[derive(Debug, Error)]
pub enum LoomError {
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Malformed input, e.g. advancing a path to a node that is not a child.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A uniqueness rule was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Graph or path integrity is broken in storage.
    #[error("Invalid graph state: {0}")]
    InvalidState(String),

    /// Backward resolution hit an ambiguity with no stored selection.
    #[error("Selection required on path {path} at node {node}: {} candidate parents", candidates.len())]
    SelectionRequired {
        path: PathId,
        node: NodeId,
        candidates: Vec<ParentCandidate>,
    },

    /// Verification needs evidence that is not stored.
    #[error("Node {node} is unverifiable: {reason}")]
    Unverifiable { node: NodeId, reason: String },

    /// Verification ran and the recomputed hash differs from the stored one.
    #[error("Hash mismatch on node {node}: stored {stored}, recomputed {recomputed}")]
    HashMismatch {
        node: NodeId,
        stored: String,
        recomputed: String,
    },

    /// The identifier generator ran out of monotonic space in this millisecond.
    #[error("Identifier generation failed: {0}")]
    IdExhausted(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A storage I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

impl LoomError {
    /// Build a `NotFound` error for a record kind.
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code, used by the app layer.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::InvalidState(_) => "invalid_state",
            Self::SelectionRequired { .. } => "selection_required",
            Self::Unverifiable { .. } => "unverifiable",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::IdExhausted(_) => "id_exhausted",
            Self::SerializationError(_) => "serialization",
            Self::IoError(_) => "io",
        }
    }

    /// Whether the caller is expected to fix the situation and retry.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::SelectionRequired { .. })
    }
}

// =============================================================================
// TESTS
// =============================================================================
