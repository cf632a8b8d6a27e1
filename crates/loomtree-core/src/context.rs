//! # Context Assembly
//!
//! Turns a path's cached node sequence into the input handed to a model
//! provider. Dialogue trees produce role-tagged messages; buffer trees produce
//! one concatenated document.
//!
//! Assembly only reads: it never seeds or repairs the path cache.

use crate::graph::LoomRead;
use crate::hypergraph::find_annotations;
use crate::path::require_live_path;
use crate::{AuthorKind, InteractionMode, LoomError, Node, NodeId, PathId, TreeId};
use serde::{Deserialize, Serialize};

/// Speaker of one dialogue message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl From<AuthorKind> for MessageRole {
    fn from(kind: AuthorKind) -> Self {
        match kind {
            AuthorKind::Human => Self::User,
            AuthorKind::Model => Self::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub node_id: NodeId,
    pub text: String,
    /// Set for annotation notes pulled in alongside the node they annotate.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub annotation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextBody {
    Messages { messages: Vec<ContextMessage> },
    Document { text: String },
}

/// What a provider receives for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub tree_id: TreeId,
    pub path_id: PathId,
    pub mode: InteractionMode,
    pub system: Option<String>,
    pub body: ContextBody,
    /// Nodes that contributed, in order.
    pub node_ids: Vec<NodeId>,
    /// Last node of the path when assembled, included or not.
    pub path_tail: Option<NodeId>,
}

impl AssembledContext {
    /// Last node of the path, which a generation continues from.
    #[must_use]
    pub fn tail(&self) -> Option<NodeId> {
        self.path_tail
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.body {
            ContextBody::Messages { messages } => messages.is_empty(),
            ContextBody::Document { text } => text.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub include_annotations: bool,
    /// Keep nodes flagged `excluded` in their metadata.
    pub include_excluded: bool,
}

/// Assemble the context for `path_id` from its cached sequence.
pub fn assemble_context<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
    options: ContextOptions,
) -> Result<AssembledContext, LoomError> {
    let path = require_live_path(store, path_id)?;
    let tree = store.require_tree(path.tree_id)?;

    let sequence = store.path_nodes(path_id)?;
    let path_tail = sequence.last().copied();
    let mut included: Vec<Node> = Vec::new();
    for node_id in sequence {
        let node = store.require_node(node_id)?;
        if node.metadata.excluded && !options.include_excluded {
            continue;
        }
        included.push(node);
    }
    let node_ids = included.iter().map(|n| n.id).collect();

    let body = match tree.mode {
        InteractionMode::Dialogue => {
            let mut messages = Vec::with_capacity(included.len());
            for node in &included {
                messages.push(ContextMessage {
                    role: node.author_kind.into(),
                    node_id: node.id,
                    text: node.content.render_text(),
                    annotation: false,
                });
                if options.include_annotations {
                    for note in find_annotations(store, node.id)? {
                        if note.metadata.excluded && !options.include_excluded {
                            continue;
                        }
                        messages.push(ContextMessage {
                            role: MessageRole::User,
                            node_id: note.id,
                            text: note.content.render_text(),
                            annotation: true,
                        });
                    }
                }
            }
            ContextBody::Messages { messages }
        }
        // Annotations are commentary, never part of the document text.
        InteractionMode::Buffer => ContextBody::Document {
            text: included.iter().map(|n| n.content.render_text()).collect(),
        },
    };

    Ok(AssembledContext {
        tree_id: tree.id,
        path_id,
        mode: tree.mode,
        system: tree.system_context,
        body,
        node_ids,
        path_tail,
    })
}
