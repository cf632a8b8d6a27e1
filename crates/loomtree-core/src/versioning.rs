//! # Versioning (buffer mode)
//!
//! An edit never touches the original node. It creates a new node that:
//! - points back with `edited_from`,
//! - joins the original's version group,
//! - hangs off the same parents as the original,
//! - is added as an extra source on every continuation edge leaving the
//!   original, so existing continuations stay reachable from either version.

use crate::graph::{LoomRead, LoomWrite};
use crate::hypergraph::{
    CreatedNode, NewNode, add_source_to_edge, create_node, find_parent_edges, parent_hashes,
    require_live_tree,
};
use crate::primitives::MAX_ANCESTRY_DEPTH;
use crate::provenance::compute_human_hash;
use crate::{
    AgentId, AuthorKind, Content, EdgeId, EdgeSource, InteractionMode, LoomError, Node, NodeId,
    Timestamp,
};
use std::collections::BTreeSet;

/// Result of an edit.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub created: CreatedNode,
    /// Outgoing edges of the original that gained the new node as a source.
    pub extended_edges: Vec<EdgeId>,
}

/// Create a revised version of `node_id` with `content`.
///
/// Only buffer-mode trees can be edited, and never at the root.
pub fn edit_node(
    store: &mut dyn LoomWrite,
    node_id: NodeId,
    content: Content,
    author: AgentId,
) -> Result<EditOutcome, LoomError> {
    let original = store.require_node(node_id)?;
    let tree = require_live_tree(&*store, original.tree_id)?;
    if tree.mode != InteractionMode::Buffer {
        return Err(LoomError::Validation(format!(
            "tree {} is in {} mode; only buffer trees support edits",
            tree.id, tree.mode
        )));
    }
    if original.id == tree.root_node_id {
        return Err(LoomError::Validation("the root node cannot be edited".into()));
    }

    let mut parents = BTreeSet::new();
    for edge in find_parent_edges(&*store, original.id)? {
        parents.extend(edge.source_ids());
    }
    let parent_ids: Vec<NodeId> = parents.into_iter().collect();

    let created_at = Timestamp::now();
    let hashes = parent_hashes(&*store, &parent_ids)?;
    let content_hash = compute_human_hash(&content, &hashes, created_at, author)?;
    let created = create_node(
        store,
        NewNode {
            tree_id: original.tree_id,
            content,
            author_id: author,
            author_kind: AuthorKind::Human,
            content_hash,
            created_at,
            parent_ids,
            edited_from: Some(original.id),
            version_group: Some(original.version_group_id()),
        },
    )?;

    let mut extended_edges = Vec::new();
    for edge in store.edges_by_source(original.id)? {
        if !edge.is_continuation() {
            continue;
        }
        let role = edge
            .sources
            .iter()
            .find(|s| s.node_id == original.id)
            .map(|s| s.role)
            .ok_or_else(|| {
                LoomError::InvalidState(format!(
                    "edge {} is indexed under {} but does not list it",
                    edge.id, original.id
                ))
            })?;
        add_source_to_edge(
            store,
            edge.id,
            EdgeSource {
                node_id: created.node.id,
                role,
            },
        )?;
        extended_edges.push(edge.id);
    }

    tracing::info!(
        original = %original.id,
        edit = %created.node.id,
        group = %original.version_group_id(),
        extended = extended_edges.len(),
        "node edited"
    );
    Ok(EditOutcome {
        created,
        extended_edges,
    })
}

/// Every version sharing `node_id`'s version group, oldest first.
pub fn versions_of<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<Node>, LoomError> {
    let node = store.require_node(node_id)?;
    store.version_group_members(node.version_group_id())
}

/// The edit chain from the unedited original to `node_id`, oldest first.
pub fn lineage<R: LoomRead + ?Sized>(store: &R, node_id: NodeId) -> Result<Vec<Node>, LoomError> {
    let mut chain = vec![store.require_node(node_id)?];
    let mut seen = BTreeSet::from([node_id]);
    while let Some(previous) = chain.last().and_then(|n| n.edited_from) {
        if !seen.insert(previous) || chain.len() >= MAX_ANCESTRY_DEPTH {
            return Err(LoomError::InvalidState(format!(
                "edit lineage of {} loops or exceeds {} nodes",
                node_id, MAX_ANCESTRY_DEPTH
            )));
        }
        chain.push(store.require_node(previous)?);
    }
    chain.reverse();
    Ok(chain)
}

/// Nodes created as direct edits of `node_id`.
pub fn direct_edits<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<Node>, LoomError> {
    store.require_node(node_id)?;
    store.nodes_edited_from(node_id)
}
