//! # Hypergraph Model
//!
//! Node, edge and tree operations over a [`LoomRead`] / [`LoomWrite`] store.
//!
//! Nodes are immutable once written, apart from [`NodeMetadata`], which is
//! only ever changed through [`update_node_metadata`]. Edges are created once;
//! their source sets change only through [`add_source_to_edge`] and
//! [`remove_source_from_edge`].
//!
//! Writes are meant to run inside one `LoomStore::transact` call together with
//! whatever path updates accompany them.

use crate::graph::{LoomRead, LoomWrite};
use crate::ids::{derive_short_id_by, short_id_source};
use crate::primitives::{
    CONTENT_HASH_HEX_LEN, MAX_ANCESTRY_DEPTH, MAX_EDGE_SOURCES, MAX_LABEL_LENGTH,
};
use crate::provenance::{HashAuthor, compute_node_hash};
use crate::{
    AgentId, AuthorKind, ContainerId, Content, Edge, EdgeId, EdgeKind, EdgeSource,
    InteractionMode, LoomError, LoomTree, Node, NodeId, NodeMetadata, SourceRole, Timestamp,
    TreeId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

// =============================================================================
// INPUT TYPES
// =============================================================================

/// Everything needed to persist a node whose hash was computed by the caller.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub tree_id: TreeId,
    pub content: Content,
    pub author_id: AgentId,
    pub author_kind: AuthorKind,
    pub content_hash: String,
    pub created_at: Timestamp,
    pub parent_ids: Vec<NodeId>,
    pub edited_from: Option<NodeId>,
    pub version_group: Option<NodeId>,
}

/// A persisted node together with the edges created for it.
#[derive(Debug, Clone)]
pub struct CreatedNode {
    pub node: Node,
    pub edges: Vec<Edge>,
    /// The short id needed a random suffix.
    pub short_id_degraded: bool,
}

/// Who authored a node being appended, and the evidence its hash needs.
#[derive(Debug, Clone, Copy)]
pub enum NodeAuthor<'a> {
    Human(AgentId),
    Model {
        agent: AgentId,
        raw_response_hash: &'a str,
    },
}

impl<'a> NodeAuthor<'a> {
    const fn agent(&self) -> AgentId {
        match self {
            Self::Human(agent) | Self::Model { agent, .. } => *agent,
        }
    }

    const fn kind(&self) -> AuthorKind {
        match self {
            Self::Human(_) => AuthorKind::Human,
            Self::Model { .. } => AuthorKind::Model,
        }
    }

    const fn hash_author(&self) -> HashAuthor<'a> {
        match *self {
            Self::Human(agent) => HashAuthor::Human(agent),
            Self::Model {
                raw_response_hash, ..
            } => HashAuthor::Model { raw_response_hash },
        }
    }
}

/// Parameters of a new tree.
#[derive(Debug, Clone)]
pub struct NewTree {
    pub container_id: ContainerId,
    pub mode: InteractionMode,
    pub system_context: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub root_content: Content,
    pub root_author: AgentId,
}

/// Partial update of node metadata. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub bookmarked: Option<bool>,
    /// `Some(None)` clears the label.
    pub bookmark_label: Option<Option<String>>,
    pub pruned: Option<bool>,
    pub excluded: Option<bool>,
}

impl MetadataPatch {
    fn apply(&self, metadata: &mut NodeMetadata) -> Result<(), LoomError> {
        if let Some(Some(label)) = &self.bookmark_label {
            validate_label("bookmark label", label)?;
        }
        if let Some(bookmarked) = self.bookmarked {
            metadata.bookmarked = bookmarked;
        }
        if let Some(label) = &self.bookmark_label {
            metadata.bookmark_label.clone_from(label);
        }
        if let Some(pruned) = self.pruned {
            metadata.pruned = pruned;
        }
        if let Some(excluded) = self.excluded {
            metadata.excluded = excluded;
        }
        Ok(())
    }
}

/// Partial update of the mutable tree details.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDetailsPatch {
    pub title: Option<Option<String>>,
    pub description: Option<Option<String>>,
    pub summary: Option<Option<String>>,
}

// =============================================================================
// VALIDATION HELPERS
// =============================================================================

pub(crate) fn validate_label(what: &str, value: &str) -> Result<(), LoomError> {
    if value.len() > MAX_LABEL_LENGTH {
        return Err(LoomError::Validation(format!(
            "{} is {} bytes (max {})",
            what,
            value.len(),
            MAX_LABEL_LENGTH
        )));
    }
    Ok(())
}

fn validate_hash(hash: &str) -> Result<(), LoomError> {
    if hash.len() != CONTENT_HASH_HEX_LEN
        || !hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(LoomError::Validation(format!(
            "content hash '{}' is not {} lowercase hex characters",
            hash, CONTENT_HASH_HEX_LEN
        )));
    }
    Ok(())
}

/// Fetch a tree that exists and is not soft-deleted.
pub fn require_live_tree<R: LoomRead + ?Sized>(
    store: &R,
    tree_id: TreeId,
) -> Result<LoomTree, LoomError> {
    let tree = store.require_tree(tree_id)?;
    if tree.is_deleted() {
        return Err(LoomError::Validation(format!(
            "tree {} is deleted",
            tree_id
        )));
    }
    Ok(tree)
}

fn require_node_in_tree<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
    tree_id: TreeId,
) -> Result<Node, LoomError> {
    let node = store.require_node(node_id)?;
    if node.tree_id != tree_id {
        return Err(LoomError::Validation(format!(
            "node {} belongs to tree {}, not {}",
            node_id, node.tree_id, tree_id
        )));
    }
    Ok(node)
}

// =============================================================================
// TREES
// =============================================================================

/// Create a tree and its root node.
pub fn create_tree(
    store: &mut dyn LoomWrite,
    new_tree: NewTree,
) -> Result<(LoomTree, CreatedNode), LoomError> {
    for (what, value) in [
        ("title", &new_tree.title),
        ("description", &new_tree.description),
    ] {
        if let Some(value) = value {
            validate_label(what, value)?;
        }
    }
    new_tree.root_content.validate()?;

    let now = Timestamp::now();
    let tree_id = TreeId::generate()?;
    let root_id = NodeId::generate()?;
    let tree = LoomTree {
        id: tree_id,
        container_id: new_tree.container_id,
        root_node_id: root_id,
        mode: new_tree.mode,
        system_context: new_tree.system_context,
        title: new_tree.title,
        description: new_tree.description,
        summary: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    store.put_tree(&tree)?;

    let content_hash = compute_node_hash(
        &new_tree.root_content,
        &[],
        now,
        HashAuthor::Human(new_tree.root_author),
    )?;
    let root = insert_node(
        store,
        root_id,
        NewNode {
            tree_id,
            content: new_tree.root_content,
            author_id: new_tree.root_author,
            author_kind: AuthorKind::Human,
            content_hash,
            created_at: now,
            parent_ids: Vec::new(),
            edited_from: None,
            version_group: None,
        },
    )?;

    tracing::info!(tree = %tree_id, root = %root_id, mode = %tree.mode, "tree created");
    Ok((tree, root))
}

/// Apply a details patch and bump `updated_at`.
pub fn update_tree_details(
    store: &mut dyn LoomWrite,
    tree_id: TreeId,
    patch: &TreeDetailsPatch,
) -> Result<LoomTree, LoomError> {
    let mut tree = require_live_tree(&*store, tree_id)?;
    for (what, value) in [
        ("title", &patch.title),
        ("description", &patch.description),
        ("summary", &patch.summary),
    ] {
        if let Some(Some(value)) = value {
            validate_label(what, value)?;
        }
    }
    if let Some(title) = &patch.title {
        tree.title.clone_from(title);
    }
    if let Some(description) = &patch.description {
        tree.description.clone_from(description);
    }
    if let Some(summary) = &patch.summary {
        tree.summary.clone_from(summary);
    }
    tree.updated_at = Timestamp::now();
    store.put_tree(&tree)?;
    Ok(tree)
}

/// Mark a tree deleted. Its nodes and edges stay readable.
pub fn soft_delete_tree(store: &mut dyn LoomWrite, tree_id: TreeId) -> Result<LoomTree, LoomError> {
    let mut tree = require_live_tree(&*store, tree_id)?;
    let now = Timestamp::now();
    tree.deleted_at = Some(now);
    tree.updated_at = now;
    store.put_tree(&tree)?;
    tracing::info!(tree = %tree_id, "tree soft-deleted");
    Ok(tree)
}

// =============================================================================
// NODES
// =============================================================================

/// Persist a node with a caller-computed hash and link it to its parents.
///
/// One continuation edge with a single primary source is created per parent.
pub fn create_node(store: &mut dyn LoomWrite, new_node: NewNode) -> Result<CreatedNode, LoomError> {
    require_live_tree(&*store, new_node.tree_id)?;
    let id = NodeId::generate()?;
    insert_node(store, id, new_node)
}

fn insert_node(
    store: &mut dyn LoomWrite,
    id: NodeId,
    mut new_node: NewNode,
) -> Result<CreatedNode, LoomError> {
    new_node.content.validate()?;
    validate_hash(&new_node.content_hash)?;

    let mut seen = BTreeSet::new();
    new_node.parent_ids.retain(|p| seen.insert(*p));
    new_node.parent_ids.sort();
    for parent in &new_node.parent_ids {
        require_node_in_tree(&*store, *parent, new_node.tree_id)?;
    }

    let tree_id = new_node.tree_id;
    let short = derive_short_id_by(
        &short_id_source(id.ulid()),
        |candidate| store.short_id_taken(tree_id, candidate),
        &mut rand::rng(),
    )?;
    if short.degraded {
        tracing::warn!(
            node = %id,
            short_id = %short.value,
            "short id prefixes exhausted, using random suffix"
        );
    }

    let node = Node {
        id,
        short_id: short.value,
        tree_id: new_node.tree_id,
        content: new_node.content,
        author_id: new_node.author_id,
        author_kind: new_node.author_kind,
        content_hash: new_node.content_hash,
        created_at: new_node.created_at,
        parent_ids: new_node.parent_ids,
        metadata: NodeMetadata::default(),
        edited_from: new_node.edited_from,
        version_group: new_node.version_group,
    };
    store.put_node(&node)?;

    let mut edges = Vec::with_capacity(node.parent_ids.len());
    for parent in &node.parent_ids {
        let edge = Edge {
            id: EdgeId::generate()?,
            tree_id: node.tree_id,
            sources: vec![EdgeSource {
                node_id: *parent,
                role: SourceRole::Primary,
            }],
            target_id: node.id,
            kind: EdgeKind::Continuation,
            created_at: node.created_at,
        };
        store.put_edge(&edge)?;
        edges.push(edge);
    }

    tracing::debug!(
        node = %node.id,
        short_id = %node.short_id,
        tree = %node.tree_id,
        parents = node.parent_ids.len(),
        "node created"
    );

    Ok(CreatedNode {
        node,
        edges,
        short_id_degraded: short.degraded,
    })
}

/// Compute the hash for a new node from its parents' stored hashes, then
/// persist it with [`create_node`].
pub fn append_node(
    store: &mut dyn LoomWrite,
    tree_id: TreeId,
    content: Content,
    author: NodeAuthor<'_>,
    parent_ids: &[NodeId],
) -> Result<CreatedNode, LoomError> {
    let created_at = Timestamp::now();
    let parent_hashes = parent_hashes(&*store, parent_ids)?;
    let content_hash =
        compute_node_hash(&content, &parent_hashes, created_at, author.hash_author())?;
    create_node(
        store,
        NewNode {
            tree_id,
            content,
            author_id: author.agent(),
            author_kind: author.kind(),
            content_hash,
            created_at,
            parent_ids: parent_ids.to_vec(),
            edited_from: None,
            version_group: None,
        },
    )
}

pub(crate) fn parent_hashes<R: LoomRead + ?Sized>(
    store: &R,
    parent_ids: &[NodeId],
) -> Result<Vec<String>, LoomError> {
    let unique: BTreeSet<NodeId> = parent_ids.iter().copied().collect();
    unique
        .into_iter()
        .map(|id| store.require_node(id).map(|n| n.content_hash))
        .collect()
}

/// Current metadata of a node.
pub fn node_metadata<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<NodeMetadata, LoomError> {
    Ok(store.require_node(node_id)?.metadata)
}

/// Apply a metadata patch. Content and hash are untouched.
pub fn update_node_metadata(
    store: &mut dyn LoomWrite,
    node_id: NodeId,
    patch: &MetadataPatch,
) -> Result<Node, LoomError> {
    let mut node = store.require_node(node_id)?;
    patch.apply(&mut node.metadata)?;
    store.put_node(&node)?;
    Ok(node)
}

// =============================================================================
// EDGES
// =============================================================================

pub(crate) fn validate_edge_shape(edge: &Edge) -> Result<(), LoomError> {
    if edge.sources.is_empty() {
        return Err(LoomError::Validation("edge needs at least one source".into()));
    }
    if edge.sources.len() > MAX_EDGE_SOURCES {
        return Err(LoomError::Validation(format!(
            "edge has {} sources (max {})",
            edge.sources.len(),
            MAX_EDGE_SOURCES
        )));
    }
    let unique: BTreeSet<NodeId> = edge.source_ids().collect();
    if unique.len() != edge.sources.len() {
        return Err(LoomError::Validation("edge lists a source twice".into()));
    }
    if unique.contains(&edge.target_id) {
        return Err(LoomError::Validation(
            "edge target cannot be one of its sources".into(),
        ));
    }
    Ok(())
}

/// Whether `to` is reachable from `from` along continuation edges.
fn reaches<R: LoomRead + ?Sized>(store: &R, from: NodeId, to: NodeId) -> Result<bool, LoomError> {
    let mut seen = BTreeSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if current == to {
            return Ok(true);
        }
        if seen.len() > MAX_ANCESTRY_DEPTH {
            return Err(LoomError::InvalidState(format!(
                "descendant walk from {} exceeds {} nodes",
                from, MAX_ANCESTRY_DEPTH
            )));
        }
        for edge in store.edges_by_source(current)? {
            if edge.is_continuation() && seen.insert(edge.target_id) {
                queue.push_back(edge.target_id);
            }
        }
    }
    Ok(false)
}

/// Validate endpoints of a continuation edge: same tree, root never a target,
/// no cycles.
fn validate_edge_endpoints<R: LoomRead + ?Sized>(store: &R, edge: &Edge) -> Result<(), LoomError> {
    let tree = store.require_tree(edge.tree_id)?;
    require_node_in_tree(store, edge.target_id, edge.tree_id)?;
    for source in edge.source_ids() {
        require_node_in_tree(store, source, edge.tree_id)?;
    }
    if edge.is_continuation() {
        if edge.target_id == tree.root_node_id {
            return Err(LoomError::Validation(
                "the root cannot be the target of a continuation edge".into(),
            ));
        }
        for source in edge.source_ids() {
            if reaches(store, edge.target_id, source)? {
                return Err(LoomError::Validation(format!(
                    "edge from {} to {} would create a cycle",
                    source, edge.target_id
                )));
            }
        }
    }
    Ok(())
}

/// Create a hyperedge between existing nodes of one tree.
pub fn create_edge(
    store: &mut dyn LoomWrite,
    tree_id: TreeId,
    sources: Vec<EdgeSource>,
    target_id: NodeId,
    kind: EdgeKind,
) -> Result<Edge, LoomError> {
    require_live_tree(&*store, tree_id)?;
    let mut edge = Edge {
        id: EdgeId::generate()?,
        tree_id,
        sources,
        target_id,
        kind,
        created_at: Timestamp::now(),
    };
    edge.order_sources();
    validate_edge_shape(&edge)?;
    validate_edge_endpoints(&*store, &edge)?;
    store.put_edge(&edge)?;
    Ok(edge)
}

/// Add one source to an existing edge.
pub fn add_source_to_edge(
    store: &mut dyn LoomWrite,
    edge_id: EdgeId,
    source: EdgeSource,
) -> Result<Edge, LoomError> {
    let mut edge = store.require_edge(edge_id)?;
    if edge.has_source(source.node_id) {
        return Err(LoomError::Conflict(format!(
            "node {} is already a source of edge {}",
            source.node_id, edge_id
        )));
    }
    edge.sources.push(source);
    edge.order_sources();
    validate_edge_shape(&edge)?;
    validate_edge_endpoints(&*store, &edge)?;
    store.put_edge(&edge)?;
    Ok(edge)
}

/// Remove one source from an edge. Removing the last source deletes the
/// edge, in which case `None` is returned.
pub fn remove_source_from_edge(
    store: &mut dyn LoomWrite,
    edge_id: EdgeId,
    node_id: NodeId,
) -> Result<Option<Edge>, LoomError> {
    let mut edge = store.require_edge(edge_id)?;
    if !edge.has_source(node_id) {
        return Err(LoomError::not_found("edge source", node_id));
    }
    edge.sources.retain(|s| s.node_id != node_id);
    if edge.sources.is_empty() {
        store.delete_edge(edge_id)?;
        tracing::debug!(edge = %edge_id, "last source removed, edge deleted");
        return Ok(None);
    }
    store.put_edge(&edge)?;
    Ok(Some(edge))
}

/// Attach an annotation node to `target`.
///
/// The annotation edge runs from the annotated node to the annotation, so the
/// annotation's hash chains the annotated node's hash.
pub fn create_annotation(
    store: &mut dyn LoomWrite,
    target: NodeId,
    content: Content,
    author: AgentId,
) -> Result<CreatedNode, LoomError> {
    let annotated = store.require_node(target)?;
    require_live_tree(&*store, annotated.tree_id)?;

    let created_at = Timestamp::now();
    let content_hash = compute_node_hash(
        &content,
        std::slice::from_ref(&annotated.content_hash),
        created_at,
        HashAuthor::Human(author),
    )?;
    let id = NodeId::generate()?;
    let mut created = insert_node(
        store,
        id,
        NewNode {
            tree_id: annotated.tree_id,
            content,
            author_id: author,
            author_kind: AuthorKind::Human,
            content_hash,
            created_at,
            parent_ids: Vec::new(),
            edited_from: None,
            version_group: None,
        },
    )?;

    // Chain the annotated node without creating a continuation edge.
    created.node.parent_ids = vec![target];
    store.put_node(&created.node)?;

    let edge = Edge {
        id: EdgeId::generate()?,
        tree_id: annotated.tree_id,
        sources: vec![EdgeSource {
            node_id: target,
            role: SourceRole::Primary,
        }],
        target_id: id,
        kind: EdgeKind::Annotation,
        created_at,
    };
    store.put_edge(&edge)?;
    created.edges.push(edge);
    Ok(created)
}

// =============================================================================
// TRAVERSAL
// =============================================================================

/// Continuation edges targeting `node`: 0 means root, 1 unambiguous, more
/// means a merge that needs a path selection.
pub fn find_parent_edges<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<Edge>, LoomError> {
    Ok(store
        .edges_by_target(node_id)?
        .into_iter()
        .filter(Edge::is_continuation)
        .collect())
}

/// Targets of continuation edges that list `node` as a source, in edge order.
pub fn find_children<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<Node>, LoomError> {
    let mut seen = BTreeSet::new();
    let mut children = Vec::new();
    for edge in store.edges_by_source(node_id)? {
        if edge.is_continuation() && seen.insert(edge.target_id) {
            children.push(store.require_node(edge.target_id)?);
        }
    }
    Ok(children)
}

/// Annotation nodes attached to `node`.
pub fn find_annotations<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<Node>, LoomError> {
    store
        .edges_by_source(node_id)?
        .into_iter()
        .filter(|e| e.kind == EdgeKind::Annotation)
        .map(|e| store.require_node(e.target_id))
        .collect()
}

/// Whether a node is the target of an annotation edge.
pub fn is_annotation<R: LoomRead + ?Sized>(store: &R, node_id: NodeId) -> Result<bool, LoomError> {
    Ok(store
        .edges_by_target(node_id)?
        .iter()
        .any(|e| e.kind == EdgeKind::Annotation))
}

/// The unique node of a tree with no incoming continuation edge.
///
/// Annotation nodes hang off annotation edges and are not root candidates.
/// Zero candidates, several candidates, or a candidate other than the tree's
/// recorded root are all `InvalidState`.
pub fn find_root<R: LoomRead + ?Sized>(store: &R, tree_id: TreeId) -> Result<Node, LoomError> {
    let tree = store.require_tree(tree_id)?;
    let mut roots = Vec::new();
    for node in store.tree_nodes(tree_id)? {
        let incoming = store.edges_by_target(node.id)?;
        if incoming.is_empty() {
            roots.push(node);
        }
    }

    match roots.len() {
        0 => Err(LoomError::InvalidState(format!(
            "tree {} has no root node",
            tree_id
        ))),
        1 => {
            let root = roots.remove(0);
            if root.id != tree.root_node_id {
                return Err(LoomError::InvalidState(format!(
                    "tree {} records root {} but the graph root is {}",
                    tree_id, tree.root_node_id, root.id
                )));
            }
            Ok(root)
        }
        n => Err(LoomError::InvalidState(format!(
            "tree {} has {} root nodes: {}",
            tree_id,
            n,
            roots
                .iter()
                .map(|r| r.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

// =============================================================================
// TESTS
// =============================================================================
