//! # Session Module
//!
//! One handle over a Loom store that runs every user-level operation as a
//! single transaction.
//!
//! ## Storage Backends
//!
//! - `InMemory`: `LoomGraph` (fast, volatile)
//! - `Persistent`: `RedbLoom` (disk-backed, ACID)
//!
//! Each write method composes the engine's primitives inside one
//! `transact` call: appending a message creates the node, its hash and edges,
//! extends the path and moves the author's cursor, or does none of it.

use crate::context::{AssembledContext, ContextOptions, assemble_context};
use crate::export::{export_tree, import_tree};
use crate::generation::{Completion, GeneratedNode, record_completion};
use crate::graph::{LoomGraph, LoomRead, LoomStore, LoomWrite};
use crate::hypergraph::{
    CreatedNode, MetadataPatch, NewTree, NodeAuthor, TreeDetailsPatch, append_node,
    create_annotation, create_tree, find_annotations, find_children, find_parent_edges, find_root,
    require_live_tree, soft_delete_tree, update_node_metadata, update_tree_details,
};
use crate::path::{
    advance, clear_selection, create_path, navigate_to, require_live_path, resolve_tail,
    set_active_node, soft_delete_path, truncate, upsert_selection,
};
use crate::provenance::{AuditReport, VerificationResult, audit_tree, verify_chain, verify_node};
use crate::storage::RedbLoom;
use crate::versioning::{EditOutcome, edit_node, lineage, versions_of};
use crate::{
    AgentId, ContainerId, Content, Edge, EdgeId, InteractionMode, LoomError, LoomTree, Node,
    NodeId, Path, PathId, PathSelection, PathState, Preferences, Timestamp, TreeId,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// STORAGE BACKEND
// =============================================================================

/// Storage backend for a Session.
#[derive(Debug)]
pub enum StorageBackend {
    /// In-memory store (fast, volatile).
    InMemory(LoomGraph),
    /// Disk-backed store using redb (ACID, persistent).
    Persistent(RedbLoom),
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory(LoomGraph::new())
    }
}

impl LoomStore for StorageBackend {
    fn read<T, F>(&self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&dyn LoomRead) -> Result<T, LoomError>,
    {
        match self {
            Self::InMemory(graph) => graph.read(f),
            Self::Persistent(redb) => redb.read(f),
        }
    }

    fn transact<T, F>(&mut self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&mut dyn LoomWrite) -> Result<T, LoomError>,
    {
        match self {
            Self::InMemory(graph) => graph.transact(f),
            Self::Persistent(redb) => redb.transact(f),
        }
    }
}

// =============================================================================
// SESSION TYPES
// =============================================================================

/// Partial update of the preference record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesPatch {
    pub default_container_id: Option<ContainerId>,
    pub default_mode: Option<InteractionMode>,
    pub include_annotations_in_context: Option<bool>,
}

/// A node written through a path, with the path's length afterwards.
#[derive(Debug, Clone)]
pub struct Appended<T> {
    pub result: T,
    pub path_len: usize,
}

/// Node plus the relationships a viewer needs to render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub node: Node,
    pub parent_edges: Vec<Edge>,
    pub children: Vec<NodeId>,
    pub annotations: Vec<NodeId>,
}

fn default_preferences() -> Result<Preferences, LoomError> {
    Ok(Preferences {
        default_container_id: ContainerId::generate()?,
        default_mode: InteractionMode::default(),
        include_annotations_in_context: false,
        updated_at: Timestamp::now(),
    })
}

fn stored_or_new_preferences(store: &mut dyn LoomWrite) -> Result<Preferences, LoomError> {
    if let Some(existing) = store.preferences()? {
        return Ok(existing);
    }
    let created = default_preferences()?;
    store.put_preferences(&created)?;
    tracing::debug!(container = %created.default_container_id, "preferences initialized");
    Ok(created)
}

/// Append `node` behind the path's tail, then move `agent`'s cursor onto it.
/// Returns the path's new length.
fn extend_path(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    agent: AgentId,
    node: NodeId,
) -> Result<usize, LoomError> {
    let len = advance(store, path_id, node)?;
    let path = store.require_path(path_id)?;
    let tree = store.require_tree(path.tree_id)?;
    set_active_node(store, path_id, agent, node, Some(tree.mode))?;
    Ok(len)
}

fn path_tail(store: &mut dyn LoomWrite, path_id: PathId) -> Result<(Path, NodeId), LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let tail = resolve_tail(store, path_id)?;
    Ok((path, tail))
}

// =============================================================================
// SESSION
// =============================================================================

/// The Loom Tree engine behind one storage backend.
#[derive(Debug, Default)]
pub struct Session {
    backend: StorageBackend,
}

impl Session {
    /// Create a session with in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session over an existing in-memory store.
    #[must_use]
    pub fn with_graph(graph: LoomGraph) -> Self {
        Self {
            backend: StorageBackend::InMemory(graph),
        }
    }

    /// Open or create a redb database at `path`.
    pub fn with_redb(path: impl AsRef<std::path::Path>) -> Result<Self, LoomError> {
        Ok(Self {
            backend: StorageBackend::Persistent(RedbLoom::open(path)?),
        })
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, StorageBackend::Persistent(_))
    }

    #[must_use]
    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Run a read-only closure against one consistent snapshot.
    pub fn read<T, F>(&self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&dyn LoomRead) -> Result<T, LoomError>,
    {
        self.backend.read(f)
    }

    /// Run a closure as one transaction.
    pub fn transact<T, F>(&mut self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&mut dyn LoomWrite) -> Result<T, LoomError>,
    {
        self.backend.transact(f)
    }

    /// Committed transaction counter. Changes whenever anything was written.
    pub fn revision(&self) -> Result<u64, LoomError> {
        self.read(|r| r.revision())
    }

    // =========================================================================
    // PREFERENCES
    // =========================================================================

    /// The preference record, created with defaults on first access.
    pub fn preferences(&mut self) -> Result<Preferences, LoomError> {
        if let Some(existing) = self.read(|r| r.preferences())? {
            return Ok(existing);
        }
        self.transact(stored_or_new_preferences)
    }

    pub fn update_preferences(&mut self, patch: &PreferencesPatch) -> Result<Preferences, LoomError> {
        self.transact(|w| {
            let mut prefs = stored_or_new_preferences(w)?;
            if let Some(container) = patch.default_container_id {
                prefs.default_container_id = container;
            }
            if let Some(mode) = patch.default_mode {
                prefs.default_mode = mode;
            }
            if let Some(include) = patch.include_annotations_in_context {
                prefs.include_annotations_in_context = include;
            }
            prefs.updated_at = Timestamp::now();
            w.put_preferences(&prefs)?;
            Ok(prefs)
        })
    }

    // =========================================================================
    // TREES
    // =========================================================================

    /// Create a tree and, when `owner` is given, an owned path already seeded
    /// with the root.
    pub fn create_tree(
        &mut self,
        new_tree: NewTree,
        owner_path: Option<(AgentId, Option<String>)>,
    ) -> Result<(LoomTree, CreatedNode, Option<Path>), LoomError> {
        self.transact(|w| {
            let (tree, root) = create_tree(w, new_tree)?;
            let path = match owner_path {
                Some((owner, name)) => {
                    let path = create_path(w, tree.id, owner, name)?;
                    resolve_tail(w, path.id)?;
                    set_active_node(w, path.id, owner, root.node.id, Some(tree.mode))?;
                    Some(path)
                }
                None => None,
            };
            Ok((tree, root, path))
        })
    }

    /// Create a tree using the stored default container and mode.
    pub fn create_default_tree(
        &mut self,
        root_content: Content,
        author: AgentId,
        title: Option<String>,
    ) -> Result<(LoomTree, CreatedNode, Option<Path>), LoomError> {
        let prefs = self.preferences()?;
        self.create_tree(
            NewTree {
                container_id: prefs.default_container_id,
                mode: prefs.default_mode,
                system_context: None,
                title,
                description: None,
                root_content,
                root_author: author,
            },
            Some((author, None)),
        )
    }

    pub fn tree(&self, tree_id: TreeId) -> Result<LoomTree, LoomError> {
        self.read(|r| r.require_tree(tree_id))
    }

    /// Trees that are not soft-deleted.
    pub fn trees(&self) -> Result<Vec<LoomTree>, LoomError> {
        self.read(|r| Ok(r.trees()?.into_iter().filter(|t| !t.is_deleted()).collect()))
    }

    pub fn update_tree(
        &mut self,
        tree_id: TreeId,
        patch: &TreeDetailsPatch,
    ) -> Result<LoomTree, LoomError> {
        self.transact(|w| update_tree_details(w, tree_id, patch))
    }

    pub fn soft_delete_tree(&mut self, tree_id: TreeId) -> Result<LoomTree, LoomError> {
        self.transact(|w| soft_delete_tree(w, tree_id))
    }

    /// Remove a tree and everything in it.
    pub fn purge_tree(&mut self, tree_id: TreeId) -> Result<(), LoomError> {
        self.transact(|w| w.delete_tree(tree_id))?;
        tracing::info!(tree = %tree_id, "tree purged");
        Ok(())
    }

    pub fn root(&self, tree_id: TreeId) -> Result<Node, LoomError> {
        self.read(|r| find_root(r, tree_id))
    }

    pub fn tree_nodes(&self, tree_id: TreeId) -> Result<Vec<Node>, LoomError> {
        self.read(|r| {
            r.require_tree(tree_id)?;
            r.tree_nodes(tree_id)
        })
    }

    pub fn bookmarks(&self, tree_id: TreeId) -> Result<Vec<Node>, LoomError> {
        Ok(self
            .tree_nodes(tree_id)?
            .into_iter()
            .filter(|n| n.metadata.bookmarked)
            .collect())
    }

    // =========================================================================
    // NODES
    // =========================================================================

    pub fn node(&self, node_id: NodeId) -> Result<Node, LoomError> {
        self.read(|r| r.require_node(node_id))
    }

    pub fn node_view(&self, node_id: NodeId) -> Result<NodeView, LoomError> {
        self.read(|r| {
            let node = r.require_node(node_id)?;
            Ok(NodeView {
                parent_edges: find_parent_edges(r, node_id)?,
                children: find_children(r, node_id)?.into_iter().map(|n| n.id).collect(),
                annotations: find_annotations(r, node_id)?
                    .into_iter()
                    .map(|n| n.id)
                    .collect(),
                node,
            })
        })
    }

    pub fn update_metadata(
        &mut self,
        node_id: NodeId,
        patch: &MetadataPatch,
    ) -> Result<Node, LoomError> {
        self.transact(|w| update_node_metadata(w, node_id, patch))
    }

    pub fn annotate(
        &mut self,
        target: NodeId,
        author: AgentId,
        content: Content,
    ) -> Result<CreatedNode, LoomError> {
        self.transact(|w| create_annotation(w, target, content, author))
    }

    // =========================================================================
    // PATHS
    // =========================================================================

    /// Create a path already seeded with the root.
    pub fn create_path(
        &mut self,
        tree_id: TreeId,
        owner: AgentId,
        name: Option<String>,
    ) -> Result<Path, LoomError> {
        self.transact(|w| {
            let path = create_path(w, tree_id, owner, name)?;
            resolve_tail(w, path.id)?;
            Ok(path)
        })
    }

    pub fn path(&self, path_id: PathId) -> Result<Path, LoomError> {
        self.read(|r| r.require_path(path_id))
    }

    /// Live paths of a tree.
    pub fn tree_paths(&self, tree_id: TreeId) -> Result<Vec<Path>, LoomError> {
        self.read(|r| {
            Ok(r.tree_paths(tree_id)?
                .into_iter()
                .filter(|p| p.deleted_at.is_none())
                .collect())
        })
    }

    pub fn path_nodes(&self, path_id: PathId) -> Result<Vec<NodeId>, LoomError> {
        self.read(|r| {
            require_live_path(r, path_id)?;
            r.path_nodes(path_id)
        })
    }

    pub fn selections(&self, path_id: PathId) -> Result<Vec<PathSelection>, LoomError> {
        self.read(|r| r.path_selections(path_id))
    }

    pub fn delete_path(&mut self, path_id: PathId) -> Result<Path, LoomError> {
        self.transact(|w| soft_delete_path(w, path_id))
    }

    /// Step the path forward onto a child of its tail.
    pub fn advance(
        &mut self,
        path_id: PathId,
        agent: AgentId,
        node_id: NodeId,
    ) -> Result<Vec<NodeId>, LoomError> {
        self.transact(|w| {
            resolve_tail(w, path_id)?;
            extend_path(w, path_id, agent, node_id)?;
            w.path_nodes(path_id)
        })
    }

    /// Rebuild the path so it ends at `node_id`.
    pub fn navigate(
        &mut self,
        path_id: PathId,
        agent: AgentId,
        node_id: NodeId,
    ) -> Result<Vec<NodeId>, LoomError> {
        self.transact(|w| {
            let nodes = navigate_to(w, path_id, node_id)?;
            let path = w.require_path(path_id)?;
            let tree = w.require_tree(path.tree_id)?;
            set_active_node(w, path_id, agent, node_id, Some(tree.mode))?;
            Ok(nodes)
        })
    }

    pub fn truncate(&mut self, path_id: PathId, len: usize) -> Result<Vec<NodeId>, LoomError> {
        self.transact(|w| truncate(w, path_id, len))
    }

    pub fn select(
        &mut self,
        path_id: PathId,
        target: NodeId,
        edge_id: Option<EdgeId>,
        source_id: Option<NodeId>,
    ) -> Result<PathSelection, LoomError> {
        self.transact(|w| upsert_selection(w, path_id, target, edge_id, source_id))
    }

    pub fn clear_selection(&mut self, path_id: PathId, target: NodeId) -> Result<bool, LoomError> {
        self.transact(|w| clear_selection(w, path_id, target))
    }

    pub fn active_node(
        &self,
        path_id: PathId,
        agent: AgentId,
        mode: Option<InteractionMode>,
    ) -> Result<Option<PathState>, LoomError> {
        self.read(|r| crate::path::active_node(r, path_id, agent, mode))
    }

    // =========================================================================
    // WRITING THROUGH A PATH
    // =========================================================================

    /// Append a human-authored node at the path's tail.
    pub fn append_human(
        &mut self,
        path_id: PathId,
        agent: AgentId,
        content: Content,
    ) -> Result<Appended<CreatedNode>, LoomError> {
        self.transact(|w| {
            let (path, tail) = path_tail(w, path_id)?;
            let created = append_node(w, path.tree_id, content, NodeAuthor::Human(agent), &[tail])?;
            let path_len = extend_path(w, path_id, agent, created.node.id)?;
            Ok(Appended {
                result: created,
                path_len,
            })
        })
    }

    /// The context a provider would receive for the path's current tail.
    pub fn context(&self, path_id: PathId) -> Result<AssembledContext, LoomError> {
        self.read(|r| {
            let include_annotations = r
                .preferences()?
                .is_some_and(|p| p.include_annotations_in_context);
            assemble_context(
                r,
                path_id,
                ContextOptions {
                    include_annotations,
                    include_excluded: false,
                },
            )
        })
    }

    /// Record a completion produced from `context` as the path's next node.
    ///
    /// Fails with `Conflict` if the path moved since the context was
    /// assembled; nothing is written in that case.
    pub fn append_completion(
        &mut self,
        context: &AssembledContext,
        agent: AgentId,
        completion: Completion,
        keep_raw_bytes: bool,
    ) -> Result<Appended<GeneratedNode>, LoomError> {
        let path_id = context.path_id;
        self.transact(|w| {
            let (path, tail) = path_tail(w, path_id)?;
            if context.tail().is_some_and(|expected| expected != tail) {
                return Err(LoomError::Conflict(format!(
                    "path {} moved while generating",
                    path_id
                )));
            }
            let generated =
                record_completion(w, path.tree_id, tail, agent, completion, keep_raw_bytes)?;
            let path_len = extend_path(w, path_id, agent, generated.created.node.id)?;
            Ok(Appended {
                result: generated,
                path_len,
            })
        })
    }

    // =========================================================================
    // VERSIONING
    // =========================================================================

    /// Edit a node on a buffer-mode path and keep the path on the new version.
    pub fn edit(
        &mut self,
        path_id: PathId,
        agent: AgentId,
        node_id: NodeId,
        content: Content,
    ) -> Result<Appended<EditOutcome>, LoomError> {
        self.transact(|w| {
            let path = require_live_path(&*w, path_id)?;
            require_live_tree(&*w, path.tree_id)?;
            let outcome = edit_node(w, node_id, content, agent)?;
            let edit_id = outcome.created.node.id;

            let mut nodes = w.path_nodes(path_id)?;
            let Some(position) = nodes.iter().position(|n| *n == node_id) else {
                return Ok(Appended {
                    result: outcome,
                    path_len: nodes.len(),
                });
            };
            nodes[position] = edit_id;
            // The step after the edit now crosses a hyperedge; pin it to the edit.
            if let Some(next) = nodes.get(position + 1).copied() {
                for edge_id in &outcome.extended_edges {
                    if w.require_edge(*edge_id)?.target_id == next {
                        upsert_selection(w, path_id, next, Some(*edge_id), Some(edit_id))?;
                        break;
                    }
                }
            }
            let path_len =
                crate::path::replace_suffix(w, path_id, position, &nodes[position..])?.len();
            let tree = w.require_tree(path.tree_id)?;
            set_active_node(w, path_id, agent, edit_id, Some(tree.mode))?;
            Ok(Appended {
                result: outcome,
                path_len,
            })
        })
    }

    pub fn versions(&self, node_id: NodeId) -> Result<Vec<Node>, LoomError> {
        self.read(|r| versions_of(r, node_id))
    }

    pub fn lineage(&self, node_id: NodeId) -> Result<Vec<Node>, LoomError> {
        self.read(|r| lineage(r, node_id))
    }

    // =========================================================================
    // PROVENANCE
    // =========================================================================

    pub fn verify(&self, node_id: NodeId) -> Result<VerificationResult, LoomError> {
        self.read(|r| verify_node(r, node_id))
    }

    pub fn verify_chain(&self, node_id: NodeId) -> Result<Vec<VerificationResult>, LoomError> {
        self.read(|r| verify_chain(r, node_id))
    }

    pub fn audit(&self, tree_id: TreeId) -> Result<AuditReport, LoomError> {
        self.read(|r| audit_tree(r, tree_id))
    }

    // =========================================================================
    // EXPORT
    // =========================================================================

    pub fn export_tree(&self, tree_id: TreeId) -> Result<Vec<u8>, LoomError> {
        self.read(|r| export_tree(r, tree_id))
    }

    pub fn import_tree(&mut self, data: &[u8]) -> Result<LoomTree, LoomError> {
        self.transact(|w| import_tree(w, data))
    }

    #[cfg(feature = "crypto-hash")]
    pub fn tree_digest(&self, tree_id: TreeId) -> Result<String, LoomError> {
        self.read(|r| crate::export::tree_digest(r, tree_id))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::provenance::RawResponse;
    use ulid::Ulid;

    const HUMAN: AgentId = AgentId(Ulid(0xA));
    const MODEL: AgentId = AgentId(Ulid(0xB));

    fn new_tree(mode: InteractionMode) -> NewTree {
        NewTree {
            container_id: ContainerId(Ulid(1)),
            mode,
            system_context: None,
            title: Some("session".into()),
            description: None,
            root_content: Content::text("hello"),
            root_author: HUMAN,
        }
    }

    fn echo(text: &str) -> Completion {
        Completion {
            content: Content::text(text),
            raw_response: RawResponse::Streamed {
                assembled_text: text.into(),
            },
            provider: Some("echo".into()),
            provider_request_id: None,
            model_identifier: None,
            token_usage: None,
        }
    }

    #[test]
    fn append_extends_path_and_moves_cursor() {
        let mut session = Session::new();
        let (tree, root, path) = session
            .create_tree(new_tree(InteractionMode::Dialogue), Some((HUMAN, None)))
            .unwrap();
        let path = path.unwrap();

        let appended = session
            .append_human(path.id, HUMAN, Content::text("how are you?"))
            .unwrap();
        assert_eq!(appended.path_len, 2);
        assert_eq!(
            session.path_nodes(path.id).unwrap(),
            vec![root.node.id, appended.result.node.id]
        );
        let cursor = session
            .active_node(path.id, HUMAN, Some(tree.mode))
            .unwrap()
            .unwrap();
        assert_eq!(cursor.active_node_id, appended.result.node.id);
    }

    #[test]
    fn completion_is_recorded_from_context() {
        let mut session = Session::new();
        let (_, _, path) = session
            .create_tree(new_tree(InteractionMode::Dialogue), Some((HUMAN, None)))
            .unwrap();
        let path = path.unwrap();

        let ctx = session.context(path.id).unwrap();
        let generated = session
            .append_completion(&ctx, MODEL, echo("fine"), true)
            .unwrap();
        let node_id = generated.result.created.node.id;
        assert_eq!(generated.path_len, 2);
        assert!(session.verify(node_id).unwrap().valid);
    }

    #[test]
    fn stale_context_is_rejected() {
        let mut session = Session::new();
        let (_, _, path) = session
            .create_tree(new_tree(InteractionMode::Dialogue), Some((HUMAN, None)))
            .unwrap();
        let path = path.unwrap();

        let ctx = session.context(path.id).unwrap();
        session
            .append_human(path.id, HUMAN, Content::text("actually..."))
            .unwrap();
        let revision = session.revision().unwrap();
        let result = session.append_completion(&ctx, MODEL, echo("late"), false);
        assert!(matches!(result, Err(LoomError::Conflict(_))));
        assert_eq!(session.revision().unwrap(), revision);
    }

    #[test]
    fn preferences_initialize_once() {
        let mut session = Session::new();
        let first = session.preferences().unwrap();
        let second = session.preferences().unwrap();
        assert_eq!(first, second);

        let updated = session
            .update_preferences(&PreferencesPatch {
                default_mode: Some(InteractionMode::Buffer),
                ..PreferencesPatch::default()
            })
            .unwrap();
        assert_eq!(updated.default_mode, InteractionMode::Buffer);
        assert_eq!(updated.default_container_id, first.default_container_id);

        let (tree, _, _) = session
            .create_default_tree(Content::text("draft"), HUMAN, None)
            .unwrap();
        assert_eq!(tree.mode, InteractionMode::Buffer);
    }

    #[test]
    fn edit_keeps_path_on_new_version() {
        let mut session = Session::new();
        let (_, root, path) = session
            .create_tree(new_tree(InteractionMode::Buffer), Some((HUMAN, None)))
            .unwrap();
        let path = path.unwrap();
        let first = session
            .append_human(path.id, HUMAN, Content::text(" one"))
            .unwrap()
            .result
            .node
            .id;
        let second = session
            .append_human(path.id, HUMAN, Content::text(" two"))
            .unwrap()
            .result
            .node
            .id;

        let edited = session
            .edit(path.id, HUMAN, first, Content::text(" uno"))
            .unwrap();
        let edit_id = edited.result.created.node.id;
        assert_eq!(edited.path_len, 3);
        assert_eq!(
            session.path_nodes(path.id).unwrap(),
            vec![root.node.id, edit_id, second]
        );

        // Backward resolution from the tail follows the edit.
        let rebuilt = session.navigate(path.id, HUMAN, second).unwrap();
        assert_eq!(rebuilt, vec![root.node.id, edit_id, second]);
        assert_eq!(session.versions(first).unwrap().len(), 2);
    }

    #[test]
    fn soft_deleted_tree_is_hidden_and_read_only() {
        let mut session = Session::new();
        let (tree, _, path) = session
            .create_tree(new_tree(InteractionMode::Dialogue), Some((HUMAN, None)))
            .unwrap();
        session.soft_delete_tree(tree.id).unwrap();

        assert!(session.trees().unwrap().is_empty());
        assert!(
            session
                .append_human(path.unwrap().id, HUMAN, Content::text("x"))
                .is_err()
        );
        session.purge_tree(tree.id).unwrap();
        assert!(matches!(
            session.tree(tree.id),
            Err(LoomError::NotFound { .. })
        ));
    }

    #[test]
    fn persistent_session_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("loom.redb");
        let (tree_id, path_id) = {
            let mut session = Session::with_redb(&db).unwrap();
            assert!(session.is_persistent());
            let (tree, _, path) = session
                .create_tree(new_tree(InteractionMode::Dialogue), Some((HUMAN, None)))
                .unwrap();
            let path = path.unwrap();
            session
                .append_human(path.id, HUMAN, Content::text("persist me"))
                .unwrap();
            (tree.id, path.id)
        };

        let session = Session::with_redb(&db).unwrap();
        assert_eq!(session.path_nodes(path_id).unwrap().len(), 2);
        assert!(session.audit(tree_id).unwrap().is_clean());
    }
}
