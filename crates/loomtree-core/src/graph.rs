//! # Loom Store
//!
//! The storage contract of the engine and its in-memory implementation.
//!
//! - [`LoomRead`]: point lookups and the secondary indexes traversal needs.
//! - [`LoomWrite`]: record-level writes. Each call applies immediately to
//!   whatever it is invoked on; a batch is only atomic when it runs inside
//!   [`LoomStore::transact`].
//! - [`LoomStore`]: runs a closure against a writer and commits its writes
//!   atomically, or rolls all of them back when the closure fails.
//!
//! All data structures use `BTreeMap` for deterministic ordering. Index
//! lookups return records in id order, which for ULIDs is creation order.

use crate::{
    AgentId, Edge, EdgeId, InteractionMode, LoomError, LoomTree, Node, NodeId, Path, PathId,
    PathSelection, PathState, PathStateKey, Preferences, RawResponseEvidence, TreeId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use ulid::Ulid;

// =============================================================================
// STORE TRAITS
// =============================================================================

/// Read side of the persistence contract.
///
/// All fallible operations return `Result<T, LoomError>` so the in-memory and
/// persistent backends can be used interchangeably.
pub trait LoomRead {
    fn tree(&self, id: TreeId) -> Result<Option<LoomTree>, LoomError>;

    /// All trees, including soft-deleted ones.
    fn trees(&self) -> Result<Vec<LoomTree>, LoomError>;

    fn node(&self, id: NodeId) -> Result<Option<Node>, LoomError>;

    /// Nodes of a tree in creation order.
    fn tree_nodes(&self, tree: TreeId) -> Result<Vec<Node>, LoomError>;

    fn edge(&self, id: EdgeId) -> Result<Option<Edge>, LoomError>;

    fn tree_edges(&self, tree: TreeId) -> Result<Vec<Edge>, LoomError>;

    /// Edges (of any kind) whose target is `node`.
    fn edges_by_target(&self, node: NodeId) -> Result<Vec<Edge>, LoomError>;

    /// Edges (of any kind) listing `node` among their sources.
    fn edges_by_source(&self, node: NodeId) -> Result<Vec<Edge>, LoomError>;

    /// Every node whose version group is `group`, oldest first.
    fn version_group_members(&self, group: NodeId) -> Result<Vec<Node>, LoomError>;

    /// Nodes created as direct edits of `node`.
    fn nodes_edited_from(&self, node: NodeId) -> Result<Vec<Node>, LoomError>;

    /// Nodes authored by `agent` in one tree.
    fn nodes_by_author(&self, tree: TreeId, agent: AgentId) -> Result<Vec<Node>, LoomError>;

    fn evidence(&self, node: NodeId) -> Result<Option<RawResponseEvidence>, LoomError>;

    fn path(&self, id: PathId) -> Result<Option<Path>, LoomError>;

    fn tree_paths(&self, tree: TreeId) -> Result<Vec<Path>, LoomError>;

    /// Cached node sequence of a path, position 0 first.
    fn path_nodes(&self, path: PathId) -> Result<Vec<NodeId>, LoomError>;

    /// Number of cached positions of a path.
    fn path_len(&self, path: PathId) -> Result<usize, LoomError>;

    /// The node cached at one position.
    fn path_node_at(&self, path: PathId, position: usize) -> Result<Option<NodeId>, LoomError>;

    fn selection(&self, path: PathId, target: NodeId)
    -> Result<Option<PathSelection>, LoomError>;

    fn path_selections(&self, path: PathId) -> Result<Vec<PathSelection>, LoomError>;

    fn path_state(&self, key: &PathStateKey) -> Result<Option<PathState>, LoomError>;

    fn preferences(&self) -> Result<Option<Preferences>, LoomError>;

    /// Number of committed transactions.
    fn revision(&self) -> Result<u64, LoomError>;

    /// Whether a node of `tree` already uses `short_id`.
    fn short_id_taken(&self, tree: TreeId, short_id: &str) -> Result<bool, LoomError>;

    /// Last cached node of a path.
    fn path_tail(&self, path: PathId) -> Result<Option<NodeId>, LoomError> {
        match self.path_len(path)? {
            0 => Ok(None),
            len => self.path_node_at(path, len - 1),
        }
    }

    /// Fetch a node or fail with `NotFound`.
    fn require_node(&self, id: NodeId) -> Result<Node, LoomError> {
        self.node(id)?.ok_or_else(|| LoomError::not_found("node", id))
    }

    /// Fetch a tree or fail with `NotFound`.
    fn require_tree(&self, id: TreeId) -> Result<LoomTree, LoomError> {
        self.tree(id)?.ok_or_else(|| LoomError::not_found("tree", id))
    }

    /// Fetch an edge or fail with `NotFound`.
    fn require_edge(&self, id: EdgeId) -> Result<Edge, LoomError> {
        self.edge(id)?.ok_or_else(|| LoomError::not_found("edge", id))
    }

    /// Fetch a path or fail with `NotFound`.
    fn require_path(&self, id: PathId) -> Result<Path, LoomError> {
        self.path(id)?.ok_or_else(|| LoomError::not_found("path", id))
    }
}

/// Write side of the persistence contract.
///
/// Implementations keep the secondary indexes in step with the records.
pub trait LoomWrite: LoomRead {
    fn put_tree(&mut self, tree: &LoomTree) -> Result<(), LoomError>;

    /// Insert a node, or overwrite one (metadata updates only).
    fn put_node(&mut self, node: &Node) -> Result<(), LoomError>;

    /// Insert or replace an edge, re-indexing its sources.
    fn put_edge(&mut self, edge: &Edge) -> Result<(), LoomError>;

    fn delete_edge(&mut self, id: EdgeId) -> Result<(), LoomError>;

    fn put_evidence(&mut self, evidence: &RawResponseEvidence) -> Result<(), LoomError>;

    fn put_path(&mut self, path: &Path) -> Result<(), LoomError>;

    /// Cache `node` at the next position of a path. Returns that position.
    fn push_path_node(&mut self, path: PathId, node: NodeId) -> Result<usize, LoomError>;

    /// Drop every cached position from `len` on.
    fn truncate_path_nodes(&mut self, path: PathId, len: usize) -> Result<(), LoomError>;

    fn put_selection(&mut self, selection: &PathSelection) -> Result<(), LoomError>;

    /// Returns whether a selection existed.
    fn delete_selection(&mut self, path: PathId, target: NodeId) -> Result<bool, LoomError>;

    fn put_path_state(&mut self, state: &PathState) -> Result<(), LoomError>;

    fn put_preferences(&mut self, preferences: &Preferences) -> Result<(), LoomError>;

    /// Remove a tree and everything that belongs to it.
    fn delete_tree(&mut self, tree: TreeId) -> Result<(), LoomError>;
}

/// A store that hands out consistent read views and atomic write transactions.
pub trait LoomStore {
    /// Run `f` against one consistent snapshot.
    fn read<T, F>(&self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&dyn LoomRead) -> Result<T, LoomError>;

    /// Run `f` against a writer. Commits when `f` returns `Ok` and bumps the
    /// revision; discards every write when it returns `Err`.
    fn transact<T, F>(&mut self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&mut dyn LoomWrite) -> Result<T, LoomError>;
}

// =============================================================================
// IN-MEMORY IMPLEMENTATION
// =============================================================================

/// Prior state of one key, recorded while a transaction is open.
#[derive(Debug, Clone)]
enum Undo {
    Tree(TreeId, Option<LoomTree>),
    Node(NodeId, Option<Node>),
    Edge(EdgeId, Option<Edge>),
    Evidence(NodeId, Option<RawResponseEvidence>),
    Path(PathId, Option<Path>),
    PathPushed(PathId),
    PathTruncated(PathId, Vec<NodeId>),
    Selection((PathId, NodeId), Option<PathSelection>),
    PathState(PathStateKey, Option<PathState>),
    Preferences(Option<Preferences>),
}

/// The in-memory Loom store.
///
/// Writes apply in place. Inside [`LoomStore::transact`] every write also
/// journals the value it replaced, and a failed transaction replays the
/// journal backwards.
#[derive(Debug, Clone, Default)]
pub struct LoomGraph {
    trees: BTreeMap<TreeId, LoomTree>,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    evidence: BTreeMap<NodeId, RawResponseEvidence>,
    paths: BTreeMap<PathId, Path>,
    path_nodes: BTreeMap<PathId, Vec<NodeId>>,
    selections: BTreeMap<(PathId, NodeId), PathSelection>,
    path_states: BTreeMap<PathStateKey, PathState>,
    preferences: Option<Preferences>,
    revision: u64,
    journal: Option<Vec<Undo>>,

    // Secondary indexes
    tree_nodes: BTreeMap<TreeId, BTreeSet<NodeId>>,
    tree_edges: BTreeMap<TreeId, BTreeSet<EdgeId>>,
    tree_paths: BTreeMap<TreeId, BTreeSet<PathId>>,
    edges_by_target: BTreeMap<NodeId, BTreeSet<EdgeId>>,
    edges_by_source: BTreeMap<NodeId, BTreeSet<EdgeId>>,
    version_groups: BTreeMap<NodeId, BTreeSet<NodeId>>,
    edited_from: BTreeMap<NodeId, BTreeSet<NodeId>>,
    authored: BTreeMap<(TreeId, AgentId), BTreeSet<NodeId>>,
    short_ids: BTreeMap<(TreeId, String), NodeId>,
}

fn link<K: Ord, V: Ord>(index: &mut BTreeMap<K, BTreeSet<V>>, key: K, member: V) {
    index.entry(key).or_default().insert(member);
}

fn unlink<K: Ord, V: Ord>(index: &mut BTreeMap<K, BTreeSet<V>>, key: &K, member: &V) {
    if let Some(set) = index.get_mut(key) {
        set.remove(member);
        if set.is_empty() {
            index.remove(key);
        }
    }
}

/// Every selection key of one path.
fn selection_span(path: PathId) -> RangeInclusive<(PathId, NodeId)> {
    (path, NodeId(Ulid(0)))..=(path, NodeId(Ulid(u128::MAX)))
}

/// Every cursor key of one path.
fn cursor_span(path: PathId) -> RangeInclusive<PathStateKey> {
    PathStateKey {
        path_id: path,
        agent_id: AgentId(Ulid(0)),
        mode: None,
    }..=PathStateKey {
        path_id: path,
        agent_id: AgentId(Ulid(u128::MAX)),
        mode: Some(InteractionMode::Buffer),
    }
}

impl LoomGraph {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of nodes across all trees.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of edges across all trees.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn collect_nodes(&self, ids: Option<&BTreeSet<NodeId>>) -> Vec<Node> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }

    fn collect_edges(&self, ids: Option<&BTreeSet<EdgeId>>) -> Vec<Edge> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.edges.get(id).cloned())
            .collect()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }

    // -------------------------------------------------------------------------
    // Raw setters: replace one key, keep its indexes in step, return the
    // previous value. `None` removes.
    // -------------------------------------------------------------------------

    fn set_tree(&mut self, id: TreeId, tree: Option<LoomTree>) -> Option<LoomTree> {
        match tree {
            Some(tree) => self.trees.insert(id, tree),
            None => self.trees.remove(&id),
        }
    }

    fn set_node(&mut self, id: NodeId, node: Option<Node>) -> Option<Node> {
        let previous = self.nodes.remove(&id);
        if let Some(old) = &previous {
            unlink(&mut self.tree_nodes, &old.tree_id, &id);
            unlink(&mut self.version_groups, &old.version_group_id(), &id);
            if let Some(original) = old.edited_from {
                unlink(&mut self.edited_from, &original, &id);
            }
            unlink(&mut self.authored, &(old.tree_id, old.author_id), &id);
            let short = (old.tree_id, old.short_id.clone());
            if self.short_ids.get(&short) == Some(&id) {
                self.short_ids.remove(&short);
            }
        }
        if let Some(node) = node {
            link(&mut self.tree_nodes, node.tree_id, id);
            link(&mut self.version_groups, node.version_group_id(), id);
            if let Some(original) = node.edited_from {
                link(&mut self.edited_from, original, id);
            }
            link(&mut self.authored, (node.tree_id, node.author_id), id);
            self.short_ids
                .insert((node.tree_id, node.short_id.clone()), id);
            self.nodes.insert(id, node);
        }
        previous
    }

    fn set_edge(&mut self, id: EdgeId, edge: Option<Edge>) -> Option<Edge> {
        let previous = self.edges.remove(&id);
        if let Some(old) = &previous {
            unlink(&mut self.tree_edges, &old.tree_id, &id);
            unlink(&mut self.edges_by_target, &old.target_id, &id);
            for source in old.source_ids() {
                unlink(&mut self.edges_by_source, &source, &id);
            }
        }
        if let Some(edge) = edge {
            link(&mut self.tree_edges, edge.tree_id, id);
            link(&mut self.edges_by_target, edge.target_id, id);
            for source in edge.source_ids() {
                link(&mut self.edges_by_source, source, id);
            }
            self.edges.insert(id, edge);
        }
        previous
    }

    fn set_evidence(
        &mut self,
        node: NodeId,
        evidence: Option<RawResponseEvidence>,
    ) -> Option<RawResponseEvidence> {
        match evidence {
            Some(evidence) => self.evidence.insert(node, evidence),
            None => self.evidence.remove(&node),
        }
    }

    fn set_path(&mut self, id: PathId, path: Option<Path>) -> Option<Path> {
        let previous = self.paths.remove(&id);
        if let Some(old) = &previous {
            unlink(&mut self.tree_paths, &old.tree_id, &id);
        }
        if let Some(path) = path {
            link(&mut self.tree_paths, path.tree_id, id);
            self.paths.insert(id, path);
        }
        previous
    }

    fn set_selection(
        &mut self,
        key: (PathId, NodeId),
        selection: Option<PathSelection>,
    ) -> Option<PathSelection> {
        match selection {
            Some(selection) => self.selections.insert(key, selection),
            None => self.selections.remove(&key),
        }
    }

    fn set_path_state(&mut self, key: PathStateKey, state: Option<PathState>) -> Option<PathState> {
        match state {
            Some(state) => self.path_states.insert(key, state),
            None => self.path_states.remove(&key),
        }
    }

    fn split_path_nodes(&mut self, path: PathId, len: usize) -> Vec<NodeId> {
        let Some(nodes) = self.path_nodes.get_mut(&path) else {
            return Vec::new();
        };
        let removed = nodes.split_off(len.min(nodes.len()));
        if nodes.is_empty() {
            self.path_nodes.remove(&path);
        }
        removed
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Tree(id, previous) => {
                self.set_tree(id, previous);
            }
            Undo::Node(id, previous) => {
                self.set_node(id, previous);
            }
            Undo::Edge(id, previous) => {
                self.set_edge(id, previous);
            }
            Undo::Evidence(id, previous) => {
                self.set_evidence(id, previous);
            }
            Undo::Path(id, previous) => {
                self.set_path(id, previous);
            }
            Undo::PathPushed(path) => {
                let len = self.path_nodes.get(&path).map_or(0, Vec::len);
                self.split_path_nodes(path, len.saturating_sub(1));
            }
            Undo::PathTruncated(path, removed) => {
                self.path_nodes.entry(path).or_default().extend(removed);
            }
            Undo::Selection(key, previous) => {
                self.set_selection(key, previous);
            }
            Undo::PathState(key, previous) => {
                self.set_path_state(key, previous);
            }
            Undo::Preferences(previous) => self.preferences = previous,
        }
    }

    // -------------------------------------------------------------------------
    // Journaled writes
    // -------------------------------------------------------------------------

    fn write_tree(&mut self, id: TreeId, tree: Option<LoomTree>) {
        let previous = self.set_tree(id, tree);
        self.record(Undo::Tree(id, previous));
    }

    fn write_node(&mut self, id: NodeId, node: Option<Node>) {
        let previous = self.set_node(id, node);
        self.record(Undo::Node(id, previous));
    }

    fn write_edge(&mut self, id: EdgeId, edge: Option<Edge>) {
        let previous = self.set_edge(id, edge);
        self.record(Undo::Edge(id, previous));
    }

    fn write_evidence(&mut self, node: NodeId, evidence: Option<RawResponseEvidence>) {
        let previous = self.set_evidence(node, evidence);
        self.record(Undo::Evidence(node, previous));
    }

    fn write_path(&mut self, id: PathId, path: Option<Path>) {
        let previous = self.set_path(id, path);
        self.record(Undo::Path(id, previous));
    }

    fn write_selection(
        &mut self,
        key: (PathId, NodeId),
        selection: Option<PathSelection>,
    ) -> bool {
        let previous = self.set_selection(key, selection);
        let existed = previous.is_some();
        self.record(Undo::Selection(key, previous));
        existed
    }

    fn write_path_state(&mut self, key: PathStateKey, state: Option<PathState>) {
        let previous = self.set_path_state(key, state);
        self.record(Undo::PathState(key, previous));
    }

    fn write_truncation(&mut self, path: PathId, len: usize) {
        let removed = self.split_path_nodes(path, len);
        if !removed.is_empty() {
            self.record(Undo::PathTruncated(path, removed));
        }
    }
}

impl LoomRead for LoomGraph {
    fn tree(&self, id: TreeId) -> Result<Option<LoomTree>, LoomError> {
        Ok(self.trees.get(&id).cloned())
    }

    fn trees(&self) -> Result<Vec<LoomTree>, LoomError> {
        Ok(self.trees.values().cloned().collect())
    }

    fn node(&self, id: NodeId) -> Result<Option<Node>, LoomError> {
        Ok(self.nodes.get(&id).cloned())
    }

    fn tree_nodes(&self, tree: TreeId) -> Result<Vec<Node>, LoomError> {
        Ok(self.collect_nodes(self.tree_nodes.get(&tree)))
    }

    fn edge(&self, id: EdgeId) -> Result<Option<Edge>, LoomError> {
        Ok(self.edges.get(&id).cloned())
    }

    fn tree_edges(&self, tree: TreeId) -> Result<Vec<Edge>, LoomError> {
        Ok(self.collect_edges(self.tree_edges.get(&tree)))
    }

    fn edges_by_target(&self, node: NodeId) -> Result<Vec<Edge>, LoomError> {
        Ok(self.collect_edges(self.edges_by_target.get(&node)))
    }

    fn edges_by_source(&self, node: NodeId) -> Result<Vec<Edge>, LoomError> {
        Ok(self.collect_edges(self.edges_by_source.get(&node)))
    }

    fn version_group_members(&self, group: NodeId) -> Result<Vec<Node>, LoomError> {
        Ok(self.collect_nodes(self.version_groups.get(&group)))
    }

    fn nodes_edited_from(&self, node: NodeId) -> Result<Vec<Node>, LoomError> {
        Ok(self.collect_nodes(self.edited_from.get(&node)))
    }

    fn nodes_by_author(&self, tree: TreeId, agent: AgentId) -> Result<Vec<Node>, LoomError> {
        Ok(self.collect_nodes(self.authored.get(&(tree, agent))))
    }

    fn evidence(&self, node: NodeId) -> Result<Option<RawResponseEvidence>, LoomError> {
        Ok(self.evidence.get(&node).cloned())
    }

    fn path(&self, id: PathId) -> Result<Option<Path>, LoomError> {
        Ok(self.paths.get(&id).cloned())
    }

    fn tree_paths(&self, tree: TreeId) -> Result<Vec<Path>, LoomError> {
        Ok(self
            .tree_paths
            .get(&tree)
            .into_iter()
            .flatten()
            .filter_map(|id| self.paths.get(id).cloned())
            .collect())
    }

    fn path_nodes(&self, path: PathId) -> Result<Vec<NodeId>, LoomError> {
        Ok(self.path_nodes.get(&path).cloned().unwrap_or_default())
    }

    fn path_len(&self, path: PathId) -> Result<usize, LoomError> {
        Ok(self.path_nodes.get(&path).map_or(0, Vec::len))
    }

    fn path_node_at(&self, path: PathId, position: usize) -> Result<Option<NodeId>, LoomError> {
        Ok(self
            .path_nodes
            .get(&path)
            .and_then(|nodes| nodes.get(position))
            .copied())
    }

    fn selection(
        &self,
        path: PathId,
        target: NodeId,
    ) -> Result<Option<PathSelection>, LoomError> {
        Ok(self.selections.get(&(path, target)).cloned())
    }

    fn path_selections(&self, path: PathId) -> Result<Vec<PathSelection>, LoomError> {
        Ok(self
            .selections
            .range(selection_span(path))
            .map(|(_, s)| s.clone())
            .collect())
    }

    fn path_state(&self, key: &PathStateKey) -> Result<Option<PathState>, LoomError> {
        Ok(self.path_states.get(key).cloned())
    }

    fn preferences(&self) -> Result<Option<Preferences>, LoomError> {
        Ok(self.preferences.clone())
    }

    fn revision(&self) -> Result<u64, LoomError> {
        Ok(self.revision)
    }

    fn short_id_taken(&self, tree: TreeId, short_id: &str) -> Result<bool, LoomError> {
        Ok(self.short_ids.contains_key(&(tree, short_id.to_string())))
    }
}

impl LoomWrite for LoomGraph {
    fn put_tree(&mut self, tree: &LoomTree) -> Result<(), LoomError> {
        self.write_tree(tree.id, Some(tree.clone()));
        Ok(())
    }

    fn put_node(&mut self, node: &Node) -> Result<(), LoomError> {
        self.write_node(node.id, Some(node.clone()));
        Ok(())
    }

    fn put_edge(&mut self, edge: &Edge) -> Result<(), LoomError> {
        self.write_edge(edge.id, Some(edge.clone()));
        Ok(())
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<(), LoomError> {
        if !self.edges.contains_key(&id) {
            return Err(LoomError::not_found("edge", id));
        }
        self.write_edge(id, None);
        Ok(())
    }

    fn put_evidence(&mut self, evidence: &RawResponseEvidence) -> Result<(), LoomError> {
        self.write_evidence(evidence.node_id, Some(evidence.clone()));
        Ok(())
    }

    fn put_path(&mut self, path: &Path) -> Result<(), LoomError> {
        self.write_path(path.id, Some(path.clone()));
        Ok(())
    }

    fn push_path_node(&mut self, path: PathId, node: NodeId) -> Result<usize, LoomError> {
        let nodes = self.path_nodes.entry(path).or_default();
        nodes.push(node);
        let position = nodes.len() - 1;
        self.record(Undo::PathPushed(path));
        Ok(position)
    }

    fn truncate_path_nodes(&mut self, path: PathId, len: usize) -> Result<(), LoomError> {
        self.write_truncation(path, len);
        Ok(())
    }

    fn put_selection(&mut self, selection: &PathSelection) -> Result<(), LoomError> {
        self.write_selection(selection.key(), Some(selection.clone()));
        Ok(())
    }

    fn delete_selection(&mut self, path: PathId, target: NodeId) -> Result<bool, LoomError> {
        Ok(self.write_selection((path, target), None))
    }

    fn put_path_state(&mut self, state: &PathState) -> Result<(), LoomError> {
        self.write_path_state(state.key(), Some(state.clone()));
        Ok(())
    }

    fn put_preferences(&mut self, preferences: &Preferences) -> Result<(), LoomError> {
        let previous = self.preferences.replace(preferences.clone());
        self.record(Undo::Preferences(previous));
        Ok(())
    }

    fn delete_tree(&mut self, tree: TreeId) -> Result<(), LoomError> {
        if !self.trees.contains_key(&tree) {
            return Err(LoomError::not_found("tree", tree));
        }

        let paths: Vec<PathId> = self
            .tree_paths
            .get(&tree)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for path_id in paths {
            let selections: Vec<(PathId, NodeId)> = self
                .selections
                .range(selection_span(path_id))
                .map(|(key, _)| *key)
                .collect();
            for key in selections {
                self.write_selection(key, None);
            }
            let cursors: Vec<PathStateKey> = self
                .path_states
                .range(cursor_span(path_id))
                .map(|(key, _)| *key)
                .collect();
            for key in cursors {
                self.write_path_state(key, None);
            }
            self.write_truncation(path_id, 0);
            self.write_path(path_id, None);
        }

        let edges: Vec<EdgeId> = self
            .tree_edges
            .get(&tree)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for edge_id in edges {
            self.write_edge(edge_id, None);
        }

        let nodes: Vec<NodeId> = self
            .tree_nodes
            .get(&tree)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        for node_id in nodes {
            self.write_evidence(node_id, None);
            self.write_node(node_id, None);
        }

        self.write_tree(tree, None);
        Ok(())
    }
}

impl LoomStore for LoomGraph {
    fn read<T, F>(&self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&dyn LoomRead) -> Result<T, LoomError>,
    {
        f(self)
    }

    fn transact<T, F>(&mut self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&mut dyn LoomWrite) -> Result<T, LoomError>,
    {
        self.journal = Some(Vec::new());
        let outcome = f(self);
        let journal = self.journal.take().unwrap_or_default();
        match outcome {
            Ok(value) => {
                self.revision = self.revision.saturating_add(1);
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(writes = journal.len(), "rolling back in-memory transaction");
                for undo in journal.into_iter().rev() {
                    self.revert(undo);
                }
                Err(e)
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AgentId, AuthorKind, Content, ContainerId, EdgeKind, EdgeSource, InteractionMode,
        NodeMetadata, SourceRole, Timestamp,
    };
    use ulid::Ulid;

    fn tree_id() -> TreeId {
        TreeId(Ulid(100))
    }

    fn node(n: u128) -> Node {
        Node {
            id: NodeId(Ulid(n)),
            short_id: format!("s{:05}", n),
            tree_id: tree_id(),
            content: Content::text(format!("node {}", n)),
            author_id: AgentId(Ulid(7)),
            author_kind: AuthorKind::Human,
            content_hash: String::new(),
            created_at: Timestamp(0),
            parent_ids: Vec::new(),
            metadata: NodeMetadata::default(),
            edited_from: None,
            version_group: None,
        }
    }

    fn edge(n: u128, sources: &[u128], target: u128) -> Edge {
        Edge {
            id: EdgeId(Ulid(n)),
            tree_id: tree_id(),
            sources: sources
                .iter()
                .map(|s| EdgeSource {
                    node_id: NodeId(Ulid(*s)),
                    role: SourceRole::Primary,
                })
                .collect(),
            target_id: NodeId(Ulid(target)),
            kind: EdgeKind::Continuation,
            created_at: Timestamp(0),
        }
    }

    fn tree() -> LoomTree {
        LoomTree {
            id: tree_id(),
            container_id: ContainerId(Ulid(9)),
            root_node_id: NodeId(Ulid(1)),
            mode: InteractionMode::Dialogue,
            system_context: None,
            title: None,
            description: None,
            summary: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
            deleted_at: None,
        }
    }

    #[test]
    fn transact_commits_on_ok() {
        let mut graph = LoomGraph::new();
        graph
            .transact(|w| {
                w.put_tree(&tree())?;
                w.put_node(&node(1))
            })
            .expect("transact");
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.revision().expect("revision"), 1);
    }

    #[test]
    fn transact_discards_on_err() {
        let mut graph = LoomGraph::new();
        let result: Result<(), LoomError> = graph.transact(|w| {
            w.put_node(&node(1))?;
            Err(LoomError::Validation("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.revision().expect("revision"), 0);
    }

    #[test]
    fn put_edge_reindexes_sources() {
        let mut graph = LoomGraph::new();
        graph.put_edge(&edge(50, &[1], 2)).expect("put");
        graph.put_edge(&edge(50, &[3], 2)).expect("put");

        assert!(graph.edges_by_source(NodeId(Ulid(1))).expect("q").is_empty());
        assert_eq!(graph.edges_by_source(NodeId(Ulid(3))).expect("q").len(), 1);
        assert_eq!(graph.edges_by_target(NodeId(Ulid(2))).expect("q").len(), 1);
    }

    #[test]
    fn delete_edge_clears_indexes() {
        let mut graph = LoomGraph::new();
        graph.put_edge(&edge(50, &[1, 3], 2)).expect("put");
        graph.delete_edge(EdgeId(Ulid(50))).expect("delete");
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.edges_by_target(NodeId(Ulid(2))).expect("q").is_empty());
        assert!(graph.delete_edge(EdgeId(Ulid(50))).is_err());
    }

    #[test]
    fn delete_tree_cascades() {
        let mut graph = LoomGraph::new();
        graph.put_tree(&tree()).expect("tree");
        graph.put_node(&node(1)).expect("node");
        graph.put_node(&node(2)).expect("node");
        graph.put_edge(&edge(50, &[1], 2)).expect("edge");
        let path = Path {
            id: PathId(Ulid(60)),
            tree_id: tree_id(),
            owner_agent_id: AgentId(Ulid(7)),
            name: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
            deleted_at: None,
        };
        graph.put_path(&path).expect("path");
        graph.push_path_node(path.id, NodeId(Ulid(1))).expect("push");
        graph.push_path_node(path.id, NodeId(Ulid(2))).expect("push");

        graph.delete_tree(tree_id()).expect("delete");

        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.path(path.id).expect("q").is_none());
        assert!(graph.path_nodes(path.id).expect("q").is_empty());
        assert!(!graph.short_id_taken(tree_id(), "s00001").expect("q"));
        assert!(graph.tree_paths(tree_id()).expect("q").is_empty());
    }

    #[test]
    fn short_id_index_follows_nodes() {
        let mut graph = LoomGraph::new();
        graph.put_node(&node(1)).expect("put");
        assert!(graph.short_id_taken(tree_id(), "s00001").expect("q"));
        assert!(!graph.short_id_taken(TreeId(Ulid(101)), "s00001").expect("q"));

        // A metadata rewrite keeps the handle taken.
        let mut updated = node(1);
        updated.metadata.excluded = true;
        graph.put_node(&updated).expect("put");
        assert!(graph.short_id_taken(tree_id(), "s00001").expect("q"));
    }

    #[test]
    fn path_rows_push_and_truncate() {
        let mut graph = LoomGraph::new();
        let path = PathId(Ulid(60));
        assert_eq!(graph.path_tail(path).expect("q"), None);
        for n in 1..=3 {
            let position = graph.push_path_node(path, NodeId(Ulid(n))).expect("push");
            assert_eq!(position, usize::try_from(n - 1).expect("small"));
        }
        assert_eq!(graph.path_len(path).expect("q"), 3);
        assert_eq!(graph.path_node_at(path, 1).expect("q"), Some(NodeId(Ulid(2))));
        assert_eq!(graph.path_tail(path).expect("q"), Some(NodeId(Ulid(3))));

        graph.truncate_path_nodes(path, 1).expect("truncate");
        assert_eq!(graph.path_nodes(path).expect("q"), vec![NodeId(Ulid(1))]);
        assert_eq!(graph.path_node_at(path, 2).expect("q"), None);
    }

    #[test]
    fn rollback_restores_records_and_indexes() {
        let mut graph = LoomGraph::new();
        let path = Path {
            id: PathId(Ulid(60)),
            tree_id: tree_id(),
            owner_agent_id: AgentId(Ulid(7)),
            name: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
            deleted_at: None,
        };
        graph
            .transact(|w| {
                w.put_tree(&tree())?;
                w.put_node(&node(1))?;
                w.put_node(&node(2))?;
                w.put_edge(&edge(50, &[1], 2))?;
                w.put_path(&path)?;
                w.push_path_node(path.id, NodeId(Ulid(1)))?;
                w.push_path_node(path.id, NodeId(Ulid(2)))?;
                w.put_selection(&PathSelection {
                    path_id: path.id,
                    target_node_id: NodeId(Ulid(2)),
                    selected_edge_id: Some(EdgeId(Ulid(50))),
                    selected_source_node_id: None,
                    updated_at: Timestamp(0),
                })
            })
            .expect("setup");
        let before = graph.clone();

        let result: Result<(), LoomError> = graph.transact(|w| {
            w.put_edge(&edge(50, &[3], 2))?;
            w.put_node(&node(3))?;
            w.truncate_path_nodes(path.id, 0)?;
            w.push_path_node(path.id, NodeId(Ulid(1)))?;
            w.delete_tree(tree_id())?;
            Err(LoomError::Validation("boom".into()))
        });
        assert!(result.is_err());

        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(
            graph.path_nodes(path.id).expect("q"),
            vec![NodeId(Ulid(1)), NodeId(Ulid(2))]
        );
        assert_eq!(graph.edges_by_source(NodeId(Ulid(1))).expect("q").len(), 1);
        assert!(graph.edges_by_source(NodeId(Ulid(3))).expect("q").is_empty());
        assert!(graph.short_id_taken(tree_id(), "s00002").expect("q"));
        assert!(!graph.short_id_taken(tree_id(), "s00003").expect("q"));
        assert_eq!(graph.path_selections(path.id).expect("q").len(), 1);
        assert_eq!(graph.tree_paths(tree_id()).expect("q").len(), 1);
        assert_eq!(graph.revision().expect("q"), before.revision().expect("q"));
        assert_eq!(format!("{:?}", graph), format!("{:?}", before));
    }

    #[test]
    fn version_group_members_in_creation_order() {
        let mut graph = LoomGraph::new();
        let original = node(1);
        let mut edit = node(2);
        edit.edited_from = Some(original.id);
        edit.version_group = Some(original.id);
        graph.put_node(&edit).expect("put");
        graph.put_node(&original).expect("put");

        let members: Vec<NodeId> = graph
            .version_group_members(original.id)
            .expect("q")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(members, vec![original.id, edit.id]);
    }
}
