//! # Path Resolution Engine
//!
//! A path is one agent's deterministic walk through a tree. Its node sequence
//! is cached one row per position. Rows are only pushed at the end or cut off
//! from a position on, so positions are always `0..n` with no gaps.
//!
//! Forward moves are explicit (the agent names the child). Backward moves are
//! where ambiguity lives: a merge node has several parent edges, and a
//! hyperedge has several sources. Those cases are settled by a stored
//! [`PathSelection`]; without one, resolution fails with `SelectionRequired`.

use crate::graph::{LoomRead, LoomWrite};
use crate::hypergraph::{find_parent_edges, require_live_tree, validate_label};
use crate::primitives::MAX_ANCESTRY_DEPTH;
use crate::{
    AgentId, Edge, EdgeId, InteractionMode, LoomError, NodeId, ParentCandidate, Path, PathId,
    PathNode, PathSelection, PathState, PathStateKey, Timestamp, TreeId,
};
use std::collections::BTreeSet;

// =============================================================================
// PATH RECORDS
// =============================================================================

/// Create an empty path owned by `owner`.
pub fn create_path(
    store: &mut dyn LoomWrite,
    tree_id: TreeId,
    owner: AgentId,
    name: Option<String>,
) -> Result<Path, LoomError> {
    require_live_tree(&*store, tree_id)?;
    if let Some(name) = &name {
        validate_label("path name", name)?;
    }
    let now = Timestamp::now();
    let path = Path {
        id: PathId::generate()?,
        tree_id,
        owner_agent_id: owner,
        name,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    };
    store.put_path(&path)?;
    tracing::debug!(path = %path.id, tree = %tree_id, owner = %owner, "path created");
    Ok(path)
}

/// Fetch a path that exists and is not soft-deleted.
pub fn require_live_path<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
) -> Result<Path, LoomError> {
    let path = store.require_path(path_id)?;
    if path.deleted_at.is_some() {
        return Err(LoomError::Validation(format!(
            "path {} is deleted",
            path_id
        )));
    }
    Ok(path)
}

/// Mark a path deleted.
pub fn soft_delete_path(store: &mut dyn LoomWrite, path_id: PathId) -> Result<Path, LoomError> {
    let mut path = require_live_path(&*store, path_id)?;
    let now = Timestamp::now();
    path.deleted_at = Some(now);
    path.updated_at = now;
    store.put_path(&path)?;
    Ok(path)
}

/// The cached sequence as position records.
pub fn path_sequence<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
) -> Result<Vec<PathNode>, LoomError> {
    Ok(store
        .path_nodes(path_id)?
        .into_iter()
        .enumerate()
        .map(|(position, node_id)| PathNode {
            path_id,
            position,
            node_id,
        })
        .collect())
}

fn touch(store: &mut dyn LoomWrite, mut path: Path) -> Result<(), LoomError> {
    path.updated_at = Timestamp::now();
    store.put_path(&path)
}

/// Replace the rows from `from` on with `nodes`.
fn store_suffix(
    store: &mut dyn LoomWrite,
    path: Path,
    from: usize,
    nodes: &[NodeId],
) -> Result<(), LoomError> {
    store.truncate_path_nodes(path.id, from)?;
    for node in nodes {
        store.push_path_node(path.id, *node)?;
    }
    touch(store, path)
}

// =============================================================================
// FORWARD MOVES
// =============================================================================

/// Return the cached sequence, seeding it with the root when empty.
pub fn resolve(store: &mut dyn LoomWrite, path_id: PathId) -> Result<Vec<NodeId>, LoomError> {
    resolve_tail(store, path_id)?;
    store.path_nodes(path_id)
}

/// The last node of the path, seeding an empty cache with the root first.
pub fn resolve_tail(store: &mut dyn LoomWrite, path_id: PathId) -> Result<NodeId, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    if let Some(tail) = store.path_tail(path_id)? {
        return Ok(tail);
    }
    let tree = require_live_tree(&*store, path.tree_id)?;
    store_suffix(store, path, 0, &[tree.root_node_id])?;
    Ok(tree.root_node_id)
}

/// The continuation edge linking `parent` to `child`, if any.
fn linking_edge<R: LoomRead + ?Sized>(
    store: &R,
    parent: NodeId,
    child: NodeId,
) -> Result<Option<Edge>, LoomError> {
    Ok(find_parent_edges(store, child)?
        .into_iter()
        .find(|e| e.has_source(parent)))
}

/// Check that `next` may follow `previous` (or start a path when `None`).
///
/// When the step enters a merge node or crosses a hyperedge, returns the
/// selection that pins it, unless the stored one already names this edge and
/// source. Nothing is written here.
fn check_step<R: LoomRead + ?Sized>(
    store: &R,
    path: &Path,
    previous: Option<NodeId>,
    next: NodeId,
) -> Result<Option<PathSelection>, LoomError> {
    let Some(previous) = previous else {
        let tree = store.require_tree(path.tree_id)?;
        if next != tree.root_node_id {
            return Err(LoomError::Validation(format!(
                "path {} must start at the root {}, not {}",
                path.id, tree.root_node_id, next
            )));
        }
        return Ok(None);
    };

    let Some(edge) = linking_edge(store, previous, next)? else {
        return Err(LoomError::Validation(format!(
            "node {} is not a child of {}",
            next, previous
        )));
    };

    let ambiguous = edge.sources.len() > 1 || find_parent_edges(store, next)?.len() > 1;
    if !ambiguous {
        return Ok(None);
    }
    let pinned = store.selection(path.id, next)?.is_some_and(|s| {
        s.selected_edge_id == Some(edge.id) && s.selected_source_node_id == Some(previous)
    });
    if pinned {
        return Ok(None);
    }
    Ok(Some(PathSelection {
        path_id: path.id,
        target_node_id: next,
        selected_edge_id: Some(edge.id),
        selected_source_node_id: Some(previous),
        updated_at: Timestamp::now(),
    }))
}

/// Append `node_id` at the next position. Returns the new length.
///
/// The node must be a child of the current last node, or the root when the
/// path is empty.
pub fn advance(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    node_id: NodeId,
) -> Result<usize, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let tail = store.path_tail(path_id)?;
    if let Some(pin) = check_step(&*store, &path, tail, node_id)? {
        store.put_selection(&pin)?;
    }
    let position = store.push_path_node(path_id, node_id)?;
    touch(store, path)?;
    Ok(position + 1)
}

/// Keep only the first `new_len` positions.
pub fn truncate(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    new_len: usize,
) -> Result<Vec<NodeId>, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let len = store.path_len(path_id)?;
    if new_len > len {
        return Err(LoomError::Validation(format!(
            "cannot truncate path of length {} to {}",
            len, new_len
        )));
    }
    store_suffix(store, path, new_len, &[])?;
    store.path_nodes(path_id)
}

/// Drop every position from `from` on and splice in `suffix`.
///
/// Every step of the splice is checked before anything is written, so a
/// rejected splice leaves rows and selections untouched even outside a
/// transaction.
pub fn replace_suffix(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    from: usize,
    suffix: &[NodeId],
) -> Result<Vec<NodeId>, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let len = store.path_len(path_id)?;
    if from > len {
        return Err(LoomError::Validation(format!(
            "position {} is past the end of path {} (length {})",
            from, path_id, len
        )));
    }

    let mut previous = match from {
        0 => None,
        _ => store.path_node_at(path_id, from - 1)?,
    };
    let mut pins = Vec::new();
    for next in suffix {
        pins.extend(check_step(&*store, &path, previous, *next)?);
        previous = Some(*next);
    }

    for pin in &pins {
        store.put_selection(pin)?;
    }
    store_suffix(store, path, from, suffix)?;
    store.path_nodes(path_id)
}

// =============================================================================
// BACKWARD RESOLUTION
// =============================================================================

fn candidates_of(edges: &[Edge]) -> Vec<ParentCandidate> {
    edges
        .iter()
        .flat_map(|edge| {
            edge.sources.iter().map(move |source| ParentCandidate {
                edge_id: edge.id,
                source_node_id: source.node_id,
                role: source.role,
            })
        })
        .collect()
}

/// The parent `path` follows when stepping back from `node_id`.
///
/// `None` means `node_id` is a root. A single single-source parent edge needs
/// no selection. Otherwise the stored selection decides; a missing or stale
/// selection is `SelectionRequired`.
pub fn resolve_parent<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
    node_id: NodeId,
) -> Result<Option<ParentCandidate>, LoomError> {
    let edges = find_parent_edges(store, node_id)?;
    match edges.as_slice() {
        [] => return Ok(None),
        [edge] if edge.sources.len() == 1 => {
            return Ok(candidates_of(&edges).into_iter().next());
        }
        _ => {}
    }

    let candidates = candidates_of(&edges);
    let required = |candidates: Vec<ParentCandidate>| LoomError::SelectionRequired {
        path: path_id,
        node: node_id,
        candidates,
    };

    let Some(selection) = store.selection(path_id, node_id)? else {
        return Err(required(candidates));
    };

    let matching: Vec<ParentCandidate> = candidates
        .iter()
        .filter(|c| selection.selected_edge_id.is_none_or(|e| e == c.edge_id))
        .filter(|c| {
            selection
                .selected_source_node_id
                .is_none_or(|s| s == c.source_node_id)
        })
        .copied()
        .collect();

    match matching.as_slice() {
        [chosen] => Ok(Some(*chosen)),
        [] => {
            tracing::debug!(path = %path_id, node = %node_id, "stored selection is stale");
            Err(required(candidates))
        }
        _ => Err(required(matching)),
    }
}

/// Walk from `node_id` back to the root. Returned root first.
///
/// A cycle or a walk longer than the ancestry bound is `InvalidState`, as is
/// ending anywhere but the tree's recorded root.
pub fn resolve_ancestry<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
    node_id: NodeId,
) -> Result<Vec<NodeId>, LoomError> {
    let path = store.require_path(path_id)?;
    let node = store.require_node(node_id)?;
    if node.tree_id != path.tree_id {
        return Err(LoomError::Validation(format!(
            "node {} is not in the tree of path {}",
            node_id, path_id
        )));
    }
    let tree = store.require_tree(path.tree_id)?;

    let mut chain = vec![node_id];
    let mut seen = BTreeSet::from([node_id]);
    let mut current = node_id;
    while let Some(parent) = resolve_parent(store, path_id, current)? {
        if chain.len() >= MAX_ANCESTRY_DEPTH {
            return Err(LoomError::InvalidState(format!(
                "ancestry of {} exceeds {} nodes",
                node_id, MAX_ANCESTRY_DEPTH
            )));
        }
        current = parent.source_node_id;
        if !seen.insert(current) {
            return Err(LoomError::InvalidState(format!(
                "continuation cycle through node {}",
                current
            )));
        }
        chain.push(current);
    }

    if current != tree.root_node_id {
        return Err(LoomError::InvalidState(format!(
            "ancestry of {} ends at {}, not the root {}",
            node_id, current, tree.root_node_id
        )));
    }

    chain.reverse();
    Ok(chain)
}

/// Rebuild the path cache so it ends at `node_id`.
pub fn navigate_to(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    node_id: NodeId,
) -> Result<Vec<NodeId>, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let chain = resolve_ancestry(&*store, path_id, node_id)?;
    store_suffix(store, path, 0, &chain)?;
    tracing::debug!(path = %path_id, node = %node_id, depth = chain.len(), "path navigated");
    Ok(chain)
}

// =============================================================================
// SELECTIONS
// =============================================================================

/// Record which parent `path` follows when stepping back from `target`.
///
/// At least one of `edge_id` / `source_id` must be given. The edge must be a
/// continuation edge into `target`; the source must be on that edge (or on
/// some parent edge of `target` when no edge is named).
pub fn upsert_selection(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    target: NodeId,
    edge_id: Option<EdgeId>,
    source_id: Option<NodeId>,
) -> Result<PathSelection, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let node = store.require_node(target)?;
    if node.tree_id != path.tree_id {
        return Err(LoomError::Validation(format!(
            "node {} is not in the tree of path {}",
            target, path_id
        )));
    }
    if edge_id.is_none() && source_id.is_none() {
        return Err(LoomError::Validation(
            "a selection needs an edge, a source, or both".into(),
        ));
    }

    let parent_edges = find_parent_edges(&*store, target)?;
    if let Some(edge_id) = edge_id {
        let Some(edge) = parent_edges.iter().find(|e| e.id == edge_id) else {
            return Err(LoomError::Validation(format!(
                "edge {} is not a continuation edge into {}",
                edge_id, target
            )));
        };
        if let Some(source) = source_id {
            if !edge.has_source(source) {
                return Err(LoomError::Validation(format!(
                    "node {} is not a source of edge {}",
                    source, edge_id
                )));
            }
        }
    } else if let Some(source) = source_id {
        if !parent_edges.iter().any(|e| e.has_source(source)) {
            return Err(LoomError::Validation(format!(
                "node {} is not a parent of {}",
                source, target
            )));
        }
    }

    let selection = PathSelection {
        path_id,
        target_node_id: target,
        selected_edge_id: edge_id,
        selected_source_node_id: source_id,
        updated_at: Timestamp::now(),
    };
    store.put_selection(&selection)?;
    tracing::debug!(path = %path_id, target = %target, "selection stored");
    Ok(selection)
}

/// Forget the selection for `target`. Returns whether one existed.
pub fn clear_selection(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    target: NodeId,
) -> Result<bool, LoomError> {
    require_live_path(&*store, path_id)?;
    store.delete_selection(path_id, target)
}

// =============================================================================
// CURSORS
// =============================================================================

/// Move an agent's cursor. Last writer wins per (path, agent, mode).
pub fn set_active_node(
    store: &mut dyn LoomWrite,
    path_id: PathId,
    agent_id: AgentId,
    node_id: NodeId,
    mode: Option<InteractionMode>,
) -> Result<PathState, LoomError> {
    let path = require_live_path(&*store, path_id)?;
    let node = store.require_node(node_id)?;
    if node.tree_id != path.tree_id {
        return Err(LoomError::Validation(format!(
            "node {} is not in the tree of path {}",
            node_id, path_id
        )));
    }
    let state = PathState {
        path_id,
        agent_id,
        mode,
        active_node_id: node_id,
        updated_at: Timestamp::now(),
    };
    store.put_path_state(&state)?;
    Ok(state)
}

/// An agent's cursor, if it has one.
pub fn active_node<R: LoomRead + ?Sized>(
    store: &R,
    path_id: PathId,
    agent_id: AgentId,
    mode: Option<InteractionMode>,
) -> Result<Option<PathState>, LoomError> {
    store.path_state(&PathStateKey {
        path_id,
        agent_id,
        mode,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LoomGraph, LoomStore};
    use crate::hypergraph::{NewTree, NodeAuthor, add_source_to_edge, append_node, create_tree};
    use crate::{ContainerId, Content, EdgeSource, LoomTree, Node, SourceRole};
    use ulid::Ulid;

    const AGENT: AgentId = AgentId(Ulid(0xA));

    fn setup() -> (LoomGraph, LoomTree, Node, Path) {
        let mut graph = LoomGraph::new();
        let (tree, root) = create_tree(
            &mut graph,
            NewTree {
                container_id: ContainerId(Ulid(1)),
                mode: InteractionMode::Dialogue,
                system_context: None,
                title: None,
                description: None,
                root_content: Content::text("hello"),
                root_author: AGENT,
            },
        )
        .expect("tree");
        let path = create_path(&mut graph, tree.id, AGENT, Some("main".into())).expect("path");
        (graph, tree, root.node, path)
    }

    fn append(graph: &mut LoomGraph, tree: TreeId, parents: &[NodeId], text: &str) -> NodeId {
        append_node(graph, tree, Content::text(text), NodeAuthor::Human(AGENT), parents)
            .expect("append")
            .node
            .id
    }

    fn assert_contiguous(graph: &LoomGraph, path: PathId) {
        let seq = path_sequence(graph, path).expect("sequence");
        assert!(seq.iter().enumerate().all(|(i, p)| p.position == i));
    }

    #[test]
    fn resolve_seeds_root() {
        let (mut graph, _, root, path) = setup();
        assert_eq!(resolve(&mut graph, path.id).expect("resolve"), vec![root.id]);
        // A second resolve trusts the cache.
        assert_eq!(resolve(&mut graph, path.id).expect("resolve"), vec![root.id]);
    }

    #[test]
    fn advance_requires_child_of_tail() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        let b = append(&mut graph, tree.id, &[root.id], "b");

        assert!(matches!(
            advance(&mut graph, path.id, a),
            Err(LoomError::Validation(_))
        ));
        assert_eq!(advance(&mut graph, path.id, root.id).expect("root"), 1);
        assert_eq!(advance(&mut graph, path.id, a).expect("a"), 2);
        assert!(matches!(
            advance(&mut graph, path.id, b),
            Err(LoomError::Validation(_))
        ));
        assert_eq!(graph.path_nodes(path.id).expect("q"), vec![root.id, a]);
        assert_contiguous(&graph, path.id);
    }

    #[test]
    fn truncate_and_replace_suffix() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        let a2 = append(&mut graph, tree.id, &[a], "a2");
        let b = append(&mut graph, tree.id, &[root.id], "b");
        let b2 = append(&mut graph, tree.id, &[b], "b2");
        replace_suffix(&mut graph, path.id, 0, &[root.id, a, a2]).expect("replace");

        let seq = replace_suffix(&mut graph, path.id, 1, &[b, b2]).expect("replace");
        assert_eq!(seq, vec![root.id, b, b2]);
        assert_contiguous(&graph, path.id);

        assert!(replace_suffix(&mut graph, path.id, 1, &[a2]).is_err());
        assert_eq!(
            graph.path_nodes(path.id).expect("q"),
            vec![root.id, b, b2],
            "a rejected splice leaves the cache untouched"
        );

        assert_eq!(truncate(&mut graph, path.id, 1).expect("truncate"), vec![root.id]);
        assert!(truncate(&mut graph, path.id, 5).is_err());
    }

    #[test]
    fn failed_transaction_keeps_path_contiguous() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        advance(&mut graph, path.id, root.id).expect("root");

        let result: Result<(), LoomError> = graph.transact(|w| {
            advance(w, path.id, a)?;
            truncate(w, path.id, 0)?;
            Err(LoomError::IoError("simulated crash".into()))
        });
        assert!(result.is_err());
        assert_eq!(graph.path_nodes(path.id).expect("q"), vec![root.id]);
        assert_contiguous(&graph, path.id);
    }

    #[test]
    fn merge_requires_selection() {
        let (mut graph, tree, root, path) = setup();
        let p1 = append(&mut graph, tree.id, &[root.id], "p1");
        let p2 = append(&mut graph, tree.id, &[root.id], "p2");
        let t = append(&mut graph, tree.id, &[p1, p2], "t");

        let err = resolve_parent(&graph, path.id, t).expect_err("ambiguous");
        assert!(matches!(
            &err,
            LoomError::SelectionRequired { candidates, node, .. } if candidates.len() == 2 && *node == t
        ));

        let edge_from_p1 = find_parent_edges(&graph, t)
            .expect("edges")
            .into_iter()
            .find(|e| e.has_source(p1))
            .expect("edge");
        upsert_selection(&mut graph, path.id, t, Some(edge_from_p1.id), None).expect("select");

        let parent = resolve_parent(&graph, path.id, t).expect("resolve").expect("parent");
        assert_eq!(parent.source_node_id, p1);
        assert_eq!(
            resolve_ancestry(&graph, path.id, t).expect("ancestry"),
            vec![root.id, p1, t]
        );
    }

    #[test]
    fn hyperedge_needs_source_selection() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        let b = append(&mut graph, tree.id, &[root.id], "b");
        let c = append(&mut graph, tree.id, &[a], "c");
        let edge = find_parent_edges(&graph, c).expect("edges")[0].clone();
        add_source_to_edge(
            &mut graph,
            edge.id,
            EdgeSource {
                node_id: b,
                role: SourceRole::Context,
            },
        )
        .expect("add");

        assert!(matches!(
            resolve_parent(&graph, path.id, c),
            Err(LoomError::SelectionRequired { .. })
        ));

        // Naming only the edge is not enough on a multi-source edge.
        upsert_selection(&mut graph, path.id, c, Some(edge.id), None).expect("select");
        assert!(matches!(
            resolve_parent(&graph, path.id, c),
            Err(LoomError::SelectionRequired { .. })
        ));

        upsert_selection(&mut graph, path.id, c, Some(edge.id), Some(b)).expect("select");
        assert_eq!(
            resolve_ancestry(&graph, path.id, c).expect("ancestry"),
            vec![root.id, b, c]
        );

        assert!(clear_selection(&mut graph, path.id, c).expect("clear"));
        assert!(!clear_selection(&mut graph, path.id, c).expect("clear"));
    }

    #[test]
    fn advancing_through_merge_records_selection() {
        let (mut graph, tree, root, path) = setup();
        let p1 = append(&mut graph, tree.id, &[root.id], "p1");
        let p2 = append(&mut graph, tree.id, &[root.id], "p2");
        let t = append(&mut graph, tree.id, &[p1, p2], "t");

        replace_suffix(&mut graph, path.id, 0, &[root.id, p2, t]).expect("walk");
        let selection = graph.selection(path.id, t).expect("q").expect("selection");
        assert_eq!(selection.selected_source_node_id, Some(p2));
        assert_eq!(
            navigate_to(&mut graph, path.id, t).expect("navigate"),
            vec![root.id, p2, t]
        );
    }

    #[test]
    fn rebranching_through_another_parent_repins_selection() {
        let (mut graph, tree, root, path) = setup();
        let p1 = append(&mut graph, tree.id, &[root.id], "p1");
        let p2 = append(&mut graph, tree.id, &[root.id], "p2");
        let t = append(&mut graph, tree.id, &[p1, p2], "t");

        replace_suffix(&mut graph, path.id, 0, &[root.id, p1, t]).expect("walk");
        let cached = replace_suffix(&mut graph, path.id, 1, &[p2, t]).expect("rebranch");
        assert_eq!(cached, vec![root.id, p2, t]);
        assert_eq!(resolve_ancestry(&graph, path.id, t).expect("ancestry"), cached);
        let selection = graph.selection(path.id, t).expect("q").expect("selection");
        assert_eq!(selection.selected_source_node_id, Some(p2));

        // Same again one step at a time.
        truncate(&mut graph, path.id, 1).expect("truncate");
        advance(&mut graph, path.id, p1).expect("p1");
        advance(&mut graph, path.id, t).expect("t");
        assert_eq!(
            resolve_ancestry(&graph, path.id, t).expect("ancestry"),
            graph.path_nodes(path.id).expect("q")
        );
    }

    #[test]
    fn rejected_splice_writes_no_selection() {
        let (mut graph, tree, root, path) = setup();
        let p1 = append(&mut graph, tree.id, &[root.id], "p1");
        let p2 = append(&mut graph, tree.id, &[root.id], "p2");
        let t = append(&mut graph, tree.id, &[p1, p2], "t");
        let stray = append(&mut graph, tree.id, &[root.id], "stray");
        replace_suffix(&mut graph, path.id, 0, &[root.id]).expect("seed");

        // The merge step is valid; the step after it is not.
        assert!(replace_suffix(&mut graph, path.id, 1, &[p2, t, stray]).is_err());
        assert!(graph.selection(path.id, t).expect("q").is_none());
        assert_eq!(graph.path_nodes(path.id).expect("q"), vec![root.id]);
        assert!(graph.path_selections(path.id).expect("q").is_empty());
    }

    #[test]
    fn resolve_tail_seeds_once() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        assert_eq!(resolve_tail(&mut graph, path.id).expect("tail"), root.id);
        advance(&mut graph, path.id, a).expect("a");
        assert_eq!(resolve_tail(&mut graph, path.id).expect("tail"), a);
        assert_eq!(graph.path_len(path.id).expect("q"), 2);
    }

    #[test]
    fn selection_validation() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        let b = append(&mut graph, tree.id, &[root.id], "b");
        assert!(upsert_selection(&mut graph, path.id, a, None, None).is_err());
        assert!(upsert_selection(&mut graph, path.id, a, None, Some(b)).is_err());
        assert!(upsert_selection(&mut graph, path.id, a, None, Some(root.id)).is_ok());
    }

    #[test]
    fn navigate_rebuilds_cache() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        let b = append(&mut graph, tree.id, &[a], "b");
        assert_eq!(
            navigate_to(&mut graph, path.id, b).expect("navigate"),
            vec![root.id, a, b]
        );
        assert_contiguous(&graph, path.id);
    }

    #[test]
    fn cursor_is_last_writer_wins() {
        let (mut graph, tree, root, path) = setup();
        let a = append(&mut graph, tree.id, &[root.id], "a");
        set_active_node(&mut graph, path.id, AGENT, root.id, None).expect("set");
        set_active_node(&mut graph, path.id, AGENT, a, None).expect("set");
        set_active_node(&mut graph, path.id, AGENT, root.id, Some(InteractionMode::Buffer))
            .expect("set");

        let dialogue = active_node(&graph, path.id, AGENT, None).expect("q").expect("state");
        assert_eq!(dialogue.active_node_id, a);
        let buffer = active_node(&graph, path.id, AGENT, Some(InteractionMode::Buffer))
            .expect("q")
            .expect("state");
        assert_eq!(buffer.active_node_id, root.id);
    }

    #[test]
    fn deleted_path_rejects_moves() {
        let (mut graph, _, root, path) = setup();
        soft_delete_path(&mut graph, path.id).expect("delete");
        assert!(advance(&mut graph, path.id, root.id).is_err());
    }
}
