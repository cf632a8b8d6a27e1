//! # Property-Based Tests
//!
//! Determinism and structural invariants checked with proptest.

use loomtree_core::canonical::canonical_json;
use loomtree_core::graph::{LoomGraph, LoomRead, LoomStore};
use loomtree_core::hypergraph::{
    NewTree, NodeAuthor, append_node, create_tree, find_children, find_parent_edges,
};
use loomtree_core::ids::derive_short_id;
use loomtree_core::path::{advance, create_path, path_sequence, replace_suffix, truncate};
use loomtree_core::provenance::{HashAuthor, compute_node_hash, verify_node};
use loomtree_core::{AgentId, ContainerId, Content, InteractionMode, LoomError, NodeId, Timestamp};
use proptest::collection::{btree_set, vec};
use proptest::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use ulid::Ulid;

const AGENT: AgentId = AgentId(Ulid(0xA));

#[derive(Debug, Clone)]
enum PathOp {
    /// Advance to the n-th child of the tail (modulo child count).
    Advance(usize),
    Truncate(usize),
    /// Replace from position with the first-child chain of the node there.
    Splice(usize),
    /// Advance to a valid child, then fail the transaction.
    FailedAdvance,
}

fn path_op() -> impl Strategy<Value = PathOp> {
    prop_oneof![
        4 => (0usize..4).prop_map(PathOp::Advance),
        1 => (0usize..8).prop_map(PathOp::Truncate),
        1 => (0usize..8).prop_map(PathOp::Splice),
        1 => Just(PathOp::FailedAdvance),
    ]
}

/// A tree with fan-out 3 to depth 4.
fn branching_tree() -> (LoomGraph, loomtree_core::TreeId, NodeId) {
    let mut graph = LoomGraph::new();
    let (tree, root) = create_tree(
        &mut graph,
        NewTree {
            container_id: ContainerId(Ulid(1)),
            mode: InteractionMode::Dialogue,
            system_context: None,
            title: None,
            description: None,
            root_content: Content::text("root"),
            root_author: AGENT,
        },
    )
    .expect("tree");

    let mut frontier = vec![root.node.id];
    for depth in 0..4 {
        let mut next = Vec::new();
        for parent in &frontier {
            for branch in 0..3 {
                let node = append_node(
                    &mut graph,
                    tree.id,
                    Content::text(format!("d{} b{}", depth, branch)),
                    NodeAuthor::Human(AGENT),
                    &[*parent],
                )
                .expect("append");
                next.push(node.node.id);
            }
        }
        frontier = next;
    }
    (graph, tree.id, root.node.id)
}

proptest! {
    /// Key insertion order never changes the canonical form.
    #[test]
    fn canonical_json_ignores_key_order(
        entries in btree_set(("[a-z]{1,6}", any::<i32>()), 1..12)
    ) {
        let entries: Vec<(String, i32)> = entries.into_iter().collect();
        let mut forward = Map::new();
        for (k, v) in &entries {
            forward.insert(k.clone(), Value::from(*v));
        }
        let mut backward = Map::new();
        for (k, v) in entries.iter().rev() {
            backward.insert(k.clone(), Value::from(*v));
        }
        prop_assert_eq!(
            canonical_json(&Value::Object(forward)).expect("canonical"),
            canonical_json(&Value::Object(backward)).expect("canonical")
        );
    }

    /// Serializing the same content twice gives the same string.
    #[test]
    fn canonical_content_is_deterministic(text in "\\PC{0,64}") {
        let content = Content::text(text);
        prop_assert_eq!(
            canonical_json(&content).expect("canonical"),
            canonical_json(&content).expect("canonical")
        );
    }

    /// Parent hash order does not affect the node hash.
    #[test]
    fn node_hash_ignores_parent_order(
        parents in vec("[0-9a-f]{64}", 0..6),
        millis in 0i64..4_000_000_000_000,
        shift in 0usize..6
    ) {
        let content = Content::text("merge");
        let mut rotated = parents.clone();
        if !rotated.is_empty() {
            let by = shift % rotated.len();
            rotated.rotate_left(by);
        }
        let mut reversed = parents.clone();
        reversed.reverse();

        let at = Timestamp::from_millis(millis);
        let author = HashAuthor::Human(AGENT);
        let base = compute_node_hash(&content, &parents, at, author).expect("hash");
        prop_assert_eq!(&base, &compute_node_hash(&content, &rotated, at, author).expect("hash"));
        prop_assert_eq!(&base, &compute_node_hash(&content, &reversed, at, author).expect("hash"));
    }

    /// Positions stay 0..n after any sequence of path moves, including a
    /// transaction that fails between two successful ones, and every step of
    /// the cached sequence follows a continuation edge.
    #[test]
    fn path_positions_stay_contiguous(ops in vec(path_op(), 1..24)) {
        let (mut graph, tree, root) = branching_tree();
        let path = create_path(&mut graph, tree, AGENT, None).expect("path");
        advance(&mut graph, path.id, root).expect("root");

        for op in ops {
            let before = graph.path_nodes(path.id).expect("nodes");
            let result: Result<Vec<NodeId>, LoomError> = match op {
                PathOp::Advance(n) => {
                    let tail = before.last().copied().unwrap_or(root);
                    let children = find_children(&graph, tail).expect("children");
                    if children.is_empty() {
                        Ok(before.clone())
                    } else {
                        let child = children[n % children.len()].id;
                        graph.transact(|w| {
                            advance(w, path.id, child)?;
                            w.path_nodes(path.id)
                        })
                    }
                }
                PathOp::Truncate(len) => {
                    let len = len.min(before.len()).max(1);
                    graph.transact(|w| truncate(w, path.id, len))
                }
                PathOp::Splice(from) => {
                    let from = from.min(before.len().saturating_sub(1)).max(1);
                    let mut chain = Vec::new();
                    let mut cursor = before[from - 1];
                    while let Some(child) = find_children(&graph, cursor).expect("children").first() {
                        chain.push(child.id);
                        cursor = child.id;
                    }
                    graph.transact(|w| replace_suffix(w, path.id, from, &chain))
                }
                PathOp::FailedAdvance => {
                    let tail = before.last().copied().unwrap_or(root);
                    let next = find_children(&graph, tail)
                        .expect("children")
                        .first()
                        .map(|n| n.id);
                    let outcome = graph.transact(|w| {
                        if let Some(next) = next {
                            advance(w, path.id, next)?;
                        }
                        Err::<Vec<NodeId>, _>(LoomError::Validation("abort".into()))
                    });
                    prop_assert!(outcome.is_err());
                    prop_assert_eq!(graph.path_nodes(path.id).expect("nodes"), before.clone());
                    Ok(before.clone())
                }
            };
            prop_assert!(result.is_ok() || graph.path_nodes(path.id).expect("nodes") == before);

            let sequence = path_sequence(&graph, path.id).expect("sequence");
            prop_assert!(!sequence.is_empty());
            for (i, entry) in sequence.iter().enumerate() {
                prop_assert_eq!(entry.position, i);
            }
            prop_assert_eq!(sequence[0].node_id, root);
            prop_assert_eq!(graph.path_len(path.id).expect("len"), sequence.len());
            for pair in sequence.windows(2) {
                let (parent, child) = (pair[0].node_id, pair[1].node_id);
                let linked = find_parent_edges(&graph, child)
                    .expect("edges")
                    .iter()
                    .any(|e| e.has_source(parent));
                prop_assert!(linked, "{} does not continue {}", child, parent);
            }
        }
    }

    /// Every freshly appended node verifies.
    #[test]
    fn fresh_nodes_verify(texts in vec("\\PC{1,32}", 1..8)) {
        let (mut graph, tree, root) = branching_tree();
        let mut parent = root;
        for text in texts {
            let created = append_node(
                &mut graph,
                tree,
                Content::text(text),
                NodeAuthor::Human(AGENT),
                &[parent],
            )
            .expect("append");
            prop_assert!(verify_node(&graph, created.node.id).expect("verify").valid);
            parent = created.node.id;
        }
    }

    /// Derived short ids never collide with the existing set.
    #[test]
    fn short_id_never_collides(
        existing in btree_set("[0-9a-f]{6,8}", 0..64),
        source in "[0-9a-f]{64}"
    ) {
        let existing: BTreeSet<String> = existing;
        let short = derive_short_id(&source, &existing).expect("derive");
        prop_assert!(!existing.contains(&short.value));
        prop_assert!(short.value.len() >= 6 && short.value.len() <= 10);
    }
}
