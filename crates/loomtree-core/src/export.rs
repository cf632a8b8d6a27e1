//! # Canonical Tree Export
//!
//! A tree snapshot serialized to a deterministic `postcard` stream:
//!
//! ```text
//! [header_len: u32 LE] [ExportHeader (postcard)] [TreeSnapshot (postcard)]
//! ```
//!
//! Records are sorted by id, so two stores holding the same tree export the
//! same bytes. Import checks the header and checksum, then re-verifies every
//! node hash inside the import transaction before anything is committed.

use crate::graph::{LoomRead, LoomWrite};
use crate::hypergraph::{find_root, validate_edge_shape};
use crate::provenance::audit_tree;
use crate::{Edge, EdgeId, LoomError, LoomTree, Node, NodeId, RawResponseEvidence, TreeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

// =============================================================================
// FORMAT
// =============================================================================

/// Magic bytes of a tree export.
pub const EXPORT_MAGIC: [u8; 4] = *b"LOOM";

/// Current export format version.
pub const EXPORT_VERSION: u8 = 1;

/// Upper bound on nodes accepted by an import.
pub const MAX_IMPORT_NODE_COUNT: u64 = 1_000_000;

/// Upper bound on edges accepted by an import.
pub const MAX_IMPORT_EDGE_COUNT: u64 = 10_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub node_count: u64,
    pub edge_count: u64,
    /// Rolling checksum of the snapshot bytes. Detects corruption, not
    /// tampering; tampering is caught by hash verification on import.
    pub checksum: u64,
}

impl ExportHeader {
    fn validate(&self) -> Result<(), LoomError> {
        if self.magic != EXPORT_MAGIC {
            return Err(LoomError::SerializationError(
                "Invalid file format".to_string(),
            ));
        }
        if self.version != EXPORT_VERSION {
            return Err(LoomError::SerializationError(
                "Unsupported file version".to_string(),
            ));
        }
        if self.node_count > MAX_IMPORT_NODE_COUNT {
            return Err(LoomError::SerializationError(format!(
                "Node count {} exceeds maximum allowed {}",
                self.node_count, MAX_IMPORT_NODE_COUNT
            )));
        }
        if self.edge_count > MAX_IMPORT_EDGE_COUNT {
            return Err(LoomError::SerializationError(format!(
                "Edge count {} exceeds maximum allowed {}",
                self.edge_count, MAX_IMPORT_EDGE_COUNT
            )));
        }
        Ok(())
    }
}

/// Everything that makes up one tree's hypergraph. Paths are per-agent views
/// and are not exported.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TreeSnapshot {
    pub tree: LoomTree,
    /// Sorted by id.
    pub nodes: Vec<Node>,
    /// Sorted by id.
    pub edges: Vec<Edge>,
    /// Sorted by node id.
    pub evidence: Vec<RawResponseEvidence>,
}

impl TreeSnapshot {
    /// Collect a tree from a store.
    pub fn capture<R: LoomRead + ?Sized>(store: &R, tree_id: TreeId) -> Result<Self, LoomError> {
        let tree = store.require_tree(tree_id)?;
        let mut nodes = store.tree_nodes(tree_id)?;
        nodes.sort_by_key(|n| n.id);
        let mut edges = store.tree_edges(tree_id)?;
        edges.sort_by_key(|e| e.id);
        let mut evidence = Vec::new();
        for node in &nodes {
            if let Some(row) = store.evidence(node.id)? {
                evidence.push(row);
            }
        }
        Ok(Self {
            tree,
            nodes,
            edges,
            evidence,
        })
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |hash, b| hash.rotate_left(5) ^ u64::from(*b))
}

// =============================================================================
// EXPORT / IMPORT
// =============================================================================

/// Serialize one tree.
pub fn export_tree<R: LoomRead + ?Sized>(store: &R, tree_id: TreeId) -> Result<Vec<u8>, LoomError> {
    encode_snapshot(&TreeSnapshot::capture(store, tree_id)?)
}

/// Serialize an already captured snapshot.
pub fn encode_snapshot(snapshot: &TreeSnapshot) -> Result<Vec<u8>, LoomError> {
    let data_bytes = postcard::to_allocvec(snapshot)
        .map_err(|e| LoomError::SerializationError(format!("Data: {}", e)))?;
    let header = ExportHeader {
        magic: EXPORT_MAGIC,
        version: EXPORT_VERSION,
        node_count: snapshot.nodes.len() as u64,
        edge_count: snapshot.edges.len() as u64,
        checksum: checksum(&data_bytes),
    };
    let header_bytes = postcard::to_allocvec(&header)
        .map_err(|e| LoomError::SerializationError(format!("Header: {}", e)))?;

    let mut result = Vec::with_capacity(4 + header_bytes.len() + data_bytes.len());
    result.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    result.extend_from_slice(&header_bytes);
    result.extend_from_slice(&data_bytes);
    Ok(result)
}

/// Parse and integrity-check an export without touching any store.
pub fn decode_snapshot(data: &[u8]) -> Result<TreeSnapshot, LoomError> {
    let Some((len_bytes, rest)) = data.split_first_chunk::<4>() else {
        return Err(LoomError::SerializationError("Data too short".to_string()));
    };
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(LoomError::SerializationError(
            "Data too short for header".to_string(),
        ));
    }
    let (header_bytes, data_bytes) = rest.split_at(header_len);

    let header: ExportHeader = postcard::from_bytes(header_bytes)
        .map_err(|e| LoomError::SerializationError(format!("Header: {}", e)))?;
    header.validate()?;

    let computed = checksum(data_bytes);
    if computed != header.checksum {
        return Err(LoomError::SerializationError(format!(
            "Checksum mismatch: expected {}, got {}",
            header.checksum, computed
        )));
    }

    let snapshot: TreeSnapshot = postcard::from_bytes(data_bytes)
        .map_err(|e| LoomError::SerializationError(format!("Data: {}", e)))?;
    if snapshot.nodes.len() as u64 != header.node_count {
        return Err(LoomError::SerializationError(
            "Node count mismatch".to_string(),
        ));
    }
    if snapshot.edges.len() as u64 != header.edge_count {
        return Err(LoomError::SerializationError(
            "Edge count mismatch".to_string(),
        ));
    }
    Ok(snapshot)
}

/// Check that a snapshot is self-contained before any of it is written:
/// unique ids and short ids, edges whose every endpoint is one of the
/// snapshot's own nodes, evidence only for those nodes, and continuation
/// edges that neither target the root nor form a cycle.
fn check_snapshot(store: &dyn LoomWrite, snapshot: &TreeSnapshot) -> Result<(), LoomError> {
    let tree_id = snapshot.tree.id;
    let mut node_ids = BTreeSet::new();
    let mut short_ids = BTreeSet::new();
    for node in &snapshot.nodes {
        if node.tree_id != tree_id || store.node(node.id)?.is_some() {
            return Err(LoomError::Conflict(format!(
                "node {} cannot be imported into tree {}",
                node.id, tree_id
            )));
        }
        if !node_ids.insert(node.id) || !short_ids.insert(node.short_id.as_str()) {
            return Err(LoomError::Validation(format!(
                "export of tree {} repeats node {} or its short id",
                tree_id, node.id
            )));
        }
    }
    if !node_ids.contains(&snapshot.tree.root_node_id) {
        return Err(LoomError::Validation(format!(
            "export of tree {} does not contain its root {}",
            tree_id, snapshot.tree.root_node_id
        )));
    }

    let mut edge_ids: BTreeSet<EdgeId> = BTreeSet::new();
    for edge in &snapshot.edges {
        if edge.tree_id != tree_id {
            return Err(LoomError::Validation(format!(
                "export of tree {} contains foreign edge {}",
                tree_id, edge.id
            )));
        }
        if !edge_ids.insert(edge.id) || store.edge(edge.id)?.is_some() {
            return Err(LoomError::Conflict(format!(
                "edge {} cannot be imported into tree {}",
                edge.id, tree_id
            )));
        }
        validate_edge_shape(edge)?;
        let outside = std::iter::once(edge.target_id)
            .chain(edge.source_ids())
            .find(|n| !node_ids.contains(n));
        if let Some(outside) = outside {
            return Err(LoomError::Validation(format!(
                "edge {} reaches node {} outside the export of tree {}",
                edge.id, outside, tree_id
            )));
        }
        if edge.is_continuation() && edge.target_id == snapshot.tree.root_node_id {
            return Err(LoomError::Validation(format!(
                "edge {} targets the root of tree {}",
                edge.id, tree_id
            )));
        }
    }

    for row in &snapshot.evidence {
        if !node_ids.contains(&row.node_id) {
            return Err(LoomError::Validation(format!(
                "evidence for node {} outside the export of tree {}",
                row.node_id, tree_id
            )));
        }
    }

    check_acyclic(&node_ids, &snapshot.edges)
}

/// Kahn's algorithm over the continuation edges of a snapshot.
fn check_acyclic(nodes: &BTreeSet<NodeId>, edges: &[Edge]) -> Result<(), LoomError> {
    let mut indegree: BTreeMap<NodeId, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut children: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();
    for edge in edges.iter().filter(|e| e.is_continuation()) {
        for source in edge.source_ids() {
            children.entry(source).or_default().push(edge.target_id);
            if let Some(count) = indegree.get_mut(&edge.target_id) {
                *count += 1;
            }
        }
    }

    let mut ready: VecDeque<NodeId> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0usize;
    while let Some(node) = ready.pop_front() {
        visited += 1;
        for child in children.get(&node).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(*child);
                }
            }
        }
    }

    if visited != nodes.len() {
        return Err(LoomError::Validation(
            "export contains a continuation cycle".into(),
        ));
    }
    Ok(())
}

/// Write an exported tree into `store`.
///
/// Fails with `Conflict` if the tree, or any of its node or edge ids, already
/// exists. The snapshot must be self-contained, so an import never attaches
/// anything to records outside it. Every node hash is verified after the
/// records are staged; any failure is returned as a strict error so the
/// surrounding transaction discards the import.
pub fn import_tree(store: &mut dyn LoomWrite, data: &[u8]) -> Result<LoomTree, LoomError> {
    let snapshot = decode_snapshot(data)?;
    let tree_id = snapshot.tree.id;
    if store.tree(tree_id)?.is_some() {
        return Err(LoomError::Conflict(format!("tree {} already exists", tree_id)));
    }
    check_snapshot(&*store, &snapshot)?;

    store.put_tree(&snapshot.tree)?;
    for node in &snapshot.nodes {
        store.put_node(node)?;
    }
    for edge in &snapshot.edges {
        store.put_edge(edge)?;
    }
    for row in &snapshot.evidence {
        store.put_evidence(row)?;
    }

    find_root(&*store, tree_id)?;
    let report = audit_tree(&*store, tree_id)?;
    if let Some(failure) = report.failures.into_iter().next() {
        return Err(failure.into_result().err().unwrap_or_else(|| {
            LoomError::InvalidState(format!("import of tree {} failed verification", tree_id))
        }));
    }

    tracing::info!(
        tree = %tree_id,
        nodes = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        "tree imported"
    );
    Ok(snapshot.tree)
}

// =============================================================================
// CRYPTOGRAPHIC DIGEST
// =============================================================================

/// BLAKE3 hex digest of a tree's canonical export.
#[cfg(feature = "crypto-hash")]
pub fn tree_digest<R: LoomRead + ?Sized>(store: &R, tree_id: TreeId) -> Result<String, LoomError> {
    let data = export_tree(store, tree_id)?;
    Ok(blake3::hash(&data).to_hex().to_string())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::generation::{Completion, record_completion};
    use crate::graph::{LoomGraph, LoomStore};
    use crate::hypergraph::{NewTree, NodeAuthor, append_node, create_tree};
    use crate::provenance::RawResponse;
    use crate::{AgentId, ContainerId, Content, InteractionMode};
    use ulid::Ulid;

    const HUMAN: AgentId = AgentId(Ulid(0xA));
    const MODEL: AgentId = AgentId(Ulid(0xB));

    fn populated() -> (LoomGraph, TreeId) {
        let mut graph = LoomGraph::new();
        let tree_id = graph
            .transact(|w| {
                let (tree, root) = create_tree(
                    w,
                    NewTree {
                        container_id: ContainerId(Ulid(1)),
                        mode: InteractionMode::Dialogue,
                        system_context: None,
                        title: Some("export".into()),
                        description: None,
                        root_content: Content::text("hello"),
                        root_author: HUMAN,
                    },
                )?;
                let reply = record_completion(
                    w,
                    tree.id,
                    root.node.id,
                    MODEL,
                    Completion {
                        content: Content::text("hi there"),
                        raw_response: RawResponse::Streamed {
                            assembled_text: "hi there".into(),
                        },
                        provider: None,
                        provider_request_id: None,
                        model_identifier: None,
                        token_usage: None,
                    },
                    true,
                )?;
                append_node(
                    w,
                    tree.id,
                    Content::text("thanks"),
                    NodeAuthor::Human(HUMAN),
                    &[reply.created.node.id],
                )?;
                Ok(tree.id)
            })
            .unwrap();
        (graph, tree_id)
    }

    #[test]
    fn export_import_roundtrip() {
        let (graph, tree_id) = populated();
        let bytes = export_tree(&graph, tree_id).unwrap();

        let mut target = LoomGraph::new();
        target.transact(|w| import_tree(w, &bytes)).unwrap();
        assert_eq!(target.node_count(), 3);
        assert_eq!(target.edge_count(), 2);
        assert!(audit_tree(&target, tree_id).unwrap().is_clean());
        assert_eq!(export_tree(&target, tree_id).unwrap(), bytes);
    }

    #[test]
    fn export_is_deterministic() {
        let (graph, tree_id) = populated();
        assert_eq!(
            export_tree(&graph, tree_id).unwrap(),
            export_tree(&graph, tree_id).unwrap()
        );
    }

    #[test]
    fn import_rejects_existing_tree() {
        let (mut graph, tree_id) = populated();
        let bytes = export_tree(&graph, tree_id).unwrap();
        let result = graph.transact(|w| import_tree(w, &bytes));
        assert!(matches!(result, Err(LoomError::Conflict(_))));
    }

    #[test]
    fn import_rejects_tampered_content() {
        let (graph, tree_id) = populated();
        let mut snapshot = TreeSnapshot::capture(&graph, tree_id).unwrap();
        snapshot.nodes[2].content = Content::text("thank you");
        let bytes = encode_snapshot(&snapshot).unwrap();

        let mut target = LoomGraph::new();
        let result = target.transact(|w| import_tree(w, &bytes));
        assert!(matches!(result, Err(LoomError::HashMismatch { .. })));
        assert_eq!(target.node_count(), 0);
    }

    /// A store already holding one tree, plus a snapshot of a second one.
    fn two_trees() -> (LoomGraph, TreeSnapshot, TreeSnapshot) {
        let (first, first_id) = populated();
        let (second, second_id) = populated();
        let mut target = LoomGraph::new();
        let bytes = export_tree(&first, first_id).unwrap();
        target.transact(|w| import_tree(w, &bytes)).unwrap();
        (
            target,
            TreeSnapshot::capture(&first, first_id).unwrap(),
            TreeSnapshot::capture(&second, second_id).unwrap(),
        )
    }

    fn child_of(snapshot: &TreeSnapshot, parent: NodeId) -> NodeId {
        snapshot
            .edges
            .iter()
            .find(|e| e.has_source(parent))
            .map(|e| e.target_id)
            .unwrap()
    }

    fn import_error(target: &mut LoomGraph, snapshot: &TreeSnapshot) -> LoomError {
        let bytes = encode_snapshot(snapshot).unwrap();
        target.transact(|w| import_tree(w, &bytes)).unwrap_err()
    }

    #[test]
    fn import_rejects_edge_into_another_tree() {
        let (mut target, first, mut second) = two_trees();
        let reply = child_of(&first, first.tree.root_node_id);
        let mut stray = second.edges[0].clone();
        stray.id = EdgeId(Ulid::new());
        stray.sources = vec![crate::EdgeSource {
            node_id: second.tree.root_node_id,
            role: crate::SourceRole::Primary,
        }];
        stray.target_id = reply;
        second.edges.push(stray);

        let err = import_error(&mut target, &second);
        assert!(matches!(err, LoomError::Validation(_)), "{err}");
        assert!(target.tree(second.tree.id).unwrap().is_none());
        assert_eq!(target.node_count(), 3);
        assert_eq!(
            crate::hypergraph::find_parent_edges(&target, reply)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn import_rejects_existing_edge_id() {
        let (mut target, first, mut second) = two_trees();
        second.edges[0].id = first.edges[0].id;

        let err = import_error(&mut target, &second);
        assert!(matches!(err, LoomError::Conflict(_)), "{err}");
        assert_eq!(target.edge_count(), 2);
        assert_eq!(target.edge(first.edges[0].id).unwrap(), Some(first.edges[0].clone()));
    }

    #[test]
    fn import_rejects_evidence_for_outside_node() {
        let (mut target, first, mut second) = two_trees();
        let reply = child_of(&first, first.tree.root_node_id);
        second.evidence[0].node_id = reply;

        let err = import_error(&mut target, &second);
        assert!(matches!(err, LoomError::Validation(_)), "{err}");
        assert_eq!(target.evidence(reply).unwrap(), first.evidence.first().cloned());
        assert_eq!(target.node_count(), 3);
    }

    #[test]
    fn import_rejects_malformed_edges() {
        let (graph, tree_id) = populated();
        let snapshot = TreeSnapshot::capture(&graph, tree_id).unwrap();
        let root = snapshot.tree.root_node_id;
        let reply = child_of(&snapshot, root);
        let last = child_of(&snapshot, reply);

        let mut no_sources = snapshot.clone();
        no_sources.edges[0].sources.clear();

        let mut self_loop = snapshot.clone();
        let target_id = self_loop.edges[0].target_id;
        self_loop.edges[0].sources.push(crate::EdgeSource {
            node_id: target_id,
            role: crate::SourceRole::Context,
        });

        let mut into_root = snapshot.clone();
        let mut edge = into_root.edges[0].clone();
        edge.id = EdgeId(Ulid::new());
        edge.sources = vec![crate::EdgeSource {
            node_id: last,
            role: crate::SourceRole::Primary,
        }];
        edge.target_id = root;
        into_root.edges.push(edge.clone());

        let mut cycle = snapshot.clone();
        edge.target_id = reply;
        cycle.edges.push(edge);

        for broken in [no_sources, self_loop, into_root, cycle] {
            let mut target = LoomGraph::new();
            let err = import_error(&mut target, &broken);
            assert!(matches!(err, LoomError::Validation(_)), "{err}");
            assert_eq!(target.node_count(), 0);
            assert_eq!(target.edge_count(), 0);
        }
    }

    #[test]
    fn corrupted_import_empty_data() {
        assert!(matches!(
            decode_snapshot(&[]),
            Err(LoomError::SerializationError(_))
        ));
    }

    #[test]
    fn corrupted_import_header_length_exceeds_data() {
        let data = [0xe8, 0x03, 0x00, 0x00, 0x00, 0x00];
        assert!(decode_snapshot(&data).is_err());
    }

    #[test]
    fn corrupted_import_invalid_magic_bytes() {
        let (graph, tree_id) = populated();
        let mut bytes = export_tree(&graph, tree_id).unwrap();
        bytes[4] = 0xFF;
        let err = decode_snapshot(&bytes).unwrap_err();
        assert!(err.to_string().contains("Invalid file format"));
    }

    #[test]
    fn corrupted_import_checksum_mismatch() {
        let (graph, tree_id) = populated();
        let mut bytes = export_tree(&graph, tree_id).unwrap();
        if let Some(last) = bytes.last_mut() {
            *last ^= 0xFF;
        }
        assert!(matches!(
            decode_snapshot(&bytes),
            Err(LoomError::SerializationError(_))
        ));
    }

    #[cfg(feature = "crypto-hash")]
    #[test]
    fn digest_tracks_export_bytes() {
        let (graph, tree_id) = populated();
        let digest = tree_digest(&graph, tree_id).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, tree_digest(&graph, tree_id).unwrap());
    }
}
