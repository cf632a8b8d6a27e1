//! # Provenance Engine
//!
//! Content hash chain computation and verification.
//!
//! A node hash is the lowercase hex SHA-256 of
//!
//! ```text
//! canonical(content) SEP sorted(parent_hashes).join("|") SEP iso(created_at) SEP X
//! ```
//!
//! where `SEP` is U+001F and `X` is the author id for human nodes and the raw
//! response hash for model nodes. The raw response hash is taken over the bytes
//! the provider returned, before any parsing.
//!
//! Verification never fails on bad data: a mismatch or missing evidence is
//! reported in a [`VerificationResult`]. Only storage errors and an unknown
//! node id surface as `Err`.

use crate::canonical::canonical_json;
use crate::graph::LoomRead;
use crate::primitives::{HASH_FIELD_SEPARATOR, MAX_ANCESTRY_DEPTH, PARENT_HASH_JOINER};
use crate::{AgentId, AuthorKind, Content, LoomError, Node, NodeId, Timestamp, TreeId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, VecDeque};

// =============================================================================
// HASHING
// =============================================================================

/// Lowercase hex SHA-256 of a byte string.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The bytes a provider returned for one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawResponse {
    /// A complete HTTP response: headers in received order plus body.
    Http {
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// A streamed response, reassembled into text.
    Streamed { assembled_text: String },
}

impl RawResponse {
    /// Bytes that are hashed and kept as evidence.
    ///
    /// HTTP responses render as `name: value\r\n` per header, a blank
    /// `\r\n`, then the body.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Http { headers, body } => {
                let mut bytes = Vec::with_capacity(body.len().saturating_add(256));
                for (name, value) in headers {
                    bytes.extend_from_slice(name.as_bytes());
                    bytes.extend_from_slice(b": ");
                    bytes.extend_from_slice(value.as_bytes());
                    bytes.extend_from_slice(b"\r\n");
                }
                bytes.extend_from_slice(b"\r\n");
                bytes.extend_from_slice(body);
                bytes
            }
            Self::Streamed { assembled_text } => assembled_text.as_bytes().to_vec(),
        }
    }

    #[must_use]
    pub fn hash(&self) -> String {
        hash_bytes(&self.to_bytes())
    }

    #[must_use]
    pub const fn is_streamed(&self) -> bool {
        matches!(self, Self::Streamed { .. })
    }
}

/// The fourth hash component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAuthor<'a> {
    Human(AgentId),
    Model { raw_response_hash: &'a str },
}

/// Compute a node hash.
///
/// Parent order does not matter: hashes are sorted before joining.
pub fn compute_node_hash(
    content: &Content,
    parent_hashes: &[String],
    created_at: Timestamp,
    author: HashAuthor<'_>,
) -> Result<String, LoomError> {
    let canonical = canonical_json(content)?;
    let mut parents: Vec<&str> = parent_hashes.iter().map(String::as_str).collect();
    parents.sort_unstable();
    let joined = parents.join(PARENT_HASH_JOINER);
    let iso = created_at.to_iso()?;
    let tail = match author {
        HashAuthor::Human(agent) => agent.to_string(),
        HashAuthor::Model { raw_response_hash } => raw_response_hash.to_string(),
    };

    let mut input = String::with_capacity(
        canonical
            .len()
            .saturating_add(joined.len())
            .saturating_add(iso.len())
            .saturating_add(tail.len())
            .saturating_add(3),
    );
    input.push_str(&canonical);
    input.push(HASH_FIELD_SEPARATOR);
    input.push_str(&joined);
    input.push(HASH_FIELD_SEPARATOR);
    input.push_str(&iso);
    input.push(HASH_FIELD_SEPARATOR);
    input.push_str(&tail);

    Ok(hash_bytes(input.as_bytes()))
}

/// Hash variant for human-authored nodes.
pub fn compute_human_hash(
    content: &Content,
    parent_hashes: &[String],
    created_at: Timestamp,
    author_id: AgentId,
) -> Result<String, LoomError> {
    compute_node_hash(
        content,
        parent_hashes,
        created_at,
        HashAuthor::Human(author_id),
    )
}

/// Hash variant for model-authored nodes.
pub fn compute_model_hash(
    content: &Content,
    parent_hashes: &[String],
    created_at: Timestamp,
    raw_response_hash: &str,
) -> Result<String, LoomError> {
    compute_node_hash(
        content,
        parent_hashes,
        created_at,
        HashAuthor::Model { raw_response_hash },
    )
}

// =============================================================================
// VERIFICATION
// =============================================================================

/// Why a node failed verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationFailure {
    /// The recomputed hash differs from the stored one.
    HashMismatch,
    /// Inputs needed for recomputation are missing.
    Unverifiable { reason: String },
}

/// Outcome of verifying one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub node_id: NodeId,
    pub valid: bool,
    pub stored_hash: String,
    pub recomputed_hash: Option<String>,
    pub failure: Option<VerificationFailure>,
}

impl VerificationResult {
    fn unverifiable(node: &Node, reason: impl Into<String>) -> Self {
        Self {
            node_id: node.id,
            valid: false,
            stored_hash: node.content_hash.clone(),
            recomputed_hash: None,
            failure: Some(VerificationFailure::Unverifiable {
                reason: reason.into(),
            }),
        }
    }

    /// Convert to the strict form: `Ok` when valid, the matching error otherwise.
    pub fn into_result(self) -> Result<(), LoomError> {
        match self.failure {
            None => Ok(()),
            Some(VerificationFailure::HashMismatch) => Err(LoomError::HashMismatch {
                node: self.node_id,
                stored: self.stored_hash,
                recomputed: self.recomputed_hash.unwrap_or_default(),
            }),
            Some(VerificationFailure::Unverifiable { reason }) => Err(LoomError::Unverifiable {
                node: self.node_id,
                reason,
            }),
        }
    }
}

/// Recompute a node's hash from its stored inputs and compare.
pub fn verify_node<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<VerificationResult, LoomError> {
    let node = store.require_node(node_id)?;
    verify_loaded(store, &node)
}

fn verify_loaded<R: LoomRead + ?Sized>(
    store: &R,
    node: &Node,
) -> Result<VerificationResult, LoomError> {
    let mut parent_hashes = Vec::with_capacity(node.parent_ids.len());
    for parent_id in &node.parent_ids {
        match store.node(*parent_id)? {
            Some(parent) => parent_hashes.push(parent.content_hash),
            None => {
                return Ok(VerificationResult::unverifiable(
                    node,
                    format!("parent {} is missing", parent_id),
                ));
            }
        }
    }

    let recomputed = match node.author_kind {
        AuthorKind::Human => compute_human_hash(
            &node.content,
            &parent_hashes,
            node.created_at,
            node.author_id,
        ),
        AuthorKind::Model => {
            let Some(evidence) = store.evidence(node.id)? else {
                return Ok(VerificationResult::unverifiable(
                    node,
                    "raw response evidence is missing",
                ));
            };
            let raw_hash = match &evidence.raw_bytes {
                Some(bytes) => hash_bytes(bytes),
                None => evidence.raw_response_hash.clone(),
            };
            compute_model_hash(&node.content, &parent_hashes, node.created_at, &raw_hash)
        }
    };

    let recomputed = match recomputed {
        Ok(hash) => hash,
        Err(e) => return Ok(VerificationResult::unverifiable(node, e.to_string())),
    };

    let valid = recomputed == node.content_hash;
    Ok(VerificationResult {
        node_id: node.id,
        valid,
        stored_hash: node.content_hash.clone(),
        recomputed_hash: Some(recomputed),
        failure: (!valid).then_some(VerificationFailure::HashMismatch),
    })
}

/// Verify a node and every ancestor reachable through its chained parents.
///
/// Results start with `node_id` and follow breadth-first order.
pub fn verify_chain<R: LoomRead + ?Sized>(
    store: &R,
    node_id: NodeId,
) -> Result<Vec<VerificationResult>, LoomError> {
    let mut results = Vec::new();
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([node_id]);
    seen.insert(node_id);

    while let Some(current) = queue.pop_front() {
        if results.len() >= MAX_ANCESTRY_DEPTH {
            return Err(LoomError::InvalidState(format!(
                "hash chain of {} exceeds {} nodes",
                node_id, MAX_ANCESTRY_DEPTH
            )));
        }
        let Some(node) = store.node(current)? else {
            // The child's result already reports the missing parent.
            continue;
        };
        results.push(verify_loaded(store, &node)?);
        for parent in &node.parent_ids {
            if seen.insert(*parent) {
                queue.push_back(*parent);
            }
        }
    }

    if results.is_empty() {
        return Err(LoomError::not_found("node", node_id));
    }
    Ok(results)
}

/// Result of sweeping every node of a tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub tree_id: TreeId,
    pub checked: usize,
    pub valid: usize,
    pub failures: Vec<VerificationResult>,
}

impl AuditReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Verify every node of a tree and collect all failures in one pass.
pub fn audit_tree<R: LoomRead + ?Sized>(store: &R, tree: TreeId) -> Result<AuditReport, LoomError> {
    store.require_tree(tree)?;
    let nodes = store.tree_nodes(tree)?;
    let mut report = AuditReport {
        tree_id: tree,
        checked: 0,
        valid: 0,
        failures: Vec::new(),
    };
    for node in &nodes {
        let result = verify_loaded(store, node)?;
        report.checked = report.checked.saturating_add(1);
        if result.valid {
            report.valid = report.valid.saturating_add(1);
        } else {
            report.failures.push(result);
        }
    }
    tracing::debug!(
        tree = %tree,
        checked = report.checked,
        failures = report.failures.len(),
        "tree audit complete"
    );
    Ok(report)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{LoomGraph, LoomWrite};
    use crate::{NodeMetadata, RawResponseEvidence};
    use ulid::Ulid;

    const AGENT: AgentId = AgentId(Ulid(0x01));

    fn human_node(n: u128, parents: &[&Node], text: &str) -> Node {
        let parent_hashes: Vec<String> = parents.iter().map(|p| p.content_hash.clone()).collect();
        let content = Content::text(text);
        let created_at = Timestamp(1_700_000_000_000 + n as i64);
        let hash =
            compute_human_hash(&content, &parent_hashes, created_at, AGENT).expect("hash");
        Node {
            id: NodeId(Ulid(n)),
            short_id: format!("n{:05}", n),
            tree_id: TreeId(Ulid(99)),
            content,
            author_id: AGENT,
            author_kind: AuthorKind::Human,
            content_hash: hash,
            created_at,
            parent_ids: parents.iter().map(|p| p.id).collect(),
            metadata: NodeMetadata::default(),
            edited_from: None,
            version_group: None,
        }
    }

    #[test]
    fn hash_is_lowercase_hex() {
        let hash = compute_human_hash(&Content::text("x"), &[], Timestamp(0), AGENT).expect("hash");
        assert_eq!(hash.len(), crate::primitives::CONTENT_HASH_HEX_LEN);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn hash_input_layout_is_fixed() {
        let content = Content::text("hello");
        let created_at = Timestamp(1_700_000_000_123);
        let parents = vec!["bb".to_string(), "aa".to_string()];
        let expected = hash_bytes(
            format!(
                "{}\u{1f}aa|bb\u{1f}2023-11-14T22:13:20.123Z\u{1f}{}",
                r#"{"text":"hello","type":"text"}"#, AGENT
            )
            .as_bytes(),
        );
        assert_eq!(
            compute_human_hash(&content, &parents, created_at, AGENT).expect("hash"),
            expected
        );
    }

    #[test]
    fn parent_order_does_not_change_hash() {
        let content = Content::text("merge");
        let a = vec!["1".repeat(64), "2".repeat(64), "3".repeat(64)];
        let b = vec!["3".repeat(64), "1".repeat(64), "2".repeat(64)];
        assert_eq!(
            compute_human_hash(&content, &a, Timestamp(5), AGENT).expect("hash"),
            compute_human_hash(&content, &b, Timestamp(5), AGENT).expect("hash")
        );
    }

    #[test]
    fn model_and_human_variants_differ() {
        let content = Content::text("same");
        let human = compute_human_hash(&content, &[], Timestamp(1), AGENT).expect("hash");
        let model =
            compute_model_hash(&content, &[], Timestamp(1), &hash_bytes(b"resp")).expect("hash");
        assert_ne!(human, model);
    }

    #[test]
    fn http_raw_bytes_layout() {
        let raw = RawResponse::Http {
            headers: vec![("content-type".into(), "application/json".into())],
            body: b"{}".to_vec(),
        };
        assert_eq!(raw.to_bytes(), b"content-type: application/json\r\n\r\n{}".to_vec());
        assert!(!raw.is_streamed());
    }

    #[test]
    fn verify_roundtrip_and_tamper() {
        let mut graph = LoomGraph::new();
        let root = human_node(1, &[], "root");
        let child = human_node(2, &[&root], "child");
        graph.put_node(&root).expect("put");
        graph.put_node(&child).expect("put");

        let result = verify_node(&graph, child.id).expect("verify");
        assert!(result.valid);
        assert_eq!(result.failure, None);

        let mut tampered = child.clone();
        tampered.content = Content::text("child!");
        graph.put_node(&tampered).expect("put");
        let result = verify_node(&graph, child.id).expect("verify");
        assert!(!result.valid);
        assert_eq!(result.failure, Some(VerificationFailure::HashMismatch));
        assert!(matches!(
            result.into_result(),
            Err(LoomError::HashMismatch { .. })
        ));
    }

    #[test]
    fn model_node_without_evidence_is_unverifiable() {
        let mut graph = LoomGraph::new();
        let raw_hash = hash_bytes(b"raw");
        let content = Content::text("answer");
        let mut node = human_node(1, &[], "ignored");
        node.author_kind = AuthorKind::Model;
        node.content = content.clone();
        node.content_hash =
            compute_model_hash(&content, &[], node.created_at, &raw_hash).expect("hash");
        graph.put_node(&node).expect("put");

        let result = verify_node(&graph, node.id).expect("verify");
        assert!(matches!(
            result.failure,
            Some(VerificationFailure::Unverifiable { .. })
        ));

        graph
            .put_evidence(&RawResponseEvidence {
                node_id: node.id,
                raw_response_hash: raw_hash,
                raw_bytes: Some(b"raw".to_vec()),
                streamed: true,
                provider: None,
                provider_request_id: None,
                model_identifier: None,
                token_usage: None,
                captured_at: Timestamp(0),
            })
            .expect("evidence");
        assert!(verify_node(&graph, node.id).expect("verify").valid);
    }

    #[test]
    fn tampered_raw_bytes_are_detected() {
        let mut graph = LoomGraph::new();
        let content = Content::text("answer");
        let mut node = human_node(1, &[], "ignored");
        node.author_kind = AuthorKind::Model;
        node.content = content.clone();
        node.content_hash = compute_model_hash(&content, &[], node.created_at, &hash_bytes(b"raw"))
            .expect("hash");
        graph.put_node(&node).expect("put");
        graph
            .put_evidence(&RawResponseEvidence {
                node_id: node.id,
                raw_response_hash: hash_bytes(b"raw"),
                raw_bytes: Some(b"RAW".to_vec()),
                streamed: false,
                provider: None,
                provider_request_id: None,
                model_identifier: None,
                token_usage: None,
                captured_at: Timestamp(0),
            })
            .expect("evidence");
        let result = verify_node(&graph, node.id).expect("verify");
        assert_eq!(result.failure, Some(VerificationFailure::HashMismatch));
    }

    #[test]
    fn missing_parent_is_unverifiable() {
        let mut graph = LoomGraph::new();
        let root = human_node(1, &[], "root");
        let child = human_node(2, &[&root], "child");
        graph.put_node(&child).expect("put");
        let result = verify_node(&graph, child.id).expect("verify");
        assert!(matches!(
            result.failure,
            Some(VerificationFailure::Unverifiable { .. })
        ));
    }

    #[test]
    fn chain_walks_to_root() {
        let mut graph = LoomGraph::new();
        let root = human_node(1, &[], "root");
        let a = human_node(2, &[&root], "a");
        let b = human_node(3, &[&root], "b");
        let merge = human_node(4, &[&a, &b], "merge");
        for node in [&root, &a, &b, &merge] {
            graph.put_node(node).expect("put");
        }
        let results = verify_chain(&graph, merge.id).expect("chain");
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].node_id, merge.id);
        assert!(results.iter().all(|r| r.valid));
    }
}
