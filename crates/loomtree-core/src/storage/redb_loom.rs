//! # redb-backed Loom Storage
//!
//! A disk-backed Loom store using the redb embedded database:
//! - ACID transactions (one redb write transaction per `transact` call)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (every `read` call sees one consistent snapshot)
//!
//! Records are postcard-encoded under their 128-bit ULID. Secondary indexes
//! are composite-key tables `(owner, member) -> ()` read with range scans,
//! and a path's cache is one `(path, position) -> node` row per position, so
//! every write touches a bounded number of keys.

use crate::graph::{LoomRead, LoomStore, LoomWrite};
use crate::{
    AgentId, Edge, EdgeId, InteractionMode, LoomError, LoomTree, Node, NodeId, Path, PathId,
    PathSelection, PathState, PathStateKey, Preferences, RawResponseEvidence, TreeId,
};
use redb::{
    Database, Key, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, Value,
    WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use ulid::Ulid;

type RecordTable = TableDefinition<'static, u128, &'static [u8]>;
type IndexTable = TableDefinition<'static, (u128, u128), ()>;

/// Trees: tree id -> postcard LoomTree
const TREES: RecordTable = TableDefinition::new("trees");

/// Nodes: node id -> postcard Node
const NODES: RecordTable = TableDefinition::new("nodes");

/// Edges: edge id -> postcard Edge
const EDGES: RecordTable = TableDefinition::new("edges");

/// Raw response evidence: node id -> postcard RawResponseEvidence
const EVIDENCE: RecordTable = TableDefinition::new("evidence");

/// Paths: path id -> postcard Path
const PATHS: RecordTable = TableDefinition::new("paths");

/// Path caches: (path, position) -> node
const PATH_NODES: TableDefinition<(u128, u64), u128> = TableDefinition::new("path_nodes");

/// Selections: (path, target) -> postcard PathSelection
const SELECTIONS: TableDefinition<(u128, u128), &[u8]> = TableDefinition::new("selections");

/// Cursors: (path, agent, mode code) -> postcard PathState
const PATH_STATES: TableDefinition<(u128, u128, u8), &[u8]> = TableDefinition::new("path_states");

/// Singleton records (preferences).
const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// (tree, node)
const TREE_NODES: IndexTable = TableDefinition::new("tree_nodes");

/// (tree, edge)
const TREE_EDGES: IndexTable = TableDefinition::new("tree_edges");

/// (tree, path)
const TREE_PATHS: IndexTable = TableDefinition::new("tree_paths");

/// (target node, edge)
const EDGES_BY_TARGET: IndexTable = TableDefinition::new("edges_by_target");

/// (source node, edge)
const EDGES_BY_SOURCE: IndexTable = TableDefinition::new("edges_by_source");

/// (version group, node)
const VERSION_GROUPS: IndexTable = TableDefinition::new("version_groups");

/// (original node, edit)
const EDITED_FROM: IndexTable = TableDefinition::new("edited_from");

/// (tree, author, node)
const AUTHORED: TableDefinition<(u128, u128, u128), ()> = TableDefinition::new("authored");

/// "tree/short id" -> node
const SHORT_IDS: TableDefinition<&str, u128> = TableDefinition::new("short_ids");

/// Counters: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const REVISION_KEY: &str = "revision";
const PREFERENCES_KEY: &str = "preferences";

const INDEXES: [IndexTable; 7] = [
    TREE_NODES,
    TREE_EDGES,
    TREE_PATHS,
    EDGES_BY_TARGET,
    EDGES_BY_SOURCE,
    VERSION_GROUPS,
    EDITED_FROM,
];

fn io_err(e: impl Display) -> LoomError {
    LoomError::IoError(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LoomError> {
    postcard::to_allocvec(value).map_err(|e| LoomError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LoomError> {
    postcard::from_bytes(bytes).map_err(|e| LoomError::SerializationError(e.to_string()))
}

fn short_key(tree: TreeId, short_id: &str) -> String {
    format!("{}/{}", tree, short_id)
}

const fn mode_code(mode: Option<InteractionMode>) -> u8 {
    match mode {
        None => 0,
        Some(InteractionMode::Dialogue) => 1,
        Some(InteractionMode::Buffer) => 2,
    }
}

fn cursor_key(key: &PathStateKey) -> (u128, u128, u8) {
    (key.path_id.raw(), key.agent_id.raw(), mode_code(key.mode))
}

fn position_key(position: usize) -> Result<u64, LoomError> {
    u64::try_from(position)
        .map_err(|_| LoomError::InvalidState(format!("path position {} out of range", position)))
}

fn position_of(key: u64) -> Result<usize, LoomError> {
    usize::try_from(key)
        .map_err(|_| LoomError::InvalidState(format!("stored path position {} out of range", key)))
}

// =============================================================================
// TABLE ACCESS
// =============================================================================

/// Uniform table access over read and write transactions.
trait TableAccess {
    fn table<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<'static, K, V>,
    ) -> Result<impl ReadableTable<K, V>, LoomError>;
}

impl TableAccess for ReadTransaction {
    fn table<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<'static, K, V>,
    ) -> Result<impl ReadableTable<K, V>, LoomError> {
        self.open_table(definition).map_err(io_err)
    }
}

impl TableAccess for WriteTransaction {
    fn table<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<'static, K, V>,
    ) -> Result<impl ReadableTable<K, V>, LoomError> {
        self.open_table(definition).map_err(io_err)
    }
}

fn counter_from<T: ReadableTable<&'static str, u64>>(
    table: &T,
    key: &str,
) -> Result<u64, LoomError> {
    Ok(table.get(key).map_err(io_err)?.map(|v| v.value()).unwrap_or(0))
}

// =============================================================================
// TRANSACTION VIEW
// =============================================================================

/// A `LoomRead` (and, over a write transaction, `LoomWrite`) view of one
/// redb transaction.
struct RedbView<'t, A> {
    txn: &'t A,
}

impl<A: TableAccess> RedbView<'_, A> {
    fn get<T: DeserializeOwned>(&self, table: RecordTable, id: u128) -> Result<Option<T>, LoomError> {
        let table = self.txn.table(table)?;
        let record = match table.get(id).map_err(io_err)? {
            Some(bytes) => Some(decode(bytes.value())?),
            None => None,
        };
        Ok(record)
    }

    /// Members of `owner` in one index, in id order.
    fn members(&self, index: IndexTable, owner: u128) -> Result<Vec<u128>, LoomError> {
        let table = self.txn.table(index)?;
        let mut out = Vec::new();
        for entry in table
            .range((owner, 0u128)..=(owner, u128::MAX))
            .map_err(io_err)?
        {
            let (key, _) = entry.map_err(io_err)?;
            out.push(key.value().1);
        }
        Ok(out)
    }

    fn load<T: DeserializeOwned>(
        &self,
        table: RecordTable,
        ids: Vec<u128>,
    ) -> Result<Vec<T>, LoomError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(table, id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn load_many<T: DeserializeOwned>(
        &self,
        table: RecordTable,
        index: IndexTable,
        owner: u128,
    ) -> Result<Vec<T>, LoomError> {
        self.load(table, self.members(index, owner)?)
    }
}

impl<A: TableAccess> LoomRead for RedbView<'_, A> {
    fn tree(&self, id: TreeId) -> Result<Option<LoomTree>, LoomError> {
        self.get(TREES, id.raw())
    }

    fn trees(&self) -> Result<Vec<LoomTree>, LoomError> {
        let table = self.txn.table(TREES)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(io_err)? {
            let (_, bytes) = entry.map_err(io_err)?;
            out.push(decode(bytes.value())?);
        }
        Ok(out)
    }

    fn node(&self, id: NodeId) -> Result<Option<Node>, LoomError> {
        self.get(NODES, id.raw())
    }

    fn tree_nodes(&self, tree: TreeId) -> Result<Vec<Node>, LoomError> {
        self.load_many(NODES, TREE_NODES, tree.raw())
    }

    fn edge(&self, id: EdgeId) -> Result<Option<Edge>, LoomError> {
        self.get(EDGES, id.raw())
    }

    fn tree_edges(&self, tree: TreeId) -> Result<Vec<Edge>, LoomError> {
        self.load_many(EDGES, TREE_EDGES, tree.raw())
    }

    fn edges_by_target(&self, node: NodeId) -> Result<Vec<Edge>, LoomError> {
        self.load_many(EDGES, EDGES_BY_TARGET, node.raw())
    }

    fn edges_by_source(&self, node: NodeId) -> Result<Vec<Edge>, LoomError> {
        self.load_many(EDGES, EDGES_BY_SOURCE, node.raw())
    }

    fn version_group_members(&self, group: NodeId) -> Result<Vec<Node>, LoomError> {
        self.load_many(NODES, VERSION_GROUPS, group.raw())
    }

    fn nodes_edited_from(&self, node: NodeId) -> Result<Vec<Node>, LoomError> {
        self.load_many(NODES, EDITED_FROM, node.raw())
    }

    fn nodes_by_author(&self, tree: TreeId, agent: AgentId) -> Result<Vec<Node>, LoomError> {
        let ids = {
            let table = self.txn.table(AUTHORED)?;
            let mut ids = Vec::new();
            let (t, a) = (tree.raw(), agent.raw());
            for entry in table.range((t, a, 0u128)..=(t, a, u128::MAX)).map_err(io_err)? {
                let (key, _) = entry.map_err(io_err)?;
                ids.push(key.value().2);
            }
            ids
        };
        self.load(NODES, ids)
    }

    fn evidence(&self, node: NodeId) -> Result<Option<RawResponseEvidence>, LoomError> {
        self.get(EVIDENCE, node.raw())
    }

    fn path(&self, id: PathId) -> Result<Option<Path>, LoomError> {
        self.get(PATHS, id.raw())
    }

    fn tree_paths(&self, tree: TreeId) -> Result<Vec<Path>, LoomError> {
        self.load_many(PATHS, TREE_PATHS, tree.raw())
    }

    fn path_nodes(&self, path: PathId) -> Result<Vec<NodeId>, LoomError> {
        let table = self.txn.table(PATH_NODES)?;
        let mut out = Vec::new();
        for entry in table
            .range((path.raw(), 0u64)..=(path.raw(), u64::MAX))
            .map_err(io_err)?
        {
            let (_, node) = entry.map_err(io_err)?;
            out.push(NodeId(Ulid(node.value())));
        }
        Ok(out)
    }

    fn path_len(&self, path: PathId) -> Result<usize, LoomError> {
        let table = self.txn.table(PATH_NODES)?;
        let mut range = table
            .range((path.raw(), 0u64)..=(path.raw(), u64::MAX))
            .map_err(io_err)?;
        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(io_err)?;
                Ok(position_of(key.value().1)?.saturating_add(1))
            }
            None => Ok(0),
        }
    }

    fn path_node_at(&self, path: PathId, position: usize) -> Result<Option<NodeId>, LoomError> {
        let table = self.txn.table(PATH_NODES)?;
        let node = table
            .get((path.raw(), position_key(position)?))
            .map_err(io_err)?
            .map(|v| NodeId(Ulid(v.value())));
        Ok(node)
    }

    fn selection(
        &self,
        path: PathId,
        target: NodeId,
    ) -> Result<Option<PathSelection>, LoomError> {
        let table = self.txn.table(SELECTIONS)?;
        let selection = match table.get((path.raw(), target.raw())).map_err(io_err)? {
            Some(bytes) => Some(decode(bytes.value())?),
            None => None,
        };
        Ok(selection)
    }

    fn path_selections(&self, path: PathId) -> Result<Vec<PathSelection>, LoomError> {
        let table = self.txn.table(SELECTIONS)?;
        let mut out = Vec::new();
        for entry in table
            .range((path.raw(), 0u128)..=(path.raw(), u128::MAX))
            .map_err(io_err)?
        {
            let (_, bytes) = entry.map_err(io_err)?;
            out.push(decode(bytes.value())?);
        }
        Ok(out)
    }

    fn path_state(&self, key: &PathStateKey) -> Result<Option<PathState>, LoomError> {
        let table = self.txn.table(PATH_STATES)?;
        let state = match table.get(cursor_key(key)).map_err(io_err)? {
            Some(bytes) => Some(decode(bytes.value())?),
            None => None,
        };
        Ok(state)
    }

    fn preferences(&self) -> Result<Option<Preferences>, LoomError> {
        let table = self.txn.table(SETTINGS)?;
        let preferences = match table.get(PREFERENCES_KEY).map_err(io_err)? {
            Some(bytes) => Some(decode(bytes.value())?),
            None => None,
        };
        Ok(preferences)
    }

    fn revision(&self) -> Result<u64, LoomError> {
        counter_from(&self.txn.table(METADATA)?, REVISION_KEY)
    }

    fn short_id_taken(&self, tree: TreeId, short_id: &str) -> Result<bool, LoomError> {
        let table = self.txn.table(SHORT_IDS)?;
        let taken = table
            .get(short_key(tree, short_id).as_str())
            .map_err(io_err)?
            .is_some();
        Ok(taken)
    }
}

impl RedbView<'_, WriteTransaction> {
    fn put<T: Serialize>(&self, table: RecordTable, id: u128, value: &T) -> Result<(), LoomError> {
        let bytes = encode(value)?;
        let mut t = self.txn.open_table(table).map_err(io_err)?;
        t.insert(id, bytes.as_slice()).map_err(io_err)?;
        Ok(())
    }

    fn remove(&self, table: RecordTable, id: u128) -> Result<bool, LoomError> {
        let mut t = self.txn.open_table(table).map_err(io_err)?;
        let removed = t.remove(id).map_err(io_err)?.is_some();
        Ok(removed)
    }

    fn link(&self, index: IndexTable, owner: u128, member: u128) -> Result<(), LoomError> {
        let mut t = self.txn.open_table(index).map_err(io_err)?;
        t.insert((owner, member), ()).map_err(io_err)?;
        Ok(())
    }

    fn unlink(&self, index: IndexTable, owner: u128, member: u128) -> Result<(), LoomError> {
        let mut t = self.txn.open_table(index).map_err(io_err)?;
        t.remove((owner, member)).map_err(io_err)?;
        Ok(())
    }

    fn index_node(&self, node: &Node) -> Result<(), LoomError> {
        let id = node.id.raw();
        self.link(TREE_NODES, node.tree_id.raw(), id)?;
        self.link(VERSION_GROUPS, node.version_group_id().raw(), id)?;
        if let Some(original) = node.edited_from {
            self.link(EDITED_FROM, original.raw(), id)?;
        }
        {
            let mut authored = self.txn.open_table(AUTHORED).map_err(io_err)?;
            authored
                .insert((node.tree_id.raw(), node.author_id.raw(), id), ())
                .map_err(io_err)?;
        }
        let mut short_ids = self.txn.open_table(SHORT_IDS).map_err(io_err)?;
        short_ids
            .insert(short_key(node.tree_id, &node.short_id).as_str(), id)
            .map_err(io_err)?;
        Ok(())
    }

    fn unindex_node(&self, node: &Node) -> Result<(), LoomError> {
        let id = node.id.raw();
        self.unlink(TREE_NODES, node.tree_id.raw(), id)?;
        self.unlink(VERSION_GROUPS, node.version_group_id().raw(), id)?;
        if let Some(original) = node.edited_from {
            self.unlink(EDITED_FROM, original.raw(), id)?;
        }
        {
            let mut authored = self.txn.open_table(AUTHORED).map_err(io_err)?;
            authored
                .remove((node.tree_id.raw(), node.author_id.raw(), id))
                .map_err(io_err)?;
        }
        let key = short_key(node.tree_id, &node.short_id);
        let mut short_ids = self.txn.open_table(SHORT_IDS).map_err(io_err)?;
        let owned_by_node = short_ids
            .get(key.as_str())
            .map_err(io_err)?
            .is_some_and(|owner| owner.value() == id);
        if owned_by_node {
            short_ids.remove(key.as_str()).map_err(io_err)?;
        }
        Ok(())
    }

    fn index_edge(&self, edge: &Edge) -> Result<(), LoomError> {
        let id = edge.id.raw();
        self.link(TREE_EDGES, edge.tree_id.raw(), id)?;
        self.link(EDGES_BY_TARGET, edge.target_id.raw(), id)?;
        for source in edge.source_ids() {
            self.link(EDGES_BY_SOURCE, source.raw(), id)?;
        }
        Ok(())
    }

    fn unindex_edge(&self, edge: &Edge) -> Result<(), LoomError> {
        let id = edge.id.raw();
        self.unlink(TREE_EDGES, edge.tree_id.raw(), id)?;
        self.unlink(EDGES_BY_TARGET, edge.target_id.raw(), id)?;
        for source in edge.source_ids() {
            self.unlink(EDGES_BY_SOURCE, source.raw(), id)?;
        }
        Ok(())
    }

    fn clear_path(&self, path: u128) -> Result<(), LoomError> {
        {
            let mut selections = self.txn.open_table(SELECTIONS).map_err(io_err)?;
            let mut keys = Vec::new();
            for entry in selections
                .range((path, 0u128)..=(path, u128::MAX))
                .map_err(io_err)?
            {
                keys.push(entry.map_err(io_err)?.0.value());
            }
            for key in keys {
                selections.remove(key).map_err(io_err)?;
            }
        }
        {
            let mut cursors = self.txn.open_table(PATH_STATES).map_err(io_err)?;
            let mut keys = Vec::new();
            for entry in cursors
                .range((path, 0u128, 0u8)..=(path, u128::MAX, u8::MAX))
                .map_err(io_err)?
            {
                keys.push(entry.map_err(io_err)?.0.value());
            }
            for key in keys {
                cursors.remove(key).map_err(io_err)?;
            }
        }
        self.drop_positions(path, 0)?;
        self.remove(PATHS, path)?;
        Ok(())
    }

    /// Remove the rows of `path` at `from` and after.
    fn drop_positions(&self, path: u128, from: u64) -> Result<(), LoomError> {
        let mut rows = self.txn.open_table(PATH_NODES).map_err(io_err)?;
        let mut keys = Vec::new();
        for entry in rows.range((path, from)..=(path, u64::MAX)).map_err(io_err)? {
            keys.push(entry.map_err(io_err)?.0.value());
        }
        for key in keys {
            rows.remove(key).map_err(io_err)?;
        }
        Ok(())
    }
}

impl LoomWrite for RedbView<'_, WriteTransaction> {
    fn put_tree(&mut self, tree: &LoomTree) -> Result<(), LoomError> {
        self.put(TREES, tree.id.raw(), tree)
    }

    fn put_node(&mut self, node: &Node) -> Result<(), LoomError> {
        if let Some(previous) = self.node(node.id)? {
            self.unindex_node(&previous)?;
        }
        self.put(NODES, node.id.raw(), node)?;
        self.index_node(node)
    }

    fn put_edge(&mut self, edge: &Edge) -> Result<(), LoomError> {
        if let Some(previous) = self.edge(edge.id)? {
            self.unindex_edge(&previous)?;
        }
        self.put(EDGES, edge.id.raw(), edge)?;
        self.index_edge(edge)
    }

    fn delete_edge(&mut self, id: EdgeId) -> Result<(), LoomError> {
        let edge = self.require_edge(id)?;
        self.unindex_edge(&edge)?;
        self.remove(EDGES, id.raw())?;
        Ok(())
    }

    fn put_evidence(&mut self, evidence: &RawResponseEvidence) -> Result<(), LoomError> {
        self.put(EVIDENCE, evidence.node_id.raw(), evidence)
    }

    fn put_path(&mut self, path: &Path) -> Result<(), LoomError> {
        if let Some(previous) = self.path(path.id)? {
            self.unlink(TREE_PATHS, previous.tree_id.raw(), path.id.raw())?;
        }
        self.put(PATHS, path.id.raw(), path)?;
        self.link(TREE_PATHS, path.tree_id.raw(), path.id.raw())
    }

    fn push_path_node(&mut self, path: PathId, node: NodeId) -> Result<usize, LoomError> {
        let position = self.path_len(path)?;
        let mut rows = self.txn.open_table(PATH_NODES).map_err(io_err)?;
        rows.insert((path.raw(), position_key(position)?), node.raw())
            .map_err(io_err)?;
        Ok(position)
    }

    fn truncate_path_nodes(&mut self, path: PathId, len: usize) -> Result<(), LoomError> {
        self.drop_positions(path.raw(), position_key(len)?)
    }

    fn put_selection(&mut self, selection: &PathSelection) -> Result<(), LoomError> {
        let bytes = encode(selection)?;
        let mut t = self.txn.open_table(SELECTIONS).map_err(io_err)?;
        t.insert(
            (selection.path_id.raw(), selection.target_node_id.raw()),
            bytes.as_slice(),
        )
        .map_err(io_err)?;
        Ok(())
    }

    fn delete_selection(&mut self, path: PathId, target: NodeId) -> Result<bool, LoomError> {
        let mut t = self.txn.open_table(SELECTIONS).map_err(io_err)?;
        let existed = t
            .remove((path.raw(), target.raw()))
            .map_err(io_err)?
            .is_some();
        Ok(existed)
    }

    fn put_path_state(&mut self, state: &PathState) -> Result<(), LoomError> {
        let bytes = encode(state)?;
        let mut t = self.txn.open_table(PATH_STATES).map_err(io_err)?;
        t.insert(cursor_key(&state.key()), bytes.as_slice())
            .map_err(io_err)?;
        Ok(())
    }

    fn put_preferences(&mut self, preferences: &Preferences) -> Result<(), LoomError> {
        let bytes = encode(preferences)?;
        let mut t = self.txn.open_table(SETTINGS).map_err(io_err)?;
        t.insert(PREFERENCES_KEY, bytes.as_slice()).map_err(io_err)?;
        Ok(())
    }

    fn delete_tree(&mut self, tree: TreeId) -> Result<(), LoomError> {
        let owner = tree.raw();
        if !self.remove(TREES, owner)? {
            return Err(LoomError::not_found("tree", tree));
        }

        for path in self.members(TREE_PATHS, owner)? {
            self.clear_path(path)?;
            self.unlink(TREE_PATHS, owner, path)?;
        }

        for edge_id in self.members(TREE_EDGES, owner)? {
            if let Some(edge) = self.get::<Edge>(EDGES, edge_id)? {
                self.unindex_edge(&edge)?;
            }
            self.remove(EDGES, edge_id)?;
        }

        for node_id in self.members(TREE_NODES, owner)? {
            if let Some(node) = self.get::<Node>(NODES, node_id)? {
                self.unindex_node(&node)?;
            }
            self.remove(EVIDENCE, node_id)?;
            self.remove(NODES, node_id)?;
        }
        Ok(())
    }
}

// =============================================================================
// DATABASE HANDLE
// =============================================================================

/// A disk-backed Loom store using redb.
pub struct RedbLoom {
    db: Database,
}

impl std::fmt::Debug for RedbLoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLoom").finish_non_exhaustive()
    }
}

impl RedbLoom {
    /// Open or create a Loom database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, LoomError> {
        let db = Database::create(path.as_ref()).map_err(io_err)?;

        // Initialize tables so read transactions can always open them
        {
            let write_txn = db.begin_write().map_err(io_err)?;
            for table in [TREES, NODES, EDGES, EVIDENCE, PATHS] {
                let _ = write_txn.open_table(table).map_err(io_err)?;
            }
            for index in INDEXES {
                let _ = write_txn.open_table(index).map_err(io_err)?;
            }
            let _ = write_txn.open_table(PATH_NODES).map_err(io_err)?;
            let _ = write_txn.open_table(SELECTIONS).map_err(io_err)?;
            let _ = write_txn.open_table(PATH_STATES).map_err(io_err)?;
            let _ = write_txn.open_table(SETTINGS).map_err(io_err)?;
            let _ = write_txn.open_table(AUTHORED).map_err(io_err)?;
            let _ = write_txn.open_table(SHORT_IDS).map_err(io_err)?;
            let _ = write_txn.open_table(METADATA).map_err(io_err)?;
            write_txn.commit().map_err(io_err)?;
        }

        tracing::debug!(path = %path.as_ref().display(), "opened redb loom store");
        Ok(Self { db })
    }
}

impl LoomStore for RedbLoom {
    fn read<T, F>(&self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&dyn LoomRead) -> Result<T, LoomError>,
    {
        let txn = self.db.begin_read().map_err(io_err)?;
        f(&RedbView { txn: &txn })
    }

    fn transact<T, F>(&mut self, f: F) -> Result<T, LoomError>
    where
        F: FnOnce(&mut dyn LoomWrite) -> Result<T, LoomError>,
    {
        let txn = self.db.begin_write().map_err(io_err)?;
        let outcome = f(&mut RedbView { txn: &txn });
        match outcome {
            Ok(value) => {
                {
                    let mut meta = txn.open_table(METADATA).map_err(io_err)?;
                    let next = counter_from(&meta, REVISION_KEY)?.saturating_add(1);
                    meta.insert(REVISION_KEY, next).map_err(io_err)?;
                }
                txn.commit().map_err(io_err)?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(io_err)?;
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
    use tempfile::tempdir;
    use ulid::Ulid;

    const TREE: TreeId = TreeId(Ulid(100));

    fn tree() -> LoomTree {
        LoomTree {
            id: TREE,
            container_id: ContainerId(Ulid(9)),
            root_node_id: NodeId(Ulid(1)),
            mode: InteractionMode::Dialogue,
            system_context: Some("be brief".into()),
            title: None,
            description: None,
            summary: None,
            created_at: Timestamp(0),
            updated_at: Timestamp(0),
            deleted_at: None,
        }
    }

    fn node(n: u128) -> Node {
        Node {
            id: NodeId(Ulid(n)),
            short_id: format!("s{:05}", n),
            tree_id: TREE,
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

    fn edge(n: u128, source: u128, target: u128) -> Edge {
        Edge {
            id: EdgeId(Ulid(n)),
            tree_id: TREE,
            sources: vec![EdgeSource {
                node_id: NodeId(Ulid(source)),
                role: SourceRole::Primary,
            }],
            target_id: NodeId(Ulid(target)),
            kind: EdgeKind::Continuation,
            created_at: Timestamp(0),
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("loom.redb");

        {
            let mut store = RedbLoom::open(&db_path).expect("open");
            store
                .transact(|w| {
                    w.put_tree(&tree())?;
                    w.put_node(&node(1))?;
                    w.put_node(&node(2))?;
                    w.put_edge(&edge(50, 1, 2))
                })
                .expect("transact");
        }

        let store = RedbLoom::open(&db_path).expect("reopen");
        store
            .read(|r| {
                assert_eq!(r.tree(TREE)?.map(|t| t.system_context), Some(Some("be brief".into())));
                assert_eq!(r.tree_nodes(TREE)?.len(), 2);
                assert_eq!(r.edges_by_target(NodeId(Ulid(2)))?.len(), 1);
                assert_eq!(r.edges_by_source(NodeId(Ulid(1)))?.len(), 1);
                assert_eq!(r.revision()?, 1);
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn failed_transaction_is_rolled_back() {
        let dir = tempdir().expect("tempdir");
        let mut store = RedbLoom::open(dir.path().join("loom.redb")).expect("open");

        let result: Result<(), LoomError> = store.transact(|w| {
            w.put_node(&node(1))?;
            Err(LoomError::Validation("abort".into()))
        });
        assert!(result.is_err());

        store
            .read(|r| {
                assert!(r.node(NodeId(Ulid(1)))?.is_none());
                assert_eq!(r.revision()?, 0);
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn writes_are_visible_inside_the_transaction() {
        let dir = tempdir().expect("tempdir");
        let mut store = RedbLoom::open(dir.path().join("loom.redb")).expect("open");
        store
            .transact(|w| {
                w.put_node(&node(1))?;
                assert!(w.node(NodeId(Ulid(1)))?.is_some());
                assert!(w.short_id_taken(TREE, "s00001")?);
                assert!(!w.short_id_taken(TREE, "s00002")?);
                Ok(())
            })
            .expect("transact");
    }

    #[test]
    fn delete_tree_cascades() {
        let dir = tempdir().expect("tempdir");
        let mut store = RedbLoom::open(dir.path().join("loom.redb")).expect("open");
        let path_id = PathId(Ulid(60));
        store
            .transact(|w| {
                w.put_tree(&tree())?;
                w.put_node(&node(1))?;
                w.put_node(&node(2))?;
                w.put_edge(&edge(50, 1, 2))?;
                w.put_path(&Path {
                    id: path_id,
                    tree_id: TREE,
                    owner_agent_id: AgentId(Ulid(7)),
                    name: None,
                    created_at: Timestamp(0),
                    updated_at: Timestamp(0),
                    deleted_at: None,
                })?;
                w.push_path_node(path_id, NodeId(Ulid(1)))?;
                w.push_path_node(path_id, NodeId(Ulid(2)))?;
                w.put_path_state(&PathState {
                    path_id,
                    agent_id: AgentId(Ulid(7)),
                    mode: None,
                    active_node_id: NodeId(Ulid(2)),
                    updated_at: Timestamp(0),
                })?;
                w.put_selection(&PathSelection {
                    path_id,
                    target_node_id: NodeId(Ulid(2)),
                    selected_edge_id: Some(EdgeId(Ulid(50))),
                    selected_source_node_id: None,
                    updated_at: Timestamp(0),
                })
            })
            .expect("setup");

        store.transact(|w| w.delete_tree(TREE)).expect("delete");

        store
            .read(|r| {
                assert!(r.tree(TREE)?.is_none());
                assert!(r.node(NodeId(Ulid(1)))?.is_none());
                assert!(r.edge(EdgeId(Ulid(50)))?.is_none());
                assert!(r.path(path_id)?.is_none());
                assert!(r.path_selections(path_id)?.is_empty());
                assert!(r.edges_by_source(NodeId(Ulid(1)))?.is_empty());
                assert_eq!(r.path_len(path_id)?, 0);
                assert!(r.tree_paths(TREE)?.is_empty());
                assert!(!r.short_id_taken(TREE, "s00001")?);
                assert!(r.nodes_by_author(TREE, AgentId(Ulid(7)))?.is_empty());
                let cursor = PathStateKey {
                    path_id,
                    agent_id: AgentId(Ulid(7)),
                    mode: None,
                };
                assert!(r.path_state(&cursor)?.is_none());
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn selection_upsert_and_delete() {
        let dir = tempdir().expect("tempdir");
        let mut store = RedbLoom::open(dir.path().join("loom.redb")).expect("open");
        let path_id = PathId(Ulid(60));
        let target = NodeId(Ulid(2));
        let selection = PathSelection {
            path_id,
            target_node_id: target,
            selected_edge_id: Some(EdgeId(Ulid(50))),
            selected_source_node_id: None,
            updated_at: Timestamp(0),
        };
        store
            .transact(|w| {
                w.put_selection(&selection)?;
                w.put_selection(&selection)
            })
            .expect("upsert");
        store
            .read(|r| {
                assert_eq!(r.path_selections(path_id)?.len(), 1);
                Ok(())
            })
            .expect("read");

        let existed = store
            .transact(|w| w.delete_selection(path_id, target))
            .expect("delete");
        assert!(existed);
        store
            .read(|r| {
                assert!(r.selection(path_id, target)?.is_none());
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn path_rows_are_positional() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("loom.redb");
        let path_id = PathId(Ulid(60));
        let other = PathId(Ulid(61));

        {
            let mut store = RedbLoom::open(&db_path).expect("open");
            let positions = store
                .transact(|w| {
                    let mut positions = Vec::new();
                    for n in 1..=4 {
                        positions.push(w.push_path_node(path_id, NodeId(Ulid(n)))?);
                    }
                    w.push_path_node(other, NodeId(Ulid(9)))?;
                    Ok(positions)
                })
                .expect("push");
            assert_eq!(positions, vec![0, 1, 2, 3]);
            store
                .transact(|w| w.truncate_path_nodes(path_id, 2))
                .expect("truncate");
        }

        let store = RedbLoom::open(&db_path).expect("reopen");
        store
            .read(|r| {
                assert_eq!(r.path_nodes(path_id)?, vec![NodeId(Ulid(1)), NodeId(Ulid(2))]);
                assert_eq!(r.path_len(path_id)?, 2);
                assert_eq!(r.path_tail(path_id)?, Some(NodeId(Ulid(2))));
                assert_eq!(r.path_node_at(path_id, 3)?, None);
                assert_eq!(r.path_nodes(other)?, vec![NodeId(Ulid(9))]);
                Ok(())
            })
            .expect("read");
    }

    #[test]
    fn rewriting_a_node_keeps_indexes_single() {
        let dir = tempdir().expect("tempdir");
        let mut store = RedbLoom::open(dir.path().join("loom.redb")).expect("open");
        let mut updated = node(1);
        updated.metadata.bookmarked = true;
        store
            .transact(|w| {
                w.put_node(&node(1))?;
                w.put_node(&updated)
            })
            .expect("transact");
        store
            .read(|r| {
                assert_eq!(r.tree_nodes(TREE)?.len(), 1);
                assert_eq!(r.nodes_by_author(TREE, AgentId(Ulid(7)))?, vec![updated.clone()]);
                assert_eq!(r.version_group_members(NodeId(Ulid(1)))?.len(), 1);
                assert!(r.short_id_taken(TREE, "s00001")?);
                Ok(())
            })
            .expect("read");
    }
}
