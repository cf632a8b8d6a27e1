//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use crate::api::{self, AppState};
use crate::config::{Backend, Config};
use crate::provider::{generate_with_retry, provider_by_name};
use loomtree_core::{
    Content, EdgeId, InteractionMode, LoomError, MetadataPatch, Node, NodeId, PathId, Session,
    TreeId, VerificationResult,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// FILE SIZE LIMITS
// =============================================================================

/// Maximum file size for import (500 MB).
const MAX_IMPORT_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Characters of node text shown per line by `show`.
const PREVIEW_CHARS: usize = 120;

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), LoomError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| LoomError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(LoomError::Validation(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Canonicalize an input path and make sure it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, LoomError> {
    let canonical = path.canonicalize().map_err(|e| {
        LoomError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(LoomError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Canonicalize the parent of an output path and make sure it is a directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, LoomError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        LoomError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(LoomError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| LoomError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

// =============================================================================
// OUTPUT HELPERS
// =============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<(), LoomError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| LoomError::SerializationError(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

/// One line per node: short id, author kind and a text preview.
fn node_line(node: &Node) -> String {
    let text = node.content.render_text().replace('\n', " ");
    let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        preview.push('…');
    }
    let mut flags = String::new();
    if node.metadata.bookmarked {
        flags.push_str(" [bookmark]");
    }
    if node.metadata.excluded {
        flags.push_str(" [excluded]");
    }
    if node.edited_from.is_some() {
        flags.push_str(" [edit]");
    }
    format!(
        "{:<10} {:<6} {}{}",
        node.short_id,
        node.author_kind.to_string(),
        preview,
        flags
    )
}

fn print_verification(result: &VerificationResult) {
    let status = match &result.failure {
        None => "ok".to_string(),
        Some(loomtree_core::VerificationFailure::HashMismatch) => "HASH MISMATCH".to_string(),
        Some(loomtree_core::VerificationFailure::Unverifiable { reason }) => {
            format!("unverifiable ({})", reason)
        }
    };
    println!("{}  {}", result.node_id, status);
}

// =============================================================================
// SESSION
// =============================================================================

/// Open the configured store.
pub fn open_session(config: &Config) -> Result<Session, LoomError> {
    match config.backend {
        Backend::Redb => Session::with_redb(&config.database),
        Backend::Memory => {
            tracing::warn!("memory backend: nothing is persisted after exit");
            Ok(Session::new())
        }
    }
}

// =============================================================================
// SERVER COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_server(config: Config) -> Result<(), LoomError> {
    let session = open_session(&config)?;
    let provider = provider_by_name(&config.generation.provider)?;

    println!("Loom Tree Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Host:     {}", config.server.host);
    println!("  Port:     {}", config.server.port);
    println!("  Backend:  {:?}", config.backend);
    println!("  Database: {:?}", config.database);
    println!("  Provider: {}", provider.name());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    api::run_server(AppState::new(session, Arc::from(provider), config)).await
}

// =============================================================================
// INIT / STATUS
// =============================================================================

/// Initialize a new database.
pub fn cmd_init(config: &Config, force: bool) -> Result<(), LoomError> {
    if config.backend == Backend::Memory {
        return Err(LoomError::Validation(
            "the memory backend has nothing to initialize".to_string(),
        ));
    }
    if config.database.exists() {
        if !force {
            return Err(LoomError::Conflict(
                "Database already exists. Use --force to overwrite.".to_string(),
            ));
        }
        std::fs::remove_file(&config.database)
            .map_err(|e| LoomError::IoError(format!("Remove old database: {}", e)))?;
    }

    let mut session = Session::with_redb(&config.database)?;
    session.preferences()?;
    println!("Initialized new database at {:?}", config.database);
    Ok(())
}

/// Show store status.
pub fn cmd_status(config: &Config, json: bool) -> Result<(), LoomError> {
    let session = open_session(config)?;
    let trees = session.trees()?;
    let revision = session.revision()?;

    if json {
        return print_json(&serde_json::json!({
            "database": config.database.to_string_lossy(),
            "backend": config.backend,
            "tree_count": trees.len(),
            "revision": revision,
        }));
    }

    println!("Loom Tree Status");
    println!("================");
    println!("Database: {:?}", config.database);
    println!("Backend:  {:?}", config.backend);
    println!();
    println!("Trees:    {}", trees.len());
    println!("Revision: {}", revision);
    Ok(())
}

// =============================================================================
// TREES
// =============================================================================

pub fn cmd_trees(config: &Config, json: bool) -> Result<(), LoomError> {
    let session = open_session(config)?;
    let trees = session.trees()?;
    if json {
        return print_json(&trees);
    }
    if trees.is_empty() {
        println!("No trees");
    }
    for tree in trees {
        println!(
            "{}  {:<9} {}",
            tree.id,
            tree.mode.as_str(),
            tree.title.as_deref().unwrap_or("(untitled)")
        );
    }
    Ok(())
}

pub fn cmd_new_tree(
    config: &Config,
    json: bool,
    text: String,
    title: Option<String>,
    mode: Option<InteractionMode>,
    system: Option<String>,
) -> Result<(), LoomError> {
    let agent = config.require_agent()?;
    let mut session = open_session(config)?;
    let prefs = session.preferences()?;

    let (tree, root, path) = session.create_tree(
        loomtree_core::NewTree {
            container_id: prefs.default_container_id,
            mode: mode.unwrap_or(prefs.default_mode),
            system_context: system,
            title,
            description: None,
            root_content: Content::text(text),
            root_author: agent,
        },
        Some((agent, None)),
    )?;

    if json {
        return print_json(&serde_json::json!({
            "tree": tree,
            "root_id": root.node.id,
            "path": path,
        }));
    }
    println!("Tree: {}", tree.id);
    println!("Root: {} ({})", root.node.id, root.node.short_id);
    if let Some(path) = path {
        println!("Path: {}", path.id);
    }
    Ok(())
}

pub fn cmd_show(
    config: &Config,
    json: bool,
    tree: Option<TreeId>,
    path: Option<PathId>,
) -> Result<(), LoomError> {
    let session = open_session(config)?;

    if let Some(path_id) = path {
        let ids = session.path_nodes(path_id)?;
        let nodes = ids
            .iter()
            .map(|id| session.node(*id))
            .collect::<Result<Vec<_>, _>>()?;
        if json {
            return print_json(&crate::api::nodes_json(nodes));
        }
        for node in &nodes {
            println!("{}", node_line(node));
        }
        return Ok(());
    }

    let Some(tree_id) = tree else {
        return Err(LoomError::Validation(
            "show needs --tree or --path".to_string(),
        ));
    };
    let tree = session.tree(tree_id)?;
    let root = session.root(tree_id)?;
    let paths = session.tree_paths(tree_id)?;
    let bookmarks = session.bookmarks(tree_id)?;

    if json {
        return print_json(&serde_json::json!({
            "tree": tree,
            "root_id": root.id,
            "paths": paths,
            "bookmarks": bookmarks.iter().map(|n| n.id).collect::<Vec<_>>(),
        }));
    }
    println!("Tree {} ({})", tree.id, tree.mode);
    if let Some(title) = &tree.title {
        println!("  {}", title);
    }
    println!("Root: {}", node_line(&root));
    println!("Paths:");
    for path in &paths {
        let len = session.path_nodes(path.id)?.len();
        println!(
            "  {}  owner {}  {} nodes  {}",
            path.id,
            path.owner_agent_id,
            len,
            path.name.as_deref().unwrap_or("")
        );
    }
    if !bookmarks.is_empty() {
        println!("Bookmarks:");
        for node in &bookmarks {
            println!("  {}", node_line(node));
        }
    }
    Ok(())
}

// =============================================================================
// WRITING THROUGH A PATH
// =============================================================================

pub fn cmd_say(config: &Config, json: bool, path: PathId, text: String) -> Result<(), LoomError> {
    let agent = config.require_agent()?;
    let mut session = open_session(config)?;
    let appended = session.append_human(path, agent, Content::text(text))?;

    if json {
        return print_json(&crate::api::NodeJson::from(appended.result.node));
    }
    println!("{}", node_line(&appended.result.node));
    Ok(())
}

/// Generate through the configured provider.
pub async fn cmd_generate(config: &Config, json: bool, path: PathId) -> Result<(), LoomError> {
    let agent = config.require_model_agent()?;
    let provider = provider_by_name(&config.generation.provider)?;
    let mut session = open_session(config)?;

    let context = session.context(path)?;
    let completion = generate_with_retry(provider.as_ref(), &context, &config.generation.retry)
        .await
        .map_err(|e| LoomError::Validation(e.to_string()))?;
    let appended = session.append_completion(
        &context,
        agent,
        completion,
        config.generation.keep_raw_bytes,
    )?;

    let node = appended.result.created.node;
    if json {
        return print_json(&crate::api::NodeJson::from(node));
    }
    println!("{}", node_line(&node));
    Ok(())
}

pub fn cmd_edit(
    config: &Config,
    json: bool,
    path: PathId,
    node: NodeId,
    text: String,
) -> Result<(), LoomError> {
    let agent = config.require_agent()?;
    let mut session = open_session(config)?;
    let appended = session.edit(path, agent, node, Content::text(text))?;

    if json {
        return print_json(&serde_json::json!({
            "node": crate::api::NodeJson::from(appended.result.created.node),
            "extended_edges": appended.result.extended_edges,
            "path_len": appended.path_len,
        }));
    }
    println!("{}", node_line(&appended.result.created.node));
    println!(
        "  attached to {} continuation edge(s)",
        appended.result.extended_edges.len()
    );
    Ok(())
}

// =============================================================================
// PATH MOVES
// =============================================================================

pub fn cmd_goto(config: &Config, json: bool, path: PathId, node: NodeId) -> Result<(), LoomError> {
    let agent = config.require_agent()?;
    let mut session = open_session(config)?;
    let nodes = session.navigate(path, agent, node)?;
    if json {
        return print_json(&nodes);
    }
    println!("Path {} now has {} nodes", path, nodes.len());
    Ok(())
}

pub fn cmd_select(
    config: &Config,
    json: bool,
    path: PathId,
    target: NodeId,
    edge: Option<EdgeId>,
    source: Option<NodeId>,
) -> Result<(), LoomError> {
    let mut session = open_session(config)?;
    let selection = session.select(path, target, edge, source)?;
    if json {
        return print_json(&selection);
    }
    println!(
        "Selection above {}: edge {:?}, source {:?}",
        target, selection.selected_edge_id, selection.selected_source_node_id
    );
    Ok(())
}

pub fn cmd_mark(
    config: &Config,
    json: bool,
    node: NodeId,
    patch: MetadataPatch,
) -> Result<(), LoomError> {
    let mut session = open_session(config)?;
    let updated = session.update_metadata(node, &patch)?;
    if json {
        return print_json(&updated.metadata);
    }
    println!("{}", node_line(&updated));
    Ok(())
}

// =============================================================================
// VERIFICATION
// =============================================================================

/// Verify a node. Exits non-zero through the returned error when it fails.
pub fn cmd_verify(config: &Config, json: bool, node: NodeId, chain: bool) -> Result<(), LoomError> {
    let session = open_session(config)?;
    let results = if chain {
        session.verify_chain(node)?
    } else {
        vec![session.verify(node)?]
    };

    if json {
        print_json(&results)?;
    } else {
        for result in &results {
            print_verification(result);
        }
    }
    match results.into_iter().find(|r| !r.valid) {
        Some(failed) => failed.into_result(),
        None => Ok(()),
    }
}

pub fn cmd_audit(config: &Config, json: bool, tree: TreeId) -> Result<(), LoomError> {
    let session = open_session(config)?;
    let report = session.audit(tree)?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "Checked {} nodes: {} valid, {} failed",
            report.checked,
            report.valid,
            report.failures.len()
        );
        for failure in &report.failures {
            print_verification(failure);
        }
    }
    match report.failures.into_iter().next() {
        Some(failed) => failed.into_result(),
        None => Ok(()),
    }
}

// =============================================================================
// EXPORT / IMPORT
// =============================================================================

pub fn cmd_export(config: &Config, tree: TreeId, output: &Path) -> Result<(), LoomError> {
    let validated_output = validate_output_path(output)?;
    let session = open_session(config)?;

    let data = session.export_tree(tree)?;
    println!("Digest: {}", session.tree_digest(tree)?);

    std::fs::write(&validated_output, &data)
        .map_err(|e| LoomError::IoError(format!("Write file: {}", e)))?;

    println!("Exported {} bytes to {:?}", data.len(), validated_output);
    Ok(())
}

pub fn cmd_import(config: &Config, json: bool, input: &Path) -> Result<(), LoomError> {
    let validated_path = validate_file_path(input)?;
    validate_file_size(&validated_path, MAX_IMPORT_FILE_SIZE)?;

    let data = std::fs::read(&validated_path)
        .map_err(|e| LoomError::IoError(format!("Read file: {}", e)))?;

    let mut session = open_session(config)?;
    let tree = session.import_tree(&data)?;
    let node_count = session.tree_nodes(tree.id)?.len();

    if json {
        return print_json(&serde_json::json!({ "tree": tree, "node_count": node_count }));
    }
    println!("Imported tree {}: {} nodes", tree.id, node_count);
    Ok(())
}

pub fn cmd_hash(config: &Config, json: bool, tree: TreeId) -> Result<(), LoomError> {
    let session = open_session(config)?;
    let digest = session.tree_digest(tree)?;
    if json {
        return print_json(&serde_json::json!({
            "tree_id": tree,
            "algorithm": "blake3",
            "digest": digest,
        }));
    }
    println!("{}", digest);
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use loomtree_core::AgentId;
    use ulid::Ulid;

    fn config_in(dir: &tempfile::TempDir) -> Config {
        Config {
            database: dir.path().join("loom.db"),
            agent_id: Some(AgentId(Ulid(7))),
            ..Config::default()
        }
    }

    #[test]
    fn test_init_refuses_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_init(&config, false).unwrap();
        assert!(matches!(
            cmd_init(&config, false),
            Err(LoomError::Conflict(_))
        ));
        cmd_init(&config, true).unwrap();
    }

    #[test]
    fn test_writes_persist_across_commands() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_new_tree(&config, true, "hello".into(), None, None, None).unwrap();

        let session = open_session(&config).unwrap();
        let trees = session.trees().unwrap();
        assert_eq!(trees.len(), 1);
        let path = session.tree_paths(trees[0].id).unwrap()[0].id;
        drop(session);

        cmd_say(&config, true, path, "hi".into()).unwrap();
        let session = open_session(&config).unwrap();
        assert_eq!(session.path_nodes(path).unwrap().len(), 2);
    }

    #[test]
    fn test_export_then_import_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(&dir);
        cmd_new_tree(&config, true, "hello".into(), None, None, None).unwrap();
        let tree = open_session(&config).unwrap().trees().unwrap()[0].id;

        let file = dir.path().join("tree.loom");
        cmd_export(&config, tree, &file).unwrap();

        let other = Config {
            database: dir.path().join("other.db"),
            ..config.clone()
        };
        cmd_import(&other, true, &file).unwrap();
        cmd_audit(&other, true, tree).unwrap();
    }

    #[test]
    fn test_output_path_without_parent_uses_cwd() {
        let validated = validate_output_path(Path::new("out.loom")).unwrap();
        assert!(validated.ends_with("out.loom"));
    }

    #[test]
    fn test_missing_input_is_rejected() {
        assert!(validate_file_path(Path::new("/no/such/file.loom")).is_err());
    }
}
