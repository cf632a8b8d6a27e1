//! # Loom Tree CLI Module
//!
//! This module implements the CLI interface for Loom Tree.
//!
//! ## Available Commands
//!
//! - `server` - Start the HTTP server
//! - `init` - Initialize a new database
//! - `status` - Show store status
//! - `trees` / `new-tree` / `show` - Browse and create trees
//! - `say` / `generate` / `edit` - Write through a path
//! - `goto` / `select` / `mark` - Move paths, pin selections, flag nodes
//! - `verify` / `audit` - Check the hash chain
//! - `export` / `import` / `hash` - Move trees between stores

mod commands;

use crate::config::{self, Backend, Config};
use clap::{Parser, Subcommand};
use loomtree_core::{AgentId, EdgeId, InteractionMode, LoomError, NodeId, PathId, TreeId};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Loom Tree - branching multi-agent conversations with a verifiable history.
#[derive(Parser, Debug)]
#[command(name = "loomtree")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ./loomtree.toml if present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the database
    #[arg(short = 'D', long, global = true)]
    pub database: Option<PathBuf>,

    /// Storage backend
    #[arg(short = 'B', long, global = true, value_enum)]
    pub backend: Option<Backend>,

    /// Agent acting for CLI writes
    #[arg(short = 'A', long, global = true)]
    pub agent: Option<AgentId>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Show store status
    Status,

    /// List live trees
    Trees,

    /// Create a tree, its root node and a path for the agent
    NewTree {
        /// Root text
        #[arg(short, long)]
        text: String,

        #[arg(long)]
        title: Option<String>,

        /// dialogue or buffer (default: stored preference)
        #[arg(short, long)]
        mode: Option<InteractionMode>,

        #[arg(long)]
        system: Option<String>,
    },

    /// Show a tree's paths, or one path rendered node by node
    Show {
        #[arg(short, long, conflicts_with = "path")]
        tree: Option<TreeId>,

        #[arg(short, long)]
        path: Option<PathId>,
    },

    /// Append a human node at the path's tail
    Say {
        #[arg(short, long)]
        path: PathId,

        #[arg(short, long)]
        text: String,
    },

    /// Continue the path with the configured provider
    Generate {
        #[arg(short, long)]
        path: PathId,
    },

    /// Edit a node of a buffer-mode path
    Edit {
        #[arg(short, long)]
        path: PathId,

        #[arg(short, long)]
        node: NodeId,

        #[arg(short, long)]
        text: String,
    },

    /// Rebuild a path so it ends at a node
    Goto {
        #[arg(short, long)]
        path: PathId,

        #[arg(short, long)]
        node: NodeId,
    },

    /// Pin which parent a path follows above a node
    Select {
        #[arg(short, long)]
        path: PathId,

        /// Node whose parent is being chosen
        #[arg(short, long)]
        target: NodeId,

        #[arg(short, long)]
        edge: Option<EdgeId>,

        #[arg(short, long)]
        source: Option<NodeId>,
    },

    /// Change node flags
    Mark {
        #[arg(short, long)]
        node: NodeId,

        #[arg(long)]
        bookmark: Option<bool>,

        #[arg(long)]
        label: Option<String>,

        #[arg(long)]
        pruned: Option<bool>,

        #[arg(long)]
        excluded: Option<bool>,
    },

    /// Verify one node, or its whole ancestry with --chain
    Verify {
        #[arg(short, long)]
        node: NodeId,

        #[arg(long)]
        chain: bool,
    },

    /// Verify every node of a tree
    Audit {
        #[arg(short, long)]
        tree: TreeId,
    },

    /// Export a tree in canonical format
    Export {
        #[arg(short, long)]
        tree: TreeId,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Import a tree export, re-verifying every hash
    Import {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Compute BLAKE3 digest of a tree export
    Hash {
        #[arg(short, long)]
        tree: TreeId,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Resolve configuration: file and environment, then these flags.
pub fn resolve_config(cli: &Cli) -> Result<Config, LoomError> {
    let mut config = config::load(cli.config.as_deref())?;
    if let Some(database) = &cli.database {
        config.database.clone_from(database);
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if cli.agent.is_some() {
        config.agent_id = cli.agent;
    }
    if let Some(Commands::Server { host, port }) = &cli.command {
        if let Some(host) = host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = port {
            config.server.port = *port;
        }
    }
    Ok(config)
}

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), LoomError> {
    let config = resolve_config(&cli)?;
    let json = cli.json_mode;

    match cli.command {
        Some(Commands::Server { .. }) => cmd_server(config).await,
        Some(Commands::Init { force }) => cmd_init(&config, force),
        Some(Commands::Status) | None => cmd_status(&config, json),
        Some(Commands::Trees) => cmd_trees(&config, json),
        Some(Commands::NewTree {
            text,
            title,
            mode,
            system,
        }) => cmd_new_tree(&config, json, text, title, mode, system),
        Some(Commands::Show { tree, path }) => cmd_show(&config, json, tree, path),
        Some(Commands::Say { path, text }) => cmd_say(&config, json, path, text),
        Some(Commands::Generate { path }) => cmd_generate(&config, json, path).await,
        Some(Commands::Edit { path, node, text }) => cmd_edit(&config, json, path, node, text),
        Some(Commands::Goto { path, node }) => cmd_goto(&config, json, path, node),
        Some(Commands::Select {
            path,
            target,
            edge,
            source,
        }) => cmd_select(&config, json, path, target, edge, source),
        Some(Commands::Mark {
            node,
            bookmark,
            label,
            pruned,
            excluded,
        }) => cmd_mark(
            &config,
            json,
            node,
            loomtree_core::MetadataPatch {
                bookmarked: bookmark,
                bookmark_label: label.map(|l| Some(l).filter(|l| !l.is_empty())),
                pruned,
                excluded,
            },
        ),
        Some(Commands::Verify { node, chain }) => cmd_verify(&config, json, node, chain),
        Some(Commands::Audit { tree }) => cmd_audit(&config, json, tree),
        Some(Commands::Export { tree, output }) => cmd_export(&config, tree, &output),
        Some(Commands::Import { input }) => cmd_import(&config, json, &input),
        Some(Commands::Hash { tree }) => cmd_hash(&config, json, tree),
    }
}

// =============================================================================
// TESTS
// =============================================================================
