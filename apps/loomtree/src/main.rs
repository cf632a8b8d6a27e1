//! # Loom Tree Server
//!
//! The main binary for Loom Tree: branching, multi-agent conversations kept
//! as a hypergraph with a verifiable hash chain.
//!
//! This application provides:
//! - HTTP REST API server (axum-based)
//! - CLI interface for tree, path and provenance operations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    apps/loomtree (THE BINARY)                   │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐    │
//! │  │   CLI       │    │   HTTP API  │    │  Model Provider  │    │
//! │  │  (clap)     │    │   (axum)    │    │  (async, retry)  │    │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘    │
//! │         │                  │                    │              │
//! │         └──────────────────┼────────────────────┘              │
//! │                            ▼                                   │
//! │                   ┌─────────────────┐                          │
//! │                   │  loomtree-core  │                          │
//! │                   │   (THE LOGIC)   │                          │
//! │                   └─────────────────┘                          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! loomtree server --host 0.0.0.0 --port 8080
//!
//! # CLI operations
//! loomtree -A <agent> new-tree --text "Once upon a time"
//! loomtree -A <agent> say --path <path> --text "and then?"
//! loomtree audit --tree <tree>
//! ```

use clap::Parser;
use loomtree::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // LOOMTREE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("LOOMTREE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let default_filter = if cli.verbose {
        "loomtree=debug,loomtree_core=debug,tower_http=debug"
    } else {
        "loomtree=info,loomtree_core=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!(code = e.code(), "Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the startup banner.
fn print_banner() {
    println!(
        r#"
  ╦  ┌─┐┌─┐┌┬┐  ╔╦╗┬─┐┌─┐┌─┐
  ║  │ ││ ││││   ║ ├┬┘├┤ ├┤
  ╩═╝└─┘└─┘┴ ┴   ╩ ┴└─└─┘└─┘

  Loom Tree v{}

  Branching • Multi-agent • Verifiable
"#,
        env!("CARGO_PKG_VERSION")
    );
}
