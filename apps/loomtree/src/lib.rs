//! # loomtree
//!
//! Application layer over `loomtree-core`: configuration, the async model
//! provider driver, the HTTP API and the CLI. The binary in `main.rs` only
//! sets up logging and dispatches to [`cli::execute`].

pub mod api;
pub mod cli;
pub mod config;
pub mod provider;
