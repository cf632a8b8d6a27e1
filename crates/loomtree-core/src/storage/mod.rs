//! # Storage Backends
//!
//! Persistent implementation of the Loom store contract.

pub mod redb_loom;

pub use redb_loom::RedbLoom;
