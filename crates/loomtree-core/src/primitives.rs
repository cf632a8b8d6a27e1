//! # Engine Primitives
//!
//! Hardcoded constants for the Loom Tree engine.
//!
//! Everything in the "hash chain format" group is part of the on-disk contract:
//! changing any of these values makes every previously stored content hash
//! unverifiable.

// =============================================================================
// HASH CHAIN FORMAT
// =============================================================================

/// Separator between the four components of a node hash input.
///
/// U+001F (unit separator) never appears in canonical JSON (control characters
/// are escaped), in hex digests, in ISO timestamps or in ULIDs.
pub const HASH_FIELD_SEPARATOR: char = '\u{1f}';

/// Joiner between sorted parent hashes inside the parent component.
pub const PARENT_HASH_JOINER: &str = "|";

/// Length in hex characters of a SHA-256 content hash.
pub const CONTENT_HASH_HEX_LEN: usize = 64;

// =============================================================================
// SHORT IDS
// =============================================================================

/// Initial short id length.
pub const SHORT_ID_MIN_LEN: usize = 6;

/// Longest plain prefix tried before falling back to a random suffix.
pub const SHORT_ID_MAX_LEN: usize = 8;

/// Length of the random suffix appended on the degraded path.
pub const SHORT_ID_SUFFIX_LEN: usize = 2;

/// Alphabet for the random suffix (lowercase Crockford base32).
pub const SHORT_ID_SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";

/// Attempts at drawing a non-colliding random suffix before giving up.
pub const SHORT_ID_SUFFIX_ATTEMPTS: usize = 64;

// =============================================================================
// TRAVERSAL BOUNDS
// =============================================================================

/// Maximum number of steps a backward (node → root) walk may take.
///
/// A walk longer than this can only mean a cycle in continuation edges,
/// which is reported as `InvalidState`.
pub const MAX_ANCESTRY_DEPTH: usize = 100_000;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum size of a single text payload (1 MiB).
pub const MAX_TEXT_LENGTH: usize = 1024 * 1024;

/// Maximum number of blocks in a mixed content value.
pub const MAX_MIXED_BLOCKS: usize = 256;

/// Maximum number of sources on one hyperedge.
pub const MAX_EDGE_SOURCES: usize = 64;

/// Maximum length of titles, names and bookmark labels.
pub const MAX_LABEL_LENGTH: usize = 512;
