//! # Identifier Layer
//!
//! Primary ids are ULIDs from one process-wide monotonic generator, so two ids
//! allocated in the same millisecond still sort in allocation order.
//!
//! Short ids are tree-scoped display handles. They are prefixes of a hex
//! digest of the primary id, grown from 6 to 8 characters on collision, with a
//! random 2-character suffix as the last resort.

use crate::primitives::{
    SHORT_ID_MAX_LEN, SHORT_ID_MIN_LEN, SHORT_ID_SUFFIX_ALPHABET, SHORT_ID_SUFFIX_ATTEMPTS,
    SHORT_ID_SUFFIX_LEN,
};
use crate::types::LoomError;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::{LazyLock, Mutex};
use ulid::{Generator, Ulid};

static GENERATOR: LazyLock<Mutex<Generator>> = LazyLock::new(|| Mutex::new(Generator::new()));

/// Allocate a new time-sortable identifier.
///
/// Fails only when the monotonic space of the current millisecond overflows.
pub fn new_id() -> Result<Ulid, LoomError> {
    let mut generator = GENERATOR
        .lock()
        .map_err(|_| LoomError::IdExhausted("id generator lock poisoned".into()))?;
    generator
        .generate()
        .map_err(|e| LoomError::IdExhausted(e.to_string()))
}

/// A derived short id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortId {
    pub value: String,
    /// Set when no plain prefix was free and a random suffix was appended.
    pub degraded: bool,
}

/// String a node's short id is carved from: lowercase hex SHA-256 of the ULID.
#[must_use]
pub fn short_id_source(id: Ulid) -> String {
    hex::encode(Sha256::digest(id.to_string().as_bytes()))
}

/// Shortest free prefix of `full_id` (6..=8 chars), else 8 chars plus a random suffix.
pub fn derive_short_id(full_id: &str, existing: &BTreeSet<String>) -> Result<ShortId, LoomError> {
    derive_short_id_with(full_id, existing, &mut rand::rng())
}

/// [`derive_short_id`] with an explicit random source.
pub fn derive_short_id_with<R: Rng + ?Sized>(
    full_id: &str,
    existing: &BTreeSet<String>,
    rng: &mut R,
) -> Result<ShortId, LoomError> {
    derive_short_id_by(full_id, |candidate| Ok(existing.contains(candidate)), rng)
}

/// [`derive_short_id`] against an arbitrary lookup, such as a store's
/// per-tree short id index.
pub fn derive_short_id_by<F, R>(full_id: &str, mut taken: F, rng: &mut R) -> Result<ShortId, LoomError>
where
    F: FnMut(&str) -> Result<bool, LoomError>,
    R: Rng + ?Sized,
{
    let chars: Vec<char> = full_id.chars().collect();
    if chars.len() < SHORT_ID_MIN_LEN {
        return Err(LoomError::Validation(format!(
            "id '{}' is shorter than {} characters",
            full_id, SHORT_ID_MIN_LEN
        )));
    }

    let longest = SHORT_ID_MAX_LEN.min(chars.len());
    for len in SHORT_ID_MIN_LEN..=longest {
        let candidate: String = chars[..len].iter().collect();
        if !taken(&candidate)? {
            return Ok(ShortId {
                value: candidate,
                degraded: false,
            });
        }
    }

    let base: String = chars[..longest].iter().collect();
    for _ in 0..SHORT_ID_SUFFIX_ATTEMPTS {
        let suffix: String = (0..SHORT_ID_SUFFIX_LEN)
            .map(|_| {
                let idx = rng.random_range(0..SHORT_ID_SUFFIX_ALPHABET.len());
                char::from(SHORT_ID_SUFFIX_ALPHABET[idx])
            })
            .collect();
        let candidate = format!("{}{}", base, suffix);
        if !taken(&candidate)? {
            return Ok(ShortId {
                value: candidate,
                degraded: true,
            });
        }
    }

    Err(LoomError::Conflict(format!(
        "no free short id for '{}' after {} suffix attempts",
        full_id, SHORT_ID_SUFFIX_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn new_ids_are_monotonic() {
        let ids: Vec<Ulid> = (0..1000).map(|_| new_id().expect("id")).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn first_short_id_has_minimum_length() {
        let short = derive_short_id("abcdef0123456789", &BTreeSet::new()).expect("short");
        assert_eq!(short.value, "abcdef");
        assert!(!short.degraded);
    }

    #[test]
    fn short_id_grows_one_char_at_a_time() {
        let existing: BTreeSet<String> = ["abcdef", "abcdef0"].iter().map(|s| s.to_string()).collect();
        let short = derive_short_id("abcdef0123456789", &existing).expect("short");
        assert_eq!(short.value, "abcdef01");
        assert!(!short.degraded);
    }

    #[test]
    fn exhausted_prefixes_fall_back_to_suffix() {
        let existing: BTreeSet<String> = ["abcdef", "abcdef0", "abcdef01"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut rng = StdRng::seed_from_u64(7);
        let short = derive_short_id_with("abcdef0123456789", &existing, &mut rng).expect("short");
        assert!(short.degraded);
        assert_eq!(short.value.len(), SHORT_ID_MAX_LEN + SHORT_ID_SUFFIX_LEN);
        assert!(short.value.starts_with("abcdef01"));
        assert!(
            short.value[SHORT_ID_MAX_LEN..]
                .bytes()
                .all(|b| SHORT_ID_SUFFIX_ALPHABET.contains(&b))
        );
    }

    #[test]
    fn lookup_errors_propagate() {
        let result = derive_short_id_by(
            "abcdef0123456789",
            |_| Err(LoomError::IoError("index unavailable".into())),
            &mut rand::rng(),
        );
        assert!(matches!(result, Err(LoomError::IoError(_))));
    }

    #[test]
    fn too_short_input_is_rejected() {
        assert!(derive_short_id("abc", &BTreeSet::new()).is_err());
    }

    #[test]
    fn short_id_source_is_hex_digest() {
        let source = short_id_source(Ulid::nil());
        assert_eq!(source.len(), 64);
        assert!(source.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn thousand_node_tree_stays_short() {
        let mut existing = BTreeSet::new();
        let mut degraded = 0;
        for _ in 0..1000 {
            let id = new_id().expect("id");
            let short = derive_short_id(&short_id_source(id), &existing).expect("short");
            assert!(short.value.len() <= SHORT_ID_MAX_LEN + SHORT_ID_SUFFIX_LEN);
            if short.degraded {
                degraded += 1;
            }
            assert!(existing.insert(short.value));
        }
        assert_eq!(existing.len(), 1000);
        assert_eq!(degraded, 0);
    }
}
