//! Deterministic hashing of specs and state.
//!
//! Plans record a fingerprint of the inputs they were computed from so a
//! saved plan can be rejected once configuration or state moved on.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::state::StateSnapshot;

use super::spec::{Move, ResourceSpec};

/// Hasher for computing configuration and state fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hash of a single resource spec.
    ///
    /// Every map in a spec is ordered, so the canonical JSON form is stable.
    #[must_use]
    pub fn hash_spec(&self, spec: &ResourceSpec) -> String {
        hash_serialized(spec)
    }

    /// Fingerprint of the inputs a plan is computed from.
    #[must_use]
    pub fn fingerprint(&self, specs: &[ResourceSpec], moves: &[Move], snapshot: &StateSnapshot) -> String {
        let mut hasher = Sha256::new();

        let mut sorted: Vec<&ResourceSpec> = specs.iter().collect();
        sorted.sort_by(|a, b| a.address.cmp(&b.address));
        hasher.update((sorted.len() as u64).to_be_bytes());
        for spec in sorted {
            hasher.update(self.hash_spec(spec).as_bytes());
        }

        let mut moves: Vec<&Move> = moves.iter().collect();
        moves.sort();
        for moved in moves {
            hasher.update(moved.from.to_string().as_bytes());
            hasher.update(b"->");
            hasher.update(moved.to.to_string().as_bytes());
        }

        hasher.update(snapshot.lineage.as_bytes());
        hasher.update(snapshot.serial.to_be_bytes());
        for record in snapshot.records.values() {
            hasher.update(hash_serialized(record).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Short form of a hash for display (first 12 characters).
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}

/// SHA-256 of arbitrary bytes, hex encoded.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn hash_serialized<T: Serialize>(value: &T) -> String {
    // Serializing plain data with string keys cannot fail.
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hash_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Value;

    fn spec(address: &str, content: &str) -> ResourceSpec {
        ResourceSpec::new(
            address.parse().unwrap(),
            [("content".to_string(), Value::from(content))].into(),
        )
        .unwrap()
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let hasher = ConfigHasher::new();
        let snapshot = StateSnapshot::empty("lineage-1");
        let a = spec("local_file.a", "x");
        let b = spec("local_file.b", "y");

        let first = hasher.fingerprint(&[a.clone(), b.clone()], &[], &snapshot);
        let second = hasher.fingerprint(&[b, a], &[], &snapshot);
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_inputs() {
        let hasher = ConfigHasher::new();
        let snapshot = StateSnapshot::empty("lineage-1");

        let base = hasher.fingerprint(&[spec("local_file.a", "x")], &[], &snapshot);
        let changed = hasher.fingerprint(&[spec("local_file.a", "z")], &[], &snapshot);
        let other_state = hasher.fingerprint(&[spec("local_file.a", "x")], &[], &StateSnapshot::empty("lineage-2"));

        assert_ne!(base, changed);
        assert_ne!(base, other_state);
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(ConfigHasher::short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }

    #[test]
    fn test_hash_bytes() {
        assert_eq!(
            hash_bytes(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
