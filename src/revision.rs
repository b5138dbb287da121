// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Revision markers.
//!
//! A revision marker is `{generation}-{hash}`. The generation counts edits
//! along a lineage (1 for a root). The hash is content addressed: the first
//! 32 hex chars of SHA-256 over the generation, the parent marker, the
//! deleted flag and the canonical JSON of the body. Two replicas that make
//! the identical edit on the same parent therefore agree on the marker.
//!
//! Markers order by generation, then by hash. That total order is what the
//! resolver uses to pick a winner among leaves.

use crate::error::SyncError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A document body: an open map of JSON fields.
pub type Body = Map<String, Value>;

/// Length of the hash half of a marker, in hex characters.
pub const HASH_LEN: usize = 32;

/// A parsed revision marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Build the marker for a new revision. Fails when `parent` is already
    /// at the last representable generation.
    pub fn compute(parent: Option<&Revision>, deleted: bool, body: &Body) -> Result<Self, SyncError> {
        let generation = match parent {
            None => 1,
            Some(p) => p.generation.checked_add(1).ok_or_else(|| {
                SyncError::InvalidRevision(format!("no generation after {}", p))
            })?,
        };

        let mut canonical = String::new();
        write_canonical(&Value::Object(body.clone()), &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(generation.to_string().as_bytes());
        hasher.update(b"\n");
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update(b"\n");
        hasher.update(if deleted { b"1" } else { b"0" });
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());

        let digest = hex::encode(hasher.finalize());
        Ok(Self {
            generation,
            hash: digest[..HASH_LEN].to_string(),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| SyncError::InvalidRevision(format!("missing '-': {:?}", s)))?;

        let generation: u64 = generation
            .parse()
            .map_err(|_| SyncError::InvalidRevision(format!("bad generation: {:?}", s)))?;
        if generation == 0 {
            return Err(SyncError::InvalidRevision(format!(
                "generation must be at least 1: {:?}",
                s
            )));
        }

        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(SyncError::InvalidRevision(format!("bad hash: {:?}", s)));
        }

        Ok(Self {
            generation,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Check that `lineage` runs from a revision back to a root with
/// generations decreasing by exactly one.
pub fn validate_lineage(lineage: &[Revision]) -> Result<(), SyncError> {
    let Some(last) = lineage.last() else {
        return Err(SyncError::InvalidRevision("empty lineage".into()));
    };
    if last.generation != 1 {
        return Err(SyncError::InvalidRevision(format!(
            "lineage does not reach a root: ends at {}",
            last
        )));
    }
    for pair in lineage.windows(2) {
        if pair[1].generation.checked_add(1) != Some(pair[0].generation) {
            return Err(SyncError::InvalidRevision(format!(
                "lineage skips a generation between {} and {}",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Key-sorted, whitespace-free JSON. Independent of serde_json's map ordering
/// so markers stay stable whatever features the dependency graph enables.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Body {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_root_revision_generation() {
        let rev = Revision::compute(None, false, &body(json!({"orderId": "SO100"}))).unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(rev.hash().len(), HASH_LEN);
    }

    #[test]
    fn test_child_generation_increments() {
        let root = Revision::compute(None, false, &body(json!({"quantity": 5}))).unwrap();
        let child = Revision::compute(Some(&root), false, &body(json!({"quantity": 6}))).unwrap();
        assert_eq!(child.generation(), 2);
    }

    #[test]
    fn test_identical_edits_agree() {
        let root = Revision::compute(None, false, &body(json!({"a": 1}))).unwrap();
        let left = Revision::compute(Some(&root), false, &body(json!({"a": 2, "b": [1, 2]}))).unwrap();
        let right = Revision::compute(Some(&root), false, &body(json!({"b": [1, 2], "a": 2}))).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn test_deleted_flag_changes_hash() {
        let root = Revision::compute(None, false, &body(json!({}))).unwrap();
        let edit = Revision::compute(Some(&root), false, &Body::new()).unwrap();
        let tombstone = Revision::compute(Some(&root), true, &Body::new()).unwrap();
        assert_ne!(edit, tombstone);
    }

    #[test]
    fn test_parent_changes_hash() {
        let b = body(json!({"x": true}));
        let p1 = Revision::compute(None, false, &body(json!({"v": 1}))).unwrap();
        let p2 = Revision::compute(None, false, &body(json!({"v": 2}))).unwrap();
        assert_ne!(
            Revision::compute(Some(&p1), false, &b).unwrap(),
            Revision::compute(Some(&p2), false, &b).unwrap()
        );
    }

    #[test]
    fn test_parse_and_display() {
        let rev: Revision = "3-0af9".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.hash(), "0af9");
        assert_eq!(rev.to_string(), "3-0af9");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "abc", "0-abc", "-abc", "1-", "1-XYZ", "x-abc", "1-ab-cd"] {
            assert!(
                matches!(bad.parse::<Revision>(), Err(SyncError::InvalidRevision(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_ordering_generation_then_hash() {
        let a: Revision = "2-ffff".parse().unwrap();
        let b: Revision = "10-0000".parse().unwrap();
        let c: Revision = "10-0001".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(vec![c.clone(), a.clone(), b.clone()].into_iter().max(), Some(c));
    }

    #[test]
    fn test_serde_as_string() {
        let rev: Revision = "1-abc".parse().unwrap();
        assert_eq!(serde_json::to_string(&rev).unwrap(), "\"1-abc\"");
        let back: Revision = serde_json::from_str("\"1-abc\"").unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_str::<Revision>("\"nope\"").is_err());
    }

    #[test]
    fn test_validate_lineage() {
        let lineage: Vec<Revision> = ["3-cc", "2-bb", "1-aa"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert!(validate_lineage(&lineage).is_ok());

        let gap: Vec<Revision> = ["3-cc", "1-aa"].iter().map(|s| s.parse().unwrap()).collect();
        assert!(validate_lineage(&gap).is_err());

        let rootless: Vec<Revision> = ["3-cc", "2-bb"].iter().map(|s| s.parse().unwrap()).collect();
        assert!(validate_lineage(&rootless).is_err());

        assert!(validate_lineage(&[]).is_err());
    }

    #[test]
    fn test_validate_lineage_rejects_max_generation() {
        let lineage: Vec<Revision> = ["5-aa", "18446744073709551615-bb", "1-cc"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert!(matches!(
            validate_lineage(&lineage),
            Err(SyncError::InvalidRevision(_))
        ));
    }

    #[test]
    fn test_no_child_after_max_generation() {
        let last: Revision = "18446744073709551615-bb".parse().unwrap();
        assert!(matches!(
            Revision::compute(Some(&last), false, &Body::new()),
            Err(SyncError::InvalidRevision(_))
        ));
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(&json!({"b": {"d": 1, "c": [true, null]}, "a": "x"}), &mut out);
        assert_eq!(out, r#"{"a":"x","b":{"c":[true,null],"d":1}}"#);
    }
}
