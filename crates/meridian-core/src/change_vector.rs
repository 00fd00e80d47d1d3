//! Change vectors
//!
//! A change vector maps a database instance id to the last local etag that
//! instance produced for a write. Vectors are the causality model of the
//! replication layer: comparing two of them tells whether an incoming write
//! supersedes, conflicts with, or is already covered by the local one.
//!
//! # Wire/storage form
//!
//! ```text
//! <id>:<etag>, <id>:<etag>, ...
//! ```
//!
//! Entries are kept sorted by id, so the string form is canonical and two
//! vectors are equal iff their strings are equal.

use crate::document::DocumentFlags;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Relationship between an incoming write and the existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStatus {
    /// Incoming strictly dominates existing, safe to overwrite
    Update,
    /// Neither side dominates, the writes were concurrent
    Conflict,
    /// Existing already covers incoming, discard
    AlreadyMerged,
    /// Same vector on both sides but the flags disagree
    EqualButFlagsDiffer,
}

/// Causality vector: database id -> etag
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChangeVector {
    entries: BTreeMap<String, i64>,
}

impl ChangeVector {
    /// Create an empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vector holding a single entry
    pub fn single(id: impl Into<String>, etag: i64) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(id.into(), etag);
        Self { entries }
    }

    /// Parse the `<id>:<etag>, ...` form. An empty string is the empty vector.
    pub fn parse(s: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for raw in s.split(',') {
            let entry = raw.trim();
            if entry.is_empty() {
                continue;
            }
            let (id, etag) = entry.rsplit_once(':').ok_or_else(|| {
                Error::serialization(format!("Invalid change vector entry '{}' in '{}'", entry, s))
            })?;
            if id.is_empty() {
                return Err(Error::serialization(format!(
                    "Change vector entry '{}' has an empty id",
                    entry
                )));
            }
            let etag: i64 = etag.parse().map_err(|_| {
                Error::serialization(format!("Invalid etag '{}' in change vector '{}'", etag, s))
            })?;
            let slot = entries.entry(id.to_string()).or_insert(etag);
            if *slot < etag {
                *slot = etag;
            }
        }
        Ok(Self { entries })
    }

    /// Etag recorded for `id`, 0 when absent
    pub fn get(&self, id: &str) -> i64 {
        self.entries.get(id).copied().unwrap_or(0)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the vector has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(id, etag)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(id, etag)| (id.as_str(), *etag))
    }

    /// Per-id maximum of both vectors
    pub fn merge(&self, other: &ChangeVector) -> ChangeVector {
        let mut merged = self.clone();
        merged.merge_in(other);
        merged
    }

    /// In-place merge
    pub fn merge_in(&mut self, other: &ChangeVector) {
        for (id, etag) in &other.entries {
            let slot = self.entries.entry(id.clone()).or_insert(*etag);
            if *slot < *etag {
                *slot = *etag;
            }
        }
    }

    /// Raise the entry for `id` to `etag` (never lowers it)
    pub fn with_entry(mut self, id: &str, etag: i64) -> Self {
        let slot = self.entries.entry(id.to_string()).or_insert(etag);
        if *slot < etag {
            *slot = etag;
        }
        self
    }

    /// Classify `incoming` against `existing`.
    ///
    /// Returns `Update` if `incoming` is ahead on at least one id and behind
    /// on none, `Conflict` if each side is ahead somewhere, `AlreadyMerged`
    /// otherwise (including equal vectors). Ids missing on one side count
    /// as etag 0 there.
    pub fn compare(incoming: &ChangeVector, existing: &ChangeVector) -> ConflictStatus {
        let incoming_ahead = incoming.is_ahead_of(existing);
        let existing_ahead = existing.is_ahead_of(incoming);

        match (incoming_ahead, existing_ahead) {
            (true, true) => ConflictStatus::Conflict,
            (true, false) => ConflictStatus::Update,
            (false, _) => ConflictStatus::AlreadyMerged,
        }
    }

    fn is_ahead_of(&self, other: &ChangeVector) -> bool {
        self.entries
            .iter()
            .any(|(id, etag)| *etag > other.get(id))
    }
}

/// Conflict status against an optional existing vector; no existing write
/// means the incoming one is dominant.
pub fn conflict_status(incoming: &ChangeVector, existing: Option<&ChangeVector>) -> ConflictStatus {
    match existing {
        None => ConflictStatus::Update,
        Some(existing) => ChangeVector::compare(incoming, existing),
    }
}

/// Flags-aware comparison used for immutable rows: equal vectors whose flags
/// differ are reported as `EqualButFlagsDiffer` instead of `AlreadyMerged`.
pub fn compare_with_flags(
    incoming: &ChangeVector,
    incoming_flags: DocumentFlags,
    existing: &ChangeVector,
    existing_flags: DocumentFlags,
) -> ConflictStatus {
    if incoming == existing && incoming_flags != existing_flags {
        return ConflictStatus::EqualButFlagsDiffer;
    }
    ChangeVector::compare(incoming, existing)
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (id, etag)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}:{}", id, etag)?;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<ChangeVector> for String {
    fn from(cv: ChangeVector) -> Self {
        cv.to_string()
    }
}

impl TryFrom<String> for ChangeVector {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cv(s: &str) -> ChangeVector {
        ChangeVector::parse(s).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let v = cv("B:3, A:5");
        assert_eq!(v.get("A"), 5);
        assert_eq!(v.get("B"), 3);
        assert_eq!(v.get("C"), 0);
        assert_eq!(v.to_string(), "A:5, B:3");
        assert!(cv("").is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChangeVector::parse("A5").is_err());
        assert!(ChangeVector::parse(":5").is_err());
        assert!(ChangeVector::parse("A:x").is_err());
    }

    #[test]
    fn test_dominance() {
        // neither dominates
        assert_eq!(
            ChangeVector::compare(&cv("A:5"), &cv("A:3, B:1")),
            ConflictStatus::Conflict
        );
        // a dominates b
        assert_eq!(
            ChangeVector::compare(&cv("A:5, B:1"), &cv("A:3, B:1")),
            ConflictStatus::Update
        );
        // b dominates a
        assert_eq!(
            ChangeVector::compare(&cv("A:3, B:1"), &cv("A:5, B:1")),
            ConflictStatus::AlreadyMerged
        );
        // one-sided entry counts as being ahead
        assert_eq!(
            ChangeVector::compare(&cv("A:1, C:1"), &cv("A:1")),
            ConflictStatus::Update
        );
    }

    #[test]
    fn test_conflict_status_without_existing() {
        assert_eq!(conflict_status(&cv("A:1"), None), ConflictStatus::Update);
    }

    #[test]
    fn test_compare_with_flags() {
        let a = cv("A:1");
        assert_eq!(
            compare_with_flags(&a, DocumentFlags::REVISION, &a, DocumentFlags::REVISION),
            ConflictStatus::AlreadyMerged
        );
        assert_eq!(
            compare_with_flags(
                &a,
                DocumentFlags::REVISION | DocumentFlags::CONFLICTED,
                &a,
                DocumentFlags::REVISION
            ),
            ConflictStatus::EqualButFlagsDiffer
        );
    }

    #[test]
    fn test_serde_as_string() {
        let v = cv("A:1, B:2");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"A:1, B:2\"");
        let back: ChangeVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    fn arb_vector() -> impl Strategy<Value = ChangeVector> {
        prop::collection::btree_map("[A-E]", 0i64..50, 0..5)
            .prop_map(|entries| ChangeVector { entries })
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_vector(), b in arb_vector()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn merge_is_associative(a in arb_vector(), b in arb_vector(), c in arb_vector()) {
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        }

        #[test]
        fn merge_is_idempotent(a in arb_vector()) {
            prop_assert_eq!(a.merge(&a), a);
        }

        #[test]
        fn self_comparison_is_already_merged(a in arb_vector()) {
            prop_assert_eq!(ChangeVector::compare(&a, &a), ConflictStatus::AlreadyMerged);
        }

        #[test]
        fn merged_vector_covers_both_sides(a in arb_vector(), b in arb_vector()) {
            let m = a.merge(&b);
            prop_assert_eq!(ChangeVector::compare(&a, &m), ConflictStatus::AlreadyMerged);
            prop_assert_eq!(ChangeVector::compare(&b, &m), ConflictStatus::AlreadyMerged);
        }

        #[test]
        fn string_form_round_trips(a in arb_vector()) {
            prop_assert_eq!(ChangeVector::parse(&a.to_string()).unwrap(), a);
        }
    }
}
