//! Document model shared by the stores, the resolver and the wire codec

use crate::change_vector::ChangeVector;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::{BitOr, BitOrAssign};

/// Metadata object key inside a document body
pub const METADATA_KEY: &str = "@metadata";
/// Collection name inside the metadata object
pub const METADATA_COLLECTION: &str = "@collection";
/// Attachment descriptors inside the metadata object
pub const METADATA_ATTACHMENTS: &str = "@attachments";
/// Collection used when a body carries no collection
pub const EMPTY_COLLECTION: &str = "@empty";

/// Document flag bitset, persisted and sent over the wire as a 32-bit integer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentFlags(u32);

impl DocumentFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// The document has a revision chain
    pub const HAS_REVISIONS: Self = Self(1 << 1);
    /// Revision row created by a delete
    pub const DELETE_REVISION: Self = Self(1 << 2);
    /// Revision row
    pub const REVISION: Self = Self(1 << 3);
    /// The document has attachments
    pub const HAS_ATTACHMENTS: Self = Self(1 << 4);
    /// Produced by a concurrent write on two nodes
    pub const CONFLICTED: Self = Self(1 << 5);
    /// Result of a local conflict resolution
    pub const RESOLVED: Self = Self(1 << 6);
    /// Artificial (computed) document, never replicated
    pub const ARTIFICIAL: Self = Self(1 << 7);
    /// Written by a cluster-wide transaction
    pub const FROM_CLUSTER_TRANSACTION: Self = Self(1 << 8);
    /// Received through replication
    pub const FROM_REPLICATION: Self = Self(1 << 9);
    /// The document has counters
    pub const HAS_COUNTERS: Self = Self(1 << 10);

    /// Build from raw bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True if every bit of `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Copy with the bits of `other` cleared
    pub const fn strip(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// True when no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DocumentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DocumentFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Where a mutation comes from. Threaded explicitly through the document
/// store calls instead of being ambient state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A local client write: new etag, new change vector, may version
    Local,
    /// Applied from an incoming replication batch
    Replication,
}

/// A live document
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Id as written by the client
    pub id: String,
    /// Case-folded id, the storage key
    pub lower_id: String,
    /// Local insertion order
    pub etag: i64,
    /// Causality vector of the write
    pub change_vector: ChangeVector,
    /// Modification time in ticks
    pub last_modified_ticks: i64,
    /// Flags
    pub flags: DocumentFlags,
    /// Collection name
    pub collection: String,
    /// Groups items committed together at the source
    pub transaction_marker: i16,
    /// JSON body
    pub body: Value,
}

/// Logical delete marker for a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentTombstone {
    /// Id as written by the client
    pub id: String,
    /// Case-folded id
    pub lower_id: String,
    /// Etag of the tombstone itself
    pub etag: i64,
    /// Etag of the document that was deleted (0 if it never existed locally)
    pub deleted_etag: i64,
    /// Causality vector of the delete
    pub change_vector: ChangeVector,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
    /// Flags carried by the delete
    pub flags: DocumentFlags,
    /// Collection of the deleted document
    pub collection: String,
    /// Transaction marker of the delete
    pub transaction_marker: i16,
}

/// Either side of a document lookup
#[derive(Debug, Clone)]
pub enum DocumentOrTombstone {
    /// Live document
    Document(Document),
    /// Deleted document
    Tombstone(DocumentTombstone),
}

impl DocumentOrTombstone {
    /// Change vector of whichever side was found
    pub fn change_vector(&self) -> &ChangeVector {
        match self {
            Self::Document(doc) => &doc.change_vector,
            Self::Tombstone(tombstone) => &tombstone.change_vector,
        }
    }

    /// Flags of whichever side was found
    pub fn flags(&self) -> DocumentFlags {
        match self {
            Self::Document(doc) => doc.flags,
            Self::Tombstone(tombstone) => tombstone.flags,
        }
    }
}

/// Case-fold a document id
pub fn lower_id(id: &str) -> String {
    id.to_lowercase()
}

/// Collection named in `@metadata.@collection`, or `@empty`
pub fn collection_of(body: &Value) -> String {
    body.get(METADATA_KEY)
        .and_then(|m| m.get(METADATA_COLLECTION))
        .and_then(Value::as_str)
        .unwrap_or(EMPTY_COLLECTION)
        .to_string()
}

/// Attachment hashes listed in `@metadata.@attachments[].Hash`
pub fn attachment_hashes(body: &Value) -> Vec<String> {
    body.get(METADATA_KEY)
        .and_then(|m| m.get(METADATA_ATTACHMENTS))
        .and_then(Value::as_array)
        .map(|attachments| {
            attachments
                .iter()
                .filter_map(|a| a.get("Hash").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Body written into delete revisions: only the collection metadata
pub fn delete_marker_body(collection: &str) -> Value {
    serde_json::json!({ METADATA_KEY: { METADATA_COLLECTION: collection } })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flags() {
        let flags = DocumentFlags::REVISION | DocumentFlags::FROM_REPLICATION;
        assert!(flags.contains(DocumentFlags::REVISION));
        assert!(!flags.contains(DocumentFlags::CONFLICTED));
        let stripped = flags.strip(DocumentFlags::FROM_REPLICATION);
        assert_eq!(stripped, DocumentFlags::REVISION);
        assert_eq!(DocumentFlags::from_bits(flags.bits()), flags);
        assert!(DocumentFlags::NONE.is_empty());
    }

    #[test]
    fn test_collection_of() {
        let body = json!({"Name": "x", "@metadata": {"@collection": "Users"}});
        assert_eq!(collection_of(&body), "Users");
        assert_eq!(collection_of(&json!({"Name": "y"})), EMPTY_COLLECTION);
        assert_eq!(collection_of(&delete_marker_body("Orders")), "Orders");
    }

    #[test]
    fn test_attachment_hashes() {
        let body = json!({
            "@metadata": {
                "@attachments": [
                    {"Name": "a.txt", "Hash": "h1"},
                    {"Name": "b.txt", "Hash": "h2"}
                ]
            }
        });
        assert_eq!(attachment_hashes(&body), vec!["h1", "h2"]);
        assert!(attachment_hashes(&json!({})).is_empty());
    }

    #[test]
    fn test_lower_id() {
        assert_eq!(lower_id("Users/1-A"), "users/1-a");
    }
}
