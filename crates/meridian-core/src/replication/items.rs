//! Replicated item model
//!
//! One [`ReplicationItem`] per wire item. The kind is a closed set, so the
//! codec and the resolver both match on [`ItemPayload`] exhaustively.

use crate::change_vector::ChangeVector;
use crate::document::DocumentFlags;
use crate::{Error, Result};

/// Wire type tag preceding every item
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// Live document
    Document = 1,
    /// Document tombstone
    DocumentTombstone = 2,
    /// Attachment descriptor
    Attachment = 3,
    /// Attachment content, sent after all items of the batch
    AttachmentStream = 4,
    /// Attachment delete
    AttachmentTombstone = 5,
    /// Revision delete
    RevisionTombstone = 6,
    /// Counter value
    Counter = 7,
    /// Counter delete
    CounterTombstone = 8,
}

impl TryFrom<u8> for ItemType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Document),
            2 => Ok(Self::DocumentTombstone),
            3 => Ok(Self::Attachment),
            4 => Ok(Self::AttachmentStream),
            5 => Ok(Self::AttachmentTombstone),
            6 => Ok(Self::RevisionTombstone),
            7 => Ok(Self::Counter),
            8 => Ok(Self::CounterTombstone),
            _ => Err(Error::protocol(format!("Unknown item type: {}", value))),
        }
    }
}

/// A document or document tombstone as sent by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedDocument {
    /// Document id
    pub id: String,
    /// Modification time in ticks
    pub last_modified_ticks: i64,
    /// Flags; `FROM_REPLICATION` is added on receipt
    pub flags: DocumentFlags,
    /// JSON body, `None` for tombstones
    pub body: Option<Vec<u8>>,
    /// Collection, only sent for tombstones
    pub collection: Option<String>,
}

impl ReplicatedDocument {
    /// True when the item carries no body
    pub fn is_tombstone(&self) -> bool {
        self.body.is_none()
    }
}

/// Attachment descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedAttachment {
    /// Lowered attachment key (document id, separator, name)
    pub key: Vec<u8>,
    /// Attachment name
    pub name: String,
    /// MIME type
    pub content_type: String,
    /// Base64 content hash
    pub hash: String,
}

/// Attachment delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedAttachmentTombstone {
    /// Attachment key
    pub key: Vec<u8>,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
}

/// Revision delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedRevisionTombstone {
    /// Change vector of the deleted revision
    pub key: String,
    /// Collection of the deleted revision
    pub collection: String,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
}

/// Counter value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedCounter {
    /// Owning document id
    pub document_id: String,
    /// Collection of the owning document
    pub collection: String,
    /// Counter name
    pub name: String,
    /// Value
    pub value: i64,
}

/// Counter delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedCounterTombstone {
    /// Counter key
    pub key: Vec<u8>,
    /// Collection of the owning document
    pub collection: String,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
}

/// Kind-specific part of an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPayload {
    /// Live document (a body of size -1 still decodes as a delete)
    Document(ReplicatedDocument),
    /// Document tombstone
    DocumentTombstone(ReplicatedDocument),
    /// Attachment descriptor
    Attachment(ReplicatedAttachment),
    /// Attachment delete
    AttachmentTombstone(ReplicatedAttachmentTombstone),
    /// Revision delete
    RevisionTombstone(ReplicatedRevisionTombstone),
    /// Counter value
    Counter(ReplicatedCounter),
    /// Counter delete
    CounterTombstone(ReplicatedCounterTombstone),
}

impl ItemPayload {
    /// Wire tag of the payload
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::Document(_) => ItemType::Document,
            Self::DocumentTombstone(_) => ItemType::DocumentTombstone,
            Self::Attachment(_) => ItemType::Attachment,
            Self::AttachmentTombstone(_) => ItemType::AttachmentTombstone,
            Self::RevisionTombstone(_) => ItemType::RevisionTombstone,
            Self::Counter(_) => ItemType::Counter,
            Self::CounterTombstone(_) => ItemType::CounterTombstone,
        }
    }
}

/// One item of a replication batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationItem {
    /// Source transaction marker; items sharing it were committed together
    pub transaction_marker: i16,
    /// Change vector as sent, empty when the peer sent none
    pub change_vector: String,
    /// Kind-specific fields
    pub payload: ItemPayload,
}

impl ReplicationItem {
    /// Build an item
    pub fn new(change_vector: impl Into<String>, transaction_marker: i16, payload: ItemPayload) -> Self {
        Self {
            transaction_marker,
            change_vector: change_vector.into(),
            payload,
        }
    }

    /// Wire tag of the item
    pub fn item_type(&self) -> ItemType {
        self.payload.item_type()
    }

    /// Parsed change vector
    pub fn parsed_change_vector(&self) -> Result<ChangeVector> {
        ChangeVector::parse(&self.change_vector)
    }

    /// Body size for documents, 0 for everything else
    pub fn document_size(&self) -> usize {
        match &self.payload {
            ItemPayload::Document(doc) | ItemPayload::DocumentTombstone(doc) => {
                doc.body.as_ref().map_or(0, Vec::len)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_type_tags() {
        for tag in 1u8..=8 {
            let item_type = ItemType::try_from(tag).unwrap();
            assert_eq!(item_type as u8, tag);
        }
        assert!(ItemType::try_from(0).is_err());
        assert!(ItemType::try_from(9).is_err());
    }

    #[test]
    fn test_document_size() {
        let item = ReplicationItem::new(
            "A:1",
            1,
            ItemPayload::Document(ReplicatedDocument {
                id: "users/1".into(),
                last_modified_ticks: 0,
                flags: DocumentFlags::NONE,
                body: Some(b"{}".to_vec()),
                collection: None,
            }),
        );
        assert_eq!(item.document_size(), 2);
        assert_eq!(item.item_type(), ItemType::Document);
        assert_eq!(item.parsed_change_vector().unwrap().get("A"), 1);
    }
}
