//! Document store
//!
//! Live documents and their tombstones, keyed by case-folded id. A put
//! removes the tombstone of the same id and a delete removes the document,
//! so at most one of the two exists per id.

use super::TxContext;
use crate::change_vector::ChangeVector;
use crate::document::{
    Document, DocumentFlags, DocumentOrTombstone, DocumentTombstone, EMPTY_COLLECTION, Origin,
    collection_of, delete_marker_body, lower_id,
};
use crate::time::Clock;
use crate::{Error, Result};
use heed::types::*;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    id: String,
    etag: i64,
    change_vector: ChangeVector,
    last_modified_ticks: i64,
    flags: DocumentFlags,
    collection: String,
    transaction_marker: i16,
    body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TombstoneRecord {
    id: String,
    etag: i64,
    deleted_etag: i64,
    change_vector: ChangeVector,
    last_modified_ticks: i64,
    flags: DocumentFlags,
    collection: String,
    transaction_marker: i16,
}

/// Result of a document put
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    /// Etag of the stored document
    pub etag: i64,
    /// Change vector of the stored document
    pub change_vector: ChangeVector,
    /// Flags of the stored document
    pub flags: DocumentFlags,
}

/// Result of a document delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Etag of the tombstone
    pub etag: i64,
    /// Change vector of the tombstone
    pub change_vector: ChangeVector,
    /// Collection of the deleted document
    pub collection: String,
}

/// Documents and document tombstones
pub struct DocumentsStorage {
    documents: Database<Str, SerdeBincode<DocumentRecord>>,
    tombstones: Database<Str, SerdeBincode<TombstoneRecord>>,
    clock: Arc<dyn Clock>,
}

impl DocumentsStorage {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>, clock: Arc<dyn Clock>) -> Result<Self> {
        let documents = env.create_database(wtxn, Some("documents"))?;
        let tombstones = env.create_database(wtxn, Some("document_tombstones"))?;
        Ok(Self {
            documents,
            tombstones,
            clock,
        })
    }

    /// Live document by id
    pub fn get(&self, txn: &RoTxn<'_>, id: &str) -> Result<Option<Document>> {
        let lower = lower_id(id);
        match self.documents.get(txn, &lower)? {
            Some(record) => Ok(Some(into_document(lower, record)?)),
            None => Ok(None),
        }
    }

    /// Tombstone by id
    pub fn get_tombstone(&self, txn: &RoTxn<'_>, id: &str) -> Result<Option<DocumentTombstone>> {
        let lower = lower_id(id);
        Ok(self
            .tombstones
            .get(txn, &lower)?
            .map(|record| into_tombstone(lower, record)))
    }

    /// Document if live, else its tombstone
    pub fn get_document_or_tombstone(
        &self,
        txn: &RoTxn<'_>,
        id: &str,
    ) -> Result<Option<DocumentOrTombstone>> {
        if let Some(doc) = self.get(txn, id)? {
            return Ok(Some(DocumentOrTombstone::Document(doc)));
        }
        Ok(self
            .get_tombstone(txn, id)?
            .map(DocumentOrTombstone::Tombstone))
    }

    /// Number of live documents
    pub fn count(&self, txn: &RoTxn<'_>) -> Result<u64> {
        Ok(self.documents.len(txn)?)
    }

    /// Number of tombstones
    pub fn tombstones_count(&self, txn: &RoTxn<'_>) -> Result<u64> {
        Ok(self.tombstones.len(txn)?)
    }

    /// Store a document.
    ///
    /// `Origin::Local` allocates a new change vector (merged with
    /// `change_vector` when given) and versions the document when the
    /// revisions configuration asks for it. `Origin::Replication` stores the
    /// given vector as is and never versions here: replicated revisions
    /// arrive as their own items.
    pub fn put(
        &self,
        ctx: &mut TxContext<'_, '_>,
        id: &str,
        body: &Value,
        flags: DocumentFlags,
        origin: Origin,
        change_vector: Option<&ChangeVector>,
        last_modified_ticks: Option<i64>,
    ) -> Result<PutOutcome> {
        let lower = lower_id(id);
        let existing = self.documents.get(ctx.txn(), &lower)?;
        let etag = ctx.next_etag();
        let change_vector = self.write_change_vector(ctx, etag, origin, change_vector)?;
        let last_modified_ticks = last_modified_ticks.unwrap_or_else(|| self.clock.now_ticks());
        let collection = collection_of(body);

        let mut flags = match origin {
            Origin::Local => flags.strip(DocumentFlags::FROM_REPLICATION),
            Origin::Replication => flags | DocumentFlags::FROM_REPLICATION,
        };
        if existing
            .as_ref()
            .is_some_and(|e| e.flags.contains(DocumentFlags::HAS_REVISIONS))
        {
            flags |= DocumentFlags::HAS_REVISIONS;
        }

        if origin == Origin::Local {
            let storage = ctx.storage();
            let existing_body = existing.as_ref().map(|e| e.body.as_slice());
            if storage
                .revisions
                .should_version_document(ctx, id, &collection, flags, existing_body, body)?
            {
                flags |= DocumentFlags::HAS_REVISIONS;
                storage.revisions.put(
                    ctx,
                    id,
                    body,
                    flags,
                    &change_vector,
                    last_modified_ticks,
                    None,
                )?;
            } else if !storage.revisions.has_revisions(ctx.txn(), id)? {
                flags = flags.strip(DocumentFlags::HAS_REVISIONS);
            }
        }

        self.tombstones.delete(ctx.txn_mut(), &lower)?;
        let record = DocumentRecord {
            id: id.to_string(),
            etag,
            change_vector: change_vector.clone(),
            last_modified_ticks,
            flags,
            collection,
            transaction_marker: ctx.transaction_marker(),
            body: serde_json::to_vec(body)?,
        };
        self.documents.put(ctx.txn_mut(), &lower, &record)?;

        debug!(id = %id, etag, change_vector = %change_vector, ?origin, "Document stored");
        Ok(PutOutcome {
            etag,
            change_vector,
            flags,
        })
    }

    /// Delete a document, leaving a tombstone.
    ///
    /// A local delete of an id that does not exist is a no-op and returns
    /// `None`. A replicated delete always writes the tombstone so the
    /// causality of the delete is not lost.
    pub fn delete(
        &self,
        ctx: &mut TxContext<'_, '_>,
        id: &str,
        origin: Origin,
        change_vector: Option<&ChangeVector>,
        last_modified_ticks: Option<i64>,
        collection: Option<&str>,
        flags: DocumentFlags,
    ) -> Result<Option<DeleteOutcome>> {
        let lower = lower_id(id);
        let existing = self.documents.get(ctx.txn(), &lower)?;
        if existing.is_none() && origin == Origin::Local {
            return Ok(None);
        }

        let etag = ctx.next_etag();
        let change_vector = self.write_change_vector(ctx, etag, origin, change_vector)?;
        let last_modified_ticks = last_modified_ticks.unwrap_or_else(|| self.clock.now_ticks());
        let collection = existing
            .as_ref()
            .map(|e| e.collection.clone())
            .or_else(|| collection.map(str::to_string))
            .unwrap_or_else(|| EMPTY_COLLECTION.to_string());

        let mut flags = match origin {
            Origin::Local => flags.strip(DocumentFlags::FROM_REPLICATION),
            Origin::Replication => flags | DocumentFlags::FROM_REPLICATION,
        };
        flags = flags.strip(DocumentFlags::HAS_ATTACHMENTS | DocumentFlags::HAS_COUNTERS);
        if let Some(existing) = &existing {
            if existing.flags.contains(DocumentFlags::HAS_REVISIONS) {
                flags |= DocumentFlags::HAS_REVISIONS;
            }
        }

        if origin == Origin::Local {
            let storage = ctx.storage();
            let versioned = flags.contains(DocumentFlags::HAS_REVISIONS)
                || flags.contains(DocumentFlags::RESOLVED)
                || (storage.revisions.configuration().is_some()
                    && !storage
                        .revisions
                        .get_revisions_configuration(&collection, flags)
                        .disabled);
            if versioned {
                storage.revisions.delete(
                    ctx,
                    id,
                    &delete_marker_body(&collection),
                    flags,
                    &change_vector,
                    last_modified_ticks,
                    Origin::Local,
                )?;
            }
        }

        self.documents.delete(ctx.txn_mut(), &lower)?;
        let record = TombstoneRecord {
            id: id.to_string(),
            etag,
            deleted_etag: existing.as_ref().map(|e| e.etag).unwrap_or(0),
            change_vector: change_vector.clone(),
            last_modified_ticks,
            flags,
            collection: collection.clone(),
            transaction_marker: ctx.transaction_marker(),
        };
        self.tombstones.put(ctx.txn_mut(), &lower, &record)?;

        debug!(id = %id, etag, change_vector = %change_vector, ?origin, "Document deleted");
        Ok(Some(DeleteOutcome {
            etag,
            change_vector,
            collection,
        }))
    }

    fn write_change_vector(
        &self,
        ctx: &mut TxContext<'_, '_>,
        etag: i64,
        origin: Origin,
        change_vector: Option<&ChangeVector>,
    ) -> Result<ChangeVector> {
        match origin {
            Origin::Local => {
                let mut cv = ctx.new_change_vector(etag);
                if let Some(given) = change_vector {
                    cv.merge_in(given);
                    ctx.merge_database_change_vector(given);
                }
                Ok(cv)
            }
            Origin::Replication => {
                let cv = change_vector.cloned().ok_or_else(|| {
                    Error::internal("Replicated writes must carry a change vector")
                })?;
                ctx.merge_database_change_vector(&cv);
                Ok(cv)
            }
        }
    }
}

fn into_document(lower_id: String, record: DocumentRecord) -> Result<Document> {
    let body = serde_json::from_slice(&record.body)
        .map_err(|e| Error::storage(format!("Corrupt document body for '{}': {}", record.id, e)))?;
    Ok(Document {
        id: record.id,
        lower_id,
        etag: record.etag,
        change_vector: record.change_vector,
        last_modified_ticks: record.last_modified_ticks,
        flags: record.flags,
        collection: record.collection,
        transaction_marker: record.transaction_marker,
        body,
    })
}

fn into_tombstone(lower_id: String, record: TombstoneRecord) -> DocumentTombstone {
    DocumentTombstone {
        id: record.id,
        lower_id,
        etag: record.etag,
        deleted_etag: record.deleted_etag,
        change_vector: record.change_vector,
        last_modified_ticks: record.last_modified_ticks,
        flags: record.flags,
        collection: record.collection,
        transaction_marker: record.transaction_marker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RevisionsCollectionConfiguration, RevisionsConfiguration};
    use crate::storage::Storage;
    use crate::testing::TestContext;
    use serde_json::json;

    fn cv(s: &str) -> ChangeVector {
        ChangeVector::parse(s).unwrap()
    }

    #[test]
    fn test_local_put_assigns_etag_and_change_vector() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");

        let outcome = storage
            .write(|tx| {
                storage.documents.put(
                    tx,
                    "Users/1",
                    &json!({"Name": "Oren", "@metadata": {"@collection": "Users"}}),
                    DocumentFlags::NONE,
                    Origin::Local,
                    None,
                    None,
                )
            })
            .unwrap();
        assert_eq!(outcome.etag, 1);
        assert_eq!(outcome.change_vector.get(storage.database_id()), 1);

        let rtxn = storage.read_txn().unwrap();
        let doc = storage.documents.get(&rtxn, "users/1").unwrap().unwrap();
        assert_eq!(doc.id, "Users/1");
        assert_eq!(doc.collection, "Users");
        assert_eq!(doc.body["Name"], "Oren");
        assert!(!doc.flags.contains(DocumentFlags::HAS_REVISIONS));
    }

    #[test]
    fn test_replicated_put_keeps_change_vector() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");

        storage
            .write(|tx| {
                storage.documents.put(
                    tx,
                    "doc/1",
                    &json!({}),
                    DocumentFlags::NONE,
                    Origin::Replication,
                    Some(&cv("A:7")),
                    Some(100),
                )
            })
            .unwrap();

        let rtxn = storage.read_txn().unwrap();
        let doc = storage.documents.get(&rtxn, "doc/1").unwrap().unwrap();
        assert_eq!(doc.change_vector, cv("A:7"));
        assert_eq!(doc.last_modified_ticks, 100);
        assert!(doc.flags.contains(DocumentFlags::FROM_REPLICATION));
        assert_eq!(storage.database_change_vector(&rtxn).unwrap().get("A"), 7);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");

        storage
            .write(|tx| {
                storage.documents.put(
                    tx,
                    "doc/1",
                    &json!({"@metadata": {"@collection": "Orders"}}),
                    DocumentFlags::NONE,
                    Origin::Local,
                    None,
                    None,
                )
            })
            .unwrap();
        let deleted = storage
            .write(|tx| {
                storage.documents.delete(
                    tx,
                    "doc/1",
                    Origin::Local,
                    None,
                    None,
                    None,
                    DocumentFlags::NONE,
                )
            })
            .unwrap()
            .unwrap();
        assert_eq!(deleted.collection, "Orders");

        let rtxn = storage.read_txn().unwrap();
        assert!(storage.documents.get(&rtxn, "doc/1").unwrap().is_none());
        let tombstone = storage.documents.get_tombstone(&rtxn, "doc/1").unwrap().unwrap();
        assert_eq!(tombstone.deleted_etag, 1);
        assert_eq!(tombstone.etag, 2);
        assert!(matches!(
            storage.documents.get_document_or_tombstone(&rtxn, "doc/1").unwrap(),
            Some(DocumentOrTombstone::Tombstone(_))
        ));
    }

    #[test]
    fn test_local_delete_of_missing_document_is_noop() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");

        let deleted = storage
            .write(|tx| {
                storage.documents.delete(
                    tx,
                    "missing",
                    Origin::Local,
                    None,
                    None,
                    None,
                    DocumentFlags::NONE,
                )
            })
            .unwrap();
        assert!(deleted.is_none());
    }

    #[test]
    fn test_local_put_versions_when_configured() {
        let ctx = TestContext::new();
        let config = ctx.database_config("db").with_revisions(
            RevisionsConfiguration::with_default(RevisionsCollectionConfiguration::enabled()),
        );
        let storage = Storage::open(&config, ctx.clock()).unwrap();

        for name in ["a", "b", "b"] {
            storage
                .write(|tx| {
                    storage.documents.put(
                        tx,
                        "doc/1",
                        &json!({"Name": name}),
                        DocumentFlags::NONE,
                        Origin::Local,
                        None,
                        None,
                    )
                })
                .unwrap();
        }

        let rtxn = storage.read_txn().unwrap();
        let doc = storage.documents.get(&rtxn, "doc/1").unwrap().unwrap();
        assert!(doc.flags.contains(DocumentFlags::HAS_REVISIONS));
        // unchanged body does not create a revision
        assert_eq!(storage.revisions.revisions_count(&rtxn, "doc/1").unwrap(), 2);
    }
}
