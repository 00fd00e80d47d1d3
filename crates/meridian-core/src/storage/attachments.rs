//! Attachment store
//!
//! Descriptors are keyed by the replicated attachment key; content is
//! deduplicated by hash (base64 of the SHA-256 of the bytes).

use super::TxContext;
use crate::change_vector::ChangeVector;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use heed::types::*;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Attachment descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment name
    pub name: String,
    /// MIME type
    pub content_type: String,
    /// Content hash
    pub hash: String,
    /// Change vector of the write
    pub change_vector: ChangeVector,
    /// Local etag
    pub etag: i64,
}

/// Deleted attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentTombstone {
    /// Etag of the tombstone
    pub etag: i64,
    /// Change vector of the delete
    pub change_vector: ChangeVector,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
    /// Transaction marker of the delete
    pub transaction_marker: i16,
}

/// Attachment descriptors, blobs and tombstones
pub struct AttachmentsStorage {
    attachments: Database<Bytes, SerdeBincode<Attachment>>,
    blobs: Database<Str, Bytes>,
    tombstones: Database<Bytes, SerdeBincode<AttachmentTombstone>>,
}

impl AttachmentsStorage {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> Result<Self> {
        Ok(Self {
            attachments: env.create_database(wtxn, Some("attachments"))?,
            blobs: env.create_database(wtxn, Some("attachment_blobs"))?,
            tombstones: env.create_database(wtxn, Some("attachment_tombstones"))?,
        })
    }

    /// Base64 SHA-256 of `content`
    pub fn compute_hash(content: &[u8]) -> String {
        STANDARD.encode(Sha256::digest(content))
    }

    /// Store a replicated descriptor, replacing any tombstone for the key
    pub fn put_direct(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &[u8],
        name: &str,
        content_type: &str,
        hash: &str,
        change_vector: &ChangeVector,
    ) -> Result<i64> {
        let etag = ctx.next_etag();
        let attachment = Attachment {
            name: name.to_string(),
            content_type: content_type.to_string(),
            hash: hash.to_string(),
            change_vector: change_vector.clone(),
            etag,
        };
        self.tombstones.delete(ctx.txn_mut(), key)?;
        self.attachments.put(ctx.txn_mut(), key, &attachment)?;
        debug!(name = %name, hash = %hash, etag, "Attachment stored");
        Ok(etag)
    }

    /// Store content under `hash` after checking it matches
    pub fn put_stream(&self, ctx: &mut TxContext<'_, '_>, hash: &str, content: &[u8]) -> Result<()> {
        let actual = Self::compute_hash(content);
        if actual != hash {
            return Err(Error::serialization(format!(
                "Attachment stream hash mismatch: declared '{}' but content hashes to '{}'",
                hash, actual
            )));
        }
        self.blobs.put(ctx.txn_mut(), hash, content)?;
        Ok(())
    }

    /// True when content for `hash` is stored
    pub fn exists(&self, txn: &RoTxn<'_>, hash: &str) -> Result<bool> {
        Ok(self.blobs.get(txn, hash)?.is_some())
    }

    /// Descriptor by key
    pub fn get(&self, txn: &RoTxn<'_>, key: &[u8]) -> Result<Option<Attachment>> {
        Ok(self.attachments.get(txn, key)?)
    }

    /// Content by hash
    pub fn get_content(&self, txn: &RoTxn<'_>, hash: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(txn, hash)?.map(<[u8]>::to_vec))
    }

    /// Tombstone by key
    pub fn get_tombstone(&self, txn: &RoTxn<'_>, key: &[u8]) -> Result<Option<AttachmentTombstone>> {
        Ok(self.tombstones.get(txn, key)?)
    }

    /// Apply a replicated attachment delete. The blob stays: other
    /// descriptors and revisions may share it.
    pub fn delete_direct(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &[u8],
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<()> {
        self.attachments.delete(ctx.txn_mut(), key)?;
        let tombstone = AttachmentTombstone {
            etag: ctx.next_etag(),
            change_vector: change_vector.clone(),
            last_modified_ticks,
            transaction_marker: ctx.transaction_marker(),
        };
        self.tombstones.put(ctx.txn_mut(), key, &tombstone)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    #[test]
    fn test_put_and_delete() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");
        let content = b"hello world";
        let hash = AttachmentsStorage::compute_hash(content);
        let cv = ChangeVector::single("A", 3);

        storage
            .write(|tx| {
                storage
                    .attachments
                    .put_direct(tx, b"doc/1\x1ea.txt", "a.txt", "text/plain", &hash, &cv)?;
                storage.attachments.put_stream(tx, &hash, content)
            })
            .unwrap();

        {
            let rtxn = storage.read_txn().unwrap();
            assert!(storage.attachments.exists(&rtxn, &hash).unwrap());
            let attachment = storage.attachments.get(&rtxn, b"doc/1\x1ea.txt").unwrap().unwrap();
            assert_eq!(attachment.content_type, "text/plain");
            assert_eq!(
                storage.attachments.get_content(&rtxn, &hash).unwrap().unwrap(),
                content
            );
        }

        storage
            .write(|tx| storage.attachments.delete_direct(tx, b"doc/1\x1ea.txt", &cv, 0))
            .unwrap();

        let rtxn = storage.read_txn().unwrap();
        assert!(storage.attachments.get(&rtxn, b"doc/1\x1ea.txt").unwrap().is_none());
        assert!(storage.attachments.get_tombstone(&rtxn, b"doc/1\x1ea.txt").unwrap().is_some());
        assert!(storage.attachments.exists(&rtxn, &hash).unwrap());
    }

    #[test]
    fn test_put_stream_rejects_wrong_hash() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");

        let result = storage.write(|tx| storage.attachments.put_stream(tx, "bogus", b"content"));
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_hash_is_base64_sha256() {
        assert_eq!(
            AttachmentsStorage::compute_hash(b""),
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }
}
