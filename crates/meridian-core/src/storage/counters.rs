//! Counter store
//!
//! Named 64-bit counters attached to documents. Keys are
//! `lower(document id) 0x1E lower(name)`.

use super::{RECORD_SEPARATOR, TxContext};
use crate::Result;
use crate::change_vector::{ChangeVector, ConflictStatus};
use crate::document::lower_id;
use heed::types::*;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Stored counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Owning document id
    pub document_id: String,
    /// Counter name
    pub name: String,
    /// Collection of the owning document
    pub collection: String,
    /// Current value
    pub value: i64,
    /// Change vector of the last write
    pub change_vector: ChangeVector,
    /// Local etag
    pub etag: i64,
}

/// Deleted counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTombstone {
    /// Collection of the owning document
    pub collection: String,
    /// Change vector of the delete
    pub change_vector: ChangeVector,
    /// Delete time in ticks
    pub last_modified_ticks: i64,
    /// Local etag
    pub etag: i64,
}

/// Counters and counter tombstones
pub struct CountersStorage {
    counters: Database<Bytes, SerdeBincode<Counter>>,
    tombstones: Database<Bytes, SerdeBincode<CounterTombstone>>,
}

impl CountersStorage {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> Result<Self> {
        Ok(Self {
            counters: env.create_database(wtxn, Some("counters"))?,
            tombstones: env.create_database(wtxn, Some("counter_tombstones"))?,
        })
    }

    /// Storage key of counter `name` on `document_id`
    pub fn counter_key(document_id: &str, name: &str) -> Vec<u8> {
        let mut key = lower_id(document_id).into_bytes();
        key.push(RECORD_SEPARATOR);
        key.extend_from_slice(name.to_lowercase().as_bytes());
        key
    }

    /// Apply a replicated counter. Overwrites unless the stored change
    /// vector already covers the incoming one; the stored vector is the
    /// merge of both. Returns `true` when the value was written.
    pub fn put_counter(
        &self,
        ctx: &mut TxContext<'_, '_>,
        document_id: &str,
        collection: &str,
        name: &str,
        change_vector: &ChangeVector,
        value: i64,
    ) -> Result<bool> {
        let key = Self::counter_key(document_id, name);
        let merged = match self.counters.get(ctx.txn(), &key)? {
            Some(existing) => {
                if ChangeVector::compare(change_vector, &existing.change_vector)
                    == ConflictStatus::AlreadyMerged
                {
                    debug!(document = %document_id, name = %name, "Counter already merged");
                    return Ok(false);
                }
                existing.change_vector.merge(change_vector)
            }
            None => change_vector.clone(),
        };

        let counter = Counter {
            document_id: document_id.to_string(),
            name: name.to_string(),
            collection: collection.to_string(),
            value,
            change_vector: merged,
            etag: ctx.next_etag(),
        };
        self.tombstones.delete(ctx.txn_mut(), &key)?;
        self.counters.put(ctx.txn_mut(), &key, &counter)?;
        Ok(true)
    }

    /// Local increment; creates the counter when missing
    pub fn increment(
        &self,
        ctx: &mut TxContext<'_, '_>,
        document_id: &str,
        collection: &str,
        name: &str,
        delta: i64,
    ) -> Result<Counter> {
        let key = Self::counter_key(document_id, name);
        let current = self.counters.get(ctx.txn(), &key)?.map(|c| c.value).unwrap_or(0);
        let etag = ctx.next_etag();
        let counter = Counter {
            document_id: document_id.to_string(),
            name: name.to_string(),
            collection: collection.to_string(),
            value: current.saturating_add(delta),
            change_vector: ctx.new_change_vector(etag),
            etag,
        };
        self.tombstones.delete(ctx.txn_mut(), &key)?;
        self.counters.put(ctx.txn_mut(), &key, &counter)?;
        Ok(counter)
    }

    /// Apply a replicated counter delete; the tombstone is always written
    pub fn delete_counter(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &[u8],
        collection: &str,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<()> {
        self.counters.delete(ctx.txn_mut(), key)?;
        let tombstone = CounterTombstone {
            collection: collection.to_string(),
            change_vector: change_vector.clone(),
            last_modified_ticks,
            etag: ctx.next_etag(),
        };
        self.tombstones.put(ctx.txn_mut(), key, &tombstone)?;
        Ok(())
    }

    /// Counter by owner and name
    pub fn get(&self, txn: &RoTxn<'_>, document_id: &str, name: &str) -> Result<Option<Counter>> {
        Ok(self.counters.get(txn, &Self::counter_key(document_id, name))?)
    }

    /// Counter value by owner and name
    pub fn get_counter_value(&self, txn: &RoTxn<'_>, document_id: &str, name: &str) -> Result<Option<i64>> {
        Ok(self.get(txn, document_id, name)?.map(|c| c.value))
    }

    /// Tombstone by key
    pub fn get_tombstone(&self, txn: &RoTxn<'_>, key: &[u8]) -> Result<Option<CounterTombstone>> {
        Ok(self.tombstones.get(txn, key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;

    fn cv(s: &str) -> ChangeVector {
        ChangeVector::parse(s).unwrap()
    }

    #[test]
    fn test_replicated_counter_respects_change_vector() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");
        let counters = &storage.counters;

        let applied = storage
            .write(|tx| counters.put_counter(tx, "users/1", "Users", "likes", &cv("A:5"), 10))
            .unwrap();
        assert!(applied);

        // older write is discarded
        let applied = storage
            .write(|tx| counters.put_counter(tx, "users/1", "Users", "likes", &cv("A:3"), 7))
            .unwrap();
        assert!(!applied);

        // concurrent write overwrites, keeping both vectors
        let applied = storage
            .write(|tx| counters.put_counter(tx, "Users/1", "Users", "Likes", &cv("B:1"), 12))
            .unwrap();
        assert!(applied);

        let rtxn = storage.read_txn().unwrap();
        let counter = counters.get(&rtxn, "users/1", "likes").unwrap().unwrap();
        assert_eq!(counter.value, 12);
        assert_eq!(counter.change_vector, cv("A:5, B:1"));
    }

    #[test]
    fn test_delete_counter_writes_tombstone() {
        let ctx = TestContext::new();
        let storage = ctx.storage("db");
        let counters = &storage.counters;
        let key = CountersStorage::counter_key("users/1", "likes");

        storage
            .write(|tx| {
                counters.increment(tx, "users/1", "Users", "likes", 3)?;
                counters.increment(tx, "users/1", "Users", "likes", 2)
            })
            .unwrap();
        {
            let rtxn = storage.read_txn().unwrap();
            assert_eq!(counters.get_counter_value(&rtxn, "users/1", "likes").unwrap(), Some(5));
        }

        storage
            .write(|tx| counters.delete_counter(tx, &key, "Users", &cv("A:9"), 0))
            .unwrap();

        let rtxn = storage.read_txn().unwrap();
        assert!(counters.get(&rtxn, "users/1", "likes").unwrap().is_none());
        assert!(counters.get_tombstone(&rtxn, &key).unwrap().is_some());
    }
}
