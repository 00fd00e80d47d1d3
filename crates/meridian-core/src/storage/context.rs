//! Write-transaction context
//!
//! Every mutation runs inside a `TxContext`. It wraps the LMDB write
//! transaction and caches the database-wide counters that many operations
//! touch (last etag, database change vector, last replicated etag per source)
//! so they are read once and written once, right before commit.

use super::{
    META_DATABASE_CHANGE_VECTOR, META_LAST_ETAG, META_LAST_REPLICATED_ETAG_PREFIX,
    META_TRANSACTION_COUNTER, Storage,
};
use crate::Result;
use crate::change_vector::ChangeVector;
use heed::{RoTxn, RwTxn};
use std::collections::HashMap;

/// State of one write transaction
pub struct TxContext<'t, 'e> {
    txn: &'t mut RwTxn<'e>,
    storage: &'t Storage,
    last_etag: i64,
    database_change_vector: ChangeVector,
    change_vector_dirty: bool,
    transaction_counter: i64,
    transaction_marker: i16,
    last_replicated_etags: HashMap<String, i64>,
}

impl<'t, 'e> TxContext<'t, 'e> {
    pub(crate) fn begin(storage: &'t Storage, txn: &'t mut RwTxn<'e>) -> Result<Self> {
        let last_etag = storage.read_i64(&*txn, META_LAST_ETAG)?;
        let database_change_vector = storage.read_change_vector(&*txn)?;
        let transaction_counter = storage.read_i64(&*txn, META_TRANSACTION_COUNTER)? + 1;

        Ok(Self {
            txn,
            storage,
            last_etag,
            database_change_vector,
            change_vector_dirty: false,
            transaction_counter,
            transaction_marker: transaction_counter as i16,
            last_replicated_etags: HashMap::new(),
        })
    }

    /// Storage the transaction belongs to
    pub fn storage(&self) -> &'t Storage {
        self.storage
    }

    /// Read view of the transaction
    pub fn txn(&self) -> &RoTxn<'e> {
        &**self.txn
    }

    /// Mutable transaction
    pub fn txn_mut(&mut self) -> &mut RwTxn<'e> {
        &mut *self.txn
    }

    /// Allocate the next local etag
    pub fn next_etag(&mut self) -> i64 {
        self.last_etag += 1;
        self.last_etag
    }

    /// Last etag allocated so far
    pub fn last_etag(&self) -> i64 {
        self.last_etag
    }

    /// Change vector of a new local write with `etag`; the database vector
    /// moves along with it.
    pub fn new_change_vector(&mut self, etag: i64) -> ChangeVector {
        let database_id = self.storage.database_id().to_string();
        let cv = self
            .database_change_vector
            .clone()
            .with_entry(&database_id, etag);
        self.database_change_vector = cv.clone();
        self.change_vector_dirty = true;
        cv
    }

    /// Current database change vector, including changes of this transaction
    pub fn database_change_vector(&self) -> &ChangeVector {
        &self.database_change_vector
    }

    /// Merge `other` into the database change vector
    pub fn merge_database_change_vector(&mut self, other: &ChangeVector) {
        let merged = self.database_change_vector.merge(other);
        if merged != self.database_change_vector {
            self.database_change_vector = merged;
            self.change_vector_dirty = true;
        }
    }

    /// Marker stamped on rows written by this transaction
    pub fn transaction_marker(&self) -> i16 {
        self.transaction_marker
    }

    /// Use the source's marker for the rows of one replicated item
    pub fn set_transaction_marker(&mut self, marker: i16) {
        self.transaction_marker = marker;
    }

    /// Last replicated etag from `source`, including this transaction's updates
    pub fn last_replicated_etag(&self, source: &str) -> Result<i64> {
        if let Some(etag) = self.last_replicated_etags.get(source) {
            return Ok(*etag);
        }
        self.storage.last_replicated_etag(self.txn(), source)
    }

    /// Record the replication checkpoint for `source`; written on commit
    pub fn set_last_replicated_etag(&mut self, source: &str, etag: i64) {
        self.last_replicated_etags.insert(source.to_string(), etag);
    }

    /// Write the cached counters back before commit
    pub(crate) fn persist(self) -> Result<()> {
        let storage = self.storage;
        storage.write_i64(self.txn, META_LAST_ETAG, self.last_etag)?;
        storage.write_i64(self.txn, META_TRANSACTION_COUNTER, self.transaction_counter)?;
        if self.change_vector_dirty {
            let cv = self.database_change_vector.to_string();
            storage
                .metadata
                .put(self.txn, META_DATABASE_CHANGE_VECTOR, cv.as_bytes())?;
        }
        for (source, etag) in &self.last_replicated_etags {
            let key = format!("{}{}", META_LAST_REPLICATED_ETAG_PREFIX, source);
            storage.write_i64(self.txn, &key, *etag)?;
        }
        Ok(())
    }
}
