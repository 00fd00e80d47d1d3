//! Database handle
//!
//! Ties storage, the transaction merger, the clock and the shutdown token of
//! one database together. Sessions hold an `Arc<Database>`.

use crate::change_vector::ChangeVector;
use crate::config::DatabaseConfig;
use crate::document::{Document, DocumentFlags, DocumentOrTombstone, Origin};
use crate::merger::{FnCommand, MergedCommand, MergerStats, PendingCommand, TransactionMerger};
use crate::storage::{DeleteOutcome, PutOutcome, Storage, TxContext};
use crate::time::{Clock, SystemClock};
use crate::{Error, Result};
use heed::RoTxn;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// One open database
pub struct Database {
    config: DatabaseConfig,
    storage: Arc<Storage>,
    merger: TransactionMerger,
    shutdown: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Database {
    /// Open with the system clock
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with a custom clock
    pub fn open_with_clock(config: DatabaseConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config, clock.clone())?);
        let merger =
            TransactionMerger::new(storage.clone(), config.replication.merger_queue_capacity)?;

        info!(
            database = %config.name,
            node_tag = %config.node_tag,
            database_id = %storage.database_id(),
            "Database opened"
        );

        Ok(Self {
            config,
            storage,
            merger,
            shutdown: CancellationToken::new(),
            clock,
        })
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Tag of the hosting node
    pub fn node_tag(&self) -> &str {
        &self.config.node_tag
    }

    /// Id of this database inside change vectors
    pub fn database_id(&self) -> &str {
        self.storage.database_id()
    }

    /// Configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Storage
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Token cancelled when the database shuts down
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Merger statistics
    pub fn merger_stats(&self) -> MergerStats {
        self.merger.stats()
    }

    /// Queue a command on the transaction merger
    pub fn enqueue(&self, command: Box<dyn MergedCommand>) -> Result<PendingCommand> {
        if self.shutdown.is_cancelled() {
            return Err(Error::cancelled(format!("Database '{}' is shutting down", self.name())));
        }
        self.merger.enqueue(command)
    }

    /// Run `f` in a merged write transaction and wait for its result
    pub fn execute<T, F>(&self, name: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TxContext<'_, '_>) -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let command = FnCommand::new(name, move |ctx| {
            let value = f(ctx)?;
            *out.lock() = Some(value);
            Ok(1)
        });

        self.enqueue(Box::new(command))?.wait()?;
        let value = slot.lock().take();
        value.ok_or_else(|| Error::internal(format!("Command '{}' produced no result", name)))
    }

    /// Run `f` against a read transaction
    pub fn read<T>(&self, f: impl FnOnce(&RoTxn<'_>, &Storage) -> Result<T>) -> Result<T> {
        let rtxn = self.storage.read_txn()?;
        f(&rtxn, &self.storage)
    }

    /// Local document put
    pub fn put_document(&self, id: &str, body: &Value) -> Result<PutOutcome> {
        let storage = self.storage.clone();
        let id = id.to_string();
        let body = body.clone();
        self.execute("put_document", move |ctx| {
            storage
                .documents
                .put(ctx, &id, &body, DocumentFlags::NONE, Origin::Local, None, None)
        })
    }

    /// Local document delete; `None` when the document does not exist
    pub fn delete_document(&self, id: &str) -> Result<Option<DeleteOutcome>> {
        let storage = self.storage.clone();
        let id = id.to_string();
        self.execute("delete_document", move |ctx| {
            storage
                .documents
                .delete(ctx, &id, Origin::Local, None, None, None, DocumentFlags::NONE)
        })
    }

    /// Live document by id
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.read(|txn, storage| storage.documents.get(txn, id))
    }

    /// Document or tombstone by id
    pub fn get_document_or_tombstone(&self, id: &str) -> Result<Option<DocumentOrTombstone>> {
        self.read(|txn, storage| storage.documents.get_document_or_tombstone(txn, id))
    }

    /// Merged change vector of the database
    pub fn database_change_vector(&self) -> Result<ChangeVector> {
        self.read(|txn, storage| storage.database_change_vector(txn))
    }

    /// Last allocated etag
    pub fn last_etag(&self) -> Result<i64> {
        self.read(|txn, storage| storage.last_etag(txn))
    }

    /// Replication checkpoint for `source`
    pub fn last_replicated_etag(&self, source: &str) -> Result<i64> {
        self.read(|txn, storage| storage.last_replicated_etag(txn, source))
    }

    /// Cancel the shutdown token and stop the merger. Idempotent.
    pub fn close(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            info!(database = %self.name(), "Closing database");
        }
        self.shutdown.cancel();
        self.merger.shutdown()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestContext;
    use serde_json::json;

    #[test]
    fn test_put_get_delete() {
        let ctx = TestContext::new();
        let database = ctx.database("db");

        let put = database
            .put_document("users/1", &json!({"Name": "Ayende"}))
            .unwrap();
        assert_eq!(put.etag, 1);

        let doc = database.get_document("USERS/1").unwrap().unwrap();
        assert_eq!(doc.body["Name"], "Ayende");
        assert_eq!(database.last_etag().unwrap(), 1);
        assert_eq!(database.database_change_vector().unwrap().get("db"), 1);

        assert!(database.delete_document("users/1").unwrap().is_some());
        assert!(database.get_document("users/1").unwrap().is_none());
        assert!(database.delete_document("users/1").unwrap().is_none());
    }

    #[test]
    fn test_execute_returns_value() {
        let ctx = TestContext::new();
        let database = ctx.database("db");

        let etag = database.execute("etag", |tx| Ok(tx.next_etag())).unwrap();
        assert_eq!(etag, 1);
    }

    #[test]
    fn test_enqueue_after_close_is_cancelled() {
        let ctx = TestContext::new();
        let database = ctx.database("db");

        database.close().unwrap();
        let err = database.execute("late", |_| Ok(())).unwrap_err();
        assert!(err.is_cancellation());
    }
}
