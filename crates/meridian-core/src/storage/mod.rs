//! Storage layer
//!
//! One LMDB environment per database. Every store (documents, revisions,
//! attachments, counters) owns a handful of named databases inside that
//! environment, so a single write transaction can touch all of them
//! atomically.
//!
//! # Metadata
//!
//! The `metadata` database holds the database-wide counters:
//!
//! - `last_etag`: last allocated local etag
//! - `database_change_vector`: merged change vector of every write seen
//! - `database_id`: id of this database instance inside change vectors
//! - `transaction_counter`: source of local transaction markers
//! - `last_replicated_etag/<source>`: per-source replication checkpoint

pub mod attachments;
pub mod context;
pub mod counters;
pub mod documents;
pub mod revisions;

pub use attachments::{Attachment, AttachmentTombstone, AttachmentsStorage};
pub use context::TxContext;
pub use counters::{Counter, CounterTombstone, CountersStorage};
pub use documents::{DeleteOutcome, DocumentsStorage, PutOutcome};
pub use revisions::{Revision, RevisionTombstone, RevisionsStorage};

use crate::change_vector::ChangeVector;
use crate::config::DatabaseConfig;
use crate::time::Clock;
use crate::{Error, Result};
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use std::sync::Arc;
use tracing::{debug, info};

/// Separator between the parts of composite keys
pub const RECORD_SEPARATOR: u8 = 0x1E;

pub(crate) const META_LAST_ETAG: &str = "last_etag";
pub(crate) const META_DATABASE_CHANGE_VECTOR: &str = "database_change_vector";
pub(crate) const META_DATABASE_ID: &str = "database_id";
pub(crate) const META_TRANSACTION_COUNTER: &str = "transaction_counter";
pub(crate) const META_LAST_REPLICATED_ETAG_PREFIX: &str = "last_replicated_etag/";

/// Named databases in one environment
const MAX_DBS: u32 = 24;

/// LMDB-backed storage of one database
pub struct Storage {
    env: Env,
    pub(crate) metadata: Database<Str, Bytes>,
    /// Documents and document tombstones
    pub documents: DocumentsStorage,
    /// Revision chains and revision tombstones
    pub revisions: RevisionsStorage,
    /// Attachment descriptors and blobs
    pub attachments: AttachmentsStorage,
    /// Counters and counter tombstones
    pub counters: CountersStorage,
    database_id: String,
    clock: Arc<dyn Clock>,
}

impl Storage {
    /// Open (or create) the storage described by `config`
    pub fn open(config: &DatabaseConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(Error::config)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.map_size)
                .max_dbs(MAX_DBS)
                .open(&config.data_dir)?
        };

        // Open/create databases
        let mut wtxn = env.write_txn()?;
        let metadata: Database<Str, Bytes> = env.create_database(&mut wtxn, Some("metadata"))?;
        let documents = DocumentsStorage::create(&env, &mut wtxn, clock.clone())?;
        let revisions = RevisionsStorage::create(
            &env,
            &mut wtxn,
            config.revisions.clone(),
            config.conflict_revisions.clone(),
            clock.clone(),
        )?;
        let attachments = AttachmentsStorage::create(&env, &mut wtxn)?;
        let counters = CountersStorage::create(&env, &mut wtxn)?;

        let database_id = Self::resolve_database_id(&metadata, &mut wtxn, config)?;
        wtxn.commit()?;

        info!(
            database = %config.name,
            database_id = %database_id,
            path = %config.data_dir.display(),
            "Storage opened"
        );

        Ok(Self {
            env,
            metadata,
            documents,
            revisions,
            attachments,
            counters,
            database_id,
            clock,
        })
    }

    fn resolve_database_id(
        metadata: &Database<Str, Bytes>,
        wtxn: &mut RwTxn<'_>,
        config: &DatabaseConfig,
    ) -> Result<String> {
        let stored = metadata
            .get(wtxn, META_DATABASE_ID)?
            .map(|raw| String::from_utf8(raw.to_vec()))
            .transpose()?;

        match (stored, &config.database_id) {
            (Some(stored), Some(configured)) if &stored != configured => Err(Error::config(format!(
                "Database was created with id '{}' but is configured with '{}'",
                stored, configured
            ))),
            (Some(stored), _) => Ok(stored),
            (None, configured) => {
                let id = configured
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                metadata.put(wtxn, META_DATABASE_ID, id.as_bytes())?;
                debug!(database_id = %id, "Assigned database id");
                Ok(id)
            }
        }
    }

    /// Id of this database instance inside change vectors
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Clock used for modification times
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Underlying environment
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Open a read transaction
    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Run `f` in a write transaction and commit. On error nothing is
    /// written.
    pub fn write<T>(&self, f: impl FnOnce(&mut TxContext<'_, '_>) -> Result<T>) -> Result<T> {
        let mut wtxn = self.env.write_txn()?;
        let value = {
            let mut ctx = TxContext::begin(self, &mut wtxn)?;
            let value = f(&mut ctx)?;
            ctx.persist()?;
            value
        };
        wtxn.commit()?;
        Ok(value)
    }

    /// Last allocated local etag
    pub fn last_etag(&self, txn: &RoTxn<'_>) -> Result<i64> {
        self.read_i64(txn, META_LAST_ETAG)
    }

    /// Merged change vector of every write this database has seen
    pub fn database_change_vector(&self, txn: &RoTxn<'_>) -> Result<ChangeVector> {
        self.read_change_vector(txn)
    }

    /// Replication checkpoint for `source`, 0 when nothing was replicated yet
    pub fn last_replicated_etag(&self, txn: &RoTxn<'_>, source: &str) -> Result<i64> {
        let key = format!("{}{}", META_LAST_REPLICATED_ETAG_PREFIX, source);
        self.read_i64(txn, &key)
    }

    pub(crate) fn read_change_vector(&self, txn: &RoTxn<'_>) -> Result<ChangeVector> {
        match self.metadata.get(txn, META_DATABASE_CHANGE_VECTOR)? {
            Some(raw) => {
                let s = std::str::from_utf8(raw)
                    .map_err(|e| Error::storage(format!("Corrupt database change vector: {}", e)))?;
                ChangeVector::parse(s)
            }
            None => Ok(ChangeVector::new()),
        }
    }

    pub(crate) fn read_i64(&self, txn: &RoTxn<'_>, key: &str) -> Result<i64> {
        match self.metadata.get(txn, key)? {
            Some(raw) => decode_i64(raw)
                .ok_or_else(|| Error::storage(format!("Corrupt metadata value for '{}'", key))),
            None => Ok(0),
        }
    }

    pub(crate) fn write_i64(&self, txn: &mut RwTxn<'_>, key: &str, value: i64) -> Result<()> {
        self.metadata.put(txn, key, &value.to_le_bytes())?;
        Ok(())
    }
}

/// Composite key `<prefix> 0x1E`
pub(crate) fn prefix_key(prefix: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1);
    key.extend_from_slice(prefix.as_bytes());
    key.push(RECORD_SEPARATOR);
    key
}

/// Composite key `<prefix> 0x1E <etag big-endian>`; sorts by etag within a prefix
pub(crate) fn prefixed_etag_key(prefix: &[u8], etag: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix);
    key.extend_from_slice(&(etag as u64).to_be_bytes());
    key
}

/// Etag suffix of a key built by [`prefixed_etag_key`]
pub(crate) fn etag_suffix(key: &[u8]) -> Option<i64> {
    let start = key.len().checked_sub(8)?;
    let bytes: [u8; 8] = key[start..].try_into().ok()?;
    Some(u64::from_be_bytes(bytes) as i64)
}

fn decode_i64(raw: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(i64::from_le_bytes(bytes))
}
