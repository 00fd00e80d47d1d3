//! Revision store
//!
//! Immutable history of document versions. Every revision row is keyed by
//! the change vector of the write it captured, so re-receiving the same
//! revision through replication is a no-op.
//!
//! # Layout
//!
//! ```text
//! revisions                     cv            -> RevisionRecord
//! revisions_by_id_etag          lower_id 1E etag -> cv   (chain scans)
//! revisions_by_etag             etag          -> cv      (global feed)
//! revisions_by_collection_etag  collection 1E etag -> cv (collection feed)
//! revisions_by_deleted_etag     deleted_etag  -> cv      (revisions bin)
//! revisions_resolved            resolved ticks etag -> cv (resolved feed)
//! revisions_count               lower_id 1E   -> count
//! revisions_tombstones          cv            -> TombstoneRecord
//! revisions_tombstones_by_etag  etag          -> cv
//! ```
//!
//! Retention deletes the oldest rows of a chain and leaves a tombstone for
//! each one so that the delete itself replicates.

use super::{TxContext, etag_suffix, prefix_key, prefixed_etag_key};
use crate::change_vector::{ChangeVector, ConflictStatus, compare_with_flags};
use crate::config::{RevisionsCollectionConfiguration, RevisionsConfiguration};
use crate::document::{DocumentFlags, Origin, collection_of, lower_id};
use crate::time::{Clock, duration_to_ticks, to_ticks};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use heed::byteorder::BigEndian;
use heed::types::*;
use heed::{Database, Env, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionRecord {
    id: String,
    lower_id: String,
    etag: i64,
    change_vector: ChangeVector,
    body: Vec<u8>,
    flags: DocumentFlags,
    deleted_etag: i64,
    last_modified_ticks: i64,
    transaction_marker: i16,
    collection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TombstoneRecord {
    etag: i64,
    deleted_revision_etag: i64,
    transaction_marker: i16,
    collection: String,
    flags: DocumentFlags,
    change_vector: ChangeVector,
    last_modified_ticks: i64,
}

/// One stored revision
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    /// Document id
    pub id: String,
    /// Case-folded document id
    pub lower_id: String,
    /// Local etag of the revision row
    pub etag: i64,
    /// Change vector of the captured write; the row key
    pub change_vector: ChangeVector,
    /// Captured body
    pub body: Value,
    /// Flags; always carries `REVISION` or `DELETE_REVISION`
    pub flags: DocumentFlags,
    /// Etag of the delete for delete revisions, 0 otherwise
    pub deleted_etag: i64,
    /// Modification time of the captured write
    pub last_modified_ticks: i64,
    /// Transaction marker of the row
    pub transaction_marker: i16,
    /// Collection of the document
    pub collection: String,
}

impl Revision {
    /// True for rows produced by a conflict resolution
    pub fn is_resolved(&self) -> bool {
        self.flags.contains(DocumentFlags::RESOLVED)
    }
}

/// A deleted revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionTombstone {
    /// Change vector of the deleted revision
    pub key: String,
    /// Etag of the tombstone
    pub etag: i64,
    /// Etag the revision had; negative when it was never stored locally
    pub deleted_revision_etag: i64,
    /// Transaction marker of the delete
    pub transaction_marker: i16,
    /// Collection of the deleted revision
    pub collection: String,
    /// Flags of the deleted revision
    pub flags: DocumentFlags,
    /// Change vector of the write that caused the delete
    pub change_vector: ChangeVector,
    /// Modification time of the write that caused the delete
    pub last_modified_ticks: i64,
}

/// Revision chains, their counters and revision tombstones
pub struct RevisionsStorage {
    revisions: Database<Str, SerdeBincode<RevisionRecord>>,
    by_id_etag: Database<Bytes, Str>,
    by_etag: Database<U64<BigEndian>, Str>,
    by_collection_etag: Database<Bytes, Str>,
    by_deleted_etag: Database<U64<BigEndian>, Str>,
    resolved: Database<Bytes, Str>,
    counts: Database<Bytes, I64<BigEndian>>,
    tombstones: Database<Str, SerdeBincode<TombstoneRecord>>,
    tombstones_by_etag: Database<I64<BigEndian>, Str>,
    configuration: Option<RevisionsConfiguration>,
    conflict_configuration: RevisionsConfiguration,
    clock: Arc<dyn Clock>,
}

impl RevisionsStorage {
    pub(crate) fn create(
        env: &Env,
        wtxn: &mut RwTxn<'_>,
        configuration: Option<RevisionsConfiguration>,
        conflict_configuration: RevisionsConfiguration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Ok(Self {
            revisions: env.create_database(wtxn, Some("revisions"))?,
            by_id_etag: env.create_database(wtxn, Some("revisions_by_id_etag"))?,
            by_etag: env.create_database(wtxn, Some("revisions_by_etag"))?,
            by_collection_etag: env.create_database(wtxn, Some("revisions_by_collection_etag"))?,
            by_deleted_etag: env.create_database(wtxn, Some("revisions_by_deleted_etag"))?,
            resolved: env.create_database(wtxn, Some("revisions_resolved"))?,
            counts: env.create_database(wtxn, Some("revisions_count"))?,
            tombstones: env.create_database(wtxn, Some("revisions_tombstones"))?,
            tombstones_by_etag: env.create_database(wtxn, Some("revisions_tombstones_by_etag"))?,
            configuration,
            conflict_configuration,
            clock,
        })
    }

    /// Database revisions configuration, `None` when versioning is off
    pub fn configuration(&self) -> Option<&RevisionsConfiguration> {
        self.configuration.as_ref()
    }

    /// Policy for conflict and resolved revisions
    pub fn conflict_configuration(&self) -> &RevisionsConfiguration {
        &self.conflict_configuration
    }

    /// Policy that applies to a write into `collection` carrying `flags`
    pub fn get_revisions_configuration(
        &self,
        collection: &str,
        flags: DocumentFlags,
    ) -> RevisionsCollectionConfiguration {
        let conflicted = flags.contains(DocumentFlags::RESOLVED)
            || flags.contains(DocumentFlags::CONFLICTED);

        if let Some(config) = &self.configuration {
            if let Some(collection) = config.collection(collection) {
                return collection.clone();
            }
            if conflicted {
                return self.conflict_collection_configuration(collection);
            }
            return config
                .default
                .clone()
                .unwrap_or_else(RevisionsCollectionConfiguration::disabled);
        }

        if conflicted {
            self.conflict_collection_configuration(collection)
        } else {
            RevisionsCollectionConfiguration::disabled()
        }
    }

    fn conflict_collection_configuration(&self, collection: &str) -> RevisionsCollectionConfiguration {
        self.conflict_configuration
            .collection(collection)
            .cloned()
            .or_else(|| self.conflict_configuration.default.clone())
            .unwrap_or_else(RevisionsCollectionConfiguration::enabled)
    }

    /// Decide whether a local write of `body` creates a revision.
    ///
    /// A count limit of zero drops the existing chain instead.
    pub fn should_version_document(
        &self,
        ctx: &mut TxContext<'_, '_>,
        id: &str,
        collection: &str,
        flags: DocumentFlags,
        existing_body: Option<&[u8]>,
        body: &Value,
    ) -> Result<bool> {
        if flags.contains(DocumentFlags::RESOLVED) {
            return Ok(true);
        }
        if self.configuration.is_none() {
            return Ok(false);
        }

        let config = self.get_revisions_configuration(collection, flags);
        if config.disabled {
            return Ok(false);
        }
        if config.minimum_revisions_to_keep == Some(0) {
            if self.has_revisions(ctx.txn(), id)? {
                self.delete_revisions_for(ctx, id)?;
            }
            return Ok(false);
        }

        match existing_body {
            None => Ok(true),
            Some(raw) => {
                let existing: Value = serde_json::from_slice(raw)?;
                Ok(&existing != body)
            }
        }
    }

    /// Append a revision.
    ///
    /// Returns `false` when a revision with this change vector already
    /// exists; the only change then is flipping `CONFLICTED` onto it.
    pub fn put(
        &self,
        ctx: &mut TxContext<'_, '_>,
        id: &str,
        body: &Value,
        flags: DocumentFlags,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
        configuration: Option<&RevisionsCollectionConfiguration>,
    ) -> Result<bool> {
        let collection = collection_of(body);
        let config = match configuration {
            Some(config) => config.clone(),
            None => self.get_revisions_configuration(&collection, flags),
        };

        let key = change_vector.to_string();
        if let Some(existing) = self.revisions.get(ctx.txn(), &key)? {
            self.mark_as_conflicted_if_needed(ctx, &key, existing, flags)?;
            return Ok(false);
        }

        let lower = lower_id(id);
        let record = RevisionRecord {
            id: id.to_string(),
            lower_id: lower.clone(),
            etag: ctx.next_etag(),
            change_vector: change_vector.clone(),
            body: serde_json::to_vec(body)?,
            flags: flags | DocumentFlags::REVISION,
            deleted_etag: 0,
            last_modified_ticks,
            transaction_marker: ctx.transaction_marker(),
            collection: collection.clone(),
        };
        self.insert_row(ctx, &key, &record)?;
        debug!(id = %id, etag = record.etag, change_vector = %key, "Revision stored");

        self.delete_old_revisions(ctx, &lower, &config, change_vector, last_modified_ticks)?;
        Ok(true)
    }

    /// Record the delete of a document in its chain.
    ///
    /// Returns `false` when nothing new was written.
    pub fn delete(
        &self,
        ctx: &mut TxContext<'_, '_>,
        id: &str,
        body: &Value,
        flags: DocumentFlags,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
        origin: Origin,
    ) -> Result<bool> {
        let flags = flags.strip(DocumentFlags::HAS_ATTACHMENTS);
        let collection = collection_of(body);
        let config = self.get_revisions_configuration(&collection, flags);
        if config.disabled && origin == Origin::Local {
            return Ok(false);
        }

        let key = change_vector.to_string();
        if let Some(existing) = self.revisions.get(ctx.txn(), &key)? {
            self.mark_as_conflicted_if_needed(ctx, &key, existing, flags)?;
            return Ok(false);
        }

        let lower = lower_id(id);
        if !config.disabled && config.purge_on_delete {
            let prefix = prefix_key(&lower);
            let deleted =
                self.delete_revisions(ctx, &prefix, usize::MAX, None, change_vector, last_modified_ticks)?;
            self.counts.delete(ctx.txn_mut(), &prefix)?;
            debug!(id = %id, deleted, "Revisions purged on delete");
            return Ok(true);
        }

        let etag = ctx.next_etag();
        let record = RevisionRecord {
            id: id.to_string(),
            lower_id: lower.clone(),
            etag,
            change_vector: change_vector.clone(),
            body: serde_json::to_vec(body)?,
            flags: flags | DocumentFlags::DELETE_REVISION,
            deleted_etag: etag,
            last_modified_ticks,
            transaction_marker: ctx.transaction_marker(),
            collection,
        };
        self.insert_row(ctx, &key, &record)?;
        debug!(id = %id, etag, change_vector = %key, "Delete revision stored");

        self.delete_old_revisions(ctx, &lower, &config, change_vector, last_modified_ticks)?;
        Ok(true)
    }

    /// Apply a replicated revision tombstone
    pub fn delete_revision(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &str,
        collection: &str,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<()> {
        let (revision_etag, flags) = if let Some(record) = self.revisions.get(ctx.txn(), key)? {
            self.increment_count(ctx, &prefix_key(&record.lower_id), -1)?;
            self.remove_row(ctx, key, &record)?;
            (record.etag, record.flags)
        } else if let Some(existing) = self.tombstones.get(ctx.txn(), key)? {
            self.tombstones.delete(ctx.txn_mut(), key)?;
            self.tombstones_by_etag.delete(ctx.txn_mut(), &existing.etag)?;
            (existing.deleted_revision_etag, existing.flags)
        } else {
            // unknown revision: a negative etag keeps local ordering intact
            (-ctx.next_etag(), DocumentFlags::NONE)
        };

        self.create_tombstone(
            ctx,
            key,
            revision_etag,
            collection,
            flags,
            change_vector,
            last_modified_ticks,
        )
    }

    /// Drop the whole chain of `id` and its counter without tombstones
    pub fn delete_revisions_for(&self, ctx: &mut TxContext<'_, '_>, id: &str) -> Result<usize> {
        let prefix = prefix_key(&lower_id(id));
        let keys = self.chain_keys(ctx.txn(), &prefix, usize::MAX)?;

        let mut deleted = 0;
        for key in keys {
            if let Some(record) = self.revisions.get(ctx.txn(), &key)? {
                self.remove_row(ctx, &key, &record)?;
                deleted += 1;
            }
        }
        self.counts.delete(ctx.txn_mut(), &prefix)?;

        if deleted > 0 {
            info!(id = %id, deleted, "Deleted revisions");
        }
        Ok(deleted)
    }

    /// Drop revisions of `collection` modified before `cutoff`, without
    /// tombstones
    pub fn delete_revisions_before(
        &self,
        ctx: &mut TxContext<'_, '_>,
        collection: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let prefix = prefix_key(&collection.to_lowercase());
        let keys: Vec<String> = self
            .by_collection_etag
            .prefix_iter(ctx.txn(), &prefix)?
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?;

        let cutoff = to_ticks(cutoff);
        let mut deleted = 0;
        for key in keys {
            let Some(record) = self.revisions.get(ctx.txn(), &key)? else {
                continue;
            };
            if record.last_modified_ticks >= cutoff {
                continue;
            }
            self.remove_row(ctx, &key, &record)?;
            self.increment_count(ctx, &prefix_key(&record.lower_id), -1)?;
            deleted += 1;
        }

        if deleted > 0 {
            info!(collection = %collection, deleted, "Deleted revisions before cutoff");
        }
        Ok(deleted)
    }

    /// Revision by change vector
    pub fn get_revision(&self, txn: &RoTxn<'_>, change_vector: &str) -> Result<Option<Revision>> {
        self.revisions
            .get(txn, change_vector)?
            .map(into_revision)
            .transpose()
    }

    /// Page of the chain of `id`, newest first, plus the chain length
    pub fn get_revisions(
        &self,
        txn: &RoTxn<'_>,
        id: &str,
        start: usize,
        take: usize,
    ) -> Result<(Vec<Revision>, i64)> {
        let prefix = prefix_key(&lower_id(id));
        let keys: Vec<String> = self
            .by_id_etag
            .rev_prefix_iter(txn, &prefix)?
            .skip(start)
            .take(take)
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?;

        let revisions = self.load_all(txn, keys)?;
        let count = self.revisions_count(txn, id)?;
        Ok((revisions, count))
    }

    /// Delete revisions that are the tail of their chain, walking the
    /// deleted-etag index downwards from `start_etag`
    pub fn get_revisions_bin_entries(
        &self,
        txn: &RoTxn<'_>,
        start_etag: i64,
        take: usize,
    ) -> Result<Vec<Revision>> {
        let mut entries = Vec::new();
        if take == 0 || start_etag <= 0 {
            return Ok(entries);
        }

        let range = ..=(start_etag as u64);
        for entry in self.by_deleted_etag.rev_range(txn, &range)? {
            let (deleted_etag, key) = entry?;
            let Some(record) = self.revisions.get(txn, key)? else {
                continue;
            };
            if !self.is_revisions_bin_entry(txn, &record.lower_id, deleted_etag as i64)? {
                continue;
            }
            entries.push(into_revision(record)?);
            if entries.len() >= take {
                break;
            }
        }
        Ok(entries)
    }

    /// The chain's last row must still be a delete revision at or below the
    /// candidate etag; newer revisions move the tail.
    fn is_revisions_bin_entry(&self, txn: &RoTxn<'_>, lower_id: &str, candidate_etag: i64) -> Result<bool> {
        let prefix = prefix_key(lower_id);
        let Some(entry) = self.by_id_etag.rev_prefix_iter(txn, &prefix)?.next() else {
            return Ok(false);
        };
        let (index_key, key) = entry?;
        let tail_etag = etag_suffix(index_key)
            .ok_or_else(|| Error::storage(format!("Corrupt revision index key for '{}'", lower_id)))?;
        let Some(tail) = self.revisions.get(txn, key)? else {
            return Ok(false);
        };
        Ok(tail.flags.contains(DocumentFlags::DELETE_REVISION) && candidate_etag >= tail_etag)
    }

    /// Global revision feed from `etag`, ascending
    pub fn get_revisions_from(&self, txn: &RoTxn<'_>, etag: i64, take: usize) -> Result<Vec<Revision>> {
        let range = (etag.max(0) as u64)..;
        let keys: Vec<String> = self
            .by_etag
            .range(txn, &range)?
            .take(take)
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?;
        self.load_all(txn, keys)
    }

    /// Collection revision feed from `etag`, each revision paired with the
    /// one before it in its chain
    pub fn get_collection_revisions_from(
        &self,
        txn: &RoTxn<'_>,
        collection: &str,
        etag: i64,
        take: usize,
    ) -> Result<Vec<(Option<Revision>, Revision)>> {
        let prefix = prefix_key(&collection.to_lowercase());
        let start = prefixed_etag_key(&prefix, etag.max(0));
        let end = prefixed_etag_key(&prefix, i64::MAX);
        let range = (Bound::Included(start.as_slice()), Bound::Included(end.as_slice()));

        let keys: Vec<String> = self
            .by_collection_etag
            .range(txn, &range)?
            .take(take)
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?;

        let mut pairs = Vec::with_capacity(keys.len());
        for current in self.load_all(txn, keys)? {
            let previous = self.previous_in_chain(txn, &current)?;
            pairs.push((previous, current));
        }
        Ok(pairs)
    }

    fn previous_in_chain(&self, txn: &RoTxn<'_>, revision: &Revision) -> Result<Option<Revision>> {
        let prefix = prefix_key(&revision.lower_id);
        let upper = prefixed_etag_key(&prefix, revision.etag);
        let range = (Bound::Included(prefix.as_slice()), Bound::Excluded(upper.as_slice()));
        match self.by_id_etag.rev_range(txn, &range)?.next() {
            Some(entry) => {
                let (_, key) = entry?;
                self.get_revision(txn, key)
            }
            None => Ok(None),
        }
    }

    /// Latest revision of `id` modified at or before `max`
    pub fn get_revision_before(
        &self,
        txn: &RoTxn<'_>,
        id: &str,
        max: DateTime<Utc>,
    ) -> Result<Option<Revision>> {
        let max = to_ticks(max);
        let prefix = prefix_key(&lower_id(id));
        let keys = self.chain_keys(txn, &prefix, usize::MAX)?;

        let mut best: Option<RevisionRecord> = None;
        for key in keys {
            let Some(record) = self.revisions.get(txn, &key)? else {
                continue;
            };
            if record.last_modified_ticks > max {
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|b| record.last_modified_ticks > b.last_modified_ticks)
            {
                best = Some(record);
            }
        }
        best.map(into_revision).transpose()
    }

    /// Resolved revisions modified at or after `since`, oldest first
    pub fn get_resolved_documents_since(
        &self,
        txn: &RoTxn<'_>,
        since: DateTime<Utc>,
        take: usize,
    ) -> Result<Vec<Revision>> {
        let start = resolved_key(DocumentFlags::RESOLVED, to_ticks(since), 0);
        let end = resolved_key(DocumentFlags::RESOLVED, i64::MAX, i64::MAX);
        let range = (Bound::Included(start.as_slice()), Bound::Included(end.as_slice()));

        let keys: Vec<String> = self
            .resolved
            .range(txn, &range)?
            .take(take)
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?;
        self.load_all(txn, keys)
    }

    /// Revision tombstone by revision change vector
    pub fn get_revision_tombstone(&self, txn: &RoTxn<'_>, key: &str) -> Result<Option<RevisionTombstone>> {
        Ok(self
            .tombstones
            .get(txn, key)?
            .map(|record| into_tombstone(key.to_string(), record)))
    }

    /// Revision tombstones from `etag`, ascending
    pub fn get_revision_tombstones_from(
        &self,
        txn: &RoTxn<'_>,
        etag: i64,
        take: usize,
    ) -> Result<Vec<RevisionTombstone>> {
        let range = etag.max(0)..;
        let mut tombstones = Vec::new();
        for entry in self.tombstones_by_etag.range(txn, &range)?.take(take) {
            let (_, key) = entry?;
            if let Some(tombstone) = self.get_revision_tombstone(txn, key)? {
                tombstones.push(tombstone);
            }
        }
        Ok(tombstones)
    }

    /// Number of revision tombstones
    pub fn tombstones_count(&self, txn: &RoTxn<'_>) -> Result<u64> {
        Ok(self.tombstones.len(txn)?)
    }

    /// Value of the chain counter of `id`
    pub fn revisions_count(&self, txn: &RoTxn<'_>, id: &str) -> Result<i64> {
        let prefix = prefix_key(&lower_id(id));
        Ok(self.counts.get(txn, &prefix)?.unwrap_or(0))
    }

    /// True when `id` has at least one revision row
    pub fn has_revisions(&self, txn: &RoTxn<'_>, id: &str) -> Result<bool> {
        let prefix = prefix_key(&lower_id(id));
        Ok(self.by_id_etag.prefix_iter(txn, &prefix)?.next().is_some())
    }

    /// Total number of revision rows
    pub fn number_of_revision_documents(&self, txn: &RoTxn<'_>) -> Result<u64> {
        Ok(self.by_etag.len(txn)?)
    }

    fn mark_as_conflicted_if_needed(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &str,
        existing: RevisionRecord,
        flags: DocumentFlags,
    ) -> Result<()> {
        let status = compare_with_flags(&existing.change_vector, flags, &existing.change_vector, existing.flags);
        if status != ConflictStatus::EqualButFlagsDiffer
            || !flags.contains(DocumentFlags::CONFLICTED)
            || existing.flags.contains(DocumentFlags::CONFLICTED)
        {
            return Ok(());
        }

        self.remove_row(ctx, key, &existing)?;
        let updated = RevisionRecord {
            etag: ctx.next_etag(),
            flags: existing.flags | DocumentFlags::CONFLICTED,
            transaction_marker: ctx.transaction_marker(),
            ..existing
        };
        self.insert_row(ctx, key, &updated)?;
        debug!(id = %updated.id, change_vector = %key, "Revision marked as conflicted");
        Ok(())
    }

    fn delete_old_revisions(
        &self,
        ctx: &mut TxContext<'_, '_>,
        lower_id: &str,
        config: &RevisionsCollectionConfiguration,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<()> {
        let prefix = prefix_key(lower_id);
        let count = self.increment_count(ctx, &prefix, 1)?;
        if !config.has_retention() {
            return Ok(());
        }

        // age-only retention considers every row, stopping at the first young one
        let to_delete = match config.minimum_revisions_to_keep {
            Some(keep) => count - i64::try_from(keep).unwrap_or(i64::MAX),
            None => count,
        };
        if to_delete <= 0 {
            return Ok(());
        }

        let deleted = self.delete_revisions(
            ctx,
            &prefix,
            to_delete as usize,
            config.minimum_revision_age_to_keep,
            change_vector,
            last_modified_ticks,
        )?;
        if deleted > 0 {
            self.increment_count(ctx, &prefix, -(deleted as i64))?;
        }
        Ok(())
    }

    /// Delete up to `max` of the oldest rows under `prefix`, stopping at the
    /// first row younger than `min_age`. Each deleted row leaves a tombstone.
    fn delete_revisions(
        &self,
        ctx: &mut TxContext<'_, '_>,
        prefix: &[u8],
        max: usize,
        min_age: Option<Duration>,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<usize> {
        let keys = self.chain_keys(ctx.txn(), prefix, max)?;
        let now = self.clock.now_ticks();
        let min_age = min_age.map(duration_to_ticks);

        let mut deleted = 0;
        for key in keys {
            let Some(record) = self.revisions.get(ctx.txn(), &key)? else {
                continue;
            };
            if let Some(min_age) = min_age {
                if now - record.last_modified_ticks <= min_age {
                    break;
                }
            }
            self.create_tombstone(
                ctx,
                &key,
                record.etag,
                &record.collection,
                record.flags,
                change_vector,
                last_modified_ticks,
            )?;
            self.remove_row(ctx, &key, &record)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    fn create_tombstone(
        &self,
        ctx: &mut TxContext<'_, '_>,
        key: &str,
        revision_etag: i64,
        collection: &str,
        flags: DocumentFlags,
        change_vector: &ChangeVector,
        last_modified_ticks: i64,
    ) -> Result<()> {
        if self.tombstones.get(ctx.txn(), key)?.is_some() {
            return Ok(());
        }

        let record = TombstoneRecord {
            etag: ctx.next_etag(),
            deleted_revision_etag: revision_etag,
            transaction_marker: ctx.transaction_marker(),
            collection: collection.to_string(),
            flags,
            change_vector: change_vector.clone(),
            last_modified_ticks,
        };
        self.tombstones.put(ctx.txn_mut(), key, &record)?;
        self.tombstones_by_etag.put(ctx.txn_mut(), &record.etag, key)?;
        Ok(())
    }

    fn chain_keys(&self, txn: &RoTxn<'_>, prefix: &[u8], max: usize) -> Result<Vec<String>> {
        Ok(self
            .by_id_etag
            .prefix_iter(txn, prefix)?
            .take(max)
            .map(|entry| entry.map(|(_, key)| key.to_string()))
            .collect::<heed::Result<_>>()?)
    }

    fn load_all(&self, txn: &RoTxn<'_>, keys: Vec<String>) -> Result<Vec<Revision>> {
        let mut revisions = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(revision) = self.get_revision(txn, &key)? {
                revisions.push(revision);
            }
        }
        Ok(revisions)
    }

    fn increment_count(&self, ctx: &mut TxContext<'_, '_>, prefix: &[u8], delta: i64) -> Result<i64> {
        let current = self.counts.get(ctx.txn(), prefix)?.unwrap_or(0);
        let next = current + delta;
        if next <= 0 {
            self.counts.delete(ctx.txn_mut(), prefix)?;
            return Ok(0);
        }
        self.counts.put(ctx.txn_mut(), prefix, &next)?;
        Ok(next)
    }

    fn insert_row(&self, ctx: &mut TxContext<'_, '_>, key: &str, record: &RevisionRecord) -> Result<()> {
        let txn = ctx.txn_mut();
        self.revisions.put(txn, key, record)?;
        self.by_id_etag
            .put(txn, &prefixed_etag_key(&prefix_key(&record.lower_id), record.etag), key)?;
        self.by_etag.put(txn, &(record.etag as u64), key)?;
        self.by_collection_etag
            .put(txn, &collection_etag_key(&record.collection, record.etag), key)?;
        if record.deleted_etag > 0 {
            self.by_deleted_etag.put(txn, &(record.deleted_etag as u64), key)?;
        }
        self.resolved.put(
            txn,
            &resolved_key(record.flags, record.last_modified_ticks, record.etag),
            key,
        )?;
        Ok(())
    }

    fn remove_row(&self, ctx: &mut TxContext<'_, '_>, key: &str, record: &RevisionRecord) -> Result<()> {
        let txn = ctx.txn_mut();
        self.revisions.delete(txn, key)?;
        self.by_id_etag
            .delete(txn, &prefixed_etag_key(&prefix_key(&record.lower_id), record.etag))?;
        self.by_etag.delete(txn, &(record.etag as u64))?;
        self.by_collection_etag
            .delete(txn, &collection_etag_key(&record.collection, record.etag))?;
        if record.deleted_etag > 0 {
            self.by_deleted_etag.delete(txn, &(record.deleted_etag as u64))?;
        }
        self.resolved.delete(
            txn,
            &resolved_key(record.flags, record.last_modified_ticks, record.etag),
        )?;
        Ok(())
    }
}

fn collection_etag_key(collection: &str, etag: i64) -> Vec<u8> {
    prefixed_etag_key(&prefix_key(&collection.to_lowercase()), etag)
}

/// `(resolved flag, ticks, etag)`, big-endian so resolved rows sort by time
fn resolved_key(flags: DocumentFlags, ticks: i64, etag: i64) -> Vec<u8> {
    let resolved = flags.bits() & DocumentFlags::RESOLVED.bits();
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(&resolved.to_be_bytes());
    key.extend_from_slice(&(ticks.max(0) as u64).to_be_bytes());
    key.extend_from_slice(&(etag as u64).to_be_bytes());
    key
}

fn into_revision(record: RevisionRecord) -> Result<Revision> {
    let body = serde_json::from_slice(&record.body)
        .map_err(|e| Error::storage(format!("Corrupt revision body for '{}': {}", record.id, e)))?;
    Ok(Revision {
        id: record.id,
        lower_id: record.lower_id,
        etag: record.etag,
        change_vector: record.change_vector,
        body,
        flags: record.flags,
        deleted_etag: record.deleted_etag,
        last_modified_ticks: record.last_modified_ticks,
        transaction_marker: record.transaction_marker,
        collection: record.collection,
    })
}

fn into_tombstone(key: String, record: TombstoneRecord) -> RevisionTombstone {
    RevisionTombstone {
        key,
        etag: record.etag,
        deleted_revision_etag: record.deleted_revision_etag,
        transaction_marker: record.transaction_marker,
        collection: record.collection,
        flags: record.flags,
        change_vector: record.change_vector,
        last_modified_ticks: record.last_modified_ticks,
    }
}
