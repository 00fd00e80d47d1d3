//! Conflict resolver
//!
//! A received batch is applied by one [`DocumentReplicationCommand`] inside
//! a single write transaction. Items are applied in received order:
//!
//! - attachments, attachment/revision/counter tombstones and counters go
//!   straight to their stores, which are idempotent by change vector
//! - documents carrying `REVISION` or `DELETE_REVISION` go to the revision
//!   store
//! - every other document is classified against the local document or
//!   tombstone and applied, skipped or resolved as a conflict
//!
//! Conflicts are resolved in place: both versions are kept as conflicted
//! revisions and the most recently modified one becomes the live document,
//! written as a new local change merged with both vectors.

use super::items::{ItemPayload, ReplicatedDocument, ReplicationItem};
use super::streams::AttachmentStreams;
use crate::change_vector::{ChangeVector, ConflictStatus, conflict_status};
use crate::document::{
    DocumentFlags, DocumentOrTombstone, EMPTY_COLLECTION, Origin, attachment_hashes,
    collection_of, delete_marker_body,
};
use crate::merger::MergedCommand;
use crate::storage::TxContext;
use crate::{Error, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

/// A parsed `Documents` message
pub struct ReplicationBatch {
    /// Database id of the sender
    pub source_database_id: String,
    /// `LastDocumentEtag` of the message; the new checkpoint for the source
    pub last_etag: i64,
    /// Items in received order
    pub items: Vec<ReplicationItem>,
    /// Attachment contents, by hash
    pub streams: AttachmentStreams,
    /// The sender understands the `MissingAttachments` reply
    pub supports_missing_attachments: bool,
}

impl ReplicationBatch {
    /// Batch without attachment streams
    pub fn new(source_database_id: impl Into<String>, last_etag: i64, items: Vec<ReplicationItem>) -> Self {
        Self {
            source_database_id: source_database_id.into(),
            last_etag,
            items,
            streams: AttachmentStreams::new(),
            supports_missing_attachments: true,
        }
    }
}

/// Applies one replication batch
pub struct DocumentReplicationCommand {
    batch: ReplicationBatch,
}

impl DocumentReplicationCommand {
    /// Wrap `batch`
    pub fn new(batch: ReplicationBatch) -> Self {
        Self { batch }
    }
}

impl MergedCommand for DocumentReplicationCommand {
    fn name(&self) -> &'static str {
        "document_replication"
    }

    fn execute(&mut self, ctx: &mut TxContext<'_, '_>) -> Result<usize> {
        let ReplicationBatch {
            source_database_id,
            last_etag,
            items,
            streams,
            supports_missing_attachments,
        } = &mut self.batch;
        let storage = ctx.storage();
        let mut operations = 0;

        for item in items.iter() {
            ctx.set_transaction_marker(item.transaction_marker);
            operations += 1;

            let change_vector = item.parsed_change_vector()?;
            ctx.merge_database_change_vector(&change_vector);

            match &item.payload {
                ItemPayload::Attachment(attachment) => {
                    storage.attachments.put_direct(
                        ctx,
                        &attachment.key,
                        &attachment.name,
                        &attachment.content_type,
                        &attachment.hash,
                        &change_vector,
                    )?;
                    if let Some(content) = streams.take(&attachment.hash)? {
                        storage.attachments.put_stream(ctx, &attachment.hash, &content)?;
                    }
                }
                ItemPayload::AttachmentTombstone(tombstone) => {
                    storage.attachments.delete_direct(
                        ctx,
                        &tombstone.key,
                        &change_vector,
                        tombstone.last_modified_ticks,
                    )?;
                }
                ItemPayload::RevisionTombstone(tombstone) => {
                    storage.revisions.delete_revision(
                        ctx,
                        &tombstone.key,
                        &tombstone.collection,
                        &change_vector,
                        tombstone.last_modified_ticks,
                    )?;
                }
                ItemPayload::Counter(counter) => {
                    storage.counters.put_counter(
                        ctx,
                        &counter.document_id,
                        &counter.collection,
                        &counter.name,
                        &change_vector,
                        counter.value,
                    )?;
                }
                ItemPayload::CounterTombstone(tombstone) => {
                    storage.counters.delete_counter(
                        ctx,
                        &tombstone.key,
                        &tombstone.collection,
                        &change_vector,
                        tombstone.last_modified_ticks,
                    )?;
                }
                ItemPayload::Document(document) | ItemPayload::DocumentTombstone(document) => {
                    apply_document(ctx, document, &change_vector, *supports_missing_attachments)?;
                }
            }
        }

        if !streams.is_empty() {
            warn!(
                source = %source_database_id,
                streams = streams.len(),
                "Attachment streams without a matching attachment item"
            );
        }

        ctx.set_last_replicated_etag(source_database_id, *last_etag);
        Ok(operations)
    }
}

/// Merges a heartbeat into the database: advances the checkpoint for the
/// source and merges the source vector when it is ahead of ours
pub struct UpdateChangeVectorCommand {
    source_database_id: String,
    last_document_etag: i64,
    change_vector: Option<ChangeVector>,
}

impl UpdateChangeVectorCommand {
    /// Build the command
    pub fn new(
        source_database_id: impl Into<String>,
        last_document_etag: i64,
        change_vector: Option<ChangeVector>,
    ) -> Self {
        Self {
            source_database_id: source_database_id.into(),
            last_document_etag,
            change_vector,
        }
    }
}

impl MergedCommand for UpdateChangeVectorCommand {
    fn name(&self) -> &'static str {
        "update_change_vector"
    }

    fn execute(&mut self, ctx: &mut TxContext<'_, '_>) -> Result<usize> {
        let mut operations = 0;
        if self.last_document_etag > ctx.last_replicated_etag(&self.source_database_id)? {
            ctx.set_last_replicated_etag(&self.source_database_id, self.last_document_etag);
            operations += 1;
        }

        if let Some(change_vector) = &self.change_vector {
            if ChangeVector::compare(change_vector, ctx.database_change_vector()) == ConflictStatus::Update {
                ctx.merge_database_change_vector(change_vector);
                operations += 1;
            }
        }
        Ok(operations)
    }
}

fn apply_document(
    ctx: &mut TxContext<'_, '_>,
    document: &ReplicatedDocument,
    change_vector: &ChangeVector,
    supports_missing_attachments: bool,
) -> Result<()> {
    let storage = ctx.storage();
    let body: Option<Value> = match &document.body {
        Some(raw) => Some(serde_json::from_slice(raw).map_err(|e| {
            Error::serialization(format!("Invalid body for document '{}': {}", document.id, e))
        })?),
        None => None,
    };

    if let Some(body) = &body {
        assert_attachments(ctx, &document.id, body, supports_missing_attachments)?;
    }

    if document.flags.contains(DocumentFlags::REVISION) {
        let body = body.ok_or_else(|| {
            Error::serialization(format!("Revision of '{}' was sent without a body", document.id))
        })?;
        let inserted = storage.revisions.put(
            ctx,
            &document.id,
            &body,
            document.flags,
            change_vector,
            document.last_modified_ticks,
            None,
        )?;
        if inserted {
            put_from_revision_if_newer(ctx, document, Some(&body), change_vector)?;
        }
        return Ok(());
    }

    if document.flags.contains(DocumentFlags::DELETE_REVISION) {
        let body = body.unwrap_or_else(|| delete_marker_body(collection_or_empty(document)));
        let inserted = storage.revisions.delete(
            ctx,
            &document.id,
            &body,
            document.flags,
            change_vector,
            document.last_modified_ticks,
            Origin::Replication,
        )?;
        let config = storage
            .revisions
            .get_revisions_configuration(&collection_of(&body), document.flags);
        if inserted && !(config.purge_on_delete && !config.disabled) {
            put_from_revision_if_newer(ctx, document, None, change_vector)?;
        }
        return Ok(());
    }

    let existing = storage.documents.get_document_or_tombstone(ctx.txn(), &document.id)?;
    let status = conflict_status(change_vector, existing.as_ref().map(DocumentOrTombstone::change_vector));
    let has_local_cluster_tx = existing
        .as_ref()
        .is_some_and(|e| e.flags().contains(DocumentFlags::FROM_CLUSTER_TRANSACTION));
    let has_remote_cluster_tx = document.flags.contains(DocumentFlags::FROM_CLUSTER_TRANSACTION);

    match status {
        ConflictStatus::Update => apply_update(
            ctx,
            document,
            body,
            change_vector.clone(),
            document.flags,
            has_local_cluster_tx,
        ),
        ConflictStatus::Conflict if has_local_cluster_tx => {
            // the local cluster transaction wins, carrying both vectors
            let Some(local) = existing else {
                return Err(Error::invariant(format!(
                    "Local cluster transaction but no matching document or tombstone for '{}'",
                    document.id
                )));
            };
            let merged = change_vector.merge(local.change_vector());
            let local_body = match local {
                DocumentOrTombstone::Document(doc) => Some(doc.body),
                DocumentOrTombstone::Tombstone(_) => None,
            };
            debug!(id = %document.id, "Conflict resolved to the local cluster transaction");
            apply_update(ctx, document, local_body, merged, document.flags, true)
        }
        ConflictStatus::Conflict if has_remote_cluster_tx => {
            debug!(id = %document.id, "Conflict resolved to the remote cluster transaction");
            apply_update(ctx, document, body, change_vector.clone(), document.flags, true)
        }
        ConflictStatus::Conflict => {
            let Some(local) = existing else {
                return Err(Error::invariant(format!(
                    "Conflict reported for '{}' without a local version",
                    document.id
                )));
            };
            resolve_conflict(ctx, document, body, change_vector, local)
        }
        ConflictStatus::AlreadyMerged | ConflictStatus::EqualButFlagsDiffer => {
            debug!(id = %document.id, change_vector = %change_vector, "Document already merged");
            Ok(())
        }
    }
}

/// A new replicated revision whose vector dominates the local version also
/// becomes the live document; a delete revision deletes it. Conflicted
/// revisions never do.
fn put_from_revision_if_newer(
    ctx: &mut TxContext<'_, '_>,
    document: &ReplicatedDocument,
    body: Option<&Value>,
    change_vector: &ChangeVector,
) -> Result<()> {
    if document.flags.contains(DocumentFlags::CONFLICTED) {
        return Ok(());
    }
    let storage = ctx.storage();
    let existing = storage.documents.get_document_or_tombstone(ctx.txn(), &document.id)?;
    let status = conflict_status(change_vector, existing.as_ref().map(DocumentOrTombstone::change_vector));
    if status != ConflictStatus::Update {
        return Ok(());
    }

    if document.flags.contains(DocumentFlags::RESOLVED) {
        if let Some(DocumentOrTombstone::Document(local)) = &existing {
            storage.revisions.put(
                ctx,
                &local.id,
                &local.body,
                local.flags,
                &local.change_vector,
                local.last_modified_ticks,
                None,
            )?;
        }
    }

    let flags = document
        .flags
        .strip(DocumentFlags::REVISION | DocumentFlags::DELETE_REVISION);
    debug!(id = %document.id, change_vector = %change_vector, deleted = body.is_none(), "Document updated from revision");
    match body {
        Some(body) => {
            storage.documents.put(
                ctx,
                &document.id,
                body,
                flags,
                Origin::Replication,
                Some(change_vector),
                Some(document.last_modified_ticks),
            )?;
        }
        None => {
            storage.documents.delete(
                ctx,
                &document.id,
                Origin::Replication,
                Some(change_vector),
                Some(document.last_modified_ticks),
                document.collection.as_deref(),
                flags,
            )?;
        }
    }
    Ok(())
}

fn collection_or_empty(document: &ReplicatedDocument) -> &str {
    document.collection.as_deref().unwrap_or(EMPTY_COLLECTION)
}

fn assert_attachments(
    ctx: &TxContext<'_, '_>,
    id: &str,
    body: &Value,
    supports_missing_attachments: bool,
) -> Result<()> {
    let storage = ctx.storage();
    let mut missing = Vec::new();
    for hash in attachment_hashes(body) {
        if !storage.attachments.exists(ctx.txn(), &hash)? {
            missing.push(hash);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    let message = format!(
        "Document '{}' lists attachments that are not stored locally: {}",
        id,
        missing.join(", ")
    );
    if supports_missing_attachments {
        return Err(Error::missing_attachment(message));
    }
    warn!("{}", message);
    Ok(())
}

/// Overwrite the local version with `body` (or delete it when `None`).
/// A cluster-transaction flag on either side is stripped first.
fn apply_update(
    ctx: &mut TxContext<'_, '_>,
    document: &ReplicatedDocument,
    body: Option<Value>,
    change_vector: ChangeVector,
    flags: DocumentFlags,
    strip_cluster_tx: bool,
) -> Result<()> {
    let storage = ctx.storage();
    let flags = if strip_cluster_tx {
        flags.strip(DocumentFlags::FROM_CLUSTER_TRANSACTION)
    } else {
        flags
    };

    match body {
        Some(body) => {
            storage.documents.put(
                ctx,
                &document.id,
                &body,
                flags,
                Origin::Replication,
                Some(&change_vector),
                Some(document.last_modified_ticks),
            )?;
        }
        None => {
            storage.documents.delete(
                ctx,
                &document.id,
                Origin::Replication,
                Some(&change_vector),
                Some(document.last_modified_ticks),
                document.collection.as_deref(),
                flags,
            )?;
        }
    }
    Ok(())
}

fn resolve_conflict(
    ctx: &mut TxContext<'_, '_>,
    document: &ReplicatedDocument,
    body: Option<Value>,
    change_vector: &ChangeVector,
    local: DocumentOrTombstone,
) -> Result<()> {
    let storage = ctx.storage();

    // keep both sides in the revision chain
    let local_ticks = match &local {
        DocumentOrTombstone::Document(doc) => {
            storage.revisions.put(
                ctx,
                &doc.id,
                &doc.body,
                doc.flags | DocumentFlags::CONFLICTED,
                &doc.change_vector,
                doc.last_modified_ticks,
                None,
            )?;
            doc.last_modified_ticks
        }
        DocumentOrTombstone::Tombstone(tombstone) => {
            storage.revisions.delete(
                ctx,
                &tombstone.id,
                &delete_marker_body(&tombstone.collection),
                tombstone.flags | DocumentFlags::CONFLICTED,
                &tombstone.change_vector,
                tombstone.last_modified_ticks,
                Origin::Replication,
            )?;
            tombstone.last_modified_ticks
        }
    };
    let incoming_flags = document.flags | DocumentFlags::CONFLICTED;
    match &body {
        Some(body) => {
            storage.revisions.put(
                ctx,
                &document.id,
                body,
                incoming_flags,
                change_vector,
                document.last_modified_ticks,
                None,
            )?;
        }
        None => {
            storage.revisions.delete(
                ctx,
                &document.id,
                &delete_marker_body(collection_or_empty(document)),
                incoming_flags,
                change_vector,
                document.last_modified_ticks,
                Origin::Replication,
            )?;
        }
    }

    let merged = change_vector.merge(local.change_vector());
    let incoming_wins = document.last_modified_ticks >= local_ticks;
    let (winner_body, winner_flags, collection) = match (incoming_wins, local) {
        (true, local) => {
            let collection = match &local {
                DocumentOrTombstone::Document(doc) => doc.collection.clone(),
                DocumentOrTombstone::Tombstone(t) => t.collection.clone(),
            };
            let collection = document.collection.clone().unwrap_or(collection);
            (body, document.flags, collection)
        }
        (false, DocumentOrTombstone::Document(doc)) => (Some(doc.body), doc.flags, doc.collection),
        (false, DocumentOrTombstone::Tombstone(t)) => (None, t.flags, t.collection),
    };
    let flags = winner_flags.strip(
        DocumentFlags::FROM_REPLICATION
            | DocumentFlags::FROM_CLUSTER_TRANSACTION
            | DocumentFlags::REVISION
            | DocumentFlags::DELETE_REVISION,
    ) | DocumentFlags::RESOLVED
        | DocumentFlags::CONFLICTED;

    info!(
        id = %document.id,
        incoming = %change_vector,
        resolved = %merged,
        winner = if incoming_wins { "remote" } else { "local" },
        "Resolved conflict"
    );

    match winner_body {
        Some(body) => {
            storage.documents.put(
                ctx,
                &document.id,
                &body,
                flags,
                Origin::Local,
                Some(&merged),
                None,
            )?;
        }
        None => {
            let live = storage.documents.get(ctx.txn(), &document.id)?.is_some();
            let origin = if live { Origin::Local } else { Origin::Replication };
            let ticks = if live { None } else { Some(document.last_modified_ticks.max(local_ticks)) };
            storage.documents.delete(
                ctx,
                &document.id,
                origin,
                Some(&merged),
                ticks,
                Some(&collection),
                flags,
            )?;
        }
    }
    Ok(())
}
