//! Incoming replication session
//!
//! One session per peer connection. The session thread does all socket I/O
//! itself: it reads a message, hands batches to the transaction merger and,
//! while the merger works, writes "Processing" frames from the same thread,
//! so replies and keep-alives never interleave.
//!
//! ```text
//! Idle -> ReadingMessage -> ApplyingHeartbeat | ApplyingBatch -> Acknowledging -> Idle
//! ```

use super::codec::{ReadBuffer, decode_attachment_stream, decode_item};
use super::message::{
    IncomingConnectionInfo, KeepAliveFrame, MessageType, ReplicationMessageHeader,
    ReplicationMessageReply, ReplyType, read_frame, write_frame,
};
use super::resolver::{DocumentReplicationCommand, ReplicationBatch, UpdateChangeVectorCommand};
use super::streams::AttachmentStreams;
use crate::change_vector::{ChangeVector, ConflictStatus};
use crate::database::Database;
use crate::merger::PendingCommand;
use crate::time::Clock;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::io::{BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the next message
    Idle,
    /// Reading an envelope and its payload
    ReadingMessage,
    /// Merging a heartbeat
    ApplyingHeartbeat,
    /// Waiting for a batch to commit
    ApplyingBatch,
    /// Writing the reply
    Acknowledging,
    /// The session ended
    Closed,
}

/// Counters of one session
#[derive(Debug, Clone, Default)]
pub struct IncomingSessionStats {
    /// Messages read
    pub messages_handled: u64,
    /// Batches committed
    pub batches_applied: u64,
    /// Items received
    pub items_received: u64,
    /// Attachment streams received
    pub attachment_streams_received: u64,
    /// Document body bytes received
    pub document_bytes_received: u64,
    /// Heartbeats that enqueued a change vector merge
    pub heartbeats_merged: u64,
    /// Heartbeats dropped while a merge was in flight
    pub heartbeats_dropped: u64,
    /// "Processing" frames sent
    pub keep_alives_sent: u64,
    /// Time of the last heartbeat
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Serves one incoming replication connection
pub struct IncomingReplicationSession<R, W> {
    database: Arc<Database>,
    info: IncomingConnectionInfo,
    buffer: ReadBuffer<R>,
    writer: W,
    cancel: CancellationToken,
    state: SessionState,
    stats: Arc<Mutex<IncomingSessionStats>>,
    pending_change_vector_update: Option<PendingCommand>,
}

impl<R: Read, W: Write> IncomingReplicationSession<R, W> {
    /// Session reading from `reader` and replying on `writer`. Cancelled
    /// together with the database.
    pub fn new(database: Arc<Database>, info: IncomingConnectionInfo, reader: R, writer: W) -> Self {
        let config = &database.config().replication;
        let buffer = ReadBuffer::with_capacity(reader, config.read_buffer_size)
            .with_max_read(config.max_item_size.max(config.max_frame_size));
        let cancel = database.shutdown_token().child_token();
        Self {
            database,
            info,
            buffer,
            writer,
            cancel,
            state: SessionState::Idle,
            stats: Arc::new(Mutex::new(IncomingSessionStats::default())),
            pending_change_vector_update: None,
        }
    }

    /// Token that stops the session between messages
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> IncomingSessionStats {
        self.stats.lock().clone()
    }

    /// Shared counters, readable while the session runs
    pub fn stats_handle(&self) -> Arc<Mutex<IncomingSessionStats>> {
        self.stats.clone()
    }

    /// Peer identity
    pub fn info(&self) -> &IncomingConnectionInfo {
        &self.info
    }

    /// Reply side of the connection
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Serve messages until the peer disconnects, the session is cancelled
    /// or a fatal error occurs
    pub fn run(&mut self) -> Result<()> {
        info!(
            source = %self.info.source_database_id,
            source_name = %self.info.source_database_name,
            source_url = %self.info.source_url,
            "Incoming replication session started"
        );

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            match self.handle_next_message() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(source = %self.info.source_database_id, "Peer closed the connection");
                    break Ok(());
                }
                Err(e) if e.is_cancellation() || self.cancel.is_cancelled() => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Some(pending) = self.pending_change_vector_update.take() {
            if let Err(e) = pending.wait() {
                debug!("Change vector update finished with: {}", e);
            }
        }
        self.state = SessionState::Closed;

        match &result {
            Ok(()) => info!(source = %self.info.source_database_id, "Incoming replication session ended"),
            Err(e) => error!(source = %self.info.source_database_id, "Incoming replication session failed: {}", e),
        }
        result
    }

    /// Read and answer one message. `Ok(false)` when the peer closed the
    /// connection cleanly before a new message.
    pub fn handle_next_message(&mut self) -> Result<bool> {
        self.state = SessionState::Idle;
        self.buffer.shrink();
        if !self.buffer.fill_or_eof()? {
            return Ok(false);
        }

        self.state = SessionState::ReadingMessage;
        let max_frame_size = self.database.config().replication.max_frame_size;
        let header: ReplicationMessageHeader = read_frame(&mut self.buffer, max_frame_size)?;
        self.stats.lock().messages_handled += 1;

        match self.handle_message(&header) {
            Ok(()) => {
                self.state = SessionState::Acknowledging;
                self.send_ok(&header)?;
                Ok(true)
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) if e.is_missing_attachment() => {
                warn!(source = %self.info.source_database_id, "{}", e);
                self.state = SessionState::Acknowledging;
                self.send_failure(ReplyType::MissingAttachments, &header, &e)?;
                Ok(true)
            }
            Err(e) => {
                error!(
                    source = %self.info.source_database_id,
                    message_type = %header.message_type,
                    "Failed to handle replication message: {}", e
                );
                self.state = SessionState::Acknowledging;
                if let Err(send_error) = self.send_failure(ReplyType::Error, &header, &e) {
                    debug!("Could not send the error reply: {}", send_error);
                    return Err(e);
                }
                if e.is_stream_fault() || matches!(e, Error::InvariantViolation(_)) {
                    return Err(e);
                }
                Ok(true)
            }
        }
    }

    fn handle_message(&mut self, header: &ReplicationMessageHeader) -> Result<()> {
        match header.kind()? {
            MessageType::Heartbeat => {
                self.state = SessionState::ApplyingHeartbeat;
                self.handle_heartbeat(header)
            }
            MessageType::Documents => {
                self.state = SessionState::ApplyingBatch;
                self.handle_documents(header)
            }
        }
    }

    fn handle_heartbeat(&mut self, header: &ReplicationMessageHeader) -> Result<()> {
        self.stats.lock().last_heartbeat = Some(self.database.clock().utc_now());
        let Some(raw) = &header.database_change_vector else {
            return Ok(());
        };
        let incoming = ChangeVector::parse(raw)?;

        // one merge in flight per connection; later heartbeats resend the same data
        if let Some(pending) = &mut self.pending_change_vector_update {
            if !pending.is_completed() {
                self.stats.lock().heartbeats_dropped += 1;
                debug!(source = %self.info.source_database_id, "Change vector update in flight, heartbeat dropped");
                return Ok(());
            }
            if let Some(finished) = self.pending_change_vector_update.take() {
                if let Err(e) = finished.wait() {
                    warn!("Previous change vector update failed: {}", e);
                }
            }
        }

        let source = self.info.source_database_id.clone();
        let last_document_etag = header.last_document_etag.unwrap_or(0);
        let (local, last_replicated) = self.database.read(|txn, storage| {
            Ok((
                storage.database_change_vector(txn)?,
                storage.last_replicated_etag(txn, &source)?,
            ))
        })?;

        if ChangeVector::compare(&incoming, &local) == ConflictStatus::Update
            || last_document_etag > last_replicated
        {
            let command = UpdateChangeVectorCommand::new(source, last_document_etag, Some(incoming));
            self.pending_change_vector_update = Some(self.database.enqueue(Box::new(command))?);
            self.stats.lock().heartbeats_merged += 1;
        }
        Ok(())
    }

    fn handle_documents(&mut self, header: &ReplicationMessageHeader) -> Result<()> {
        let last_etag = header
            .last_document_etag
            .ok_or_else(|| Error::protocol("Documents message without 'LastDocumentEtag'"))?;
        let items_count = required_count(header.items_count, "ItemsCount")?;
        let streams_count = required_count(header.attachment_streams_count, "AttachmentStreamsCount")?;

        let mut items = Vec::with_capacity(items_count.min(4096));
        let mut document_bytes = 0u64;
        for _ in 0..items_count {
            let item = decode_item(&mut self.buffer)?;
            document_bytes += item.document_size() as u64;
            items.push(item);
        }

        let mut streams = AttachmentStreams::new();
        for _ in 0..streams_count {
            decode_attachment_stream(&mut self.buffer, &mut streams)?;
        }

        {
            let mut stats = self.stats.lock();
            stats.items_received += items_count as u64;
            stats.attachment_streams_received += streams_count as u64;
            stats.document_bytes_received += document_bytes;
        }

        let config = &self.database.config().replication;
        if document_bytes > config.max_batch_document_bytes {
            warn!(
                source = %self.info.source_database_id,
                document_bytes,
                limit = config.max_batch_document_bytes,
                "Replication batch exceeds the document size limit"
            );
        }
        debug!(
            source = %self.info.source_database_id,
            last_etag,
            items = items_count,
            streams = streams_count,
            "Received replication batch"
        );

        let batch = ReplicationBatch {
            source_database_id: self.info.source_database_id.clone(),
            last_etag,
            items,
            streams,
            supports_missing_attachments: config.supports_missing_attachments,
        };
        let pending = self
            .database
            .enqueue(Box::new(DocumentReplicationCommand::new(batch)))?;
        self.wait_with_keep_alive(pending)?;

        self.stats.lock().batches_applied += 1;
        Ok(())
    }

    /// Wait for `pending`, writing a keep-alive frame each interval. The
    /// command is always awaited, even when writing fails.
    fn wait_with_keep_alive(&mut self, mut pending: PendingCommand) -> Result<()> {
        let interval = self.database.config().replication.keep_alive_interval();
        loop {
            if pending.wait_timeout(interval) {
                return pending.wait().map(|_| ());
            }
            if let Err(e) = write_frame(&mut self.writer, &KeepAliveFrame::default()) {
                if let Err(apply_error) = pending.wait() {
                    debug!("Batch failed after the connection broke: {}", apply_error);
                }
                return Err(e);
            }
            self.stats.lock().keep_alives_sent += 1;
        }
    }

    fn send_ok(&mut self, header: &ReplicationMessageHeader) -> Result<()> {
        let source = self.info.source_database_id.clone();
        let (current_etag, change_vector, last_replicated) = self.database.read(|txn, storage| {
            Ok((
                storage.last_etag(txn)?,
                storage.database_change_vector(txn)?,
                storage.last_replicated_etag(txn, &source)?,
            ))
        })?;

        let reply = ReplicationMessageReply {
            reply_type: ReplyType::Ok,
            message_type: header.message_type.clone(),
            last_etag_accepted: header.last_document_etag.unwrap_or(last_replicated),
            current_etag,
            database_change_vector: Some(change_vector.to_string()),
            database_id: Some(self.database.database_id().to_string()),
            node_tag: Some(self.database.node_tag().to_string()),
            exception: None,
        };
        write_frame(&mut self.writer, &reply)
    }

    fn send_failure(&mut self, reply_type: ReplyType, header: &ReplicationMessageHeader, error: &Error) -> Result<()> {
        let (current_etag, change_vector) = self.database.read(|txn, storage| {
            Ok((storage.last_etag(txn)?, storage.database_change_vector(txn)?))
        })?;

        let reply = ReplicationMessageReply {
            reply_type,
            message_type: header.message_type.clone(),
            last_etag_accepted: -1,
            current_etag,
            database_change_vector: Some(change_vector.to_string()),
            database_id: Some(self.database.database_id().to_string()),
            node_tag: Some(self.database.node_tag().to_string()),
            exception: Some(error.to_string()),
        };
        write_frame(&mut self.writer, &reply)
    }
}

fn required_count(value: Option<i32>, field: &str) -> Result<usize> {
    let value = value.ok_or_else(|| Error::protocol(format!("Documents message without '{}'", field)))?;
    usize::try_from(value).map_err(|_| Error::protocol(format!("Negative '{}': {}", field, value)))
}

/// Owns the session thread of one TCP connection
pub struct IncomingReplicationHandler {
    info: IncomingConnectionInfo,
    stream: TcpStream,
    cancel: CancellationToken,
    stats: Arc<Mutex<IncomingSessionStats>>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl IncomingReplicationHandler {
    /// Start serving `stream` on a new thread
    pub fn start(database: Arc<Database>, stream: TcpStream, info: IncomingConnectionInfo) -> Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = BufWriter::new(stream.try_clone()?);

        let mut session = IncomingReplicationSession::new(database, info.clone(), reader, writer);
        let cancel = session.cancellation_token();
        let stats = session.stats_handle();
        let running = Arc::new(AtomicBool::new(true));

        let running_flag = running.clone();
        let thread = thread::Builder::new()
            .name(format!("replication-in-{}", info.source_database_id))
            .spawn(move || {
                let result = session.run();
                running_flag.store(false, Ordering::Release);
                result
            })?;

        Ok(Self {
            info,
            stream,
            cancel,
            stats,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Peer identity
    pub fn info(&self) -> &IncomingConnectionInfo {
        &self.info
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> IncomingSessionStats {
        self.stats.lock().clone()
    }

    /// True until the session thread returns
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the session: cancel its token and shut the socket down so a
    /// blocked read returns. An in-flight batch is still awaited.
    pub fn cancel(&self) {
        self.cancel.cancel();
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown: {}", e);
        }
    }

    /// Wait for the session thread. Returns the session outcome the first
    /// time; later calls return `Ok(())`.
    pub fn join(&self) -> Result<()> {
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| Error::internal("Incoming replication thread panicked"))?
    }
}

impl Drop for IncomingReplicationHandler {
    fn drop(&mut self) {
        self.cancel();
        if let Err(e) = self.join() {
            debug!("Incoming replication handler stopped with: {}", e);
        }
    }
}
