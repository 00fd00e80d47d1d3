//! Transaction merger
//!
//! All writes to a database go through a single writer thread, so there is
//! never more than one LMDB write transaction open per database. Callers
//! enqueue a [`MergedCommand`] and get a [`PendingCommand`] back; the writer
//! thread runs the command inside its own write transaction, commits, drops
//! the command and then signals completion.
//!
//! The merger uses:
//! - A bounded channel between submitters and the writer thread
//! - One reply channel per command for the completion signal
//! - Graceful shutdown: queued commands are drained before the thread exits

use crate::error::{Error, Result};
use crate::storage::{Storage, TxContext};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Unit of work executed inside one write transaction
pub trait MergedCommand: Send {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "command"
    }

    /// Apply the command; returns the number of items it touched
    fn execute(&mut self, ctx: &mut TxContext<'_, '_>) -> Result<usize>;
}

/// Adapter running a closure as a merged command
pub struct FnCommand<F> {
    name: &'static str,
    f: Option<F>,
}

impl<F> FnCommand<F>
where
    F: FnOnce(&mut TxContext<'_, '_>) -> Result<usize> + Send,
{
    /// Wrap `f`
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f: Some(f) }
    }
}

impl<F> MergedCommand for FnCommand<F>
where
    F: FnOnce(&mut TxContext<'_, '_>) -> Result<usize> + Send,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&mut self, ctx: &mut TxContext<'_, '_>) -> Result<usize> {
        let f = self
            .f
            .take()
            .ok_or_else(|| Error::internal(format!("Command '{}' executed twice", self.name)))?;
        f(ctx)
    }
}

/// Commands sent to the writer thread
enum MergerCommand {
    /// Run a command and report back
    Execute {
        command: Box<dyn MergedCommand>,
        reply: Sender<Result<usize>>,
    },
    /// Stop the writer thread
    Shutdown,
}

/// Completion handle of an enqueued command
pub struct PendingCommand {
    receiver: Receiver<Result<usize>>,
    outcome: Option<Result<usize>>,
}

impl PendingCommand {
    /// Wait up to `timeout`; true once the command finished
    pub fn wait_timeout(&mut self, timeout: Duration) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.outcome = Some(Err(merger_stopped()));
                true
            }
        }
    }

    /// Non-blocking completion check
    pub fn is_completed(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.outcome = Some(Err(merger_stopped()));
                true
            }
        }
    }

    /// Block until the command finished and return its outcome
    pub fn wait(mut self) -> Result<usize> {
        if let Some(outcome) = self.outcome.take() {
            return outcome;
        }
        self.receiver.recv().unwrap_or_else(|_| Err(merger_stopped()))
    }
}

fn merger_stopped() -> Error {
    Error::transaction("Transaction merger stopped before completing the command")
}

/// Statistics for the transaction merger
#[derive(Debug, Clone, Default)]
pub struct MergerStats {
    /// Commands accepted into the queue
    pub commands_enqueued: u64,
    /// Commands committed
    pub commands_committed: u64,
    /// Commands whose transaction was rolled back
    pub commands_failed: u64,
    /// Total time spent executing commands (in microseconds)
    pub total_execution_us: u64,
}

#[derive(Default)]
struct MergerCounters {
    enqueued: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    execution_us: AtomicU64,
}

/// Single-writer scheduler for one database
pub struct TransactionMerger {
    /// Command sender to the writer thread
    sender: Sender<MergerCommand>,
    /// Writer thread handle
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Statistics
    counters: Arc<MergerCounters>,
}

impl TransactionMerger {
    /// Start the writer thread for `storage`
    pub fn new(storage: Arc<Storage>, queue_capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded(queue_capacity);
        let counters = Arc::new(MergerCounters::default());

        let counters_clone = counters.clone();
        let handle = thread::Builder::new()
            .name("meridian-txmerger".to_string())
            .spawn(move || Self::writer_thread(storage, receiver, counters_clone))?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Queue a command; blocks while the queue is full
    pub fn enqueue(&self, command: Box<dyn MergedCommand>) -> Result<PendingCommand> {
        let (reply, receiver) = bounded(1);
        self.sender
            .send(MergerCommand::Execute { command, reply })
            .map_err(|_| Error::transaction("Transaction merger is closed"))?;
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        Ok(PendingCommand {
            receiver,
            outcome: None,
        })
    }

    /// Get current statistics
    pub fn stats(&self) -> MergerStats {
        MergerStats {
            commands_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            commands_committed: self.counters.committed.load(Ordering::Relaxed),
            commands_failed: self.counters.failed.load(Ordering::Relaxed),
            total_execution_us: self.counters.execution_us.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue and stop the writer thread
    pub fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        let _ = self.sender.send(MergerCommand::Shutdown);
        handle
            .join()
            .map_err(|_| Error::transaction("Transaction merger thread panicked"))
    }

    /// Background writer thread implementation
    fn writer_thread(
        storage: Arc<Storage>,
        receiver: Receiver<MergerCommand>,
        counters: Arc<MergerCounters>,
    ) {
        debug!("Transaction merger started");

        while let Ok(message) = receiver.recv() {
            match message {
                MergerCommand::Execute { mut command, reply } => {
                    let name = command.name();
                    let start = Instant::now();
                    let outcome = storage.write(|ctx| command.execute(ctx));
                    let elapsed_us = start.elapsed().as_micros() as u64;
                    counters.execution_us.fetch_add(elapsed_us, Ordering::Relaxed);

                    match &outcome {
                        Ok(items) => {
                            counters.committed.fetch_add(1, Ordering::Relaxed);
                            debug!(command = name, items, elapsed_us, "Merged command committed");
                        }
                        Err(e) if e.is_missing_attachment() => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            debug!(command = name, "Merged command rolled back: {}", e);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            error!(command = name, "Merged command failed: {}", e);
                        }
                    }

                    // release the command's resources before the waiter resumes
                    drop(command);
                    if reply.send(outcome).is_err() {
                        debug!(command = name, "Merged command completed after its waiter left");
                    }
                }
                MergerCommand::Shutdown => break,
            }
        }

        // Fail whatever is still queued
        for message in receiver.try_iter() {
            if let MergerCommand::Execute { command, reply } = message {
                warn!(command = command.name(), "Dropping command queued after shutdown");
                let _ = reply.send(Err(Error::cancelled("Transaction merger is shutting down")));
            }
        }

        debug!("Transaction merger stopped");
    }
}

impl Drop for TransactionMerger {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
