//! Meridian Core - Multi-Master Document Replication
//!
//! This crate provides the replication subsystem of the Meridian document
//! database, implementing:
//! - Change vectors (causality vectors) and conflict classification
//! - Document, attachment, counter and revision stores over LMDB
//! - A single-writer transaction merger per database
//! - The conflict resolver that applies replicated batches
//! - The binary replication wire codec
//! - The incoming replication session (one thread per peer connection)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Incoming Replication Session         │
//! │   (Envelope frames, keep-alive, replies)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │              Wire Codec                     │
//! │  (Read buffer, items, attachment streams)   │
//! └──────────────┬──────────────────────────────┘
//!                │  one batch = one command
//! ┌──────────────┴──────────────────────────────┐
//! │   Transaction Merger + Conflict Resolver    │
//! │     (Single writer, change vectors)         │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │             Storage Layer                   │
//! │ (Documents, Revisions, Attachments, Counters)│
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod change_vector;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod merger;
pub mod replication;
pub mod storage;
pub mod testing;
pub mod time;

pub use change_vector::{ChangeVector, ConflictStatus};
pub use config::{DatabaseConfig, ReplicationConfig, RevisionsCollectionConfiguration, RevisionsConfiguration};
pub use database::Database;
pub use document::{Document, DocumentFlags, Origin};
pub use error::{Error, Result};
