//! Incoming replication
//!
//! A peer database pushes its writes to us over a long-lived connection.
//! Each connection is served by one [`IncomingReplicationSession`] running on
//! its own thread:
//!
//! 1. **Envelope**: a length-prefixed JSON header (`Documents` or `Heartbeat`)
//! 2. **Items**: for `Documents`, the binary item stream ([`codec`])
//! 3. **Attachment streams**: raw blobs, spilled to a temp file ([`streams`])
//! 4. **Apply**: the whole batch becomes one merged command ([`resolver`])
//! 5. **Reply**: `Ok`, `Error` or `MissingAttachments`, with "Processing"
//!    keep-alive frames sent while the batch is applied
//!
//! # Example
//!
//! ```rust,no_run
//! use meridian_core::replication::{IncomingConnectionInfo, IncomingReplicationHandler};
//! use meridian_core::testing::TestContext;
//! use std::net::TcpListener;
//!
//! let ctx = TestContext::new();
//! let database = ctx.database("db");
//! let listener = TcpListener::bind("127.0.0.1:0").unwrap();
//! let (stream, _) = listener.accept().unwrap();
//! let info = IncomingConnectionInfo::new("A", "peer", "tcp://peer");
//! let handler = IncomingReplicationHandler::start(database, stream, info).unwrap();
//! handler.join().unwrap();
//! ```

pub mod codec;
pub mod incoming;
pub mod items;
pub mod message;
pub mod resolver;
pub mod streams;

pub use codec::ReadBuffer;
pub use incoming::{
    IncomingReplicationHandler, IncomingReplicationSession, IncomingSessionStats, SessionState,
};
pub use items::{ItemPayload, ItemType, ReplicationItem};
pub use message::{
    IncomingConnectionInfo, KeepAliveFrame, MessageType, ReplicationMessageHeader,
    ReplicationMessageReply, ReplyType,
};
pub use resolver::{DocumentReplicationCommand, ReplicationBatch, UpdateChangeVectorCommand};
pub use streams::AttachmentStreams;
