//! Meridian Server - TCP endpoint for incoming replication
//!
//! Opens one database and accepts replication connections from peer nodes.
//! Every connection starts with a hello frame naming the source database,
//! then carries `Documents` and `Heartbeat` messages served by
//! [`meridian_core::replication::IncomingReplicationHandler`].

pub mod config;
pub mod server;

pub use config::Config;
pub use server::ReplicationServer;
