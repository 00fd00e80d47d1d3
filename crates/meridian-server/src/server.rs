//! Replication listener
//!
//! Accepts TCP connections on the tokio runtime, reads the connection hello
//! and hands the socket to a blocking [`IncomingReplicationHandler`] thread.

use meridian_core::Database;
use meridian_core::replication::IncomingReplicationHandler;
use meridian_core::replication::message::{IncomingConnectionInfo, read_unbuffered_frame};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Serves incoming replication for one database
pub struct ReplicationServer {
    database: Arc<Database>,
    listener: TcpListener,
    handlers: Arc<Mutex<Vec<IncomingReplicationHandler>>>,
}

impl ReplicationServer {
    /// Bind the listener
    pub async fn bind(database: Arc<Database>, addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, database = %database.name(), "Replication listener bound");
        Ok(Self {
            database,
            listener,
            handlers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sessions still running
    pub fn active_sessions(&self) -> usize {
        self.handlers.lock().iter().filter(|h| h.is_running()).count()
    }

    /// Accept connections until `shutdown` resolves, then stop every session
    /// and close the database
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    debug!(%peer, "Connection accepted");
                    let database = self.database.clone();
                    let handlers = self.handlers.clone();
                    tokio::task::spawn_blocking(move || {
                        match accept_connection(database, stream) {
                            Ok(handler) => {
                                let mut handlers = handlers.lock();
                                handlers.retain(|h| h.is_running());
                                handlers.push(handler);
                            }
                            Err(e) => warn!(%peer, "Rejected replication connection: {}", e),
                        }
                    });
                }
            }
        }

        self.shutdown().await
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        self.database.shutdown_token().cancel();
        let handlers = std::mem::take(&mut *self.handlers.lock());
        info!(sessions = handlers.len(), "Stopping replication sessions");

        let database = self.database.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for handler in &handlers {
                handler.cancel();
            }
            for handler in &handlers {
                if let Err(e) = handler.join() {
                    warn!(source = %handler.info().source_database_id, "Session ended with error: {}", e);
                }
            }
            database.close()?;
            Ok(())
        })
        .await??;

        info!("Replication server stopped");
        Ok(())
    }
}

/// Read the hello and start the session thread
fn accept_connection(database: Arc<Database>, stream: TcpStream) -> anyhow::Result<IncomingReplicationHandler> {
    let mut stream = stream.into_std()?;
    stream.set_nonblocking(false)?;

    let replication = &database.config().replication;
    stream.set_read_timeout(Some(replication.active_connection_timeout))?;
    let info: IncomingConnectionInfo = read_unbuffered_frame(&mut stream, replication.max_frame_size)?;
    stream.set_read_timeout(None)?;

    info!(
        source = %info.source_database_id,
        source_name = %info.source_database_name,
        source_url = %info.source_url,
        "Incoming replication connection"
    );
    Ok(IncomingReplicationHandler::start(database, stream, info)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::DatabaseConfig;
    use meridian_core::replication::codec::encode_batch;
    use meridian_core::replication::items::ReplicatedDocument;
    use meridian_core::replication::message::{read_reply, write_frame};
    use meridian_core::replication::{
        ItemPayload, ReadBuffer, ReplicationItem, ReplicationMessageHeader, ReplyType,
    };
    use meridian_core::DocumentFlags;
    use std::io::Write;
    use tokio::sync::oneshot;

    fn open_database(dir: &tempfile::TempDir) -> Arc<Database> {
        let config = DatabaseConfig::new("B", dir.path().join("B"))
            .with_database_id("B")
            .with_map_size(64 * 1024 * 1024);
        Arc::new(Database::open(config).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hello_then_batch() {
        let dir = tempfile::tempdir().unwrap();
        let database = open_database(&dir);
        let server = ReplicationServer::bind(database.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            write_frame(&mut stream, &IncomingConnectionInfo::new("A", "source", "tcp://a")).unwrap();

            let item = ReplicationItem::new(
                "A:1",
                1,
                ItemPayload::Document(ReplicatedDocument {
                    id: "users/1".into(),
                    last_modified_ticks: 1,
                    flags: DocumentFlags::NONE,
                    body: Some(br#"{"Name":"Oren"}"#.to_vec()),
                    collection: None,
                }),
            );
            write_frame(&mut stream, &ReplicationMessageHeader::documents(5, 1, 0)).unwrap();
            stream.write_all(&encode_batch(&[item], &[]).unwrap()).unwrap();

            let mut replies = ReadBuffer::new(stream.try_clone().unwrap());
            read_reply(&mut replies, 1 << 20).unwrap().0
        })
        .await
        .unwrap();

        assert_eq!(reply.reply_type, ReplyType::Ok);
        assert_eq!(reply.last_etag_accepted, 5);
        assert!(database.get_document("users/1").unwrap().is_some());

        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
        assert!(database.shutdown_token().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_hello_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let database = open_database(&dir);
        let server = ReplicationServer::bind(database, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(async {
            let _ = stopped.await;
        }));

        tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(&2u32.to_le_bytes()).unwrap();
            stream.write_all(b"{]").unwrap();
            let mut byte = [0u8; 1];
            // the server drops the connection without a reply
            assert_eq!(std::io::Read::read(&mut stream, &mut byte).unwrap_or(0), 0);
        })
        .await
        .unwrap();

        stop.send(()).unwrap();
        serving.await.unwrap().unwrap();
    }
}
