//! Incoming replication over loopback TCP and through the wire codec

use meridian_core::replication::codec::{
    decode_attachment_stream, decode_item, encode_batch,
};
use meridian_core::replication::items::{
    ReplicatedAttachment, ReplicatedAttachmentTombstone, ReplicatedCounter, ReplicatedDocument,
};
use meridian_core::replication::message::{read_reply, write_frame};
use meridian_core::replication::{
    AttachmentStreams, IncomingConnectionInfo, IncomingReplicationHandler, ItemPayload, ReadBuffer,
    ReplicationItem, ReplicationMessageHeader, ReplicationMessageReply, ReplyType,
};
use meridian_core::storage::attachments::AttachmentsStorage;
use meridian_core::testing::{ChunkedReader, TestContext};
use meridian_core::time::Clock;
use meridian_core::{ChangeVector, Database, DocumentFlags};
use serde_json::{Value, json};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;

struct Peer {
    stream: TcpStream,
    replies: ReadBuffer<TcpStream>,
    handler: IncomingReplicationHandler,
}

impl Peer {
    fn connect(database: Arc<Database>, source: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        let info = IncomingConnectionInfo::new(source, "source", "tcp://source");
        let handler = IncomingReplicationHandler::start(database, accepted, info).unwrap();
        let replies = ReadBuffer::new(stream.try_clone().unwrap());
        Self {
            stream,
            replies,
            handler,
        }
    }

    fn send_batch(
        &mut self,
        last_etag: i64,
        items: &[ReplicationItem],
        streams: &[(String, Vec<u8>)],
    ) -> ReplicationMessageReply {
        let header = ReplicationMessageHeader::documents(last_etag, items.len() as i32, streams.len() as i32);
        write_frame(&mut self.stream, &header).unwrap();
        let payload = encode_batch(items, streams).unwrap();
        std::io::Write::write_all(&mut self.stream, &payload).unwrap();
        read_reply(&mut self.replies, 1 << 20).unwrap().0
    }

    fn send_heartbeat(&mut self, last_etag: i64, change_vector: &str) -> ReplicationMessageReply {
        let header = ReplicationMessageHeader::heartbeat(last_etag, Some(change_vector.to_string()));
        write_frame(&mut self.stream, &header).unwrap();
        read_reply(&mut self.replies, 1 << 20).unwrap().0
    }

    fn close(self) -> IncomingReplicationHandler {
        self.stream.shutdown(Shutdown::Write).unwrap();
        self.handler.join().unwrap();
        self.handler
    }
}

fn document(id: &str, change_vector: &str, body: Value, ticks: i64) -> ReplicationItem {
    ReplicationItem::new(
        change_vector,
        1,
        ItemPayload::Document(ReplicatedDocument {
            id: id.to_string(),
            last_modified_ticks: ticks,
            flags: DocumentFlags::NONE,
            body: Some(serde_json::to_vec(&body).unwrap()),
            collection: None,
        }),
    )
}

#[test]
fn test_single_document_batch_end_to_end() {
    let ctx = TestContext::new();
    let database = ctx.database("B");
    database.put_document("local/1", &json!({"Name": "local"})).unwrap();

    let mut peer = Peer::connect(database.clone(), "A");
    let reply = peer.send_batch(42, &[document("doc/1", "A:1", json!({"Name": "Oren"}), 1)], &[]);

    assert_eq!(reply.reply_type, ReplyType::Ok);
    assert_eq!(reply.last_etag_accepted, 42);
    assert_eq!(reply.current_etag, 2);
    let merged = ChangeVector::parse(reply.database_change_vector.as_deref().unwrap()).unwrap();
    assert_eq!(merged.get("A"), 1);
    assert_eq!(merged.get("B"), 1);
    assert_eq!(reply.database_id.as_deref(), Some("B"));

    let handler = peer.close();
    assert!(!handler.is_running());
    let stats = handler.stats();
    assert_eq!(stats.batches_applied, 1);
    assert_eq!(stats.items_received, 1);

    let stored = database.get_document("doc/1").unwrap().unwrap();
    assert_eq!(stored.change_vector.to_string(), "A:1");
    assert!(stored.flags.contains(DocumentFlags::FROM_REPLICATION));
    assert_eq!(database.last_replicated_etag("A").unwrap(), 42);
    database
        .read(|txn, storage| {
            assert!(!storage.revisions.has_revisions(txn, "doc/1")?);
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_missing_attachment_reply_then_resend() {
    let ctx = TestContext::new();
    let database = ctx.database("B");
    let content = b"avatar bytes".to_vec();
    let hash = AttachmentsStorage::compute_hash(&content);

    let with_attachment = || {
        let mut item = document(
            "users/1",
            "A:2",
            json!({"@metadata": {"@attachments": [{"Name": "avatar.png", "Hash": hash}]}}),
            5,
        );
        if let ItemPayload::Document(doc) = &mut item.payload {
            doc.flags = DocumentFlags::HAS_ATTACHMENTS;
        }
        item
    };

    let mut peer = Peer::connect(database.clone(), "A");
    let reply = peer.send_batch(2, &[with_attachment()], &[]);
    assert_eq!(reply.reply_type, ReplyType::MissingAttachments);
    assert_eq!(reply.last_etag_accepted, -1);
    assert!(database.get_document("users/1").unwrap().is_none());
    assert_eq!(database.last_replicated_etag("A").unwrap(), 0);

    let descriptor = ReplicationItem::new(
        "A:1",
        1,
        ItemPayload::Attachment(ReplicatedAttachment {
            key: b"users/1\x1eavatar.png".to_vec(),
            name: "avatar.png".into(),
            content_type: "image/png".into(),
            hash: hash.clone(),
        }),
    );
    let reply = peer.send_batch(2, &[descriptor, with_attachment()], &[(hash.clone(), content.clone())]);
    assert_eq!(reply.reply_type, ReplyType::Ok);
    peer.close();

    assert!(database.get_document("users/1").unwrap().is_some());
    database
        .read(|txn, storage| {
            assert_eq!(storage.attachments.get_content(txn, &hash)?, Some(content.clone()));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_conflict_between_two_peers() {
    let ctx = TestContext::new();
    let database = ctx.database("C");
    let now = ctx.clock().now_ticks();

    let mut a = Peer::connect(database.clone(), "A");
    let reply = a.send_batch(1, &[document("users/1", "A:1", json!({"Name": "from A"}), now)], &[]);
    assert_eq!(reply.reply_type, ReplyType::Ok);
    a.close();

    let mut b = Peer::connect(database.clone(), "B");
    let reply = b.send_batch(1, &[document("users/1", "B:1", json!({"Name": "from B"}), now + 1)], &[]);
    assert_eq!(reply.reply_type, ReplyType::Ok);
    b.close();

    let stored = database.get_document("users/1").unwrap().unwrap();
    assert_eq!(stored.body["Name"], "from B");
    assert!(stored.flags.contains(DocumentFlags::RESOLVED));
    assert!(stored.change_vector.get("A") >= 1);
    assert!(stored.change_vector.get("B") >= 1);

    database
        .read(|txn, storage| {
            let (revisions, _) = storage.revisions.get_revisions(txn, "users/1", 0, 10)?;
            assert!(revisions.iter().any(|r| r.flags.contains(DocumentFlags::CONFLICTED)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn test_heartbeat_advances_checkpoint() {
    let ctx = TestContext::new();
    let database = ctx.database("B");

    let mut peer = Peer::connect(database.clone(), "A");
    let reply = peer.send_heartbeat(9, "A:9");
    assert_eq!(reply.reply_type, ReplyType::Ok);
    assert_eq!(reply.message_type, "Heartbeat");
    let handler = peer.close();

    assert_eq!(handler.stats().heartbeats_merged, 1);
    assert_eq!(database.last_replicated_etag("A").unwrap(), 9);
    assert_eq!(database.database_change_vector().unwrap().get("A"), 9);
}

#[test]
fn test_cancel_stops_idle_session() {
    let ctx = TestContext::new();
    let database = ctx.database("B");

    let peer = Peer::connect(database, "A");
    peer.handler.cancel();
    peer.handler.join().unwrap();
    assert!(!peer.handler.is_running());
}

#[test]
fn test_mixed_batch_wire_round_trip() {
    let content = vec![7u8; 300];
    let hash = AttachmentsStorage::compute_hash(&content);

    let mut live = document("users/1", "A:1, B:3", json!({"Name": "x".repeat(200)}), 10);
    if let ItemPayload::Document(doc) = &mut live.payload {
        doc.flags = DocumentFlags::FROM_REPLICATION;
    }
    let items = vec![
        live,
        ReplicationItem::new(
            "A:2",
            2,
            ItemPayload::DocumentTombstone(ReplicatedDocument {
                id: "users/2".into(),
                last_modified_ticks: 11,
                flags: DocumentFlags::FROM_REPLICATION,
                body: None,
                collection: Some("Users".into()),
            }),
        ),
        ReplicationItem::new(
            "A:3",
            2,
            ItemPayload::Attachment(ReplicatedAttachment {
                key: b"users/1\x1eblob".to_vec(),
                name: "blob".into(),
                content_type: "application/octet-stream".into(),
                hash: hash.clone(),
            }),
        ),
        ReplicationItem::new(
            "A:4",
            3,
            ItemPayload::AttachmentTombstone(ReplicatedAttachmentTombstone {
                key: b"users/1\x1eold".to_vec(),
                last_modified_ticks: 12,
            }),
        ),
        ReplicationItem::new(
            "A:5",
            3,
            ItemPayload::Counter(ReplicatedCounter {
                document_id: "users/1".into(),
                collection: "Users".into(),
                name: "likes".into(),
                value: -4,
            }),
        ),
    ];

    let wire = encode_batch(&items, &[(hash.clone(), content.clone())]).unwrap();
    let mut buffer = ReadBuffer::with_capacity(ChunkedReader::new(wire, 13), 64);

    let decoded: Vec<ReplicationItem> = (0..items.len())
        .map(|_| decode_item(&mut buffer).unwrap())
        .collect();
    assert_eq!(decoded, items);

    let mut streams = AttachmentStreams::new();
    assert_eq!(decode_attachment_stream(&mut buffer, &mut streams).unwrap(), hash);
    assert_eq!(streams.take(&hash).unwrap(), Some(content));
    assert!(!buffer.fill_or_eof().unwrap());
}
