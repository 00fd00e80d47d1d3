//! Replication envelopes
//!
//! Requests, replies, keep-alive frames and the connection hello are JSON
//! documents framed as `[length:u32 LE][json:length]`.

use super::codec::ReadBuffer;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Request kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A batch of items
    Documents,
    /// The peer's change vector and last etag, without items
    Heartbeat,
}

impl MessageType {
    /// Name used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documents => "Documents",
            Self::Heartbeat => "Heartbeat",
        }
    }

    /// Parse the wire name
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "Documents" => Ok(Self::Documents),
            "Heartbeat" => Ok(Self::Heartbeat),
            other => Err(Error::protocol(format!("Unknown message type: '{}'", other))),
        }
    }
}

/// Request envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationMessageHeader {
    /// `Documents` or `Heartbeat`
    #[serde(rename = "Type")]
    pub message_type: String,
    /// Last etag of the batch at the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_document_etag: Option<i64>,
    /// Items following the envelope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_count: Option<i32>,
    /// Attachment streams following the items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_streams_count: Option<i32>,
    /// Source database change vector (heartbeats)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_change_vector: Option<String>,
}

impl ReplicationMessageHeader {
    /// `Documents` envelope
    pub fn documents(last_document_etag: i64, items_count: i32, attachment_streams_count: i32) -> Self {
        Self {
            message_type: MessageType::Documents.as_str().to_string(),
            last_document_etag: Some(last_document_etag),
            items_count: Some(items_count),
            attachment_streams_count: Some(attachment_streams_count),
            database_change_vector: None,
        }
    }

    /// `Heartbeat` envelope
    pub fn heartbeat(last_document_etag: i64, database_change_vector: Option<String>) -> Self {
        Self {
            message_type: MessageType::Heartbeat.as_str().to_string(),
            last_document_etag: Some(last_document_etag),
            database_change_vector,
            ..Default::default()
        }
    }

    /// Parsed request kind
    pub fn kind(&self) -> Result<MessageType> {
        MessageType::parse(&self.message_type)
    }
}

/// Reply kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyType {
    /// The message was applied
    Ok,
    /// The message failed; `Exception` carries the error text
    Error,
    /// A document referenced attachments that were not sent; resend with streams
    MissingAttachments,
}

/// Reply envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicationMessageReply {
    /// Outcome
    #[serde(rename = "Type")]
    pub reply_type: ReplyType,
    /// Echo of the request type
    pub message_type: String,
    /// Checkpoint the source may advance to; -1 on failure
    pub last_etag_accepted: i64,
    /// Last local etag
    pub current_etag: i64,
    /// Local database change vector
    pub database_change_vector: Option<String>,
    /// Local database id
    pub database_id: Option<String>,
    /// Local node tag
    pub node_tag: Option<String>,
    /// Error text
    pub exception: Option<String>,
}

/// Sent while a batch is being applied so the peer does not time out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeepAliveFrame {
    /// Always `Processing`
    pub message_type: String,
}

impl Default for KeepAliveFrame {
    fn default() -> Self {
        Self {
            message_type: "Processing".to_string(),
        }
    }
}

/// Identity of the peer, sent once when the connection opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingConnectionInfo {
    /// Database id of the source
    pub source_database_id: String,
    /// Database name at the source
    pub source_database_name: String,
    /// Address of the source node
    pub source_url: String,
}

impl IncomingConnectionInfo {
    /// Build connection info
    pub fn new(
        source_database_id: impl Into<String>,
        source_database_name: impl Into<String>,
        source_url: impl Into<String>,
    ) -> Self {
        Self {
            source_database_id: source_database_id.into(),
            source_database_name: source_database_name.into(),
            source_url: source_url.into(),
        }
    }
}

/// Write one framed JSON document and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> Result<()> {
    let json = serde_json::to_vec(value)?;
    let len = u32::try_from(json.len())
        .map_err(|_| Error::protocol(format!("Frame too large: {} bytes", json.len())))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&json)?;
    writer.flush()?;
    Ok(())
}

fn check_frame_len(len: u32, max_frame_size: usize) -> Result<usize> {
    let len = len as usize;
    if len > max_frame_size {
        return Err(Error::protocol(format!(
            "Frame of {} bytes exceeds the limit of {} bytes",
            len, max_frame_size
        )));
    }
    Ok(len)
}

fn parse_frame<T: DeserializeOwned>(json: &[u8]) -> Result<T> {
    serde_json::from_slice(json).map_err(|e| Error::protocol(format!("Malformed frame: {}", e)))
}

/// Read one framed JSON document through the session buffer
pub fn read_frame<R: Read, T: DeserializeOwned>(
    buffer: &mut ReadBuffer<R>,
    max_frame_size: usize,
) -> Result<T> {
    let len = check_frame_len(buffer.read_i32()? as u32, max_frame_size)?;
    parse_frame(buffer.read_exactly(len)?)
}

/// Read one framed JSON document directly from `reader`, consuming no byte
/// past the frame. Used for the hello before the session buffer exists.
pub fn read_unbuffered_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<T> {
    let mut raw = [0u8; 4];
    read_exact(reader, &mut raw)?;
    let len = check_frame_len(u32::from_le_bytes(raw), max_frame_size)?;
    let mut json = vec![0u8; len];
    read_exact(reader, &mut json)?;
    parse_frame(&json)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::end_of_stream(format!("{} byte frame", buf.len()))
        } else {
            Error::Io(e)
        }
    })
}

/// Read the next reply, skipping keep-alive frames. Returns the reply and
/// the number of keep-alive frames seen before it.
pub fn read_reply<R: Read>(
    buffer: &mut ReadBuffer<R>,
    max_frame_size: usize,
) -> Result<(ReplicationMessageReply, usize)> {
    let mut keep_alives = 0;
    loop {
        let frame: serde_json::Value = read_frame(buffer, max_frame_size)?;
        if frame.get("Type").is_none() {
            keep_alives += 1;
            continue;
        }
        let reply = serde_json::from_value(frame)
            .map_err(|e| Error::protocol(format!("Malformed reply: {}", e)))?;
        return Ok((reply, keep_alives));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChunkedReader;

    #[test]
    fn test_header_field_names() {
        let header = ReplicationMessageHeader::documents(10, 2, 1);
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["Type"], "Documents");
        assert_eq!(json["LastDocumentEtag"], 10);
        assert_eq!(json["ItemsCount"], 2);
        assert_eq!(json["AttachmentStreamsCount"], 1);
        assert!(json.get("DatabaseChangeVector").is_none());

        let parsed: ReplicationMessageHeader =
            serde_json::from_str(r#"{"Type":"Heartbeat","DatabaseChangeVector":"A:1"}"#).unwrap();
        assert_eq!(parsed.kind().unwrap(), MessageType::Heartbeat);
        assert_eq!(parsed.last_document_etag, None);
        assert_eq!(parsed.database_change_vector.as_deref(), Some("A:1"));
    }

    #[test]
    fn test_unknown_message_type() {
        let header = ReplicationMessageHeader {
            message_type: "Bogus".into(),
            ..Default::default()
        };
        assert!(matches!(header.kind(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_keep_alive_shape() {
        let json = serde_json::to_string(&KeepAliveFrame::default()).unwrap();
        assert_eq!(json, r#"{"MessageType":"Processing"}"#);
    }

    #[test]
    fn test_frames_through_buffer() {
        let reply = ReplicationMessageReply {
            reply_type: ReplyType::MissingAttachments,
            message_type: "Documents".into(),
            last_etag_accepted: -1,
            current_etag: 4,
            database_change_vector: Some("B:4".into()),
            database_id: Some("B".into()),
            node_tag: Some("B".into()),
            exception: Some("Missing attachment".into()),
        };

        let mut wire = Vec::new();
        write_frame(&mut wire, &KeepAliveFrame::default()).unwrap();
        write_frame(&mut wire, &KeepAliveFrame::default()).unwrap();
        write_frame(&mut wire, &reply).unwrap();

        let mut buffer = ReadBuffer::with_capacity(ChunkedReader::new(wire, 5), 16);
        let (read, keep_alives) = read_reply(&mut buffer, 1024).unwrap();
        assert_eq!(read, reply);
        assert_eq!(keep_alives, 2);

        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["Type"], "MissingAttachments");
        assert_eq!(json["LastEtagAccepted"], -1);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &ReplicationMessageHeader::documents(1, 1, 0)).unwrap();
        let mut buffer = ReadBuffer::new(ChunkedReader::new(wire, 64));
        let result: Result<ReplicationMessageHeader> = read_frame(&mut buffer, 8);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unbuffered_frame_stops_at_boundary() {
        let info = IncomingConnectionInfo::new("A", "db", "tcp://a");
        let mut wire = Vec::new();
        write_frame(&mut wire, &info).unwrap();
        wire.extend_from_slice(b"rest");

        let mut reader = ChunkedReader::new(wire, 3);
        let read: IncomingConnectionInfo = read_unbuffered_frame(&mut reader, 1024).unwrap();
        assert_eq!(read, info);
        assert_eq!(reader.remaining(), 4);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["SourceDatabaseId"], "A");
    }

    #[test]
    fn test_truncated_hello() {
        let mut reader = ChunkedReader::new(vec![10, 0, 0, 0, b'{'], 8);
        let result: Result<IncomingConnectionInfo> = read_unbuffered_frame(&mut reader, 1024);
        assert!(matches!(result, Err(Error::EndOfStream(_))));
    }
}
