//! Replication wire codec
//!
//! Items are a one-byte type tag followed by little-endian fixed-width
//! integers and length-prefixed UTF-8:
//!
//! ```text
//! item      := type:u8 cv_len:i32 cv:[u8; cv_len] marker:i16 body
//! document  := ticks:i64 flags:i32 id_len:i32 id doc_size:i32
//!              (doc:[u8; doc_size] | -1 collection_len:i32 collection?)
//! attachment            := key_len:i32 key name_len:i32 name ct_len:i32 ct hash_len:u8 hash
//! attachment tombstone  := ticks:i64 key_len:i32 key
//! revision tombstone    := ticks:i64 key_len:i32 key collection_len:i32 collection
//! counter               := id_len:i32 id collection_len:i32 collection name_len:i32 name value:i64
//! counter tombstone     := key_len:i32 key collection_len:i32 collection ticks:i64
//! attachment stream     := 4:u8 hash_len:u8 hash len:i64 bytes:[u8; len]
//! ```
//!
//! All reads go through [`ReadBuffer`], which owns the socket reader and a
//! reusable byte buffer.

use super::items::{
    ItemPayload, ItemType, ReplicatedAttachment, ReplicatedAttachmentTombstone, ReplicatedCounter,
    ReplicatedCounterTombstone, ReplicatedDocument, ReplicatedRevisionTombstone, ReplicationItem,
};
use super::streams::AttachmentStreams;
use crate::document::DocumentFlags;
use crate::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// Default size of the session read buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default largest single read
pub const DEFAULT_MAX_READ: usize = 64 * 1024 * 1024;

/// Document size marking a tombstone
const TOMBSTONE_SIZE: i32 = -1;

/// Cursor over a reader with a reusable buffer.
///
/// `buf[used..valid]` holds bytes read from the socket but not yet consumed.
/// A request that does not fit moves the unconsumed tail to the front and
/// refills behind it, growing the buffer when the request is larger than it.
/// Requests above `max_read` are rejected before anything is allocated, and
/// a grown buffer goes back to its initial size on the next refill.
pub struct ReadBuffer<R> {
    reader: R,
    buf: Vec<u8>,
    used: usize,
    valid: usize,
    base_capacity: usize,
    max_read: usize,
}

impl<R: Read> ReadBuffer<R> {
    /// Buffer of the default size
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, DEFAULT_BUFFER_SIZE)
    }

    /// Buffer of `capacity` bytes (at least 16)
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            reader,
            buf: vec![0; capacity],
            used: 0,
            valid: 0,
            base_capacity: capacity,
            max_read: DEFAULT_MAX_READ,
        }
    }

    /// Reject single reads larger than `max_read` bytes
    pub fn with_max_read(mut self, max_read: usize) -> Self {
        self.max_read = max_read;
        self
    }

    /// Largest accepted single read
    pub fn max_read(&self) -> usize {
        self.max_read
    }

    /// Bytes buffered but not consumed
    pub fn available(&self) -> usize {
        self.valid - self.used
    }

    /// Current buffer size
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Underlying reader
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Underlying reader, mutably
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    fn read_some(&mut self, from: usize) -> Result<usize> {
        loop {
            match self.reader.read(&mut self.buf[from..]) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Consume exactly `n` bytes
    pub fn read_exactly(&mut self, n: usize) -> Result<&[u8]> {
        let available = self.available();
        if available >= n {
            let start = self.used;
            self.used += n;
            return Ok(&self.buf[start..start + n]);
        }

        if n > self.max_read {
            return Err(Error::protocol(format!(
                "Declared length {} exceeds the {} byte read limit",
                n, self.max_read
            )));
        }

        self.compact();
        let target = n.max(self.base_capacity);
        if self.buf.len() < target {
            self.buf.resize(target, 0);
        } else if self.buf.len() > target {
            self.buf.truncate(target);
            self.buf.shrink_to(target);
        }

        while self.valid < n {
            let read = self.read_some(self.valid)?;
            if read == 0 {
                return Err(Error::end_of_stream(format!(
                    "{} bytes ({} received)",
                    n, self.valid
                )));
            }
            self.valid += read;
        }

        self.used = n;
        Ok(&self.buf[..n])
    }

    /// Return a grown buffer to its initial size when the unconsumed bytes fit
    pub fn shrink(&mut self) {
        if self.buf.len() <= self.base_capacity || self.available() > self.base_capacity {
            return;
        }
        self.compact();
        self.buf.truncate(self.base_capacity);
        self.buf.shrink_to(self.base_capacity);
    }

    fn compact(&mut self) {
        let available = self.available();
        self.buf.copy_within(self.used..self.valid, 0);
        self.used = 0;
        self.valid = available;
    }

    /// Copy exactly `n` bytes to `out` without holding them all in memory
    pub fn read_exactly_into<W: Write>(&mut self, mut n: u64, out: &mut W) -> Result<()> {
        while n > 0 {
            if self.available() == 0 {
                let read = self.read_some(0)?;
                if read == 0 {
                    return Err(Error::end_of_stream(format!("{} stream bytes", n)));
                }
                self.used = 0;
                self.valid = read;
                continue;
            }

            let chunk = (self.available() as u64).min(n) as usize;
            out.write_all(&self.buf[self.used..self.used + chunk])?;
            self.used += chunk;
            n -= chunk as u64;
        }
        Ok(())
    }

    /// Wait for at least one byte. `false` on a clean end of stream.
    pub fn fill_or_eof(&mut self) -> Result<bool> {
        if self.available() > 0 {
            return Ok(true);
        }
        let read = self.read_some(0)?;
        self.used = 0;
        self.valid = read;
        Ok(read > 0)
    }

    /// Next byte without consuming it
    pub fn peek_u8(&mut self) -> Result<u8> {
        if !self.fill_or_eof()? {
            return Err(Error::end_of_stream("1 byte"));
        }
        Ok(self.buf[self.used])
    }

    /// Read a byte
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_exactly(1)?[0])
    }

    /// Read a little-endian i16
    pub fn read_i16(&mut self) -> Result<i16> {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.read_exactly(2)?);
        Ok(i16::from_le_bytes(raw))
    }

    /// Read a little-endian i32
    pub fn read_i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read_exactly(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    /// Read a little-endian i64
    pub fn read_i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read_exactly(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    /// Read an i32 length followed by that many bytes
    pub fn read_bytes(&mut self, what: &str) -> Result<Vec<u8>> {
        let len = self.read_length(what)?;
        Ok(self.read_exactly(len)?.to_vec())
    }

    /// Read an i32 length followed by that many bytes of UTF-8
    pub fn read_string(&mut self, what: &str) -> Result<String> {
        let bytes = self.read_bytes(what)?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Read a u8 length followed by that many bytes of UTF-8
    pub fn read_short_string(&mut self) -> Result<String> {
        let len = self.read_u8()? as usize;
        Ok(String::from_utf8(self.read_exactly(len)?.to_vec())?)
    }

    fn read_length(&mut self, what: &str) -> Result<usize> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| Error::protocol(format!("Negative {} length: {}", what, len)))
    }
}

/// Decode one item
pub fn decode_item<R: Read>(buffer: &mut ReadBuffer<R>) -> Result<ReplicationItem> {
    let item_type = ItemType::try_from(buffer.read_u8()?)?;
    if item_type == ItemType::AttachmentStream {
        return Err(stream_out_of_place());
    }

    let cv_len = buffer.read_i32()?;
    let change_vector = match cv_len {
        0 => String::new(),
        len if len > 0 => String::from_utf8(buffer.read_exactly(len as usize)?.to_vec())?,
        len => return Err(Error::protocol(format!("Negative change vector length: {}", len))),
    };
    let transaction_marker = buffer.read_i16()?;

    let payload = match item_type {
        ItemType::Attachment => {
            let key = buffer.read_bytes("attachment key")?;
            let name = buffer.read_string("attachment name")?;
            let content_type = buffer.read_string("content type")?;
            let hash = buffer.read_short_string()?;
            ItemPayload::Attachment(ReplicatedAttachment {
                key,
                name,
                content_type,
                hash,
            })
        }
        ItemType::AttachmentTombstone => {
            let last_modified_ticks = buffer.read_i64()?;
            let key = buffer.read_bytes("attachment key")?;
            ItemPayload::AttachmentTombstone(ReplicatedAttachmentTombstone {
                key,
                last_modified_ticks,
            })
        }
        ItemType::RevisionTombstone => {
            let last_modified_ticks = buffer.read_i64()?;
            let key = buffer.read_string("revision key")?;
            let collection = buffer.read_string("collection")?;
            ItemPayload::RevisionTombstone(ReplicatedRevisionTombstone {
                key,
                collection,
                last_modified_ticks,
            })
        }
        ItemType::Counter => {
            let document_id = buffer.read_string("document id")?;
            let collection = buffer.read_string("collection")?;
            let name = buffer.read_string("counter name")?;
            let value = buffer.read_i64()?;
            ItemPayload::Counter(ReplicatedCounter {
                document_id,
                collection,
                name,
                value,
            })
        }
        ItemType::CounterTombstone => {
            let key = buffer.read_bytes("counter key")?;
            let collection = buffer.read_string("collection")?;
            let last_modified_ticks = buffer.read_i64()?;
            ItemPayload::CounterTombstone(ReplicatedCounterTombstone {
                key,
                collection,
                last_modified_ticks,
            })
        }
        ItemType::Document | ItemType::DocumentTombstone => {
            let document = decode_document(buffer)?;
            if item_type == ItemType::Document {
                ItemPayload::Document(document)
            } else {
                ItemPayload::DocumentTombstone(document)
            }
        }
        ItemType::AttachmentStream => return Err(stream_out_of_place()),
    };

    Ok(ReplicationItem {
        transaction_marker,
        change_vector,
        payload,
    })
}

fn stream_out_of_place() -> Error {
    Error::protocol("Attachment stream received in place of an item")
}

fn decode_document<R: Read>(buffer: &mut ReadBuffer<R>) -> Result<ReplicatedDocument> {
    let last_modified_ticks = buffer.read_i64()?;
    let flags = DocumentFlags::from_bits(buffer.read_i32()? as u32) | DocumentFlags::FROM_REPLICATION;
    let id = buffer.read_string("document id")?;

    let size = buffer.read_i32()?;
    let (body, collection) = match size {
        TOMBSTONE_SIZE => {
            let collection = match buffer.read_i32()? {
                -1 => None,
                len if len >= 0 => {
                    Some(String::from_utf8(buffer.read_exactly(len as usize)?.to_vec())?)
                }
                len => return Err(Error::protocol(format!("Negative collection length: {}", len))),
            };
            (None, collection)
        }
        size if size >= 0 => (Some(buffer.read_exactly(size as usize)?.to_vec()), None),
        size => return Err(Error::protocol(format!("Invalid document size: {}", size))),
    };

    Ok(ReplicatedDocument {
        id,
        last_modified_ticks,
        flags,
        body,
        collection,
    })
}

/// Decode one attachment stream into `streams`; returns its hash
pub fn decode_attachment_stream<R: Read>(
    buffer: &mut ReadBuffer<R>,
    streams: &mut AttachmentStreams,
) -> Result<String> {
    let tag = buffer.read_u8()?;
    if tag != ItemType::AttachmentStream as u8 {
        return Err(Error::protocol(format!(
            "Expected an attachment stream but got item type {}",
            tag
        )));
    }
    let hash = buffer.read_short_string()?;
    let len = buffer.read_i64()?;
    let len = u64::try_from(len)
        .map_err(|_| Error::protocol(format!("Negative attachment stream length: {}", len)))?;
    streams.read_from(buffer, &hash, len)?;
    Ok(hash)
}

fn field_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::protocol(format!("Field too long: {} bytes", len)))
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    out.extend_from_slice(&field_len(bytes.len())?.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_short_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u8::try_from(bytes.len())
        .map_err(|_| Error::protocol(format!("Hash too long: {} bytes", bytes.len())))?;
    out.push(len);
    out.extend_from_slice(bytes);
    Ok(())
}

/// Encode one item
pub fn encode_item(item: &ReplicationItem, out: &mut Vec<u8>) -> Result<()> {
    out.push(item.item_type() as u8);
    put_bytes(out, item.change_vector.as_bytes())?;
    out.extend_from_slice(&item.transaction_marker.to_le_bytes());

    match &item.payload {
        ItemPayload::Attachment(attachment) => {
            put_bytes(out, &attachment.key)?;
            put_bytes(out, attachment.name.as_bytes())?;
            put_bytes(out, attachment.content_type.as_bytes())?;
            put_short_bytes(out, attachment.hash.as_bytes())?;
        }
        ItemPayload::AttachmentTombstone(tombstone) => {
            out.extend_from_slice(&tombstone.last_modified_ticks.to_le_bytes());
            put_bytes(out, &tombstone.key)?;
        }
        ItemPayload::RevisionTombstone(tombstone) => {
            out.extend_from_slice(&tombstone.last_modified_ticks.to_le_bytes());
            put_bytes(out, tombstone.key.as_bytes())?;
            put_bytes(out, tombstone.collection.as_bytes())?;
        }
        ItemPayload::Counter(counter) => {
            put_bytes(out, counter.document_id.as_bytes())?;
            put_bytes(out, counter.collection.as_bytes())?;
            put_bytes(out, counter.name.as_bytes())?;
            out.extend_from_slice(&counter.value.to_le_bytes());
        }
        ItemPayload::CounterTombstone(tombstone) => {
            put_bytes(out, &tombstone.key)?;
            put_bytes(out, tombstone.collection.as_bytes())?;
            out.extend_from_slice(&tombstone.last_modified_ticks.to_le_bytes());
        }
        ItemPayload::Document(document) | ItemPayload::DocumentTombstone(document) => {
            out.extend_from_slice(&document.last_modified_ticks.to_le_bytes());
            out.extend_from_slice(&(document.flags.bits() as i32).to_le_bytes());
            put_bytes(out, document.id.as_bytes())?;
            match &document.body {
                Some(body) => put_bytes(out, body)?,
                None => {
                    out.extend_from_slice(&TOMBSTONE_SIZE.to_le_bytes());
                    match &document.collection {
                        Some(collection) => put_bytes(out, collection.as_bytes())?,
                        None => out.extend_from_slice(&(-1i32).to_le_bytes()),
                    }
                }
            }
        }
    }
    Ok(())
}

/// Encode one attachment stream
pub fn encode_attachment_stream(hash: &str, content: &[u8], out: &mut Vec<u8>) -> Result<()> {
    out.push(ItemType::AttachmentStream as u8);
    put_short_bytes(out, hash.as_bytes())?;
    let len = i64::try_from(content.len())
        .map_err(|_| Error::protocol(format!("Attachment stream too long: {} bytes", content.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(content);
    Ok(())
}

/// Encode the item section and the stream section of a `Documents` message
pub fn encode_batch(items: &[ReplicationItem], streams: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for item in items {
        encode_item(item, &mut out)?;
    }
    for (hash, content) in streams {
        encode_attachment_stream(hash, content, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ChunkedReader;

    fn buffer(data: Vec<u8>, chunk: usize, capacity: usize) -> ReadBuffer<ChunkedReader> {
        ReadBuffer::with_capacity(ChunkedReader::new(data, chunk), capacity)
    }

    fn sequence(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    #[test]
    fn test_read_exactly_remaining_buffer() {
        // the first read fills the buffer completely
        let mut buf = buffer(sequence(32), 16, 16);
        assert_eq!(buf.read_exactly(4).unwrap(), &[0, 1, 2, 3]);
        assert_eq!(buf.available(), 12);

        // exactly what is left
        assert_eq!(buf.read_exactly(12).unwrap(), &sequence(16)[4..]);
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.read_exactly(16).unwrap(), &sequence(32)[16..]);
    }

    #[test]
    fn test_read_exactly_one_past_buffer() {
        let mut buf = buffer(sequence(40), 16, 16);
        assert_eq!(buf.read_exactly(4).unwrap(), &[0, 1, 2, 3]);

        // 12 buffered, 13 requested: compaction plus one refill
        let span = buf.read_exactly(13).unwrap().to_vec();
        assert_eq!(span, (4u8..17).collect::<Vec<_>>());
        assert_eq!(buf.read_u8().unwrap(), 17);
        assert_eq!(buf.read_exactly(22).unwrap(), &sequence(40)[18..]);
    }

    #[test]
    fn test_read_exactly_zero() {
        let mut buf = buffer(Vec::new(), 4, 16);
        assert_eq!(buf.read_exactly(0).unwrap(), &[] as &[u8]);
        assert_eq!(buf.get_ref().reads(), 0);

        let mut buf = buffer(vec![7], 4, 16);
        assert_eq!(buf.read_exactly(0).unwrap(), &[] as &[u8]);
        assert_eq!(buf.read_u8().unwrap(), 7);
    }

    #[test]
    fn test_read_exactly_grows_buffer() {
        let mut buf = buffer(sequence(100), 7, 16);
        assert_eq!(buf.read_exactly(3).unwrap(), &[0, 1, 2]);
        assert_eq!(buf.read_exactly(90).unwrap(), &sequence(93)[3..]);
        assert!(buf.capacity() >= 90);
        assert_eq!(buf.read_exactly(7).unwrap(), &sequence(100)[93..]);
    }

    #[test]
    fn test_grown_buffer_shrinks_back() {
        let mut buf = buffer(sequence(120), 7, 16);
        assert_eq!(buf.read_exactly(90).unwrap(), &sequence(90)[..]);
        assert_eq!(buf.capacity(), 90);

        buf.shrink();
        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.read_exactly(30).unwrap(), &sequence(120)[90..]);

        // the next refill after a large read drops the excess on its own
        let mut buf = buffer(sequence(100), 7, 16);
        buf.read_exactly(90).unwrap();
        assert_eq!(buf.read_exactly(10).unwrap(), &sequence(100)[90..]);
        assert_eq!(buf.capacity(), 16);
    }

    #[test]
    fn test_oversized_declaration_is_rejected_before_allocating() {
        let mut data = vec![ItemType::Document as u8];
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());
        data.extend_from_slice(&0i64.to_le_bytes());
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        data.push(b'a');
        data.extend_from_slice(&(512 * 1024 * 1024i32).to_le_bytes());
        data.extend_from_slice(b"{}");

        let mut buf = buffer(data.clone(), 64, 64);
        let err = decode_item(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(buf.capacity(), 64);

        let mut buf = buffer(data, 64, 64).with_max_read(1024);
        assert_eq!(buf.max_read(), 1024);
        assert!(matches!(decode_item(&mut buf), Err(Error::Protocol(_))));
        assert_eq!(buf.capacity(), 64);
    }

    #[test]
    fn test_truncated_stream() {
        let mut buf = buffer(sequence(5), 2, 16);
        let err = buf.read_exactly(6).unwrap_err();
        assert!(matches!(err, Error::EndOfStream(_)));
        assert!(err.is_stream_fault());
    }

    #[test]
    fn test_read_exactly_into_across_reads() {
        let mut buf = buffer(sequence(50), 5, 16);
        assert_eq!(buf.read_u8().unwrap(), 0);

        let mut out = Vec::new();
        buf.read_exactly_into(45, &mut out).unwrap();
        assert_eq!(out, &sequence(46)[1..]);
        assert_eq!(buf.read_exactly(4).unwrap(), &[46, 47, 48, 49]);

        let mut out = Vec::new();
        assert!(buf.read_exactly_into(1, &mut out).is_err());
    }

    #[test]
    fn test_fill_or_eof() {
        let mut buf = buffer(vec![1, 2], 4, 16);
        assert!(buf.fill_or_eof().unwrap());
        assert_eq!(buf.peek_u8().unwrap(), 1);
        assert_eq!(buf.read_i16().unwrap(), i16::from_le_bytes([1, 2]));
        assert!(!buf.fill_or_eof().unwrap());
    }

    #[test]
    fn test_little_endian_integers() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-2i16).to_le_bytes());
        data.extend_from_slice(&0x0102_0304i32.to_le_bytes());
        data.extend_from_slice(&(-5i64).to_le_bytes());
        let mut buf = buffer(data, 3, 16);

        assert_eq!(buf.read_i16().unwrap(), -2);
        assert_eq!(buf.read_i32().unwrap(), 0x0102_0304);
        assert_eq!(buf.read_i64().unwrap(), -5);
    }

    #[test]
    fn test_document_body_spanning_reads() {
        let body = serde_json::to_vec(&serde_json::json!({"Name": "x".repeat(40)})).unwrap();
        let item = ReplicationItem::new(
            "A:1",
            3,
            ItemPayload::Document(ReplicatedDocument {
                id: "users/1".into(),
                last_modified_ticks: 42,
                flags: DocumentFlags::HAS_ATTACHMENTS,
                body: Some(body.clone()),
                collection: None,
            }),
        );
        let mut out = Vec::new();
        encode_item(&item, &mut out).unwrap();

        let mut buf = buffer(out, 13, 16);
        let decoded = decode_item(&mut buf).unwrap();
        let ItemPayload::Document(doc) = decoded.payload else {
            panic!("expected a document");
        };
        assert_eq!(doc.body.unwrap(), body);
        assert_eq!(
            doc.flags,
            DocumentFlags::HAS_ATTACHMENTS | DocumentFlags::FROM_REPLICATION
        );
        assert_eq!(decoded.change_vector, "A:1");
        assert_eq!(decoded.transaction_marker, 3);
    }

    #[test]
    fn test_document_body_ends_at_buffer_edge() {
        let item = ReplicationItem::new(
            "A:7",
            1,
            ItemPayload::Document(ReplicatedDocument {
                id: "users/9".into(),
                last_modified_ticks: 5,
                flags: DocumentFlags::NONE,
                body: Some(br#"{"Name":"edge"}"#.to_vec()),
                collection: None,
            }),
        );
        let mut out = Vec::new();
        encode_item(&item, &mut out).unwrap();
        let len = out.len();

        // one read fills the buffer exactly; the body is its last bytes
        let mut buf = buffer(out, len, len);
        let decoded = decode_item(&mut buf).unwrap();
        assert_eq!(buf.available(), 0);
        assert_eq!(buf.get_ref().reads(), 1);
        let ItemPayload::Document(doc) = decoded.payload else {
            panic!("expected a document");
        };
        assert_eq!(doc.id, "users/9");
        assert_eq!(doc.body.as_deref(), Some(&br#"{"Name":"edge"}"#[..]));
        assert_eq!(decoded.change_vector, "A:7");
        assert!(!buf.fill_or_eof().unwrap());
    }

    #[test]
    fn test_field_len_rejects_oversized_fields() {
        assert_eq!(field_len(5).unwrap(), 5);
        assert_eq!(field_len(i32::MAX as usize).unwrap(), i32::MAX);
        assert!(matches!(field_len(i32::MAX as usize + 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_tombstone_collection_is_optional() {
        let mut out = Vec::new();
        for collection in [Some("Users".to_string()), None] {
            let item = ReplicationItem::new(
                "A:2",
                1,
                ItemPayload::DocumentTombstone(ReplicatedDocument {
                    id: "users/1".into(),
                    last_modified_ticks: 7,
                    flags: DocumentFlags::NONE,
                    body: None,
                    collection,
                }),
            );
            encode_item(&item, &mut out).unwrap();
        }

        let mut buf = buffer(out, 64, 64);
        for expected in [Some("Users"), None] {
            let ItemPayload::DocumentTombstone(doc) = decode_item(&mut buf).unwrap().payload else {
                panic!("expected a tombstone");
            };
            assert!(doc.is_tombstone());
            assert_eq!(doc.collection.as_deref(), expected);
        }
    }

    #[test]
    fn test_unknown_item_type() {
        let mut buf = buffer(vec![42, 0, 0, 0, 0], 8, 16);
        let err = decode_item(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: Unknown item type: 42");
    }

    #[test]
    fn test_negative_lengths_are_rejected() {
        let mut data = vec![ItemType::Document as u8];
        data.extend_from_slice(&(-3i32).to_le_bytes());
        let mut buf = buffer(data, 8, 16);
        assert!(matches!(decode_item(&mut buf), Err(Error::Protocol(_))));

        let mut data = vec![ItemType::Document as u8];
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());
        data.extend_from_slice(&0i64.to_le_bytes());
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        data.push(b'a');
        data.extend_from_slice(&(-2i32).to_le_bytes());
        let mut buf = buffer(data, 8, 16);
        assert!(matches!(decode_item(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_stream_in_item_position_is_rejected() {
        let mut out = Vec::new();
        encode_attachment_stream("hash", b"abc", &mut out).unwrap();
        let mut buf = buffer(out, 8, 16);
        assert!(matches!(decode_item(&mut buf), Err(Error::Protocol(_))));
    }
}
