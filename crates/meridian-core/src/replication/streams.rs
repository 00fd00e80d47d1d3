//! Attachment stream spill file
//!
//! Attachment contents of a batch are copied straight from the socket into
//! one anonymous temp file and looked up by hash when the resolver stores
//! the matching descriptor. The file is created on the first stream and
//! removed when the batch is dropped.

use super::codec::ReadBuffer;
use crate::Result;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: u64,
    len: u64,
}

/// Spilled attachment contents of one batch, keyed by hash
#[derive(Default)]
pub struct AttachmentStreams {
    file: Option<File>,
    segments: HashMap<String, Segment>,
    end: u64,
}

impl AttachmentStreams {
    /// Empty set; no file is created until the first stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `len` bytes from `buffer` into the spill file under `hash`
    pub fn read_from<R: Read>(&mut self, buffer: &mut ReadBuffer<R>, hash: &str, len: u64) -> Result<()> {
        let file = match &mut self.file {
            Some(file) => file,
            slot => slot.insert(tempfile::tempfile()?),
        };
        file.seek(SeekFrom::Start(self.end))?;
        buffer.read_exactly_into(len, file)?;
        file.flush()?;

        self.segments.insert(hash.to_string(), Segment { offset: self.end, len });
        self.end += len;
        Ok(())
    }

    /// True when content for `hash` was received
    pub fn contains(&self, hash: &str) -> bool {
        self.segments.contains_key(hash)
    }

    /// Remove the content for `hash` and read it into memory
    pub fn take(&mut self, hash: &str) -> Result<Option<Vec<u8>>> {
        let Some(segment) = self.segments.remove(hash) else {
            return Ok(None);
        };
        let Some(file) = &mut self.file else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(segment.offset))?;
        let mut content = Vec::with_capacity(segment.len as usize);
        std::io::Read::by_ref(file).take(segment.len).read_to_end(&mut content)?;
        Ok(Some(content))
    }

    /// Streams not yet taken
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// True when no stream is pending
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Bytes spilled so far
    pub fn total_bytes(&self) -> u64 {
        self.end
    }
}
