//! In-memory I/O helpers

use std::io::{self, Read};

/// Reader over a byte vector that returns at most `chunk` bytes per call
pub struct ChunkedReader {
    data: Vec<u8>,
    position: usize,
    chunk: usize,
    reads: usize,
}

impl ChunkedReader {
    /// Serve `data` in pieces of at most `chunk` bytes
    pub fn new(data: Vec<u8>, chunk: usize) -> Self {
        Self {
            data,
            position: 0,
            chunk: chunk.max(1),
            reads: 0,
        }
    }

    /// Number of non-empty reads served so far
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Bytes not yet read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.chunk).min(self.remaining());
        buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        if n > 0 {
            self.reads += 1;
        }
        Ok(n)
    }
}
