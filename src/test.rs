//! Test utilities shared by the unit tests.

use crate::source::{ByteSource, SourceError};

/// An in-memory byte source.
#[derive(Debug, Clone)]
pub struct MemSource(Vec<u8>);

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }
}

impl ByteSource for MemSource {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        if offset >= self.0.len() {
            return Ok(0);
        }
        let available = &self.0[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}
