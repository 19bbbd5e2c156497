//! Narrowing views over byte sources.
//!
//! Detection peels an image one layer at a time: whole image, then a
//! partition, then the filesystem region inside it.  Each step is a
//! [`RangeLocator`] over the previous layer's source.  A locator is a
//! pure addressing transform; no bytes are copied or cached here.

use std::sync::Arc;

use crate::source::{ByteSource, SourceError};

/// A contiguous sub-range of a parent source, usable as an independent
/// byte source in its own right.
#[derive(Clone)]
pub struct RangeLocator {
    parent: Arc<dyn ByteSource>,
    offset: u64,
    length: u64,
}

impl RangeLocator {
    /// Creates a view of `length` bytes starting at `offset` within
    /// `parent`.
    ///
    /// The range must lie entirely within the parent; out-of-range
    /// requests fail with [`SourceError::OutOfRange`] rather than being
    /// silently clamped.
    pub fn narrow(
        parent: Arc<dyn ByteSource>,
        offset: u64,
        length: u64,
    ) -> Result<Self, SourceError> {
        let out_of_range = SourceError::OutOfRange {
            offset,
            length,
            parent: parent.len(),
        };
        match offset.checked_add(length) {
            Some(end) if end <= parent.len() => Ok(Self {
                parent,
                offset,
                length,
            }),
            _ => Err(out_of_range),
        }
    }

    /// Narrows this view further.  `rel_offset` and `rel_length` are
    /// relative to this view; the result addresses the shared parent
    /// directly, so nesting does not stack indirections.
    pub fn subrange(&self, rel_offset: u64, rel_length: u64) -> Result<Self, SourceError> {
        match rel_offset.checked_add(rel_length) {
            Some(end) if end <= self.length => Ok(Self {
                parent: Arc::clone(&self.parent),
                offset: self.offset + rel_offset,
                length: rel_length,
            }),
            _ => Err(SourceError::OutOfRange {
                offset: rel_offset,
                length: rel_length,
                parent: self.length,
            }),
        }
    }

    /// Reads the entire view into memory.
    pub fn read_to_vec(&self) -> Result<Vec<u8>, SourceError> {
        let size = usize::try_from(self.length).map_err(|_| SourceError::OutOfRange {
            offset: 0,
            length: self.length,
            parent: self.length,
        })?;
        let mut data = vec![0u8; size];
        self.read_exact_at(0, &mut data)?;
        Ok(data)
    }

    /// This view as a shareable trait object, ready for further
    /// narrowing.
    pub fn into_source(self) -> Arc<dyn ByteSource> {
        Arc::new(self)
    }
}

impl ByteSource for RangeLocator {
    fn len(&self) -> u64 {
        self.length
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        if offset >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let available = self.length - offset;
        let want = buf.len().min(available.try_into().unwrap_or(usize::MAX));
        self.parent.read_at(self.offset + offset, &mut buf[..want])
    }
}

impl std::fmt::Debug for RangeLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeLocator")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}
