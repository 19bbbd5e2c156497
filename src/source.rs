//! Shared random-access byte sources.
//!
//! A disk image is opened exactly once and then addressed concurrently by
//! every component of the pipeline: partition probers, the filesystem
//! reader and the extraction engine all carve their own views out of one
//! underlying seekable stream.  `SharedByteSource` serializes the
//! seek+read pairs of those views so that none of them can observe a
//! position set by another.

use std::{
    io::{Read, Seek, SeekFrom},
    sync::{Arc, Mutex},
};

use thiserror::Error;

/// Errors produced by byte sources and the views carved from them.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A read was issued against a source whose backing stream has been
    /// released.
    #[error("byte source is closed")]
    Closed,
    /// `close()` was called a second time.  The release must happen
    /// exactly once, so this indicates a lifecycle bug in the caller.
    #[error("byte source was already closed")]
    AlreadyClosed,
    /// A sub-range request extended past the end of its parent.  Requests
    /// are rejected rather than clamped.
    #[error("range {offset}+{length} exceeds parent length {parent}")]
    OutOfRange {
        /// Requested start offset within the parent.
        offset: u64,
        /// Requested length.
        length: u64,
        /// Length of the parent source.
        parent: u64,
    },
    /// An error from the underlying stream.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A seekable, finite, readable range of bytes.
///
/// Reads are positionless: every call names its own offset, so independent
/// consumers can share one source without coordinating.  Reads never
/// observe bytes outside `[0, len)`; a read starting at or past the end
/// returns 0.
pub trait ByteSource: Send + Sync {
    /// The total length of this source in bytes, known up front.
    fn len(&self) -> u64;

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes read.  Returns 0 at end of source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError>;

    /// Whether this source contains no bytes at all.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills `buf` completely from `offset`, performing multiple reads if
    /// necessary.  Hitting the end of the source before the buffer is
    /// full is an `UnexpectedEof` error.
    fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> Result<(), SourceError> {
        while !buf.is_empty() {
            match self.read_at(offset, buf)? {
                0 => return Err(SourceError::Io(std::io::ErrorKind::UnexpectedEof.into())),
                n => {
                    offset += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }
}

/// The stream types a shared source can wrap.
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

struct StreamState {
    // None once the stream has been released.
    stream: Option<Box<dyn ReadSeek>>,
    closed: bool,
}

struct Shared {
    state: Mutex<StreamState>,
    length: u64,
}

/// A thread-safe, reference-counted wrapper around one underlying
/// seekable stream.
///
/// Cloning is cheap and shares the stream.  Each `read_at` performs one
/// seek+read pair under the internal lock, so two logical cursors can
/// never interleave a single physical positioning with a transfer.
///
/// The stream is released exactly once: either by an explicit [`close`]
/// or, failing that, when the last clone is dropped.  After `close`, any
/// read fails with [`SourceError::Closed`] and a second `close` fails
/// with [`SourceError::AlreadyClosed`].
///
/// [`close`]: SharedByteSource::close
#[derive(Clone)]
pub struct SharedByteSource {
    inner: Arc<Shared>,
}

impl SharedByteSource {
    /// Takes ownership of `stream` and queries its length up front.
    pub fn open(mut stream: impl Read + Seek + Send + 'static) -> Result<Self, SourceError> {
        let length = stream.seek(SeekFrom::End(0))?;
        Ok(Self {
            inner: Arc::new(Shared {
                length,
                state: Mutex::new(StreamState {
                    stream: Some(Box::new(stream)),
                    closed: false,
                }),
            }),
        })
    }

    /// Releases the underlying stream.
    ///
    /// This must be the terminal operation on the source.  All views
    /// carved from it become unreadable.  Calling this twice is an error,
    /// guarded by a flag rather than by re-running the release.
    pub fn close(&self) -> Result<(), SourceError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(SourceError::AlreadyClosed);
        }
        // Dropping the boxed stream closes the I/O resource.
        state.stream = None;
        state.closed = true;
        Ok(())
    }

    /// This source as a shareable trait object, ready for narrowing.
    pub fn into_source(self) -> Arc<dyn ByteSource> {
        Arc::new(self)
    }
}

impl ByteSource for SharedByteSource {
    fn len(&self) -> u64 {
        self.inner.length
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, SourceError> {
        // liveness first: a released source rejects every read, even one
        // that would not touch the stream
        let mut state = self.inner.state.lock().unwrap();
        let Some(stream) = state.stream.as_mut() else {
            return Err(SourceError::Closed);
        };
        if offset >= self.inner.length || buf.is_empty() {
            return Ok(0);
        }
        let available = self.inner.length - offset;
        let want = buf.len().min(available.try_into().unwrap_or(usize::MAX));
        // One seek+read pair, atomic with respect to other views.
        stream.seek(SeekFrom::Start(offset))?;
        Ok(stream.read(&mut buf[..want])?)
    }
}

impl std::fmt::Debug for SharedByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedByteSource")
            .field("length", &self.inner.length)
            .finish_non_exhaustive()
    }
}
