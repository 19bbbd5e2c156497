//! Read-only access to HFS+ and HFSX disk images.
//!
//! The crate is organized as a pipeline: a [`source`] is opened over the
//! image, [`detect`] identifies wrappers, partition schemes and the
//! filesystem type, [`hfsplus`] mounts the volume behind the [`tree`]
//! abstraction, and [`extract`] walks it onto the host, optionally
//! encoding resource forks through [`appledouble`].

pub mod apm;
pub mod appledouble;
pub mod detect;
pub mod extract;
pub mod hfsplus;
pub mod locator;
pub mod source;
pub mod tree;

#[cfg(test)]
pub mod test;

/// Forks are streamed from the image to the destination in chunks of this
/// size.  Matches the copy granularity a single read through the shared
/// source takes under its lock.
pub const COPY_BUFFER_SIZE: usize = 128 * 1024;
