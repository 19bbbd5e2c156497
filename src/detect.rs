//! Layered format detection.
//!
//! An image may arrive wrapped (a UDIF envelope), partitioned (an Apple
//! Partition Map), or bare.  Detection peels those layers in a fixed
//! order to locate a mountable filesystem region: wrapper probe, then
//! partition narrowing, then filesystem-type probe.  Every stage is a
//! pluggable prober behind a trait, and the pipeline short-circuits on
//! the *first* match at each stage -- the ordering is part of the
//! contract, this is not a best-match search.

use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use thiserror::Error;

use crate::{
    hfsplus::format::{HFSPLUS_SIGNATURE, HFSX_SIGNATURE, HFS_SIGNATURE, VOLUME_HEADER_OFFSET},
    locator::RangeLocator,
    source::ByteSource,
};

/// The declared type of a partition, as far as detection cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    /// A partition declared to hold an HFS or HFS+ filesystem
    /// (`Apple_HFS`).
    HfsContainer,
    /// A partition declared to hold a case-sensitive HFSX filesystem
    /// (`Apple_HFSX`).
    Hfsx,
    /// Anything else.  Never probed for a filesystem.
    Other,
}

/// One partition of a recognized scheme.
#[derive(Debug, Clone)]
pub struct PartitionDescriptor {
    /// 0-based index within the scheme.
    pub index: usize,
    /// Declared type.
    pub kind: PartitionKind,
    /// Byte offset of the partition within the probed source.
    pub start_offset: u64,
    /// Length of the partition in bytes.
    pub length: u64,
    /// Human-readable partition name, for logging.
    pub name: String,
}

/// Filesystem types detection can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    /// Classic HFS.
    Hfs,
    /// HFS Plus.
    HfsPlus,
    /// Case-sensitive HFS Plus.
    Hfsx,
}

impl std::fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FilesystemKind::Hfs => "HFS",
            FilesystemKind::HfsPlus => "HFS+",
            FilesystemKind::Hfsx => "HFSX",
        })
    }
}

/// Recognizes and removes an outer image envelope.
pub trait WrapperProber {
    /// Name of the wrapper format, for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether `source` carries this wrapper.
    fn is_wrapped(&self, source: &dyn ByteSource) -> Result<bool>;

    /// Produces the unwrapped payload source.  Only called after
    /// [`is_wrapped`] returned true; failing here is fatal to the run.
    ///
    /// [`is_wrapped`]: WrapperProber::is_wrapped
    fn unwrap(&self, source: Arc<dyn ByteSource>) -> Result<Arc<dyn ByteSource>>;
}

/// Recognizes a partition scheme and enumerates its partitions.
pub trait PartitionSchemeProber {
    /// Name of the scheme, for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns the scheme's partitions, or `None` if the scheme is not
    /// present on `source`.
    fn probe(&self, source: &dyn ByteSource) -> Result<Option<Vec<PartitionDescriptor>>>;
}

/// Identifies the filesystem type of a byte region.
pub trait FilesystemProber {
    /// Name of the prober, for diagnostics.
    fn name(&self) -> &'static str;

    /// Returns zero or more candidate identifications, in preference
    /// order.
    fn probe(&self, source: &dyn ByteSource) -> Result<Vec<FilesystemKind>>;
}

/// Fatal detection failures.
#[derive(Debug, Error)]
pub enum DetectError {
    /// Every stage ran and no supported filesystem was identified.
    #[error("no HFS file system found")]
    NoFilesystemFound,
    /// An explicit partition index was requested but the recognized
    /// scheme has fewer partitions.
    #[error("invalid partition number {index}: scheme has {count} partition(s)")]
    PartitionOutOfRange {
        /// The requested index.
        index: usize,
        /// How many partitions the scheme actually exposed.
        count: usize,
    },
    /// A recognized wrapper could not be unwrapped.
    #[error("failed to unwrap {wrapper} image")]
    Wrapper {
        /// Which wrapper format was recognized.
        wrapper: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// A prober failed while reading the image.
    #[error(transparent)]
    Probe(#[from] anyhow::Error),
}

/// The outcome of successful detection: a source narrowed down to the
/// filesystem region, plus what was learned on the way there.
pub struct ResolvedFilesystem {
    /// The byte region holding the filesystem.
    pub source: Arc<dyn ByteSource>,
    /// The identified filesystem type.
    pub kind: FilesystemKind,
    /// The partition the region came from, if any narrowing happened.
    pub partition: Option<PartitionDescriptor>,
}

/// The ordered prober chain.
pub struct DetectionPipeline {
    wrappers: Vec<Box<dyn WrapperProber>>,
    schemes: Vec<Box<dyn PartitionSchemeProber>>,
    filesystems: Vec<Box<dyn FilesystemProber>>,
}

impl Default for DetectionPipeline {
    /// The stock chain: UDIF wrapper recognition, Apple Partition Map,
    /// volume-header signature probing.
    fn default() -> Self {
        Self::new()
            .wrapper(Box::new(UdifProber))
            .scheme(Box::new(crate::apm::ApmProber))
            .filesystem(Box::new(VolumeSignatureProber))
    }
}

impl DetectionPipeline {
    /// An empty pipeline with no probers.
    pub fn new() -> Self {
        Self {
            wrappers: Vec::new(),
            schemes: Vec::new(),
            filesystems: Vec::new(),
        }
    }

    /// Appends a wrapper prober.  Probers run in insertion order.
    pub fn wrapper(mut self, prober: Box<dyn WrapperProber>) -> Self {
        self.wrappers.push(prober);
        self
    }

    /// Appends a partition scheme prober.  Probers run in insertion
    /// order.
    pub fn scheme(mut self, prober: Box<dyn PartitionSchemeProber>) -> Self {
        self.schemes.push(prober);
        self
    }

    /// Appends a filesystem prober.  Probers run in insertion order.
    pub fn filesystem(mut self, prober: Box<dyn FilesystemProber>) -> Self {
        self.filesystems.push(prober);
        self
    }

    /// Runs the full chain against `source`.
    ///
    /// With `partition_override` set, only that partition of the first
    /// recognized scheme is considered.  Without it, the first partition
    /// declared as an Apple filesystem wins.  When no scheme or no
    /// matching partition is found, the whole (possibly unwrapped)
    /// source is probed directly.
    pub fn resolve(
        &self,
        source: Arc<dyn ByteSource>,
        partition_override: Option<usize>,
    ) -> Result<ResolvedFilesystem, DetectError> {
        let source = self.unwrap_source(source)?;

        let (probe_source, partition) =
            match self.narrow_to_partition(&source, partition_override)? {
                Some((descriptor, narrowed)) => (narrowed, Some(descriptor)),
                None => (Arc::clone(&source), None),
            };

        for prober in &self.filesystems {
            for kind in prober.probe(probe_source.as_ref())? {
                debug!("{} identified {kind}", prober.name());
                return Ok(ResolvedFilesystem {
                    source: probe_source,
                    kind,
                    partition,
                });
            }
        }

        Err(DetectError::NoFilesystemFound)
    }

    /// Wrapper stage.  An unrecognized source passes through unchanged;
    /// recognition errors are treated as "not this wrapper" so that this
    /// step can never fail the run on its own.
    fn unwrap_source(
        &self,
        source: Arc<dyn ByteSource>,
    ) -> Result<Arc<dyn ByteSource>, DetectError> {
        for prober in &self.wrappers {
            match prober.is_wrapped(source.as_ref()) {
                Ok(true) => {
                    debug!("source is wrapped in {}", prober.name());
                    return prober
                        .unwrap(source)
                        .map_err(|source| DetectError::Wrapper {
                            wrapper: prober.name(),
                            source,
                        });
                }
                Ok(false) => {}
                Err(err) => debug!("{} probe failed: {err:#}", prober.name()),
            }
        }
        Ok(source)
    }

    /// Partition stage.  The first scheme exposing at least one
    /// partition is accepted; later schemes are not consulted even if
    /// the accepted one yields no usable partition.
    fn narrow_to_partition(
        &self,
        source: &Arc<dyn ByteSource>,
        partition_override: Option<usize>,
    ) -> Result<Option<(PartitionDescriptor, Arc<dyn ByteSource>)>, DetectError> {
        for prober in &self.schemes {
            let Some(partitions) = prober.probe(source.as_ref())? else {
                continue;
            };
            if partitions.is_empty() {
                continue;
            }
            debug!(
                "{} scheme with {} partition(s)",
                prober.name(),
                partitions.len()
            );

            let candidates: Vec<&PartitionDescriptor> = match partition_override {
                Some(index) => match partitions.get(index) {
                    Some(descriptor) => vec![descriptor],
                    None => {
                        return Err(DetectError::PartitionOutOfRange {
                            index,
                            count: partitions.len(),
                        })
                    }
                },
                None => partitions.iter().collect(),
            };

            for descriptor in candidates {
                if !matches!(
                    descriptor.kind,
                    PartitionKind::HfsContainer | PartitionKind::Hfsx
                ) {
                    continue;
                }
                debug!(
                    "narrowing to partition {} ({:?}) at {}+{}",
                    descriptor.index, descriptor.name, descriptor.start_offset, descriptor.length
                );
                let narrowed = RangeLocator::narrow(
                    Arc::clone(source),
                    descriptor.start_offset,
                    descriptor.length,
                )
                .map_err(|err| DetectError::Probe(err.into()))?;
                return Ok(Some((descriptor.clone(), narrowed.into_source())));
            }

            // An accepted scheme without a matching partition falls back
            // to whole-source probing.
            return Ok(None);
        }
        Ok(None)
    }
}

/// Size of the UDIF trailer block.
const UDIF_TRAILER_SIZE: u64 = 512;
/// Magic at the start of the UDIF trailer.
const UDIF_MAGIC: [u8; 4] = *b"koly";

/// Recognizes UDIF (`.dmg`) disk images by their trailing "koly" block.
///
/// Decompression is out of scope here, so recognition reports the image
/// as needing external conversion instead of producing a payload source.
pub struct UdifProber;

impl WrapperProber for UdifProber {
    fn name(&self) -> &'static str {
        "UDIF"
    }

    fn is_wrapped(&self, source: &dyn ByteSource) -> Result<bool> {
        if source.len() < UDIF_TRAILER_SIZE {
            return Ok(false);
        }
        let mut magic = [0u8; 4];
        source.read_exact_at(source.len() - UDIF_TRAILER_SIZE, &mut magic)?;
        Ok(magic == UDIF_MAGIC)
    }

    fn unwrap(&self, _source: Arc<dyn ByteSource>) -> Result<Arc<dyn ByteSource>> {
        anyhow::bail!(
            "UDIF images are compressed; convert to a raw image (e.g. with dmg2img) first"
        )
    }
}

/// Identifies HFS-family filesystems by the volume header signature at
/// offset 1024.
pub struct VolumeSignatureProber;

impl FilesystemProber for VolumeSignatureProber {
    fn name(&self) -> &'static str {
        "volume-signature"
    }

    fn probe(&self, source: &dyn ByteSource) -> Result<Vec<FilesystemKind>> {
        if source.len() < VOLUME_HEADER_OFFSET + 4 {
            return Ok(Vec::new());
        }
        let mut sig = [0u8; 2];
        source.read_exact_at(VOLUME_HEADER_OFFSET, &mut sig)?;
        let kind = match sig {
            HFSPLUS_SIGNATURE => FilesystemKind::HfsPlus,
            HFSX_SIGNATURE => FilesystemKind::Hfsx,
            HFS_SIGNATURE => FilesystemKind::Hfs,
            _ => return Ok(Vec::new()),
        };
        let mut version = [0u8; 2];
        source.read_exact_at(VOLUME_HEADER_OFFSET + 2, &mut version)?;
        let version = u16::from_be_bytes(version);
        match (kind, version) {
            (FilesystemKind::HfsPlus, 4) | (FilesystemKind::Hfsx, 5) | (FilesystemKind::Hfs, _) => {
            }
            (kind, version) => {
                warn!("{kind} signature with unexpected version {version}");
            }
        }
        Ok(vec![kind])
    }
}
