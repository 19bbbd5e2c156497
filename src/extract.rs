//! Recursive extraction of a filesystem tree onto the host.
//!
//! The engine walks entries handed out by a [`Filesystem`] and writes
//! them below a destination directory.  A failure on one entry is
//! recorded and never stops its siblings; only problems with the run
//! itself (an unresolvable root, an unusable output directory) are
//! fatal.  The caller gets a [`RunSummary`] with counts, the recorded
//! failures and any warnings.

use std::{
    fmt,
    fs::{self, File, FileTimes},
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    appledouble::encode_resource_fork,
    tree::{Entry, EntryMetadata, FileEntry, Filesystem, FolderEntry, Fork, ForkKind},
    COPY_BUFFER_SIZE,
};

/// Knobs for one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Extract the root folder's contents directly into the destination
    /// instead of creating a directory for the folder itself.
    pub flatten_root: bool,
    /// Write resource forks as AppleDouble `._name` sidecar files.
    pub resource_forks: bool,
    /// Log every extracted entry.
    pub verbose: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            flatten_root: true,
            resource_forks: false,
            verbose: false,
        }
    }
}

/// One entry that could not be extracted.
#[derive(Debug)]
pub struct EntryFailure {
    /// Destination path the entry was headed for.
    pub path: PathBuf,
    /// What went wrong.
    pub reason: String,
}

/// The outcome of an extraction run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Files successfully written (sidecars not counted).
    pub written: u64,
    /// Entries skipped because they are not extractable (links).
    pub skipped: u64,
    /// Entries that failed.
    pub failures: Vec<EntryFailure>,
    /// Non-fatal oddities noticed along the way.
    pub warnings: Vec<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} written, {} skipped, {} failed, {} warnings",
            self.written,
            self.skipped,
            self.failures.len(),
            self.warnings.len()
        )
    }
}

/// Errors that abort a run before or while setting it up.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The requested root path does not exist in the filesystem.
    #[error("no entry exists at {0:?}")]
    PathNotFound(String),
    /// The root resolved to something that cannot be extracted, such as
    /// a link.
    #[error("entry at {0:?} is neither a file nor a folder")]
    NotFileOrFolder(String),
    /// The destination directory could not be created.
    #[error("cannot create output directory {path:?}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The filesystem failed to resolve the root.
    #[error(transparent)]
    Lookup(#[from] anyhow::Error),
}

/// Replaces characters that are unsafe in host file names.
///
/// Code points 0 through 31 and 127 become `_`.  The result never
/// contains a character the function would replace, so sanitizing twice
/// is a no-op.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_control() { '_' } else { c })
        .collect()
}

/// Extracts the entry at `root_path` into `dest_root`.
pub fn extract(
    fs: &dyn Filesystem,
    root_path: &str,
    dest_root: &Path,
    options: &ExtractOptions,
) -> Result<RunSummary, ExtractError> {
    let entry = fs
        .lookup(root_path)
        .context("resolving extraction root")?
        .ok_or_else(|| ExtractError::PathNotFound(root_path.to_string()))?;

    let mut run = Run {
        fs,
        options,
        summary: RunSummary::default(),
    };
    match entry {
        Entry::Folder(folder) => {
            // the volume root has no usable name of its own
            let dest = if options.flatten_root || folder.name == "/" || folder.name.is_empty() {
                dest_root.to_path_buf()
            } else {
                dest_root.join(sanitize(&folder.name))
            };
            fs::create_dir_all(&dest).map_err(|source| ExtractError::Output {
                path: dest.clone(),
                source,
            })?;
            run.folder(&folder, &dest);
        }
        Entry::File(file) => {
            fs::create_dir_all(dest_root).map_err(|source| ExtractError::Output {
                path: dest_root.to_path_buf(),
                source,
            })?;
            run.file(&file, dest_root);
        }
        Entry::Link(_) => return Err(ExtractError::NotFileOrFolder(root_path.to_string())),
    }
    Ok(run.summary)
}

struct Run<'a> {
    fs: &'a dyn Filesystem,
    options: &'a ExtractOptions,
    summary: RunSummary,
}

impl Run<'_> {
    /// Extracts the contents of `folder` into the existing directory
    /// `dest`.
    fn folder(&mut self, folder: &FolderEntry, dest: &Path) {
        // timestamps are only restored on directories we fully own,
        // i.e. ones that were empty before we started filling them
        let was_empty = dir_is_empty(dest);

        let children = match self.fs.list(folder) {
            Ok(children) => children,
            Err(err) => {
                self.fail(dest, &err);
                return;
            }
        };
        for child in children {
            match child {
                Entry::Folder(sub) => {
                    let sub_dest = dest.join(sanitize(&sub.name));
                    if let Err(err) = fs::create_dir_all(&sub_dest) {
                        self.fail(&sub_dest, &err.into());
                        continue;
                    }
                    if self.options.verbose {
                        info!("{}/", sub_dest.display());
                    }
                    self.folder(&sub, &sub_dest);
                }
                Entry::File(file) => self.file(&file, dest),
                Entry::Link(link) => {
                    // links inside folders are a known limitation
                    debug!("skipping link {:?}", link.name);
                    self.summary.skipped += 1;
                }
            }
        }

        if was_empty {
            self.restore_times(dest, &folder.metadata);
        }
    }

    /// Extracts one file (and, if requested, its resource fork sidecar)
    /// into the existing directory `dir`.
    fn file(&mut self, file: &FileEntry, dir: &Path) {
        let name = sanitize(&file.name);
        let path = dir.join(&name);
        match self.write_data_fork(file, &path) {
            Ok(()) => {
                if self.options.verbose {
                    info!("{}", path.display());
                }
                self.summary.written += 1;
                self.restore_times(&path, &file.metadata);
            }
            // the sidecar is still attempted below
            Err(err) => self.fail(&path, &err),
        }

        if self.options.resource_forks {
            let sidecar = dir.join(format!("._{name}"));
            match self.write_sidecar(file, &sidecar) {
                Ok(true) => self.restore_times(&sidecar, &file.metadata),
                Ok(false) => {}
                Err(err) => self.fail(&sidecar, &err),
            }
        }
    }

    fn write_data_fork(&mut self, file: &FileEntry, path: &Path) -> Result<()> {
        let fork = self
            .fs
            .fork(file, ForkKind::Data)?
            .context("file has no data fork")?;
        let mut out = File::create(path)?;
        let copied = copy_fork(&fork, &mut out)?;
        if copied != fork.length {
            self.warn_entry(format!(
                "{}: fork declared {} bytes but yielded {copied}",
                path.display(),
                fork.length
            ));
        }
        Ok(())
    }

    /// Writes the resource fork as an AppleDouble container next to the
    /// primary file, reporting whether a sidecar was produced.  A file
    /// without a resource fork gets no sidecar.
    fn write_sidecar(&mut self, file: &FileEntry, path: &Path) -> Result<bool> {
        let Some(fork) = self.fs.fork(file, ForkKind::Resource)? else {
            return Ok(false);
        };
        if fork.length == 0 {
            return Ok(false);
        }
        let mut contents = Vec::new();
        let copied = copy_fork(&fork, &mut contents)?;
        if copied != fork.length {
            self.warn_entry(format!(
                "{}: fork declared {} bytes but yielded {copied}",
                path.display(),
                fork.length
            ));
        }
        fs::write(path, encode_resource_fork(&contents))?;
        if self.options.verbose {
            info!("{}", path.display());
        }
        Ok(true)
    }

    /// Applies access and modification times from `metadata` to an
    /// already-written path.  Failures here are warnings, not entry
    /// failures.
    fn restore_times(&mut self, path: &Path, metadata: &EntryMetadata) {
        let mut times = FileTimes::new();
        let mut any = false;
        if let Some(accessed) = metadata.accessed {
            times = times.set_accessed(accessed);
            any = true;
        }
        if let Some(modified) = metadata.modified {
            let modified = if modified < SystemTime::UNIX_EPOCH {
                self.warn_entry(format!(
                    "{}: modification time predates 1970, clamped to the epoch",
                    path.display()
                ));
                SystemTime::UNIX_EPOCH
            } else {
                modified
            };
            times = times.set_modified(modified);
            any = true;
        }
        // creation times are not settable through portable APIs
        if !any {
            return;
        }
        let result = File::open(path).and_then(|handle| handle.set_times(times));
        if let Err(err) = result {
            self.warn_entry(format!(
                "{}: could not restore timestamps: {err}",
                path.display()
            ));
        }
    }

    fn fail(&mut self, path: &Path, err: &anyhow::Error) {
        warn!("failed to extract {}: {err:#}", path.display());
        self.summary.failures.push(EntryFailure {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        });
    }

    fn warn_entry(&mut self, message: String) {
        warn!("{message}");
        self.summary.warnings.push(message);
    }
}

/// Streams a fork into `out`, returning the number of bytes copied.
fn copy_fork(fork: &Fork, out: &mut impl Write) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut offset = 0;
    loop {
        let n = fork.source.read_at(offset, &mut buf)?;
        if n == 0 {
            return Ok(offset);
        }
        out.write_all(&buf[..n])?;
        offset += n as u64;
    }
}

fn dir_is_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}
