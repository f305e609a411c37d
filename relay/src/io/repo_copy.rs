//! Isolated repository copies, one per running worker.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory never copied into a worker copy (relay state, sessions, copies).
const RELAY_DIR: &str = ".relay";

/// An exclusively owned working copy. Not `Clone`: it moves into one worker
/// and goes back to the service to be discarded.
#[derive(Debug)]
pub struct RepoCopy {
    id: String,
    root: PathBuf,
}

impl RepoCopy {
    pub fn new(id: impl Into<String>, root: PathBuf) -> Self {
        Self {
            id: id.into(),
            root,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Creates and discards repository copies.
pub trait RepoCopyService: Send + Sync {
    fn create_copy(&self, label: &str) -> Result<RepoCopy>;
    fn discard(&self, copy: RepoCopy) -> Result<()>;
}

/// Copies the source tree into a fresh directory per worker.
#[derive(Debug, Clone)]
pub struct DirCopyService {
    source: PathBuf,
    copies_root: PathBuf,
    retain: bool,
}

impl DirCopyService {
    /// `copies_root` receives one subdirectory per copy.
    pub fn new(source: impl Into<PathBuf>, copies_root: impl Into<PathBuf>, retain: bool) -> Self {
        Self {
            source: source.into(),
            copies_root: copies_root.into(),
            retain,
        }
    }

    /// Create `<label>` or the first free `<label>-N`; returns the name used.
    fn fresh_dir(&self, label: &str) -> Result<(String, PathBuf)> {
        fs::create_dir_all(&self.copies_root)
            .with_context(|| format!("create copies dir {}", self.copies_root.display()))?;
        for n in 0..1000u32 {
            let name = if n == 0 {
                label.to_string()
            } else {
                format!("{label}-{n}")
            };
            let dir = self.copies_root.join(&name);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((name, dir)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("create copy dir {}", dir.display()));
                }
            }
        }
        Err(anyhow!("no free copy directory for '{label}'"))
    }

    fn is_skipped(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.source) else {
            return true;
        };
        if rel
            .components()
            .next()
            .is_some_and(|c| c.as_os_str() == RELAY_DIR)
        {
            return true;
        }
        path.starts_with(&self.copies_root)
    }
}

impl RepoCopyService for DirCopyService {
    fn create_copy(&self, label: &str) -> Result<RepoCopy> {
        let (id, dest) = self.fresh_dir(label)?;
        let walker = WalkDir::new(&self.source)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_skipped(entry.path()));

        let mut files = 0usize;
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.source.display()))?;
            let rel = entry
                .path()
                .strip_prefix(&self.source)
                .with_context(|| format!("relativize {}", entry.path().display()))?;
            let target = dest.join(rel);
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::create_dir_all(&target)
                    .with_context(|| format!("create {}", target.display()))?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target).with_context(|| {
                    format!("copy {} to {}", entry.path().display(), target.display())
                })?;
                files += 1;
            }
        }

        debug!(copy = %dest.display(), files, "created repository copy");
        Ok(RepoCopy::new(id, dest))
    }

    fn discard(&self, copy: RepoCopy) -> Result<()> {
        if self.retain {
            debug!(copy = %copy.root.display(), "retaining repository copy");
            return Ok(());
        }
        fs::remove_dir_all(&copy.root)
            .with_context(|| format!("remove copy {}", copy.root.display()))
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(source).with_context(|| format!("read link {}", source.display()))?;
    std::os::unix::fs::symlink(&link, target)
        .with_context(|| format!("create link {}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, _target: &Path) -> Result<()> {
    warn!(path = %source.display(), "skipping symlink in repository copy");
    Ok(())
}

/// Remove a copies directory left empty after all copies were discarded.
pub fn remove_if_empty(dir: &Path) {
    let is_empty = fs::read_dir(dir).map(|mut entries| entries.next().is_none());
    if matches!(is_empty, Ok(true))
        && let Err(err) = fs::remove_dir(dir)
    {
        warn!(dir = %dir.display(), err = %err, "could not remove empty copies dir");
    }
}
