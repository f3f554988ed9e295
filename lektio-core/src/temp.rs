use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Filename pattern of the cache residue the download tool leaves in its
/// working directory after each invocation.
const LEFTOVER_CACHE_PATTERN: &str = r"^\d+-player-.*\.js$";

/// Process-wide scratch directory. Every pipeline run works inside its own
/// uniquely named subdirectory so concurrent runs for the same video can
/// never clobber each other's files.
#[derive(Debug, Clone)]
pub struct ScratchWorkspace {
    root: PathBuf,
}

impl ScratchWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the per-run subdirectory `<label>-<uuid>`.
    pub fn begin_run(&self, label: &str) -> io::Result<RunScratch> {
        let dir = self
            .root
            .join(format!("{label}-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&dir)?;
        Ok(RunScratch { dir })
    }

    /// Empties the scratch root. Individual deletion failures are logged and
    /// skipped; this never fails the caller.
    pub fn release_all(&self) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.root.display(), error = %err, "failed to scan scratch directory");
                return 0;
            }
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to remove scratch entry");
                }
            }
        }
        removed
    }
}

/// Scratch directory scoped to a single pipeline run. Released explicitly by
/// the orchestrator on every exit path; the `Drop` impl is a backstop for
/// panics and early drops.
#[derive(Debug)]
pub struct RunScratch {
    dir: PathBuf,
}

impl RunScratch {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns a path for `name` inside the run directory without creating
    /// the file.
    pub fn allocate(&self, name: impl AsRef<str>) -> PathBuf {
        self.dir.join(name.as_ref())
    }

    /// Deletes the run directory and everything in it. Logs and continues on
    /// failure; never fails the caller.
    pub fn release(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.dir.display(), error = %err, "failed to release run scratch directory");
            }
        }
    }
}

impl Drop for RunScratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Deletes download-tool cache residue (`<digits>-player-*.js`) from the tool
/// working directory. Non-matching files are left untouched. Returns how many
/// files were removed.
pub fn sweep_leftover_caches(work_dir: &Path) -> usize {
    let pattern = match Regex::new(LEFTOVER_CACHE_PATTERN) {
        Ok(pattern) => pattern,
        Err(err) => {
            warn!(error = %err, "invalid leftover cache pattern");
            return 0;
        }
    };
    let entries = match std::fs::read_dir(work_dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(path = %work_dir.display(), error = %err, "failed to scan tool working directory");
            return 0;
        }
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if !pattern.is_match(name) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(file = name, "removed leftover cache file");
                removed += 1;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to remove leftover cache file");
            }
        }
    }
    removed
}
