//! Per-run private working directory
//!
//! Every execution gets a fresh `0700` directory from [`tempfile`] holding
//! three well-known files. [`Workspace::release`] removes them one by one and
//! then the directory itself; failures become a [`CleanupError`] value instead
//! of an error path. If a workspace is dropped without being released (a
//! panic unwinding through the orchestrator) the inner `TempDir` still
//! removes the tree.

use crate::error::CleanupError;
use crate::{Result, SandprofError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Generated harness program
pub const PROGRAM_FILE: &str = "untrusted_code.py";
/// Profiler table written by the harness
pub const STATS_FILE: &str = "profile.stats";
/// One-line peak memory report written by the harness
pub const MEMORY_FILE: &str = "memory.txt";

const DIR_PREFIX: &str = "sandprof-";

/// File read back from a workspace; `contents` is `None` when it was absent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact<T> {
    pub path: PathBuf,
    pub contents: Option<T>,
}

#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    program: PathBuf,
    stats: PathBuf,
    memory: PathBuf,
}

impl Workspace {
    /// Create a fresh, uniquely named directory under `root`.
    pub fn acquire(root: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(DIR_PREFIX)
            .tempdir_in(root)
            .map_err(|e| {
                SandprofError::Workspace(format!(
                    "failed to create workspace under {}: {e}",
                    root.display()
                ))
            })?;

        let base = dir.path().to_path_buf();
        tracing::debug!(workspace = %base.display(), "workspace acquired");

        Ok(Self {
            program: base.join(PROGRAM_FILE),
            stats: base.join(STATS_FILE),
            memory: base.join(MEMORY_FILE),
            dir,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn program_path(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn stats_path(&self) -> &Path {
        &self.stats
    }

    #[must_use]
    pub fn memory_path(&self) -> &Path {
        &self.memory
    }

    pub fn write_program(&self, source: &str) -> Result<()> {
        std::fs::write(&self.program, source)?;
        Ok(())
    }

    #[must_use]
    pub fn read_stats(&self) -> Artifact<Vec<u8>> {
        Artifact {
            path: self.stats.clone(),
            contents: read_optional(&self.stats, |p| std::fs::read(p)),
        }
    }

    #[must_use]
    pub fn read_memory(&self) -> Artifact<String> {
        Artifact {
            path: self.memory.clone(),
            contents: read_optional(&self.memory, |p| std::fs::read_to_string(p)),
        }
    }

    /// Remove every artifact and the directory.
    ///
    /// Each removal is attempted even if an earlier one failed. The untrusted
    /// code may have created extra files, so the directory goes last as a
    /// whole tree.
    pub fn release(self) -> std::result::Result<(), CleanupError> {
        let Self {
            dir,
            program,
            stats,
            memory,
        } = self;
        let base = dir.path().to_path_buf();
        let mut failures = Vec::new();

        for file in [&program, &stats, &memory] {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => failures.push(format!("{}: {e}", file.display())),
            }
        }

        if let Err(e) = dir.close() {
            failures.push(format!("{}: {e}", base.display()));
        }

        if failures.is_empty() {
            tracing::debug!(workspace = %base.display(), "workspace released");
            Ok(())
        } else {
            tracing::warn!(workspace = %base.display(), ?failures, "workspace cleanup incomplete");
            Err(CleanupError { failures })
        }
    }
}

/// Run `f` in a fresh workspace and release it on every exit path.
///
/// Returns the closure's value together with any cleanup failure.
pub fn scoped<T>(
    root: &Path,
    f: impl FnOnce(&Workspace) -> T,
) -> Result<(T, Option<CleanupError>)> {
    let workspace = Workspace::acquire(root)?;
    let value = f(&workspace);
    let cleanup = workspace.release().err();
    Ok((value, cleanup))
}

fn read_optional<T>(path: &Path, read: impl Fn(&Path) -> std::io::Result<T>) -> Option<T> {
    match read(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read artifact");
            None
        }
    }
}
