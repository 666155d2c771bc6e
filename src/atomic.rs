//! All-or-nothing file output
//!
//! Output goes to a temporary file next to the destination and is renamed
//! into place only by [`AtomicFile::commit`]. Either the old destination or the
//! complete new file exists, never a partial one. Dropping an uncommitted
//! `AtomicFile` deletes the temporary file.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{Result, VaultError};

const TEMP_PREFIX: &str = ".filevault-";
const TEMP_SUFFIX: &str = ".tmp";

/// Returns the directory that `path` lives in, treating a bare file name as
/// relative to the current directory.
pub(crate) fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

pub struct AtomicFile {
    temp: BufWriter<NamedTempFile>,
    dest: PathBuf,
}

impl AtomicFile {
    /// Create a temporary file in the directory of `dest`, so the final
    /// rename never crosses a filesystem boundary.
    pub fn create(dest: &Path) -> Result<Self> {
        let dir = parent_dir(dest);
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(dir)
            .map_err(|e| {
                VaultError::io(format!("failed to create tempfile in {}", dir.display()), e)
            })?;
        tracing::trace!(temp = %temp.path().display(), dest = %dest.display(), "created tempfile");
        Ok(Self {
            temp: BufWriter::new(temp),
            dest: dest.to_path_buf(),
        })
    }

    /// Flush, fsync and rename the temporary file onto the destination.
    pub fn commit(self) -> Result<()> {
        let dest = self.dest;
        let temp = self
            .temp
            .into_inner()
            .map_err(|e| VaultError::io("failed to flush tempfile", e.into_error()))?;
        // fsync() such that the rename, if it succeeds, will always point to
        // a valid file.
        temp.as_file()
            .sync_all()
            .map_err(|e| VaultError::io("failed to sync file prior to rename", e))?;
        restrict_permissions(temp.as_file())?;
        temp.persist(&dest).map_err(|e| {
            VaultError::io(
                format!("failed to rename to target file {}", dest.display()),
                e.error,
            )
        })?;
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.temp.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

/// Owner read/write only (0o600) on Unix systems.
#[cfg(unix)]
fn restrict_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = file
        .metadata()
        .map_err(|e| VaultError::io("failed to get tempfile metadata", e))?
        .permissions();
    perms.set_mode(0o600);
    file.set_permissions(perms)
        .map_err(|e| VaultError::io("failed to set tempfile permissions", e))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> Result<()> {
    Ok(())
}
