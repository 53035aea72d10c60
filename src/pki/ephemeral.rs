//! Scoped on-disk storage for key material handed to external signers
//!
//! The directory and everything in it is removed when the value is dropped,
//! whichever way the signing operation exits.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;

/// A private temporary directory owned by exactly one signing operation
#[derive(Debug)]
pub struct EphemeralKeyDir {
    dir: TempDir,
}

impl EphemeralKeyDir {
    /// Create a directory under the system temp root
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("outpost-sign-").tempdir()?;
        Ok(Self { dir })
    }

    /// Create a directory under `root`
    pub fn new_in(root: impl AsRef<Path>) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("outpost-sign-")
            .tempdir_in(root)?;
        Ok(Self { dir })
    }

    /// Directory path
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file readable only by the current user (0600)
    pub fn write_secret(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        self.write(name, contents, 0o600)
    }

    /// Write a world-readable file (0644)
    pub fn write_public(&self, name: &str, contents: &str) -> io::Result<PathBuf> {
        self.write(name, contents, 0o644)
    }

    /// Remove the directory now, logging instead of failing on error
    pub fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove ephemeral key directory");
        }
    }

    fn write(&self, name: &str, contents: &str, mode: u32) -> io::Result<PathBuf> {
        let path = self.dir.path().join(name);

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&path)?;
        file.write_all(contents.as_bytes())?;
        // ssh-keygen rejects key files without a trailing newline
        if !contents.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        Ok(path)
    }
}
