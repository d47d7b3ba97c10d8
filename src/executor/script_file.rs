//! Temporary script files.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

/// A script written to a uniquely named file, removed when dropped.
#[derive(Debug)]
pub struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    /// Writes `contents` to `psguard-<uuid>.<extension>` under `dir`.
    ///
    /// The file is created exclusively and, on Unix, readable only by the
    /// current user.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn create(dir: &Path, extension: &str, contents: &str) -> io::Result<Self> {
        let path = dir.join(format!("psguard-{}.{extension}", Uuid::new_v4()));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&path)?;
        // From here on the file exists and must be cleaned up on failure.
        let script = Self { path };
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        debug!(path = %script.path.display(), "script file written");
        Ok(script)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove script file");
            }
        }
    }
}
