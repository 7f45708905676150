//! Atomic whole-file replacement for small human-readable reports.
//!
//! Readers (humans, monitoring scripts) must never observe a half-written
//! report, so every write goes to a temp sibling and is renamed over the
//! target.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A named report file under a fixed directory.
#[derive(Debug, Clone)]
pub struct StatsFile {
    path: PathBuf,
}

impl StatsFile {
    pub fn new<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        Self {
            path: dir.as_ref().join(name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the file's contents atomically.
    pub fn write(&self, contents: &str) -> io::Result<()> {
        // Unique temp name so concurrent writers cannot collide
        let tmp = self.path.with_extension(format!("tmp.{}", std::process::id()));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        if let Err(e) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        tracing::debug!(path = %self.path.display(), bytes = contents.len(), "report written");
        Ok(())
    }
}
