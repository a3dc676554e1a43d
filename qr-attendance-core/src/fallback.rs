//! Local fallback file for records the remote store did not accept
//!
//! The file holds one serialized record per line. It is read back and
//! removed as a whole; there is no partial consumption.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Default file name inside the working directory
pub const DEFAULT_FALLBACK_FILE: &str = "failed_attendance.log";

/// Contents of a consumed fallback file
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TakenLines {
    /// Non-blank lines without their terminators
    pub lines: Vec<String>,
    /// Lines that were not valid UTF-8
    pub invalid: usize,
}

/// Append-only local store, owned by the delivery worker
#[derive(Debug, Clone)]
pub struct FallbackStore {
    path: PathBuf,
}

impl FallbackStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append an already newline-terminated line, creating parent
    /// directories as needed
    pub fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Read every line and delete the file.
    ///
    /// Returns `None` when there is no fallback file. Blank lines are
    /// skipped. The file is removed even if some lines are not valid UTF-8;
    /// those are only counted in [`TakenLines::invalid`].
    pub fn take_all(&self) -> Result<Option<TakenLines>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&self.path)?;

        let mut taken = TakenLines::default();
        for raw in bytes.split(|b| *b == b'\n') {
            match std::str::from_utf8(raw) {
                Ok(line) => {
                    let line = line.trim_end_matches('\r');
                    if !line.trim().is_empty() {
                        taken.lines.push(line.to_string());
                    }
                }
                Err(_) => taken.invalid += 1,
            }
        }
        Ok(Some(taken))
    }

    /// Number of non-blank lines waiting in the file
    pub fn pending_lines(&self) -> Result<usize> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes)
                .lines()
                .filter(|l| !l.trim().is_empty())
                .count()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
