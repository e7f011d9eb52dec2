//! Append-only local journal of accepted readings, one JSON object per line.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::prelude::*;

pub struct Journal {
    file: File,
    path: PathBuf,
}

/// One journal line. A missing file means "no history" to readers, so the
/// journal is only ever appended to, never rewritten.
#[derive(Serialize)]
struct Entry {
    timestamp: String,
    raw: i64,
    moisture: i64,
    temperature: f64,
    humidity: f64,
    status: Status,
}

impl Journal {
    /// Opens the journal once; the handle lives for the process lifetime.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open the journal `{}`", path.display()))?;
        Ok(Self { file, path })
    }

    /// Appends one reading. The write is flushed before returning.
    pub fn append(&mut self, reading: &Reading) -> Result {
        let entry = Entry {
            timestamp: reading.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            raw: reading.raw,
            moisture: reading.moisture,
            temperature: reading.temperature,
            humidity: reading.humidity,
            status: reading.status,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .with_context(|| format!("failed to append to `{}`", self.path.display()))?;
        Ok(())
    }
}
