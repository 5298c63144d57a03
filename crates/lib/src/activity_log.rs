//! Append-only activity log: one `<timestamp> - <text>` line per entry.
//!
//! Writes are best effort. Each entry opens the file, appends, and closes it again; any
//! failure is dropped so logging can never stop forwarding.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry; also mirrored at info level.
    pub fn write(&self, text: &str) {
        log::info!("{}", text);
        self.append(text);
    }

    /// Append an entry for a fatal condition; mirrored at error level.
    pub fn write_fatal(&self, text: &str) {
        log::error!("{}", text);
        self.append(text);
    }

    fn append(&self, text: &str) {
        let line = format_entry(chrono::Local::now(), text);
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }
}

fn format_entry<Tz>(at: chrono::DateTime<Tz>, text: &str) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{} - {}\n", at.format(TIMESTAMP_FORMAT), text)
}
