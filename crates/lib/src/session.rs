//! Session credential store.
//!
//! One JSON file per session (e.g. `~/.tgforward/session.session`) holding the bot token, the
//! application id it was created under, and the last acknowledged update offset. Only the
//! messaging client reads or writes it; everything else passes the store around unopened.
//!
//! The store holds an exclusive advisory lock on `<path>.lock` for as long as it is open, so two
//! forwarders cannot poll with the same session.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::client::ClientError;

/// Persisted session contents.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    /// Application id the session was authorized under.
    pub api_id: i64,
    pub bot_token: String,
    /// Next getUpdates offset; updates below it were already delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_offset: Option<i64>,
}

impl fmt::Debug for SessionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionData")
            .field("api_id", &self.api_id)
            .field("bot_token", &"<redacted>")
            .field("update_offset", &self.update_offset)
            .finish()
    }
}

/// Open, locked handle to a session file.
pub struct SessionStore {
    path: PathBuf,
    _lock: File,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore").field("path", &self.path).finish()
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

impl SessionStore {
    /// Open the store at `path`, creating parent directories. Fails with
    /// [`ClientError::SessionLocked`] if another handle holds the lock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let lock_path = sibling(&path, ".lock");
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if let Err(e) = lock.try_lock_exclusive() {
            if e.kind() == ErrorKind::WouldBlock
                || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
            {
                return Err(ClientError::SessionLocked(path.display().to_string()));
            }
            return Err(ClientError::SessionIo(e));
        }
        log::debug!("session store opened: {}", path.display());
        Ok(Self { path, _lock: lock })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the session. Missing or empty file => `None`.
    pub fn load(&self) -> Result<Option<SessionData>, ClientError> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if s.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&s)?))
    }

    /// Replace the session contents (write to a temp file, then rename over the old one).
    pub fn save(&self, data: &SessionData) -> Result<(), ClientError> {
        let tmp = sibling(&self.path, ".tmp");
        let s = serde_json::to_string_pretty(data)?;
        std::fs::write(&tmp, s)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Same as [`save`](Self::save), on tokio's blocking pool; for use inside the update loop.
    pub async fn save_async(&self, data: &SessionData) -> Result<(), ClientError> {
        let tmp = sibling(&self.path, ".tmp");
        let s = serde_json::to_string_pretty(data)?;
        tokio::fs::write(&tmp, s).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
