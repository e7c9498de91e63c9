//! Session storage
//!
//! [`SessionStore`] is the boundary the request executor reads and mutates
//! sessions through. `update` is the only mutation path used during a
//! request and must be atomic per subject: readers observe either the state
//! before or after an update, never a mix.
//!
//! [`FileSessionStore`] keeps a JSON file mapping subjects to sessions. All
//! writes use atomic temp-file + rename, and a tokio Mutex serializes
//! writers. A change is applied to a copy of the map, and the copy replaces
//! the in-memory state only once it is on disk. Each write runs on its own
//! task, so a caller that gives up waiting (timeout, dropped request) cannot
//! stop it halfway: memory and disk never diverge.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{OAuthSession, SessionUpdate};

/// Boxed future returned by [`SessionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Session persistence used by the request executor.
///
/// Uses `Pin<Box<dyn Future>>` return types so it can be held as
/// `Arc<dyn SessionStore>`.
pub trait SessionStore: Send + Sync {
    /// Load the current session for `subject`. Missing subject is `NotFound`.
    fn load<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, OAuthSession>;

    /// Apply `update` durably and return the post-update session.
    fn update<'a>(
        &'a self,
        subject: &'a str,
        update: SessionUpdate,
    ) -> StoreFuture<'a, OAuthSession>;
}

/// JSON-file-backed session store.
pub struct FileSessionStore {
    path: PathBuf,
    state: Arc<Mutex<Sessions>>,
}

type Sessions = HashMap<String, OAuthSession>;

impl FileSessionStore {
    /// Load sessions from the given file path.
    ///
    /// If the file doesn't exist, creates it as `{}`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading session file: {e}")))?;
            let sessions: Sessions = serde_json::from_str(&contents)
                .map_err(|e| Error::SessionParse(format!("parsing session file: {e}")))?;
            info!(path = %path.display(), sessions = sessions.len(), "loaded sessions");
            sessions
        } else {
            info!(path = %path.display(), "session file not found, starting with empty store");
            let store = HashMap::new();
            write_atomic(&path, &store).await?;
            store
        };

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Get a clone of a specific session.
    pub async fn get(&self, subject: &str) -> Option<OAuthSession> {
        let state = self.state.lock().await;
        state.get(subject).cloned()
    }

    /// Add or replace a session (initial authorization) and persist to disk.
    pub async fn insert(&self, session: OAuthSession) -> Result<()> {
        let subject = session.subject.clone();
        self.commit(move |sessions| {
            sessions.insert(session.subject.clone(), session);
            Ok(())
        })
        .await?;
        debug!(subject, "inserted session");
        Ok(())
    }

    /// Remove a session (logout) and persist to disk.
    ///
    /// Returns the removed session if it existed.
    pub async fn remove(&self, subject: &str) -> Result<Option<OAuthSession>> {
        let key = subject.to_string();
        let removed = self.commit(move |sessions| Ok(sessions.remove(&key))).await?;
        if removed.is_some() {
            debug!(subject, "removed session");
        }
        Ok(removed)
    }

    /// List all stored subjects.
    pub async fn subjects(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn apply_update(&self, subject: &str, update: SessionUpdate) -> Result<OAuthSession> {
        let key = subject.to_string();
        let result = self
            .commit(move |sessions| {
                let session = sessions
                    .get_mut(&key)
                    .ok_or_else(|| Error::NotFound(format!("subject {key} has no session")))?;
                update.apply(session);
                Ok(session.clone())
            })
            .await;
        match &result {
            Ok(_) => debug!(subject, "updated session"),
            Err(Error::NotFound(_)) => {}
            Err(e) => warn!(subject, error = %e, "session write failed, keeping previous state"),
        }
        result
    }

    /// Apply `change` to a copy of the sessions, persist the copy, then
    /// adopt it in memory.
    ///
    /// Runs on a spawned task that owns the lock guard, so dropping the
    /// returned future does not interrupt the write. An error from `change`
    /// or from the write leaves both memory and disk untouched.
    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut Sessions) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.state.clone();
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut current = state.lock_owned().await;
            let mut next = current.clone();
            let output = change(&mut next)?;
            write_atomic(&path, &next).await?;
            *current = next;
            Ok(output)
        })
        .await
        .map_err(|e| Error::Io(format!("session write task failed: {e}")))?
    }
}

impl SessionStore for FileSessionStore {
    fn load<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, OAuthSession> {
        Box::pin(async move {
            self.get(subject)
                .await
                .ok_or_else(|| Error::NotFound(format!("subject {subject} has no session")))
        })
    }

    fn update<'a>(
        &'a self,
        subject: &'a str,
        update: SessionUpdate,
    ) -> StoreFuture<'a, OAuthSession> {
        Box::pin(self.apply_update(subject, update))
    }
}

/// Write sessions to a file atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &Sessions) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::SessionParse(format!("serializing sessions: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("session path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".sessions.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp session file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting session file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp session file: {e}")))?;

    debug!(path = %path.display(), "persisted sessions");
    Ok(())
}
