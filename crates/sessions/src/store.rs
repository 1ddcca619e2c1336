use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use valet_domain::error::{Error, Result};
use valet_domain::message::{Message, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single conversation with ordered message history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_owned(),
            messages: Vec::new(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// File-per-session store rooted at `<workspace>/.sessions/`.
pub struct SessionStore {
    sessions_dir: PathBuf,
    /// In-memory cache of loaded sessions.
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    /// Create a store rooted in the given workspace. The `.sessions`
    /// directory is created eagerly.
    pub fn new(workspace: &Path) -> Result<Self> {
        let sessions_dir = workspace.join(".sessions");
        std::fs::create_dir_all(&sessions_dir).map_err(Error::Io)?;

        tracing::info!(path = %sessions_dir.display(), "session store ready");

        Ok(Self {
            sessions_dir,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    /// Resolve a session, loading persisted history from disk if present.
    /// Returns `(session, is_new)`.
    pub fn get_or_create(&self, session_id: &str) -> Result<(Arc<Mutex<Session>>, bool)> {
        // Fast path: already cached.
        {
            let sessions = self.sessions.read();
            if let Some(session) = sessions.get(session_id) {
                return Ok((session.clone(), false));
            }
        }

        let path = self.session_path(session_id);
        let (session, is_new) = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(Error::Io)?;
            let session: Session = serde_json::from_str(&raw).map_err(|e| {
                // Malformed files are rejected, never silently truncated.
                Error::Session(format!(
                    "session file {} does not match the expected shape: {e}",
                    path.display()
                ))
            })?;
            (session, false)
        } else {
            (Session::new(session_id), true)
        };

        let mut sessions = self.sessions.write();
        let entry = sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(session)))
            .clone();
        Ok((entry, is_new))
    }

    /// Append a message and flush to disk before returning.
    pub fn append(&self, session: &Arc<Mutex<Session>>, message: Message) -> Result<()> {
        let snapshot = {
            let mut session = session.lock();
            session.messages.push(message);
            session.updated_at = Utc::now();
            session.clone()
        };
        self.flush(&snapshot)
    }

    /// Append a tool-result message referencing a prior assistant tool call.
    pub fn append_tool_result(
        &self,
        session: &Arc<Mutex<Session>>,
        tool_call: &ToolCall,
        content: &str,
    ) -> Result<()> {
        self.append(
            session,
            Message::tool_result(&tool_call.id, content, Some(tool_call.name.clone())),
        )
    }

    /// Replace the full message history. Used only by compaction.
    pub fn replace_messages(
        &self,
        session: &Arc<Mutex<Session>>,
        messages: Vec<Message>,
    ) -> Result<()> {
        let snapshot = {
            let mut session = session.lock();
            session.messages = messages;
            session.updated_at = Utc::now();
            session.clone()
        };
        self.flush(&snapshot)
    }

    /// Write a session snapshot to its file.
    fn flush(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.session_id);
        let json = serde_json::to_string_pretty(session).map_err(Error::Json)?;
        std::fs::write(&path, json).map_err(Error::Io)?;
        Ok(())
    }

    /// List all persisted session ids (sorted).
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = std::fs::read_dir(&self.sessions_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        let path = e.path();
                        if path.extension().is_some_and(|ext| ext == "json") {
                            path.file_stem().map(|s| s.to_string_lossy().into_owned())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Delete a session from memory and disk. Returns whether it existed.
    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.write().remove(session_id);
        let path = self.session_path(session_id);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(session_id, error = %e, "failed to delete session file");
                return false;
            }
            true
        } else {
            false
        }
    }

    /// Delete sessions whose `updated_at` is older than the cutoff.
    /// Returns the number deleted.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut deleted = 0;
        for session_id in self.list() {
            let stale = match self.get_or_create(&session_id) {
                Ok((session, _)) => session.lock().updated_at < cutoff,
                // A file that no longer parses is not silently removed.
                Err(_) => false,
            };
            if stale && self.delete(&session_id) {
                deleted += 1;
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::message::Role;

    #[test]
    fn first_resolution_creates_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let (_, is_new) = store.get_or_create("s1").unwrap();
        assert!(is_new);
        let (_, is_new) = store.get_or_create("s1").unwrap();
        assert!(!is_new);
    }

    #[test]
    fn append_survives_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(dir.path()).unwrap();
            let (session, _) = store.get_or_create("s1").unwrap();
            store.append(&session, Message::user("hello")).unwrap();
            store.append(&session, Message::assistant("hi")).unwrap();
        }

        // Fresh store, same workspace: history must be there.
        let store = SessionStore::new(dir.path()).unwrap();
        let (session, is_new) = store.get_or_create("s1").unwrap();
        assert!(!is_new);
        let session = session.lock();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "hi");
    }

    #[test]
    fn malformed_session_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join(".sessions/bad.json"), "{\"nope\": 1}").unwrap();

        let err = store.get_or_create("bad").unwrap_err();
        assert!(matches!(err, Error::Session(_)));
    }

    #[test]
    fn replace_messages_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        let (session, _) = store.get_or_create("s1").unwrap();
        store.append(&session, Message::user("a")).unwrap();
        store.append(&session, Message::user("b")).unwrap();

        store
            .replace_messages(&session, vec![Message::system("summary")])
            .unwrap();

        let store2 = SessionStore::new(dir.path()).unwrap();
        let (reloaded, _) = store2.get_or_create("s1").unwrap();
        let reloaded = reloaded.lock();
        assert_eq!(reloaded.messages.len(), 1);
        assert_eq!(reloaded.messages[0].role, Role::System);
    }

    #[test]
    fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        for id in ["a", "b", "c"] {
            let (session, _) = store.get_or_create(id).unwrap();
            store.append(&session, Message::user("x")).unwrap();
        }

        assert_eq!(store.list(), vec!["a", "b", "c"]);
        assert!(store.delete("b"));
        assert!(!store.delete("b"));
        assert_eq!(store.list(), vec!["a", "c"]);
    }

    #[test]
    fn cleanup_removes_only_stale_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let (old, _) = store.get_or_create("old").unwrap();
        store.append(&old, Message::user("x")).unwrap();
        {
            let mut session = old.lock();
            session.updated_at = Utc::now() - Duration::days(60);
            let snapshot = session.clone();
            drop(session);
            store.flush(&snapshot).unwrap();
        }
        // Drop the cache so cleanup re-reads the stale timestamp from disk.
        store.sessions.write().clear();

        let (fresh, _) = store.get_or_create("fresh").unwrap();
        store.append(&fresh, Message::user("y")).unwrap();

        let deleted = store.cleanup_older_than(Duration::days(30));
        assert_eq!(deleted, 1);
        assert_eq!(store.list(), vec!["fresh"]);
    }
}
