//! Explicit session context: auth token, signed-in email and UI flags, with
//! every write forwarded to a pluggable store.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex as StdMutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session file io failed: {0}")]
    Io(#[from] io::Error),
    #[error("session file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Session, SessionError>;
    fn save(&self, session: &Session) -> Result<(), SessionError>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    saved: StdMutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn with_session(session: Session) -> Self {
        Self {
            saved: StdMutex::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Session, SessionError> {
        let saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(saved.clone().unwrap_or_default())
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }
}

/// JSON file store. A missing file loads as an empty session.
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Session, SessionError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "session: no stored session");
                Ok(Session::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(session)?)?;
        Ok(())
    }
}

pub struct SessionContext {
    store: Box<dyn SessionStore>,
    state: RwLock<Session>,
}

impl SessionContext {
    pub fn open(store: impl SessionStore + 'static) -> Result<Self, SessionError> {
        let state = store.load()?;
        Ok(Self {
            store: Box::new(store),
            state: RwLock::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemorySessionStore::default()),
            state: RwLock::new(Session::default()),
        }
    }

    pub async fn snapshot(&self) -> Session {
        self.state.read().await.clone()
    }

    pub async fn auth_token(&self) -> Option<String> {
        self.state.read().await.auth_token.clone()
    }

    pub async fn set_auth_token(&self, token: Option<String>) -> Result<(), SessionError> {
        self.update(|session| session.auth_token = token).await
    }

    pub async fn user_email(&self) -> Option<String> {
        self.state.read().await.user_email.clone()
    }

    pub async fn set_user_email(&self, email: Option<String>) -> Result<(), SessionError> {
        self.update(|session| session.user_email = email).await
    }

    pub async fn flag(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .flags
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    pub async fn set_flag(&self, name: &str, value: bool) -> Result<(), SessionError> {
        let name = name.to_string();
        self.update(|session| {
            session.flags.insert(name, value);
        })
        .await
    }

    /// Drops credentials but keeps UI flags.
    pub async fn invalidate(&self) -> Result<(), SessionError> {
        info!("session: invalidating credentials");
        self.update(|session| {
            session.auth_token = None;
            session.user_email = None;
        })
        .await
    }

    async fn update(&self, mutate: impl FnOnce(&mut Session)) -> Result<(), SessionError> {
        let mut guard = self.state.write().await;
        mutate(&mut guard);
        self.store.save(&guard)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn memory_store_keeps_working_after_poisoned_lock() {
        let store = Arc::new(MemorySessionStore::default());
        let holder = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _saved = holder.saved.lock().expect("lock");
            panic!("writer crashed while holding the session");
        })
        .join();
        assert!(store.saved.is_poisoned());

        let session = Session {
            auth_token: Some("token".into()),
            ..Session::default()
        };
        store.save(&session).expect("save");
        assert_eq!(store.load().expect("load"), session);
    }

    #[tokio::test]
    async fn invalidate_keeps_flags_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("session.json");
        let context = SessionContext::open(FileSessionStore::new(&path)).expect("open");

        context
            .set_auth_token(Some("jwt-token".into()))
            .await
            .expect("token");
        context
            .set_user_email(Some("parent@example.com".into()))
            .await
            .expect("email");
        context.set_flag("seen_tour", true).await.expect("flag");
        context.invalidate().await.expect("invalidate");

        let reopened = FileSessionStore::new(&path).load().expect("reload");
        assert_eq!(reopened.auth_token, None);
        assert_eq!(reopened.user_email, None);
        assert_eq!(reopened.flags.get("seen_tour"), Some(&true));
        assert!(context.flag("seen_tour").await);
    }

    #[tokio::test]
    async fn context_reads_previously_stored_session() {
        let store = MemorySessionStore::with_session(Session {
            auth_token: Some("abc".into()),
            ..Session::default()
        });
        let context = SessionContext::open(store).expect("open");
        assert_eq!(context.auth_token().await.as_deref(), Some("abc"));
        assert!(!context.flag("unknown").await);
    }

    #[test]
    fn missing_file_loads_empty_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(dir.path().join("absent.json"));
        assert_eq!(store.load().expect("load"), Session::default());
    }
}
