use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::{Session, SessionConfig};
use crate::error::{Result, SessionError};
use crate::segmentation::SegmentationBackend;

/// Opaque key handed to whoever drives a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Makes a fresh backend for each new session
pub type BackendFactory = Box<dyn Fn() -> Box<dyn SegmentationBackend> + Send + Sync>;

/// Live sessions by id
///
/// Each session sits behind its own mutex, so requests for one session are
/// serialized while different sessions proceed independently.
pub struct SessionRegistry {
    factory: BackendFactory,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<Session>>>>,
}

impl SessionRegistry {
    pub fn new<F>(factory: F, config: SessionConfig) -> Self
    where
        F: Fn() -> Box<dyn SegmentationBackend> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Open a new session with its own backend instance
    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        let session = Session::new((self.factory)(), self.config.clone());
        self.table().insert(id, Arc::new(Mutex::new(session)));
        tracing::info!("Session {} created", id);
        id
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        self.table()
            .get(&id)
            .cloned()
            .ok_or(SessionError::UnknownSession(id))
    }

    pub fn remove(&self, id: SessionId) -> Result<()> {
        match self.table().remove(&id) {
            Some(_) => {
                tracing::info!("Session {} closed", id);
                Ok(())
            }
            None => Err(SessionError::UnknownSession(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Run `f` with exclusive access to one session
    pub fn with_session<T, F>(&self, id: SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let session = self.get(id)?;
        let mut guard = session.lock().map_err(|_| {
            SessionError::Precondition(format!("session {id} was poisoned by an earlier panic"))
        })?;
        f(&mut *guard)
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Mutex<Session>>>> {
        // The table is only ever inserted into or removed from
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
