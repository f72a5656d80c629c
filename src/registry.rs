use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::portal::{ContainerId, Placement, Portal, PortalError, SurfaceFactory};
use crate::session::{ExecTarget, SessionId, TerminalSession};
use crate::transport::Connector;

/// Maximum length of a session id.
const MAX_ID_LEN: usize = 256;

/// Validate a session id. Ids must be 1-256 chars with no control characters.
pub fn validate_session_id(id: &SessionId) -> Result<(), String> {
    let s = id.as_str();
    if s.is_empty() {
        return Err("session id must not be empty".into());
    }
    let len = s.chars().count();
    if len > MAX_ID_LEN {
        return Err(format!("session id too long ({len} chars, max {MAX_ID_LEN})"));
    }
    if s.chars().any(char::is_control) {
        return Err("session id contains control characters".into());
    }
    Ok(())
}

/// Registry lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId },
    Destroyed { id: SessionId },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error(transparent)]
    Portal(#[from] PortalError),
}

/// Settings the registry hands to every session it builds.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Base URL of the exec endpoint, e.g. `ws://dashboard:8080`.
    pub endpoint: String,
    pub scrollback_bytes: usize,
    pub max_sessions: Option<usize>,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:8080".to_string(),
            scrollback_bytes: 1024 * 1024,
            max_sessions: Some(RegistryOptions::DEFAULT_MAX_SESSIONS),
        }
    }
}

impl RegistryOptions {
    /// Each session holds a socket plus up to `scrollback_bytes` of output;
    /// 64 is far more tabs than anyone keeps open.
    pub const DEFAULT_MAX_SESSIONS: usize = 64;
}

/// Process-wide table of terminal sessions.
///
/// The only authority for creating and destroying sessions. Nothing is ever
/// evicted implicitly: a hidden session stays alive until [`Self::destroy`]
/// or [`Self::shutdown`]. Clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, TerminalSession>>>,
    portal: Portal,
    connector: Arc<dyn Connector>,
    options: RegistryOptions,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        surfaces: Arc<dyn SurfaceFactory>,
        options: RegistryOptions,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            portal: Portal::new(surfaces),
            connector,
            options,
            events_tx,
        }
    }

    /// Return the live session for `id`, or register a new idle one.
    ///
    /// `target` is only used when creating; an existing session keeps the
    /// target it was created with.
    pub fn get_or_create(
        &self,
        id: SessionId,
        target: ExecTarget,
    ) -> Result<TerminalSession, RegistryError> {
        if let Some(session) = self.sessions.read().get(&id) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write();
        // Re-check under the write lock; another caller may have won.
        if let Some(session) = sessions.get(&id) {
            return Ok(session.clone());
        }
        validate_session_id(&id).map_err(RegistryError::InvalidId)?;
        if let Some(max) = self.options.max_sessions {
            if sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        let session = TerminalSession::new(
            id.clone(),
            target,
            &self.options.endpoint,
            self.connector.clone(),
            self.options.scrollback_bytes,
        );
        sessions.insert(id.clone(), session.clone());
        drop(sessions);

        tracing::info!(session = %id, target = %session.target(), "session created");
        let _ = self.events_tx.send(SessionEvent::Created { id });
        Ok(session)
    }

    /// Look up a session without creating it.
    pub fn get(&self, id: &SessionId) -> Option<TerminalSession> {
        self.sessions.read().get(id).cloned()
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Close a session, release its buffer and surface, and forget it.
    ///
    /// Unknown ids are ignored.
    pub fn destroy(&self, id: &SessionId) {
        let removed = self.sessions.write().remove(id);
        let Some(session) = removed else {
            return;
        };
        session.close();
        self.portal.release(id);
        tracing::info!(session = %id, "session destroyed");
        let _ = self.events_tx.send(SessionEvent::Destroyed { id: id.clone() });
    }

    /// Destroy every session. The registry stays usable afterwards.
    pub fn shutdown(&self) {
        let drained: Vec<(SessionId, TerminalSession)> = self.sessions.write().drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        self.portal.release_all();
        for (id, _) in drained {
            let _ = self.events_tx.send(SessionEvent::Destroyed { id });
        }
    }

    /// Show a session's surface in `container`.
    pub fn attach(&self, id: &SessionId, container: &ContainerId) -> Result<(), RegistryError> {
        let session = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownSession(id.clone()))?;
        self.portal.attach(&session, container)?;
        Ok(())
    }

    /// Hide a session's surface. The connection stays up.
    pub fn detach(&self, id: &SessionId) -> Result<(), RegistryError> {
        if !self.has(id) {
            return Err(RegistryError::UnknownSession(id.clone()));
        }
        self.portal.detach(id);
        Ok(())
    }

    /// Hide a session's surface only if `container` still shows it.
    pub fn detach_from(&self, id: &SessionId, container: &ContainerId) -> Result<bool, RegistryError> {
        if !self.has(id) {
            return Err(RegistryError::UnknownSession(id.clone()));
        }
        Ok(self.portal.detach_from(id, container))
    }

    /// Refit a visible session after its container changed size.
    pub fn refit(&self, id: &SessionId) -> Result<(), RegistryError> {
        let session = self
            .get(id)
            .ok_or_else(|| RegistryError::UnknownSession(id.clone()))?;
        self.portal.refit(&session);
        Ok(())
    }

    /// Focus a visible session's surface.
    pub fn focus(&self, id: &SessionId) -> Result<(), RegistryError> {
        if !self.has(id) {
            return Err(RegistryError::UnknownSession(id.clone()));
        }
        self.portal.focus(id);
        Ok(())
    }

    pub fn placement(&self, id: &SessionId) -> Option<Placement> {
        self.portal.placement(id)
    }

    pub fn portal(&self) -> &Portal {
        &self.portal
    }

    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}
