//! Crate-wide error taxonomy.
//!
//! Module errors convert into [`MuxError`] so UI code can branch on one enum
//! when rendering connection status.

use crate::logstream::CloseReason;
use crate::portal::PortalError;
use crate::protocol::ProtocolError;
use crate::registry::RegistryError;
use crate::session::{SessionError, SessionId};
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Failed to establish or keep a connection.
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),
    /// Input or resize attempted without a live connection.
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("undecodable frame: {0}")]
    ProtocolDecode(#[from] ProtocolError),
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    /// Caller misuse not covered above (bad id, bad size, missing container).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl MuxError {
    /// Machine-readable code for status displays.
    pub fn code(&self) -> &'static str {
        match self {
            MuxError::Connection(_) => "connection_error",
            MuxError::NotConnected(_) => "not_connected",
            MuxError::UnknownSession(_) => "unknown_session",
            MuxError::SessionClosed(_) => "session_closed",
            MuxError::ProtocolDecode(_) => "protocol_decode_error",
            MuxError::ReconnectExhausted { .. } => "reconnect_exhausted",
            MuxError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// True if retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MuxError::Connection(_) | MuxError::NotConnected(_))
    }
}

impl From<SessionError> for MuxError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Closed(id) => MuxError::SessionClosed(id),
            SessionError::NotConnected(id) => MuxError::NotConnected(id),
            e @ SessionError::InvalidDimensions { .. } => MuxError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<PortalError> for MuxError {
    fn from(e: PortalError) -> Self {
        match e {
            PortalError::UnknownSession(id) => MuxError::UnknownSession(id),
            PortalError::Session(e) => e.into(),
            e @ PortalError::ContainerGone(_) => MuxError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<RegistryError> for MuxError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownSession(id) => MuxError::UnknownSession(id),
            RegistryError::Portal(e) => e.into(),
            e @ (RegistryError::MaxSessionsReached | RegistryError::InvalidId(_)) => {
                MuxError::InvalidRequest(e.to_string())
            }
        }
    }
}

impl CloseReason {
    /// The error a UI should show for this close, if any.
    pub fn as_error(&self) -> Option<MuxError> {
        match self {
            CloseReason::ReconnectExhausted { attempts } => Some(MuxError::ReconnectExhausted {
                attempts: *attempts,
            }),
            CloseReason::Unsubscribed | CloseReason::Completed => None,
        }
    }
}
