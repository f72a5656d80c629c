//! Connection plumbing shared by terminal sessions and log subscriptions.
//!
//! A [`Connector`] opens one physical connection per call and hands back a
//! [`Connection`]: an outbound channel of [`Outbound`] commands and an inbound
//! channel of [`Inbound`] events. Each connection is driven by a single pump
//! task, so events arrive in exactly the order the transport delivered them.
//!
//! Two connectors ship with the crate: [`WsConnector`] for real WebSocket
//! endpoints and [`MemoryConnector`] for in-process peers.

pub mod memory;
pub mod ws;

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

pub use memory::{MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

/// Close code sent when a connection is shut down on purpose.
pub const NORMAL_CLOSE: u16 = 1000;

/// A single WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Raw payload bytes of the frame.
    pub fn into_bytes(self) -> Bytes {
        match self {
            WireFrame::Text(text) => Bytes::from(text),
            WireFrame::Binary(data) => data,
        }
    }
}

/// Commands accepted by a connection's pump task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(WireFrame),
    Close { code: u16, reason: String },
}

impl Outbound {
    /// Intentional close with [`NORMAL_CLOSE`].
    pub fn normal_close(reason: impl Into<String>) -> Self {
        Outbound::Close {
            code: NORMAL_CLOSE,
            reason: reason.into(),
        }
    }
}

/// Events produced by a connection's pump task.
///
/// Every connection yields exactly one [`Inbound::Closed`], always last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(WireFrame),
    Closed(CloseInfo),
}

/// Why a connection ended.
///
/// `code` is `None` when the transport failed without a close handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseInfo {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: Some(NORMAL_CLOSE),
            reason: reason.into(),
        }
    }

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: reason.into(),
        }
    }

    /// True only for the intentional close code.
    pub fn is_normal(&self) -> bool {
        self.code == Some(NORMAL_CLOSE)
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.reason.is_empty()) {
            (Some(code), true) => write!(f, "closed with code {code}"),
            (Some(code), false) => write!(f, "closed with code {code}: {}", self.reason),
            (None, true) => write!(f, "connection lost"),
            (None, false) => write!(f, "connection lost: {}", self.reason),
        }
    }
}

/// One live connection, as seen by its owner.
///
/// Dropping `outbound` asks the pump to close the connection.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("auth token is not a valid header value")]
    InvalidToken,
    #[error("handshake with {0} timed out")]
    HandshakeTimeout(String),
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("connection refused: {0}")]
    Refused(String),
}

/// Opens connections to a URL.
///
/// The returned future resolves once the handshake has completed.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

/// Percent-encode a value for use in URL paths and query strings.
pub fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(b as char)
            }
            _ => encoded.push_str(&format!("%{:02X}", b)),
        }
    }
    encoded
}
