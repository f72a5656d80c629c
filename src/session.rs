use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol;
use crate::scrollback::Scrollback;
use crate::transport::{Connector, Inbound, Outbound};

/// Capacity of the live output channel feeding rendering surfaces.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// The remote container a session execs into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecTarget {
    /// Cluster (kubeconfig context) name.
    pub context: String,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

impl ExecTarget {
    pub fn new(
        context: impl Into<String>,
        namespace: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            context: context.into(),
            namespace: namespace.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ExecTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.context, self.namespace, self.pod, self.container
        )
    }
}

/// Stable identity of one remote shell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity derived from the exec target, so reopening the same
    /// container finds the live session.
    pub fn for_target(target: &ExecTarget) -> Self {
        Self(target.to_string())
    }

    /// Fresh identity for a second shell on the same target.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Connection state of a terminal session.
///
/// `Idle -> Connecting -> Connected -> Error`; `Error -> Connecting` only via
/// [`TerminalSession::retry`]. `Closed` is terminal and only reached through
/// the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Error(String),
    Closed,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Connected => f.write_str("connected"),
            SessionState::Error(reason) => write!(f, "error: {reason}"),
            SessionState::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(SessionId),
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidDimensions { cols: u16, rows: u16 },
}

/// Mutable state shared between the handle and the connection task.
struct Live {
    scrollback: Scrollback,
    /// Present only while `Connected`.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// Last known `(cols, rows)`, sent right after each handshake.
    dims: Option<(u16, u16)>,
    /// Bumped on every connection attempt so a stale task cannot touch state.
    generation: u64,
}

struct SessionInner {
    id: SessionId,
    target: ExecTarget,
    url: String,
    connector: Arc<dyn Connector>,
    state_tx: watch::Sender<SessionState>,
    output_tx: broadcast::Sender<Bytes>,
    live: Mutex<Live>,
    cancelled: CancellationToken,
}

/// One remote shell: a single exec connection plus its scrollback.
///
/// Cloning yields another handle to the same session. The session lives
/// independently of any view; only [`crate::registry::SessionRegistry::destroy`]
/// ends it. Input is never queued: writes outside `Connected` fail with
/// [`SessionError::NotConnected`].
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.inner.id)
            .field("target", &self.inner.target)
            .field("state", &*self.inner.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Build an idle session. No connection is opened until [`Self::connect`].
    pub fn new(
        id: SessionId,
        target: ExecTarget,
        endpoint: &str,
        connector: Arc<dyn Connector>,
        scrollback_bytes: usize,
    ) -> Self {
        let url = protocol::exec_url(endpoint, &target);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SessionInner {
                id,
                target,
                url,
                connector,
                state_tx,
                output_tx,
                live: Mutex::new(Live {
                    scrollback: Scrollback::new(scrollback_bytes),
                    outbound: None,
                    dims: None,
                    generation: 0,
                }),
                cancelled: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn target(&self) -> &ExecTarget {
        &self.inner.target
    }

    /// Exec endpoint URL this session connects to.
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> SessionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Watch state transitions (for connection status indicators).
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Live output chunks from now on.
    pub fn subscribe_output(&self) -> broadcast::Receiver<Bytes> {
        self.inner.output_tx.subscribe()
    }

    /// Scrollback snapshot plus a receiver for everything after it, taken
    /// atomically so no chunk is missed or repeated.
    pub fn subscribe_with_snapshot(&self) -> (Bytes, broadcast::Receiver<Bytes>) {
        let live = self.inner.live.lock();
        (live.scrollback.snapshot(), self.inner.output_tx.subscribe())
    }

    pub fn scrollback(&self) -> Bytes {
        self.inner.live.lock().scrollback.snapshot()
    }

    pub fn scrollback_len(&self) -> usize {
        self.inner.live.lock().scrollback.len()
    }

    /// Last known `(cols, rows)`.
    pub fn dimensions(&self) -> Option<(u16, u16)> {
        self.inner.live.lock().dims
    }

    /// True if both handles refer to the same session.
    pub fn ptr_eq(&self, other: &TerminalSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open the connection if the session has never had one.
    ///
    /// No-op while connecting, connected, or in `Error` (use [`Self::retry`]).
    pub fn connect(&self) -> Result<(), SessionError> {
        self.start_if(|state| matches!(state, SessionState::Idle))
    }

    /// Reconnect after a failure. Scrollback is kept.
    pub fn retry(&self) -> Result<(), SessionError> {
        self.start_if(|state| matches!(state, SessionState::Idle | SessionState::Error(_)))
    }

    /// Send keystrokes exactly as given.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), SessionError> {
        let frame = protocol::encode_input(data.into());
        let live = self.inner.live.lock();
        self.send_locked(&live, Outbound::Frame(frame))
    }

    /// Resize the remote terminal. Requires a live connection.
    ///
    /// The size is remembered either way and goes out right after the next
    /// handshake.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        check_dimensions(cols, rows)?;
        let mut live = self.inner.live.lock();
        if self.state().is_closed() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        live.dims = Some((cols, rows));
        self.send_locked(&live, Outbound::Frame(protocol::encode_resize(cols, rows)))
    }

    /// Record new surface geometry. Sent now if connected, otherwise right
    /// after the next handshake.
    pub fn set_dimensions(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        check_dimensions(cols, rows)?;
        let mut live = self.inner.live.lock();
        if self.state().is_closed() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        if live.dims == Some((cols, rows)) {
            return Ok(());
        }
        live.dims = Some((cols, rows));
        if let Some(ref tx) = live.outbound {
            let _ = tx.send(Outbound::Frame(protocol::encode_resize(cols, rows)));
        }
        Ok(())
    }

    /// Tear down the connection and release the scrollback. Terminal.
    pub(crate) fn close(&self) {
        let mut live = self.inner.live.lock();
        if self.state().is_closed() {
            return;
        }
        self.inner.cancelled.cancel();
        if let Some(tx) = live.outbound.take() {
            let _ = tx.send(Outbound::normal_close("session closed"));
        }
        live.scrollback.clear();
        live.generation += 1;
        self.inner.state_tx.send_replace(SessionState::Closed);
        tracing::debug!(session = %self.inner.id, "session closed");
    }

    fn send_locked(&self, live: &Live, cmd: Outbound) -> Result<(), SessionError> {
        if self.state().is_closed() {
            return Err(SessionError::Closed(self.inner.id.clone()));
        }
        let tx = live
            .outbound
            .as_ref()
            .ok_or_else(|| SessionError::NotConnected(self.inner.id.clone()))?;
        tx.send(cmd)
            .map_err(|_| SessionError::NotConnected(self.inner.id.clone()))
    }

    /// Start a connection attempt if the current state allows it. State is
    /// read and replaced under the `live` lock, like every other transition.
    fn start_if(&self, startable: impl Fn(&SessionState) -> bool) -> Result<(), SessionError> {
        let generation = {
            let mut live = self.inner.live.lock();
            let state = self.state();
            if state.is_closed() {
                return Err(SessionError::Closed(self.inner.id.clone()));
            }
            if !startable(&state) {
                return Ok(());
            }
            live.generation += 1;
            live.outbound = None;
            self.inner.state_tx.send_replace(SessionState::Connecting);
            live.generation
        };
        tracing::info!(session = %self.inner.id, url = %self.inner.url, "connecting");
        let session = self.clone();
        tokio::spawn(async move { session.run_connection(generation).await });
        Ok(())
    }

    /// Connection task: the single writer of scrollback and state for one
    /// connection attempt.
    async fn run_connection(self, generation: u64) {
        let cancelled = self.inner.cancelled.clone();
        let connect = self.inner.connector.connect(&self.inner.url);
        let result = tokio::select! {
            biased;
            _ = cancelled.cancelled() => return,
            result = connect => result,
        };
        let mut conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(session = %self.inner.id, error = %e, "exec connection failed");
                self.fail(generation, e.to_string());
                return;
            }
        };

        {
            let mut live = self.inner.live.lock();
            if live.generation != generation || self.state().is_closed() {
                let _ = conn.outbound.send(Outbound::normal_close("superseded"));
                return;
            }
            if let Some((cols, rows)) = live.dims {
                let _ = conn
                    .outbound
                    .send(Outbound::Frame(protocol::encode_resize(cols, rows)));
            }
            live.outbound = Some(conn.outbound.clone());
            self.inner.state_tx.send_replace(SessionState::Connected);
        }
        tracing::info!(session = %self.inner.id, "session connected");

        loop {
            let event = tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    let _ = conn.outbound.send(Outbound::normal_close("session closed"));
                    return;
                }
                event = conn.inbound.recv() => event,
            };
            match event {
                Some(Inbound::Frame(frame)) => self.append(generation, protocol::decode_output(frame)),
                Some(Inbound::Closed(info)) => {
                    tracing::warn!(session = %self.inner.id, %info, "exec connection ended");
                    self.fail(generation, info.to_string());
                    return;
                }
                None => {
                    self.fail(generation, "connection lost".to_string());
                    return;
                }
            }
        }
    }

    fn append(&self, generation: u64, chunk: Bytes) {
        let mut live = self.inner.live.lock();
        if live.generation != generation {
            return;
        }
        live.scrollback.push(chunk.clone());
        // No receivers just means nothing is displaying the session.
        let _ = self.inner.output_tx.send(chunk);
    }

    fn fail(&self, generation: u64, reason: String) {
        let mut live = self.inner.live.lock();
        if live.generation != generation || self.state().is_closed() {
            return;
        }
        live.outbound = None;
        self.inner.state_tx.send_replace(SessionState::Error(reason));
    }
}

fn check_dimensions(cols: u16, rows: u16) -> Result<(), SessionError> {
    if cols == 0 || rows == 0 {
        return Err(SessionError::InvalidDimensions { cols, rows });
    }
    Ok(())
}
