//! In-process connector.
//!
//! Every successful `connect` hands the far end of the connection to the
//! caller as a [`MemoryPeer`], which plays the remote endpoint: it sees every
//! outbound command and can push frames or close the connection. Useful for
//! embedding the multiplexer without a network and for exercising reconnect
//! logic deterministically.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::{CloseInfo, Connection, Connector, Inbound, Outbound, TransportError, WireFrame};

enum Step {
    Refuse(String),
    Hold(oneshot::Receiver<()>),
}

struct MemoryInner {
    script: VecDeque<Step>,
    refuse_all: Option<String>,
    attempts: Vec<(String, Instant)>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
}

/// Connector whose remote ends live in the same process.
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<Mutex<MemoryInner>>,
    peers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryPeer>>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Mutex::new(MemoryInner {
                script: VecDeque::new(),
                refuse_all: None,
                attempts: Vec::new(),
                peers_tx,
            })),
            peers_rx: Arc::new(tokio::sync::Mutex::new(peers_rx)),
        }
    }

    /// Refuse the next connection attempt.
    pub fn refuse_next(&self, reason: impl Into<String>) {
        self.inner.lock().script.push_back(Step::Refuse(reason.into()));
    }

    /// Refuse every attempt not covered by an explicit script step.
    pub fn refuse_all(&self, reason: impl Into<String>) {
        self.inner.lock().refuse_all = Some(reason.into());
    }

    /// Accept attempts again once scripted steps run out.
    pub fn accept_all(&self) {
        self.inner.lock().refuse_all = None;
    }

    /// Hold the next handshake open until the returned sender fires (or is
    /// dropped).
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().script.push_back(Step::Hold(rx));
        tx
    }

    /// Number of `connect` calls so far, accepted or not.
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts.len()
    }

    /// When each `connect` call happened, in order.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.inner.lock().attempts.iter().map(|(_, at)| *at).collect()
    }

    /// URLs passed to `connect`, in order.
    pub fn attempt_urls(&self) -> Vec<String> {
        self.inner.lock().attempts.iter().map(|(url, _)| url.clone()).collect()
    }

    /// Wait for the next accepted connection's remote end.
    pub async fn next_peer(&self) -> Option<MemoryPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let (step, peers_tx) = {
            let mut inner = self.inner.lock();
            inner.attempts.push((url.to_string(), Instant::now()));
            let step = match inner.script.pop_front() {
                Some(step) => Some(step),
                None => inner.refuse_all.clone().map(Step::Refuse),
            };
            (step, inner.peers_tx.clone())
        };
        let url = url.to_string();

        Box::pin(async move {
            match step {
                Some(Step::Refuse(reason)) => return Err(TransportError::Refused(reason)),
                Some(Step::Hold(gate)) => {
                    let _ = gate.await;
                }
                None => {}
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let peer = MemoryPeer {
                url,
                from_client: outbound_rx,
                to_client: Some(inbound_tx),
            };
            peers_tx
                .send(peer)
                .map_err(|_| TransportError::Refused("connector dropped".into()))?;
            Ok(Connection {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// The remote end of an in-memory connection.
pub struct MemoryPeer {
    pub url: String,
    from_client: mpsc::UnboundedReceiver<Outbound>,
    to_client: Option<mpsc::UnboundedSender<Inbound>>,
}

impl MemoryPeer {
    /// Send a text frame to the client. Returns false once the client is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Inbound::Frame(WireFrame::Text(text.into())))
    }

    /// Send a binary frame to the client.
    pub fn send_binary(&self, data: impl Into<Bytes>) -> bool {
        self.send(Inbound::Frame(WireFrame::Binary(data.into())))
    }

    /// Close with a status code, as a server would.
    pub fn close(&mut self, code: u16, reason: impl Into<String>) {
        self.send(Inbound::Closed(CloseInfo {
            code: Some(code),
            reason: reason.into(),
        }));
        self.to_client = None;
    }

    /// Drop the connection without a close handshake.
    pub fn drop_connection(&mut self) {
        self.send(Inbound::Closed(CloseInfo::abnormal("connection reset")));
        self.to_client = None;
    }

    /// Next command from the client; `None` once the client dropped its end.
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Next command from the client, if one is already queued.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.from_client.try_recv().ok()
    }

    fn send(&self, event: Inbound) -> bool {
        match self.to_client {
            Some(ref tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}
