//! Filtered, reconnecting log tails.
//!
//! A [`LogSubscription`] owns one task that keeps a connection to the log
//! endpoint open. When the connection drops abnormally it retries with
//! linear backoff (`attempt × base_delay`) up to `max_attempts` times, then
//! gives up with [`CloseReason::ReconnectExhausted`]. Missed lines are not
//! replayed; a reconnect simply continues the tail.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::{self, LogMessage};
use crate::transport::{Connection, Connector, Inbound, Outbound};

/// Which log lines to stream. An empty set does not filter that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub clusters: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
    pub pods: BTreeSet<String>,
    pub containers: BTreeSet<String>,
    pub levels: BTreeSet<String>,
}

fn to_set<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl LogFilter {
    pub fn clusters<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.clusters = to_set(values);
        self
    }

    pub fn namespaces<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.namespaces = to_set(values);
        self
    }

    pub fn pods<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.pods = to_set(values);
        self
    }

    pub fn containers<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.containers = to_set(values);
        self
    }

    pub fn levels<I: IntoIterator<Item = S>, S: Into<String>>(mut self, values: I) -> Self {
        self.levels = to_set(values);
        self
    }
}

/// Bounded linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `unsubscribe` was called or the subscription was dropped.
    Unsubscribed,
    /// The server closed the stream with the normal close code.
    Completed,
    ReconnectExhausted { attempts: u32 },
}

/// What a subscriber sees. `Closed` is always the last event, sent once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Connected,
    Line(String),
    Info(String),
    Error(String),
    Reconnecting { attempt: u32, delay: Duration },
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    /// Sleeping before the next reconnect attempt.
    Waiting,
    Closed,
}

struct Shared {
    attempts: AtomicU32,
    state: Mutex<LinkState>,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }
}

/// Opens log subscriptions against one endpoint.
#[derive(Clone)]
pub struct LogStreamClient {
    connector: Arc<dyn Connector>,
    endpoint: String,
    policy: ReconnectPolicy,
}

impl LogStreamClient {
    pub fn new(connector: Arc<dyn Connector>, endpoint: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            endpoint: endpoint.into(),
            policy,
        }
    }

    /// Start streaming logs matching `filter`.
    pub fn subscribe(&self, filter: LogFilter) -> (LogSubscription, mpsc::UnboundedReceiver<LogEvent>) {
        let url = protocol::log_stream_url(&self.endpoint, &filter);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            attempts: AtomicU32::new(0),
            state: Mutex::new(LinkState::Connecting),
        });
        let task = tokio::spawn(run_subscription(
            self.connector.clone(),
            url.clone(),
            self.policy,
            cancel.clone(),
            shared.clone(),
            events_tx,
        ));
        tracing::info!(%url, "log subscription started");
        let subscription = LogSubscription {
            url,
            cancel,
            shared,
            task: Some(task),
        };
        (subscription, events_rx)
    }
}

/// Handle to a running log tail. Dropping it unsubscribes.
pub struct LogSubscription {
    url: String,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl LogSubscription {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Reconnect attempts since the last received message.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    /// Close with the normal code and cancel any pending reconnect.
    pub fn unsubscribe(&self) {
        self.cancel.cancel();
    }

    /// Wait for the subscription task to finish. Consumes the handle.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Outcome {
    Unsubscribed,
    Completed,
    Dropped(String),
}

async fn run_subscription(
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<LogEvent>,
) {
    let reason = loop {
        shared.set_state(LinkState::Connecting);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Unsubscribed,
            result = connector.connect(&url) => result,
        };

        let outcome = match result {
            Ok(conn) => {
                shared.set_state(LinkState::Open);
                tracing::debug!(%url, "log stream connected");
                if events.send(LogEvent::Connected).is_err() {
                    let _ = conn.outbound.send(Outbound::normal_close("subscriber gone"));
                    break CloseReason::Unsubscribed;
                }
                pump(conn, &cancel, &shared, &events).await
            }
            Err(e) => Outcome::Dropped(e.to_string()),
        };

        match outcome {
            Outcome::Unsubscribed => break CloseReason::Unsubscribed,
            Outcome::Completed => break CloseReason::Completed,
            Outcome::Dropped(why) => {
                let attempt = shared.attempts.fetch_add(1, Ordering::AcqRel) + 1;
                if attempt > policy.max_attempts {
                    tracing::warn!(%url, attempts = policy.max_attempts, "log stream reconnect attempts exhausted");
                    break CloseReason::ReconnectExhausted {
                        attempts: policy.max_attempts,
                    };
                }
                let delay = policy.delay_for(attempt);
                tracing::warn!(%url, attempt, ?delay, reason = %why, "log stream dropped, reconnecting");
                shared.set_state(LinkState::Waiting);
                if events.send(LogEvent::Reconnecting { attempt, delay }).is_err() {
                    break CloseReason::Unsubscribed;
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break CloseReason::Unsubscribed,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    shared.set_state(LinkState::Closed);
    tracing::info!(%url, ?reason, "log subscription closed");
    let _ = events.send(LogEvent::Closed(reason));
}

async fn pump(
    mut conn: Connection,
    cancel: &CancellationToken,
    shared: &Shared,
    events: &mpsc::UnboundedSender<LogEvent>,
) -> Outcome {
    loop {
        let inbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = conn.outbound.send(Outbound::normal_close("unsubscribed"));
                return Outcome::Unsubscribed;
            }
            inbound = conn.inbound.recv() => inbound,
        };
        let frame = match inbound {
            Some(Inbound::Frame(frame)) => frame,
            Some(Inbound::Closed(info)) if info.is_normal() => return Outcome::Completed,
            Some(Inbound::Closed(info)) => return Outcome::Dropped(info.to_string()),
            None => return Outcome::Dropped("connection lost".to_string()),
        };

        shared.attempts.store(0, Ordering::Release);
        let event = match protocol::classify(&frame) {
            LogMessage::Log(line) => LogEvent::Line(line),
            LogMessage::Info(text) => LogEvent::Info(text),
            LogMessage::Error(text) => LogEvent::Error(text),
            LogMessage::Ignored(kind) => {
                tracing::debug!(kind = %kind, "ignoring unknown log envelope");
                continue;
            }
        };
        if events.send(event).is_err() {
            let _ = conn.outbound.send(Outbound::normal_close("subscriber gone"));
            return Outcome::Unsubscribed;
        }
    }
}
