#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use kubeterm::logstream::LogEvent;
use kubeterm::portal::{Placement, Surface, SurfaceFactory};
use kubeterm::session::{ExecTarget, SessionId, SessionState};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn target(pod: &str) -> ExecTarget {
    ExecTarget::new("prod", "default", pod, "app")
}

/// Surface that records everything the portal does to it.
pub struct RecordingSurface {
    pub written: Mutex<Vec<u8>>,
    pub placements: Mutex<Vec<Placement>>,
    pub size: Mutex<Option<(u16, u16)>>,
    pub disposed: Mutex<bool>,
}

impl RecordingSurface {
    pub fn new(size: Option<(u16, u16)>) -> Self {
        Self {
            written: Mutex::new(Vec::new()),
            placements: Mutex::new(Vec::new()),
            size: Mutex::new(size),
            disposed: Mutex::new(false),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock()).into_owned()
    }

    pub fn last_placement(&self) -> Option<Placement> {
        self.placements.lock().last().cloned()
    }

    /// Poll until the rendered text contains `needle`.
    pub async fn wait_for_text(&self, needle: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while !self.text().contains(needle) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "surface never showed {:?}; has {:?}",
                needle,
                self.text()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Surface for RecordingSurface {
    fn write(&self, data: &[u8]) {
        self.written.lock().extend_from_slice(data);
    }
    fn reparent(&self, placement: &Placement) {
        self.placements.lock().push(placement.clone());
    }
    fn fit(&self) -> Option<(u16, u16)> {
        *self.size.lock()
    }
    fn focus(&self) {}
    fn clear(&self) {
        self.written.lock().clear();
    }
    fn dispose(&self) {
        *self.disposed.lock() = true;
    }
}

/// Creates [`RecordingSurface`]s with a fixed geometry and keeps them around
/// for inspection.
pub struct RecordingFactory {
    size: Option<(u16, u16)>,
    pub created: Mutex<Vec<(SessionId, Arc<RecordingSurface>)>>,
}

impl RecordingFactory {
    pub fn new(size: Option<(u16, u16)>) -> Arc<Self> {
        Arc::new(Self {
            size,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn surface_for(&self, id: &SessionId) -> Option<Arc<RecordingSurface>> {
        self.created
            .lock()
            .iter()
            .find(|(sid, _)| sid == id)
            .map(|(_, s)| s.clone())
    }

    pub fn count(&self) -> usize {
        self.created.lock().len()
    }
}

impl SurfaceFactory for RecordingFactory {
    fn create(&self, session: &SessionId) -> Arc<dyn Surface> {
        let surface = Arc::new(RecordingSurface::new(self.size));
        self.created.lock().push((session.clone(), surface.clone()));
        surface
    }
}

/// Wait until the watched state satisfies `pred`.
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<SessionState>, pred: F) -> SessionState
where
    F: Fn(&SessionState) -> bool,
{
    let state = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("session state channel closed")
        .clone();
    state
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<LogEvent>) -> LogEvent {
    tokio::time::timeout(Duration::from_secs(120), rx.recv())
        .await
        .expect("timed out waiting for log event")
        .expect("log event channel closed")
}

/// Collect events up to and including the terminal `Closed`.
pub async fn events_until_closed(rx: &mut mpsc::UnboundedReceiver<LogEvent>) -> Vec<LogEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, LogEvent::Closed(_));
        events.push(event);
        if done {
            return events;
        }
    }
}
