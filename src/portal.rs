//! Moves live rendering surfaces between containers.
//!
//! Each session gets at most one [`Surface`], created on first attach and
//! kept until the session is destroyed. Attaching and detaching only change
//! which container holds it ([`Placement`]); the surface itself, its
//! renderer state, and the session's connection are untouched.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::session::{SessionError, SessionId, TerminalSession};

/// Identifies a place in the UI a surface can be shown in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContainerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a session's surface currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The shared off-screen pool.
    Hidden,
    Visible(ContainerId),
}

/// A terminal renderer, provided by the UI layer.
///
/// Methods are called with the portal lock held and must not call back into
/// the portal.
pub trait Surface: Send + Sync {
    /// Render output bytes.
    fn write(&self, data: &[u8]);
    /// Move the surface's element under a new parent.
    fn reparent(&self, placement: &Placement);
    /// Recompute geometry for the current parent; `(cols, rows)` if known.
    fn fit(&self) -> Option<(u16, u16)>;
    fn focus(&self);
    fn clear(&self);
    /// Final teardown; the surface is never used again.
    fn dispose(&self);
}

/// Creates surfaces for sessions on first attach.
pub trait SurfaceFactory: Send + Sync {
    fn create(&self, session: &SessionId) -> Arc<dyn Surface>;
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("container {0} is not mounted")]
    ContainerGone(ContainerId),
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct Slot {
    surface: Arc<dyn Surface>,
    placement: Placement,
    pump: JoinHandle<()>,
}

struct PortalInner {
    containers: HashSet<ContainerId>,
    slots: HashMap<SessionId, Slot>,
}

/// Attachment records for every session that has a surface.
#[derive(Clone)]
pub struct Portal {
    inner: Arc<Mutex<PortalInner>>,
    factory: Arc<dyn SurfaceFactory>,
}

impl Portal {
    pub fn new(factory: Arc<dyn SurfaceFactory>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PortalInner {
                containers: HashSet::new(),
                slots: HashMap::new(),
            })),
            factory,
        }
    }

    /// Declare a container as present in the UI.
    pub fn mount_container(&self, container: ContainerId) {
        self.inner.lock().containers.insert(container);
    }

    /// Remove a container. Surfaces shown in it fall back to the hidden pool.
    pub fn unmount_container(&self, container: &ContainerId) {
        let mut inner = self.inner.lock();
        inner.containers.remove(container);
        let here = Placement::Visible(container.clone());
        for (id, slot) in inner.slots.iter_mut() {
            if slot.placement == here {
                slot.placement = Placement::Hidden;
                slot.surface.reparent(&Placement::Hidden);
                tracing::debug!(session = %id, %container, "container unmounted, surface hidden");
            }
        }
    }

    /// Show `session` in `container`.
    ///
    /// Creates the surface on first use (replaying scrollback into it), moves
    /// it, refits it, and opens the session's connection if it never had one.
    /// Attaching to the container it is already in does nothing.
    pub fn attach(
        &self,
        session: &TerminalSession,
        container: &ContainerId,
    ) -> Result<(), PortalError> {
        if session.state().is_closed() {
            return Err(SessionError::Closed(session.id().clone()).into());
        }
        let target = Placement::Visible(container.clone());

        let surface = {
            let mut inner = self.inner.lock();
            if !inner.containers.contains(container) {
                return Err(PortalError::ContainerGone(container.clone()));
            }
            // Checked again under the lock; destroy closes before it releases.
            if session.state().is_closed() {
                return Err(SessionError::Closed(session.id().clone()).into());
            }
            if !inner.slots.contains_key(session.id()) {
                let slot = self.create_slot(session);
                inner.slots.insert(session.id().clone(), slot);
            }
            let Some(slot) = inner.slots.get_mut(session.id()) else {
                return Err(PortalError::UnknownSession(session.id().clone()));
            };
            if slot.placement == target {
                return Ok(());
            }
            let previous = std::mem::replace(&mut slot.placement, target.clone());
            tracing::debug!(session = %session.id(), from = ?previous, to = %container, "surface moved");
            slot.surface.reparent(&target);
            slot.surface.clone()
        };

        session.connect()?;
        if let Some((cols, rows)) = surface.fit() {
            forward_geometry(session, cols, rows);
        }
        Ok(())
    }

    /// Return the surface to the hidden pool. Connection and buffer are kept.
    pub fn detach(&self, id: &SessionId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(id) {
            if slot.placement != Placement::Hidden {
                slot.placement = Placement::Hidden;
                slot.surface.reparent(&Placement::Hidden);
                tracing::debug!(session = %id, "surface hidden");
            }
        }
    }

    /// Detach only if `container` still owns the surface.
    ///
    /// A view that lost an attach race calls this on teardown without
    /// yanking the surface from the newer owner. Returns whether it moved.
    pub fn detach_from(&self, id: &SessionId, container: &ContainerId) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(id) {
            Some(slot) if slot.placement == Placement::Visible(container.clone()) => {
                slot.placement = Placement::Hidden;
                slot.surface.reparent(&Placement::Hidden);
                true
            }
            _ => false,
        }
    }

    /// Recompute geometry of a visible surface, e.g. after a window resize.
    pub fn refit(&self, session: &TerminalSession) {
        let surface = {
            let inner = self.inner.lock();
            match inner.slots.get(session.id()) {
                Some(slot) if slot.placement != Placement::Hidden => slot.surface.clone(),
                _ => return,
            }
        };
        if let Some((cols, rows)) = surface.fit() {
            forward_geometry(session, cols, rows);
        }
    }

    /// Give input focus to a visible surface. Hidden surfaces are skipped.
    pub fn focus(&self, id: &SessionId) {
        let inner = self.inner.lock();
        if let Some(slot) = inner.slots.get(id) {
            if slot.placement != Placement::Hidden {
                slot.surface.focus();
            }
        }
    }

    /// Dispose the surface and forget the session. Used on destroy.
    pub fn release(&self, id: &SessionId) {
        let slot = self.inner.lock().slots.remove(id);
        if let Some(slot) = slot {
            slot.pump.abort();
            slot.surface.dispose();
            tracing::debug!(session = %id, "surface disposed");
        }
    }

    /// Dispose every surface.
    pub fn release_all(&self) {
        let slots: Vec<(SessionId, Slot)> = self.inner.lock().slots.drain().collect();
        for (_, slot) in slots {
            slot.pump.abort();
            slot.surface.dispose();
        }
    }

    pub fn placement(&self, id: &SessionId) -> Option<Placement> {
        self.inner.lock().slots.get(id).map(|slot| slot.placement.clone())
    }

    pub fn surface(&self, id: &SessionId) -> Option<Arc<dyn Surface>> {
        self.inner.lock().slots.get(id).map(|slot| slot.surface.clone())
    }

    /// Build a hidden slot whose surface mirrors the session's output.
    fn create_slot(&self, session: &TerminalSession) -> Slot {
        let surface = self.factory.create(session.id());
        let (snapshot, rx) = session.subscribe_with_snapshot();
        if !snapshot.is_empty() {
            surface.write(&snapshot);
        }
        surface.reparent(&Placement::Hidden);
        let pump = tokio::spawn(pump_output(session.clone(), surface.clone(), rx));
        tracing::debug!(session = %session.id(), "surface created");
        Slot {
            surface,
            placement: Placement::Hidden,
            pump,
        }
    }
}

fn forward_geometry(session: &TerminalSession, cols: u16, rows: u16) {
    if let Err(e) = session.set_dimensions(cols, rows) {
        tracing::debug!(session = %session.id(), error = %e, "ignoring surface geometry");
    }
}

async fn pump_output(
    session: TerminalSession,
    surface: Arc<dyn Surface>,
    mut rx: tokio::sync::broadcast::Receiver<Bytes>,
) {
    loop {
        match rx.recv().await {
            Ok(chunk) => surface.write(&chunk),
            Err(RecvError::Lagged(skipped)) => {
                // Redraw from scrollback rather than show a hole.
                tracing::warn!(session = %session.id(), skipped, "surface lagged, redrawing");
                let (snapshot, fresh) = session.subscribe_with_snapshot();
                surface.clear();
                surface.write(&snapshot);
                rx = fresh;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ExecTarget, SessionState};
    use crate::transport::{MemoryConnector, Outbound, WireFrame};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSurface {
        written: Mutex<Vec<u8>>,
        parents: Mutex<Vec<Placement>>,
        size: Mutex<Option<(u16, u16)>>,
        disposed: Mutex<bool>,
        focused: Mutex<usize>,
    }

    impl Surface for RecordingSurface {
        fn write(&self, data: &[u8]) {
            self.written.lock().extend_from_slice(data);
        }
        fn reparent(&self, placement: &Placement) {
            self.parents.lock().push(placement.clone());
        }
        fn fit(&self) -> Option<(u16, u16)> {
            *self.size.lock()
        }
        fn focus(&self) {
            *self.focused.lock() += 1;
        }
        fn clear(&self) {
            self.written.lock().clear();
        }
        fn dispose(&self) {
            *self.disposed.lock() = true;
        }
    }

    #[derive(Default)]
    struct Factory {
        created: Mutex<Vec<Arc<RecordingSurface>>>,
        size: Option<(u16, u16)>,
    }

    impl SurfaceFactory for Factory {
        fn create(&self, _session: &SessionId) -> Arc<dyn Surface> {
            let surface = Arc::new(RecordingSurface::default());
            *surface.size.lock() = self.size;
            self.created.lock().push(surface.clone());
            surface
        }
    }

    fn setup(size: Option<(u16, u16)>) -> (Portal, Arc<Factory>, MemoryConnector, TerminalSession) {
        let factory = Arc::new(Factory {
            size,
            ..Default::default()
        });
        let portal = Portal::new(factory.clone());
        portal.mount_container(ContainerId::from("pane-a"));
        portal.mount_container(ContainerId::from("pane-b"));
        let connector = MemoryConnector::new();
        let target = ExecTarget::new("dev", "default", "web-0", "app");
        let session = TerminalSession::new(
            SessionId::for_target(&target),
            target,
            "ws://dash",
            Arc::new(connector.clone()),
            4096,
        );
        (portal, factory, connector, session)
    }

    #[tokio::test]
    async fn surface_identity_survives_attach_detach_cycles() {
        let (portal, factory, _connector, session) = setup(None);
        let a = ContainerId::from("pane-a");
        let b = ContainerId::from("pane-b");

        portal.attach(&session, &a).unwrap();
        let first = portal.surface(session.id()).unwrap();
        portal.detach(session.id());
        portal.attach(&session, &b).unwrap();
        portal.detach(session.id());
        portal.attach(&session, &a).unwrap();
        let last = portal.surface(session.id()).unwrap();

        assert!(Arc::ptr_eq(&first, &last));
        assert_eq!(factory.created.lock().len(), 1);
        assert_eq!(
            portal.placement(session.id()),
            Some(Placement::Visible(a.clone()))
        );
    }

    #[tokio::test]
    async fn attach_same_container_is_noop() {
        let (portal, factory, _connector, session) = setup(None);
        let a = ContainerId::from("pane-a");
        portal.attach(&session, &a).unwrap();
        portal.attach(&session, &a).unwrap();
        let surface = factory.created.lock()[0].clone();
        // Hidden on creation, then pane-a once.
        assert_eq!(
            *surface.parents.lock(),
            vec![Placement::Hidden, Placement::Visible(a)]
        );
    }

    #[tokio::test]
    async fn attach_starts_connection_and_forwards_geometry() {
        let (portal, _factory, connector, session) = setup(Some((120, 40)));
        portal.attach(&session, &ContainerId::from("pane-a")).unwrap();
        assert_ne!(session.state(), SessionState::Idle);

        let mut peer = connector.next_peer().await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(Outbound::Frame(WireFrame::Text("resize:120,40".into())))
        );
    }

    #[tokio::test]
    async fn detach_keeps_connection() {
        let (portal, _factory, connector, session) = setup(None);
        portal.attach(&session, &ContainerId::from("pane-a")).unwrap();
        let _peer = connector.next_peer().await.unwrap();
        let mut state = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(SessionState::is_connected))
            .await
            .unwrap()
            .unwrap();

        portal.detach(session.id());
        assert_eq!(portal.placement(session.id()), Some(Placement::Hidden));
        assert!(session.state().is_connected());
        session.write("still here\n").unwrap();
    }

    #[tokio::test]
    async fn surface_mirrors_scrollback_and_live_output() {
        let (portal, factory, connector, session) = setup(None);
        let mut output = session.subscribe_output();
        session.connect().unwrap();
        let peer = connector.next_peer().await.unwrap();
        peer.send_text("earlier ");
        output.recv().await.unwrap();

        portal.attach(&session, &ContainerId::from("pane-a")).unwrap();
        let surface = factory.created.lock()[0].clone();
        assert_eq!(&*surface.written.lock(), b"earlier ");

        peer.send_text("later");
        output.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while surface.written.lock().as_slice() != b"earlier later" {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("surface should receive live output");
    }

    #[tokio::test]
    async fn attach_to_unmounted_container_fails() {
        let (portal, _factory, connector, session) = setup(None);
        let err = portal
            .attach(&session, &ContainerId::from("gone"))
            .unwrap_err();
        assert!(matches!(err, PortalError::ContainerGone(_)));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn unmount_hides_surface() {
        let (portal, _factory, _connector, session) = setup(None);
        let a = ContainerId::from("pane-a");
        portal.attach(&session, &a).unwrap();
        portal.unmount_container(&a);
        assert_eq!(portal.placement(session.id()), Some(Placement::Hidden));
        assert!(matches!(
            portal.attach(&session, &a),
            Err(PortalError::ContainerGone(_))
        ));
    }

    #[tokio::test]
    async fn last_attach_wins_and_stale_detach_is_ignored() {
        let (portal, _factory, _connector, session) = setup(None);
        let a = ContainerId::from("pane-a");
        let b = ContainerId::from("pane-b");
        portal.attach(&session, &a).unwrap();
        portal.attach(&session, &b).unwrap();

        assert!(!portal.detach_from(session.id(), &a));
        assert_eq!(portal.placement(session.id()), Some(Placement::Visible(b.clone())));
        assert!(portal.detach_from(session.id(), &b));
        assert_eq!(portal.placement(session.id()), Some(Placement::Hidden));
    }

    #[tokio::test]
    async fn attach_of_closed_session_creates_no_surface() {
        let (portal, factory, connector, session) = setup(None);
        session.close();
        assert!(matches!(
            portal.attach(&session, &ContainerId::from("pane-a")),
            Err(PortalError::Session(SessionError::Closed(_)))
        ));
        assert!(portal.surface(session.id()).is_none());
        assert!(factory.created.lock().is_empty());
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn focus_only_reaches_visible_surface() {
        let (portal, factory, _connector, session) = setup(None);
        portal.focus(session.id());
        let a = ContainerId::from("pane-a");
        portal.attach(&session, &a).unwrap();
        portal.focus(session.id());
        assert_eq!(*factory.created.lock()[0].focused.lock(), 1);

        portal.detach(session.id());
        portal.focus(session.id());
        assert_eq!(*factory.created.lock()[0].focused.lock(), 1);
    }

    #[tokio::test]
    async fn release_disposes_surface() {
        let (portal, factory, _connector, session) = setup(None);
        portal.attach(&session, &ContainerId::from("pane-a")).unwrap();
        portal.release(session.id());
        assert!(portal.surface(session.id()).is_none());
        assert!(*factory.created.lock()[0].disposed.lock());
    }

    #[tokio::test]
    async fn refit_only_applies_to_visible_surface() {
        let (portal, factory, _connector, session) = setup(Some((80, 24)));
        let a = ContainerId::from("pane-a");
        portal.attach(&session, &a).unwrap();
        assert_eq!(session.dimensions(), Some((80, 24)));

        *factory.created.lock()[0].size.lock() = Some((132, 50));
        portal.refit(&session);
        assert_eq!(session.dimensions(), Some((132, 50)));

        portal.detach(session.id());
        *factory.created.lock()[0].size.lock() = Some((10, 10));
        portal.refit(&session);
        assert_eq!(session.dimensions(), Some((132, 50)));
    }
}
