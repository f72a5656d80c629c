//! Registry, portal and terminal sessions wired together over an in-process
//! backend: the lifecycle a tabbed UI drives.

mod common;

use std::sync::Arc;

use common::{target, wait_for_state, RecordingFactory, WAIT};
use kubeterm::portal::{ContainerId, Placement};
use kubeterm::protocol::exec_url;
use kubeterm::registry::{RegistryError, RegistryOptions, SessionEvent, SessionRegistry};
use kubeterm::session::{SessionId, SessionState};
use kubeterm::transport::{MemoryConnector, MemoryPeer, Outbound, WireFrame, NORMAL_CLOSE};
use kubeterm::MuxError;

struct Harness {
    connector: MemoryConnector,
    surfaces: Arc<RecordingFactory>,
    registry: SessionRegistry,
}

fn harness() -> Harness {
    let connector = MemoryConnector::new();
    let surfaces = RecordingFactory::new(Some((120, 40)));
    let registry = SessionRegistry::new(
        Arc::new(connector.clone()),
        surfaces.clone(),
        RegistryOptions {
            endpoint: "ws://dash".into(),
            scrollback_bytes: 64 * 1024,
            max_sessions: Some(4),
        },
    );
    registry.portal().mount_container(ContainerId::from("pane-a"));
    registry.portal().mount_container(ContainerId::from("pane-b"));
    Harness {
        connector,
        surfaces,
        registry,
    }
}

async fn next_outbound(peer: &mut MemoryPeer) -> Outbound {
    tokio::time::timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for outbound command")
        .expect("client dropped the connection")
}

#[tokio::test]
async fn attach_opens_shell_and_renders_output() {
    let h = harness();
    let id = SessionId::from("tab-1");
    let session = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let mut state = session.subscribe_state();
    assert_eq!(session.state(), SessionState::Idle);

    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    assert_eq!(peer.url, exec_url("ws://dash", &target("web-0")));
    assert_eq!(peer.url, "ws://dash/api/clusters/prod/namespaces/default/pods/web-0/exec?container=app");

    // Geometry measured at attach goes out first.
    assert_eq!(
        next_outbound(&mut peer).await,
        Outbound::Frame(WireFrame::Text("resize:120,40".into()))
    );
    wait_for_state(&mut state, SessionState::is_connected).await;

    session.write("ls -la\r").unwrap();
    assert_eq!(
        next_outbound(&mut peer).await,
        Outbound::Frame(WireFrame::Text("ls -la\r".into()))
    );

    assert!(peer.send_text("total 0\r\n$ "));
    let surface = h.surfaces.surface_for(&id).unwrap();
    surface.wait_for_text("total 0\r\n$ ").await;
    assert_eq!(
        surface.last_placement(),
        Some(Placement::Visible(ContainerId::from("pane-a")))
    );
}

#[tokio::test]
async fn moving_between_panes_keeps_connection_and_surface() {
    let h = harness();
    let id = SessionId::from("tab-1");
    let session = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let mut state = session.subscribe_state();

    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    wait_for_state(&mut state, SessionState::is_connected).await;
    assert!(peer.send_text("first\r\n"));
    let surface = h.surfaces.surface_for(&id).unwrap();
    surface.wait_for_text("first").await;

    h.registry.detach(&id).unwrap();
    assert_eq!(h.registry.placement(&id), Some(Placement::Hidden));
    assert!(session.state().is_connected());

    // Output keeps flowing into the buffer while hidden.
    assert!(peer.send_text("while hidden\r\n"));
    surface.wait_for_text("while hidden").await;

    h.registry.attach(&id, &ContainerId::from("pane-b")).unwrap();
    assert_eq!(
        h.registry.placement(&id),
        Some(Placement::Visible(ContainerId::from("pane-b")))
    );
    assert_eq!(h.surfaces.count(), 1);
    assert_eq!(h.connector.attempts(), 1);

    // Same geometry, so no second resize; only the first one was sent.
    assert!(matches!(peer.try_recv(), Some(Outbound::Frame(_))));
    assert!(peer.try_recv().is_none());

    let again = h.registry.get_or_create(id.clone(), target("other")).unwrap();
    assert!(again.ptr_eq(&session));
    assert_eq!(again.target(), &target("web-0"));
}

#[tokio::test]
async fn stale_view_teardown_does_not_steal_surface() {
    let h = harness();
    let id = SessionId::from("tab-1");
    h.registry.get_or_create(id.clone(), target("web-0")).unwrap();

    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    h.registry.attach(&id, &ContainerId::from("pane-b")).unwrap();
    // pane-a unmounts after pane-b took over.
    assert!(!h.registry.detach_from(&id, &ContainerId::from("pane-a")).unwrap());
    assert_eq!(
        h.registry.placement(&id),
        Some(Placement::Visible(ContainerId::from("pane-b")))
    );
    assert!(h.registry.detach_from(&id, &ContainerId::from("pane-b")).unwrap());
    assert_eq!(h.registry.placement(&id), Some(Placement::Hidden));
}

#[tokio::test]
async fn reattach_keeps_rendered_history() {
    let h = harness();
    let id = SessionId::from("tab-1");
    let session = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let mut state = session.subscribe_state();
    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    let peer = h.connector.next_peer().await.unwrap();
    wait_for_state(&mut state, SessionState::is_connected).await;

    assert!(peer.send_text("one\r\n"));
    assert!(peer.send_text("two\r\n"));
    let surface = h.surfaces.surface_for(&id).unwrap();
    surface.wait_for_text("two").await;
    assert_eq!(session.scrollback(), bytes::Bytes::from_static(b"one\r\ntwo\r\n"));

    h.registry.detach(&id).unwrap();
    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    assert_eq!(surface.text(), "one\r\ntwo\r\n");
}

#[tokio::test]
async fn dropped_connection_shows_error_and_retry_reconnects() {
    let h = harness();
    let id = SessionId::from("tab-1");
    let session = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let mut state = session.subscribe_state();
    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    wait_for_state(&mut state, SessionState::is_connected).await;
    assert!(peer.send_text("before\r\n"));

    peer.drop_connection();
    let failed = wait_for_state(&mut state, |s| matches!(s, SessionState::Error(_))).await;
    assert!(matches!(failed, SessionState::Error(_)));
    let err: MuxError = session.write("x").unwrap_err().into();
    assert_eq!(err.code(), "not_connected");
    // Scrollback survives the failure.
    assert_eq!(session.scrollback(), bytes::Bytes::from_static(b"before\r\n"));

    // No automatic reconnect for shells.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.connector.attempts(), 1);

    session.retry().unwrap();
    let _peer = h.connector.next_peer().await.unwrap();
    wait_for_state(&mut state, SessionState::is_connected).await;
    assert_eq!(h.connector.attempts(), 2);
}

#[tokio::test]
async fn destroy_closes_normally_and_forgets_session() {
    let h = harness();
    let id = SessionId::from("tab-1");
    let mut registry_events = h.registry.subscribe_events();
    let session = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let mut state = session.subscribe_state();
    h.registry.attach(&id, &ContainerId::from("pane-a")).unwrap();
    let mut peer = h.connector.next_peer().await.unwrap();
    wait_for_state(&mut state, SessionState::is_connected).await;
    let _resize = next_outbound(&mut peer).await;

    h.registry.destroy(&id);
    match next_outbound(&mut peer).await {
        Outbound::Close { code, .. } => assert_eq!(code, NORMAL_CLOSE),
        other => panic!("expected close, got {:?}", other),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!h.registry.has(&id));
    assert!(*h.surfaces.surface_for(&id).unwrap().disposed.lock());
    assert!(h.registry.attach(&id, &ContainerId::from("pane-a")).is_err());

    // Destroying twice is harmless.
    h.registry.destroy(&id);

    assert_eq!(
        registry_events.recv().await.unwrap(),
        SessionEvent::Created { id: id.clone() }
    );
    assert_eq!(
        registry_events.recv().await.unwrap(),
        SessionEvent::Destroyed { id: id.clone() }
    );
    assert!(registry_events.try_recv().is_err());

    // A new session under the same id starts from scratch.
    let fresh = h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    assert!(!fresh.ptr_eq(&session));
    assert_eq!(fresh.state(), SessionState::Idle);
    assert!(fresh.scrollback().is_empty());
}

#[tokio::test]
async fn session_limit_and_listing() {
    let h = harness();
    for n in 0..4 {
        h.registry
            .get_or_create(SessionId::new(format!("tab-{n}")), target("web-0"))
            .unwrap();
    }
    assert!(matches!(
        h.registry.get_or_create(SessionId::from("tab-9"), target("web-0")),
        Err(RegistryError::MaxSessionsReached)
    ));
    assert_eq!(
        h.registry.list(),
        (0..4).map(|n| SessionId::new(format!("tab-{n}"))).collect::<Vec<_>>()
    );

    h.registry.shutdown();
    assert!(h.registry.is_empty());
    // Never attached, so never connected.
    assert_eq!(h.connector.attempts(), 0);
}

#[tokio::test]
async fn attach_to_unmounted_container_fails() {
    let h = harness();
    let id = SessionId::from("tab-1");
    h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
    let err = h
        .registry
        .attach(&id, &ContainerId::from("nowhere"))
        .unwrap_err();
    assert_eq!(MuxError::from(err).code(), "invalid_request");
    assert!(matches!(
        h.registry.attach(&SessionId::from("ghost"), &ContainerId::from("pane-a")),
        Err(RegistryError::UnknownSession(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn attach_racing_destroy_leaves_no_live_surface() {
    let h = harness();
    let pane = ContainerId::from("pane-a");
    for n in 0..200 {
        let id = SessionId::new(format!("race-{n}"));
        h.registry.get_or_create(id.clone(), target("web-0")).unwrap();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let attacher = {
            let (registry, id, pane, barrier) =
                (h.registry.clone(), id.clone(), pane.clone(), barrier.clone());
            tokio::spawn(async move {
                barrier.wait().await;
                let _ = registry.attach(&id, &pane);
            })
        };
        let destroyer = {
            let (registry, id, barrier) = (h.registry.clone(), id.clone(), barrier.clone());
            tokio::spawn(async move {
                barrier.wait().await;
                registry.destroy(&id);
            })
        };
        attacher.await.unwrap();
        destroyer.await.unwrap();

        assert!(!h.registry.has(&id));
        assert!(h.registry.portal().surface(&id).is_none());
        if let Some(surface) = h.surfaces.surface_for(&id) {
            assert!(*surface.disposed.lock(), "surface for {id} outlived its session");
        }
    }
}
