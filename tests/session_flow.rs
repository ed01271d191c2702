//! End-to-end sessions over loopback sockets.

use blobsync_client::{Session, SessionError, SessionPhase, SessionRole, SyncClient};
use blobsync_core::{Endpoint, Position, PresentationHandle, SessionConfig, StateSnapshot};
use blobsync_net::{
    client_handshake, decode_frame, encode_snapshot, ClientTransport, HandshakeError,
    StateChannel,
};
use blobsync_server::RelayServer;
use blobsync_testkit::{
    init_tracing, settle, wait_until, JsonlSink, RecordingPresenter, ScriptedLocalState,
};
use std::path::PathBuf;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn snap(x: f32, y: f32, size: f32) -> StateSnapshot {
    StateSnapshot::new(Position::new(x, y, 0.0), size)
}

async fn host() -> RelayServer {
    init_tracing();
    RelayServer::bind(&SessionConfig::loopback())
        .await
        .expect("host binds")
}

/// Write a presenter's calls to a JSONL file under the temp dir.
fn dump_trace(name: &str, presenter: &RecordingPresenter) -> PathBuf {
    let path = std::env::temp_dir()
        .join("blobsync-traces")
        .join(format!("{name}-{}.jsonl", std::process::id()));
    let mut sink = JsonlSink::create(&path).expect("trace sink");
    for event in presenter.events() {
        sink.write(event).expect("trace record");
    }
    path
}

async fn wait_for_peers(server: &RelayServer, count: usize) {
    let peers = server.peers().clone();
    assert!(
        wait_until(WAIT, || peers.len() >= count).await,
        "expected {count} peers, saw {}",
        peers.len()
    );
}

#[tokio::test]
async fn snapshot_reaches_registry_and_broadcast() {
    let mut server = host().await;
    let mut presenter = RecordingPresenter::default();
    let host_state = StateSnapshot::default();

    let mut transport = ClientTransport::connect(server.control_addr()).await.unwrap();
    let outcome = client_handshake(&mut transport.control, transport.state.local_endpoint().port())
        .await
        .expect("handshake");
    let client = transport.state.local_endpoint();
    assert_eq!(outcome.local, client);
    assert_eq!(outcome.host_state, server.state_endpoint());
    wait_for_peers(&server, 1).await;

    let sent = snap(1.0, 2.0, 1.0);
    transport
        .state
        .send(outcome.host_state, &encode_snapshot(&sent).unwrap())
        .await
        .unwrap();
    settle().await;

    let report = server.tick(&host_state, &mut presenter).await;
    assert_eq!(report.received, 1);
    assert_eq!(report.discarded, 0);
    assert_eq!(report.sent, 1);

    assert_eq!(server.registry().len(), 1);
    assert_eq!(server.registry().get(client).unwrap().latest, sent);
    assert_eq!(presenter.last_update(client), Some(sent));

    settle().await;
    let drained = transport.state.drain(16);
    assert_eq!(drained.datagrams.len(), 1);
    assert_eq!(drained.datagrams[0].from, server.state_endpoint());
    let frame = decode_frame(&drained.datagrams[0].payload).unwrap();
    assert!(frame
        .entities
        .iter()
        .any(|e| e.endpoint == client && e.snapshot() == sent));

    server.shutdown().await;
}

#[tokio::test]
async fn datagram_without_handshake_creates_entity_lazily() {
    let mut server = host().await;
    let mut presenter = RecordingPresenter::default();
    let stranger = StateChannel::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    stranger
        .send(server.state_endpoint(), &encode_snapshot(&snap(4.0, 4.0, 2.0)).unwrap())
        .await
        .unwrap();
    stranger
        .send(server.state_endpoint(), b"{\"Position\":")
        .await
        .unwrap();
    settle().await;

    let report = server.tick(&StateSnapshot::default(), &mut presenter).await;
    assert_eq!(report.received, 2);
    assert_eq!(report.discarded, 1);
    assert_eq!(report.created, 1);
    assert_eq!(report.sent, 0);
    assert!(server.registry().contains(stranger.local_endpoint()));

    server.shutdown().await;
}

#[tokio::test]
async fn every_client_sees_every_other_client() {
    let mut server = host().await;
    let config = SessionConfig::loopback();
    let mut host_presenter = RecordingPresenter::default();

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(
            SyncClient::connect(server.control_addr(), &config)
                .await
                .expect("client joins"),
        );
    }
    wait_for_peers(&server, 3).await;

    let locals: Vec<_> = (0..3)
        .map(|i| ScriptedLocalState::fixed(snap(i as f32, -(i as f32), 1.0 + i as f32)))
        .collect();
    let mut presenters: Vec<_> = (0..3).map(|_| RecordingPresenter::default()).collect();
    let endpoints: Vec<Endpoint> = clients.iter().map(|c| c.local_endpoint()).collect();

    let mut converged = false;
    for _ in 0..50 {
        for ((client, local), presenter) in clients.iter_mut().zip(&locals).zip(&mut presenters) {
            client.tick(local, presenter).await;
        }
        settle().await;
        server.tick(&StateSnapshot::default(), &mut host_presenter).await;
        settle().await;
        for ((client, local), presenter) in clients.iter_mut().zip(&locals).zip(&mut presenters) {
            client.tick(local, presenter).await;
        }

        converged = (0..3).all(|me| {
            (0..3).filter(|&other| other != me).all(|other| {
                clients[me]
                    .registry()
                    .get(endpoints[other])
                    .map(|e| e.latest)
                    == Some(locals[other].peek())
            })
        });
        if converged {
            break;
        }
    }
    assert!(converged, "clients never converged");

    for (me, client) in clients.iter().enumerate() {
        assert_eq!(client.registry().len(), 2);
        assert!(!client.registry().contains(endpoints[me]));
    }
    for (me, presenter) in presenters.iter().enumerate() {
        assert!(presenter.update_count() > 0);
        let path = dump_trace(&format!("convergence-client-{me}"), presenter);
        let written = std::fs::read_to_string(&path).expect("trace readable");
        assert_eq!(written.lines().count(), presenter.events().len());
        let _ = std::fs::remove_file(&path);
    }
    assert_eq!(server.registry().len(), 3);

    for client in clients {
        client.shutdown().await;
    }
    server.shutdown().await;
}

#[tokio::test]
async fn spawn_and_despawn_follow_the_control_channel() {
    let mut server = host().await;
    let config = SessionConfig::loopback();
    let mut host_presenter = RecordingPresenter::default();

    let mut first = SyncClient::connect(server.control_addr(), &config).await.unwrap();
    wait_for_peers(&server, 1).await;
    let second = SyncClient::connect(server.control_addr(), &config).await.unwrap();
    let second_endpoint = second.local_endpoint();
    wait_for_peers(&server, 2).await;

    // Known through the spawn notice before any datagram flowed.
    let mirror = first.registry().clone();
    assert!(wait_until(WAIT, || mirror.contains(second_endpoint)).await);
    assert!(wait_until(WAIT, || second.registry().contains(first.local_endpoint())).await);

    second.shutdown().await;
    assert!(wait_until(WAIT, || !mirror.contains(second_endpoint)).await);
    let host_registry = server.registry().clone();
    assert!(wait_until(WAIT, || !host_registry.contains(second_endpoint)).await);
    assert_eq!(server.peers().len(), 1);

    let mut presenter = RecordingPresenter::default();
    let report = first.tick(&StateSnapshot::default(), &mut presenter).await;
    assert_eq!(report.evicted, 1);
    assert_eq!(presenter.removed(), vec![second_endpoint]);

    let report = server.tick(&StateSnapshot::default(), &mut host_presenter).await;
    assert_eq!(report.evicted, 1);
    assert_eq!(host_presenter.removed(), vec![second_endpoint]);

    first.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn departed_client_is_not_revived_by_its_last_datagram() {
    init_tracing();
    let config = SessionConfig {
        idle_timeout_ticks: None,
        ..SessionConfig::loopback()
    };
    let mut server = RelayServer::bind(&config).await.unwrap();
    let mut host_presenter = RecordingPresenter::default();

    let mut client = SyncClient::connect(server.control_addr(), &config).await.unwrap();
    let endpoint = client.local_endpoint();
    wait_for_peers(&server, 1).await;

    // The snapshot is still queued at the host when Leave is applied.
    client
        .tick(&snap(1.0, 1.0, 1.0), &mut RecordingPresenter::default())
        .await;
    client.shutdown().await;
    let host_registry = server.registry().clone();
    assert!(wait_until(WAIT, || host_registry.has_departed(endpoint)).await);
    settle().await;

    let mut discarded = 0;
    for _ in 0..3 {
        discarded += server
            .tick(&StateSnapshot::default(), &mut host_presenter)
            .await
            .discarded;
    }
    assert_eq!(discarded, 1);
    assert!(!server.registry().contains(endpoint));
    assert_eq!(host_presenter.removed(), vec![endpoint]);
    assert!(host_presenter.visible().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn despawned_peer_is_not_revived_by_a_queued_frame() {
    init_tracing();
    let config = SessionConfig {
        idle_timeout_ticks: None,
        ..SessionConfig::loopback()
    };
    let mut server = RelayServer::bind(&config).await.unwrap();
    let mut host_presenter = RecordingPresenter::default();
    let host_state = snap(-1.0, -1.0, 2.0);
    server.tick(&host_state, &mut host_presenter).await;

    let mut first = SyncClient::connect(server.control_addr(), &config).await.unwrap();
    wait_for_peers(&server, 1).await;
    let mut second = SyncClient::connect(server.control_addr(), &config).await.unwrap();
    let second_endpoint = second.local_endpoint();
    wait_for_peers(&server, 2).await;
    assert_eq!(first.bootstrap(), Some(host_state));
    assert_eq!(second.bootstrap(), Some(host_state));

    let first_state = snap(1.0, 0.0, 1.0);
    let mut first_presenter = RecordingPresenter::default();
    first.tick(&first_state, &mut first_presenter).await;
    second
        .tick(&snap(2.0, 0.0, 1.0), &mut RecordingPresenter::default())
        .await;
    settle().await;
    // Leaves a frame naming `second` queued at `first`.
    server.tick(&host_state, &mut host_presenter).await;

    second.shutdown().await;
    let mirror = first.registry().clone();
    assert!(wait_until(WAIT, || mirror.has_departed(second_endpoint)).await);
    settle().await;

    let report = first.tick(&first_state, &mut first_presenter).await;
    assert!(report.received >= 1);
    assert!(!first.registry().contains(second_endpoint));
    assert_eq!(first_presenter.removed(), vec![second_endpoint]);
    assert!(!first_presenter.visible().contains(&second_endpoint));

    for _ in 0..3 {
        settle().await;
        server.tick(&host_state, &mut host_presenter).await;
        settle().await;
        first.tick(&first_state, &mut first_presenter).await;
    }
    assert!(!server.registry().contains(second_endpoint));
    assert!(!first.registry().contains(second_endpoint));
    assert!(!first_presenter.visible().contains(&second_endpoint));

    first.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn second_handshake_for_connected_endpoint_is_rejected() {
    let server = host().await;

    let mut owner = ClientTransport::connect(server.control_addr()).await.unwrap();
    let state_port = owner.state.local_endpoint().port();
    let outcome = client_handshake(&mut owner.control, state_port)
        .await
        .expect("handshake");
    wait_for_peers(&server, 1).await;
    let registry = server.registry().clone();
    assert!(wait_until(WAIT, || registry.contains(outcome.local)).await);

    // Same IP, same claimed state port.
    let mut duplicate = ClientTransport::connect(server.control_addr()).await.unwrap();
    let err = client_handshake(&mut duplicate.control, state_port)
        .await
        .expect_err("endpoint is taken");
    assert!(matches!(
        err.downcast_ref::<HandshakeError>(),
        Some(HandshakeError::Rejected(_))
    ));
    drop(duplicate);
    settle().await;

    assert_eq!(server.peers().endpoints(), vec![outcome.local]);
    assert!(registry.contains(outcome.local));
    assert!(!registry.has_departed(outcome.local));

    server.shutdown().await;
}

#[tokio::test]
async fn lost_and_duplicated_datagrams_converge_on_latest() {
    let mut server = host().await;
    let mut presenter = RecordingPresenter::default();
    let sender = StateChannel::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let to = server.state_endpoint();

    // Ticks 1 and 3 "lost", tick 2 duplicated.
    for x in [2.0, 2.0] {
        sender.send(to, &encode_snapshot(&snap(x, 0.0, 1.0)).unwrap()).await.unwrap();
    }
    settle().await;
    server.tick(&StateSnapshot::default(), &mut presenter).await;
    assert_eq!(server.registry().len(), 1);
    assert_eq!(
        server.registry().get(sender.local_endpoint()).unwrap().latest,
        snap(2.0, 0.0, 1.0)
    );

    sender.send(to, &encode_snapshot(&snap(4.0, 0.0, 1.0)).unwrap()).await.unwrap();
    settle().await;
    server.tick(&StateSnapshot::default(), &mut presenter).await;
    assert_eq!(server.registry().len(), 1);
    assert_eq!(
        server.registry().get(sender.local_endpoint()).unwrap().latest,
        snap(4.0, 0.0, 1.0)
    );

    server.shutdown().await;
}

#[tokio::test]
async fn stale_handle_drops_entity_until_next_datagram() {
    let mut server = host().await;
    let mut presenter = RecordingPresenter::default();
    let sender = StateChannel::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let to = server.state_endpoint();
    let payload = encode_snapshot(&snap(1.0, 1.0, 1.0)).unwrap();

    sender.send(to, &payload).await.unwrap();
    settle().await;
    server.tick(&StateSnapshot::default(), &mut presenter).await;
    let first: PresentationHandle = server.registry().get(sender.local_endpoint()).unwrap().handle;

    presenter.mark_stale(first);
    server.tick(&StateSnapshot::default(), &mut presenter).await;
    assert!(!server.registry().contains(sender.local_endpoint()));
    assert!(presenter.removed().is_empty());

    sender.send(to, &payload).await.unwrap();
    settle().await;
    let report = server.tick(&StateSnapshot::default(), &mut presenter).await;
    assert_eq!(report.created, 1);
    let second = server.registry().get(sender.local_endpoint()).unwrap().handle;
    assert_ne!(first, second);

    server.shutdown().await;
}

#[tokio::test]
async fn idle_entities_are_evicted() {
    init_tracing();
    let config = SessionConfig {
        idle_timeout_ticks: Some(2),
        ..SessionConfig::loopback()
    };
    let mut server = RelayServer::bind(&config).await.unwrap();
    let mut presenter = RecordingPresenter::default();
    let sender = StateChannel::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    sender
        .send(server.state_endpoint(), &encode_snapshot(&snap(0.0, 0.0, 1.0)).unwrap())
        .await
        .unwrap();
    settle().await;

    let mut evicted = 0;
    for _ in 0..5 {
        evicted += server.tick(&StateSnapshot::default(), &mut presenter).await.evicted;
    }
    assert_eq!(evicted, 1);
    assert!(server.registry().is_empty());
    assert_eq!(presenter.removed(), vec![sender.local_endpoint()]);

    server.shutdown().await;
}

#[tokio::test]
async fn sessions_relay_host_blob_when_enabled() {
    init_tracing();
    let config = SessionConfig {
        include_self_in_broadcast: true,
        ..SessionConfig::loopback()
    };

    let mut host = Session::start(SessionRole::Host, &config).await.unwrap();
    let control = host.control_addr().expect("host has a control address");
    let host_endpoint = host.local_endpoint().unwrap();

    let mut joiner = Session::start(
        SessionRole::Join {
            host: control.to_string(),
        },
        &config,
    )
    .await
    .unwrap();
    assert_eq!(joiner.phase(), SessionPhase::Syncing);
    assert!(!joiner.is_host());

    let host_blob = ScriptedLocalState::fixed(snap(-3.0, 5.0, 2.5));
    let joiner_blob = ScriptedLocalState::fixed(snap(7.0, 1.0, 1.0));
    let mut host_presenter = RecordingPresenter::default();
    let mut joiner_presenter = RecordingPresenter::default();

    // Not ready yet: ticks do nothing.
    let idle = host.tick(&host_blob, &mut host_presenter).await.unwrap();
    assert_eq!(idle, Default::default());
    assert_eq!(host_blob.samples(), 0);

    host.mark_presentation_ready();
    joiner.mark_presentation_ready();
    assert_eq!(host.phase(), SessionPhase::Relaying);

    let joiner_endpoint = joiner.local_endpoint().unwrap();
    let mut converged = false;
    for _ in 0..50 {
        joiner.tick(&joiner_blob, &mut joiner_presenter).await.unwrap();
        settle().await;
        host.tick(&host_blob, &mut host_presenter).await.unwrap();
        settle().await;
        joiner.tick(&joiner_blob, &mut joiner_presenter).await.unwrap();

        converged = joiner_presenter.last_update(host_endpoint) == Some(host_blob.peek())
            && host_presenter.last_update(joiner_endpoint) == Some(joiner_blob.peek());
        if converged {
            break;
        }
    }
    assert!(converged, "host and joiner never saw each other");

    joiner.shutdown().await;
    assert_eq!(joiner.phase(), SessionPhase::Closed);
    assert!(matches!(
        joiner.tick(&joiner_blob, &mut joiner_presenter).await,
        Err(SessionError::WrongPhase(SessionPhase::Closed))
    ));
    host.shutdown().await;
}

#[tokio::test]
async fn pending_join_can_be_cancelled() {
    init_tracing();
    // Accepts but never answers the handshake.
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let _holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let config = SessionConfig {
        handshake_timeout_ms: None,
        ..SessionConfig::loopback()
    };
    let cancel = tokio_util::sync::CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = Session::start_with_cancel(
        SessionRole::Join {
            host: addr.to_string(),
        },
        &config,
        cancel,
    )
    .await;
    assert!(matches!(result, Err(SessionError::Cancelled)));
}

#[tokio::test]
async fn silent_host_times_out() {
    init_tracing();
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();
    let _holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let config = SessionConfig {
        handshake_timeout_ms: Some(100),
        ..SessionConfig::loopback()
    };
    let result = Session::start(
        SessionRole::Join {
            host: addr.to_string(),
        },
        &config,
    )
    .await;
    assert!(matches!(result, Err(SessionError::Timeout(_))));
}
