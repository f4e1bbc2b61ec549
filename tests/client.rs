//! Connection lifecycle tests against the scripted in-process peer

mod common;

use common::{PeerFrame, TestPeer};
use fe2o3_amqp_types::definitions::AmqpError;
use fe2o3_amqp_types::performatives::Performative;
use fe2o3_amqp_types::sasl::SaslCode;
use siderite::{
    ConnectionEvent, ConnectionOptions, Container, Error, ReconnectOptions, SaslProfile,
};

#[tokio::test]
async fn open_and_close_handshake() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("lifecycle-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        assert_eq!(connection.remote_container_id(), "test-peer");
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    let client_open = conn.expect_open_and_respond(&[]).await;
    assert_eq!(client_open.container_id, "lifecycle-client");
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("close-twice");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        connection.close().await.unwrap();
        // The second close performs no further protocol work
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

#[tokio::test]
async fn rejected_open_surfaces_as_security_error() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("rejected-client");
        let result = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await;
        assert!(
            matches!(result, Err(Error::Security { .. })),
            "expected a security error, got {:?}",
            result.err()
        );
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.reject_open(fe2o3_amqp_types::definitions::Error::new(
        AmqpError::UnauthorizedAccess,
        Some("Anonymous connections not allowed".to_string()),
        None,
    ))
    .await;

    client.await.unwrap();
}

#[tokio::test]
async fn sasl_plain_negotiation() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("sasl-client");
        let options = ConnectionOptions::default()
            .sasl_profile(SaslProfile::from(("guest", "secret")));
        let connection = container
            .connect("127.0.0.1", port, options)
            .await
            .unwrap();
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    let (mechanism, initial_response) = conn
        .exchange_sasl(&["SCRAM-SHA-256", "PLAIN", "ANONYMOUS"], SaslCode::Ok)
        .await;
    assert_eq!(mechanism, "PLAIN");
    assert_eq!(initial_response.as_deref(), Some(&b"\x00guest\x00secret"[..]));

    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

#[tokio::test]
async fn sasl_auth_failure_is_fatal() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("sasl-denied");
        let options = ConnectionOptions::default()
            .sasl_profile(SaslProfile::from(("guest", "wrong")));
        let result = container.connect("127.0.0.1", port, options).await;
        assert!(
            matches!(
                result,
                Err(Error::Sasl {
                    code: SaslCode::Auth,
                    ..
                })
            ),
            "expected a SASL auth failure, got {:?}",
            result.err()
        );
    });

    let mut conn = peer.accept().await;
    conn.exchange_sasl(&["PLAIN"], SaslCode::Auth).await;

    client.await.unwrap();
}

#[tokio::test]
async fn anonymous_sender_requires_the_relay_capability() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("no-relay");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let result = session.open_anonymous_sender().await;
        assert!(
            matches!(result, Err(Error::UnsupportedOperation { .. })),
            "expected unsupported-operation, got {:?}",
            result.err()
        );
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    // No ANONYMOUS-RELAY in the offered capabilities
    conn.expect_open_and_respond(&[]).await;
    conn.expect_begin_and_respond().await;
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

#[tokio::test]
async fn anonymous_sender_attaches_with_null_target_address() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("relay-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let sender = session.open_anonymous_sender().await.unwrap();
        assert_eq!(sender.address(), None);
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&["ANONYMOUS-RELAY"]).await;
    conn.expect_begin_and_respond().await;
    let (_, attach) = conn.expect_attach_and_respond().await;
    assert_eq!(
        common::target_address(&attach),
        None,
        "anonymous target must carry no address"
    );
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

#[tokio::test]
async fn heartbeats_follow_the_remote_idle_timeout() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("heartbeat-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        // Stay idle long enough for several heartbeat periods
        tokio::time::sleep(std::time::Duration::from_millis(900)).await;
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;

    // Advertise a 400ms idle timeout: the client must write at least every
    // 200ms
    let (_, performative, _) = conn.read_performative().await;
    assert!(matches!(performative, Performative::Open(_)));
    conn.send_performative(
        0,
        Performative::Open(fe2o3_amqp_types::performatives::Open {
            container_id: "test-peer".to_string(),
            hostname: None,
            max_frame_size: 65_536.into(),
            channel_max: 255.into(),
            idle_time_out: Some(400),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        }),
    )
    .await;

    let mut empty_frames = 0;
    loop {
        match conn.read_frame().await {
            PeerFrame::Empty => {
                empty_frames += 1;
            }
            PeerFrame::Amqp {
                performative: Performative::Close(_),
                ..
            } => break,
            PeerFrame::Amqp { performative, .. } => {
                panic!("unexpected frame while idle: {:?}", performative)
            }
        }
    }
    assert!(
        empty_frames >= 2,
        "expected at least two heartbeats, saw {}",
        empty_frames
    );
    conn.send_performative(
        0,
        Performative::Close(fe2o3_amqp_types::performatives::Close { error: None }),
    )
    .await;

    client.await.unwrap();
}

#[tokio::test]
async fn events_report_the_connection_lifecycle() {
    let (peer_a, port_a) = TestPeer::bind().await;
    let (peer_b, port_b) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("event-client");
        let options = ConnectionOptions::default()
            .reconnect(ReconnectOptions::enabled())
            .add_alternate_host("127.0.0.1", port_b);
        let mut connection = container
            .connect("127.0.0.1", port_a, options)
            .await
            .unwrap();
        let mut events = connection.events().expect("events taken once");

        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Connected { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Interrupted { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(ConnectionEvent::Reconnected { .. })
        ));
        connection.close().await.unwrap();
    });

    let mut conn_a = peer_a.accept().await;
    conn_a.exchange_amqp_header().await;
    conn_a.expect_open_and_respond(&[]).await;
    conn_a.drop_connection();

    let mut conn_b = peer_b.accept().await;
    conn_b.exchange_amqp_header().await;
    conn_b.expect_open_and_respond(&[]).await;
    conn_b.expect_close_and_respond().await;

    client.await.unwrap();
}
