//! Sender, receiver and flow-control tests against the scripted peer

mod common;

use common::TestPeer;
use fe2o3_amqp_types::messaging::message::__private::{Deserializable, Serializable};
use fe2o3_amqp_types::messaging::{
    Accepted, AmqpValue, Body, DeliveryState, Message,
};
use fe2o3_amqp_types::performatives::{Flow, Performative, Transfer};
use fe2o3_amqp_types::primitives::Value;
use serde::Serialize;
use siderite::{
    ConnectionOptions, Container, Error, ReceiverOptions, ReconnectOptions,
};
use tokio::sync::oneshot;

fn encode_value_message(value: &str) -> Vec<u8> {
    let message = Message::builder().value(value.to_string()).build();
    let mut buf = Vec::new();
    let mut serializer = serde_amqp::ser::Serializer::from(&mut buf);
    Serializable(message).serialize(&mut serializer).unwrap();
    buf
}

fn decode_value_message(payload: &[u8]) -> Message<Body<Value>> {
    serde_amqp::from_slice::<Deserializable<Message<Body<Value>>>>(payload)
        .unwrap()
        .0
}

fn string_body(message: &Message<Body<Value>>) -> String {
    match &message.body {
        Body::Value(AmqpValue(Value::String(s))) => s.clone(),
        other => panic!("expected a string body, got {:?}", other),
    }
}

/// Accepted send: peer grants one credit, accepts and settles; the tracker
/// reports the outcome and its settlement future completes cleanly.
#[tokio::test]
async fn send_is_accepted_and_settled() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("send-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let sender = session.open_sender("examples").await.unwrap();
        assert_eq!(sender.address(), Some("examples".to_string()));

        let message = Message::builder().value("Hello World! [0]").build();
        let mut tracker = sender.send(message).await.unwrap();
        let state = tracker.settlement().await.unwrap();

        assert!(matches!(state, Some(DeliveryState::Accepted(_))));
        assert!(tracker.remote_settled());
        assert!(matches!(
            tracker.remote_state(),
            Some(DeliveryState::Accepted(_))
        ));
        // Settling an already settled delivery is a no-op
        tracker.settle().await.unwrap();
        tracker.settle().await.unwrap();

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&["ANONYMOUS-RELAY"]).await;
    let channel = conn.expect_begin_and_respond().await;
    let (_, attach) = conn.expect_attach_and_respond().await;
    assert_eq!(
        common::target_address(&attach),
        Some("examples".to_string())
    );

    conn.grant_credit(channel, 1).await;

    let (_, performative, payload) = conn.read_performative().await;
    match performative {
        Performative::Transfer(transfer) => {
            assert_eq!(transfer.delivery_id, Some(0));
            assert!(!transfer.more);
            assert_eq!(transfer.settled, Some(false));
        }
        other => panic!("expected Transfer, got {:?}", other),
    }
    let message = decode_value_message(&payload);
    assert_eq!(string_body(&message), "Hello World! [0]");

    conn.settle(channel, 0, DeliveryState::Accepted(Accepted {}))
        .await;
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

/// Split-frame receive: three transfers reassemble into one delivery;
/// try_recv stays empty until the final transfer lands.
#[tokio::test]
async fn multi_transfer_delivery_is_reassembled() {
    let (peer, port) = TestPeer::bind().await;
    let (partials_sent_tx, partials_sent_rx) = oneshot::channel();
    let (checked_tx, checked_rx) = oneshot::channel();

    let client = tokio::spawn(async move {
        let container = Container::new("receive-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let mut receiver = session.open_receiver("examples").await.unwrap();

        partials_sent_rx.await.unwrap();
        assert!(
            receiver.try_recv().unwrap().is_none(),
            "no delivery may surface before the final transfer"
        );
        checked_tx.send(()).unwrap();

        let delivery = receiver.recv().await.unwrap();
        let message = delivery.message().unwrap();
        assert_eq!(string_body(&message), "Hello World");
        receiver.accept(&delivery).await.unwrap();

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;

    // The receiver's credit window announces itself right after attach
    let (_, performative, _) = conn.read_performative().await;
    match performative {
        Performative::Flow(flow) => assert_eq!(flow.link_credit, Some(10)),
        other => panic!("expected the credit-window Flow, got {:?}", other),
    }

    let body = encode_value_message("Hello World");
    let transfer = |more: bool, first: bool| Transfer {
        handle: 0u32.into(),
        delivery_id: Some(0),
        delivery_tag: first.then(|| vec![0, 0, 0, 0, 0, 0, 0, 9].into()),
        message_format: first.then_some(0),
        settled: Some(false),
        more,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: false,
        batchable: false,
    };

    conn.send_with_payload(channel, Performative::Transfer(transfer(true, true)), &body[0..2])
        .await;
    conn.send_with_payload(channel, Performative::Transfer(transfer(true, false)), &body[2..4])
        .await;
    // Give the client a chance to observe the two partial transfers
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    partials_sent_tx.send(()).unwrap();
    checked_rx.await.unwrap();
    conn.send_with_payload(channel, Performative::Transfer(transfer(false, false)), &body[4..])
        .await;

    // The accept comes back as a settled Disposition with the outcome
    let (_, performative, _) = conn.read_performative().await;
    match performative {
        Performative::Disposition(disposition) => {
            assert_eq!(disposition.first, 0);
            assert!(disposition.settled);
            assert!(matches!(
                disposition.state,
                Some(DeliveryState::Accepted(_))
            ));
        }
        other => panic!("expected Disposition, got {:?}", other),
    }

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}

/// Sends on one link keep their delivery-id order
#[tokio::test]
async fn send_order_is_preserved() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("order-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let sender = session.open_sender("ordered").await.unwrap();

        let first = Message::builder().value("first").build();
        let second = Message::builder().value("second").build();
        let _t1 = sender.send(first).await.unwrap();
        let _t2 = sender.send(second).await.unwrap();

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;
    conn.grant_credit(channel, 2).await;

    let (_, first, payload_one) = conn.read_performative().await;
    let (_, second, payload_two) = conn.read_performative().await;
    match (first, second) {
        (Performative::Transfer(a), Performative::Transfer(b)) => {
            assert_eq!(a.delivery_id, Some(0));
            assert_eq!(b.delivery_id, Some(1));
        }
        other => panic!("expected two Transfers, got {:?}", other),
    }
    assert_eq!(string_body(&decode_value_message(&payload_one)), "first");
    assert_eq!(string_body(&decode_value_message(&payload_two)), "second");

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}

/// A payload larger than the negotiated max frame size goes out as several
/// transfers whose concatenation is the original encoding
#[tokio::test]
async fn oversized_message_is_fragmented() {
    let (peer, port) = TestPeer::bind().await;

    let big = "x".repeat(4_000);
    let expected = encode_value_message(&big);

    let client = tokio::spawn(async move {
        let container = Container::new("fragment-client");
        let options = ConnectionOptions::default().max_frame_size(1_024);
        let connection = container
            .connect("127.0.0.1", port, options)
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let sender = session.open_sender("big").await.unwrap();

        let message = Message::builder().value("x".repeat(4_000)).build();
        sender.send(message).await.unwrap();

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;
    conn.grant_credit(channel, 1).await;

    let mut reassembled = Vec::new();
    let mut frames = 0;
    loop {
        let (_, performative, payload) = conn.read_performative().await;
        match performative {
            Performative::Transfer(transfer) => {
                frames += 1;
                reassembled.extend_from_slice(&payload);
                if !transfer.more {
                    break;
                }
            }
            other => panic!("expected Transfer, got {:?}", other),
        }
    }
    assert!(frames > 1, "payload should span several transfer frames");
    assert_eq!(reassembled, expected);

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}

/// Credit-window drain: the sender consumes the outstanding credit by
/// advancing delivery-count; add_credit during the pending drain is refused.
#[tokio::test]
async fn drain_completes_and_blocks_add_credit() {
    let (peer, port) = TestPeer::bind().await;
    let (drain_seen_tx, drain_seen_rx) = oneshot::channel();
    let (respond_tx, respond_rx) = oneshot::channel::<()>();

    let client = tokio::spawn(async move {
        let container = Container::new("drain-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let receiver = session
            .open_receiver_with("queue", ReceiverOptions::new().credit_window(0))
            .await
            .unwrap();

        receiver.add_credit(7).await.unwrap();

        let drain = receiver.drain();
        let interleave = async {
            drain_seen_rx.await.unwrap();
            let result = receiver.add_credit(1).await;
            assert!(
                matches!(result, Err(Error::IllegalState { .. })),
                "add_credit during a drain must be refused, got {:?}",
                result.err()
            );
            respond_tx.send(()).unwrap();
        };
        let (drain_result, ()) = tokio::join!(drain, interleave);
        drain_result.unwrap();

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;

    // add_credit(7)
    let (_, performative, _) = conn.read_performative().await;
    match performative {
        Performative::Flow(flow) => {
            assert_eq!(flow.link_credit, Some(7));
            assert!(!flow.drain);
        }
        other => panic!("expected Flow, got {:?}", other),
    }

    // drain()
    let (_, performative, _) = conn.read_performative().await;
    match performative {
        Performative::Flow(flow) => {
            assert!(flow.drain);
            assert_eq!(flow.link_credit, Some(7));
        }
        other => panic!("expected drain Flow, got {:?}", other),
    }
    drain_seen_tx.send(()).unwrap();
    respond_rx.await.unwrap();

    // Consume the credit without delivering anything
    conn.send_performative(
        channel,
        Performative::Flow(Flow {
            next_incoming_id: Some(0),
            incoming_window: 5_000,
            next_outgoing_id: 0,
            outgoing_window: 5_000,
            handle: Some(0u32.into()),
            delivery_count: Some(7),
            link_credit: Some(0),
            available: Some(0),
            drain: true,
            echo: false,
            properties: None,
        }),
    )
    .await;

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}

/// A drain with no credit outstanding completes without touching the wire
#[tokio::test]
async fn drain_without_credit_is_trivial() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("trivial-drain");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let receiver = session
            .open_receiver_with("queue", ReceiverOptions::new().credit_window(0))
            .await
            .unwrap();

        receiver.drain().await.unwrap();
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;
    conn.expect_close_and_respond().await;

    client.await.unwrap();
}

/// Reconnect re-attaches the sender on the next host; a send blocked during
/// the outage produces its transfer there.
#[tokio::test]
async fn reconnect_preserves_the_sender() {
    let (peer_a, port_a) = TestPeer::bind().await;
    let (peer_b, port_b) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("failover-client");
        let options = ConnectionOptions::default()
            .reconnect(ReconnectOptions::enabled())
            .add_alternate_host("127.0.0.1", port_b);
        let mut connection = container
            .connect("127.0.0.1", port_a, options)
            .await
            .unwrap();
        let mut events = connection.events().expect("events taken once");
        let session = connection.open_session().await.unwrap();
        let sender = session.open_sender("test").await.unwrap();

        // Wait out the drop of host A, then send into the outage: the
        // delivery queues on credit and goes out on host B
        loop {
            if let Some(siderite::ConnectionEvent::Interrupted { .. }) = events.recv().await {
                break;
            }
        }
        let message = Message::builder().value("after failover").build();
        let mut tracker = sender.send(message).await.unwrap();
        let state = tracker.settlement().await.unwrap();
        assert!(matches!(state, Some(DeliveryState::Accepted(_))));

        connection.close().await.unwrap();
    });

    let mut conn_a = peer_a.accept().await;
    conn_a.exchange_amqp_header().await;
    conn_a.expect_open_and_respond(&[]).await;
    conn_a.expect_begin_and_respond().await;
    let (_, attach_a) = conn_a.expect_attach_and_respond().await;
    conn_a.drop_connection();

    let mut conn_b = peer_b.accept().await;
    conn_b.exchange_amqp_header().await;
    conn_b.expect_open_and_respond(&[]).await;
    let channel_b = conn_b.expect_begin_and_respond().await;
    let (_, attach_b) = conn_b.expect_attach_and_respond().await;
    assert_eq!(attach_b.name, attach_a.name, "link name survives failover");
    assert_eq!(
        common::target_address(&attach_b),
        Some("test".to_string())
    );

    conn_b.grant_credit(channel_b, 1).await;
    let (_, performative, payload) = conn_b.read_performative().await;
    match performative {
        Performative::Transfer(transfer) => assert_eq!(transfer.delivery_id, Some(0)),
        other => panic!("expected Transfer on host B, got {:?}", other),
    }
    assert_eq!(
        string_body(&decode_value_message(&payload)),
        "after failover"
    );
    conn_b
        .settle(channel_b, 0, DeliveryState::Accepted(Accepted {}))
        .await;

    conn_b.expect_close_and_respond().await;
    client.await.unwrap();
}

/// A delivery transferred before the connection drops fails its settlement
/// future as remotely closed; the alternate peer does not redeliver.
#[tokio::test]
async fn in_flight_send_fails_when_the_connection_drops() {
    let (peer_a, port_a) = TestPeer::bind().await;
    let (peer_b, port_b) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("dropped-client");
        let options = ConnectionOptions::default()
            .reconnect(ReconnectOptions::enabled())
            .add_alternate_host("127.0.0.1", port_b);
        let mut connection = container
            .connect("127.0.0.1", port_a, options)
            .await
            .unwrap();
        let mut events = connection.events().expect("events taken once");
        let session = connection.open_session().await.unwrap();
        let sender = session.open_sender("test").await.unwrap();

        let message = Message::builder().value("in flight").build();
        let mut tracker = sender.send(message).await.unwrap();
        let result = tracker.settlement().await;
        assert!(
            matches!(result, Err(Error::ConnectionRemotelyClosed { .. })),
            "expected remotely-closed, got {:?}",
            result
        );

        // Let the failover finish before closing, so host B sees the full
        // re-established topology first
        loop {
            match events.recv().await {
                Some(siderite::ConnectionEvent::Reconnected { .. }) => break,
                Some(_) => continue,
                None => panic!("event stream ended early"),
            }
        }
        connection.close().await.unwrap();
    });

    let mut conn_a = peer_a.accept().await;
    conn_a.exchange_amqp_header().await;
    conn_a.expect_open_and_respond(&[]).await;
    let channel_a = conn_a.expect_begin_and_respond().await;
    conn_a.expect_attach_and_respond().await;
    conn_a.grant_credit(channel_a, 1).await;
    // The transfer arrives, then the connection dies without a Disposition
    let (_, performative, _) = conn_a.read_performative().await;
    assert!(matches!(performative, Performative::Transfer(_)));
    conn_a.drop_connection();

    let mut conn_b = peer_b.accept().await;
    conn_b.exchange_amqp_header().await;
    conn_b.expect_open_and_respond(&[]).await;
    conn_b.expect_begin_and_respond().await;
    conn_b.expect_attach_and_respond().await;
    conn_b.expect_close_and_respond().await;

    client.await.unwrap();
}

/// A dynamic receiver reports the server-assigned source address
#[tokio::test]
async fn dynamic_receiver_reports_the_assigned_address() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("dynamic-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let receiver = session
            .open_dynamic_receiver(ReceiverOptions::new().credit_window(0))
            .await
            .unwrap();
        assert_eq!(
            receiver.source_address(),
            Some("dynamic-node-17".to_string())
        );
        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;

    // Echo the attach, filling in the assigned address
    let (_, performative, _) = conn.read_performative().await;
    let client_attach = match performative {
        Performative::Attach(attach) => attach,
        other => panic!("expected Attach, got {:?}", other),
    };
    let dynamic = client_attach
        .source
        .as_ref()
        .map(|source| source.dynamic)
        .unwrap_or(false);
    assert!(dynamic, "client must request a dynamic source");

    let mut echo = client_attach;
    echo.role = fe2o3_amqp_types::definitions::Role::Sender;
    echo.handle = 0u32.into();
    echo.initial_delivery_count = Some(0);
    if let Some(source) = echo.source.as_mut() {
        source.address = Some("dynamic-node-17".to_string().into());
    }
    conn.send_performative(channel, Performative::Attach(echo)).await;

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}

/// An aborted incoming delivery is discarded without surfacing
#[tokio::test]
async fn aborted_delivery_is_discarded() {
    let (peer, port) = TestPeer::bind().await;

    let client = tokio::spawn(async move {
        let container = Container::new("abort-client");
        let connection = container
            .connect("127.0.0.1", port, ConnectionOptions::default())
            .await
            .unwrap();
        let session = connection.open_session().await.unwrap();
        let mut receiver = session.open_receiver("examples").await.unwrap();

        // Only the delivery sent after the aborted one surfaces
        let delivery = receiver.recv().await.unwrap();
        assert_eq!(string_body(&delivery.message().unwrap()), "second try");

        connection.close().await.unwrap();
    });

    let mut conn = peer.accept().await;
    conn.exchange_amqp_header().await;
    conn.expect_open_and_respond(&[]).await;
    let channel = conn.expect_begin_and_respond().await;
    conn.expect_attach_and_respond().await;
    // Credit window flow
    let (_, performative, _) = conn.read_performative().await;
    assert!(matches!(performative, Performative::Flow(_)));

    let aborted_first = Transfer {
        handle: 0u32.into(),
        delivery_id: Some(0),
        delivery_tag: Some(vec![1u8; 8].into()),
        message_format: Some(0),
        settled: Some(false),
        more: true,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: false,
        batchable: false,
    };
    conn.send_with_payload(channel, Performative::Transfer(aborted_first), b"garbage")
        .await;
    let abort = Transfer {
        handle: 0u32.into(),
        delivery_id: Some(0),
        delivery_tag: None,
        message_format: None,
        settled: None,
        more: false,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: true,
        batchable: false,
    };
    conn.send_performative(channel, Performative::Transfer(abort)).await;

    let body = encode_value_message("second try");
    let complete = Transfer {
        handle: 0u32.into(),
        delivery_id: Some(1),
        delivery_tag: Some(vec![2u8; 8].into()),
        message_format: Some(0),
        settled: Some(true),
        more: false,
        rcv_settle_mode: None,
        state: None,
        resume: false,
        aborted: false,
        batchable: false,
    };
    conn.send_with_payload(channel, Performative::Transfer(complete), &body)
        .await;

    conn.expect_close_and_respond().await;
    client.await.unwrap();
}
