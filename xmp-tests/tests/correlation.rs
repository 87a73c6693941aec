use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use xmp_client::{Builder, ConnectionState, Error};
use xmp_protocol::{
    Address, Command, Frame, Status,
    message::decode_message,
    commands::{
        Comment,
        chassis::{C_KEEPALIVE, KeepaliveReply},
        port::{P_COMMENT, P_SPEED, P_TRAFFIC, Speed},
    },
};
use xmp_tests::{PATIENCE, ScriptedPeer, body, init_logging, quiet_config};

async fn wait_for_state(connection: &xmp_client::Connection, state: ConnectionState) {
    tokio::time::timeout(PATIENCE, async {
        while connection.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connection reaches the expected state");
}

#[tokio::test]
async fn replies_resolve_in_request_order_per_key() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let speed = connection.command::<P_SPEED>(Address::port(0, 1));

    let first = speed.send_get().await.unwrap();
    let second = speed.send_get().await.unwrap();
    let requests = peer.recv_many(2).await;
    assert_eq!(requests[0].key(), requests[1].key());
    peer.reply(&requests[0], body(Speed { mbps: 1000 })).await;
    peer.reply(&requests[1], body(Speed { mbps: 25_000 })).await;

    assert_eq!(first.await.unwrap().mbps, 1000);
    assert_eq!(second.await.unwrap().mbps, 25_000);
    assert_eq!(connection.pending(), 0);
}

#[tokio::test]
async fn different_keys_do_not_interfere() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let port0 = connection.command::<P_SPEED>(Address::port(0, 0));
    let port1 = connection.command::<P_SPEED>(Address::port(0, 1));

    let on_port0 = port0.send_get().await.unwrap();
    let on_port1 = port1.send_get().await.unwrap();
    let requests = peer.recv_many(2).await;
    // Answered in reverse order.
    peer.reply(&requests[1], body(Speed { mbps: 1 })).await;
    peer.reply(&requests[0], body(Speed { mbps: 0 })).await;

    assert_eq!(on_port1.await.unwrap().mbps, 1);
    assert_eq!(on_port0.await.unwrap().mbps, 0);
}

#[tokio::test]
async fn late_reply_of_cancelled_request_is_discarded() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let speed = connection.command::<P_SPEED>(Address::port(1, 0));

    let abandoned = speed.send_get().await.unwrap();
    drop(abandoned);
    let wanted = speed.send_get().await.unwrap();
    let requests = peer.recv_many(2).await;
    peer.reply(&requests[0], body(Speed { mbps: 100 })).await;
    peer.reply(&requests[1], body(Speed { mbps: 40_000 })).await;

    assert_eq!(wanted.await.unwrap().mbps, 40_000);
    assert_eq!(connection.pending(), 0);
}

#[tokio::test]
async fn abandoned_sends_still_reach_the_wire_whole() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let address = Address::port(0, 0);
    let text = "x".repeat(60_000);

    // The peer reads nothing yet, so the socket buffers fill up while every
    // caller gives up almost immediately.
    for _ in 0..8 {
        let frame = Frame::set::<P_COMMENT>(
            address.clone(),
            Comment {
                comment: text.clone(),
            },
        )
        .unwrap();
        let sent = tokio::time::timeout(Duration::from_millis(1), connection.send(frame)).await;
        assert!(matches!(sent, Ok(Ok(_))), "{sent:?}");
    }

    let requests = peer.recv_many(8).await;
    for request in &requests {
        assert_eq!(request.code, P_COMMENT::CODE);
        let comment = decode_message::<Comment>(request.payload.clone()).unwrap();
        assert_eq!(comment.comment.len(), text.len());
        peer.send(Frame::status_reply(request, Status::Ok)).await;
    }

    let pending = connection
        .command::<P_COMMENT>(address)
        .send_get()
        .await
        .unwrap();
    let request = peer.recv().await;
    assert!(request.payload.is_empty());
    peer.reply(
        &request,
        body(Comment {
            comment: "after".into(),
        }),
    )
    .await;
    assert_eq!(pending.await.unwrap().comment, "after");
    assert_eq!(connection.pending(), 0);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn disconnect_fails_every_pending_request() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let mut tokens = Vec::new();
    for address in [
        Address::port(0, 0),
        Address::port(0, 0),
        Address::port(0, 1),
        Address::port(1, 0),
        Address::port(1, 0),
    ] {
        tokens.push(
            connection
                .send(Frame::get::<P_SPEED>(address))
                .await
                .unwrap(),
        );
    }
    peer.recv_many(5).await;
    assert_eq!(connection.pending(), 5);
    peer.hang_up().await;

    for token in tokens {
        let result = tokio::time::timeout(PATIENCE, token).await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    }
    assert_eq!(connection.state(), ConnectionState::Closed);
    let later = connection
        .send(Frame::get::<P_SPEED>(Address::port(0, 0)))
        .await;
    assert!(matches!(later, Err(Error::NotConnected)), "{later:?}");
}

#[tokio::test]
async fn unmatched_reply_is_ignored() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    // P_COMMENT is never pushed, so nobody wants this frame.
    peer.send(Frame::new(
        P_COMMENT::CODE,
        Address::port(0, 2),
        body(Comment {
            comment: "stray".into(),
        }),
    ))
    .await;

    let comment = connection.command::<P_COMMENT>(Address::port(0, 0));
    let pending = comment.send_get().await.unwrap();
    let request = peer.recv().await;
    peer.reply(
        &request,
        body(Comment {
            comment: "mine".into(),
        }),
    )
    .await;
    assert_eq!(pending.await.unwrap().comment, "mine");
    assert!(connection.is_connected());
}

#[tokio::test]
async fn pushes_reach_listeners_and_event_streams() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let mut events = connection.events(P_SPEED::CODE);
    let (seen, mut decoded) = mpsc::unbounded_channel();
    let _listener = connection.on::<P_SPEED>(move |address, speed| {
        let _ = seen.send((address.clone(), speed.mbps));
        Ok(())
    });
    assert_eq!(connection.listeners(P_SPEED::CODE), 2);

    peer.send(Frame::new(
        P_SPEED::CODE,
        Address::port(1, 2),
        body(Speed { mbps: 100_000 }),
    ))
    .await;

    let event = tokio::time::timeout(PATIENCE, events.recv())
        .await
        .unwrap()
        .expect("push event");
    assert_eq!(event.code, P_SPEED::CODE);
    assert_eq!(event.address, Address::port(1, 2));
    let (address, mbps) = tokio::time::timeout(PATIENCE, decoded.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(address, Address::port(1, 2));
    assert_eq!(mbps, 100_000);
}

#[tokio::test]
async fn failing_listener_does_not_stop_dispatch() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let _broken = connection.subscribe(P_TRAFFIC::CODE, |_| Err(Error::NotConnected));
    let _panicking = connection.subscribe(P_TRAFFIC::CODE, |_| panic!("listener bug"));
    let mut events = connection.events(P_TRAFFIC::CODE);

    peer.send(Frame::new(P_TRAFFIC::CODE, Address::port(0, 3), Bytes::from_static(&[1])))
        .await;
    let event = tokio::time::timeout(PATIENCE, events.recv())
        .await
        .unwrap()
        .expect("push event");
    assert_eq!(&event.payload[..], &[1]);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn dropped_subscription_stops_delivery() {
    init_logging();
    let (connection, _peer) = ScriptedPeer::pair(quiet_config()).await;
    let subscription = connection.subscribe(P_SPEED::CODE, |_| Ok(()));
    assert_eq!(connection.listeners(P_SPEED::CODE), 1);
    drop(subscription);
    assert_eq!(connection.listeners(P_SPEED::CODE), 0);
}

#[tokio::test]
async fn error_status_becomes_typed_error() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let traffic = connection.command::<P_TRAFFIC>(Address::port(0, 0));
    let pending = traffic
        .send_set(xmp_protocol::commands::Toggle {
            state: xmp_protocol::commands::OnOff::On,
        })
        .await
        .unwrap();
    let request = peer.recv().await;
    peer.send(Frame::status_reply(&request, Status::NotReserved))
        .await;

    match pending.await {
        Err(Error::Status {
            command,
            address,
            status,
        }) => {
            assert_eq!(command, "P_TRAFFIC");
            assert_eq!(address, Address::port(0, 0));
            assert_eq!(status, Status::NotReserved);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_stream_closes_the_connection() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let token = connection
        .send(Frame::get::<P_SPEED>(Address::port(0, 0)))
        .await
        .unwrap();
    peer.recv().await;
    peer.send_raw(&[0x42; 12]).await;

    let result = tokio::time::timeout(PATIENCE, token).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    wait_for_state(&connection, ConnectionState::Closed).await;
}

#[tokio::test]
async fn unregistered_command_is_rejected_before_sending() {
    init_logging();
    let (connection, _peer) = ScriptedPeer::pair(quiet_config()).await;
    let result = connection
        .send(Frame::new(0x7777, Address::chassis(), Bytes::new()))
        .await;
    assert!(matches!(result, Err(Error::Unsupported(0x7777))), "{result:?}");
    assert_eq!(connection.pending(), 0);
}

#[tokio::test]
async fn idle_connection_sends_keepalives() {
    init_logging();
    let config = Builder::new()
        .keepalive(Some(Duration::from_millis(50)))
        .build();
    let (connection, mut peer) = ScriptedPeer::pair(config).await;

    let keepalive = peer.recv().await;
    assert_eq!(keepalive.code, C_KEEPALIVE::CODE);
    assert_eq!(keepalive.address, Address::chassis());
    assert!(keepalive.payload.is_empty());
    peer.reply(&keepalive, body(KeepaliveReply { ticks: 1 })).await;

    let next = peer.recv().await;
    assert_eq!(next.code, C_KEEPALIVE::CODE);
    assert!(connection.is_connected());
}

#[tokio::test]
async fn close_fails_pending_requests() {
    init_logging();
    let (connection, mut peer) = ScriptedPeer::pair(quiet_config()).await;
    let token = connection
        .send(Frame::get::<P_SPEED>(Address::port(0, 0)))
        .await
        .unwrap();
    peer.recv().await;

    connection.close().await;
    assert!(matches!(token.await, Err(Error::ConnectionClosed)));
    assert_eq!(connection.state(), ConnectionState::Closed);
}
