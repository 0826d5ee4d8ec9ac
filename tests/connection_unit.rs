mod common;

use common::{ServerEnd, connected, connected_with};
use stomp_mux::connection::{Connection, MAX_WIRE_CHUNK, ProtocolVersion};
use stomp_mux::error::{ErrorEvent, StompError};
use stomp_mux::frame::Frame;
use stomp_mux::session::Config;
use stomp_mux::transport::pair;

fn message(subscription: &str, message_id: &str, body: &str) -> Frame {
    Frame::new("MESSAGE")
        .header("subscription", subscription)
        .header("message-id", message_id)
        .header("destination", "/queue/test")
        .set_body(body.as_bytes().to_vec())
}

#[tokio::test]
async fn connect_carries_configured_headers() {
    let config = Config {
        host: "/vhost".into(),
        heartbeat: Some((100, 200)),
        connect_headers: vec![("login".into(), "guest".into())],
        ..Config::default()
    };
    let (transport, peer) = pair(64);
    let mut server = ServerEnd::new(peer);
    let (conn, connect) = tokio::join!(
        Connection::establish(transport, &config),
        server.accept(&[("version", "1.2")]),
    );
    let conn = conn.expect("handshake");

    assert_eq!(connect.get_header("accept-version"), Some("1.0,1.1,1.2"));
    assert_eq!(connect.get_header("host"), Some("/vhost"));
    assert_eq!(connect.get_header("heart-beat"), Some("100,200"));
    assert_eq!(connect.get_header("login"), Some("guest"));
    assert_eq!(conn.version(), ProtocolVersion::V1_2);
    assert!(conn.is_connected());
}

#[tokio::test]
async fn explicit_heartbeat_header_wins_over_config() {
    let config = Config {
        heartbeat: Some((100, 200)),
        connect_headers: vec![("heart-beat".into(), "7,7".into())],
        ..Config::default()
    };
    let (transport, peer) = pair(64);
    let mut server = ServerEnd::new(peer);
    let (conn, connect) = tokio::join!(
        Connection::establish(transport, &config),
        server.accept(&[("version", "1.2")]),
    );
    conn.expect("handshake");

    let heartbeats: Vec<_> = connect
        .headers
        .iter()
        .filter(|(k, _)| k == "heart-beat")
        .collect();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].1, "7,7");
}

#[tokio::test]
async fn handshake_error_frame_fails_establish() {
    let (transport, peer) = pair(64);
    let mut server = ServerEnd::new(peer);
    let config = Config::default();
    let (result, _) = tokio::join!(Connection::establish(transport, &config), async {
        let connect = server.next_frame().await;
        assert_eq!(connect.command, "CONNECT");
        server
            .send_frame(Frame::new("ERROR").header("message", "auth failure"))
            .await;
    });
    match result {
        Err(StompError::Server(detail)) => assert!(detail.contains("auth failure")),
        other => panic!("expected server error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn messages_route_by_subscription_id() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut a = conn.subscribe("/queue/a").await.unwrap();
    let mut b = conn.subscribe("/queue/b").await.unwrap();
    assert_eq!(a.id(), "sub-0");
    assert_eq!(b.id(), "sub-1");

    let sub_a = server.next_frame().await;
    assert_eq!(sub_a.command, "SUBSCRIBE");
    assert_eq!(sub_a.get_header("id"), Some("sub-0"));
    assert_eq!(sub_a.get_header("destination"), Some("/queue/a"));
    let sub_b = server.next_frame().await;
    assert_eq!(sub_b.get_header("id"), Some("sub-1"));
    assert_eq!(sub_b.get_header("destination"), Some("/queue/b"));

    server.send_frame(message("sub-1", "m-1", "for b")).await;
    server.send_frame(message("sub-0", "m-2", "for a")).await;

    let got_b = b.next_message().await.unwrap();
    assert_eq!(got_b.body(), b"for b");
    assert_eq!(got_b.subscription(), "sub-1");

    // a's first delivery is the later frame, so nothing from sub-1 leaked
    let got_a = a.next_message().await.unwrap();
    assert_eq!(got_a.body(), b"for a");
}

#[tokio::test]
async fn unsubscribe_sends_the_wire_frame() {
    let (conn, mut server) = connected(&Config::default()).await;
    let sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    sub.unsubscribe().await.unwrap();
    let unsub = server.next_frame().await;
    assert_eq!(unsub.command, "UNSUBSCRIBE");
    assert_eq!(unsub.get_header("id"), Some("sub-0"));
}

#[tokio::test]
async fn broadcast_listeners_share_one_wire_subscription() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut first = conn.subscribe_broadcast("/topic/news").await.unwrap();
    let mut second = conn.subscribe_broadcast("/topic/news").await.unwrap();
    assert_eq!(first.id(), second.id());

    let subscribe = server.next_frame().await;
    assert_eq!(subscribe.command, "SUBSCRIBE");
    assert_eq!(subscribe.get_header("destination"), Some("/topic/news"));

    // a marker SEND arriving next proves no second SUBSCRIBE went out
    conn.send("/queue/marker", b"m".to_vec()).await.unwrap();
    assert_eq!(server.next_frame().await.command, "SEND");

    // one MESSAGE fans out to both listeners
    server.send_frame(message(first.id(), "m-1", "fanout")).await;
    assert_eq!(first.next_message().await.unwrap().body(), b"fanout");
    assert_eq!(second.next_message().await.unwrap().body(), b"fanout");

    // dropping one listener must not unsubscribe the other
    drop(first);
    conn.send("/queue/marker", b"m".to_vec()).await.unwrap();
    assert_eq!(server.next_frame().await.command, "SEND");

    // the last one going away tears the wire subscription down
    let id = second.id().to_string();
    second.unsubscribe().await.unwrap();
    let unsub = server.next_frame().await;
    assert_eq!(unsub.command, "UNSUBSCRIBE");
    assert_eq!(unsub.get_header("id"), Some(id.as_str()));
}

#[tokio::test]
async fn large_sends_are_split_into_ordered_chunks() {
    let (conn, mut server) = connected(&Config::default()).await;
    let body = vec![b'x'; 40 * 1024];
    conn.send("/queue/big", body.clone()).await.unwrap();

    // the reassembled frame is intact...
    let frame = server.next_frame().await;
    assert_eq!(frame.body, body);

    // ...and it crossed the transport in exactly three sends
    assert_eq!(server.send_sizes.len(), 3);
    assert_eq!(server.send_sizes[0], MAX_WIRE_CHUNK);
    assert_eq!(server.send_sizes[1], MAX_WIRE_CHUNK);
    assert!(server.send_sizes[2] <= MAX_WIRE_CHUNK);
}

#[tokio::test]
async fn ack_uses_the_ack_header_on_stomp_12() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    server
        .send_frame(message("sub-0", "m-7", "payload").header("ack", "ack-7"))
        .await;
    let msg = sub.next_message().await.unwrap();
    msg.ack().await.unwrap();

    let ack = server.next_frame().await;
    assert_eq!(ack.command, "ACK");
    assert_eq!(ack.get_header("id"), Some("ack-7"));
    assert!(!ack.has_header("message-id"));
}

#[tokio::test]
async fn nack_uses_message_id_and_subscription_on_stomp_11() {
    let (conn, mut server) =
        connected_with(&Config::default(), &[("version", "1.1")]).await;
    assert_eq!(conn.version(), ProtocolVersion::V1_1);
    let mut sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    server.send_frame(message("sub-0", "m-9", "payload")).await;
    let msg = sub.next_message().await.unwrap();
    msg.nack().await.unwrap();

    let nack = server.next_frame().await;
    assert_eq!(nack.command, "NACK");
    assert_eq!(nack.get_header("message-id"), Some("m-9"));
    assert_eq!(nack.get_header("subscription"), Some("sub-0"));
}

#[tokio::test]
async fn ack_on_stomp_10_sends_message_id_only() {
    // CONNECTED without a version header means a 1.0 server
    let (conn, mut server) = connected_with(&Config::default(), &[]).await;
    assert_eq!(conn.version(), ProtocolVersion::V1_0);
    let mut sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    server.send_frame(message("sub-0", "m-3", "payload")).await;
    sub.next_message().await.unwrap().ack().await.unwrap();

    let ack = server.next_frame().await;
    assert_eq!(ack.command, "ACK");
    assert_eq!(ack.get_header("message-id"), Some("m-3"));
    assert!(!ack.has_header("subscription"));
}

#[tokio::test]
async fn receipts_flow_back_to_the_caller() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut receipts = conn.receipts();

    let id = conn
        .send_with_receipt("/queue/a", Vec::new(), b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(id, "rcpt-0");

    let send = server.next_frame().await;
    assert_eq!(send.get_header("receipt"), Some("rcpt-0"));

    server
        .send_frame(Frame::new("RECEIPT").header("receipt-id", &id))
        .await;
    let receipt = receipts.recv().await.unwrap();
    assert_eq!(receipt.get_header("receipt-id"), Some("rcpt-0"));
}

#[tokio::test]
async fn decode_errors_are_survivable() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut errors = conn.errors();
    let mut sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    server.send_raw(b"MESSAGE\nbroken header\n\njunk\0").await;
    server.send_frame(message("sub-0", "m-1", "still alive")).await;

    match errors.recv().await.unwrap() {
        ErrorEvent::Decode(_) => {}
        other => panic!("expected decode error, got {:?}", other),
    }
    // the connection resynchronized and kept delivering
    assert_eq!(sub.next_message().await.unwrap().body(), b"still alive");
    assert!(conn.is_connected());
}

#[tokio::test]
async fn backpressure_drops_are_reported_not_silent() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut errors = conn.errors();
    let mut sub = conn.subscribe("/queue/a").await.unwrap();
    server.next_frame().await;

    // one more than the subscription buffer holds
    for i in 0..17 {
        server
            .send_frame(message("sub-0", &format!("m-{i}"), "payload"))
            .await;
    }

    match errors.recv().await.unwrap() {
        ErrorEvent::MessageDropped { subscription } => assert_eq!(subscription, "sub-0"),
        other => panic!("expected dropped-message event, got {:?}", other),
    }

    // everything that fit is delivered intact and the connection survives
    for i in 0..16 {
        let msg = sub.next_message().await.unwrap();
        assert_eq!(
            msg.frame.get_header("message-id"),
            Some(format!("m-{i}").as_str())
        );
    }
    assert!(conn.is_connected());
}

#[tokio::test]
async fn server_error_frames_reach_the_error_stream() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut errors = conn.errors();

    server
        .send_frame(Frame::new("ERROR").header("message", "bad destination"))
        .await;
    match errors.recv().await.unwrap() {
        ErrorEvent::Server(frame) => {
            assert_eq!(frame.get_header("message"), Some("bad destination"));
        }
        other => panic!("expected server error, got {:?}", other),
    }
    assert!(conn.is_connected());
}

#[tokio::test]
async fn transactions_wrap_sends() {
    let (conn, mut server) = connected(&Config::default()).await;

    let tx = conn.begin(None).await.unwrap();
    assert_eq!(tx.id(), "tx-0");
    let begin = server.next_frame().await;
    assert_eq!(begin.command, "BEGIN");
    assert_eq!(begin.get_header("transaction"), Some("tx-0"));

    tx.send("/queue/a", b"inside".to_vec()).await.unwrap();
    let send = server.next_frame().await;
    assert_eq!(send.get_header("transaction"), Some("tx-0"));

    tx.commit().await.unwrap();
    assert_eq!(server.next_frame().await.command, "COMMIT");

    let tx = conn.begin(Some("custom")).await.unwrap();
    assert_eq!(tx.id(), "custom");
    assert_eq!(server.next_frame().await.get_header("transaction"), Some("custom"));
    tx.abort().await.unwrap();
    let abort = server.next_frame().await;
    assert_eq!(abort.command, "ABORT");
    assert_eq!(abort.get_header("transaction"), Some("custom"));

    // the generated counter did not burn an id on the explicit one
    let tx = conn.begin(None).await.unwrap();
    assert_eq!(tx.id(), "tx-1");
}

#[tokio::test]
async fn disconnect_precedes_transport_close() {
    let (conn, mut server) = connected(&Config::default()).await;
    conn.disconnect().await.unwrap();

    server.expect_close().await;
    let frame = server.buffered_frame().expect("DISCONNECT written before close");
    assert_eq!(frame.command, "DISCONNECT");

    let mut closed = conn.closed();
    closed.wait_for(|c| *c).await.unwrap();
    assert!(!conn.is_connected());
    assert!(matches!(
        conn.send("/queue/a", b"late".to_vec()).await,
        Err(StompError::NotConnected)
    ));
}

#[tokio::test]
async fn peer_loss_surfaces_on_errors_and_closed() {
    let (conn, mut server) = connected(&Config::default()).await;
    let mut errors = conn.errors();

    server.drop_connection("connection reset").await;

    let mut closed = conn.closed();
    closed.wait_for(|c| *c).await.unwrap();
    match errors.recv().await.unwrap() {
        ErrorEvent::TransportClosed(reason) => assert!(reason.contains("reset")),
        other => panic!("expected transport-closed, got {:?}", other),
    }
    assert!(!conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn idle_connection_emits_heartbeat_pings() {
    let config = Config {
        heartbeat: Some((500, 0)),
        ..Config::default()
    };
    // outgoing = max(500, 500), incoming disabled
    let (conn, mut server) =
        connected_with(&config, &[("version", "1.2"), ("heart-beat", "500,500")]).await;

    match server.next_item().await {
        stomp_mux::codec::WireItem::Ping => {}
        other => panic!("expected ping, got {:?}", other),
    }

    // the connection is still usable afterwards
    conn.send("/queue/a", b"after ping".to_vec()).await.unwrap();
    let frame = server.next_frame().await;
    assert_eq!(frame.body, b"after ping");
}

#[tokio::test(start_paused = true)]
async fn watchdog_closes_a_silent_connection() {
    let config = Config {
        heartbeat: Some((0, 500)),
        ..Config::default()
    };
    // incoming = max(500, 500); the server then goes quiet forever
    let (conn, mut server) =
        connected_with(&config, &[("version", "1.2"), ("heart-beat", "500,500")]).await;

    server.expect_close().await;
    let mut closed = conn.closed();
    closed.wait_for(|c| *c).await.unwrap();
    assert!(!conn.is_connected());
}
