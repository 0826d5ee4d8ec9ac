//! Shared harness: an in-process server end speaking STOMP over the
//! transport channel pair, plus canned connectors for the session tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use stomp_mux::codec::{StompCodec, WireItem};
use stomp_mux::connection::Connection;
use stomp_mux::error::StompError;
use stomp_mux::frame::Frame;
use stomp_mux::session::Config;
use stomp_mux::transport::{
    Connector, Transport, TransportCommand, TransportEvent, TransportPeer, pair,
};

/// Server side of one transport pair: decodes what the client writes and
/// injects raw bytes or frames back.
pub struct ServerEnd {
    commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    codec: StompCodec,
    buf: BytesMut,
    /// Byte size of every Send command observed, in order.
    pub send_sizes: Vec<usize>,
}

impl ServerEnd {
    pub fn new(peer: TransportPeer) -> Self {
        Self {
            commands: peer.commands,
            events: peer.events,
            codec: StompCodec::new(),
            buf: BytesMut::new(),
            send_sizes: Vec::new(),
        }
    }

    /// Next decoded item, pulling transport sends as needed.
    pub async fn next_item(&mut self) -> WireItem {
        loop {
            if let Some(item) = self.codec.decode(&mut self.buf).expect("server-side decode") {
                return item;
            }
            match self.commands.recv().await {
                Some(TransportCommand::Send(payload)) => {
                    self.send_sizes.push(payload.len());
                    self.buf.extend_from_slice(&payload);
                }
                Some(TransportCommand::Close) | None => {
                    panic!("transport closed while waiting for a frame")
                }
            }
        }
    }

    /// Next full frame, skipping heartbeat pings.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            if let WireItem::Frame(frame) = self.next_item().await {
                return frame;
            }
        }
    }

    /// Decode a frame that is already buffered, without waiting.
    pub fn buffered_frame(&mut self) -> Option<Frame> {
        match self.codec.decode(&mut self.buf) {
            Ok(Some(WireItem::Frame(frame))) => Some(frame),
            _ => None,
        }
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        self.codec
            .encode(WireItem::Frame(frame), &mut out)
            .expect("server-side encode");
        self.events
            .send(TransportEvent::Data(out.freeze()))
            .await
            .expect("client event channel");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.events
            .send(TransportEvent::Data(Bytes::copy_from_slice(bytes)))
            .await
            .expect("client event channel");
    }

    /// Simulate the peer dropping the connection.
    pub async fn drop_connection(&mut self, reason: &str) {
        let _ = self
            .events
            .send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .await;
    }

    /// Serve the handshake: read CONNECT, answer CONNECTED with the given
    /// headers, and hand the CONNECT frame back for assertions.
    pub async fn accept(&mut self, connected_headers: &[(&str, &str)]) -> Frame {
        let connect = self.next_frame().await;
        assert_eq!(connect.command, "CONNECT");
        let mut frame = Frame::new("CONNECTED");
        for (key, value) in connected_headers {
            frame = frame.header(*key, *value);
        }
        self.send_frame(frame).await;
        connect
    }

    /// Wait for the client's Close command, buffering any sends that come
    /// first, then acknowledge it with the final Closed event.
    pub async fn expect_close(&mut self) {
        loop {
            match self.commands.recv().await {
                Some(TransportCommand::Send(payload)) => {
                    self.send_sizes.push(payload.len());
                    self.buf.extend_from_slice(&payload);
                }
                Some(TransportCommand::Close) | None => break,
            }
        }
        let _ = self
            .events
            .send(TransportEvent::Closed {
                reason: "closed by peer".to_string(),
            })
            .await;
    }
}

/// Handshake a fresh connection against an in-process server end.
/// `send_sizes` is reset afterwards so tests only see their own traffic.
pub async fn connected_with(
    config: &Config,
    connected_headers: &[(&str, &str)],
) -> (Connection, ServerEnd) {
    let (transport, peer) = pair(64);
    let mut server = ServerEnd::new(peer);
    let (conn, _connect) = tokio::join!(
        Connection::establish(transport, config),
        server.accept(connected_headers),
    );
    server.send_sizes.clear();
    (conn.expect("handshake"), server)
}

pub async fn connected(config: &Config) -> (Connection, ServerEnd) {
    connected_with(config, &[("version", "1.2"), ("heart-beat", "0,0")]).await
}

/// Hands out pre-built transports in order; dials fail once it runs dry.
pub struct QueueConnector {
    transports: Mutex<VecDeque<Transport>>,
    dials: AtomicUsize,
}

impl QueueConnector {
    pub fn new(transports: Vec<Transport>) -> Self {
        Self {
            transports: Mutex::new(transports.into_iter().collect()),
            dials: AtomicUsize::new(0),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for QueueConnector {
    async fn connect(&self) -> Result<Transport, StompError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.transports
            .lock()
            .expect("connector queue lock")
            .pop_front()
            .ok_or_else(|| StompError::TransportClosed("no transport available".into()))
    }
}

/// Refuses every dial.
pub struct FailingConnector {
    dials: AtomicUsize,
}

impl FailingConnector {
    pub fn new() -> Self {
        Self {
            dials: AtomicUsize::new(0),
        }
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for FailingConnector {
    async fn connect(&self) -> Result<Transport, StompError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(StompError::TransportClosed("dial refused".into()))
    }
}
