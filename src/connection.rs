//! Connection handler: one instance per physical transport.
//!
//! [`Connection::establish`] drives the CONNECT/CONNECTED handshake, then
//! hands the transport to a single driver task that serializes every
//! outbound write and dispatches every inbound frame. Command methods are
//! thin marshal-and-transmit operations that fail with
//! [`StompError::NotConnected`] once the transport is gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{StompCodec, WireItem};
use crate::error::{ErrorEvent, StompError};
use crate::frame::Frame;
use crate::heartbeat::{ActivityClock, HeartbeatMonitor, negotiate, parse_heartbeat};
use crate::session::Config;
use crate::subscription::{
    Delivery, Message, Registry, Subscription, SubscriptionKind, next_subscription_id,
};
use crate::transport::{Transport, TransportCommand, TransportEvent};

/// Protocol versions offered in `accept-version`.
pub(crate) const SUPPORTED_VERSIONS: &str = "1.0,1.1,1.2";

/// Outbound wire payloads are split into chunks of at most this many
/// bytes; the transport contract keeps sequential sends ordered, so large
/// frame bodies survive per-message transport limits.
pub const MAX_WIRE_CHUNK: usize = 16 * 1024;

/// Negotiated STOMP protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
    V1_2,
}

impl ProtocolVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
            ProtocolVersion::V1_2 => "1.2",
        }
    }

    /// A CONNECTED frame without a `version` header is a STOMP 1.0 server.
    fn from_connected(header: Option<&str>) -> Self {
        match header {
            Some("1.2") => ProtocolVersion::V1_2,
            Some("1.1") => ProtocolVersion::V1_1,
            _ => ProtocolVersion::V1_0,
        }
    }
}

/// Commands consumed by the driver task.
pub(crate) enum DriverCommand {
    Item(WireItem),
    /// Close the transport after everything queued before this was written.
    Shutdown,
}

/// Split `payload` into ordered `MAX_WIRE_CHUNK`-sized transport sends.
pub(crate) async fn transmit(
    commands: &mpsc::Sender<TransportCommand>,
    mut payload: Bytes,
) -> Result<(), StompError> {
    loop {
        let chunk = if payload.len() > MAX_WIRE_CHUNK {
            payload.split_to(MAX_WIRE_CHUNK)
        } else {
            std::mem::take(&mut payload)
        };
        commands
            .send(TransportCommand::Send(chunk))
            .await
            .map_err(|_| StompError::TransportClosed("transport writer gone".into()))?;
        if payload.is_empty() {
            return Ok(());
        }
    }
}

/// Cloneable handle to one established connection.
#[derive(Clone)]
pub struct Connection {
    outbound: mpsc::Sender<DriverCommand>,
    registry: Arc<Mutex<Registry>>,
    version: ProtocolVersion,
    alive: Arc<AtomicBool>,
    sub_counter: Arc<AtomicU64>,
    tx_counter: Arc<AtomicU64>,
    receipt_counter: Arc<AtomicU64>,
    receipts: broadcast::Sender<Frame>,
    errors: broadcast::Sender<ErrorEvent>,
    closed: watch::Receiver<bool>,
}

impl Connection {
    /// Drive the CONNECT/CONNECTED handshake over a fresh transport.
    ///
    /// Injects `accept-version`, `host`, and (unless the caller supplied
    /// one in `connect_headers`) the configured `heart-beat` proposal into
    /// the CONNECT frame. Resolves once CONNECTED arrives; an ERROR frame
    /// instead fails with [`StompError::Server`]. Dropping the returned
    /// future mid-handshake drops the transport, which closes it.
    pub async fn establish(transport: Transport, config: &Config) -> Result<Self, StompError> {
        let (commands, mut events) = transport.split();
        let mut codec = StompCodec::new();
        let mut buf = BytesMut::new();

        let client_hb = config.heartbeat.unwrap_or((0, 0));
        let mut connect = Frame::new("CONNECT")
            .header("accept-version", SUPPORTED_VERSIONS)
            .header("host", &config.host);
        if !config.connect_headers.iter().any(|(k, _)| k == "heart-beat") {
            connect = connect.header("heart-beat", format!("{},{}", client_hb.0, client_hb.1));
        }
        for (key, value) in &config.connect_headers {
            connect = connect.header(key.clone(), value.clone());
        }

        let mut out = BytesMut::new();
        codec.encode(WireItem::Frame(connect), &mut out)?;
        transmit(&commands, out.freeze()).await?;

        let connected = 'handshake: loop {
            match events.recv().await {
                Some(TransportEvent::Data(chunk)) => {
                    buf.extend_from_slice(&chunk);
                    loop {
                        match codec.decode(&mut buf) {
                            Ok(Some(WireItem::Ping)) => {}
                            Ok(Some(WireItem::Frame(frame))) => match frame.command.as_str() {
                                "CONNECTED" => break 'handshake frame,
                                "ERROR" => {
                                    let detail = frame
                                        .get_header("message")
                                        .map(str::to_string)
                                        .unwrap_or_else(|| {
                                            String::from_utf8_lossy(&frame.body).into_owned()
                                        });
                                    return Err(StompError::Server(detail));
                                }
                                other => {
                                    tracing::debug!(
                                        command = other,
                                        "ignoring frame before CONNECTED"
                                    );
                                }
                            },
                            Ok(None) => break,
                            Err(err) => return Err(StompError::Decode(err.to_string())),
                        }
                    }
                }
                Some(TransportEvent::Closed { reason }) => {
                    return Err(StompError::TransportClosed(reason));
                }
                None => return Err(StompError::TransportClosed("transport dropped".into())),
            }
        };

        let version = ProtocolVersion::from_connected(connected.get_header("version"));
        let server_hb = parse_heartbeat(connected.get_header("heart-beat").unwrap_or("0,0"));
        let settings = negotiate(client_hb, server_hb);
        tracing::debug!(version = version.as_str(), ?settings, "connection established");

        let (outbound, out_rx) = mpsc::channel::<DriverCommand>(32);
        let clock = Arc::new(ActivityClock::new());
        let monitor =
            HeartbeatMonitor::start(settings, outbound.clone(), commands.clone(), clock.clone());
        let (closed_tx, closed_rx) = watch::channel(false);
        let (receipts, _) = broadcast::channel(32);
        let (errors, _) = broadcast::channel(32);

        let conn = Connection {
            outbound,
            registry: Arc::new(Mutex::new(Registry::new())),
            version,
            alive: Arc::new(AtomicBool::new(true)),
            sub_counter: Arc::new(AtomicU64::new(0)),
            tx_counter: Arc::new(AtomicU64::new(0)),
            receipt_counter: Arc::new(AtomicU64::new(0)),
            receipts,
            errors,
            closed: closed_rx,
        };

        tokio::spawn(
            Driver {
                conn: conn.clone(),
                commands,
                events,
                out_rx,
                codec,
                buf,
                clock,
                monitor,
                closed_tx,
            }
            .run(),
        );

        Ok(conn)
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Watch that flips to `true` exactly once, when the transport closes.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    /// Lazy stream of inbound RECEIPT frames.
    pub fn receipts(&self) -> broadcast::Receiver<Frame> {
        self.receipts.subscribe()
    }

    /// Lazy stream of decode errors, server ERROR frames, and the final
    /// transport-closed event.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<(), StompError> {
        if !self.is_connected() {
            return Err(StompError::NotConnected);
        }
        self.outbound
            .send(DriverCommand::Item(WireItem::Frame(frame)))
            .await
            .map_err(|_| StompError::NotConnected)
    }

    /// Best-effort enqueue for drop-path teardown, where awaiting is not
    /// an option.
    pub(crate) fn enqueue_detached(&self, frame: Frame) {
        if !self.is_connected() {
            return;
        }
        if self
            .outbound
            .try_send(DriverCommand::Item(WireItem::Frame(frame)))
            .is_err()
        {
            tracing::debug!("outbound queue unavailable, dropping teardown frame");
        }
    }

    /// SEND a body to a destination.
    pub async fn send(&self, destination: &str, body: impl Into<Vec<u8>>) -> Result<(), StompError> {
        self.send_with_headers(destination, Vec::new(), body).await
    }

    pub async fn send_with_headers(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), StompError> {
        let mut frame = Frame::new("SEND").header("destination", destination);
        for (key, value) in headers {
            frame = frame.header(key, value);
        }
        self.enqueue(frame.set_body(body)).await
    }

    /// SEND with a `receipt` header; the returned receipt id shows up on
    /// [`receipts`](Connection::receipts) when the server confirms.
    pub async fn send_with_receipt(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
        body: impl Into<Vec<u8>>,
    ) -> Result<String, StompError> {
        let receipt = format!("rcpt-{}", self.receipt_counter.fetch_add(1, Ordering::SeqCst));
        let mut headers = headers;
        headers.push(("receipt".to_string(), receipt.clone()));
        self.send_with_headers(destination, headers, body).await?;
        Ok(receipt)
    }

    /// Open an exclusive subscription to `destination`.
    pub async fn subscribe(&self, destination: &str) -> Result<Subscription, StompError> {
        self.subscribe_with_headers(destination, Vec::new()).await
    }

    pub async fn subscribe_with_headers(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
    ) -> Result<Subscription, StompError> {
        if !self.is_connected() {
            return Err(StompError::NotConnected);
        }
        let id = next_subscription_id(&self.sub_counter);
        let (sender, receiver) = mpsc::channel(16);
        self.registry().insert_exclusive(id.clone(), sender);

        let mut frame = Frame::new("SUBSCRIBE")
            .header("id", &id)
            .header("destination", destination);
        for (key, value) in headers {
            frame = frame.header(key, value);
        }
        if let Err(err) = self.enqueue(frame).await {
            self.registry().remove_exclusive(&id);
            return Err(err);
        }
        Ok(Subscription::new(
            id,
            destination.to_string(),
            receiver,
            self.clone(),
            SubscriptionKind::Exclusive,
        ))
    }

    /// Subscribe in broadcast mode: listeners on the same destination
    /// share one wire-level SUBSCRIBE, torn down when the last one goes.
    pub async fn subscribe_broadcast(&self, destination: &str) -> Result<Subscription, StompError> {
        self.subscribe_broadcast_with_headers(destination, Vec::new())
            .await
    }

    pub async fn subscribe_broadcast_with_headers(
        &self,
        destination: &str,
        headers: Vec<(String, String)>,
    ) -> Result<Subscription, StompError> {
        if !self.is_connected() {
            return Err(StompError::NotConnected);
        }
        let (sender, receiver) = mpsc::channel(16);
        let attach = self
            .registry()
            .attach_broadcast(destination, sender, &self.sub_counter);
        if attach.created {
            let mut frame = Frame::new("SUBSCRIBE")
                .header("id", &attach.id)
                .header("destination", destination);
            for (key, value) in headers {
                frame = frame.header(key, value);
            }
            if let Err(err) = self.enqueue(frame).await {
                self.registry().detach_broadcast(&attach.id, attach.token);
                return Err(err);
            }
        }
        Ok(Subscription::new(
            attach.id,
            destination.to_string(),
            receiver,
            self.clone(),
            SubscriptionKind::Broadcast {
                token: attach.token,
            },
        ))
    }

    /// Drop a route; returns the UNSUBSCRIBE frame to transmit when this
    /// was the last listener on the id.
    pub(crate) fn release_route(&self, id: &str, kind: &SubscriptionKind) -> Option<Frame> {
        let due = match kind {
            SubscriptionKind::Exclusive => self.registry().remove_exclusive(id),
            SubscriptionKind::Broadcast { token } => self.registry().detach_broadcast(id, *token),
        };
        due.then(|| Frame::new("UNSUBSCRIBE").header("id", id))
    }

    /// Acknowledge a message. `ack_id` is the frame's `ack` header value
    /// on STOMP 1.2 and its `message-id` on earlier versions.
    pub async fn ack(&self, ack_id: &str, subscription: &str) -> Result<(), StompError> {
        self.ack_with_headers(ack_id, subscription, Vec::new()).await
    }

    pub async fn ack_with_headers(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), StompError> {
        self.enqueue(self.acknowledgment("ACK", ack_id, subscription, headers))
            .await
    }

    pub async fn nack(&self, ack_id: &str, subscription: &str) -> Result<(), StompError> {
        self.nack_with_headers(ack_id, subscription, Vec::new()).await
    }

    pub async fn nack_with_headers(
        &self,
        ack_id: &str,
        subscription: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(), StompError> {
        self.enqueue(self.acknowledgment("NACK", ack_id, subscription, headers))
            .await
    }

    fn acknowledgment(
        &self,
        command: &str,
        ack_id: &str,
        subscription: &str,
        extra: Vec<(String, String)>,
    ) -> Frame {
        let mut frame = Frame::new(command);
        frame = match self.version {
            ProtocolVersion::V1_2 => frame.header("id", ack_id),
            ProtocolVersion::V1_1 => frame
                .header("message-id", ack_id)
                .header("subscription", subscription),
            ProtocolVersion::V1_0 => frame.header("message-id", ack_id),
        };
        for (key, value) in extra {
            frame = frame.header(key, value);
        }
        frame
    }

    /// BEGIN a transaction. With no id supplied, one is generated from a
    /// per-connection `tx-<n>` counter.
    pub async fn begin(&self, transaction: Option<&str>) -> Result<Transaction, StompError> {
        let id = match transaction {
            Some(id) => id.to_string(),
            None => format!("tx-{}", self.tx_counter.fetch_add(1, Ordering::SeqCst)),
        };
        self.enqueue(Frame::new("BEGIN").header("transaction", &id))
            .await?;
        Ok(Transaction {
            id,
            conn: self.clone(),
        })
    }

    pub async fn commit(&self, transaction: &str) -> Result<(), StompError> {
        self.enqueue(Frame::new("COMMIT").header("transaction", transaction))
            .await
    }

    pub async fn abort(&self, transaction: &str) -> Result<(), StompError> {
        self.enqueue(Frame::new("ABORT").header("transaction", transaction))
            .await
    }

    /// Transmit DISCONNECT and close the transport right behind it,
    /// without waiting for a server acknowledgment.
    pub async fn disconnect(&self) -> Result<(), StompError> {
        if !self.is_connected() {
            return Err(StompError::NotConnected);
        }
        self.outbound
            .send(DriverCommand::Item(WireItem::Frame(Frame::new(
                "DISCONNECT",
            ))))
            .await
            .map_err(|_| StompError::NotConnected)?;
        self.outbound
            .send(DriverCommand::Shutdown)
            .await
            .map_err(|_| StompError::NotConnected)
    }
}

/// Convenience handle for one STOMP transaction.
pub struct Transaction {
    id: String,
    conn: Connection,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// SEND within this transaction.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), StompError> {
        self.conn
            .send_with_headers(
                destination,
                vec![("transaction".to_string(), self.id.clone())],
                body,
            )
            .await
    }

    pub async fn commit(self) -> Result<(), StompError> {
        self.conn.commit(&self.id).await
    }

    pub async fn abort(self) -> Result<(), StompError> {
        self.conn.abort(&self.id).await
    }
}

/// The single task that owns the transport: every outbound write and
/// every inbound dispatch goes through here, which is what keeps the
/// partial buffer and the registry free of finer-grained locking.
struct Driver {
    conn: Connection,
    commands: mpsc::Sender<TransportCommand>,
    events: mpsc::Receiver<TransportEvent>,
    out_rx: mpsc::Receiver<DriverCommand>,
    codec: StompCodec,
    buf: BytesMut,
    clock: Arc<ActivityClock>,
    monitor: HeartbeatMonitor,
    closed_tx: watch::Sender<bool>,
}

impl Driver {
    async fn run(mut self) {
        // frames that arrived in the same chunk as CONNECTED
        self.drain_frames();
        let reason = loop {
            tokio::select! {
                command = self.out_rx.recv() => match command {
                    Some(DriverCommand::Item(item)) => {
                        if let Err(reason) = self.write(item).await {
                            break reason;
                        }
                    }
                    Some(DriverCommand::Shutdown) | None => {
                        let _ = self.commands.send(TransportCommand::Close).await;
                        break self.await_close().await;
                    }
                },
                event = self.events.recv() => match event {
                    Some(TransportEvent::Data(chunk)) => {
                        self.clock.mark_rx();
                        self.buf.extend_from_slice(&chunk);
                        self.drain_frames();
                    }
                    Some(TransportEvent::Closed { reason }) => break reason,
                    None => break "transport dropped".to_string(),
                },
            }
        };
        self.finish(reason);
    }

    async fn write(&mut self, item: WireItem) -> Result<(), String> {
        let mut out = BytesMut::new();
        if let Err(err) = self.codec.encode(item, &mut out) {
            tracing::warn!(%err, "failed to encode outbound frame");
            return Ok(());
        }
        transmit(&self.commands, out.freeze())
            .await
            .map_err(|_| "transport writer gone".to_string())?;
        self.clock.mark_tx();
        Ok(())
    }

    /// Wait for the transport's final Closed acknowledgment after a
    /// Shutdown; data arriving after DISCONNECT is dropped.
    async fn await_close(&mut self) -> String {
        loop {
            match self.events.recv().await {
                Some(TransportEvent::Data(_)) => {}
                Some(TransportEvent::Closed { reason }) => return reason,
                None => return "transport dropped".to_string(),
            }
        }
    }

    fn drain_frames(&mut self) {
        loop {
            match self.codec.decode(&mut self.buf) {
                // liveness was already recorded when the bytes arrived
                Ok(Some(WireItem::Ping)) => {}
                Ok(Some(WireItem::Frame(frame))) => self.dispatch(frame),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(%err, "malformed inbound frame");
                    let _ = self.conn.errors.send(ErrorEvent::Decode(err.to_string()));
                    // resynchronize at the next frame boundary
                    match self.buf.iter().position(|&b| b == 0) {
                        Some(pos) => self.buf.advance(pos + 1),
                        None => {
                            self.buf.clear();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.command.as_str() {
            "MESSAGE" => {
                let Some(id) = frame.get_header("subscription").map(str::to_string) else {
                    tracing::debug!("dropping MESSAGE without subscription header");
                    return;
                };
                let ack_id = match self.conn.version {
                    ProtocolVersion::V1_2 => frame.get_header("ack"),
                    _ => frame.get_header("message-id"),
                }
                .map(str::to_string);
                let message = Message::new(frame, id.clone(), ack_id, self.conn.clone());
                match self.conn.registry().deliver(&id, message) {
                    Delivery::Routed => {}
                    Delivery::Backlogged => {
                        tracing::warn!(subscription = %id, "subscription buffer full, dropping MESSAGE");
                        let _ = self
                            .conn
                            .errors
                            .send(ErrorEvent::MessageDropped { subscription: id });
                    }
                    Delivery::NoRoute => {
                        tracing::debug!(subscription = %id, "no sink registered, dropping MESSAGE");
                    }
                }
            }
            "RECEIPT" => {
                let _ = self.conn.receipts.send(frame);
            }
            "ERROR" => {
                tracing::warn!(
                    detail = frame.get_header("message").unwrap_or(""),
                    "server ERROR frame"
                );
                let _ = self.conn.errors.send(ErrorEvent::Server(frame));
            }
            other => tracing::debug!(command = other, "ignoring unsupported frame"),
        }
    }

    fn finish(mut self, reason: String) {
        self.monitor.stop();
        self.conn.alive.store(false, Ordering::SeqCst);
        let _ = self
            .conn
            .errors
            .send(ErrorEvent::TransportClosed(reason.clone()));
        let _ = self.closed_tx.send(true);
        tracing::debug!(%reason, "connection closed");
    }
}
