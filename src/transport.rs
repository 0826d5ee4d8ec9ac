//! Pluggable byte transports.
//!
//! The protocol core needs three things from a transport: ordered sends,
//! a close, and a stream of inbound events. [`pair`] builds the two halves
//! of that contract: the core-facing [`Transport`] handle and the
//! implementor-facing [`TransportPeer`], which a concrete transport (TCP,
//! WebSocket, an in-process mock) bridges to its socket.
//!
//! Contract for implementors: sequential `Send` commands must reach the
//! peer in order, and after a `Close` command (or after the command
//! receiver is dropped) the implementation must emit a final
//! [`TransportEvent::Closed`] or drop its event sender, so the connection
//! driver observes the shutdown.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::StompError;

/// Inbound transport events, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A chunk of received bytes; chunk boundaries carry no meaning.
    Data(Bytes),
    /// The transport is gone. Always the final event.
    Closed { reason: String },
}

/// Commands from the core to the transport implementation.
#[derive(Debug)]
pub enum TransportCommand {
    /// Write these bytes, preserving order with respect to earlier sends.
    Send(Bytes),
    /// Shut the transport down.
    Close,
}

/// Core-facing handle to one physical transport.
#[derive(Debug)]
pub struct Transport {
    commands: mpsc::Sender<TransportCommand>,
    events: mpsc::Receiver<TransportEvent>,
}

/// Implementor-facing half produced by [`pair`]: consume `commands`,
/// produce `events`.
#[derive(Debug)]
pub struct TransportPeer {
    pub commands: mpsc::Receiver<TransportCommand>,
    pub events: mpsc::Sender<TransportEvent>,
}

/// Build a connected [`Transport`]/[`TransportPeer`] pair with the given
/// channel capacity.
pub fn pair(buffer: usize) -> (Transport, TransportPeer) {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (event_tx, event_rx) = mpsc::channel(buffer);
    (
        Transport {
            commands: command_tx,
            events: event_rx,
        },
        TransportPeer {
            commands: command_rx,
            events: event_tx,
        },
    )
}

impl Transport {
    /// Send one ordered payload.
    pub async fn send(&self, payload: Bytes) -> Result<(), StompError> {
        self.commands
            .send(TransportCommand::Send(payload))
            .await
            .map_err(|_| StompError::TransportClosed("transport task gone".into()))
    }

    /// Request an orderly close. The final `Closed` event follows.
    pub async fn close(&self) {
        let _ = self.commands.send(TransportCommand::Close).await;
    }

    /// Next inbound event, or `None` once the implementation dropped its
    /// event sender.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    pub(crate) fn split(
        self,
    ) -> (
        mpsc::Sender<TransportCommand>,
        mpsc::Receiver<TransportEvent>,
    ) {
        (self.commands, self.events)
    }
}

/// Dials one physical transport per call. The reconnect layer goes through
/// this seam, so swapping TCP for WebSocket or an in-process mock is a
/// matter of implementing one method.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Transport, StompError>;
}

/// Production connector over a plain `tokio::net::TcpStream`.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Transport, StompError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (mut read_half, mut write_half) = stream.into_split();
        let (transport, peer) = pair(32);
        let TransportPeer {
            mut commands,
            events,
        } = peer;

        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events
                            .send(TransportEvent::Closed {
                                reason: "peer closed".into(),
                            })
                            .await;
                        break;
                    }
                    Ok(n) => {
                        if events
                            .send(TransportEvent::Data(Bytes::copy_from_slice(&buf[..n])))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = events
                            .send(TransportEvent::Closed {
                                reason: err.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match commands.recv().await {
                    Some(TransportCommand::Send(payload)) => {
                        if write_half.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        let _ = write_half.shutdown().await;
                        break;
                    }
                }
            }
        });

        Ok(transport)
    }
}
