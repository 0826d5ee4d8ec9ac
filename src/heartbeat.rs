//! Heartbeat negotiation and liveness monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::WireItem;
use crate::connection::DriverCommand;
use crate::transport::TransportCommand;

/// How much silence the watchdog tolerates, as a multiple of the
/// negotiated incoming interval.
const WATCHDOG_TOLERANCE: u32 = 2;

/// Negotiated heartbeat settings. `None` disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// Interval at which this client must transmit (PING on idle).
    pub outgoing: Option<Duration>,
    /// Interval within which the server must be heard from.
    pub incoming: Option<Duration>,
}

/// Parse a STOMP `heart-beat` header value ("cx,cy", milliseconds).
///
/// Missing or unparseable fields default to 0 (that direction disabled).
pub fn parse_heartbeat(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut field = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    (field(), field())
}

/// Negotiate effective intervals from the client proposal `(cx, cy)` and
/// the server's CONNECTED response `(sx, sy)`.
///
/// A direction is active only when both sides want it (both values
/// non-zero); the effective interval is then the larger of the two.
pub fn negotiate(client: (u64, u64), server: (u64, u64)) -> Heartbeat {
    let direction = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    Heartbeat {
        outgoing: direction(client.0, server.1),
        incoming: direction(client.1, server.0),
    }
}

/// Tracks when each direction of the wire was last active. Readings come
/// from the tokio clock, so paused-time tests see consistent values.
pub(crate) struct ActivityClock {
    epoch: Instant,
    last_rx: AtomicU64,
    last_tx: AtomicU64,
}

impl ActivityClock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_rx: AtomicU64::new(0),
            last_tx: AtomicU64::new(0),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn mark_rx(&self) {
        self.last_rx.store(self.now(), Ordering::SeqCst);
    }

    pub(crate) fn mark_tx(&self) {
        self.last_tx.store(self.now(), Ordering::SeqCst);
    }

    /// Milliseconds since this side last transmitted anything.
    fn tx_idle(&self) -> u64 {
        self.now().saturating_sub(self.last_tx.load(Ordering::SeqCst))
    }

    /// Milliseconds since the server was last heard from.
    fn rx_silence(&self) -> u64 {
        self.now().saturating_sub(self.last_rx.load(Ordering::SeqCst))
    }
}

/// Runs the two heartbeat timers for one connection.
///
/// The pinger sends a `Ping` through the serialized outbound path whenever
/// a full interval has passed since the last actual transmission. The
/// watchdog closes the transport when nothing was heard from the server
/// within the tolerance window. Both effects are channel sends, safe to
/// race with the dispatch path.
pub struct HeartbeatMonitor {
    tasks: Vec<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub(crate) fn start(
        settings: Heartbeat,
        outbound: mpsc::Sender<DriverCommand>,
        transport: mpsc::Sender<TransportCommand>,
        clock: Arc<ActivityClock>,
    ) -> Self {
        let mut tasks = Vec::new();

        if let Some(interval) = settings.outgoing {
            let millis = interval.as_millis() as u64;
            let clock = clock.clone();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    if clock.tx_idle() >= millis
                        && outbound
                            .send(DriverCommand::Item(WireItem::Ping))
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        if let Some(interval) = settings.incoming {
            let limit = interval.as_millis() as u64 * u64::from(WATCHDOG_TOLERANCE);
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval);
                loop {
                    tick.tick().await;
                    let silence = clock.rx_silence();
                    if silence > limit {
                        tracing::warn!(silence_ms = silence, "heartbeat watchdog: peer is dead");
                        let _ = transport.send(TransportCommand::Close).await;
                        break;
                    }
                }
            }));
        }

        Self { tasks }
    }

    /// Cancel both timers. Idempotent and safe on a never-started monitor.
    pub(crate) fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
