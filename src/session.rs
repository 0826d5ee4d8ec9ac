//! Session layer: one ref-counted shared connection behind any number of
//! client handles, dialed lazily and redialed with linear backoff.
//!
//! A manager task owns the lifecycle. Clients interact through two
//! channels only: an unbounded command channel carrying acquire/release
//! refcount traffic, and a watch channel publishing the current
//! [`SessionState`]. The manager never blocks on a client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::connection::Connection;
use crate::error::StompError;
use crate::subscription::Subscription;
use crate::transport::Connector;

/// Session configuration, passed through to every CONNECT handshake.
#[derive(Debug, Clone)]
pub struct Config {
    /// Value for the CONNECT `host` header.
    pub host: String,
    /// Client heart-beat proposal `(cx, cy)` in milliseconds; `None`
    /// proposes `0,0` (no heartbeats).
    pub heartbeat: Option<(u64, u64)>,
    /// Extra headers appended to the CONNECT frame. A `heart-beat` entry
    /// here overrides the generated one.
    pub connect_headers: Vec<(String, String)>,
    /// Failed attempts tolerated before the session gives up for good.
    /// 0 fails on the first broken dial; negative retries forever.
    pub max_connect_attempts: i32,
    /// Base reconnect delay; the n-th consecutive retry waits n times this.
    pub retry_delay: Duration,
    /// Advisory flag for transports that distinguish text and binary
    /// modes; the TCP connector ignores it.
    pub binary: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "/".to_string(),
            heartbeat: None,
            connect_headers: Vec::new(),
            max_connect_attempts: 10,
            retry_delay: Duration::from_secs(1),
            binary: false,
        }
    }
}

/// Manager state as observed through the client's watch channel.
#[derive(Clone)]
pub enum SessionState {
    /// No leases; nothing dialed.
    Idle,
    /// A dial or handshake is in flight.
    Connecting,
    /// Live connection; `generation` bumps on every successful (re)dial.
    Connected { generation: u64, conn: Connection },
    /// The retry budget ran out. Terminal.
    Failed { attempts: u32 },
}

enum MuxCommand {
    Acquire,
    Release,
}

/// Refcount guard. While at least one lease is alive the manager keeps a
/// connection up; dropping the last one lets it disconnect.
struct Lease {
    commands: mpsc::UnboundedSender<MuxCommand>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.commands.send(MuxCommand::Release);
    }
}

/// Entry point: hands out [`Session`]s backed by one shared connection.
#[derive(Clone)]
pub struct StompClient {
    commands: mpsc::UnboundedSender<MuxCommand>,
    state: watch::Receiver<SessionState>,
}

impl StompClient {
    /// Spawn the manager task. Nothing is dialed until the first
    /// [`acquire`](StompClient::acquire).
    pub fn new(connector: Arc<dyn Connector>, config: Config) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        tokio::spawn(
            Manager {
                connector,
                config,
                commands: command_rx,
                state: state_tx,
                leases: 0,
                generation: 0,
            }
            .run(),
        );
        Self {
            commands: command_tx,
            state: state_rx,
        }
    }

    /// Snapshot of the manager's current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Obtain a session, dialing the shared connection if necessary.
    ///
    /// Resolves once a connection is up. Fails with
    /// [`StompError::ReconnectExhausted`] once the retry budget ran out,
    /// and keeps failing that way on every later call.
    pub async fn acquire(&self) -> Result<Session, StompError> {
        self.commands
            .send(MuxCommand::Acquire)
            .map_err(|_| StompError::NotConnected)?;
        let lease = Arc::new(Lease {
            commands: self.commands.clone(),
        });
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().clone();
            match current {
                SessionState::Connected { generation, conn } => {
                    return Ok(Session {
                        conn,
                        generation,
                        _lease: lease,
                    });
                }
                SessionState::Failed { attempts } => {
                    return Err(StompError::ReconnectExhausted { attempts });
                }
                SessionState::Idle | SessionState::Connecting => {}
            }
            if state.changed().await.is_err() {
                return Err(StompError::NotConnected);
            }
        }
    }

    /// Non-waiting variant of [`acquire`](StompClient::acquire): succeeds
    /// only against an already-live connection, and reports
    /// [`StompError::HandshakeInProgress`] while a dial is in flight
    /// instead of awaiting it.
    pub fn try_acquire(&self) -> Result<Session, StompError> {
        let current = self.state.borrow().clone();
        match current {
            SessionState::Connected { generation, conn } => {
                self.commands
                    .send(MuxCommand::Acquire)
                    .map_err(|_| StompError::NotConnected)?;
                Ok(Session {
                    conn,
                    generation,
                    _lease: Arc::new(Lease {
                        commands: self.commands.clone(),
                    }),
                })
            }
            SessionState::Connecting => Err(StompError::HandshakeInProgress),
            SessionState::Idle => Err(StompError::NotConnected),
            SessionState::Failed { attempts } => Err(StompError::ReconnectExhausted { attempts }),
        }
    }
}

/// One client's handle on the shared connection. Cloning shares the lease.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
    generation: u64,
    _lease: Arc<Lease>,
}

impl Session {
    /// Distinguishes physical connections across reconnects.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The underlying connection handle, for the full command surface.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<(), StompError> {
        self.conn.send(destination, body).await
    }

    pub async fn subscribe(&self, destination: &str) -> Result<Subscription, StompError> {
        self.conn.subscribe(destination).await
    }

    pub async fn subscribe_broadcast(&self, destination: &str) -> Result<Subscription, StompError> {
        self.conn.subscribe_broadcast(destination).await
    }

    pub async fn ack(&self, ack_id: &str, subscription: &str) -> Result<(), StompError> {
        self.conn.ack(ack_id, subscription).await
    }

    pub async fn nack(&self, ack_id: &str, subscription: &str) -> Result<(), StompError> {
        self.conn.nack(ack_id, subscription).await
    }

    pub async fn begin(
        &self,
        transaction: Option<&str>,
    ) -> Result<crate::connection::Transaction, StompError> {
        self.conn.begin(transaction).await
    }

    /// Lazy stream of RECEIPT frames for this physical connection.
    pub fn receipts(&self) -> tokio::sync::broadcast::Receiver<crate::frame::Frame> {
        self.conn.receipts()
    }

    /// Lazy stream of decode errors, server ERROR frames, and the final
    /// transport-closed event for this physical connection.
    pub fn errors(&self) -> tokio::sync::broadcast::Receiver<crate::error::ErrorEvent> {
        self.conn.errors()
    }
}

enum ActiveOutcome {
    /// Last lease released; back to idle.
    Idle,
    /// Retry budget spent.
    Exhausted(u32),
    /// Every client handle is gone.
    Done,
}

enum ConnectOutcome {
    Connected(Connection),
    Failed(StompError),
    Released,
    Done,
}

enum SuperviseOutcome {
    /// Transport died under us.
    Lost,
    Released(Connection),
    Done(Connection),
}

struct Manager {
    connector: Arc<dyn Connector>,
    config: Config,
    commands: mpsc::UnboundedReceiver<MuxCommand>,
    state: watch::Sender<SessionState>,
    leases: usize,
    generation: u64,
}

impl Manager {
    async fn run(mut self) {
        loop {
            if !self.wait_for_lease().await {
                return;
            }
            match self.run_active().await {
                ActiveOutcome::Idle => {}
                ActiveOutcome::Exhausted(attempts) => {
                    tracing::error!(attempts, "retry budget exhausted, giving up");
                    self.state.send_replace(SessionState::Failed { attempts });
                    // terminal: keep answering state queries with Failed
                    while self.commands.recv().await.is_some() {}
                    return;
                }
                ActiveOutcome::Done => return,
            }
        }
    }

    /// Park until someone holds a lease. False when every client is gone.
    async fn wait_for_lease(&mut self) -> bool {
        self.state.send_replace(SessionState::Idle);
        while self.leases == 0 {
            match self.commands.recv().await {
                Some(MuxCommand::Acquire) => self.leases += 1,
                Some(MuxCommand::Release) => {}
                None => return false,
            }
        }
        true
    }

    /// Dial, supervise, and redial until the budget is spent or the last
    /// lease goes away. `generation` survives across calls so sessions can
    /// tell reconnects apart.
    async fn run_active(&mut self) -> ActiveOutcome {
        let mut failures: u32 = 0;
        loop {
            if failures > 0 {
                // linear backoff: the n-th consecutive retry waits n times
                // the base delay
                let delay = self.config.retry_delay * failures;
                tracing::info!(attempt = failures + 1, ?delay, "waiting before reconnect");
                if let Some(outcome) = self.pause(delay).await {
                    return outcome;
                }
            }
            self.state.send_replace(SessionState::Connecting);
            match self.connect_once().await {
                ConnectOutcome::Connected(conn) => {
                    self.generation += 1;
                    failures = 0;
                    tracing::info!(generation = self.generation, "session connected");
                    self.state.send_replace(SessionState::Connected {
                        generation: self.generation,
                        conn: conn.clone(),
                    });
                    match self.supervise(conn).await {
                        SuperviseOutcome::Lost => {
                            // stop advertising the dead connection before
                            // the backoff window opens
                            self.state.send_replace(SessionState::Connecting);
                            // the lost connection counts as a spent attempt
                            failures = 1;
                            if self.exhausted(failures) {
                                return ActiveOutcome::Exhausted(failures);
                            }
                        }
                        SuperviseOutcome::Released(conn) => {
                            if let Err(err) = conn.disconnect().await {
                                tracing::debug!(%err, "disconnect on release");
                            }
                            return ActiveOutcome::Idle;
                        }
                        SuperviseOutcome::Done(conn) => {
                            if let Err(err) = conn.disconnect().await {
                                tracing::debug!(%err, "disconnect on shutdown");
                            }
                            return ActiveOutcome::Done;
                        }
                    }
                }
                ConnectOutcome::Failed(err) => {
                    failures += 1;
                    tracing::warn!(%err, attempt = failures, "connection attempt failed");
                    if self.exhausted(failures) {
                        return ActiveOutcome::Exhausted(failures);
                    }
                }
                ConnectOutcome::Released => return ActiveOutcome::Idle,
                ConnectOutcome::Done => return ActiveOutcome::Done,
            }
        }
    }

    fn exhausted(&self, failures: u32) -> bool {
        let max = self.config.max_connect_attempts;
        max >= 0 && i64::from(failures) > i64::from(max)
    }

    /// Backoff sleep that keeps servicing lease traffic. Returns an
    /// outcome when the wait should be abandoned.
    async fn pause(&mut self, delay: Duration) -> Option<ActiveOutcome> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => match command {
                    Some(MuxCommand::Acquire) => self.leases += 1,
                    Some(MuxCommand::Release) => {
                        self.leases = self.leases.saturating_sub(1);
                        if self.leases == 0 {
                            return Some(ActiveOutcome::Idle);
                        }
                    }
                    None => return Some(ActiveOutcome::Done),
                },
            }
        }
    }

    /// One dial plus handshake, cancellable by the last lease going away.
    async fn connect_once(&mut self) -> ConnectOutcome {
        let connector = self.connector.clone();
        let config = self.config.clone();
        let dial = async move {
            let transport = connector.connect().await?;
            Connection::establish(transport, &config).await
        };
        tokio::pin!(dial);
        loop {
            tokio::select! {
                result = &mut dial => return match result {
                    Ok(conn) => ConnectOutcome::Connected(conn),
                    Err(err) => ConnectOutcome::Failed(err),
                },
                command = self.commands.recv() => match command {
                    Some(MuxCommand::Acquire) => self.leases += 1,
                    Some(MuxCommand::Release) => {
                        self.leases = self.leases.saturating_sub(1);
                        if self.leases == 0 {
                            // dropping the dial future closes the transport
                            return ConnectOutcome::Released;
                        }
                    }
                    None => return ConnectOutcome::Done,
                },
            }
        }
    }

    /// Track the live connection until it dies or the last lease goes.
    async fn supervise(&mut self, conn: Connection) -> SuperviseOutcome {
        let mut closed = conn.closed();
        loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || *closed.borrow() {
                        return SuperviseOutcome::Lost;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(MuxCommand::Acquire) => self.leases += 1,
                    Some(MuxCommand::Release) => {
                        self.leases = self.leases.saturating_sub(1);
                        if self.leases == 0 {
                            return SuperviseOutcome::Released(conn);
                        }
                    }
                    None => return SuperviseOutcome::Done(conn),
                },
            }
        }
    }
}
