//! Reconnecting, framed connection to the server.
//!
//! The transport runs as its own task. It walks the connection state
//! machine
//!
//! ```text
//! disconnected -> connecting -> authenticating -> active
//!                      ^                            |
//!                      +-------- retrying <---------+
//! ```
//!
//! publishing every transition on a `watch` channel and reporting sessions,
//! inbound messages and failures as [`TransportEvent`]s. Outbound messages
//! go through the bounded queue of the current [`Session`], so a slow
//! connection pushes back on the sender.

mod backoff;
mod codec;
mod socket;

pub use backoff::Backoff;
pub use codec::WireCodec;
pub use socket::{BoxedSocket, Socket, SocketFactory, TcpSocketFactory};

use crate::config::{BackoffConfig, SatelliteConfig, MIN_PING_INTERVAL};
use crate::error::{SatelliteError, SatelliteResult};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::{Auth, AuthResponse, Ping, Pong, RejectCode, ReplicaId, WireMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state, owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying to.
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Waiting for the server to accept the session.
    Authenticating,
    /// Session established.
    Active,
    /// Waiting before the next connection attempt.
    Retrying,
}

impl ConnectionState {
    /// Returns true once a session is established.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Active => "active",
            ConnectionState::Retrying => "retrying",
        };
        f.write_str(name)
    }
}

/// Settings for one transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server endpoint.
    pub endpoint: String,
    /// Token sent in `Auth`.
    pub auth_token: String,
    /// Replica announced in `Auth`.
    pub replica_id: ReplicaId,
    /// Protocol version announced in `Auth`.
    pub protocol_version: u16,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Timeout for opening the socket.
    pub connect_timeout: Duration,
    /// Timeout for the auth handshake.
    pub auth_timeout: Duration,
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after which the connection is dropped.
    pub liveness_timeout: Duration,
    /// Auth rejections before giving up.
    pub auth_rejection_limit: u32,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
}

impl TransportConfig {
    /// Derives transport settings from a satellite configuration.
    pub fn from_satellite(config: &SatelliteConfig, replica_id: ReplicaId) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            auth_token: config.auth_token.clone(),
            replica_id,
            protocol_version: config.protocol_version,
            backoff: config.backoff.clone(),
            connect_timeout: config.connect_timeout,
            auth_timeout: config.auth_timeout,
            ping_interval: config.ping_interval.max(MIN_PING_INTERVAL),
            liveness_timeout: config.liveness_timeout.max(MIN_PING_INTERVAL),
            auth_rejection_limit: config.auth_rejection_limit.max(1),
            outbound_capacity: config.max_in_flight + 64,
        }
    }
}

/// Something the transport wants its owner to know.
#[derive(Debug)]
pub enum TransportEvent {
    /// A session was authenticated.
    Activated(Session),
    /// A message arrived on the current session.
    Message(WireMessage),
    /// The current session ended; the transport is reconnecting.
    SessionLost,
    /// A reconnect is scheduled after `delay`.
    Retrying {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// The transport gave up; no further events follow.
    Failed(SatelliteError),
}

/// Sending half of an authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    id: u64,
    sender: mpsc::Sender<WireMessage>,
    /// Schema version reported by the server.
    pub schema_version: u32,
    /// Protocol version agreed with the server.
    pub protocol_version: u16,
}

impl Session {
    /// Session number, increasing with every authentication.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a message, waiting while the queue is full.
    pub async fn send(&self, message: WireMessage) -> SatelliteResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SatelliteError::transport_retryable("session closed"))
    }

    /// Returns true once the session has ended.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Handle to a running transport task.
pub struct Transport {
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Spawns the transport task and starts connecting.
    pub fn connect(
        config: TransportConfig,
        factory: Arc<dyn SocketFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = Worker {
            backoff: Backoff::new(config.backoff.clone()),
            config,
            factory,
            state: state_tx,
            events: events_tx,
            cancel: cancel.clone(),
            rejections: 0,
            sessions: 0,
        };
        let task = tokio::spawn(worker.run());
        (
            Self {
                state,
                cancel,
                task: Mutex::new(Some(task)),
            },
            events,
        )
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver for state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Closes the connection and waits for the task to finish.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "transport task ended abnormally");
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Cancelled,
    Retry(SatelliteError),
    Fatal(SatelliteError),
}

type Connection = Framed<BoxedSocket, WireCodec>;

struct Worker {
    config: TransportConfig,
    factory: Arc<dyn SocketFactory>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
    backoff: Backoff,
    rejections: u32,
    sessions: u64,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() || self.events.is_closed() {
                break;
            }
            match self.attempt().await {
                Outcome::Cancelled => break,
                Outcome::Fatal(err) => {
                    error!(endpoint = %self.config.endpoint, error = %err, "transport failed");
                    self.emit(TransportEvent::Failed(err));
                    break;
                }
                Outcome::Retry(err) => {
                    let delay = self.backoff.next_delay();
                    let attempt = self.backoff.attempt();
                    self.set_state(ConnectionState::Retrying);
                    warn!(
                        endpoint = %self.config.endpoint,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "connection failed, retrying"
                    );
                    self.emit(TransportEvent::Retrying { attempt, delay });
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn attempt(&mut self) -> Outcome {
        self.set_state(ConnectionState::Connecting);
        let connect = timeout(
            self.config.connect_timeout,
            self.factory.connect(&self.config.endpoint),
        );
        let socket = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            result = connect => match result {
                Ok(Ok(socket)) => socket,
                Ok(Err(err)) => return Outcome::Retry(err.into()),
                Err(_) => return Outcome::Retry(SatelliteError::Timeout("connect".into())),
            },
        };

        let mut conn = Framed::new(socket, WireCodec);
        self.set_state(ConnectionState::Authenticating);
        let auth = WireMessage::Auth(Auth {
            token: self.config.auth_token.clone(),
            replica_id: self.config.replica_id,
            protocol_version: self.config.protocol_version,
        });
        if let Err(outcome) = self.write(&mut conn, auth, self.config.auth_timeout).await {
            return outcome;
        }

        let handshake = timeout(self.config.auth_timeout, await_auth(&mut conn));
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Cancelled,
            result = handshake => match result {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Outcome::Retry(err),
                Err(_) => return Outcome::Retry(SatelliteError::Timeout("authentication".into())),
            },
        };

        match response {
            AuthResponse::Accepted {
                protocol_version,
                schema_version,
            } => {
                if protocol_version != self.config.protocol_version {
                    return Outcome::Fatal(SatelliteError::ProtocolMismatch(format!(
                        "server speaks {protocol_version}, client speaks {}",
                        self.config.protocol_version
                    )));
                }
                self.backoff.reset();
                self.rejections = 0;
                self.sessions += 1;

                let (sender, outbound) = mpsc::channel(self.config.outbound_capacity.max(1));
                self.set_state(ConnectionState::Active);
                info!(
                    endpoint = %self.config.endpoint,
                    session = self.sessions,
                    schema_version,
                    "session established"
                );
                self.emit(TransportEvent::Activated(Session {
                    id: self.sessions,
                    sender,
                    schema_version,
                    protocol_version,
                }));

                let outcome = self.drive(conn, outbound).await;
                if matches!(outcome, Outcome::Retry(_)) {
                    self.emit(TransportEvent::SessionLost);
                }
                outcome
            }
            AuthResponse::Rejected {
                reason,
                code: RejectCode::ProtocolMismatch,
            } => Outcome::Fatal(SatelliteError::ProtocolMismatch(reason)),
            AuthResponse::Rejected {
                reason,
                code: RejectCode::InvalidToken,
            } => {
                self.rejections += 1;
                if self.rejections >= self.config.auth_rejection_limit {
                    Outcome::Fatal(SatelliteError::Auth(reason))
                } else {
                    Outcome::Retry(SatelliteError::Auth(reason))
                }
            }
        }
    }

    async fn drive(
        &mut self,
        mut conn: Connection,
        mut outbound: mpsc::Receiver<WireMessage>,
    ) -> Outcome {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut nonce = 0u64;
        let mut last_seen = Instant::now();
        let limit = self.config.liveness_timeout;

        loop {
            let deadline = last_seen + self.config.liveness_timeout;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if let Err(err) = conn.close().await {
                        debug!(error = %err, "error closing connection");
                    }
                    return Outcome::Cancelled;
                }
                inbound = conn.next() => match inbound {
                    None => return Outcome::Retry(SatelliteError::transport_retryable("connection closed by server")),
                    Some(Err(err)) => return Outcome::Retry(err),
                    Some(Ok(message)) => {
                        last_seen = Instant::now();
                        match message {
                            WireMessage::Ping(Ping { nonce }) => {
                                let pong = WireMessage::Pong(Pong { nonce });
                                if let Err(outcome) = self.write(&mut conn, pong, limit).await {
                                    return outcome;
                                }
                            }
                            WireMessage::Pong(_) => {}
                            message => {
                                if self.events.send(TransportEvent::Message(message)).is_err() {
                                    return Outcome::Cancelled;
                                }
                            }
                        }
                    }
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(outcome) = self.write(&mut conn, message, limit).await {
                            return outcome;
                        }
                    }
                    None => {
                        debug!("all session handles dropped, closing");
                        return Outcome::Cancelled;
                    }
                },
                _ = ping.tick() => {
                    nonce += 1;
                    let ping = WireMessage::Ping(Ping { nonce });
                    if let Err(outcome) = self.write(&mut conn, ping, limit).await {
                        return outcome;
                    }
                }
                _ = sleep_until(deadline) => {
                    return Outcome::Retry(SatelliteError::Timeout("liveness".into()));
                }
            }
        }
    }

    /// Sends one frame. A peer that stops reading fills the socket buffer;
    /// the send then times out after `limit` and the session is retried.
    async fn write(
        &self,
        conn: &mut Connection,
        message: WireMessage,
        limit: Duration,
    ) -> Result<(), Outcome> {
        let send = timeout(limit, conn.send(message));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Outcome::Cancelled),
            result = send => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Outcome::Retry(err)),
                Err(_) => Err(Outcome::Retry(SatelliteError::Timeout("send".into()))),
            },
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(endpoint = %self.config.endpoint, from = %previous, to = %state, "connection state");
        }
    }

    fn emit(&self, event: TransportEvent) {
        // A closed receiver means the owner is gone; the run loop notices.
        let _ = self.events.send(event);
    }
}

/// Waits for `AuthResponse`, answering pings meanwhile.
async fn await_auth(conn: &mut Connection) -> SatelliteResult<AuthResponse> {
    loop {
        match conn.next().await {
            None => {
                return Err(SatelliteError::transport_retryable(
                    "connection closed during authentication",
                ))
            }
            Some(Err(err)) => return Err(err),
            Some(Ok(WireMessage::AuthResponse(response))) => return Ok(response),
            Some(Ok(WireMessage::Ping(Ping { nonce }))) => {
                conn.send(WireMessage::Pong(Pong { nonce })).await?;
            }
            Some(Ok(other)) => {
                return Err(SatelliteError::Protocol(format!(
                    "unexpected {} before authentication",
                    other.name()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tether_protocol::{Ack, TransactionId};
    use tokio::io::DuplexStream;

    type ServerConn = Framed<DuplexStream, WireCodec>;

    /// Hands each accepted connection's server end to the test.
    #[derive(Debug)]
    struct DuplexFactory {
        accepted: mpsc::UnboundedSender<ServerConn>,
        refuse: AtomicU32,
        buffer: usize,
    }

    #[async_trait]
    impl SocketFactory for DuplexFactory {
        async fn connect(&self, _endpoint: &str) -> io::Result<BoxedSocket> {
            if self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            let (client, server) = tokio::io::duplex(self.buffer);
            self.accepted
                .send(Framed::new(server, WireCodec))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "test ended"))?;
            Ok(Box::new(client))
        }
    }

    fn factory(refuse: u32) -> (Arc<DuplexFactory>, mpsc::UnboundedReceiver<ServerConn>) {
        buffered_factory(refuse, 64 * 1024)
    }

    fn buffered_factory(
        refuse: u32,
        buffer: usize,
    ) -> (Arc<DuplexFactory>, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Arc::new(DuplexFactory {
                accepted,
                refuse: AtomicU32::new(refuse),
                buffer,
            }),
            rx,
        )
    }

    fn config() -> TransportConfig {
        let mut config = TransportConfig::from_satellite(
            &SatelliteConfig::new("loopback", "secret"),
            ReplicaId::new([3; 16]),
        );
        config.backoff = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(2))
            .with_jitter(0.0);
        config
    }

    async fn accept(server: &mut ServerConn, response: AuthResponse) -> Auth {
        let auth = match server.next().await.unwrap().unwrap() {
            WireMessage::Auth(auth) => auth,
            other => panic!("expected Auth, got {other:?}"),
        };
        server.send(WireMessage::AuthResponse(response)).await.unwrap();
        auth
    }

    fn accepted(schema_version: u32) -> AuthResponse {
        AuthResponse::Accepted {
            protocol_version: tether_protocol::PROTOCOL_VERSION,
            schema_version,
        }
    }

    #[tokio::test]
    async fn session_carries_messages_both_ways() {
        let (factory, mut conns) = factory(0);
        let (transport, mut events) = Transport::connect(config(), factory);

        let mut server = conns.recv().await.unwrap();
        let auth = accept(&mut server, accepted(4)).await;
        assert_eq!(auth.token, "secret");
        assert_eq!(auth.replica_id, ReplicaId::new([3; 16]));

        let session = match events.recv().await.unwrap() {
            TransportEvent::Activated(session) => session,
            other => panic!("expected Activated, got {other:?}"),
        };
        assert_eq!(session.schema_version, 4);
        assert_eq!(transport.state(), ConnectionState::Active);

        let ack = WireMessage::Ack(Ack {
            transaction_id: TransactionId::random(),
        });
        session.send(ack.clone()).await.unwrap();
        assert_eq!(server.next().await.unwrap().unwrap(), ack);

        server.send(ack.clone()).await.unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::Message(message) => assert_eq!(message, ack),
            other => panic!("expected Message, got {other:?}"),
        }

        server.send(WireMessage::Ping(Ping { nonce: 11 })).await.unwrap();
        assert_eq!(
            server.next().await.unwrap().unwrap(),
            WireMessage::Pong(Pong { nonce: 11 })
        );

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_token_is_terminal() {
        let (factory, mut conns) = factory(0);
        let (transport, mut events) = Transport::connect(config(), factory);

        let mut server = conns.recv().await.unwrap();
        accept(
            &mut server,
            AuthResponse::Rejected {
                reason: "expired".into(),
                code: RejectCode::InvalidToken,
            },
        )
        .await;

        match events.recv().await.unwrap() {
            TransportEvent::Failed(SatelliteError::Auth(reason)) => assert_eq!(reason, "expired"),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert!(events.recv().await.is_none());
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn protocol_mismatch_is_terminal() {
        let (factory, mut conns) = factory(0);
        let (_transport, mut events) = Transport::connect(config(), factory);

        let mut server = conns.recv().await.unwrap();
        accept(
            &mut server,
            AuthResponse::Accepted {
                protocol_version: tether_protocol::PROTOCOL_VERSION + 1,
                schema_version: 0,
            },
        )
        .await;

        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Failed(SatelliteError::ProtocolMismatch(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_reset() {
        let (factory, mut conns) = factory(4);
        let (transport, mut events) = Transport::connect(config(), factory);

        let mut delays = Vec::new();
        while delays.len() < 4 {
            match events.recv().await.unwrap() {
                TransportEvent::Retrying { attempt, delay } => {
                    assert_eq!(attempt as usize, delays.len() + 1);
                    delays.push(delay);
                }
                other => panic!("expected Retrying, got {other:?}"),
            }
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );

        let mut server = conns.recv().await.unwrap();
        accept(&mut server, accepted(0)).await;
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Activated(_)));

        drop(server);
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::SessionLost));
        match events.recv().await.unwrap() {
            TransportEvent::Retrying { attempt, delay } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(100));
            }
            other => panic!("expected Retrying, got {other:?}"),
        }
        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_server_trips_liveness() {
        let (factory, mut conns) = factory(0);
        let mut config = config();
        config.ping_interval = Duration::from_secs(1);
        config.liveness_timeout = Duration::from_secs(3);
        let (transport, mut events) = Transport::connect(config, factory);

        let mut server = conns.recv().await.unwrap();
        accept(&mut server, accepted(0)).await;
        let _session = match events.recv().await.unwrap() {
            TransportEvent::Activated(s) => s,
            other => panic!("expected Activated, got {other:?}"),
        };

        // The server reads pings but never answers.
        let reader = tokio::spawn(async move {
            let mut pings = 0;
            while let Some(Ok(WireMessage::Ping(_))) = server.next().await {
                pings += 1;
            }
            pings
        });

        assert!(matches!(events.recv().await.unwrap(), TransportEvent::SessionLost));
        assert!(reader.await.unwrap() >= 2);
        transport.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writes_trip_liveness() {
        let (factory, mut conns) = buffered_factory(0, 8);
        let mut config = config();
        config.ping_interval = Duration::from_secs(1);
        config.liveness_timeout = Duration::from_secs(3);
        let (transport, mut events) = Transport::connect(config, factory);

        // Accepts, then keeps the connection open without reading.
        let mut server = conns.recv().await.unwrap();
        accept(&mut server, accepted(0)).await;
        let _session = match events.recv().await.unwrap() {
            TransportEvent::Activated(s) => s,
            other => panic!("expected Activated, got {other:?}"),
        };

        let lost = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .unwrap();
        assert!(matches!(lost, Some(TransportEvent::SessionLost)));
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Retrying { .. }
        ));
        transport.close().await;
        drop(server);
    }

    #[tokio::test(start_paused = true)]
    async fn close_interrupts_a_stalled_write() {
        let (factory, mut conns) = buffered_factory(0, 8);
        let mut config = config();
        config.ping_interval = Duration::from_secs(1);
        config.liveness_timeout = Duration::from_secs(600);
        let (transport, mut events) = Transport::connect(config, factory);

        let mut server = conns.recv().await.unwrap();
        accept(&mut server, accepted(0)).await;
        let session = match events.recv().await.unwrap() {
            TransportEvent::Activated(session) => session,
            other => panic!("expected Activated, got {other:?}"),
        };
        sleep(Duration::from_secs(2)).await;

        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(session.is_closed());
        drop(server);
    }
}
