//! In-memory server and sockets.
//!
//! [`LoopbackServer`] speaks the wire protocol over `tokio::io::duplex`
//! streams. It authenticates, answers pings, keeps every transaction it
//! receives and relays it to the other connected replicas subscribed to the
//! touched tables. It is a relay, not an authoritative store: it never
//! merges rows and replays its whole log to each new subscription.
//!
//! [`LoopbackSocketFactory`] connects one satellite to a server and can be
//! taken offline or told to refuse connections.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tether_protocol::{
    Ack, AuthResponse, Pong, RejectCode, ReplicaId, SubscribeResponse, SubscriptionId,
    Transaction, TransactionId, WireMessage, PROTOCOL_VERSION,
};
use tether_satellite::transport::{BoxedSocket, SocketFactory, WireCodec};
use tether_satellite::{SatelliteError, SatelliteResult};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// A relay server for tests.
#[derive(Clone)]
pub struct LoopbackServer {
    state: Arc<ServerState>,
}

struct ServerState {
    token: String,
    protocol_version: AtomicU32,
    schema_version: AtomicU32,
    acks_enabled: AtomicBool,
    sessions: AtomicU64,
    acks_received: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    log: Vec<Transaction>,
    clients: HashMap<u64, Client>,
    next_client: u64,
    next_subscription: u64,
}

struct Client {
    replica: ReplicaId,
    subscriptions: HashMap<SubscriptionId, Vec<String>>,
    delivered: HashSet<TransactionId>,
    sender: mpsc::UnboundedSender<WireMessage>,
}

impl Client {
    fn wants(&self, transaction: &Transaction) -> bool {
        transaction.origin != self.replica
            && !self.delivered.contains(&transaction.transaction_id)
            && self
                .subscriptions
                .values()
                .flatten()
                .any(|table| transaction.changes.iter().any(|c| &c.table == table))
    }

    fn deliver(&mut self, transaction: &Transaction) {
        self.delivered.insert(transaction.transaction_id);
        let _ = self.sender.send(WireMessage::Transaction(transaction.clone()));
    }
}

impl LoopbackServer {
    /// Creates a server accepting `token`, at schema version 0.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ServerState {
                token: token.into(),
                protocol_version: AtomicU32::new(u32::from(PROTOCOL_VERSION)),
                schema_version: AtomicU32::new(0),
                acks_enabled: AtomicBool::new(true),
                sessions: AtomicU64::new(0),
                acks_received: AtomicU64::new(0),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Sets the schema version reported to new sessions.
    pub fn set_schema_version(&self, version: u32) {
        self.state.schema_version.store(version, Ordering::SeqCst);
    }

    /// Sets the only protocol version the server accepts.
    pub fn set_protocol_version(&self, version: u16) {
        self.state
            .protocol_version
            .store(u32::from(version), Ordering::SeqCst);
    }

    /// Whether received transactions are acknowledged.
    pub fn set_acks_enabled(&self, enabled: bool) {
        self.state.acks_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Every transaction the server holds, in arrival order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.state.inner.lock().log.clone()
    }

    /// Sessions that passed authentication.
    pub fn sessions(&self) -> u64 {
        self.state.sessions.load(Ordering::SeqCst)
    }

    /// Acks received from satellites for relayed transactions.
    pub fn acks_received(&self) -> u64 {
        self.state.acks_received.load(Ordering::SeqCst)
    }

    /// Currently connected, authenticated clients.
    pub fn client_count(&self) -> usize {
        self.state.inner.lock().clients.len()
    }

    /// Stores `transaction` as if another replica had sent it, and relays it.
    pub fn inject(&self, transaction: Transaction) {
        self.state.accept(None, transaction);
    }

    /// Serves one connection until the peer hangs up or `shutdown` fires.
    pub fn serve(&self, socket: DuplexStream, shutdown: CancellationToken) {
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(err) = state.connection(socket, shutdown).await {
                debug!(error = %err, "loopback connection ended");
            }
        });
    }
}

impl fmt::Debug for LoopbackServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackServer")
            .field("sessions", &self.sessions())
            .field("transactions", &self.state.inner.lock().log.len())
            .finish_non_exhaustive()
    }
}

impl ServerState {
    async fn connection(
        &self,
        socket: DuplexStream,
        shutdown: CancellationToken,
    ) -> SatelliteResult<()> {
        let mut framed = Framed::new(socket, WireCodec);
        let auth = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => match frame {
                Some(Ok(WireMessage::Auth(auth))) => auth,
                Some(Ok(other)) => {
                    return Err(SatelliteError::Protocol(format!("expected Auth, got {}", other.name())))
                }
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            },
        };

        let protocol_version = self.protocol_version.load(Ordering::SeqCst);
        let rejection = if auth.token != self.token {
            Some(("invalid token", RejectCode::InvalidToken))
        } else if u32::from(auth.protocol_version) != protocol_version {
            Some(("unsupported protocol version", RejectCode::ProtocolMismatch))
        } else {
            None
        };
        if let Some((reason, code)) = rejection {
            framed
                .send(WireMessage::AuthResponse(AuthResponse::Rejected {
                    reason: reason.to_string(),
                    code,
                }))
                .await?;
            return Ok(());
        }
        framed
            .send(WireMessage::AuthResponse(AuthResponse::Accepted {
                protocol_version: u16::try_from(protocol_version).unwrap_or(PROTOCOL_VERSION),
                schema_version: self.schema_version.load(Ordering::SeqCst),
            }))
            .await?;
        self.sessions.fetch_add(1, Ordering::SeqCst);

        let (sender, mut outbound) = mpsc::unbounded_channel();
        let client = self.register(auth.replica_id, sender);
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(err) = framed.send(message).await {
                            break Err(err);
                        }
                    }
                    None => break Ok(()),
                },
                frame = framed.next() => match frame {
                    Some(Ok(message)) => self.handle(client, message),
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                },
            }
        };
        self.inner.lock().clients.remove(&client);
        result
    }

    fn register(&self, replica: ReplicaId, sender: mpsc::UnboundedSender<WireMessage>) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_client;
        inner.next_client += 1;
        inner.clients.insert(
            id,
            Client {
                replica,
                subscriptions: HashMap::new(),
                delivered: HashSet::new(),
                sender,
            },
        );
        id
    }

    fn handle(&self, client: u64, message: WireMessage) {
        match message {
            WireMessage::Transaction(transaction) => {
                let transaction_id = transaction.transaction_id;
                self.accept(Some(client), transaction);
                if self.acks_enabled.load(Ordering::SeqCst) {
                    self.reply(client, WireMessage::Ack(Ack { transaction_id }));
                }
            }
            WireMessage::SubscribeRequest(request) => {
                let mut inner = self.inner.lock();
                let Inner {
                    log,
                    clients,
                    next_subscription,
                    ..
                } = &mut *inner;
                let Some(entry) = clients.get_mut(&client) else {
                    return;
                };
                *next_subscription += 1;
                let subscription_id = SubscriptionId::new(format!("sub-{next_subscription}"));
                let tables = request.shapes.iter().map(|s| s.table.clone()).collect();
                entry.subscriptions.insert(subscription_id.clone(), tables);
                let _ = entry
                    .sender
                    .send(WireMessage::SubscribeResponse(SubscribeResponse {
                        request_id: request.request_id,
                        result: Ok(subscription_id),
                    }));
                for transaction in log.iter() {
                    if entry.wants(transaction) {
                        entry.deliver(transaction);
                    }
                }
            }
            WireMessage::UnsubscribeRequest(request) => {
                if let Some(entry) = self.inner.lock().clients.get_mut(&client) {
                    for id in &request.subscription_ids {
                        entry.subscriptions.remove(id);
                    }
                }
            }
            WireMessage::Ack(_) => {
                self.acks_received.fetch_add(1, Ordering::SeqCst);
            }
            WireMessage::Ping(ping) => {
                self.reply(client, WireMessage::Pong(Pong { nonce: ping.nonce }));
            }
            other => debug!(message = other.name(), "loopback server ignoring message"),
        }
    }

    /// Logs a transaction once and relays it to interested clients.
    fn accept(&self, from: Option<u64>, transaction: Transaction) {
        let mut inner = self.inner.lock();
        if inner
            .log
            .iter()
            .any(|t| t.transaction_id == transaction.transaction_id)
        {
            return;
        }
        for (id, client) in inner.clients.iter_mut() {
            if Some(*id) != from && client.wants(&transaction) {
                client.deliver(&transaction);
            }
        }
        inner.log.push(transaction);
    }

    fn reply(&self, client: u64, message: WireMessage) {
        if let Some(entry) = self.inner.lock().clients.get(&client) {
            let _ = entry.sender.send(message);
        }
    }
}

/// Connects a satellite to a [`LoopbackServer`].
pub struct LoopbackSocketFactory {
    server: LoopbackServer,
    online: AtomicBool,
    refusals: AtomicU32,
    attempts: AtomicU64,
    link: Mutex<CancellationToken>,
}

impl LoopbackSocketFactory {
    /// Creates an online factory for `server`.
    pub fn new(server: LoopbackServer) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
            refusals: AtomicU32::new(0),
            attempts: AtomicU64::new(0),
            link: Mutex::new(CancellationToken::new()),
        }
    }

    /// Takes the network down or brings it back. Going offline drops every
    /// open connection and refuses new ones.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            let link = std::mem::replace(&mut *self.link.lock(), CancellationToken::new());
            link.cancel();
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The server this factory connects to.
    pub fn server(&self) -> &LoopbackServer {
        &self.server
    }
}

#[async_trait]
impl SocketFactory for LoopbackSocketFactory {
    async fn connect(&self, _endpoint: &str) -> io::Result<BoxedSocket> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "loopback offline"));
        }
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "loopback refused"));
        }
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let shutdown = self.link.lock().child_token();
        self.server.serve(server, shutdown);
        Ok(Box::new(client))
    }
}

impl fmt::Debug for LoopbackSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackSocketFactory")
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}
