//! The satellite process.
//!
//! A [`Satellite`] owns one database's replication: it migrates the schema,
//! captures local writes into the oplog, ships them to the server in commit
//! order and merges inbound transactions. After start-up all network work
//! happens on a driver task that owns the [`Transport`].

use crate::apply::{apply_local, apply_remote, local_timestamp, prune_received};
use crate::config::SatelliteConfig;
use crate::error::{SatelliteError, SatelliteResult};
use crate::migrator::Migrator;
use crate::notifier::{ChangeOrigin, Notifier};
use crate::oplog::OplogStore;
use crate::schema::{bootstrap, load_replica_id, unix_millis};
use crate::shadow;
use crate::subscriptions::{Subscription, SubscriptionStore};
use crate::transport::{
    ConnectionState, Session, SocketFactory, Transport, TransportConfig, TransportEvent,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tether_protocol::{
    Ack, ChangeRecord, HlcClock, ReplicaId, Shape, SubscribeRequest, SystemClock,
    Transaction as ReplicatedTransaction, TransactionId, UnsubscribeRequest, WallClock,
    WireMessage,
};
use tether_storage::{AdapterExt, DatabaseAdapter};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Applied inbound transactions between prunes of received ids.
const PRUNE_RECEIVED_EVERY: u64 = 1024;

/// Lifecycle state of a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SatelliteState {
    /// Preparing internal tables.
    Initializing,
    /// Applying bundled migrations.
    Migrating,
    /// Waiting for the first session.
    Connecting,
    /// Replicating. Stays here while the transport reconnects.
    Syncing,
    /// The server expects a newer schema; nothing is replicated.
    NeedsMigration,
    /// Shut down, by request or after a fatal error.
    Stopped,
}

impl fmt::Display for SatelliteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SatelliteState::Initializing => "initializing",
            SatelliteState::Migrating => "migrating",
            SatelliteState::Connecting => "connecting",
            SatelliteState::Syncing => "syncing",
            SatelliteState::NeedsMigration => "needs_migration",
            SatelliteState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters describing replication progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteStats {
    /// Outbound transactions sent, including resends.
    pub transactions_sent: u64,
    /// Outbound transactions acknowledged by the server.
    pub transactions_acked: u64,
    /// Inbound transactions received.
    pub transactions_received: u64,
    /// Inbound transactions applied.
    pub transactions_applied: u64,
    /// Inbound transactions skipped as already applied.
    pub duplicates_skipped: u64,
    /// Inbound column writes that lost to local state.
    pub columns_rejected: u64,
    /// Conflicts decided by replica id.
    pub tie_breaks: u64,
    /// Failed apply attempts.
    pub apply_failures: u64,
    /// Reconnects scheduled by the transport.
    pub reconnect_attempts: u64,
    /// Sessions established.
    pub sessions: u64,
}

/// Collaborators a satellite runs with.
#[derive(Clone)]
pub struct SatelliteDeps {
    /// Execution adapter for the local database.
    pub adapter: Arc<dyn DatabaseAdapter>,
    /// Opens connections to the server.
    pub socket_factory: Arc<dyn SocketFactory>,
    /// Receives change notifications.
    pub notifier: Arc<Notifier>,
    /// Physical time source for the HLC.
    pub wall_clock: Arc<dyn WallClock>,
}

impl SatelliteDeps {
    /// Creates dependencies with a fresh notifier and the system clock.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, socket_factory: Arc<dyn SocketFactory>) -> Self {
        Self {
            adapter,
            socket_factory,
            notifier: Arc::new(Notifier::new()),
            wall_clock: Arc::new(SystemClock),
        }
    }

    /// Uses a shared notifier.
    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Uses another wall clock.
    pub fn with_wall_clock(mut self, wall_clock: Arc<dyn WallClock>) -> Self {
        self.wall_clock = wall_clock;
        self
    }
}

impl fmt::Debug for SatelliteDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SatelliteDeps")
            .field("socket_factory", &self.socket_factory)
            .field("wall_clock", &self.wall_clock)
            .finish_non_exhaustive()
    }
}

struct Shared {
    name: String,
    replica: ReplicaId,
    config: SatelliteConfig,
    schema_version: u32,
    adapter: Arc<dyn DatabaseAdapter>,
    oplog: OplogStore,
    subscriptions: SubscriptionStore,
    notifier: Arc<Notifier>,
    clock: HlcClock,
    state: watch::Sender<SatelliteState>,
    last_error: Mutex<Option<SatelliteError>>,
    stats: Mutex<SatelliteStats>,
    wake: Notify,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> SatelliteState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SatelliteState) {
        set_state(&self.state, &self.name, state);
    }

    fn record_error(&self, err: SatelliteError) {
        *self.last_error.lock() = Some(err);
    }
}

fn set_state(sender: &watch::Sender<SatelliteState>, name: &str, state: SatelliteState) {
    let previous = sender.send_replace(state);
    if previous != state {
        info!(db = %name, from = %previous, to = %state, "satellite state");
    }
}

enum Command {
    Subscribe(Subscription),
    Unsubscribe(Subscription),
}

/// A running replication engine for one database.
pub struct Satellite {
    shared: Arc<Shared>,
    connection: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Satellite {
    /// Migrates the database and starts replicating.
    ///
    /// Fails without starting anything if the internal tables cannot be
    /// prepared or the migration bundle is rejected.
    pub async fn start(
        name: impl Into<String>,
        config: SatelliteConfig,
        deps: SatelliteDeps,
    ) -> SatelliteResult<Self> {
        let name = name.into();
        let (state, _) = watch::channel(SatelliteState::Initializing);
        info!(db = %name, endpoint = %config.endpoint, "starting satellite");

        let prepared = prepare(&name, &config, &deps, &state);
        let (replica, schema_version) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                error!(db = %name, error = %err, "satellite failed to start");
                set_state(&state, &name, SatelliteState::Stopped);
                return Err(err);
            }
        };

        let adapter = deps.adapter.clone();
        let oplog = OplogStore::new(adapter.clone(), config.prune_acknowledged);
        let clock = HlcClock::with_wall_clock(replica, deps.wall_clock.clone());
        let floor = [oplog.max_timestamp()?, shadow::max_timestamp(&*adapter)?]
            .into_iter()
            .flatten()
            .max();
        if let Some(floor) = floor {
            clock.seed(&floor);
        }

        let subscriptions = SubscriptionStore::new(adapter.clone());
        if !config.initial_shapes.is_empty() {
            subscriptions.ensure(&config.initial_shapes)?;
        }

        let (transport, events) = Transport::connect(
            TransportConfig::from_satellite(&config, replica),
            deps.socket_factory.clone(),
        );
        let connection = transport.watch_state();

        let shared = Arc::new(Shared {
            name,
            replica,
            schema_version,
            adapter,
            oplog,
            subscriptions,
            notifier: deps.notifier,
            clock,
            state,
            last_error: Mutex::new(None),
            stats: Mutex::new(SatelliteStats::default()),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            config,
        });
        shared.set_state(SatelliteState::Connecting);

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: shared.clone(),
            transport,
            events,
            commands,
            session: None,
            in_flight: VecDeque::new(),
            cursor: 0,
        };
        let handle = tokio::spawn(driver.run());

        Ok(Self {
            shared,
            connection,
            commands: commands_tx,
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Replica id of this database.
    pub fn replica_id(&self) -> ReplicaId {
        self.shared.replica
    }

    /// Local schema version after migration.
    pub fn schema_version(&self) -> u32 {
        self.shared.schema_version
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SatelliteState {
        self.shared.state()
    }

    /// Receiver for lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<SatelliteState> {
        self.shared.state.subscribe()
    }

    /// Current transport state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    /// Receiver for transport transitions.
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Last error surfaced by the satellite.
    pub fn last_error(&self) -> Option<SatelliteError> {
        self.shared.last_error.lock().clone()
    }

    /// Snapshot of the replication counters.
    pub fn stats(&self) -> SatelliteStats {
        self.shared.stats.lock().clone()
    }

    /// Change notifier for this database.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.shared.notifier
    }

    /// Execution adapter for reading application tables.
    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.shared.adapter
    }

    /// Returns true until the satellite has stopped.
    pub fn is_running(&self) -> bool {
        self.state() != SatelliteState::Stopped
    }

    /// Writes `changes` as one local transaction.
    ///
    /// Row changes, oplog entries and shadow timestamps commit together.
    /// Every change is stamped with the same HLC timestamp, issued inside
    /// the transaction so concurrent writers commit in timestamp order.
    pub fn write(&self, changes: Vec<ChangeRecord>) -> SatelliteResult<TransactionId> {
        if !self.is_running() {
            return Err(SatelliteError::Stopped);
        }
        if changes.is_empty() {
            return Err(SatelliteError::InvalidState("empty write".into()));
        }
        let transaction_id = TransactionId::random();
        let clock = &self.shared.clock;
        let timestamp = self.shared.adapter.transact(|tx| {
            let timestamp = local_timestamp(tx, clock, &changes)?;
            for change in &changes {
                apply_local(tx, transaction_id, &change.clone().with_timestamp(timestamp))?;
            }
            Ok::<_, SatelliteError>(timestamp)
        })?;

        let mut tables: Vec<String> = Vec::new();
        for change in &changes {
            if !tables.contains(&change.table) {
                tables.push(change.table.clone());
            }
        }
        debug!(db = %self.shared.name, tx_id = %transaction_id, changes = changes.len(), ts = %timestamp, "local write");
        self.shared
            .notifier
            .notify(&tables, ChangeOrigin::Local, Some(transaction_id));
        self.shared.wake.notify_one();
        Ok(transaction_id)
    }

    /// Persists a subscription and requests it from the server.
    pub fn subscribe(&self, shapes: Vec<Shape>) -> SatelliteResult<Subscription> {
        if !self.is_running() {
            return Err(SatelliteError::Stopped);
        }
        let subscription = self.shared.subscriptions.add(shapes)?;
        info!(db = %self.shared.name, subscription = subscription.id, "subscribed");
        self.commands
            .send(Command::Subscribe(subscription.clone()))
            .map_err(|_| SatelliteError::Stopped)?;
        Ok(subscription)
    }

    /// Deletes a subscription and tells the server. Returns false if it
    /// did not exist.
    pub fn unsubscribe(&self, id: i64) -> SatelliteResult<bool> {
        if !self.is_running() {
            return Err(SatelliteError::Stopped);
        }
        match self.shared.subscriptions.remove(id)? {
            Some(subscription) => {
                info!(db = %self.shared.name, subscription = id, "unsubscribed");
                self.commands
                    .send(Command::Unsubscribe(subscription))
                    .map_err(|_| SatelliteError::Stopped)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Persisted subscriptions.
    pub fn subscriptions(&self) -> SatelliteResult<Vec<Subscription>> {
        self.shared.subscriptions.list()
    }

    /// Oplog entries not yet acknowledged by the server.
    pub fn pending_outbound(&self) -> SatelliteResult<u64> {
        self.shared.oplog.pending_count()
    }

    /// Stops replication and waits for the driver to finish.
    ///
    /// Unacknowledged transactions stay in the oplog and are sent again by
    /// the next satellite started on this database.
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                warn!(db = %self.shared.name, error = %err, "satellite driver ended abnormally");
            }
        }
        self.shared.set_state(SatelliteState::Stopped);
    }
}

impl Drop for Satellite {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl fmt::Debug for Satellite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Satellite")
            .field("name", &self.shared.name)
            .field("replica", &self.shared.replica)
            .field("state", &self.state())
            .field("connection", &self.connection_state())
            .finish_non_exhaustive()
    }
}

/// Bootstraps internal tables, resolves the replica id and migrates.
fn prepare(
    name: &str,
    config: &SatelliteConfig,
    deps: &SatelliteDeps,
    state: &watch::Sender<SatelliteState>,
) -> SatelliteResult<(ReplicaId, u32)> {
    let adapter = &*deps.adapter;
    bootstrap(adapter)?;
    let replica = load_replica_id(adapter, config.replica_id)?;

    set_state(state, name, SatelliteState::Migrating);
    let report = Migrator::new(config.migrations.clone(), config.protocol_version).apply(adapter)?;
    info!(
        db = %name,
        replica = %replica,
        schema_version = report.current_version,
        applied = report.applied.len(),
        "schema ready"
    );
    Ok((replica, report.current_version))
}

struct InFlight {
    transaction_id: TransactionId,
    last_entry_id: u64,
    acked: bool,
}

enum Flow {
    Continue,
    Park,
}

struct Driver {
    shared: Arc<Shared>,
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    session: Option<Session>,
    in_flight: VecDeque<InFlight>,
    cursor: u64,
}

impl Driver {
    async fn run(mut self) {
        match self.event_loop().await {
            Ok(Flow::Park) => {
                self.transport.close().await;
                self.shared.cancel.cancelled().await;
            }
            Ok(Flow::Continue) => {}
            Err(err) => {
                error!(db = %self.shared.name, error = %err, "satellite stopping after fatal error");
                self.shared.record_error(err);
            }
        }
        self.transport.close().await;
        self.shared.set_state(SatelliteState::Stopped);
        info!(db = %self.shared.name, "satellite stopped");
    }

    async fn event_loop(&mut self) -> SatelliteResult<Flow> {
        let shared = self.shared.clone();
        loop {
            let flow = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Ok(Flow::Continue),
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await?,
                    None => return Ok(Flow::Continue),
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.handle_command(command).await;
                        Flow::Continue
                    }
                    None => return Ok(Flow::Continue),
                },
                _ = shared.wake.notified() => {
                    self.pump().await?;
                    Flow::Continue
                }
            };
            if let Flow::Park = flow {
                return Ok(Flow::Park);
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) -> SatelliteResult<Flow> {
        match event {
            TransportEvent::Activated(session) => return self.activate(session).await,
            TransportEvent::Message(message) => self.handle_message(message).await?,
            TransportEvent::SessionLost => {
                info!(db = %self.shared.name, "session lost, reconnecting");
                self.session = None;
            }
            TransportEvent::Retrying { attempt, delay } => {
                self.shared.stats.lock().reconnect_attempts += 1;
                debug!(db = %self.shared.name, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            }
            TransportEvent::Failed(err) => return Err(err),
        }
        Ok(Flow::Continue)
    }

    async fn activate(&mut self, session: Session) -> SatelliteResult<Flow> {
        let local = self.shared.schema_version;
        if session.schema_version > local {
            let err = SatelliteError::NeedsMigration {
                local,
                server: session.schema_version,
            };
            warn!(db = %self.shared.name, error = %err, "replication blocked");
            self.shared.record_error(err);
            self.shared.set_state(SatelliteState::NeedsMigration);
            self.session = None;
            return Ok(Flow::Park);
        }

        self.in_flight.clear();
        self.cursor = self.shared.oplog.acked_upto()?;
        self.shared.stats.lock().sessions += 1;
        self.forget_received()?;
        self.session = Some(session);
        self.shared.set_state(SatelliteState::Syncing);

        for subscription in self.shared.subscriptions.list()? {
            self.send_subscribe(&subscription).await;
        }
        self.pump().await?;
        Ok(Flow::Continue)
    }

    async fn handle_message(&mut self, message: WireMessage) -> SatelliteResult<()> {
        match message {
            WireMessage::Transaction(transaction) => self.handle_inbound(transaction).await,
            WireMessage::Ack(Ack { transaction_id }) => {
                self.handle_ack(transaction_id)?;
                self.pump().await
            }
            WireMessage::SubscribeResponse(response) => {
                let id = i64::try_from(response.request_id).unwrap_or(i64::MAX);
                match &response.result {
                    Ok(server_id) => {
                        info!(db = %self.shared.name, subscription = id, server_id = %server_id, "subscription established")
                    }
                    Err(reason) => {
                        warn!(db = %self.shared.name, subscription = id, reason = %reason, "subscription refused")
                    }
                }
                self.shared.subscriptions.record_response(id, &response.result)
            }
            other => {
                debug!(db = %self.shared.name, message = other.name(), "ignoring unexpected message");
                Ok(())
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe(subscription) => self.send_subscribe(&subscription).await,
            Command::Unsubscribe(subscription) => {
                if let Some(server_id) = subscription.server_id {
                    self.send(WireMessage::UnsubscribeRequest(UnsubscribeRequest {
                        subscription_ids: vec![server_id],
                    }))
                    .await;
                }
            }
        }
    }

    async fn send_subscribe(&mut self, subscription: &Subscription) {
        self.send(WireMessage::SubscribeRequest(SubscribeRequest {
            request_id: u64::try_from(subscription.id).unwrap_or(0),
            shapes: subscription.shapes.clone(),
        }))
        .await;
    }

    /// Drops received-transaction ids older than the configured retention.
    fn forget_received(&self) -> SatelliteResult<()> {
        let retention = i64::try_from(self.shared.config.received_retention.as_millis())
            .unwrap_or(i64::MAX);
        let removed = prune_received(&*self.shared.adapter, unix_millis().saturating_sub(retention))?;
        if removed > 0 {
            debug!(db = %self.shared.name, removed, "forgot old inbound transaction ids");
        }
        Ok(())
    }

    /// Sends on the current session. Returns false if there is none, or if
    /// the satellite is stopped while the session queue is full.
    async fn send(&mut self, message: WireMessage) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let sent = tokio::select! {
            _ = self.shared.cancel.cancelled() => false,
            result = session.send(message) => result.is_ok(),
        };
        if !sent {
            debug!(db = %self.shared.name, "session closed while sending");
            self.session = None;
        }
        sent
    }

    /// Sends unacknowledged transactions until the in-flight window is full.
    async fn pump(&mut self) -> SatelliteResult<()> {
        let max_in_flight = self.shared.config.max_in_flight.max(1);
        let batch_size = self.shared.config.outbound_batch_size.max(1);
        while self.session.is_some() && self.in_flight.len() < max_in_flight {
            let room = (max_in_flight - self.in_flight.len()).min(batch_size);
            let batch = self.shared.oplog.pending_transactions(self.cursor, room)?;
            if batch.is_empty() {
                break;
            }
            for pending in batch {
                let transaction = pending.to_replicated(self.shared.replica);
                self.cursor = pending.last_entry_id();
                self.in_flight.push_back(InFlight {
                    transaction_id: pending.transaction_id,
                    last_entry_id: pending.last_entry_id(),
                    acked: false,
                });
                debug!(
                    db = %self.shared.name,
                    tx_id = %pending.transaction_id,
                    changes = transaction.changes.len(),
                    "sending transaction"
                );
                if !self.send(WireMessage::Transaction(transaction)).await {
                    return Ok(());
                }
                self.shared.stats.lock().transactions_sent += 1;
            }
        }
        Ok(())
    }

    /// Marks a transaction acknowledged and advances the oplog over the
    /// acknowledged prefix.
    fn handle_ack(&mut self, transaction_id: TransactionId) -> SatelliteResult<()> {
        let Some(entry) = self
            .in_flight
            .iter_mut()
            .find(|entry| entry.transaction_id == transaction_id)
        else {
            debug!(db = %self.shared.name, tx_id = %transaction_id, "ack for unknown transaction");
            return Ok(());
        };
        entry.acked = true;

        let mut upto = None;
        while self.in_flight.front().is_some_and(|entry| entry.acked) {
            if let Some(entry) = self.in_flight.pop_front() {
                upto = Some(entry.last_entry_id);
                self.shared.stats.lock().transactions_acked += 1;
            }
        }
        if let Some(upto) = upto {
            self.shared.oplog.ack(upto)?;
        }
        Ok(())
    }

    async fn handle_inbound(&mut self, transaction: ReplicatedTransaction) -> SatelliteResult<()> {
        let transaction_id = transaction.transaction_id;
        self.shared.stats.lock().transactions_received += 1;
        self.shared.clock.observe(&transaction.commit_timestamp);

        let max_attempts = self.shared.config.max_apply_attempts.max(1);
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            match apply_remote(&*self.shared.adapter, &transaction, self.shared.replica) {
                Ok(outcome) => break outcome,
                Err(err) => {
                    self.shared.stats.lock().apply_failures += 1;
                    if attempt >= max_attempts {
                        return Err(SatelliteError::ApplyFailure {
                            transaction_id,
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }
                    warn!(
                        db = %self.shared.name,
                        tx_id = %transaction_id,
                        attempt,
                        error = %err,
                        "apply failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shared.cancel.cancelled() => return Ok(()),
                        _ = sleep(self.shared.config.apply_retry_delay) => {}
                    }
                }
            }
        };

        {
            let mut stats = self.shared.stats.lock();
            if outcome.duplicate {
                stats.duplicates_skipped += 1;
            } else {
                stats.transactions_applied += 1;
                stats.columns_rejected += outcome.columns_rejected;
                stats.tie_breaks += outcome.tie_breaks;
            }
        }
        if !outcome.duplicate && self.shared.stats.lock().transactions_applied % PRUNE_RECEIVED_EVERY == 0 {
            self.forget_received()?;
        }
        if outcome.changed() {
            self.shared.notifier.notify(
                &outcome.changed_tables,
                ChangeOrigin::Remote,
                Some(transaction_id),
            );
        }
        debug!(
            db = %self.shared.name,
            tx_id = %transaction_id,
            duplicate = outcome.duplicate,
            accepted = outcome.columns_accepted,
            rejected = outcome.columns_rejected,
            "inbound transaction"
        );
        self.send(WireMessage::Ack(Ack { transaction_id })).await;
        Ok(())
    }
}
