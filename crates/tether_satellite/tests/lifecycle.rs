//! Start-up, shutdown, registry and failure handling.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether_codec::SqlValue;
use tether_protocol::{ChangeRecord, Hlc, Transaction, TransactionId};
use tether_satellite::{
    current_version, ConnectionState, Migration, Registry, SatelliteDeps, SatelliteError,
    SatelliteState,
};
use tether_storage::{DatabaseAdapter, SqliteAdapter};
use tether_testkit::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn name(value: &str) -> Vec<(String, SqlValue)> {
    vec![("name".into(), SqlValue::from(value))]
}

fn open(dir: &TempDir) -> Arc<dyn DatabaseAdapter> {
    Arc::new(SqliteAdapter::open(dir.path().join("app.db")).unwrap())
}

fn remote_insert(n: i64) -> Transaction {
    let ts = Hlc::new(10, 0, replica_id(9));
    Transaction {
        transaction_id: TransactionId::random(),
        origin: replica_id(9),
        commit_timestamp: ts,
        changes: vec![ChangeRecord::insert("items", id(n), name("remote")).with_timestamp(ts)],
    }
}

#[tokio::test]
async fn restart_applies_only_new_migrations_and_keeps_oplog() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let server = server();

    let first = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(open(&dir))
        .start()
        .await
        .unwrap();
    assert_eq!(first.schema_version(), 2);
    first.set_online(false);
    first
        .write(vec![ChangeRecord::insert("items", id(1), name("kept"))])
        .unwrap();
    first.stop().await;
    assert_eq!(first.state(), SatelliteState::Stopped);
    assert!(matches!(
        first.write(vec![ChangeRecord::insert("items", id(2), name("late"))]),
        Err(SatelliteError::Stopped)
    ));
    drop(first);

    let mut migrations = sample_migrations();
    migrations.push(Migration::new(
        3,
        ["ALTER TABLE items ADD COLUMN sku TEXT"],
    ));
    let second = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(open(&dir))
        .configure(|c| c.with_migrations(migrations))
        .start()
        .await
        .unwrap();
    assert_eq!(second.schema_version(), 3);
    assert_eq!(current_version(second.adapter().as_ref()).unwrap(), 3);
    assert_eq!(second.count("_tether_migrations"), 3);

    synced_until(&second, || server.transactions().len() == 1).await;
    assert_eq!(second.pending_outbound().unwrap(), 0);
    second.stop().await;
}

async fn synced_until(replica: &TestReplica, condition: impl Fn() -> bool) {
    assert!(
        wait_until(WAIT, || condition() && replica.pending_outbound().unwrap() == 0).await,
        "{} did not sync",
        replica.name()
    );
}

#[tokio::test]
async fn migration_gap_prevents_start() {
    init_tracing();
    let server = server();
    let result = ReplicaBuilder::new(&server, "app", replica_id(1))
        .configure(|c| {
            c.with_migrations(vec![
                Migration::new(1, ["CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL)"]),
                Migration::new(3, ["CREATE TABLE later (id INTEGER PRIMARY KEY)"]),
            ])
        })
        .start()
        .await;
    assert!(matches!(result, Err(SatelliteError::SchemaIntegrity(_))));
}

#[tokio::test]
async fn replica_id_survives_restart() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let server = server();
    let first = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(open(&dir))
        .configure(|mut c| {
            c.replica_id = None;
            c
        })
        .start()
        .await
        .unwrap();
    let replica = first.replica_id();
    first.stop().await;
    drop(first);

    let second = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(open(&dir))
        .configure(|mut c| {
            c.replica_id = None;
            c
        })
        .start()
        .await
        .unwrap();
    assert_eq!(second.replica_id(), replica);
    second.stop().await;
}

#[tokio::test]
async fn registry_start_is_idempotent() {
    init_tracing();
    let server = server();
    let registry = Registry::new();
    let deps = || {
        SatelliteDeps::new(
            Arc::new(SqliteAdapter::open_in_memory().unwrap()),
            Arc::new(LoopbackSocketFactory::new(server.clone())),
        )
    };

    let first = registry
        .start("db1", fast_config(replica_id(1)), deps())
        .await
        .unwrap();
    let again = registry
        .start("db1", fast_config(replica_id(1)), deps())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(registry.names().await, vec!["db1".to_string()]);

    let twin = tether_satellite::Satellite::start("db1", fast_config(replica_id(2)), deps())
        .await
        .unwrap();
    assert!(matches!(
        registry.register(Arc::new(twin)).await,
        Err(SatelliteError::AlreadyRunning(_))
    ));

    registry.stop("db1").await.unwrap();
    assert!(!first.is_running());
    assert!(registry.get("db1").await.is_none());
    assert!(matches!(
        registry.stop("db1").await,
        Err(SatelliteError::NotRunning(_))
    ));

    let fresh = registry
        .start("db1", fast_config(replica_id(1)), deps())
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &fresh));
    registry.stop_all().await;
    assert!(registry.names().await.is_empty());
    assert!(!fresh.is_running());
}

#[tokio::test]
async fn concurrent_registry_starts_share_one_satellite() {
    init_tracing();
    let server = server();
    let registry = Registry::new();
    let first_factory = Arc::new(LoopbackSocketFactory::new(server.clone()));
    let second_factory = Arc::new(LoopbackSocketFactory::new(server.clone()));
    let deps = |factory: &Arc<LoopbackSocketFactory>| {
        SatelliteDeps::new(
            Arc::new(SqliteAdapter::open_in_memory().unwrap()),
            factory.clone(),
        )
    };

    let (a, b) = tokio::join!(
        registry.start("db1", fast_config(replica_id(1)), deps(&first_factory)),
        registry.start("db1", fast_config(replica_id(2)), deps(&second_factory)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(registry.names().await, vec!["db1".to_string()]);

    assert!(wait_until(WAIT, || server.sessions() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.sessions(), 1);
    assert_eq!(first_factory.attempts() + second_factory.attempts(), 1);

    let (stopped, restarted) = tokio::join!(
        registry.stop("db1"),
        registry.start("db1", fast_config(replica_id(3)), deps(&first_factory)),
    );
    stopped.unwrap();
    let restarted = restarted.unwrap();
    assert!(!a.is_running());
    assert!(!Arc::ptr_eq(&restarted, &a));
    assert!(restarted.is_running());
    assert!(Arc::ptr_eq(&registry.get("db1").await.unwrap(), &restarted));
    registry.stop_all().await;
}

#[tokio::test]
async fn rejected_token_stops_the_satellite() {
    init_tracing();
    let server = tether_testkit::LoopbackServer::new("other-token");
    let replica = ReplicaBuilder::new(&server, "app", replica_id(1))
        .start()
        .await
        .unwrap();
    assert!(wait_until(WAIT, || replica.state() == SatelliteState::Stopped).await);
    assert!(matches!(replica.last_error(), Some(SatelliteError::Auth(_))));
    assert_eq!(replica.connection_state(), ConnectionState::Disconnected);
    assert_eq!(server.sessions(), 0);
}

#[tokio::test]
async fn newer_server_schema_blocks_replication() {
    init_tracing();
    let server = server();
    server.set_schema_version(5);
    let replica = ReplicaBuilder::new(&server, "app", replica_id(1))
        .start()
        .await
        .unwrap();
    assert!(wait_until(WAIT, || replica.state() == SatelliteState::NeedsMigration).await);
    assert_eq!(
        replica.last_error(),
        Some(SatelliteError::NeedsMigration { local: 2, server: 5 })
    );

    replica
        .write(vec![ChangeRecord::insert("items", id(1), name("queued"))])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(replica.pending_outbound().unwrap(), 1);
    assert!(server.transactions().is_empty());

    replica.stop().await;
    assert_eq!(replica.state(), SatelliteState::Stopped);
}

#[tokio::test]
async fn transient_apply_failures_are_retried() {
    init_tracing();
    let server = server();
    let flaky = Arc::new(FlakyAdapter::new(Arc::new(
        SqliteAdapter::open_in_memory().unwrap(),
    )));
    let replica = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(flaky.clone())
        .start()
        .await
        .unwrap();
    flaky.fail_statements("\"items\"", 2);
    server.inject(remote_insert(1));

    assert!(wait_until(WAIT, || replica.item(1).is_some()).await);
    assert_eq!(flaky.failures(), 2);
    let stats = replica.stats();
    assert_eq!(stats.apply_failures, 2);
    assert_eq!(stats.transactions_applied, 1);
    assert!(wait_until(WAIT, || server.acks_received() == 1).await);
    assert!(replica.is_running());
}

#[tokio::test]
async fn persistent_apply_failure_stops_without_recording() {
    init_tracing();
    let server = server();
    let flaky = Arc::new(FlakyAdapter::new(Arc::new(
        SqliteAdapter::open_in_memory().unwrap(),
    )));
    let replica = ReplicaBuilder::new(&server, "app", replica_id(1))
        .adapter(flaky.clone())
        .start()
        .await
        .unwrap();
    flaky.fail_statements("\"items\"", u32::MAX);
    let transaction = remote_insert(1);
    let transaction_id = transaction.transaction_id;
    server.inject(transaction);

    assert!(wait_until(WAIT, || replica.state() == SatelliteState::Stopped).await);
    assert!(matches!(
        replica.last_error(),
        Some(SatelliteError::ApplyFailure { transaction_id: failed, attempts: 3, .. })
            if failed == transaction_id
    ));
    flaky.heal();
    assert_eq!(replica.count("_tether_received"), 0);
    assert_eq!(replica.item(1), None);
    assert_eq!(server.acks_received(), 0);
}

#[tokio::test]
async fn refused_connections_back_off_then_sync() {
    init_tracing();
    let server = server();
    let replica = ReplicaBuilder::new(&server, "app", replica_id(1))
        .start()
        .await
        .unwrap();
    replica.factory.refuse_next(3);
    replica
        .write(vec![ChangeRecord::insert("items", id(1), name("eventually"))])
        .unwrap();

    assert!(wait_until(WAIT, || server.transactions().len() == 1).await);
    assert_eq!(replica.factory.attempts(), 4);
    assert_eq!(replica.stats().reconnect_attempts, 3);
    assert_eq!(replica.connection_state(), ConnectionState::Active);
    assert_eq!(replica.stats().sessions, 1);
}
