//! Replication between satellites through the loopback relay.

use std::sync::Arc;
use std::time::Duration;
use tether_codec::SqlValue;
use tether_protocol::{
    ChangeRecord, Hlc, ManualClock, Transaction, TransactionId, PROTOCOL_VERSION,
};
use tether_satellite::{
    apply_remote, bootstrap, ChangeOrigin, Migrator, OplogStore, PendingTransaction,
    SatelliteState,
};
use tether_storage::{DatabaseAdapter, SqliteAdapter};
use tether_testkit::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn name(value: &str) -> Vec<(String, SqlValue)> {
    vec![("name".into(), SqlValue::from(value))]
}

fn item(name: &str, price: Option<f64>) -> Option<Vec<SqlValue>> {
    Some(vec![
        SqlValue::from(name),
        price.map_or(SqlValue::Null, SqlValue::Real),
    ])
}

async fn synced(replica: &TestReplica) {
    assert!(
        wait_until(WAIT, || replica.state() == SatelliteState::Syncing
            && replica.pending_outbound().unwrap() == 0)
        .await,
        "{} did not drain its oplog",
        replica.name()
    );
}

#[tokio::test]
async fn offline_writes_replay_in_commit_order() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1))
        .start()
        .await
        .unwrap();
    a.set_online(false);

    let first = a
        .write(vec![ChangeRecord::insert("items", id(1), name("draft"))])
        .unwrap();
    let second = a
        .write(vec![ChangeRecord::update("items", id(1), name("final"))])
        .unwrap();
    let third = a
        .write(vec![
            ChangeRecord::insert("items", id(2), name("other")),
            ChangeRecord::delete("items", id(1)),
        ])
        .unwrap();
    assert_eq!(a.pending_outbound().unwrap(), 4);

    a.set_online(true);
    synced(&a).await;
    let sent: Vec<TransactionId> = server
        .transactions()
        .iter()
        .map(|t| t.transaction_id)
        .collect();
    assert_eq!(sent, vec![first, second, third]);

    let b = ReplicaBuilder::new(&server, "b", replica_id(2))
        .start()
        .await
        .unwrap();
    assert!(wait_until(WAIT, || b.item(2).is_some()).await);
    assert_eq!(b.item(1), None);
    assert_eq!(b.item(2), item("other", None));
    assert_eq!(a.item(2), b.item(2));
    assert_eq!(b.count("items"), a.count("items"));
    assert_eq!(b.pending_outbound().unwrap(), 0);
}

#[tokio::test]
async fn disjoint_columns_both_survive() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1)).start().await.unwrap();
    let b = ReplicaBuilder::new(&server, "b", replica_id(2)).start().await.unwrap();

    a.write(vec![ChangeRecord::insert(
        "items",
        id(1),
        vec![
            ("name".into(), SqlValue::from("x")),
            ("price".into(), SqlValue::Real(1.0)),
        ],
    )])
    .unwrap();
    assert!(wait_until(WAIT, || b.item(1) == item("x", Some(1.0))).await);

    a.set_online(false);
    b.set_online(false);
    a.write(vec![ChangeRecord::update("items", id(1), name("renamed"))])
        .unwrap();
    b.write(vec![ChangeRecord::update(
        "items",
        id(1),
        vec![("price".into(), SqlValue::Real(2.5))],
    )])
    .unwrap();
    a.set_online(true);
    b.set_online(true);

    let expected = item("renamed", Some(2.5));
    assert!(wait_until(WAIT, || a.item(1) == expected && b.item(1) == expected).await);
}

async fn same_column_race(a_first: bool) {
    let server = server();
    let clock_a = Arc::new(ManualClock::new(1_000));
    let clock_b = Arc::new(ManualClock::new(2_000));
    let a = ReplicaBuilder::new(&server, "a", replica_id(1))
        .wall_clock(clock_a.clone())
        .start()
        .await
        .unwrap();
    let b = ReplicaBuilder::new(&server, "b", replica_id(2))
        .wall_clock(clock_b.clone())
        .start()
        .await
        .unwrap();

    a.write(vec![ChangeRecord::insert("items", id(1), name("base"))])
        .unwrap();
    assert!(wait_until(WAIT, || b.item(1).is_some()).await);

    a.set_online(false);
    b.set_online(false);
    a.write(vec![ChangeRecord::update("items", id(1), name("older"))])
        .unwrap();
    b.write(vec![ChangeRecord::update("items", id(1), name("newer"))])
        .unwrap();

    let (first, second) = if a_first { (&a, &b) } else { (&b, &a) };
    first.set_online(true);
    synced(first).await;
    second.set_online(true);

    let expected = item("newer", None);
    assert!(wait_until(WAIT, || a.item(1) == expected && b.item(1) == expected).await);
    synced(&a).await;
    synced(&b).await;
    assert_eq!(a.item(1), expected);
    assert!(
        wait_until(WAIT, || a.stats().columns_rejected + b.stats().columns_rejected >= 1).await
    );
}

#[tokio::test]
async fn same_column_newer_write_wins_when_older_arrives_first() {
    init_tracing();
    same_column_race(true).await;
}

#[tokio::test]
async fn same_column_newer_write_wins_when_newer_arrives_first() {
    init_tracing();
    same_column_race(false).await;
}

#[tokio::test]
async fn offline_insert_converges_to_later_server_update() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1))
        .wall_clock(Arc::new(ManualClock::new(1_000)))
        .start()
        .await
        .unwrap();
    let b = ReplicaBuilder::new(&server, "b", replica_id(2))
        .wall_clock(Arc::new(ManualClock::new(5_000)))
        .start()
        .await
        .unwrap();
    a.set_online(false);
    a.write(vec![ChangeRecord::insert("items", id(1), name("x"))])
        .unwrap();

    // B knows the row only through the server's copy.
    let seeded = Hlc::new(900, 0, replica_id(9));
    server.inject(Transaction {
        transaction_id: TransactionId::random(),
        origin: replica_id(9),
        commit_timestamp: seeded,
        changes: vec![ChangeRecord::insert("items", id(1), name("x")).with_timestamp(seeded)],
    });
    assert!(wait_until(WAIT, || b.item(1).is_some()).await);
    b.write(vec![ChangeRecord::update("items", id(1), name("y"))])
        .unwrap();
    synced(&b).await;

    a.set_online(true);
    let expected = item("y", None);
    assert!(wait_until(WAIT, || a.item(1) == expected).await);
    synced(&a).await;
    assert_eq!(a.item(1), expected);
    assert_eq!(b.item(1), expected);
    let ids = a
        .adapter()
        .run("SELECT id FROM items", &[])
        .unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0].integer(0).unwrap(), 1);
}

#[tokio::test]
async fn notifications_carry_origin() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1)).start().await.unwrap();
    let b = ReplicaBuilder::new(&server, "b", replica_id(2)).start().await.unwrap();
    let mut items = a.notifier().subscribe_tables(["items"]);
    let mut orders = a.notifier().subscribe_tables(["orders"]);

    let local = a
        .write(vec![ChangeRecord::insert("items", id(1), name("mine"))])
        .unwrap();
    let event = within(WAIT, items.recv()).await.unwrap();
    assert_eq!(event.origin, ChangeOrigin::Local);
    assert_eq!(event.transaction_id, Some(local));
    assert_eq!(event.tables, vec!["items".to_string()]);

    let remote = b
        .write(vec![ChangeRecord::insert("items", id(2), name("theirs"))])
        .unwrap();
    let event = within(WAIT, items.recv()).await.unwrap();
    assert_eq!(event.origin, ChangeOrigin::Remote);
    assert_eq!(event.transaction_id, Some(remote));
    assert!(orders.try_recv().is_none());
}

#[tokio::test]
async fn unacknowledged_transactions_are_resent_once() {
    init_tracing();
    let server = server();
    server.set_acks_enabled(false);
    let a = ReplicaBuilder::new(&server, "a", replica_id(1)).start().await.unwrap();

    a.write(vec![ChangeRecord::insert("items", id(1), name("x"))])
        .unwrap();
    assert!(wait_until(WAIT, || server.transactions().len() == 1).await);
    assert_eq!(a.pending_outbound().unwrap(), 1);

    server.set_acks_enabled(true);
    a.set_online(false);
    a.set_online(true);
    synced(&a).await;
    assert_eq!(server.transactions().len(), 1);
    assert!(a.stats().transactions_sent >= 2);
    assert_eq!(a.stats().transactions_acked, 1);
}

#[tokio::test]
async fn subscriptions_are_established_and_torn_down() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1))
        .configure(|c| c.with_initial_shapes(Vec::new()))
        .start()
        .await
        .unwrap();
    let b = ReplicaBuilder::new(&server, "b", replica_id(2)).start().await.unwrap();
    b.write(vec![ChangeRecord::insert("items", id(1), name("x"))])
        .unwrap();
    synced(&b).await;

    assert!(a.subscriptions().unwrap().is_empty());
    assert_eq!(a.item(1), None);

    let subscription = a
        .subscribe(vec![tether_protocol::Shape::table("items")])
        .unwrap();
    assert!(
        wait_until(WAIT, || a
            .subscriptions()
            .unwrap()
            .iter()
            .any(|s| s.id == subscription.id && s.is_established()))
        .await
    );
    assert!(wait_until(WAIT, || a.item(1).is_some()).await);

    assert!(a.unsubscribe(subscription.id).unwrap());
    assert!(!a.unsubscribe(subscription.id).unwrap());
    assert!(a.subscriptions().unwrap().is_empty());
}

fn replay<'a>(transactions: impl Iterator<Item = &'a PendingTransaction>) -> SqliteAdapter {
    let fresh = SqliteAdapter::open_in_memory().unwrap();
    bootstrap(&fresh).unwrap();
    Migrator::new(sample_migrations(), PROTOCOL_VERSION)
        .apply(&fresh)
        .unwrap();
    for pending in transactions {
        apply_remote(&fresh, &pending.to_replicated(replica_id(1)), replica_id(7)).unwrap();
    }
    fresh
}

fn first_item(db: &dyn DatabaseAdapter) -> Vec<SqlValue> {
    db.run("SELECT name, price FROM items WHERE id = 1", &[])
        .unwrap()
        .remove(0)
        .into_values()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_writers_replay_to_local_state() {
    init_tracing();
    let server = server();
    let a = ReplicaBuilder::new(&server, "a", replica_id(1))
        .wall_clock(Arc::new(ManualClock::new(1_000)))
        .start()
        .await
        .unwrap();
    a.set_online(false);
    a.write(vec![ChangeRecord::insert("items", id(1), name("start"))])
        .unwrap();

    std::thread::scope(|scope| {
        for writer in 0..4 {
            let a = &a;
            scope.spawn(move || {
                for n in 0..25 {
                    let value = format!("w{writer}-{n}");
                    a.write(vec![ChangeRecord::update(
                        "items",
                        id(1),
                        vec![
                            ("name".into(), SqlValue::from(value.as_str())),
                            ("price".into(), SqlValue::Real(f64::from(writer * 100 + n))),
                        ],
                    )])
                    .unwrap();
                }
            });
        }
    });

    let oplog = OplogStore::new(a.adapter.clone(), true);
    let pending = oplog.pending_transactions(0, 1_000).unwrap();
    assert_eq!(pending.len(), 101);
    let stamps: Vec<Hlc> = pending
        .iter()
        .map(|p| p.entries[0].change.timestamp)
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]), "commit order and timestamp order differ");

    let local = first_item(a.adapter.as_ref());
    assert_eq!(first_item(&replay(pending.iter())), local);
    assert_eq!(first_item(&replay(pending.iter().rev())), local);
}
