//! Internal bookkeeping tables.
//!
//! All tables live next to the application's own tables so that they take
//! part in the same transactions.

use crate::error::SatelliteResult;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_codec::SqlValue;
use tether_protocol::ReplicaId;
use tether_storage::{AdapterExt, DatabaseAdapter, Transaction};
use tracing::info;

/// Oplog table.
pub const OPLOG_TABLE: &str = "_tether_oplog";
/// Shadow (row version) table.
pub const SHADOW_TABLE: &str = "_tether_shadow";
/// Applied migration records.
pub const MIGRATIONS_TABLE: &str = "_tether_migrations";
/// Key/value metadata.
pub const META_TABLE: &str = "_tether_meta";
/// Ids of inbound transactions already applied.
pub const RECEIVED_TABLE: &str = "_tether_received";
/// Persisted subscriptions.
pub const SUBSCRIPTIONS_TABLE: &str = "_tether_subscriptions";

/// Prefix reserved for internal tables.
pub const INTERNAL_PREFIX: &str = "_tether_";

const META_REPLICA_ID: &str = "replica_id";

const BOOTSTRAP: &str = "
CREATE TABLE IF NOT EXISTS _tether_meta (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS _tether_oplog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id TEXT NOT NULL,
    tbl TEXT NOT NULL,
    operation TEXT NOT NULL,
    change BLOB NOT NULL,
    timestamp BLOB NOT NULL,
    acked INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS _tether_oplog_pending ON _tether_oplog (acked, id);
CREATE TABLE IF NOT EXISTS _tether_shadow (
    tbl TEXT NOT NULL,
    row_key BLOB NOT NULL,
    version BLOB NOT NULL,
    max_ts BLOB NOT NULL,
    PRIMARY KEY (tbl, row_key)
);
CREATE TABLE IF NOT EXISTS _tether_migrations (
    version INTEGER PRIMARY KEY,
    checksum TEXT NOT NULL,
    applied_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _tether_received (
    tx_id TEXT PRIMARY KEY,
    origin BLOB NOT NULL,
    applied_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS _tether_received_applied_at ON _tether_received (applied_at);
CREATE TABLE IF NOT EXISTS _tether_subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shapes BLOB NOT NULL,
    server_id TEXT,
    error TEXT
);
";

/// Creates the internal tables if they do not exist yet.
pub fn bootstrap(adapter: &dyn DatabaseAdapter) -> SatelliteResult<()> {
    adapter.transact(|tx| {
        tx.execute_batch(BOOTSTRAP)?;
        Ok(())
    })
}

/// Returns true for tables owned by the engine.
pub fn is_internal_table(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Reads a metadata value.
pub fn meta_get(tx: &mut dyn Transaction, key: &str) -> SatelliteResult<Option<SqlValue>> {
    let rows = tx.run(
        "SELECT value FROM _tether_meta WHERE key = ?1",
        &[SqlValue::from(key)],
    )?;
    Ok(rows.into_iter().next().map(|row| {
        row.into_values()
            .into_iter()
            .next()
            .unwrap_or(SqlValue::Null)
    }))
}

/// Writes a metadata value.
pub fn meta_set(tx: &mut dyn Transaction, key: &str, value: SqlValue) -> SatelliteResult<()> {
    tx.execute(
        "INSERT INTO _tether_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        &[SqlValue::from(key), value],
    )?;
    Ok(())
}

/// Loads the persisted replica id, creating one on first use.
///
/// An explicit `pinned` id always wins and is persisted.
pub fn load_replica_id(
    adapter: &dyn DatabaseAdapter,
    pinned: Option<ReplicaId>,
) -> SatelliteResult<ReplicaId> {
    adapter.transact(|tx| {
        let stored = match meta_get(tx, META_REPLICA_ID)? {
            Some(SqlValue::Blob(bytes)) => ReplicaId::from_slice(&bytes),
            _ => None,
        };
        let replica = match (pinned, stored) {
            (Some(pinned), _) => pinned,
            (None, Some(stored)) => return Ok(stored),
            (None, None) => ReplicaId::random(),
        };
        if stored != Some(replica) {
            info!(replica = %replica, "persisting replica id");
            meta_set(tx, META_REPLICA_ID, SqlValue::Blob(replica.as_bytes().to_vec()))?;
        }
        Ok(replica)
    })
}

/// Wall-clock milliseconds, for bookkeeping columns.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_storage::SqliteAdapter;

    #[test]
    fn bootstrap_is_idempotent() {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();
        bootstrap(&db).unwrap();
        let rows = db
            .run(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '\\_tether\\_%' ESCAPE '\\' ORDER BY name",
                &[],
            )
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.text(0).unwrap().to_string()).collect();
        for table in [
            OPLOG_TABLE,
            SHADOW_TABLE,
            MIGRATIONS_TABLE,
            META_TABLE,
            RECEIVED_TABLE,
            SUBSCRIPTIONS_TABLE,
        ] {
            assert!(names.iter().any(|n| n == table), "missing {table}");
        }
    }

    #[test]
    fn replica_id_is_stable_unless_pinned() {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();
        let first = load_replica_id(&db, None).unwrap();
        assert_eq!(load_replica_id(&db, None).unwrap(), first);

        let pinned = ReplicaId::new([9; 16]);
        assert_eq!(load_replica_id(&db, Some(pinned)).unwrap(), pinned);
        assert_eq!(load_replica_id(&db, None).unwrap(), pinned);
    }

    #[test]
    fn internal_prefix() {
        assert!(is_internal_table(OPLOG_TABLE));
        assert!(!is_internal_table("items"));
    }
}
