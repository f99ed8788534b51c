//! Operation log.
//!
//! Every local write appends one entry per changed row inside the same
//! adapter transaction as the row change itself. Entries are immutable;
//! the only state change is the `acked` flag, which moves forward as a
//! prefix of the id order.

use crate::error::{SatelliteError, SatelliteResult};
use crate::schema::{meta_get, meta_set};
use std::sync::Arc;
use tether_codec::{FromValue, SqlValue, ToValue};
use tether_protocol::{ChangeRecord, Hlc, ReplicaId, Transaction as ReplicatedTransaction, TransactionId};
use tether_storage::{AdapterExt, DatabaseAdapter, Row, Transaction};
use tracing::debug;

const META_ACKED_UPTO: &str = "oplog_acked_upto";

/// One durable oplog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OplogEntry {
    /// Monotonic local sequence number.
    pub id: u64,
    /// Local transaction the entry belongs to.
    pub transaction_id: TransactionId,
    /// The row change, including its HLC timestamp.
    pub change: ChangeRecord,
}

/// Entries of one local transaction, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Entries, ordered by id.
    pub entries: Vec<OplogEntry>,
}

impl PendingTransaction {
    /// Id of the last entry; acknowledging the transaction acks up to here.
    pub fn last_entry_id(&self) -> u64 {
        self.entries.last().map_or(0, |e| e.id)
    }

    /// Builds the wire transaction sent for these entries.
    pub fn to_replicated(&self, origin: ReplicaId) -> ReplicatedTransaction {
        let commit_timestamp = self
            .entries
            .iter()
            .map(|e| e.change.timestamp)
            .max()
            .unwrap_or_default();
        ReplicatedTransaction {
            transaction_id: self.transaction_id,
            origin,
            commit_timestamp,
            changes: self.entries.iter().map(|e| e.change.clone()).collect(),
        }
    }
}

/// Access to the oplog table.
#[derive(Clone)]
pub struct OplogStore {
    adapter: Arc<dyn DatabaseAdapter>,
    prune: bool,
}

impl OplogStore {
    /// Creates a store over `adapter`. With `prune`, acknowledged entries are
    /// deleted.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, prune: bool) -> Self {
        Self { adapter, prune }
    }

    /// Appends an entry inside the caller's transaction.
    ///
    /// Must be called from the transaction that performs the row change so
    /// that both commit or neither does.
    pub fn append(
        tx: &mut dyn Transaction,
        transaction_id: TransactionId,
        change: &ChangeRecord,
    ) -> SatelliteResult<OplogEntry> {
        let rows = tx.run(
            "INSERT INTO _tether_oplog (tx_id, tbl, operation, change, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            &[
                SqlValue::Text(transaction_id.to_string()),
                SqlValue::from(change.table.as_str()),
                SqlValue::from(change.operation.as_str()),
                SqlValue::Blob(change.to_cbor()?),
                SqlValue::Blob(change.timestamp.to_bytes().to_vec()),
            ],
        )?;
        let id = rows
            .first()
            .map(|row| row.integer(0))
            .transpose()?
            .ok_or_else(|| SatelliteError::InvalidState("oplog insert returned no id".into()))?;
        Ok(OplogEntry {
            id: to_u64(id),
            transaction_id,
            change: change.clone(),
        })
    }

    /// Unacknowledged entries with id greater than `cursor`, in order.
    pub fn read_since(&self, cursor: u64, limit: usize) -> SatelliteResult<Vec<OplogEntry>> {
        let rows = self.adapter.run(
            "SELECT id, tx_id, change FROM _tether_oplog
             WHERE id > ?1 AND acked = 0 ORDER BY id LIMIT ?2",
            &[to_sql(cursor), to_sql(limit as u64)],
        )?;
        rows.iter().map(decode_entry).collect()
    }

    /// Up to `limit` whole transactions whose entries all follow `cursor`,
    /// in commit order.
    pub fn pending_transactions(
        &self,
        cursor: u64,
        limit: usize,
    ) -> SatelliteResult<Vec<PendingTransaction>> {
        let heads = self.adapter.run(
            "SELECT tx_id, MIN(id) AS first_id FROM _tether_oplog
             WHERE id > ?1 AND acked = 0
             GROUP BY tx_id ORDER BY first_id LIMIT ?2",
            &[to_sql(cursor), to_sql(limit as u64)],
        )?;
        let mut out = Vec::with_capacity(heads.len());
        for head in heads {
            let tx_id = head.text(0)?.to_string();
            let rows = self.adapter.run(
                "SELECT id, tx_id, change FROM _tether_oplog WHERE tx_id = ?1 ORDER BY id",
                &[SqlValue::Text(tx_id)],
            )?;
            let entries = rows.iter().map(decode_entry).collect::<SatelliteResult<Vec<_>>>()?;
            if let Some(first) = entries.first() {
                out.push(PendingTransaction {
                    transaction_id: first.transaction_id,
                    entries,
                });
            }
        }
        Ok(out)
    }

    /// Marks every entry with id up to `upto` as acknowledged.
    pub fn ack(&self, upto: u64) -> SatelliteResult<()> {
        let prune = self.prune;
        self.adapter.transact(|tx| {
            let previous = acked_upto(tx)?;
            if upto <= previous {
                return Ok(());
            }
            if prune {
                tx.execute("DELETE FROM _tether_oplog WHERE id <= ?1", &[to_sql(upto)])?;
            } else {
                tx.execute(
                    "UPDATE _tether_oplog SET acked = 1 WHERE id <= ?1 AND acked = 0",
                    &[to_sql(upto)],
                )?;
            }
            meta_set(tx, META_ACKED_UPTO, to_sql(upto))?;
            Ok::<_, SatelliteError>(())
        })?;
        debug!(upto, prune, "oplog acknowledged");
        Ok(())
    }

    /// Highest acknowledged entry id; sending resumes after it.
    pub fn acked_upto(&self) -> SatelliteResult<u64> {
        self.adapter.transact(|tx| acked_upto(tx))
    }

    /// Number of unacknowledged entries.
    pub fn pending_count(&self) -> SatelliteResult<u64> {
        let rows = self
            .adapter
            .run("SELECT COUNT(*) FROM _tether_oplog WHERE acked = 0", &[])?;
        let count = rows.first().map(|r| r.integer(0)).transpose()?.unwrap_or(0);
        Ok(to_u64(count))
    }

    /// Largest timestamp recorded in the oplog.
    pub fn max_timestamp(&self) -> SatelliteResult<Option<Hlc>> {
        let rows = self
            .adapter
            .run("SELECT MAX(timestamp) FROM _tether_oplog", &[])?;
        match rows.first().map(|r| r.opt_blob(0)).transpose()?.flatten() {
            Some(bytes) => Ok(Some(Hlc::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for OplogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OplogStore")
            .field("prune", &self.prune)
            .finish_non_exhaustive()
    }
}

fn acked_upto(tx: &mut dyn Transaction) -> SatelliteResult<u64> {
    match meta_get(tx, META_ACKED_UPTO)? {
        Some(SqlValue::Integer(n)) => Ok(to_u64(n)),
        _ => Ok(0),
    }
}

fn decode_entry(row: &Row) -> SatelliteResult<OplogEntry> {
    let tx_id = row.text(1)?;
    let transaction_id = TransactionId::parse(tx_id)
        .ok_or_else(|| SatelliteError::Codec(format!("bad transaction id {tx_id:?}")))?;
    Ok(OplogEntry {
        id: to_u64(row.integer(0)?),
        transaction_id,
        change: ChangeRecord::from_cbor(row.blob(2)?)?,
    })
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn to_sql(n: u64) -> SqlValue {
    SqlValue::Integer(i64::try_from(n).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bootstrap;
    use tether_storage::{SqliteAdapter, StorageError};

    fn store(prune: bool) -> OplogStore {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();
        OplogStore::new(Arc::new(db), prune)
    }

    fn change(id: i64, physical: u64) -> ChangeRecord {
        ChangeRecord::insert(
            "items",
            vec![("id".into(), SqlValue::Integer(id))],
            vec![("id".into(), SqlValue::Integer(id))],
        )
        .with_timestamp(Hlc::new(physical, 0, ReplicaId::new([1; 16])))
    }

    fn append_tx(store: &OplogStore, changes: &[ChangeRecord]) -> TransactionId {
        let tx_id = TransactionId::random();
        store
            .adapter
            .transact(|tx| {
                for c in changes {
                    OplogStore::append(tx, tx_id, c)?;
                }
                Ok::<_, SatelliteError>(())
            })
            .unwrap();
        tx_id
    }

    #[test]
    fn append_assigns_increasing_ids() {
        let store = store(true);
        append_tx(&store, &[change(1, 10), change(2, 10)]);
        append_tx(&store, &[change(3, 11)]);

        let entries = store.read_since(0, 100).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(entries[0].transaction_id, entries[1].transaction_id);
        assert_ne!(entries[1].transaction_id, entries[2].transaction_id);
        assert_eq!(store.read_since(2, 100).unwrap().len(), 1);
    }

    #[test]
    fn append_rolls_back_with_its_transaction() {
        let store = store(true);
        let result: Result<(), SatelliteError> = store.adapter.transact(|tx| {
            OplogStore::append(tx, TransactionId::random(), &change(1, 1))?;
            Err(StorageError::Aborted.into())
        });
        assert!(result.is_err());
        assert_eq!(store.pending_count().unwrap(), 0);
    }

    #[test]
    fn pending_transactions_are_whole_and_ordered() {
        let store = store(true);
        let first = append_tx(&store, &[change(1, 5), change(2, 5), change(3, 5)]);
        let second = append_tx(&store, &[change(4, 6)]);

        let pending = store.pending_transactions(0, 1).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].transaction_id, first);
        assert_eq!(pending[0].entries.len(), 3);
        assert_eq!(pending[0].last_entry_id(), 3);

        let rest = store.pending_transactions(3, 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].transaction_id, second);

        let wire = pending[0].to_replicated(ReplicaId::new([1; 16]));
        assert_eq!(wire.changes.len(), 3);
        assert_eq!(wire.commit_timestamp.physical_ms, 5);
    }

    #[test]
    fn ack_prunes_prefix_and_remembers_cursor() {
        let store = store(true);
        append_tx(&store, &[change(1, 1)]);
        append_tx(&store, &[change(2, 2)]);
        store.ack(1).unwrap();

        assert_eq!(store.acked_upto().unwrap(), 1);
        assert_eq!(store.pending_count().unwrap(), 1);
        assert_eq!(store.read_since(0, 10).unwrap()[0].id, 2);

        store.ack(0).unwrap();
        assert_eq!(store.acked_upto().unwrap(), 1);
    }

    #[test]
    fn ack_without_prune_keeps_entries() {
        let store = store(false);
        append_tx(&store, &[change(1, 1)]);
        store.ack(1).unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);
        let rows = store
            .adapter
            .run("SELECT COUNT(*) FROM _tether_oplog", &[])
            .unwrap();
        assert_eq!(rows[0].integer(0).unwrap(), 1);
    }

    #[test]
    fn max_timestamp_reads_latest() {
        let store = store(true);
        assert_eq!(store.max_timestamp().unwrap(), None);
        append_tx(&store, &[change(1, 7)]);
        append_tx(&store, &[change(2, 3)]);
        assert_eq!(store.max_timestamp().unwrap().unwrap().physical_ms, 7);
    }
}
