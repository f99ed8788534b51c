//! Applying changes to application tables.
//!
//! Local writes go straight to the row and are logged to the oplog. Remote
//! writes are merged column by column against the shadow row and are never
//! logged, so they are not sent back out.

use crate::error::{SatelliteError, SatelliteResult};
use crate::oplog::{OplogEntry, OplogStore};
use crate::schema::{is_internal_table, unix_millis};
use crate::shadow;
use tether_codec::SqlValue;
use tether_protocol::{
    ChangeRecord, Hlc, HlcClock, OperationType, ReplicaId, Resolution, RowVersion,
    Transaction as ReplicatedTransaction, TransactionId,
};
use tether_storage::{quote_ident, AdapterExt, DatabaseAdapter, Transaction};
use tracing::{debug, warn};

/// What applying one inbound transaction did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// The transaction was already applied, or originated here.
    pub duplicate: bool,
    /// Tables with at least one accepted change, in first-seen order.
    pub changed_tables: Vec<String>,
    /// Column writes (and deletes) that won.
    pub columns_accepted: u64,
    /// Column writes (and deletes) that lost.
    pub columns_rejected: u64,
    /// Decisions taken by replica-id tie-break.
    pub tie_breaks: u64,
}

impl ApplyOutcome {
    fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }

    /// True if any row changed.
    pub fn changed(&self) -> bool {
        !self.changed_tables.is_empty()
    }

    fn touch(&mut self, table: &str) {
        if !self.changed_tables.iter().any(|t| t == table) {
            self.changed_tables.push(table.to_string());
        }
    }
}

/// Issues the timestamp of a local transaction touching `changes`.
///
/// Must run inside the transaction that applies them: commit order and
/// timestamp order of local writes then agree. The result is strictly
/// greater than every timestamp already recorded for the touched rows.
pub fn local_timestamp(
    tx: &mut dyn Transaction,
    clock: &HlcClock,
    changes: &[ChangeRecord],
) -> SatelliteResult<Hlc> {
    let mut floor: Option<Hlc> = None;
    for change in changes {
        let version = shadow::load(tx, &change.table, &change.row_key()?)?;
        if let Some(ts) = version.max_timestamp() {
            if floor.map_or(true, |f| *ts > f) {
                floor = Some(*ts);
            }
        }
    }
    let timestamp = clock.now();
    match floor {
        Some(floor)
            if (floor.physical_ms, floor.logical) >= (timestamp.physical_ms, timestamp.logical) =>
        {
            Ok(clock.observe(&floor))
        }
        _ => Ok(timestamp),
    }
}

/// Applies a stamped local change and logs it, inside the caller's
/// transaction.
///
/// Fails if the row already carries a newer timestamp: a local write must
/// never be dominated by state it overwrites.
pub fn apply_local(
    tx: &mut dyn Transaction,
    transaction_id: TransactionId,
    change: &ChangeRecord,
) -> SatelliteResult<OplogEntry> {
    validate(change)?;
    let row_key = change.row_key()?;
    let mut version = shadow::load(tx, &change.table, &row_key)?;
    if let Some(existing) = version.max_timestamp() {
        if *existing > change.timestamp {
            return Err(SatelliteError::InvalidState(format!(
                "local write to {} stamped {} behind recorded {}",
                change.table, change.timestamp, existing
            )));
        }
    }

    match change.operation {
        OperationType::Insert => {
            let columns = written_columns(change);
            insert_row(tx, &change.table, &columns)?;
            for (name, _) in &columns {
                version.record_column(name.clone(), change.timestamp);
            }
        }
        OperationType::Update => {
            let columns = non_key_columns(change);
            if columns.is_empty() {
                return Err(SatelliteError::InvalidState(format!(
                    "update of {} writes no columns",
                    change.table
                )));
            }
            update_row(tx, &change.table, &change.primary_key, &columns)?;
            for (name, _) in &columns {
                version.record_column(name.clone(), change.timestamp);
            }
        }
        OperationType::Delete => {
            delete_row(tx, &change.table, &change.primary_key)?;
            version.record_delete(change.timestamp);
        }
    }

    shadow::save(tx, &change.table, &row_key, &version)?;
    OplogStore::append(tx, transaction_id, change)
}

/// Merges an inbound transaction into the local database atomically.
///
/// Transactions already applied, and transactions this replica authored,
/// are skipped.
pub fn apply_remote(
    adapter: &dyn DatabaseAdapter,
    transaction: &ReplicatedTransaction,
    own_replica: ReplicaId,
) -> SatelliteResult<ApplyOutcome> {
    if transaction.origin == own_replica {
        debug!(tx = %transaction.transaction_id, "skipping own transaction");
        return Ok(ApplyOutcome::duplicate());
    }
    adapter.transact(|tx| {
        if already_received(tx, transaction.transaction_id)? {
            return Ok(ApplyOutcome::duplicate());
        }
        let mut outcome = ApplyOutcome::default();
        for change in &transaction.changes {
            if is_internal_table(&change.table) {
                warn!(table = %change.table, "ignoring remote change to internal table");
                continue;
            }
            merge_change(tx, change, &mut outcome)?;
        }
        tx.execute(
            "INSERT INTO _tether_received (tx_id, origin, applied_at) VALUES (?1, ?2, ?3)",
            &[
                SqlValue::Text(transaction.transaction_id.to_string()),
                SqlValue::Blob(transaction.origin.as_bytes().to_vec()),
                SqlValue::Integer(unix_millis()),
            ],
        )?;
        Ok(outcome)
    })
}

fn merge_change(
    tx: &mut dyn Transaction,
    change: &ChangeRecord,
    outcome: &mut ApplyOutcome,
) -> SatelliteResult<()> {
    validate(change)?;
    let row_key = change.row_key()?;
    let mut version = shadow::load(tx, &change.table, &row_key)?;

    if change.operation == OperationType::Delete {
        let resolution = if version.max_timestamp() == Some(&change.timestamp) {
            Resolution::Accept
        } else {
            version.resolve_delete(&change.timestamp)
        };
        if resolution.is_tie_break() {
            outcome.tie_breaks += 1;
            warn!(table = %change.table, ts = %change.timestamp, accepted = resolution.accepts(), "delete decided by replica tie-break");
        }
        if resolution.accepts() {
            delete_row(tx, &change.table, &change.primary_key)?;
            version.record_delete(change.timestamp);
            outcome.columns_accepted += 1;
            outcome.touch(&change.table);
            shadow::save(tx, &change.table, &row_key, &version)?;
        } else {
            outcome.columns_rejected += 1;
        }
        return Ok(());
    }

    let candidates = match change.operation {
        OperationType::Insert => written_columns(change),
        _ => non_key_columns(change),
    };
    let mut accepted = Vec::with_capacity(candidates.len());
    for (name, value) in candidates {
        let resolution = if same_transaction(&version, &name, &change.timestamp) {
            Resolution::Accept
        } else {
            version.resolve_column(&name, &change.timestamp)
        };
        if resolution.is_tie_break() {
            outcome.tie_breaks += 1;
            warn!(
                table = %change.table,
                column = %name,
                ts = %change.timestamp,
                accepted = resolution.accepts(),
                "column decided by replica tie-break"
            );
        }
        if resolution.accepts() {
            accepted.push((name, value));
        } else {
            outcome.columns_rejected += 1;
        }
    }
    if accepted.is_empty() {
        return Ok(());
    }

    let values: Vec<_> = accepted
        .iter()
        .filter(|(name, _)| !is_key(change, name))
        .cloned()
        .collect();
    if row_exists(tx, &change.table, &change.primary_key)? {
        if !values.is_empty() {
            update_row(tx, &change.table, &change.primary_key, &values)?;
        }
    } else {
        let mut row = change.primary_key.clone();
        row.extend(values);
        insert_row(tx, &change.table, &row)?;
    }

    outcome.columns_accepted += accepted.len() as u64;
    for (name, _) in accepted {
        version.record_column(name, change.timestamp);
    }
    outcome.touch(&change.table);
    shadow::save(tx, &change.table, &row_key, &version)
}

/// Changes of one transaction share its timestamp, so an equal timestamp on
/// the column means an earlier change of the transaction being applied.
fn same_transaction(version: &RowVersion, column: &str, incoming: &Hlc) -> bool {
    [version.column(column), version.tombstone()]
        .into_iter()
        .flatten()
        .max()
        == Some(incoming)
}

fn validate(change: &ChangeRecord) -> SatelliteResult<()> {
    if change.primary_key.is_empty() {
        return Err(SatelliteError::InvalidState(format!(
            "change to {} has no primary key",
            change.table
        )));
    }
    if is_internal_table(&change.table) {
        return Err(SatelliteError::InvalidState(format!(
            "{} is an internal table",
            change.table
        )));
    }
    Ok(())
}

fn is_key(change: &ChangeRecord, column: &str) -> bool {
    change.primary_key.iter().any(|(name, _)| name == column)
}

/// Primary key followed by every other written column.
fn written_columns(change: &ChangeRecord) -> Vec<(String, SqlValue)> {
    let mut columns = change.primary_key.clone();
    columns.extend(non_key_columns(change));
    columns
}

fn non_key_columns(change: &ChangeRecord) -> Vec<(String, SqlValue)> {
    change
        .columns
        .iter()
        .filter(|(name, _)| !is_key(change, name))
        .cloned()
        .collect()
}

fn key_clause(primary_key: &[(String, SqlValue)], first_param: usize) -> String {
    primary_key
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| format!("{} = ?{}", quote_ident(name), first_param + idx))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn key_params(primary_key: &[(String, SqlValue)]) -> impl Iterator<Item = SqlValue> + '_ {
    primary_key.iter().map(|(_, value)| value.clone())
}

fn insert_row(
    tx: &mut dyn Transaction,
    table: &str,
    columns: &[(String, SqlValue)],
) -> SatelliteResult<()> {
    let names = columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len())
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({names}) VALUES ({placeholders})",
        quote_ident(table)
    );
    let params: Vec<_> = columns.iter().map(|(_, value)| value.clone()).collect();
    tx.execute(&sql, &params)?;
    Ok(())
}

fn update_row(
    tx: &mut dyn Transaction,
    table: &str,
    primary_key: &[(String, SqlValue)],
    columns: &[(String, SqlValue)],
) -> SatelliteResult<()> {
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(idx, (name, _))| format!("{} = ?{}", quote_ident(name), idx + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE {}",
        quote_ident(table),
        key_clause(primary_key, columns.len() + 1)
    );
    let params: Vec<_> = columns
        .iter()
        .map(|(_, value)| value.clone())
        .chain(key_params(primary_key))
        .collect();
    tx.execute(&sql, &params)?;
    Ok(())
}

fn delete_row(
    tx: &mut dyn Transaction,
    table: &str,
    primary_key: &[(String, SqlValue)],
) -> SatelliteResult<()> {
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(table),
        key_clause(primary_key, 1)
    );
    let params: Vec<_> = key_params(primary_key).collect();
    tx.execute(&sql, &params)?;
    Ok(())
}

fn row_exists(
    tx: &mut dyn Transaction,
    table: &str,
    primary_key: &[(String, SqlValue)],
) -> SatelliteResult<bool> {
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} LIMIT 1",
        quote_ident(table),
        key_clause(primary_key, 1)
    );
    let params: Vec<_> = key_params(primary_key).collect();
    Ok(!tx.run(&sql, &params)?.is_empty())
}

fn already_received(tx: &mut dyn Transaction, transaction_id: TransactionId) -> SatelliteResult<bool> {
    let rows = tx.run(
        "SELECT 1 FROM _tether_received WHERE tx_id = ?1",
        &[SqlValue::Text(transaction_id.to_string())],
    )?;
    Ok(!rows.is_empty())
}

/// Forgets inbound transaction ids applied before `cutoff_ms` (unix
/// milliseconds). Returns how many were forgotten.
///
/// A transaction redelivered after its id is forgotten is merged again;
/// its column timestamps lose to or equal what is stored, so rows keep
/// their values.
pub fn prune_received(adapter: &dyn DatabaseAdapter, cutoff_ms: i64) -> SatelliteResult<u64> {
    let removed = adapter.transact(|tx| {
        tx.execute(
            "DELETE FROM _tether_received WHERE applied_at < ?1",
            &[SqlValue::Integer(cutoff_ms)],
        )
    })?;
    Ok(removed as u64)
}
