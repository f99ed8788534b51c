//! Shadow rows: per-column version vectors for replicated rows.

use crate::error::SatelliteResult;
use tether_codec::{FromValue, SqlValue, ToValue};
use tether_protocol::{Hlc, RowVersion};
use tether_storage::{DatabaseAdapter, Transaction};

/// Loads the version vector of a row, empty if the row was never written.
pub fn load(tx: &mut dyn Transaction, table: &str, row_key: &[u8]) -> SatelliteResult<RowVersion> {
    let rows = tx.run(
        "SELECT version FROM _tether_shadow WHERE tbl = ?1 AND row_key = ?2",
        &[SqlValue::from(table), SqlValue::Blob(row_key.to_vec())],
    )?;
    match rows.first() {
        Some(row) => Ok(RowVersion::from_cbor(row.blob(0)?)?),
        None => Ok(RowVersion::new()),
    }
}

/// Stores the version vector of a row.
pub fn save(
    tx: &mut dyn Transaction,
    table: &str,
    row_key: &[u8],
    version: &RowVersion,
) -> SatelliteResult<()> {
    let max_ts = version
        .max_timestamp()
        .map(|ts| ts.to_bytes().to_vec())
        .unwrap_or_default();
    tx.execute(
        "INSERT INTO _tether_shadow (tbl, row_key, version, max_ts) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (tbl, row_key) DO UPDATE SET version = excluded.version, max_ts = excluded.max_ts",
        &[
            SqlValue::from(table),
            SqlValue::Blob(row_key.to_vec()),
            SqlValue::Blob(version.to_cbor()?),
            SqlValue::Blob(max_ts),
        ],
    )?;
    Ok(())
}

/// Largest timestamp recorded in any shadow row.
pub fn max_timestamp(adapter: &dyn DatabaseAdapter) -> SatelliteResult<Option<Hlc>> {
    let rows = adapter.run("SELECT MAX(max_ts) FROM _tether_shadow", &[])?;
    match rows.first().map(|r| r.opt_blob(0)).transpose()?.flatten() {
        Some(bytes) if !bytes.is_empty() => Ok(Some(Hlc::from_bytes(bytes)?)),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bootstrap;
    use tether_protocol::ReplicaId;
    use tether_storage::{AdapterExt, SqliteAdapter};

    fn ts(physical: u64) -> Hlc {
        Hlc::new(physical, 0, ReplicaId::new([2; 16]))
    }

    #[test]
    fn save_and_load() {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();

        let mut version = RowVersion::new();
        version.record_column("name", ts(5));
        version.record_column("price", ts(9));

        db.transact(|tx| {
            assert_eq!(load(tx, "items", b"k")?, RowVersion::new());
            save(tx, "items", b"k", &version)?;
            assert_eq!(load(tx, "items", b"k")?, version);
            Ok::<_, crate::SatelliteError>(())
        })
        .unwrap();

        assert_eq!(max_timestamp(&db).unwrap(), Some(ts(9)));
    }

    #[test]
    fn save_overwrites() {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();
        assert_eq!(max_timestamp(&db).unwrap(), None);

        db.transact(|tx| {
            let mut version = RowVersion::new();
            version.record_column("name", ts(1));
            save(tx, "items", b"k", &version)?;
            version.record_delete(ts(3));
            save(tx, "items", b"k", &version)?;
            assert_eq!(load(tx, "items", b"k")?.tombstone(), Some(&ts(3)));
            Ok::<_, crate::SatelliteError>(())
        })
        .unwrap();
    }
}
