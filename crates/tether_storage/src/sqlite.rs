//! SQLite execution adapter.

use crate::adapter::{DatabaseAdapter, Row, Transaction};
use crate::error::StorageResult;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_codec::SqlValue;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// [`DatabaseAdapter`] over a single SQLite connection.
///
/// The connection sits behind a mutex, so transactions are serialized.
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteAdapter {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        Self::configure(&conn)?;
        debug!(path = %path.display(), "opened sqlite database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(conn: &Connection) -> StorageResult<()> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl DatabaseAdapter for SqliteAdapter {
    fn run(&self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        let conn = self.conn.lock();
        query(&conn, sql, params)
    }

    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut handle = SqliteTransaction { conn: &tx };
        // Dropping `tx` without commit rolls back.
        body(&mut handle)?;
        tx.commit()?;
        Ok(())
    }
}

struct SqliteTransaction<'a> {
    conn: &'a Connection,
}

impl Transaction for SqliteTransaction<'_> {
    fn run(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
        query(self.conn, sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter().map(to_sqlite)))?)
    }

    fn execute_batch(&mut self, sql: &str) -> StorageResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }
}

fn query(conn: &Connection, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns: Arc<[String]> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
        .into();
    let count = columns.len();
    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sqlite)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..count)
            .map(|idx| row.get_ref(idx).map(from_sqlite))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Row::new(columns.clone(), values));
    }
    Ok(out)
}

fn to_sqlite(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(n) => SqliteValue::Integer(*n),
        SqlValue::Real(f) => SqliteValue::Real(*f),
        SqlValue::Text(s) => SqliteValue::Text(s.clone()),
        SqlValue::Blob(b) => SqliteValue::Blob(b.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterExt;
    use crate::error::StorageError;
    use tempfile::tempdir;

    fn adapter() -> SqliteAdapter {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter
            .transact(|tx| {
                tx.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, data BLOB)")
            })
            .unwrap();
        adapter
    }

    #[test]
    fn run_returns_typed_rows() {
        let db = adapter();
        db.transact(|tx| {
            tx.execute(
                "INSERT INTO items (id, name, price, data) VALUES (?1, ?2, ?3, ?4)",
                &[
                    SqlValue::Integer(1),
                    SqlValue::from("widget"),
                    SqlValue::Real(2.5),
                    SqlValue::Blob(vec![1, 2]),
                ],
            )
        })
        .unwrap();

        let rows = db.run("SELECT id, name, price, data FROM items", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.integer(0).unwrap(), 1);
        assert_eq!(row.text(1).unwrap(), "widget");
        assert_eq!(row.get_named("price").unwrap(), &SqlValue::Real(2.5));
        assert_eq!(row.blob(3).unwrap(), &[1, 2]);
        assert!(row.text(0).is_err());
        assert!(row.get(9).is_err());
    }

    #[test]
    fn failed_body_rolls_back() {
        let db = adapter();
        let result: StorageResult<()> = db.transact(|tx| {
            tx.execute("INSERT INTO items (id, name) VALUES (1, 'a')", &[])?;
            tx.execute("INSERT INTO items (id, name) VALUES (1, 'b')", &[])?;
            Ok(())
        });
        assert!(matches!(result, Err(StorageError::Constraint(_))));
        assert!(db.run("SELECT * FROM items", &[]).unwrap().is_empty());
    }

    #[test]
    fn body_error_type_is_preserved() {
        #[derive(Debug, PartialEq)]
        enum AppError {
            Storage,
            Refused,
        }
        impl From<StorageError> for AppError {
            fn from(_: StorageError) -> Self {
                AppError::Storage
            }
        }

        let db = adapter();
        let result: Result<(), AppError> = db.transact(|tx| {
            tx.execute("INSERT INTO items (id) VALUES (7)", &[])?;
            Err(AppError::Refused)
        });
        assert_eq!(result, Err(AppError::Refused));
        assert!(db.run("SELECT * FROM items", &[]).unwrap().is_empty());

        let value: Result<i64, AppError> = db.transact(|tx| {
            tx.execute("INSERT INTO items (id) VALUES (8)", &[])?;
            Ok(8)
        });
        assert_eq!(value, Ok(8));
    }

    #[test]
    fn file_database_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let db = SqliteAdapter::open(&path).unwrap();
            db.transact(|tx| {
                tx.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v TEXT); INSERT INTO kv VALUES ('a', 'b');")
            })
            .unwrap();
            assert_eq!(db.path(), Some(path.as_path()));
        }
        let db = SqliteAdapter::open(&path).unwrap();
        let rows = db.run("SELECT v FROM kv WHERE k = ?1", &[SqlValue::from("a")]).unwrap();
        assert_eq!(rows[0].text(0).unwrap(), "b");
    }
}
