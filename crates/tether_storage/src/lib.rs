//! # Tether Storage
//!
//! The SQL execution adapter consumed by the Tether replication engine.
//!
//! The engine keeps its bookkeeping tables in the same database as the
//! application data, so everything it needs from a driver fits in two
//! traits:
//!
//! - [`DatabaseAdapter`]: run a statement, or run a closure in a transaction
//! - [`Transaction`]: statements executed inside that closure
//!
//! [`SqliteAdapter`] implements both over a `rusqlite` connection.
//!
//! ## Example
//!
//! ```rust
//! use tether_storage::{AdapterExt, DatabaseAdapter, SqliteAdapter, StorageError};
//! use tether_codec::SqlValue;
//!
//! let db = SqliteAdapter::open_in_memory().unwrap();
//! db.transact(|tx| {
//!     tx.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")?;
//!     tx.execute("INSERT INTO notes VALUES (?1, ?2)", &[SqlValue::Integer(1), SqlValue::from("hi")])?;
//!     Ok::<_, StorageError>(())
//! })
//! .unwrap();
//!
//! let rows = db.run("SELECT body FROM notes", &[]).unwrap();
//! assert_eq!(rows[0].get(0).unwrap(), &SqlValue::from("hi"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod error;
mod sqlite;

pub use adapter::{AdapterExt, DatabaseAdapter, Row, Transaction};
pub use error::{StorageError, StorageResult};
pub use sqlite::SqliteAdapter;

/// Quotes an SQL identifier (table or column name).
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("items"), "\"items\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
