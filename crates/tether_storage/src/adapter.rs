//! Execution adapter interface.
//!
//! The replication engine never talks to a database driver directly. It
//! executes SQL through a [`DatabaseAdapter`] and groups statements with
//! [`DatabaseAdapter::transaction`], so internal bookkeeping (oplog, shadow
//! rows, migration records) always commits or rolls back together with the
//! application data it describes.

use crate::error::{StorageError, StorageResult};
use std::sync::Arc;
use tether_codec::SqlValue;

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Creates a row. `columns` and `values` must have the same length.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Column values in select order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Consumes the row, returning its values.
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }

    /// Value at `idx`.
    pub fn get(&self, idx: usize) -> StorageResult<&SqlValue> {
        self.values
            .get(idx)
            .ok_or_else(|| StorageError::decode(format!("no column at index {idx}")))
    }

    /// Value of the column called `name`.
    pub fn get_named(&self, name: &str) -> StorageResult<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|idx| self.values.get(idx))
            .ok_or_else(|| StorageError::decode(format!("no column named {name}")))
    }

    /// Integer at `idx`.
    pub fn integer(&self, idx: usize) -> StorageResult<i64> {
        match self.get(idx)? {
            SqlValue::Integer(n) => Ok(*n),
            other => Err(unexpected(idx, "integer", other)),
        }
    }

    /// Optional integer at `idx`.
    pub fn opt_integer(&self, idx: usize) -> StorageResult<Option<i64>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(n) => Ok(Some(*n)),
            other => Err(unexpected(idx, "integer", other)),
        }
    }

    /// Text at `idx`.
    pub fn text(&self, idx: usize) -> StorageResult<&str> {
        match self.get(idx)? {
            SqlValue::Text(s) => Ok(s),
            other => Err(unexpected(idx, "text", other)),
        }
    }

    /// Optional text at `idx`.
    pub fn opt_text(&self, idx: usize) -> StorageResult<Option<&str>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s)),
            other => Err(unexpected(idx, "text", other)),
        }
    }

    /// Blob at `idx`.
    pub fn blob(&self, idx: usize) -> StorageResult<&[u8]> {
        match self.get(idx)? {
            SqlValue::Blob(b) => Ok(b),
            other => Err(unexpected(idx, "blob", other)),
        }
    }

    /// Optional blob at `idx`.
    pub fn opt_blob(&self, idx: usize) -> StorageResult<Option<&[u8]>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Blob(b) => Ok(Some(b)),
            other => Err(unexpected(idx, "blob", other)),
        }
    }
}

fn unexpected(idx: usize, wanted: &str, got: &SqlValue) -> StorageError {
    StorageError::decode(format!("column {idx}: expected {wanted}, got {got}"))
}

/// Statements executed inside an open transaction.
pub trait Transaction {
    /// Runs a statement and returns its result rows.
    fn run(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>>;

    /// Runs a statement that returns no rows and reports the affected count.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> StorageResult<usize>;

    /// Runs several `;`-separated statements without parameters.
    fn execute_batch(&mut self, sql: &str) -> StorageResult<()>;
}

/// The SQL execution adapter.
///
/// Implementations must serialize transactions: at most one transaction
/// body runs at a time.
pub trait DatabaseAdapter: Send + Sync {
    /// Runs a single statement outside an explicit transaction.
    fn run(&self, sql: &str, params: &[SqlValue]) -> StorageResult<Vec<Row>>;

    /// Runs `body` inside a transaction.
    ///
    /// The transaction commits if `body` returns `Ok` and rolls back
    /// otherwise. A failed commit rolls back as well.
    fn transaction(
        &self,
        body: &mut dyn FnMut(&mut dyn Transaction) -> StorageResult<()>,
    ) -> StorageResult<()>;
}

/// Typed transactions over any [`DatabaseAdapter`].
pub trait AdapterExt {
    /// Runs `body` in a transaction, returning its value or its own error.
    ///
    /// Errors from `body` roll the transaction back and are returned
    /// unchanged; adapter failures are converted with `From<StorageError>`.
    fn transact<T, E, F>(&self, body: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnMut(&mut dyn Transaction) -> Result<T, E>;
}

impl<A: DatabaseAdapter + ?Sized> AdapterExt for A {
    fn transact<T, E, F>(&self, mut body: F) -> Result<T, E>
    where
        E: From<StorageError>,
        F: FnMut(&mut dyn Transaction) -> Result<T, E>,
    {
        let mut outcome: Option<Result<T, E>> = None;
        let committed = self.transaction(&mut |tx| match body(tx) {
            Ok(value) => {
                outcome = Some(Ok(value));
                Ok(())
            }
            Err(err) => {
                outcome = Some(Err(err));
                Err(StorageError::Aborted)
            }
        });
        match (committed, outcome) {
            (Ok(()), Some(Ok(value))) => Ok(value),
            (Err(StorageError::Aborted), Some(Err(err))) => Err(err),
            (Err(err), _) => Err(err.into()),
            (Ok(()), _) => Err(StorageError::Aborted.into()),
        }
    }
}
