//! Row changes and transactions.

use crate::hlc::{Hlc, ReplicaId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tether_codec::{
    to_canonical_cbor, CodecError, CodecResult, FromValue, MapReader, SqlValue, ToValue, Value,
};
use uuid::Uuid;

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Row was inserted.
    Insert,
    /// Columns of an existing row were updated.
    Update,
    /// Row was deleted.
    Delete,
}

impl OperationType {
    /// Converts to a numeric code for CBOR encoding.
    pub fn to_code(&self) -> u8 {
        match self {
            OperationType::Insert => 1,
            OperationType::Update => 2,
            OperationType::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationType::Insert),
            2 => Some(OperationType::Update),
            3 => Some(OperationType::Delete),
            _ => None,
        }
    }

    /// Lowercase name, as stored in the oplog table.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    /// Parses [`as_str`](Self::as_str) output.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "insert" => Some(OperationType::Insert),
            "update" => Some(OperationType::Update),
            "delete" => Some(OperationType::Delete),
            _ => None,
        }
    }
}

/// Globally unique transaction identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Generates a fresh id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps raw id bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parses the hyphenated text form.
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({self})")
    }
}

/// Ordered `(column, value)` pairs.
pub type Columns = Vec<(String, SqlValue)>;

/// One row mutation, stamped with the HLC of its writer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    /// Table name.
    pub table: String,
    /// Primary key columns and values.
    pub primary_key: Columns,
    /// Kind of mutation.
    pub operation: OperationType,
    /// Written columns. Empty for deletes.
    pub columns: Columns,
    /// Timestamp of the write.
    pub timestamp: Hlc,
}

impl ChangeRecord {
    /// Creates an insert. The timestamp is assigned when the change is written.
    pub fn insert(table: impl Into<String>, primary_key: Columns, columns: Columns) -> Self {
        Self::unstamped(table, primary_key, OperationType::Insert, columns)
    }

    /// Creates an update. The timestamp is assigned when the change is written.
    pub fn update(table: impl Into<String>, primary_key: Columns, columns: Columns) -> Self {
        Self::unstamped(table, primary_key, OperationType::Update, columns)
    }

    /// Creates a delete. The timestamp is assigned when the change is written.
    pub fn delete(table: impl Into<String>, primary_key: Columns) -> Self {
        Self::unstamped(table, primary_key, OperationType::Delete, Vec::new())
    }

    fn unstamped(
        table: impl Into<String>,
        primary_key: Columns,
        operation: OperationType,
        columns: Columns,
    ) -> Self {
        Self {
            table: table.into(),
            primary_key,
            operation,
            columns,
            timestamp: Hlc::default(),
        }
    }

    /// Returns a copy stamped with `timestamp`.
    pub fn with_timestamp(mut self, timestamp: Hlc) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Canonical encoding of the primary key, independent of column order.
    ///
    /// Used to key per-row bookkeeping.
    pub fn row_key(&self) -> CodecResult<Vec<u8>> {
        encode_row_key(&self.primary_key)
    }

    /// Looks up a written column value.
    pub fn column(&self, name: &str) -> Option<&SqlValue> {
        self.columns.iter().find(|(c, _)| c == name).map(|(_, v)| v)
    }
}

/// Canonical encoding of a primary key.
pub fn encode_row_key(primary_key: &[(String, SqlValue)]) -> CodecResult<Vec<u8>> {
    let mut sorted: Vec<_> = primary_key.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    to_canonical_cbor(&columns_to_value(sorted.into_iter()))
}

fn columns_to_value<'a>(columns: impl Iterator<Item = &'a (String, SqlValue)>) -> Value {
    Value::Array(
        columns
            .map(|(name, value)| Value::Array(vec![Value::from(name.as_str()), value.to_value()]))
            .collect(),
    )
}

fn columns_from_value(items: &[Value], context: &str) -> CodecResult<Columns> {
    items
        .iter()
        .map(|item| match item.as_array() {
            Some([Value::Text(name), value]) => Ok((name.clone(), SqlValue::from_value(value)?)),
            _ => Err(CodecError::invalid_structure(format!(
                "{context} entries must be [column, value] pairs"
            ))),
        })
        .collect()
}

impl ToValue for ChangeRecord {
    fn to_value(&self) -> Value {
        Value::text_map(vec![
            ("table", Value::from(self.table.as_str())),
            ("primary_key", columns_to_value(self.primary_key.iter())),
            (
                "operation",
                Value::Integer(i64::from(self.operation.to_code())),
            ),
            ("columns", columns_to_value(self.columns.iter())),
            ("timestamp", self.timestamp.to_value()),
        ])
    }
}

impl FromValue for ChangeRecord {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "ChangeRecord")?;
        let code = reader.u64("operation")?;
        let operation = u8::try_from(code)
            .ok()
            .and_then(OperationType::from_code)
            .ok_or_else(|| CodecError::invalid_structure(format!("unknown operation {code}")))?;
        Ok(Self {
            table: reader.text("table")?.to_string(),
            primary_key: columns_from_value(reader.array("primary_key")?, "primary_key")?,
            operation,
            columns: columns_from_value(reader.array_or_empty("columns")?, "columns")?,
            timestamp: Hlc::from_value(reader.required("timestamp")?)?,
        })
    }
}

/// A group of changes committed together on one replica.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Transaction id.
    pub transaction_id: TransactionId,
    /// Replica that committed it.
    pub origin: ReplicaId,
    /// Commit timestamp.
    pub commit_timestamp: Hlc,
    /// Changes in commit order.
    pub changes: Vec<ChangeRecord>,
}

impl Transaction {
    /// Names of the tables touched, deduplicated, in first-seen order.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for change in &self.changes {
            if !tables.contains(&change.table) {
                tables.push(change.table.clone());
            }
        }
        tables
    }
}

impl ToValue for Transaction {
    fn to_value(&self) -> Value {
        Value::text_map(vec![
            (
                "transaction_id",
                Value::Bytes(self.transaction_id.as_bytes().to_vec()),
            ),
            ("origin", Value::Bytes(self.origin.as_bytes().to_vec())),
            ("commit_timestamp", self.commit_timestamp.to_value()),
            (
                "changes",
                Value::Array(self.changes.iter().map(ToValue::to_value).collect()),
            ),
        ])
    }
}

impl FromValue for Transaction {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "Transaction")?;
        let changes = reader
            .array_or_empty("changes")?
            .iter()
            .map(ChangeRecord::from_value)
            .collect::<CodecResult<Vec<_>>>()?;
        Ok(Self {
            transaction_id: TransactionId::from_bytes(reader.byte_array::<16>("transaction_id")?),
            origin: ReplicaId::new(reader.byte_array::<16>("origin")?),
            commit_timestamp: Hlc::from_value(reader.required("commit_timestamp")?)?,
            changes,
        })
    }
}
