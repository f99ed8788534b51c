//! Subscription shapes.

use serde::{Deserialize, Serialize};
use std::fmt;
use tether_codec::{CodecResult, FromValue, MapReader, ToValue, Value};

/// A server-defined subset of data: a table plus an optional filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Table name.
    pub table: String,
    /// Row filter understood by the server (a SQL boolean expression).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl Shape {
    /// Shape covering a whole table.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    /// Restricts the shape with a filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl ToValue for Shape {
    fn to_value(&self) -> Value {
        let mut pairs = vec![("table", Value::from(self.table.as_str()))];
        if let Some(filter) = &self.filter {
            pairs.push(("filter", Value::from(filter.as_str())));
        }
        Value::text_map(pairs)
    }
}

impl FromValue for Shape {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "Shape")?;
        Ok(Self {
            table: reader.text("table")?.to_string(),
            filter: reader.opt_text("filter")?.map(str::to_string),
        })
    }
}

/// Server-assigned subscription identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Wraps an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
