//! Column-level conflict resolution.
//!
//! Resolution is a pure function of timestamps. Storage and transport never
//! take part, so the outcome of a merge depends only on the HLC values
//! involved and not on the order in which writes arrive.

use crate::hlc::Hlc;
use std::collections::BTreeMap;
use tether_codec::{CodecError, CodecResult, FromValue, MapReader, ToValue, Value};

/// Outcome of comparing an incoming write with the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming timestamp strictly dominates; take the remote value.
    Accept,
    /// Local state dominates, or the write was already applied.
    Reject,
    /// Timestamps share physical and logical time; decided by replica id.
    TieBreak {
        /// Whether the incoming write won.
        accept: bool,
    },
}

impl Resolution {
    /// Whether the incoming write should be applied.
    pub fn accepts(&self) -> bool {
        match self {
            Resolution::Accept => true,
            Resolution::Reject => false,
            Resolution::TieBreak { accept } => *accept,
        }
    }

    /// Whether this outcome came from the replica-id tie-break.
    pub fn is_tie_break(&self) -> bool {
        matches!(self, Resolution::TieBreak { .. })
    }
}

/// Compares an incoming write timestamp with the existing one.
pub fn resolve(incoming: &Hlc, existing: Option<&Hlc>) -> Resolution {
    let Some(existing) = existing else {
        return Resolution::Accept;
    };
    if incoming == existing {
        return Resolution::Reject;
    }
    if incoming.same_instant(existing) {
        return Resolution::TieBreak {
            accept: incoming.replica > existing.replica,
        };
    }
    if incoming > existing {
        Resolution::Accept
    } else {
        Resolution::Reject
    }
}

/// Per-row shadow state: the last writer of every column, and of the row's
/// most recent delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowVersion {
    columns: BTreeMap<String, Hlc>,
    tombstone: Option<Hlc>,
}

impl RowVersion {
    /// Empty shadow state for a row never seen before.
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp of the last write to `column`.
    pub fn column(&self, column: &str) -> Option<&Hlc> {
        self.columns.get(column)
    }

    /// All column timestamps.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Hlc)> {
        self.columns.iter().map(|(c, t)| (c.as_str(), t))
    }

    /// Timestamp of the delete that last removed the row.
    pub fn tombstone(&self) -> Option<&Hlc> {
        self.tombstone.as_ref()
    }

    /// Largest timestamp recorded for this row.
    pub fn max_timestamp(&self) -> Option<&Hlc> {
        self.columns.values().chain(self.tombstone.iter()).max()
    }

    /// True if the row currently exists: never deleted, or written after its
    /// last delete.
    pub fn is_live(&self) -> bool {
        match &self.tombstone {
            None => !self.columns.is_empty(),
            Some(tombstone) => self.columns.values().any(|t| t > tombstone),
        }
    }

    /// Resolves an incoming write to `column`.
    ///
    /// A write must also dominate the tombstone; if it does the row is
    /// resurrected.
    pub fn resolve_column(&self, column: &str, incoming: &Hlc) -> Resolution {
        let effective = match (self.columns.get(column), self.tombstone.as_ref()) {
            (Some(written), Some(deleted)) => Some(written.max(deleted)),
            (written, deleted) => written.or(deleted),
        };
        resolve(incoming, effective)
    }

    /// Resolves an incoming delete against every timestamp of the row.
    pub fn resolve_delete(&self, incoming: &Hlc) -> Resolution {
        resolve(incoming, self.max_timestamp())
    }

    /// Records the winning write of `column`.
    pub fn record_column(&mut self, column: impl Into<String>, timestamp: Hlc) {
        self.columns.insert(column.into(), timestamp);
    }

    /// Records the winning delete of the row.
    pub fn record_delete(&mut self, timestamp: Hlc) {
        self.tombstone = Some(timestamp);
    }
}

impl ToValue for RowVersion {
    fn to_value(&self) -> Value {
        let columns = self
            .columns
            .iter()
            .map(|(column, ts)| (Value::from(column.as_str()), ts.to_value()))
            .collect();
        let mut pairs = vec![("columns", Value::map(columns))];
        if let Some(tombstone) = &self.tombstone {
            pairs.push(("tombstone", tombstone.to_value()));
        }
        Value::text_map(pairs)
    }
}

impl FromValue for RowVersion {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "RowVersion")?;
        let pairs = reader
            .required("columns")?
            .as_map()
            .ok_or_else(|| CodecError::invalid_structure("RowVersion.columns must be a map"))?;
        let mut columns = BTreeMap::new();
        for (key, ts) in pairs {
            let column = key
                .as_text()
                .ok_or_else(|| CodecError::invalid_structure("column names must be text"))?;
            columns.insert(column.to_string(), Hlc::from_value(ts)?);
        }
        let tombstone = reader.field("tombstone").map(Hlc::from_value).transpose()?;
        Ok(Self { columns, tombstone })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hlc::ReplicaId;
    use proptest::prelude::*;

    fn ts(physical: u64, logical: u32, replica: u8) -> Hlc {
        Hlc::new(physical, logical, ReplicaId::new([replica; 16]))
    }

    #[test]
    fn missing_existing_accepts() {
        assert_eq!(resolve(&ts(1, 0, 1), None), Resolution::Accept);
    }

    #[test]
    fn strictly_greater_accepts_and_smaller_rejects() {
        assert_eq!(resolve(&ts(5, 0, 1), Some(&ts(4, 9, 9))), Resolution::Accept);
        assert_eq!(resolve(&ts(5, 0, 1), Some(&ts(5, 1, 0))), Resolution::Reject);
    }

    #[test]
    fn identical_timestamp_is_duplicate() {
        let t = ts(5, 2, 3);
        assert_eq!(resolve(&t, Some(&t)), Resolution::Reject);
    }

    #[test]
    fn same_instant_breaks_toward_higher_replica() {
        let low = ts(5, 2, 1);
        let high = ts(5, 2, 2);
        assert_eq!(resolve(&high, Some(&low)), Resolution::TieBreak { accept: true });
        assert_eq!(resolve(&low, Some(&high)), Resolution::TieBreak { accept: false });
        assert!(resolve(&high, Some(&low)).is_tie_break());
    }

    #[test]
    fn disjoint_columns_do_not_conflict() {
        let mut row = RowVersion::new();
        row.record_column("name", ts(10, 0, 1));
        assert_eq!(row.resolve_column("price", &ts(3, 0, 2)), Resolution::Accept);
    }

    #[test]
    fn delete_must_dominate_every_column() {
        let mut row = RowVersion::new();
        row.record_column("a", ts(10, 0, 1));
        row.record_column("b", ts(20, 0, 1));
        assert_eq!(row.resolve_delete(&ts(15, 0, 2)), Resolution::Reject);
        assert_eq!(row.resolve_delete(&ts(25, 0, 2)), Resolution::Accept);
    }

    #[test]
    fn tombstone_blocks_older_writes_and_newer_writes_resurrect() {
        let mut row = RowVersion::new();
        row.record_column("a", ts(10, 0, 1));
        row.record_delete(ts(20, 0, 2));
        assert!(!row.is_live());

        assert_eq!(row.resolve_column("a", &ts(15, 0, 1)), Resolution::Reject);
        assert_eq!(row.resolve_column("b", &ts(15, 0, 1)), Resolution::Reject);
        assert_eq!(row.resolve_column("b", &ts(30, 0, 1)), Resolution::Accept);

        row.record_column("b", ts(30, 0, 1));
        assert!(row.is_live());
        assert_eq!(row.max_timestamp(), Some(&ts(30, 0, 1)));
    }

    #[test]
    fn value_mapping() {
        let mut row = RowVersion::new();
        row.record_column("name", ts(1, 2, 3));
        row.record_delete(ts(4, 0, 1));
        assert_eq!(RowVersion::from_value(&row.to_value()).unwrap(), row);
        assert_eq!(
            RowVersion::from_value(&RowVersion::new().to_value()).unwrap(),
            RowVersion::new()
        );
    }

    fn apply(row: &mut RowVersion, value: &mut Option<u8>, write: (Hlc, u8)) {
        if row.resolve_column("c", &write.0).accepts() {
            row.record_column("c", write.0);
            *value = Some(write.1);
        }
    }

    proptest! {
        #[test]
        fn delivery_order_does_not_change_winner(
            a in (0u64..4, 0u32..3, 0u8..3, any::<u8>()),
            b in (0u64..4, 0u32..3, 0u8..3, any::<u8>()),
        ) {
            let wa = (ts(a.0, a.1, a.2), a.3);
            let wb = (ts(b.0, b.1, b.2), b.3);
            prop_assume!(wa.0 != wb.0);

            let (mut row1, mut val1) = (RowVersion::new(), None);
            apply(&mut row1, &mut val1, wa);
            apply(&mut row1, &mut val1, wb);

            let (mut row2, mut val2) = (RowVersion::new(), None);
            apply(&mut row2, &mut val2, wb);
            apply(&mut row2, &mut val2, wa);

            let winner = if wa.0 > wb.0 { wa } else { wb };
            prop_assert_eq!(val1, Some(winner.1));
            prop_assert_eq!(val2, Some(winner.1));
            prop_assert_eq!(row1, row2);
        }
    }
}
