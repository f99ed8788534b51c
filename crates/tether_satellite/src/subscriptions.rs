//! Persisted subscription state.

use crate::error::{SatelliteError, SatelliteResult};
use std::sync::Arc;
use tether_codec::{to_canonical_cbor, FromValue, SqlValue, ToValue, Value};
use tether_protocol::{Shape, SubscriptionId};
use tether_storage::{AdapterExt, DatabaseAdapter};

/// One subscription as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Local id, also used as the request id on the wire.
    pub id: i64,
    /// Subscribed shapes.
    pub shapes: Vec<Shape>,
    /// Id assigned by the server once accepted.
    pub server_id: Option<SubscriptionId>,
    /// Error reported by the server, if it refused.
    pub error: Option<String>,
}

impl Subscription {
    /// True if the server accepted the subscription.
    pub fn is_established(&self) -> bool {
        self.server_id.is_some()
    }
}

/// Access to the subscriptions table.
#[derive(Clone)]
pub struct SubscriptionStore {
    adapter: Arc<dyn DatabaseAdapter>,
}

impl SubscriptionStore {
    /// Creates a store over `adapter`.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self { adapter }
    }

    /// Persists a new subscription and returns it.
    pub fn add(&self, shapes: Vec<Shape>) -> SatelliteResult<Subscription> {
        if shapes.is_empty() {
            return Err(SatelliteError::InvalidState(
                "subscription needs at least one shape".into(),
            ));
        }
        let encoded = encode_shapes(&shapes)?;
        let id = self.adapter.transact(|tx| {
            let rows = tx.run(
                "INSERT INTO _tether_subscriptions (shapes) VALUES (?1) RETURNING id",
                &[SqlValue::Blob(encoded.clone())],
            )?;
            let id = rows
                .first()
                .map(|row| row.integer(0))
                .transpose()?
                .ok_or_else(|| SatelliteError::InvalidState("subscription insert returned no id".into()))?;
            Ok::<_, SatelliteError>(id)
        })?;
        Ok(Subscription {
            id,
            shapes,
            server_id: None,
            error: None,
        })
    }

    /// Persists `shapes` unless an identical subscription already exists.
    pub fn ensure(&self, shapes: &[Shape]) -> SatelliteResult<Subscription> {
        if let Some(existing) = self.list()?.into_iter().find(|s| s.shapes == shapes) {
            return Ok(existing);
        }
        self.add(shapes.to_vec())
    }

    /// Deletes a subscription, returning it if it existed.
    pub fn remove(&self, id: i64) -> SatelliteResult<Option<Subscription>> {
        let Some(existing) = self.get(id)? else {
            return Ok(None);
        };
        self.adapter.transact(|tx| {
            tx.execute(
                "DELETE FROM _tether_subscriptions WHERE id = ?1",
                &[SqlValue::Integer(id)],
            )
        })?;
        Ok(Some(existing))
    }

    /// Looks up one subscription.
    pub fn get(&self, id: i64) -> SatelliteResult<Option<Subscription>> {
        Ok(self.list()?.into_iter().find(|s| s.id == id))
    }

    /// All subscriptions, oldest first.
    pub fn list(&self) -> SatelliteResult<Vec<Subscription>> {
        let rows = self.adapter.run(
            "SELECT id, shapes, server_id, error FROM _tether_subscriptions ORDER BY id",
            &[],
        )?;
        rows.iter()
            .map(|row| -> SatelliteResult<Subscription> {
                Ok(Subscription {
                    id: row.integer(0)?,
                    shapes: decode_shapes(row.blob(1)?)?,
                    server_id: row.opt_text(2)?.map(SubscriptionId::new),
                    error: row.opt_text(3)?.map(str::to_string),
                })
            })
            .collect()
    }

    /// Records the server's answer to a subscribe request.
    pub fn record_response(
        &self,
        id: i64,
        result: &Result<SubscriptionId, String>,
    ) -> SatelliteResult<()> {
        let (server_id, error) = match result {
            Ok(server_id) => (SqlValue::from(server_id.as_str()), SqlValue::Null),
            Err(message) => (SqlValue::Null, SqlValue::from(message.as_str())),
        };
        self.adapter.transact(|tx| {
            tx.execute(
                "UPDATE _tether_subscriptions SET server_id = ?1, error = ?2 WHERE id = ?3",
                &[server_id.clone(), error.clone(), SqlValue::Integer(id)],
            )
        })?;
        Ok(())
    }
}

impl std::fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore").finish_non_exhaustive()
    }
}

fn encode_shapes(shapes: &[Shape]) -> SatelliteResult<Vec<u8>> {
    let value = Value::Array(shapes.iter().map(ToValue::to_value).collect());
    Ok(to_canonical_cbor(&value)?)
}

fn decode_shapes(bytes: &[u8]) -> SatelliteResult<Vec<Shape>> {
    match tether_codec::from_cbor(bytes)? {
        Value::Array(items) => items
            .iter()
            .map(|item| Shape::from_value(item).map_err(SatelliteError::from))
            .collect(),
        _ => Err(SatelliteError::Codec("stored shapes are not an array".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::bootstrap;
    use tether_storage::SqliteAdapter;

    fn store() -> SubscriptionStore {
        let db = SqliteAdapter::open_in_memory().unwrap();
        bootstrap(&db).unwrap();
        SubscriptionStore::new(Arc::new(db))
    }

    #[test]
    fn add_list_remove() {
        let store = store();
        let items = store.add(vec![Shape::table("items")]).unwrap();
        let orders = store
            .add(vec![Shape::table("orders").with_filter("total > 10")])
            .unwrap();
        assert!(items.id < orders.id);

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![items.clone(), orders.clone()]);

        assert_eq!(store.remove(items.id).unwrap(), Some(items.clone()));
        assert_eq!(store.remove(items.id).unwrap(), None);
        assert_eq!(store.list().unwrap(), vec![orders]);
    }

    #[test]
    fn empty_shapes_are_rejected() {
        assert!(matches!(
            store().add(Vec::new()),
            Err(SatelliteError::InvalidState(_))
        ));
    }

    #[test]
    fn ensure_does_not_duplicate() {
        let store = store();
        let shapes = vec![Shape::table("items")];
        let first = store.ensure(&shapes).unwrap();
        let second = store.ensure(&shapes).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn responses_are_recorded() {
        let store = store();
        let sub = store.add(vec![Shape::table("items")]).unwrap();
        store
            .record_response(sub.id, &Ok(SubscriptionId::new("srv-1")))
            .unwrap();
        let stored = store.get(sub.id).unwrap().unwrap();
        assert!(stored.is_established());
        assert_eq!(stored.server_id, Some(SubscriptionId::new("srv-1")));

        store
            .record_response(sub.id, &Err("unknown table".into()))
            .unwrap();
        let stored = store.get(sub.id).unwrap().unwrap();
        assert!(!stored.is_established());
        assert_eq!(stored.error.as_deref(), Some("unknown table"));
    }
}
