//! # Tether Satellite
//!
//! Local-first replication engine for an embedded SQL database.
//!
//! This crate provides:
//! - Schema migration with checksummed history ([`Migrator`])
//! - An operation log capturing local writes ([`OplogStore`])
//! - Column-level merging of inbound transactions against shadow rows
//! - A framed, reconnecting transport with exponential backoff ([`Transport`])
//! - Change notifications ([`Notifier`])
//! - The per-database process ([`Satellite`]) and a [`Registry`] of them
//!
//! ## Architecture
//!
//! Application writes go through [`Satellite::write`], which applies the rows,
//! appends the oplog and updates shadow timestamps in one transaction. A
//! driver task sends unacknowledged transactions to the server in commit
//! order and applies inbound transactions as they arrive.
//!
//! ## Key Invariants
//!
//! - Every local write is either fully logged or not applied at all
//! - Oplog entries are removed only after the server acknowledges them
//! - Conflicts are decided by HLC per column, ties by replica id
//! - Inbound transactions are applied atomically, at most once
//! - Remote changes are never written to the oplog

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod error;
mod migrator;
mod notifier;
mod oplog;
mod process;
mod registry;
mod schema;
mod shadow;
mod subscriptions;
pub mod transport;

pub use apply::{apply_local, apply_remote, local_timestamp, prune_received, ApplyOutcome};
pub use config::{BackoffConfig, SatelliteConfig};
pub use error::{SatelliteError, SatelliteResult};
pub use migrator::{checksum, current_version, Migration, MigrationReport, Migrator};
pub use notifier::{ChangeNotification, ChangeOrigin, ChangeStream, Notifier, SubscriberId};
pub use oplog::{OplogEntry, OplogStore, PendingTransaction};
pub use process::{Satellite, SatelliteDeps, SatelliteState, SatelliteStats};
pub use registry::Registry;
pub use schema::{bootstrap, is_internal_table, load_replica_id};
pub use subscriptions::{Subscription, SubscriptionStore};
pub use transport::{
    ConnectionState, Session, SocketFactory, TcpSocketFactory, Transport, TransportConfig,
    TransportEvent,
};
