//! # Tether Protocol
//!
//! Replication protocol types for Tether.
//!
//! This crate provides:
//! - [`Hlc`] timestamps and the per-replica [`HlcClock`]
//! - [`ChangeRecord`] and [`Transaction`] replication records
//! - [`Shape`] subscription descriptions
//! - [`WireMessage`] and its [`Frame`] encoding
//! - [`resolve`] and [`RowVersion`] for column-level conflict resolution
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod conflict;
mod error;
mod frame;
mod hlc;
mod messages;
mod shape;

pub use change::{encode_row_key, ChangeRecord, Columns, OperationType, Transaction, TransactionId};
pub use conflict::{resolve, Resolution, RowVersion};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{Frame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};
pub use hlc::{Hlc, HlcClock, ManualClock, ReplicaId, SystemClock, WallClock, HLC_BYTES_LEN};
pub use messages::{
    Ack, Auth, AuthResponse, Ping, Pong, RejectCode, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, WireMessage,
};
pub use shape::{Shape, SubscriptionId};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;
