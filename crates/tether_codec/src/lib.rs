//! # Tether Codec
//!
//! Canonical CBOR encoding/decoding for the Tether replication engine.
//!
//! Every payload that crosses the wire or lands in an internal table is a
//! canonical CBOR [`Value`]:
//! - Maps are sorted by key (length-first, then bytewise on the encoded key)
//! - Integers use the shortest encoding
//! - No indefinite-length items
//! - Floats are always encoded as float64 and NaN is rejected
//!
//! The crate also owns [`SqlValue`], the column value model shared by the
//! execution adapter and the wire protocol.
//!
//! ## Usage
//!
//! ```
//! use tether_codec::{from_cbor, to_canonical_cbor, Value};
//!
//! let value = Value::map(vec![
//!     (Value::from("b"), Value::Integer(2)),
//!     (Value::from("a"), Value::Integer(1)),
//! ]);
//! let bytes = to_canonical_cbor(&value).unwrap();
//! let decoded = from_cbor(&bytes).unwrap();
//! assert_eq!(decoded.get("a"), Some(&Value::Integer(1)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod reader;
mod sql;
mod value;

pub use decoder::{from_cbor, CanonicalDecoder};
pub use encoder::{to_canonical_cbor, CanonicalEncoder};
pub use error::{CodecError, CodecResult};
pub use reader::MapReader;
pub use sql::SqlValue;
pub use value::Value;

/// Types that can be lowered to a CBOR [`Value`].
pub trait ToValue {
    /// Converts `self` to a value tree.
    fn to_value(&self) -> Value;

    /// Encodes `self` to canonical CBOR bytes.
    fn to_cbor(&self) -> CodecResult<Vec<u8>> {
        to_canonical_cbor(&self.to_value())
    }
}

/// Types that can be rebuilt from a CBOR [`Value`].
pub trait FromValue: Sized {
    /// Rebuilds `Self` from a value tree.
    fn from_value(value: &Value) -> CodecResult<Self>;

    /// Decodes `Self` from CBOR bytes.
    fn from_cbor(bytes: &[u8]) -> CodecResult<Self> {
        Self::from_value(&from_cbor(bytes)?)
    }
}
