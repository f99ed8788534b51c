//! Typed field access over decoded CBOR maps.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Borrowing view over a CBOR map with typed field accessors.
///
/// Required accessors fail with [`CodecError::MissingField`]; optional ones
/// return `None` when the key is absent or `null`.
#[derive(Debug, Clone, Copy)]
pub struct MapReader<'a> {
    pairs: &'a [(Value, Value)],
    context: &'static str,
}

impl<'a> MapReader<'a> {
    /// Wraps `value`, failing if it is not a map.
    pub fn new(value: &'a Value, context: &'static str) -> CodecResult<Self> {
        let pairs = value
            .as_map()
            .ok_or_else(|| CodecError::invalid_structure(format!("expected map for {context}")))?;
        Ok(Self { pairs, context })
    }

    /// Returns the raw field, if present.
    pub fn field(&self, name: &str) -> Option<&'a Value> {
        self.pairs
            .iter()
            .find(|(k, _)| k.as_text() == Some(name))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    }

    /// Returns the raw field or a missing-field error.
    pub fn required(&self, name: &str) -> CodecResult<&'a Value> {
        self.field(name).ok_or_else(|| self.missing(name))
    }

    /// Required text field.
    pub fn text(&self, name: &str) -> CodecResult<&'a str> {
        self.required(name)?
            .as_text()
            .ok_or_else(|| self.missing(name))
    }

    /// Optional text field.
    pub fn opt_text(&self, name: &str) -> CodecResult<Option<&'a str>> {
        self.field(name)
            .map(|v| v.as_text().ok_or_else(|| self.missing(name)))
            .transpose()
    }

    /// Required byte string field.
    pub fn bytes(&self, name: &str) -> CodecResult<&'a [u8]> {
        self.required(name)?
            .as_bytes()
            .ok_or_else(|| self.missing(name))
    }

    /// Required fixed-size byte string field.
    pub fn byte_array<const N: usize>(&self, name: &str) -> CodecResult<[u8; N]> {
        self.bytes(name)?
            .try_into()
            .map_err(|_| CodecError::invalid_structure(format!("{name} must be {N} bytes")))
    }

    /// Required unsigned integer field.
    pub fn u64(&self, name: &str) -> CodecResult<u64> {
        self.required(name)?
            .as_u64()
            .ok_or_else(|| self.missing(name))
    }

    /// Required unsigned integer field narrowed to `u32`.
    pub fn u32(&self, name: &str) -> CodecResult<u32> {
        u32::try_from(self.u64(name)?).map_err(|_| self.missing(name))
    }

    /// Required unsigned integer field narrowed to `u16`.
    pub fn u16(&self, name: &str) -> CodecResult<u16> {
        u16::try_from(self.u64(name)?).map_err(|_| self.missing(name))
    }

    /// Required boolean field.
    pub fn bool(&self, name: &str) -> CodecResult<bool> {
        self.required(name)?
            .as_bool()
            .ok_or_else(|| self.missing(name))
    }

    /// Required array field.
    pub fn array(&self, name: &str) -> CodecResult<&'a [Value]> {
        self.required(name)?
            .as_array()
            .ok_or_else(|| self.missing(name))
    }

    /// Array field that defaults to empty when absent.
    pub fn array_or_empty(&self, name: &str) -> CodecResult<&'a [Value]> {
        match self.field(name) {
            Some(v) => v.as_array().ok_or_else(|| self.missing(name)),
            None => Ok(&[]),
        }
    }

    fn missing(&self, name: &str) -> CodecError {
        CodecError::missing_field(format!("{}.{name}", self.context))
    }
}
