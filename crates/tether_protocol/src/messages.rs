//! Wire messages exchanged between a satellite and the server.

use crate::change::{Transaction, TransactionId};
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;
use crate::hlc::ReplicaId;
use crate::shape::{Shape, SubscriptionId};
use tether_codec::{
    from_cbor, to_canonical_cbor, CodecError, CodecResult, FromValue, MapReader, ToValue, Value,
};

/// A protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// Authentication request.
    Auth(Auth),
    /// Authentication outcome.
    AuthResponse(AuthResponse),
    /// Subscription request.
    SubscribeRequest(SubscribeRequest),
    /// Subscription outcome.
    SubscribeResponse(SubscribeResponse),
    /// Subscription teardown.
    UnsubscribeRequest(UnsubscribeRequest),
    /// A replicated transaction, in either direction.
    Transaction(Transaction),
    /// Acknowledges a transaction, in either direction.
    Ack(Ack),
    /// Liveness probe.
    Ping(Ping),
    /// Liveness answer.
    Pong(Pong),
}

impl WireMessage {
    /// Returns the message type code used as the frame tag.
    pub fn type_code(&self) -> u8 {
        match self {
            WireMessage::Auth(_) => 1,
            WireMessage::AuthResponse(_) => 2,
            WireMessage::SubscribeRequest(_) => 3,
            WireMessage::SubscribeResponse(_) => 4,
            WireMessage::UnsubscribeRequest(_) => 5,
            WireMessage::Transaction(_) => 6,
            WireMessage::Ack(_) => 7,
            WireMessage::Ping(_) => 8,
            WireMessage::Pong(_) => 9,
        }
    }

    /// Short message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            WireMessage::Auth(_) => "Auth",
            WireMessage::AuthResponse(_) => "AuthResponse",
            WireMessage::SubscribeRequest(_) => "SubscribeRequest",
            WireMessage::SubscribeResponse(_) => "SubscribeResponse",
            WireMessage::UnsubscribeRequest(_) => "UnsubscribeRequest",
            WireMessage::Transaction(_) => "Transaction",
            WireMessage::Ack(_) => "Ack",
            WireMessage::Ping(_) => "Ping",
            WireMessage::Pong(_) => "Pong",
        }
    }

    /// Encodes the message body to CBOR.
    pub fn encode_payload(&self) -> CodecResult<Vec<u8>> {
        let value = match self {
            WireMessage::Auth(m) => m.to_value(),
            WireMessage::AuthResponse(m) => m.to_value(),
            WireMessage::SubscribeRequest(m) => m.to_value(),
            WireMessage::SubscribeResponse(m) => m.to_value(),
            WireMessage::UnsubscribeRequest(m) => m.to_value(),
            WireMessage::Transaction(m) => m.to_value(),
            WireMessage::Ack(m) => m.to_value(),
            WireMessage::Ping(m) => m.to_value(),
            WireMessage::Pong(m) => m.to_value(),
        };
        to_canonical_cbor(&value)
    }

    /// Decodes a message body for the given type code.
    pub fn decode(type_code: u8, payload: &[u8]) -> ProtocolResult<Self> {
        let value = from_cbor(payload)?;
        let message = match type_code {
            1 => WireMessage::Auth(Auth::from_value(&value)?),
            2 => WireMessage::AuthResponse(AuthResponse::from_value(&value)?),
            3 => WireMessage::SubscribeRequest(SubscribeRequest::from_value(&value)?),
            4 => WireMessage::SubscribeResponse(SubscribeResponse::from_value(&value)?),
            5 => WireMessage::UnsubscribeRequest(UnsubscribeRequest::from_value(&value)?),
            6 => WireMessage::Transaction(Transaction::from_value(&value)?),
            7 => WireMessage::Ack(Ack::from_value(&value)?),
            8 => WireMessage::Ping(Ping::from_value(&value)?),
            9 => WireMessage::Pong(Pong::from_value(&value)?),
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        Ok(message)
    }

    /// Encodes the message into a frame.
    pub fn to_frame(&self) -> ProtocolResult<Frame> {
        Ok(Frame::new(self.type_code(), self.encode_payload()?))
    }

    /// Decodes a message from a frame.
    pub fn from_frame(frame: &Frame) -> ProtocolResult<Self> {
        Self::decode(frame.tag, &frame.payload)
    }
}

/// Authentication request, the first message a satellite sends.
#[derive(Debug, Clone, PartialEq)]
pub struct Auth {
    /// Bearer token.
    pub token: String,
    /// Replica identity of the sender.
    pub replica_id: ReplicaId,
    /// Protocol version spoken by the sender.
    pub protocol_version: u16,
}

impl ToValue for Auth {
    fn to_value(&self) -> Value {
        Value::text_map(vec![
            ("token", Value::from(self.token.as_str())),
            ("replica_id", Value::Bytes(self.replica_id.as_bytes().to_vec())),
            ("protocol_version", Value::from(self.protocol_version)),
        ])
    }
}

impl FromValue for Auth {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "Auth")?;
        Ok(Self {
            token: reader.text("token")?.to_string(),
            replica_id: ReplicaId::new(reader.byte_array::<16>("replica_id")?),
            protocol_version: reader.u16("protocol_version")?,
        })
    }
}

/// Why the server refused authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    /// Token unknown or expired.
    InvalidToken,
    /// Server does not speak the client's protocol version.
    ProtocolMismatch,
}

impl RejectCode {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            RejectCode::InvalidToken => 1,
            RejectCode::ProtocolMismatch => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RejectCode::InvalidToken),
            2 => Some(RejectCode::ProtocolMismatch),
            _ => None,
        }
    }
}

/// Authentication outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResponse {
    /// Session accepted.
    Accepted {
        /// Protocol version the server will speak.
        protocol_version: u16,
        /// Schema version the server expects clients to be at.
        schema_version: u32,
    },
    /// Session refused.
    Rejected {
        /// Human-readable reason.
        reason: String,
        /// Machine-readable reason.
        code: RejectCode,
    },
}

impl ToValue for AuthResponse {
    fn to_value(&self) -> Value {
        match self {
            AuthResponse::Accepted {
                protocol_version,
                schema_version,
            } => Value::text_map(vec![
                ("accepted", Value::Bool(true)),
                ("protocol_version", Value::from(*protocol_version)),
                ("schema_version", Value::from(*schema_version)),
            ]),
            AuthResponse::Rejected { reason, code } => Value::text_map(vec![
                ("accepted", Value::Bool(false)),
                ("reason", Value::from(reason.as_str())),
                ("code", Value::Integer(i64::from(code.to_code()))),
            ]),
        }
    }
}

impl FromValue for AuthResponse {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "AuthResponse")?;
        if reader.bool("accepted")? {
            return Ok(AuthResponse::Accepted {
                protocol_version: reader.u16("protocol_version")?,
                schema_version: reader.u32("schema_version")?,
            });
        }
        let code = reader.u64("code")?;
        Ok(AuthResponse::Rejected {
            reason: reader.opt_text("reason")?.unwrap_or_default().to_string(),
            code: u8::try_from(code)
                .ok()
                .and_then(RejectCode::from_code)
                .ok_or_else(|| CodecError::invalid_structure(format!("unknown reject code {code}")))?,
        })
    }
}

/// Request to start receiving the given shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// Correlates the response.
    pub request_id: u64,
    /// Requested shapes.
    pub shapes: Vec<Shape>,
}

impl ToValue for SubscribeRequest {
    #[allow(clippy::cast_possible_wrap)]
    fn to_value(&self) -> Value {
        Value::text_map(vec![
            ("request_id", Value::Integer(self.request_id as i64)),
            (
                "shapes",
                Value::Array(self.shapes.iter().map(ToValue::to_value).collect()),
            ),
        ])
    }
}

impl FromValue for SubscribeRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "SubscribeRequest")?;
        Ok(Self {
            request_id: reader.u64("request_id")?,
            shapes: reader
                .array("shapes")?
                .iter()
                .map(Shape::from_value)
                .collect::<CodecResult<_>>()?,
        })
    }
}

/// Subscription outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResponse {
    /// Id of the request this answers.
    pub request_id: u64,
    /// Assigned subscription id, or the server's error message.
    pub result: Result<SubscriptionId, String>,
}

impl ToValue for SubscribeResponse {
    #[allow(clippy::cast_possible_wrap)]
    fn to_value(&self) -> Value {
        let outcome = match &self.result {
            Ok(id) => ("subscription_id", Value::from(id.as_str())),
            Err(message) => ("error", Value::from(message.as_str())),
        };
        Value::text_map(vec![
            ("request_id", Value::Integer(self.request_id as i64)),
            outcome,
        ])
    }
}

impl FromValue for SubscribeResponse {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "SubscribeResponse")?;
        let result = match reader.opt_text("subscription_id")? {
            Some(id) => Ok(SubscriptionId::new(id)),
            None => Err(reader.text("error")?.to_string()),
        };
        Ok(Self {
            request_id: reader.u64("request_id")?,
            result,
        })
    }
}

/// Request to stop receiving the given subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeRequest {
    /// Subscriptions to tear down.
    pub subscription_ids: Vec<SubscriptionId>,
}

impl ToValue for UnsubscribeRequest {
    fn to_value(&self) -> Value {
        Value::text_map(vec![(
            "subscription_ids",
            Value::Array(
                self.subscription_ids
                    .iter()
                    .map(|id| Value::from(id.as_str()))
                    .collect(),
            ),
        )])
    }
}

impl FromValue for UnsubscribeRequest {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "UnsubscribeRequest")?;
        let subscription_ids = reader
            .array("subscription_ids")?
            .iter()
            .map(|v| {
                v.as_text().map(SubscriptionId::new).ok_or_else(|| {
                    CodecError::invalid_structure("subscription ids must be text")
                })
            })
            .collect::<CodecResult<_>>()?;
        Ok(Self { subscription_ids })
    }
}

/// Acknowledges durable receipt of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Acknowledged transaction.
    pub transaction_id: TransactionId,
}

impl ToValue for Ack {
    fn to_value(&self) -> Value {
        Value::text_map(vec![(
            "transaction_id",
            Value::Bytes(self.transaction_id.as_bytes().to_vec()),
        )])
    }
}

impl FromValue for Ack {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "Ack")?;
        Ok(Self {
            transaction_id: TransactionId::from_bytes(reader.byte_array::<16>("transaction_id")?),
        })
    }
}

/// Liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Echoed back in the matching [`Pong`].
    pub nonce: u64,
}

/// Liveness answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    /// Nonce of the answered [`Ping`].
    pub nonce: u64,
}

macro_rules! nonce_message {
    ($ty:ident) => {
        impl ToValue for $ty {
            #[allow(clippy::cast_possible_wrap)]
            fn to_value(&self) -> Value {
                Value::text_map(vec![("nonce", Value::Integer(self.nonce as i64))])
            }
        }

        impl FromValue for $ty {
            fn from_value(value: &Value) -> CodecResult<Self> {
                let reader = MapReader::new(value, stringify!($ty))?;
                Ok(Self {
                    nonce: reader.u64("nonce")?,
                })
            }
        }
    };
}

nonce_message!(Ping);
nonce_message!(Pong);
