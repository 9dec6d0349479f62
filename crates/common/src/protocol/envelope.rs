// Inbound envelope parsing: one JSON object per frame with a non-empty string `id`.

use serde_json::{Map, Value};
use thiserror::Error;

/// Frame-level rejections. These never enter the request pipeline and are
/// answered with an `onReject` frame.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ProtocolReject {
    #[error("Invalid JSON.")]
    InvalidJson,

    #[error("JSON is not an object.")]
    NotAnObject,

    #[error("ID is not defined.")]
    IdMissing,

    #[error("ID is not a string.")]
    IdNotString,

    #[error("ID is an empty string.")]
    IdEmpty,
}

/// A parsed inbound message: the operation name plus the full original object.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub body: Map<String, Value>,
}

impl Envelope {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// The original payload, echoed back as `data` on failures.
    pub fn to_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Rejection together with the payload to echo back as `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub reason: ProtocolReject,
    pub data: Value,
}

pub fn parse_envelope(raw: &str) -> Result<Envelope, Rejected> {
    let value: Value = serde_json::from_str(raw).map_err(|_| Rejected {
        reason: ProtocolReject::InvalidJson,
        data: Value::String(raw.to_owned()),
    })?;

    envelope_from_value(value)
}

pub fn envelope_from_value(value: Value) -> Result<Envelope, Rejected> {
    let body = match value {
        Value::Object(body) => body,
        other => return Err(Rejected { reason: ProtocolReject::NotAnObject, data: other }),
    };

    let id = match body.get("id") {
        None | Some(Value::Null) => Err(ProtocolReject::IdMissing),
        Some(Value::String(id)) if id.is_empty() => Err(ProtocolReject::IdEmpty),
        Some(Value::String(id)) => Ok(id.clone()),
        Some(_) => Err(ProtocolReject::IdNotString),
    };

    match id {
        Ok(id) => Ok(Envelope { id, body }),
        Err(reason) => Err(Rejected { reason, data: Value::Object(body) }),
    }
}
