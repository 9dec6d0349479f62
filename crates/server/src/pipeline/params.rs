use bittle_common::protocol::Envelope;
use serde_json::Value;

use crate::error::RequestFailure;
use crate::model::SplitAt;

pub const STRING: &str = "string";
pub const UNSIGNED_INTEGER: &str = "unsigned integer";
pub const INTEGER: &str = "integer";

/// Typed access to an envelope's arguments. Absent fields are missing;
/// present fields of the wrong JSON type (including `null`) are mistyped.
#[derive(Debug, Clone, Copy)]
pub struct Params<'a> {
    envelope: &'a Envelope,
}

impl<'a> Params<'a> {
    pub fn new(envelope: &'a Envelope) -> Self {
        Self { envelope }
    }

    fn required(&self, name: &'static str) -> Result<&'a Value, RequestFailure> {
        self.envelope.get(name).ok_or(RequestFailure::MissingParameter(name))
    }

    pub fn string(&self, name: &'static str) -> Result<String, RequestFailure> {
        match self.required(name)? {
            Value::String(value) => Ok(value.clone()),
            _ => Err(RequestFailure::MistypedParameter { name, expected: STRING }),
        }
    }

    /// Optional string; `null` counts as absent.
    pub fn optional_string(&self, name: &'static str) -> Result<Option<String>, RequestFailure> {
        match self.envelope.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.clone())),
            Some(_) => Err(RequestFailure::MistypedParameter { name, expected: STRING }),
        }
    }

    pub fn unsigned(&self, name: &'static str) -> Result<usize, RequestFailure> {
        self.required(name)?
            .as_u64()
            .and_then(|value| usize::try_from(value).ok())
            .ok_or(RequestFailure::MistypedParameter { name, expected: UNSIGNED_INTEGER })
    }

    /// A split column: any non-negative integer, or `-1` for end of line.
    pub fn split_column(&self, name: &'static str) -> Result<SplitAt, RequestFailure> {
        self.required(name)?
            .as_i64()
            .and_then(SplitAt::from_wire)
            .ok_or(RequestFailure::MistypedParameter { name, expected: INTEGER })
    }
}
