//! Wire envelopes.
//!
//! Two envelopes share the transport:
//!
//! - [`Invocation`] carries a one-way method call: `{"method": .., "args": [..]}`.
//! - [`BroadcastEnvelope`] carries a state update for one named stream:
//!   `{"type": .., "data": ..}`.
//!
//! Argument types are not carried on the wire; the receiving handler's
//! signature decides how the positional arguments are decoded.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Method name.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Invocation {
    /// Create an invocation from a method name and an argument tuple.
    ///
    /// `args` must serialize to a sequence (a tuple, array or `Vec`).
    /// `()` is accepted as "no arguments".
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments cannot be serialized or do not form
    /// a sequence.
    pub fn new(method: impl Into<String>, args: impl Serialize) -> Result<Self, ProtocolError> {
        let args = match serde_json::to_value(args)? {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            _ => return Err(ProtocolError::ArgsNotSequence),
        };

        Ok(Self {
            method: method.into(),
            args,
        })
    }

    /// Decode the positional arguments into the handler's argument tuple.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument count or shapes do not match `A`.
    pub fn decode_args<A: DeserializeOwned>(self) -> Result<A, ProtocolError> {
        decode_args(self.args)
    }
}

/// Decode positional arguments into a typed tuple.
///
/// An empty argument list also decodes into `()`.
///
/// # Errors
///
/// Returns an error if the arguments do not match `A`.
pub fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, ProtocolError> {
    if args.is_empty() {
        if let Ok(unit) = serde_json::from_value(Value::Null) {
            return Ok(unit);
        }
    }
    serde_json::from_value(Value::Array(args)).map_err(ProtocolError::Arguments)
}

/// A state update for one named stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    /// Stream key.
    #[serde(rename = "type")]
    pub type_key: String,
    /// Serialized value of the stream's declared type.
    pub data: Value,
}

impl BroadcastEnvelope {
    /// Create an envelope from an already serialized value.
    #[must_use]
    pub fn new(type_key: impl Into<String>, data: Value) -> Self {
        Self {
            type_key: type_key.into(),
            data,
        }
    }

    /// Create an envelope by serializing `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if `data` cannot be serialized.
    pub fn from_data<T: Serialize + ?Sized>(
        type_key: impl Into<String>,
        data: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(type_key, serde_json::to_value(data)?))
    }

    /// Decode the data into the stream's declared type.
    ///
    /// # Errors
    ///
    /// Returns an error if the data does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.data).map_err(ProtocolError::Json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invocation_wire_shape() {
        let inv = Invocation::new("Foo", (42, "bar")).unwrap();
        let value = serde_json::to_value(&inv).unwrap();
        assert_eq!(value, json!({ "method": "Foo", "args": [42, "bar"] }));
    }

    #[test]
    fn test_invocation_unit_args() {
        let inv = Invocation::new("Ping", ()).unwrap();
        assert!(inv.args.is_empty());
    }

    #[test]
    fn test_invocation_rejects_non_sequence() {
        let err = Invocation::new("Foo", json!({ "id": 1 })).unwrap_err();
        assert!(matches!(err, ProtocolError::ArgsNotSequence));
    }

    #[test]
    fn test_missing_args_field_defaults_to_empty() {
        let inv: Invocation = serde_json::from_str(r#"{"method":"Foo"}"#).unwrap();
        assert_eq!(inv.method, "Foo");
        assert!(inv.args.is_empty());
    }

    #[test]
    fn test_decode_args_checks_arity() {
        let inv = Invocation::new("Foo", (1, 2)).unwrap();
        assert_eq!(inv.clone().decode_args::<(i32, i32)>().unwrap(), (1, 2));
        assert!(inv.clone().decode_args::<(i32,)>().is_err());
        assert!(inv.decode_args::<(i32, i32, i32)>().is_err());
    }

    #[test]
    fn test_broadcast_envelope_wire_shape() {
        let env = BroadcastEnvelope::from_data("game.beatmap", &json!({ "id": 7 })).unwrap();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value, json!({ "type": "game.beatmap", "data": { "id": 7 } }));
    }

    #[test]
    fn test_broadcast_envelope_data_as() {
        let env = BroadcastEnvelope::new("play.clock", json!(1234.5));
        assert_eq!(env.data_as::<f64>().unwrap(), 1234.5);
        assert!(env.data_as::<String>().is_err());
    }
}
