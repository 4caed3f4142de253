//! Conversion between the typed wire value and the model's JSON values.
//!
//! Pure structural walk; nothing here touches the handle table.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::BridgeError;

/// Self-describing value carried in frames.
///
/// Integers keep their signedness so a 64-bit unsigned leaf survives a round
/// trip through a foreign language that only has signed ints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "v", rename_all = "snake_case")]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Decimal(f64),
    String(String),
    List(Vec<WireValue>),
    Object(BTreeMap<String, WireValue>),
}

pub fn encode(value: &Value) -> WireValue {
    match value {
        Value::Null => WireValue::Null,
        Value::Bool(b) => WireValue::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                WireValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                WireValue::Uint(u)
            } else {
                WireValue::Decimal(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => WireValue::String(s.clone()),
        Value::Array(items) => WireValue::List(items.iter().map(encode).collect()),
        Value::Object(fields) => WireValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), encode(v)))
                .collect(),
        ),
    }
}

pub fn decode(value: WireValue) -> Result<Value, BridgeError> {
    Ok(match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(b) => Value::Bool(b),
        WireValue::Int(i) => Value::from(i),
        WireValue::Uint(u) => Value::from(u),
        WireValue::Decimal(d) => Number::from_f64(d).map(Value::Number).ok_or_else(|| {
            BridgeError::InvalidArgument(format!("decimal {d} has no JSON representation"))
        })?,
        WireValue::String(s) => Value::String(s),
        WireValue::List(items) => {
            Value::Array(items.into_iter().map(decode).collect::<Result<_, _>>()?)
        }
        WireValue::Object(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (k, v) in fields {
                map.insert(k, decode(v)?);
            }
            Value::Object(map)
        }
    })
}

/// Parse JSON text into a wire value.
pub fn json_to_wire(text: &str) -> Result<WireValue, BridgeError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| BridgeError::InvalidArgument(format!("malformed JSON: {e}")))?;
    Ok(encode(&value))
}

pub fn wire_to_json(value: WireValue) -> Result<String, BridgeError> {
    let value = decode(value)?;
    serde_json::to_string(&value).map_err(|e| BridgeError::InvalidArgument(e.to_string()))
}
