use crate::bridge::protocol::{CallResult, NodeUtilCall};
use crate::error::BridgeError;
use crate::nodeutil::{json_to_wire, wire_to_json};

pub(super) fn handle(call: NodeUtilCall) -> Result<CallResult, BridgeError> {
    match call {
        NodeUtilCall::JsonToWire { json } => Ok(CallResult::Value {
            value: json_to_wire(&json)?,
        }),
        NodeUtilCall::WireToJson { value } => Ok(CallResult::Text {
            text: wire_to_json(value)?,
        }),
    }
}
