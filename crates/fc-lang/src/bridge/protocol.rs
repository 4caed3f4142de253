//! Wire protocol for the RPC endpoint and the reverse channel.
//!
//! Inbound frames name a service and a method:
//! `{"id": 7, "service": "node", "method": "read", "hnd": 3, "path": "g/s"}`.
//! Outbound frames are either replies correlated by `id` or subscription
//! events. Handles travel as raw integers and are validated by the table.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::handle::ObjectKind;
use crate::model::EditOp;
use crate::nodeutil::WireValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub call: Call,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum Call {
    Parser(ParserCall),
    Handles(HandlesCall),
    Node(NodeCall),
    NodeUtil(NodeUtilCall),
    Device(DeviceCall),
    Proto(ProtoCall),
    FileSystem(FileSystemCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ParserCall {
    /// Load `<dir>/<name>.json`, locally or through the foreign file system.
    ParseModule {
        dir: String,
        name: String,
        #[serde(default)]
        via_foreign: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum HandlesCall {
    Release { hnd: u64 },
    Kind { hnd: u64 },
    Stats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NodeCall {
    /// Open a browser root over a parse result. With `foreign_node` the root
    /// is served by the foreign process.
    Root {
        module: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        foreign_node: Option<u64>,
    },
    Read {
        hnd: u64,
        #[serde(default)]
        path: String,
    },
    Write {
        hnd: u64,
        #[serde(default)]
        path: String,
        value: WireValue,
    },
    Action {
        hnd: u64,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<WireValue>,
    },
    Find {
        hnd: u64,
        path: String,
    },
    Edit {
        hnd: u64,
        op: EditOp,
        value: WireValue,
    },
    Subscribe {
        hnd: u64,
    },
    Unsubscribe {
        hnd: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum NodeUtilCall {
    JsonToWire { json: String },
    WireToJson { value: WireValue },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum DeviceCall {
    New {
        id: String,
    },
    AddModule {
        device: u64,
        module: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        foreign_node: Option<u64>,
    },
    Browse {
        device: u64,
        module: String,
    },
    Read {
        device: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ProtoCall {
    Descriptor {
        module: u64,
    },
    Read {
        hnd: u64,
        #[serde(default)]
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum FileSystemCall {
    Open {
        path: String,
        #[serde(default)]
        via_foreign: bool,
    },
    Read {
        hnd: u64,
    },
    Stat {
        path: String,
    },
}

/// Successful result payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallResult {
    Done,
    Handle {
        hnd: u64,
        object: ObjectKind,
    },
    Value {
        value: WireValue,
    },
    Maybe {
        #[serde(default)]
        value: Option<WireValue>,
    },
    Text {
        text: String,
    },
    /// Base64 (standard alphabet) file contents.
    Bytes {
        data: String,
    },
    Kind {
        object: ObjectKind,
    },
    Stats {
        handles: usize,
        subscriptions: usize,
    },
    FileInfo {
        path: String,
        len: u64,
        is_dir: bool,
    },
    /// Opaque node token minted by the foreign process.
    Node {
        node: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { result: CallResult },
    Error { error: WireError },
}

/// Bridge to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: u64,
        #[serde(flatten)]
        outcome: Outcome,
    },
    Event {
        subscription: u64,
        seq: u64,
        /// Events discarded by back-pressure since the previous delivery.
        dropped: u64,
        value: WireValue,
    },
}

/// Bridge to foreign endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XRequest {
    pub id: u64,
    #[serde(flatten)]
    pub call: XCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "service", rename_all = "snake_case")]
pub enum XCall {
    XNode(XNodeCall),
    FileSystem(XFileSystemCall),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum XNodeCall {
    Read {
        node: u64,
        path: String,
    },
    Write {
        node: u64,
        path: String,
        value: WireValue,
    },
    Action {
        node: u64,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<WireValue>,
    },
    Find {
        node: u64,
        path: String,
    },
    Edit {
        node: u64,
        op: EditOp,
        value: WireValue,
    },
    /// Events for `stream` flow back as [`XFrame::Event`].
    Subscribe {
        node: u64,
        stream: u64,
    },
    Unsubscribe {
        stream: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum XFileSystemCall {
    ReadFile { path: String },
}

/// Foreign endpoint to bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum XFrame {
    Reply {
        id: u64,
        #[serde(flatten)]
        outcome: Outcome,
    },
    Event {
        stream: u64,
        value: WireValue,
    },
}

impl ServerFrame {
    pub fn reply(id: u64, outcome: Outcome) -> Self {
        ServerFrame::Reply { id, outcome }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn node_read_request_from_json() {
        let req: Request = serde_json::from_value(json!({
            "id": 7, "service": "node", "method": "read", "hnd": 3, "path": "g/s"
        }))
        .unwrap();
        assert_eq!(
            req,
            Request {
                id: 7,
                call: Call::Node(NodeCall::Read {
                    hnd: 3,
                    path: "g/s".into()
                }),
            }
        );
    }

    #[test]
    fn optional_fields_default() {
        let req: Request = serde_json::from_value(json!({
            "id": 1, "service": "parser", "method": "parse_module", "dir": "/y", "name": "car"
        }))
        .unwrap();
        assert_eq!(
            req.call,
            Call::Parser(ParserCall::ParseModule {
                dir: "/y".into(),
                name: "car".into(),
                via_foreign: false
            })
        );
    }

    #[test]
    fn unknown_method_fails_to_decode() {
        let res: Result<Request, _> = serde_json::from_value(json!({
            "id": 1, "service": "node", "method": "teleport", "hnd": 1
        }));
        assert!(res.is_err());
    }

    #[test]
    fn reply_and_event_shapes() {
        let ok = ServerFrame::reply(
            7,
            Outcome::Ok {
                result: CallResult::Value {
                    value: WireValue::String("coffee".into()),
                },
            },
        );
        insta::assert_json_snapshot!(ok, @r#"
        {
          "type": "reply",
          "id": 7,
          "status": "ok",
          "result": {
            "kind": "value",
            "value": {
              "type": "string",
              "v": "coffee"
            }
          }
        }
        "#);

        let err = ServerFrame::reply(
            8,
            Outcome::Error {
                error: WireError {
                    code: ErrorCode::InvalidHandle,
                    message: "invalid handle 99".into(),
                    line: None,
                    column: None,
                },
            },
        );
        insta::assert_json_snapshot!(err, @r#"
        {
          "type": "reply",
          "id": 8,
          "status": "error",
          "error": {
            "code": "invalid_handle",
            "message": "invalid handle 99"
          }
        }
        "#);

        let event = ServerFrame::Event {
            subscription: 9,
            seq: 0,
            dropped: 0,
            value: WireValue::Null,
        };
        insta::assert_json_snapshot!(event, @r#"
        {
          "type": "event",
          "subscription": 9,
          "seq": 0,
          "dropped": 0,
          "value": {
            "type": "null"
          }
        }
        "#);
    }

    #[test]
    fn reverse_frames_round_trip() {
        let req = XRequest {
            id: 2,
            call: XCall::XNode(XNodeCall::Subscribe { node: 40, stream: 1 }),
        };
        let text = serde_json::to_value(&req).unwrap();
        assert_eq!(
            text,
            json!({"id": 2, "service": "x_node", "method": "subscribe", "node": 40, "stream": 1})
        );

        let frame: XFrame = serde_json::from_value(json!({
            "type": "reply", "id": 2, "status": "ok", "result": {"kind": "node", "node": 41}
        }))
        .unwrap();
        assert_eq!(
            frame,
            XFrame::Reply {
                id: 2,
                outcome: Outcome::Ok {
                    result: CallResult::Node { node: 41 }
                }
            }
        );
    }
}
