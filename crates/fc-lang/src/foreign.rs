//! Same-process entry point into the handle table.
//!
//! Performs the resolve, invoke, report sequence the router uses, without a
//! socket in between, so a foreign-function caller and a socket caller can
//! work on the same handle.

use std::sync::Arc;

use serde_json::Value;

use crate::error::BridgeError;
use crate::handle::{HandleTable, Operation};
use crate::model::EditOp;

#[derive(Clone)]
pub struct ForeignCallBridge {
    table: Arc<HandleTable>,
}

impl ForeignCallBridge {
    pub fn new(table: Arc<HandleTable>) -> Self {
        Self { table }
    }

    /// Merge a JSON payload into the selection named by `raw`.
    pub async fn upsert_from(&self, raw: u64, payload: &[u8]) -> Result<(), BridgeError> {
        let object = self.table.require(raw, Operation::Edit)?;
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| BridgeError::InvalidArgument(format!("node payload: {e}")))?;
        tracing::trace!(hnd = raw, "Foreign upsert");
        object.adapter().edit(EditOp::UpsertFrom, value).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::adapter::{BridgedObject, DeviceAdapter, ParseResultAdapter};
    use crate::handle::{ObjectKind, Owner};
    use crate::model::ModelEnv;
    use crate::model::schema::{self, tests::ECHO_MODULE};

    #[tokio::test]
    async fn merges_into_a_selection() {
        let table = Arc::new(HandleTable::new());
        let pr = ParseResultAdapter::new(schema::parse(ECHO_MODULE, "echo").unwrap(), ModelEnv::default());
        let root = pr.open_root(None).unwrap();
        let hnd = table.allocate(BridgedObject::selection(root.clone()), Owner::Process);
        let bridge = ForeignCallBridge::new(table.clone());

        bridge.upsert_from(hnd.get(), br#"{"g": {"s": "tea"}}"#).await.unwrap();
        bridge.upsert_from(hnd.get(), br#"{"f": 2}"#).await.unwrap();
        assert_eq!(root.read("").await.unwrap(), json!({"f": 2, "g": {"s": "tea"}}));
    }

    #[tokio::test]
    async fn reports_handle_kind_and_payload_errors() {
        let table = Arc::new(HandleTable::new());
        let bridge = ForeignCallBridge::new(table.clone());
        assert_eq!(
            bridge.upsert_from(5, b"{}").await.unwrap_err(),
            BridgeError::InvalidHandle(5)
        );

        let device = table.allocate(BridgedObject::Device(Arc::new(DeviceAdapter::new("d"))), Owner::Process);
        assert_eq!(
            bridge.upsert_from(device.get(), b"{}").await.unwrap_err(),
            BridgeError::UnsupportedOperation {
                kind: ObjectKind::Device,
                op: Operation::Edit
            }
        );

        let pr = ParseResultAdapter::new(schema::parse(ECHO_MODULE, "echo").unwrap(), ModelEnv::default());
        let sel = table.allocate(BridgedObject::selection(pr.open_root(None).unwrap()), Owner::Process);
        assert!(matches!(
            bridge.upsert_from(sel.get(), b"not json").await,
            Err(BridgeError::InvalidArgument(_))
        ));
    }
}
