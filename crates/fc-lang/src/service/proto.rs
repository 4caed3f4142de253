use std::sync::Arc;

use crate::adapter::BridgedObject;
use crate::bridge::protocol::{CallResult, ProtoCall};
use crate::error::BridgeError;
use crate::handle::Operation;
use crate::nodeutil::encode;

use super::{CallContext, Router};

pub(super) async fn handle(
    r: &Router,
    ctx: &CallContext,
    call: ProtoCall,
) -> Result<CallResult, BridgeError> {
    match call {
        ProtoCall::Descriptor { module } => {
            let object = r.table().require(module, Operation::Describe)?;
            let descriptor = object.as_parse_result(Operation::Describe)?.describe();
            Ok(r.register(ctx, BridgedObject::ProtoDescriptor(Arc::new(descriptor))))
        }
        ProtoCall::Read { hnd, path } => {
            let value = r
                .table()
                .require(hnd, Operation::Read)?
                .adapter()
                .read(&path)
                .await?;
            Ok(CallResult::Value {
                value: encode(&value),
            })
        }
    }
}
