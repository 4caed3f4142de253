//! Device service: named collections of module roots.

use std::sync::Arc;

use crate::adapter::{BridgedObject, DeviceAdapter};
use crate::bridge::protocol::{CallResult, DeviceCall};
use crate::error::BridgeError;
use crate::handle::Operation;
use crate::nodeutil::encode;

use super::{CallContext, Router};

pub(super) async fn handle(
    r: &Router,
    ctx: &CallContext,
    call: DeviceCall,
) -> Result<CallResult, BridgeError> {
    let table = r.table();
    match call {
        DeviceCall::New { id } => Ok(r.register(
            ctx,
            BridgedObject::Device(Arc::new(DeviceAdapter::new(id))),
        )),
        DeviceCall::AddModule {
            device,
            module,
            foreign_node,
        } => {
            let device = table.require(device, Operation::AddModule)?;
            let module = table.require(module, Operation::OpenRoot)?;
            let module = module.as_parse_result(Operation::OpenRoot)?;
            let root = module.open_root(foreign_node)?;
            device
                .as_device(Operation::AddModule)?
                .add_module(&module.schema().module, root);
            Ok(CallResult::Done)
        }
        DeviceCall::Browse { device, module } => {
            let root = table
                .require(device, Operation::Find)?
                .adapter()
                .find_child(&module)
                .await?;
            Ok(r.register(ctx, root))
        }
        DeviceCall::Read { device } => {
            let meta = table.require(device, Operation::Read)?.adapter().read("").await?;
            Ok(CallResult::Value {
                value: encode(&meta),
            })
        }
    }
}
