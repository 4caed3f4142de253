//! Node service: the selection operations.

use crate::adapter::BridgedObject;
use crate::bridge::protocol::{CallResult, NodeCall};
use crate::error::BridgeError;
use crate::handle::{Handle, ObjectKind, Operation};
use crate::nodeutil::{decode, encode};

use super::{CallContext, Router};

pub(super) async fn handle(
    r: &Router,
    ctx: &CallContext,
    call: NodeCall,
) -> Result<CallResult, BridgeError> {
    let table = r.table();
    match call {
        NodeCall::Root {
            module,
            foreign_node,
        } => {
            let object = table.require(module, Operation::OpenRoot)?;
            let root = object
                .as_parse_result(Operation::OpenRoot)?
                .open_root(foreign_node)?;
            Ok(r.register(ctx, BridgedObject::selection(root)))
        }
        NodeCall::Read { hnd, path } => {
            let value = table.require(hnd, Operation::Read)?.adapter().read(&path).await?;
            Ok(CallResult::Value {
                value: encode(&value),
            })
        }
        NodeCall::Write { hnd, path, value } => {
            let object = table.require(hnd, Operation::Write)?;
            object.adapter().write(&path, decode(value)?).await?;
            Ok(CallResult::Done)
        }
        NodeCall::Action { hnd, name, input } => {
            let object = table.require(hnd, Operation::Action)?;
            let input = input.map(decode).transpose()?;
            let output = object.adapter().invoke_action(&name, input).await?;
            Ok(CallResult::Maybe {
                value: output.as_ref().map(encode),
            })
        }
        NodeCall::Find { hnd, path } => {
            let child = table
                .require(hnd, Operation::Find)?
                .adapter()
                .find_child(&path)
                .await?;
            Ok(r.register(ctx, child))
        }
        NodeCall::Edit { hnd, op, value } => {
            let object = table.require(hnd, Operation::Edit)?;
            object.adapter().edit(op, decode(value)?).await?;
            Ok(CallResult::Done)
        }
        NodeCall::Subscribe { hnd } => {
            let source = Handle::from_raw(hnd)?;
            table.require(hnd, Operation::Subscribe)?;
            let listener = ctx.listener.clone().ok_or_else(|| {
                BridgeError::InvalidArgument("subscribing needs a streaming connection".into())
            })?;
            let sub = r.hub().subscribe(source, ctx.owner, listener).await?;
            Ok(CallResult::Handle {
                hnd: sub.get(),
                object: ObjectKind::Subscription,
            })
        }
        NodeCall::Unsubscribe { hnd } => {
            let sub = Handle::from_raw(hnd)?;
            table.require(hnd, Operation::Unsubscribe)?;
            r.hub().unsubscribe(sub).await?;
            Ok(CallResult::Done)
        }
    }
}
