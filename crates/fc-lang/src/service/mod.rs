//! Request router and per-area services.
//!
//! Every inbound call lands in [`Router::dispatch`], which hands it to the
//! service for its area. Services resolve handle arguments through the
//! table (kind checks included) before any adapter runs, then register
//! whatever objects the operation produced under the caller's ownership.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::adapter::BridgedObject;
use crate::bridge::protocol::{Call, CallResult, Outcome, ServerFrame};
use crate::error::BridgeError;
use crate::handle::{HandleTable, Owner};
use crate::model::ModelEnv;
use crate::notify::NotificationHub;

mod device;
mod fs;
mod handles;
mod node;
mod nodeutil;
mod parser;
mod proto;

/// Who is calling, and where their subscription events go.
#[derive(Clone)]
pub struct CallContext {
    pub owner: Owner,
    pub listener: Option<mpsc::Sender<ServerFrame>>,
}

impl CallContext {
    /// In-process caller with no event stream.
    pub fn process() -> Self {
        Self {
            owner: Owner::Process,
            listener: None,
        }
    }
}

pub struct Router {
    table: Arc<HandleTable>,
    hub: NotificationHub,
    env: ModelEnv,
}

impl Router {
    pub fn new(table: Arc<HandleTable>, env: ModelEnv, queue_depth: usize) -> Self {
        Self {
            hub: NotificationHub::new(table.clone(), queue_depth),
            table,
            env,
        }
    }

    pub fn table(&self) -> &Arc<HandleTable> {
        &self.table
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn env(&self) -> &ModelEnv {
        &self.env
    }

    /// Run one call to completion and wrap the result for the wire.
    pub async fn dispatch(&self, ctx: &CallContext, call: Call) -> Outcome {
        match self.call(ctx, call).await {
            Ok(result) => Outcome::Ok { result },
            Err(e) => {
                tracing::debug!(error = %e, code = ?e.code(), "Call failed");
                Outcome::Error { error: e.to_wire() }
            }
        }
    }

    pub async fn call(&self, ctx: &CallContext, call: Call) -> Result<CallResult, BridgeError> {
        tracing::trace!(?call, owner = ?ctx.owner, "Dispatching");
        match call {
            Call::Parser(c) => parser::handle(self, ctx, c).await,
            Call::Handles(c) => handles::handle(self, c),
            Call::Node(c) => node::handle(self, ctx, c).await,
            Call::NodeUtil(c) => nodeutil::handle(c),
            Call::Device(c) => device::handle(self, ctx, c).await,
            Call::Proto(c) => proto::handle(self, ctx, c).await,
            Call::FileSystem(c) => fs::handle(self, ctx, c).await,
        }
    }

    fn register(&self, ctx: &CallContext, object: BridgedObject) -> CallResult {
        let object_kind = object.kind();
        let hnd = self.table.allocate(object, ctx.owner);
        CallResult::Handle {
            hnd: hnd.get(),
            object: object_kind,
        }
    }
}
