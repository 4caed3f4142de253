//! fc-lang: handle-based object bridge for live configuration trees.
//!
//! Remote callers (over a local socket) and same-process callers (over the C
//! entry point) share one [`HandleTable`]; every object they touch is named by
//! an opaque [`Handle`].

pub mod adapter;
pub mod bridge;
pub mod driver;
pub mod error;
pub mod foreign;
pub mod handle;
pub mod logging;
pub mod model;
pub mod nodeutil;
pub mod notify;
pub mod reverse;
pub mod service;
mod server;

pub use adapter::{BridgedObject, ObjectAdapter};
pub use driver::{Driver, DriverConfig, DriverError, DriverStats};
pub use error::{BridgeError, ErrorCode, WireError};
pub use foreign::ForeignCallBridge;
pub use handle::{ConnectionId, Handle, HandleTable, ObjectKind, Operation, Owner};
pub use model::{Behaviors, EditOp, ModuleSchema, Selection};
pub use tokio_util::sync::CancellationToken;
