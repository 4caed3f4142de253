//! The tree-model seam the bridge drives, plus a reference implementation.
//!
//! The bridge only ever talks to [`Selection`]. [`memory`] backs selections
//! with an in-process JSON tree shaped by a [`ModuleSchema`]; [`remote`]
//! forwards every call to a node owned by the foreign process.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BridgeError;
use crate::reverse::ReverseChannel;

pub mod memory;
pub mod remote;
pub mod schema;

pub use memory::{ActionRequest, Behaviors, MemorySelection, Notifier};
pub use remote::RemoteSelection;
pub use schema::{Def, ModuleSchema};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Failed(String),

    /// The node lives elsewhere and reaching it failed.
    #[error(transparent)]
    Forward(#[from] BridgeError),
}

impl From<ModelError> for BridgeError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotFound(what) => BridgeError::NotFound(what),
            ModelError::InvalidArgument(msg) => BridgeError::InvalidArgument(msg),
            ModelError::Failed(msg) => BridgeError::Adapter(msg),
            ModelError::Forward(err) => err,
        }
    }
}

/// How `edit` combines incoming data with what is already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOp {
    /// Merge recursively, creating what is missing.
    UpsertFrom,
    /// Create; fails if any incoming key already exists.
    InsertFrom,
    /// Merge; fails if the target does not exist.
    UpdateFrom,
    /// Overwrite the target wholesale.
    ReplaceFrom,
}

/// Destination for notification events.
#[derive(Clone)]
pub struct EventSink(Arc<dyn Fn(Value) + Send + Sync>);

impl EventSink {
    pub fn new(f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn emit(&self, event: Value) {
        (self.0)(event)
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventSink")
    }
}

/// Keeps a notification registration alive. Closing (or dropping) detaches
/// the sink from its producer.
pub struct NotificationGuard {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl NotificationGuard {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    pub fn close(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for NotificationGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// A cursor into a live data tree.
///
/// Paths are `/`-separated identifiers relative to the selection; the empty
/// path names the selection itself.
#[async_trait]
pub trait Selection: Send + Sync {
    /// Absolute path of this selection within its tree.
    fn path(&self) -> String;

    async fn read(&self, path: &str) -> Result<Value, ModelError>;

    async fn write(&self, path: &str, value: Value) -> Result<(), ModelError>;

    /// Run the action at `name`. Without `input`, data previously written at
    /// the action's path is used.
    async fn action(&self, name: &str, input: Option<Value>) -> Result<Option<Value>, ModelError>;

    async fn find(&self, path: &str) -> Result<Arc<dyn Selection>, ModelError>;

    /// Register for the events of the notification this selection points at.
    async fn notifications(&self, sink: EventSink) -> Result<NotificationGuard, ModelError>;

    async fn edit(&self, op: EditOp, value: Value) -> Result<(), ModelError>;
}

/// What opening a browser root needs besides the schema.
#[derive(Clone, Default)]
pub struct ModelEnv {
    pub behaviors: Arc<Behaviors>,
    pub reverse: Option<Arc<ReverseChannel>>,
}

impl ModelEnv {
    pub fn reverse(&self) -> Result<&Arc<ReverseChannel>, BridgeError> {
        self.reverse.as_ref().ok_or(BridgeError::NoReverseChannel)
    }
}

pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub(crate) fn join_path(base: &str, rel: &str) -> String {
    split_path(base)
        .chain(split_path(rel))
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_ignore_stray_slashes() {
        assert_eq!(split_path("/a//b/").collect::<Vec<_>>(), ["a", "b"]);
        assert_eq!(join_path("a/b", "c"), "a/b/c");
        assert_eq!(join_path("", "/c/"), "c");
        assert_eq!(join_path("", ""), "");
    }

    #[test]
    fn model_errors_map_onto_bridge_errors() {
        assert_eq!(
            BridgeError::from(ModelError::Failed("boom".into())),
            BridgeError::Adapter("boom".into())
        );
        assert_eq!(
            BridgeError::from(ModelError::Forward(BridgeError::NoReverseChannel)),
            BridgeError::NoReverseChannel
        );
    }

    #[test]
    fn guard_detaches_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let guard = NotificationGuard::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });
        guard.close();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
