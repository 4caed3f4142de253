//! Capability layer between the services and the objects they hand out.
//!
//! Every object behind a handle is a [`BridgedObject`]: a closed set of
//! kinds, each wrapping an adapter that implements [`ObjectAdapter`].
//! Services dispatch generic operations through the trait and only reach
//! for the typed payload for kind-specific operations, after the table has
//! already checked the kind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::BridgeError;
use crate::handle::{ObjectKind, Operation};
use crate::model::{
    EditOp, EventSink, MemorySelection, ModelEnv, ModuleSchema, NotificationGuard,
    RemoteSelection, Selection,
};
use crate::notify::Subscription;
use crate::reverse::ReverseChannel;

#[async_trait]
pub trait ObjectAdapter: Send + Sync {
    fn kind(&self) -> ObjectKind;

    fn unsupported(&self, op: Operation) -> BridgeError {
        BridgeError::UnsupportedOperation {
            kind: self.kind(),
            op,
        }
    }

    async fn read(&self, _path: &str) -> Result<Value, BridgeError> {
        Err(self.unsupported(Operation::Read))
    }

    async fn write(&self, _path: &str, _value: Value) -> Result<(), BridgeError> {
        Err(self.unsupported(Operation::Write))
    }

    async fn invoke_action(
        &self,
        _name: &str,
        _input: Option<Value>,
    ) -> Result<Option<Value>, BridgeError> {
        Err(self.unsupported(Operation::Action))
    }

    /// Produce the object at `path`; the caller allocates its handle.
    async fn find_child(&self, _path: &str) -> Result<BridgedObject, BridgeError> {
        Err(self.unsupported(Operation::Find))
    }

    async fn subscribe(&self, _sink: EventSink) -> Result<NotificationGuard, BridgeError> {
        Err(self.unsupported(Operation::Subscribe))
    }

    async fn unsubscribe(&self) -> Result<(), BridgeError> {
        Err(self.unsupported(Operation::Unsubscribe))
    }

    async fn edit(&self, _op: EditOp, _value: Value) -> Result<(), BridgeError> {
        Err(self.unsupported(Operation::Edit))
    }
}

#[derive(Clone)]
pub enum BridgedObject {
    Selection(Arc<SelectionAdapter>),
    Subscription(Arc<Subscription>),
    ParseResult(Arc<ParseResultAdapter>),
    Device(Arc<DeviceAdapter>),
    ProtoDescriptor(Arc<ProtoDescriptorAdapter>),
    FileHandle(Arc<FileHandleAdapter>),
}

impl BridgedObject {
    pub fn selection(sel: Arc<dyn Selection>) -> Self {
        BridgedObject::Selection(Arc::new(SelectionAdapter { sel }))
    }

    pub fn kind(&self) -> ObjectKind {
        self.adapter().kind()
    }

    pub fn adapter(&self) -> &dyn ObjectAdapter {
        match self {
            BridgedObject::Selection(a) => a.as_ref(),
            BridgedObject::Subscription(a) => a.as_ref(),
            BridgedObject::ParseResult(a) => a.as_ref(),
            BridgedObject::Device(a) => a.as_ref(),
            BridgedObject::ProtoDescriptor(a) => a.as_ref(),
            BridgedObject::FileHandle(a) => a.as_ref(),
        }
    }

    /// Close hook run when the handle goes away.
    pub fn close(&self) {
        if let BridgedObject::Subscription(sub) = self {
            sub.close();
        }
    }

    fn mismatch(&self, op: Operation) -> BridgeError {
        self.adapter().unsupported(op)
    }

    pub fn as_selection(&self, op: Operation) -> Result<&Arc<SelectionAdapter>, BridgeError> {
        match self {
            BridgedObject::Selection(a) => Ok(a),
            _ => Err(self.mismatch(op)),
        }
    }

    pub fn as_parse_result(&self, op: Operation) -> Result<&Arc<ParseResultAdapter>, BridgeError> {
        match self {
            BridgedObject::ParseResult(a) => Ok(a),
            _ => Err(self.mismatch(op)),
        }
    }

    pub fn as_device(&self, op: Operation) -> Result<&Arc<DeviceAdapter>, BridgeError> {
        match self {
            BridgedObject::Device(a) => Ok(a),
            _ => Err(self.mismatch(op)),
        }
    }

    pub fn as_file(&self, op: Operation) -> Result<&Arc<FileHandleAdapter>, BridgeError> {
        match self {
            BridgedObject::FileHandle(a) => Ok(a),
            _ => Err(self.mismatch(op)),
        }
    }
}

pub struct SelectionAdapter {
    sel: Arc<dyn Selection>,
}

impl SelectionAdapter {
    pub fn selection(&self) -> &Arc<dyn Selection> {
        &self.sel
    }
}

#[async_trait]
impl ObjectAdapter for SelectionAdapter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Selection
    }

    async fn read(&self, path: &str) -> Result<Value, BridgeError> {
        Ok(self.sel.read(path).await?)
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), BridgeError> {
        Ok(self.sel.write(path, value).await?)
    }

    async fn invoke_action(
        &self,
        name: &str,
        input: Option<Value>,
    ) -> Result<Option<Value>, BridgeError> {
        Ok(self.sel.action(name, input).await?)
    }

    async fn find_child(&self, path: &str) -> Result<BridgedObject, BridgeError> {
        let child = self.sel.find(path).await?;
        Ok(BridgedObject::selection(child))
    }

    async fn subscribe(&self, sink: EventSink) -> Result<NotificationGuard, BridgeError> {
        Ok(self.sel.notifications(sink).await?)
    }

    async fn edit(&self, op: EditOp, value: Value) -> Result<(), BridgeError> {
        Ok(self.sel.edit(op, value).await?)
    }
}

/// A parsed module, ready to open browser roots over.
pub struct ParseResultAdapter {
    schema: Arc<ModuleSchema>,
    env: ModelEnv,
}

impl ParseResultAdapter {
    pub fn new(schema: ModuleSchema, env: ModelEnv) -> Self {
        Self {
            schema: Arc::new(schema),
            env,
        }
    }

    pub fn schema(&self) -> &Arc<ModuleSchema> {
        &self.schema
    }

    /// Open a root over a fresh in-memory tree, or over the foreign node
    /// `foreign` when given.
    pub fn open_root(&self, foreign: Option<u64>) -> Result<Arc<dyn Selection>, BridgeError> {
        let root: Arc<dyn Selection> = match foreign {
            Some(node) => Arc::new(RemoteSelection::new(self.env.reverse()?.clone(), node)),
            None => Arc::new(MemorySelection::root(
                self.schema.clone(),
                self.env.behaviors.clone(),
            )),
        };
        Ok(root)
    }

    pub fn describe(&self) -> ProtoDescriptorAdapter {
        ProtoDescriptorAdapter {
            descriptor: self.schema.descriptor(),
        }
    }
}

#[async_trait]
impl ObjectAdapter for ParseResultAdapter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ParseResult
    }

    async fn read(&self, path: &str) -> Result<Value, BridgeError> {
        self.schema.definition_json(path)
    }
}

/// Named collection of module roots.
pub struct DeviceAdapter {
    id: String,
    modules: RwLock<BTreeMap<String, Arc<dyn Selection>>>,
}

impl DeviceAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            modules: RwLock::new(BTreeMap::new()),
        }
    }

    /// Mount `root` under `module`, replacing any earlier mount.
    pub fn add_module(&self, module: &str, root: Arc<dyn Selection>) {
        tracing::debug!(device = %self.id, module, "Adding module to device");
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string(), root);
    }
}

#[async_trait]
impl ObjectAdapter for DeviceAdapter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Device
    }

    async fn read(&self, _path: &str) -> Result<Value, BridgeError> {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        Ok(json!({
            "id": self.id,
            "modules": modules.keys().collect::<Vec<_>>(),
        }))
    }

    async fn find_child(&self, module: &str) -> Result<BridgedObject, BridgeError> {
        let root = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("module {module} on device {}", self.id)))?;
        Ok(BridgedObject::selection(root))
    }
}

pub struct ProtoDescriptorAdapter {
    descriptor: Value,
}

#[async_trait]
impl ObjectAdapter for ProtoDescriptorAdapter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::ProtoDescriptor
    }

    /// The whole descriptor for "", otherwise the entry for one schema path.
    async fn read(&self, path: &str) -> Result<Value, BridgeError> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Ok(self.descriptor.clone());
        }
        self.descriptor["paths"]
            .get(path)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound(format!("descriptor path {path}")))
    }
}

pub enum FileSource {
    Local,
    Foreign(Arc<ReverseChannel>),
}

pub struct FileHandleAdapter {
    path: PathBuf,
    source: FileSource,
}

impl FileHandleAdapter {
    pub fn new(path: impl Into<PathBuf>, source: FileSource) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }

    pub async fn contents(&self) -> Result<Vec<u8>, BridgeError> {
        match &self.source {
            FileSource::Local => tokio::fs::read(&self.path)
                .await
                .map_err(|e| io_error(&self.path, e)),
            FileSource::Foreign(channel) => {
                channel.read_file(&self.path.to_string_lossy()).await
            }
        }
    }
}

pub(crate) fn io_error(path: &std::path::Path, e: std::io::Error) -> BridgeError {
    match e.kind() {
        std::io::ErrorKind::NotFound => BridgeError::NotFound(path.display().to_string()),
        _ => BridgeError::Adapter(format!("{}: {e}", path.display())),
    }
}

#[async_trait]
impl ObjectAdapter for FileHandleAdapter {
    fn kind(&self) -> ObjectKind {
        ObjectKind::FileHandle
    }

    /// Contents as text; binary files are only reachable through the
    /// file system service.
    async fn read(&self, _path: &str) -> Result<Value, BridgeError> {
        let bytes = self.contents().await?;
        String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|_| BridgeError::InvalidArgument(format!("{} is not UTF-8", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema::{self, tests::ECHO_MODULE};

    fn parse_result() -> ParseResultAdapter {
        ParseResultAdapter::new(schema::parse(ECHO_MODULE, "echo").unwrap(), ModelEnv::default())
    }

    #[tokio::test]
    async fn default_operations_are_unsupported() {
        let desc = BridgedObject::ProtoDescriptor(Arc::new(parse_result().describe()));
        assert_eq!(
            desc.adapter().write("x", Value::Null).await.unwrap_err(),
            BridgeError::UnsupportedOperation {
                kind: ObjectKind::ProtoDescriptor,
                op: Operation::Write
            }
        );
        assert!(desc.as_selection(Operation::Read).is_err());
    }

    #[tokio::test]
    async fn parse_result_reads_definitions_and_opens_roots() {
        let pr = parse_result();
        let def = pr.read("g").await.unwrap();
        assert_eq!(def["kind"], "container");

        let root = pr.open_root(None).unwrap();
        root.write("f", json!(3)).await.unwrap();
        assert_eq!(root.read("f").await.unwrap(), json!(3));

        assert!(matches!(
            pr.open_root(Some(7)),
            Err(BridgeError::NoReverseChannel)
        ));
    }

    #[tokio::test]
    async fn device_mounts_modules() {
        let pr = parse_result();
        let device = DeviceAdapter::new("car-1");
        device.add_module("echo", pr.open_root(None).unwrap());

        assert_eq!(
            device.read("").await.unwrap(),
            json!({"id": "car-1", "modules": ["echo"]})
        );
        let child = device.find_child("echo").await.unwrap();
        assert_eq!(child.kind(), ObjectKind::Selection);
        assert!(matches!(
            device.find_child("nope").await,
            Err(BridgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn descriptor_reads_single_paths() {
        let desc = parse_result().describe();
        assert_eq!(
            desc.read("g/s").await.unwrap(),
            json!({"kind": "leaf", "type": "string"})
        );
        assert_eq!(desc.read("").await.unwrap()["module"], "echo");
    }

    #[tokio::test]
    async fn file_handle_reads_local_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "hello").unwrap();

        let file = FileHandleAdapter::new(&path, FileSource::Local);
        assert_eq!(file.read("").await.unwrap(), json!("hello"));

        let gone = FileHandleAdapter::new(dir.path().join("gone"), FileSource::Local);
        assert!(matches!(gone.contents().await, Err(BridgeError::NotFound(_))));
    }
}
