//! In-memory data tree backing local browser roots.
//!
//! One [`Store`] per opened root: a JSON document under a lock, the schema
//! that shapes it, and the listeners registered on its notifications.
//! Action behavior comes from handlers on a shared [`Behaviors`] registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::schema::{Def, ModuleSchema};
use super::{EditOp, EventSink, ModelError, NotificationGuard, Selection, split_path};

/// Everything an action handler gets to work with.
pub struct ActionRequest {
    pub module: String,
    /// Absolute path of the action.
    pub path: String,
    pub input: Option<Value>,
    pub notifier: Notifier,
}

pub type ActionHandler =
    Arc<dyn Fn(ActionRequest) -> Result<Option<Value>, ModelError> + Send + Sync>;

/// Action handlers keyed by `<module>:<action path>`.
#[derive(Default)]
pub struct Behaviors {
    actions: RwLock<HashMap<String, ActionHandler>>,
}

impl Behaviors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_action<F>(&self, module: &str, path: &str, handler: F)
    where
        F: Fn(ActionRequest) -> Result<Option<Value>, ModelError> + Send + Sync + 'static,
    {
        self.actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(format!("{module}:{path}"), Arc::new(handler));
    }

    pub fn with_action<F>(self, module: &str, path: &str, handler: F) -> Self
    where
        F: Fn(ActionRequest) -> Result<Option<Value>, ModelError> + Send + Sync + 'static,
    {
        self.on_action(module, path, handler);
        self
    }

    fn handler(&self, module: &str, path: &str) -> Option<ActionHandler> {
        self.actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&format!("{module}:{path}"))
            .cloned()
    }
}

struct Listener {
    id: u64,
    path: String,
    sink: EventSink,
}

struct Store {
    schema: Arc<ModuleSchema>,
    behaviors: Arc<Behaviors>,
    data: RwLock<Value>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
}

impl Store {
    fn publish(&self, path: &str, event: Value) -> Result<usize, ModelError> {
        let segments: Vec<&str> = split_path(path).collect();
        match self.schema.resolve(&segments)? {
            Some(Def::Notification { children, .. }) => check_shape(children, &event, path)?,
            _ => {
                return Err(ModelError::InvalidArgument(format!(
                    "'{path}' is not a notification"
                )));
            }
        }
        let path = segments.join("/");
        let sinks: Vec<EventSink> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|l| l.path == path)
            .map(|l| l.sink.clone())
            .collect();
        // Emit outside the lock; sinks may take their own.
        for sink in &sinks {
            sink.emit(event.clone());
        }
        Ok(sinks.len())
    }
}

/// Handle given to action handlers for raising notifications on their store.
#[derive(Clone)]
pub struct Notifier {
    store: Weak<Store>,
}

impl Notifier {
    /// Publish `event` on the notification at absolute `path`. Returns how
    /// many listeners received it.
    pub fn publish(&self, path: &str, event: Value) -> Result<usize, ModelError> {
        let store = self
            .store
            .upgrade()
            .ok_or_else(|| ModelError::Failed("data tree is gone".into()))?;
        store.publish(path, event)
    }
}

pub struct MemorySelection {
    store: Arc<Store>,
    at: Vec<String>,
}

impl MemorySelection {
    /// Open a fresh, empty tree for `schema`.
    pub fn root(schema: Arc<ModuleSchema>, behaviors: Arc<Behaviors>) -> Self {
        Self {
            store: Arc::new(Store {
                schema,
                behaviors,
                data: RwLock::new(Value::Object(Map::new())),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
            at: Vec::new(),
        }
    }

    fn target(&self, rel: &str) -> Vec<String> {
        self.at
            .iter()
            .map(String::as_str)
            .chain(split_path(rel))
            .map(str::to_string)
            .collect()
    }

    /// Children a value written at `path` must be shaped like.
    fn shape_at(&self, path: &[String]) -> Result<&[Def], ModelError> {
        Ok(match self.store.schema.resolve(path)? {
            Some(def) => def.children(),
            None => &self.store.schema.definitions,
        })
    }
}

#[async_trait]
impl Selection for MemorySelection {
    fn path(&self) -> String {
        self.at.join("/")
    }

    async fn read(&self, path: &str) -> Result<Value, ModelError> {
        let target = self.target(path);
        self.store.schema.resolve(&target)?;
        let data = self.store.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(lookup(&data, &target).cloned().unwrap_or(Value::Null))
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), ModelError> {
        let target = self.target(path);
        check_shape(self.shape_at(&target)?, &value, &target.join("/"))?;
        let mut data = self.store.data.write().unwrap_or_else(PoisonError::into_inner);
        assign(&mut data, &target, value)
    }

    async fn action(&self, name: &str, input: Option<Value>) -> Result<Option<Value>, ModelError> {
        let target = self.target(name);
        let path = target.join("/");
        let Some(Def::Action { input: shape, .. }) = self.store.schema.resolve(&target)? else {
            return Err(ModelError::InvalidArgument(format!("'{path}' is not an action")));
        };

        let input = match input {
            Some(v) => Some(v),
            None => {
                let data = self.store.data.read().unwrap_or_else(PoisonError::into_inner);
                lookup(&data, &target).filter(|v| !v.is_null()).cloned()
            }
        };
        if let Some(v) = &input {
            check_shape(shape, v, &path)?;
        }

        let module = &self.store.schema.module;
        let handler = self
            .store
            .behaviors
            .handler(module, &path)
            .ok_or_else(|| ModelError::Failed(format!("no handler for action {module}:{path}")))?;
        tracing::debug!(module = %module, action = %path, "Invoking action");
        handler(ActionRequest {
            module: module.clone(),
            path,
            input,
            notifier: Notifier {
                store: Arc::downgrade(&self.store),
            },
        })
    }

    async fn find(&self, path: &str) -> Result<Arc<dyn Selection>, ModelError> {
        let target = self.target(path);
        self.store.schema.resolve(&target)?;
        Ok(Arc::new(MemorySelection {
            store: self.store.clone(),
            at: target,
        }))
    }

    async fn notifications(&self, sink: EventSink) -> Result<NotificationGuard, ModelError> {
        let path = self.path();
        if !matches!(
            self.store.schema.resolve(&self.at)?,
            Some(Def::Notification { .. })
        ) {
            return Err(ModelError::InvalidArgument(format!(
                "'{path}' is not a notification"
            )));
        }

        let id = self.store.next_listener.fetch_add(1, Ordering::Relaxed);
        self.store
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener { id, path, sink });

        let store = Arc::downgrade(&self.store);
        Ok(NotificationGuard::new(move || {
            if let Some(store) = store.upgrade() {
                store
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|l| l.id != id);
            }
        }))
    }

    async fn edit(&self, op: EditOp, value: Value) -> Result<(), ModelError> {
        let path = self.path();
        check_shape(self.shape_at(&self.at)?, &value, &path)?;

        let mut data = self.store.data.write().unwrap_or_else(PoisonError::into_inner);
        let existing = lookup(&data, &self.at).filter(|v| !v.is_null());
        let merged = match op {
            EditOp::ReplaceFrom => value,
            EditOp::UpsertFrom => merge(existing.cloned(), value),
            EditOp::UpdateFrom => {
                let Some(existing) = existing else {
                    return Err(ModelError::NotFound(format!("'{path}'")));
                };
                merge(Some(existing.clone()), value)
            }
            EditOp::InsertFrom => {
                if let (Some(Value::Object(have)), Value::Object(incoming)) = (existing, &value) {
                    if let Some(k) = incoming.keys().find(|k| have.contains_key(*k)) {
                        return Err(ModelError::InvalidArgument(format!(
                            "'{k}' already exists under '{path}'"
                        )));
                    }
                } else if existing.is_some() {
                    return Err(ModelError::InvalidArgument(format!(
                        "'{path}' already exists"
                    )));
                }
                merge(existing.cloned(), value)
            }
        };
        assign(&mut data, &self.at, merged)
    }
}

fn check_shape(children: &[Def], value: &Value, at: &str) -> Result<(), ModelError> {
    let Value::Object(fields) = value else {
        return Ok(());
    };
    for (key, v) in fields {
        let def = children.iter().find(|d| d.ident() == key).ok_or_else(|| {
            ModelError::InvalidArgument(format!("unknown field '{key}' at '{at}'"))
        })?;
        match (def, v) {
            (Def::List { children, .. }, Value::Array(items)) => {
                for item in items {
                    check_shape(children, item, key)?;
                }
            }
            _ => check_shape(def.children(), v, key)?,
        }
    }
    Ok(())
}

fn lookup<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |node, seg| node.get(seg))
}

fn assign(root: &mut Value, path: &[String], value: Value) -> Result<(), ModelError> {
    let Some((last, parents)) = path.split_last() else {
        if !value.is_object() {
            return Err(ModelError::InvalidArgument(
                "the root of a tree must be an object".into(),
            ));
        }
        *root = value;
        return Ok(());
    };
    let mut node = root;
    for seg in parents {
        node = object_mut(node).entry(seg.clone()).or_insert(Value::Null);
    }
    object_mut(node).insert(last.clone(), value);
    Ok(())
}

fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}

fn merge(existing: Option<Value>, incoming: Value) -> Value {
    match (existing, incoming) {
        (Some(Value::Object(mut have)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                let prior = have.remove(&k);
                have.insert(k, merge(prior, v));
            }
            Value::Object(have)
        }
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use super::*;
    use crate::model::schema::{self, tests::ECHO_MODULE};

    pub(crate) fn echo_behaviors() -> Behaviors {
        Behaviors::new()
            .with_action("echo", "echo", |req| Ok(req.input))
            .with_action("echo", "send", |req| {
                let event = req.input.unwrap_or(Value::Null);
                req.notifier.publish("recv", event)?;
                Ok(None)
            })
    }

    fn echo_root() -> MemorySelection {
        let schema = Arc::new(schema::parse(ECHO_MODULE, "echo").unwrap());
        MemorySelection::root(schema, Arc::new(echo_behaviors()))
    }

    #[tokio::test]
    async fn write_then_read_creates_intermediates() {
        let root = echo_root();
        root.write("g/s", json!("coffee")).await.unwrap();
        assert_eq!(root.read("g").await.unwrap(), json!({"s": "coffee"}));
        assert_eq!(root.read("f").await.unwrap(), Value::Null);
        assert_eq!(root.read("").await.unwrap(), json!({"g": {"s": "coffee"}}));
    }

    #[tokio::test]
    async fn unknown_paths_and_fields() {
        let root = echo_root();
        assert!(matches!(
            root.read("nope").await,
            Err(ModelError::Forward(crate::BridgeError::NotFound(_)))
        ));
        assert!(matches!(
            root.write("g", json!({"t": 1})).await,
            Err(ModelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn action_uses_written_input_when_none_given() {
        let root = echo_root();
        root.write("echo", json!({"f": 99})).await.unwrap();
        assert_eq!(root.action("echo", None).await.unwrap(), Some(json!({"f": 99})));
        assert_eq!(
            root.action("echo", Some(json!({"f": 1}))).await.unwrap(),
            Some(json!({"f": 1}))
        );
    }

    #[tokio::test]
    async fn action_without_handler_fails() {
        let schema = Arc::new(schema::parse(ECHO_MODULE, "echo").unwrap());
        let root = MemorySelection::root(schema, Arc::new(Behaviors::new()));
        assert!(matches!(
            root.action("echo", None).await,
            Err(ModelError::Failed(msg)) if msg.contains("echo:echo")
        ));
        assert!(matches!(
            root.action("f", None).await,
            Err(ModelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn notifications_reach_listeners_until_detached() {
        let root = echo_root();
        let recv = root.find("recv").await.unwrap();
        let got = Arc::new(StdMutex::new(Vec::new()));
        let guard = recv
            .notifications(EventSink::new({
                let got = got.clone();
                move |v| got.lock().unwrap().push(v)
            }))
            .await
            .unwrap();

        root.action("send", Some(json!({"g": {"s": "coffee"}})))
            .await
            .unwrap();
        guard.close();
        root.action("send", Some(json!({"f": 1}))).await.unwrap();

        assert_eq!(*got.lock().unwrap(), vec![json!({"g": {"s": "coffee"}})]);
        assert!(matches!(
            root.find("g").await.unwrap().notifications(EventSink::new(|_| {})).await,
            Err(ModelError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn edit_family() {
        let root = echo_root();
        let g = root.find("g").await.unwrap();

        assert!(matches!(
            g.edit(EditOp::UpdateFrom, json!({"s": "x"})).await,
            Err(ModelError::NotFound(_))
        ));
        g.edit(EditOp::InsertFrom, json!({"s": "tea"})).await.unwrap();
        assert!(matches!(
            g.edit(EditOp::InsertFrom, json!({"s": "again"})).await,
            Err(ModelError::InvalidArgument(_))
        ));
        g.edit(EditOp::UpdateFrom, json!({"s": "coffee"})).await.unwrap();
        assert_eq!(root.read("g/s").await.unwrap(), json!("coffee"));

        root.edit(EditOp::UpsertFrom, json!({"f": 7})).await.unwrap();
        assert_eq!(root.read("").await.unwrap(), json!({"f": 7, "g": {"s": "coffee"}}));

        root.edit(EditOp::ReplaceFrom, json!({"f": 8})).await.unwrap();
        assert_eq!(root.read("").await.unwrap(), json!({"f": 8}));
    }
}
