//! Module schemas.
//!
//! A module is a JSON document (`<dir>/<name>.json`) describing a tree of
//! definitions:
//!
//! ```json
//! {
//!   "module": "car",
//!   "definitions": [
//!     {"kind": "leaf", "ident": "speed", "type": "int32"},
//!     {"kind": "action", "ident": "rotate", "input": [], "output": []},
//!     {"kind": "notification", "ident": "update", "children": []}
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSchema {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default)]
    pub definitions: Vec<Def>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Def {
    Container {
        ident: String,
        #[serde(default)]
        children: Vec<Def>,
    },
    List {
        ident: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default)]
        children: Vec<Def>,
    },
    Leaf {
        ident: String,
        #[serde(rename = "type", default = "default_leaf_type")]
        ty: String,
    },
    Action {
        ident: String,
        #[serde(default)]
        input: Vec<Def>,
        #[serde(default)]
        output: Vec<Def>,
    },
    Notification {
        ident: String,
        #[serde(default)]
        children: Vec<Def>,
    },
}

fn default_leaf_type() -> String {
    "string".to_string()
}

impl Def {
    pub fn ident(&self) -> &str {
        match self {
            Def::Container { ident, .. }
            | Def::List { ident, .. }
            | Def::Leaf { ident, .. }
            | Def::Action { ident, .. }
            | Def::Notification { ident, .. } => ident,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Def::Container { .. } => "container",
            Def::List { .. } => "list",
            Def::Leaf { .. } => "leaf",
            Def::Action { .. } => "action",
            Def::Notification { .. } => "notification",
        }
    }

    /// Definitions reachable by path below this one. For actions that is the
    /// input, which is also what data written at an action path must match.
    pub fn children(&self) -> &[Def] {
        match self {
            Def::Container { children, .. }
            | Def::List { children, .. }
            | Def::Notification { children, .. } => children,
            Def::Action { input, .. } => input,
            Def::Leaf { .. } => &[],
        }
    }
}

/// Parse module source, naming the module it is expected to declare.
pub fn parse(text: &str, expected: &str) -> Result<ModuleSchema, BridgeError> {
    let schema: ModuleSchema = serde_json::from_str(text).map_err(|e| BridgeError::Parse {
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;
    if schema.module != expected {
        return Err(BridgeError::Parse {
            line: 0,
            column: 0,
            message: format!("expected module '{expected}' but found '{}'", schema.module),
        });
    }
    check_unique(&schema.definitions, &schema.module)?;
    Ok(schema)
}

/// Read and parse `<dir>/<name>.json`.
pub async fn load(dir: &Path, name: &str) -> Result<ModuleSchema, BridgeError> {
    let path = dir.join(format!("{name}.json"));
    let text = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => BridgeError::NotFound(format!("module {}", path.display())),
        _ => BridgeError::Adapter(format!("reading {}: {e}", path.display())),
    })?;
    parse(&text, name)
}

fn check_unique(defs: &[Def], parent: &str) -> Result<(), BridgeError> {
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.ident()) {
            return Err(BridgeError::Parse {
                line: 0,
                column: 0,
                message: format!("duplicate identifier '{}' under '{parent}'", def.ident()),
            });
        }
        check_unique(def.children(), def.ident())?;
        if let Def::Action { output, ident, .. } = def {
            check_unique(output, ident)?;
        }
    }
    Ok(())
}

impl ModuleSchema {
    /// Resolve a path of identifiers. The empty path resolves to `None`
    /// (the module root), unknown identifiers to `NotFound`.
    pub fn resolve<I, S>(&self, segments: I) -> Result<Option<&Def>, BridgeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut level: &[Def] = &self.definitions;
        let mut found = None;
        let mut walked = Vec::new();
        for seg in segments {
            let seg = seg.as_ref();
            walked.push(seg.to_string());
            let def = level
                .iter()
                .find(|d| d.ident() == seg)
                .ok_or_else(|| BridgeError::NotFound(format!("{}:{}", self.module, walked.join("/"))))?;
            level = def.children();
            found = Some(def);
        }
        Ok(found)
    }

    /// Schema definition at `path` as JSON (the whole module for "").
    pub fn definition_json(&self, path: &str) -> Result<Value, BridgeError> {
        let def = self.resolve(super::split_path(path))?;
        let value = match def {
            Some(def) => serde_json::to_value(def),
            None => serde_json::to_value(self),
        };
        value.map_err(|e| BridgeError::Adapter(e.to_string()))
    }

    /// Flattened descriptor: one entry per absolute path.
    pub fn descriptor(&self) -> Value {
        let mut entries = BTreeMap::new();
        describe_into(&self.definitions, "", &mut entries);
        json!({
            "module": self.module,
            "namespace": self.namespace,
            "revision": self.revision,
            "paths": entries,
        })
    }
}

fn describe_into(defs: &[Def], prefix: &str, out: &mut BTreeMap<String, Value>) {
    for def in defs {
        let path = if prefix.is_empty() {
            def.ident().to_string()
        } else {
            format!("{prefix}/{}", def.ident())
        };
        let mut entry = json!({"kind": def.kind_name()});
        match def {
            Def::Leaf { ty, .. } => entry["type"] = json!(ty),
            Def::List { key: Some(key), .. } => entry["key"] = json!(key),
            Def::Action { output, .. } => {
                entry["output"] = json!(output.iter().map(Def::ident).collect::<Vec<_>>())
            }
            _ => {}
        }
        out.insert(path.clone(), entry);
        describe_into(def.children(), &path, out);
    }
}
