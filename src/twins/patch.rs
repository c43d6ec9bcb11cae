use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::twins::BasicDigitalTwin;

/// A single RFC 6902 operation as understood by the twin update API.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

/// Body of an `application/json-patch+json` twin update.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct JsonPatch(Vec<PatchOp>);

impl JsonPatch {
    pub fn new() -> Self {
        JsonPatch::default()
    }

    pub fn append_add(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.0.push(PatchOp::Add {
            path: path.into(),
            value,
        });
        self
    }

    pub fn append_replace(&mut self, path: impl Into<String>, value: Value) -> &mut Self {
        self.0.push(PatchOp::Replace {
            path: path.into(),
            value,
        });
        self
    }

    pub fn append_remove(&mut self, path: impl Into<String>) -> &mut Self {
        self.0.push(PatchOp::Remove { path: path.into() });
        self
    }

    /// Replaces a top-level property the twin already has, adds it otherwise.
    /// `replace` on a missing property is rejected by the service.
    pub fn upsert(&mut self, twin: &BasicDigitalTwin, property: &str, value: Value) -> &mut Self {
        let path = property_path(property);
        if twin.contents.contains_key(property) {
            self.append_replace(path, value)
        } else {
            self.append_add(path, value)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn operations(&self) -> &[PatchOp] {
        &self.0
    }
}

/// JSON pointer to a top-level property.
pub fn property_path(name: &str) -> String {
    format!("/{}", name.replace('~', "~0").replace('/', "~1"))
}
