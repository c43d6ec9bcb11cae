//! In-memory twin graph for unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::twins::query::{escape_literal, parents_query};
use crate::twins::{
    BasicDigitalTwin, BasicRelationship, DigitalTwins, JsonPatch, PatchOp, TwinsError,
};

#[derive(Default)]
pub struct FakeTwins {
    pub twins: Mutex<Vec<BasicDigitalTwin>>,
    pub relationships: Mutex<Vec<BasicRelationship>>,
    pub models: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<(String, JsonPatch)>>,
    pub queries: Mutex<Vec<String>>,
}

impl FakeTwins {
    pub fn with_twin(self, id: &str, model: &str, contents: Value) -> Self {
        let mut twin = BasicDigitalTwin::new(id, model);
        if let Value::Object(map) = contents {
            twin.contents = map;
        }
        self.twins.lock().unwrap().push(twin);
        self
    }

    pub fn with_contains(self, parent: &str, child: &str) -> Self {
        self.add_contains(parent, child);
        self
    }

    pub fn add_contains(&self, parent: &str, child: &str) {
        self.relationships.lock().unwrap().push(BasicRelationship {
            id: format!("{}-contains-{}", parent, child),
            source_id: parent.to_string(),
            target_id: child.to_string(),
            name: "contains".to_string(),
            ..Default::default()
        });
    }

    pub fn with_model(self, id: &str) -> Self {
        self.models.lock().unwrap().push(id.to_string());
        self
    }

    pub fn twin(&self, id: &str) -> Option<BasicDigitalTwin> {
        self.twins.lock().unwrap().iter().find(|t| t.id == id).cloned()
    }

    pub fn relationship_ids(&self) -> Vec<String> {
        self.relationships
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn take_patches(&self) -> Vec<(String, JsonPatch)> {
        std::mem::take(&mut self.patches.lock().unwrap())
    }
}

#[async_trait]
impl DigitalTwins for FakeTwins {
    async fn query(&self, query: &str) -> Result<Vec<Value>, TwinsError> {
        self.queries.lock().unwrap().push(query.to_string());
        let twins = self.twins.lock().unwrap().clone();

        for twin in &twins {
            if query == parents_query(&twin.id) {
                let relationships = self.relationships.lock().unwrap();
                return Ok(relationships
                    .iter()
                    .filter(|r| r.target_id == twin.id && r.name == "contains")
                    .filter_map(|r| {
                        twins
                            .iter()
                            .find(|p| p.id == r.source_id)
                            .map(|p| json!({"Parent": p, "R": r}))
                    })
                    .collect());
            }
        }

        if query.starts_with("SELECT Room ") {
            return Ok(twins
                .iter()
                .filter(|t| match t.contents.get("roomNumber") {
                    Some(Value::String(room)) => {
                        query.contains(&format!("Room.roomNumber = '{}'", escape_literal(room)))
                    }
                    Some(Value::Number(room)) => {
                        query.contains(&format!("Room.roomNumber = {}", room))
                    }
                    _ => false,
                })
                .map(|t| json!({ "Room": t }))
                .collect());
        }

        Ok(Vec::new())
    }

    async fn get_twin(&self, id: &str) -> Result<Option<BasicDigitalTwin>, TwinsError> {
        Ok(self.twin(id))
    }

    async fn update_twin(&self, id: &str, patch: &JsonPatch) -> Result<(), TwinsError> {
        let mut twins = self.twins.lock().unwrap();
        let twin = twins
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| TwinsError::Service {
                status: 404,
                code: "DigitalTwinNotFound".to_string(),
                message: id.to_string(),
            })?;
        for op in patch.operations() {
            let name = op.path().trim_start_matches('/').to_string();
            match op {
                PatchOp::Add { value, .. } => {
                    twin.contents.insert(name, value.clone());
                }
                PatchOp::Replace { value, .. } => {
                    if !twin.contents.contains_key(&name) {
                        return Err(TwinsError::Service {
                            status: 400,
                            code: "JsonPatchInvalid".to_string(),
                            message: format!("{} does not exist", name),
                        });
                    }
                    twin.contents.insert(name, value.clone());
                }
                PatchOp::Remove { .. } => {
                    twin.contents.remove(&name);
                }
            }
        }
        self.patches
            .lock()
            .unwrap()
            .push((id.to_string(), patch.clone()));
        Ok(())
    }

    async fn create_twin(&self, twin: &BasicDigitalTwin) -> Result<BasicDigitalTwin, TwinsError> {
        let mut twins = self.twins.lock().unwrap();
        if twins.iter().any(|t| t.id == twin.id) {
            return Err(TwinsError::Service {
                status: 412,
                code: "PreconditionFailed".to_string(),
                message: twin.id.clone(),
            });
        }
        twins.push(twin.clone());
        Ok(twin.clone())
    }

    async fn create_relationship(&self, relationship: &BasicRelationship) -> Result<(), TwinsError> {
        self.relationships.lock().unwrap().push(relationship.clone());
        Ok(())
    }

    async fn delete_relationship(&self, source_id: &str, relationship_id: &str) -> Result<(), TwinsError> {
        let mut relationships = self.relationships.lock().unwrap();
        let before = relationships.len();
        relationships.retain(|r| !(r.source_id == source_id && r.id == relationship_id));
        if relationships.len() == before {
            return Err(TwinsError::Service {
                status: 404,
                code: "RelationshipNotFound".to_string(),
                message: relationship_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_model(&self, id: &str) -> Result<Option<Value>, TwinsError> {
        Ok(self
            .models
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.as_str() == id)
            .map(|m| json!({ "id": m })))
    }
}
