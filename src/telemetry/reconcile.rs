//! Propagates semantically tagged device telemetry onto the parent twin.
//!
//! The device model says which telemetry fields mean what: a field whose
//! DTDL definition carries a recognized semantic type (or, for devices whose
//! models predate annotations, a well-known name) is copied from the message
//! onto the twin that `contains` the device.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::events::MessageBody;
use crate::models::{Dtmi, Entity, ModelResolver, ModelSet};
use crate::telemetry::SkipReason;
use crate::twins::{parents_of, DynTwins, JsonPatch, TwinsError};

/// Recognized semantic types and legacy telemetry names, each mapped to the
/// parent twin property the value is written to.
#[derive(Debug, Clone, PartialEq)]
pub struct SemanticMap {
    semantic_types: Vec<(String, String)>,
    legacy_names: Vec<(String, String)>,
}

impl Default for SemanticMap {
    fn default() -> Self {
        SemanticMap::new()
            .with_semantic_type("Temperature", "temperature")
            .with_semantic_type("Illuminance", "light")
            .with_semantic_type("Humidity", "humidity")
            .with_legacy_name("temperature", "temperature")
            .with_legacy_name("light", "light")
            .with_legacy_name("co2", "co2")
            .with_legacy_name("humidity", "humidity")
    }
}

impl SemanticMap {
    pub fn new() -> Self {
        SemanticMap {
            semantic_types: Vec::new(),
            legacy_names: Vec::new(),
        }
    }

    /// `semantic_type` is either a standard class name (`Temperature`) or a
    /// full identifier.
    pub fn with_semantic_type(mut self, semantic_type: &str, property: &str) -> Self {
        let versionless = crate::models::SupplementalType::new(semantic_type)
            .versionless()
            .to_string();
        self.semantic_types.push((versionless, property.to_string()));
        self
    }

    pub fn with_legacy_name(mut self, name: &str, property: &str) -> Self {
        self.legacy_names.push((name.to_string(), property.to_string()));
        self
    }

    /// Parent property a telemetry entity maps to. Annotated telemetry is
    /// matched on its semantic types only; the legacy names apply to
    /// telemetry without annotations.
    pub fn property_for(&self, telemetry: &Entity) -> Option<&str> {
        if telemetry.supplemental_types.is_empty() {
            return self
                .legacy_names
                .iter()
                .find(|(name, _)| name == telemetry.name())
                .map(|(_, property)| property.as_str());
        }

        telemetry.supplemental_types.iter().find_map(|t| {
            self.semantic_types
                .iter()
                .find(|(versionless, _)| versionless == t.versionless())
                .map(|(_, property)| property.as_str())
        })
    }
}

/// A telemetry field of the device model and the parent property it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMatch {
    pub telemetry: String,
    pub property: String,
}

/// Telemetry of the model that maps to a parent property. With a component
/// name, the component's interface is scanned before the root interface.
/// When several fields map to one property the first one wins.
pub fn match_telemetry(
    models: &ModelSet,
    root: &Dtmi,
    component: Option<&str>,
    semantics: &SemanticMap,
) -> Vec<TelemetryMatch> {
    let mut candidates: Vec<&Entity> = Vec::new();
    if let Some(component) = component {
        match models.component_interface(root, component) {
            Some(interface) => candidates.extend(models.telemetry_of(&interface.id)),
            None => debug!("model {} has no component {}", root, component),
        }
    }
    candidates.extend(models.telemetry_of(root));

    let mut matches: Vec<TelemetryMatch> = Vec::new();
    for telemetry in candidates {
        let Some(property) = semantics.property_for(telemetry) else {
            continue;
        };
        if matches.iter().any(|m| m.property == property) {
            continue;
        }
        matches.push(TelemetryMatch {
            telemetry: telemetry.name().to_string(),
            property: property.to_string(),
        });
    }
    matches
}

/// Values of the matched telemetry present in the payload, keyed by parent
/// property. Absent and null fields are left out.
pub fn extract_values(matches: &[TelemetryMatch], payload: &Map<String, Value>) -> Vec<(String, Value)> {
    matches
        .iter()
        .filter_map(|m| match payload.get(&m.telemetry) {
            None | Some(Value::Null) => None,
            Some(value) => Some((m.property.clone(), value.clone())),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Updated { parent: String, properties: Vec<String> },
    Skipped(SkipReason),
}

pub struct TelemetryReconciler {
    twins: DynTwins,
    models: Arc<ModelResolver>,
    semantics: SemanticMap,
}

impl TelemetryReconciler {
    pub fn new(twins: DynTwins, models: Arc<ModelResolver>) -> Self {
        TelemetryReconciler {
            twins,
            models,
            semantics: SemanticMap::default(),
        }
    }

    pub async fn reconcile(
        &self,
        device_id: &str,
        model_id: Option<&str>,
        component: Option<&str>,
        body: &MessageBody,
    ) -> Result<Outcome, TwinsError> {
        let Some(model_id) = model_id else {
            return Ok(Outcome::Skipped(SkipReason::NoModel));
        };

        let root = match Dtmi::parse(model_id) {
            Ok(root) => root,
            Err(e) => {
                warn!("skipping telemetry from {}: {}", device_id, e);
                return Ok(Outcome::Skipped(SkipReason::ModelUnresolved(e.to_string())));
            }
        };
        let models = match self.models.parse_model(root.as_str()).await {
            Ok(models) => models,
            Err(e) => {
                warn!("skipping telemetry from {}: model {} unresolvable - {}", device_id, root, e);
                return Ok(Outcome::Skipped(SkipReason::ModelUnresolved(e.to_string())));
            }
        };

        let Some(Value::Object(payload)) = body.json() else {
            return Ok(Outcome::Skipped(SkipReason::PayloadNotJson));
        };

        let matches = match_telemetry(&models, &root, component, &self.semantics);
        let values = extract_values(&matches, &payload);
        if values.is_empty() {
            debug!("no mapped telemetry in message from {}", device_id);
            return Ok(Outcome::Skipped(SkipReason::NoMatchingTelemetry));
        }

        let mut parents = parents_of(self.twins.as_ref(), device_id).await?;
        let parent = match parents.len() {
            0 => return Ok(Outcome::Skipped(SkipReason::NoParent)),
            1 => parents.remove(0).parent,
            n => {
                warn!("{} has {} parents, not propagating telemetry", device_id, n);
                return Ok(Outcome::Skipped(SkipReason::MultipleParents(n)));
            }
        };

        let mut patch = JsonPatch::new();
        let mut properties = Vec::with_capacity(values.len());
        for (property, value) in values {
            patch.upsert(&parent, &property, value);
            properties.push(property);
        }
        self.twins.update_twin(&parent.id, &patch).await?;

        info!(
            device = device_id,
            parent = parent.id.as_str(),
            properties = ?properties,
            "propagated telemetry to parent twin"
        );
        Ok(Outcome::Updated {
            parent: parent.id,
            properties,
        })
    }
}
