//! `DigitalTwin_EventGrid_Processor`: mirrors room twin updates onto the
//! Azure Maps indoor map as feature states.

use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clients::Clients;
use crate::config::Config;
use crate::events::{EventGridEvent, InvokeRequest, InvokeResponse, PatchOperation, TwinUpdate};
use crate::telemetry::room::room_value;
use crate::twins::{DigitalTwins, JsonPatch};
use crate::Error;

pub mod client;

pub use client::{MapsClient, MapsError};

pub const EVENT_GRID_BINDING: &str = "eventGridEvent";
pub const UNIT_ID: &str = "unitId";

/// Twin properties that have a feature state of the same name.
pub const FEATURE_KEYS: [&str; 4] = ["temperature", "light", "co2", "occupied"];

/// Map unit ids by room twin id, remembered for the life of the worker.
#[derive(Debug, Default)]
pub struct UnitCache(Mutex<HashMap<String, String>>);

impl UnitCache {
    pub async fn get(&self, twin_id: &str) -> Option<String> {
        self.0.lock().await.get(twin_id).cloned()
    }

    pub async fn insert(&self, twin_id: &str, unit_id: &str) {
        self.0
            .lock()
            .await
            .insert(twin_id.to_string(), unit_id.to_string());
    }
}

/// Feature state updates carried by a twin patch: `add` or `replace` of one
/// of the tracked properties.
pub fn feature_updates(patch: &[PatchOperation]) -> Vec<(&str, &Value)> {
    patch
        .iter()
        .filter(|op| op.op == "add" || op.op == "replace")
        .filter_map(|op| {
            let key = op.path.strip_prefix('/')?;
            let key = FEATURE_KEYS.iter().find(|k| **k == key)?;
            Some((*key, op.value.as_ref()?))
        })
        .collect()
}

/// Room number set by this very update, if any.
fn added_room_number(patch: &[PatchOperation], property: &str) -> Option<String> {
    let path = format!("/{}", property);
    patch
        .iter()
        .find(|op| op.op == "add" && op.path == path)
        .and_then(|op| op.value.as_ref())
        .and_then(room_value)
}

async fn resolve_unit_id(
    twins: &dyn DigitalTwins,
    maps: &MapsClient,
    units: &UnitCache,
    room_property: &str,
    twin_id: &str,
    update: &TwinUpdate,
) -> Result<Option<String>, Error> {
    if let Some(unit_id) = units.get(twin_id).await {
        debug!("Unit ID {} found in cache", unit_id);
        return Ok(Some(unit_id));
    }

    let Some(room) = twins.get_twin(twin_id).await? else {
        error!("Digital Twin for {} not found", twin_id);
        return Ok(None);
    };

    if let Some(unit_id) = room.contents.get(UNIT_ID).and_then(room_value) {
        info!("Found Unit ID {} on {}", unit_id, twin_id);
        units.insert(twin_id, &unit_id).await;
        return Ok(Some(unit_id));
    }

    let room_number = added_room_number(&update.patch, room_property)
        .or_else(|| room.contents.get(room_property).and_then(room_value));
    let Some(room_number) = room_number else {
        info!("{} has no {}, cannot locate its map unit", twin_id, room_property);
        return Ok(None);
    };

    let Some(unit_id) = maps.unit_id(&room_number).await? else {
        return Ok(None);
    };
    info!("Got Unit ID {} from Azure Maps for {}", unit_id, room_number);
    units.insert(twin_id, &unit_id).await;

    // saves the map lookup for other workers
    let mut patch = JsonPatch::new();
    patch.append_add(format!("/{}", UNIT_ID), json!(unit_id));
    if let Err(e) = twins.update_twin(twin_id, &patch).await {
        error!("Error writing Unit ID to {}: {}", twin_id, e);
    }

    Ok(Some(unit_id))
}

pub async fn handle(clients: &Clients, config: &Config, request: InvokeRequest) -> Result<InvokeResponse, Error> {
    let (Some(twins), Some(maps)) = (&clients.twins, &clients.maps) else {
        debug!("digital twins or azure maps not configured, ignoring event");
        return Ok(InvokeResponse::default());
    };

    let event: EventGridEvent = request.binding(EVENT_GRID_BINDING)?;
    let update = event.twin_update()?;
    let twin_id = event.subject.as_str();
    info!("Received {} from {}", event.event_type, twin_id);

    if !update.model_id.starts_with(&config.room_model_prefix) {
        debug!("{} is a {}, not a room", twin_id, update.model_id);
        return Ok(InvokeResponse::default());
    }

    // runs for every room update, tracked properties or not; a failed lookup
    // is only logged and the room's next update looks again
    let unit_id = match resolve_unit_id(
        twins.as_ref(),
        maps,
        &clients.units,
        &config.room_property,
        twin_id,
        &update,
    )
    .await
    {
        Ok(unit_id) => unit_id,
        Err(e) => {
            error!("Error resolving map unit of {}: {}", twin_id, e);
            return Ok(InvokeResponse::default());
        }
    };
    let updates = feature_updates(&update.patch);
    let Some(unit_id) = unit_id else {
        if !updates.is_empty() {
            warn!("no map unit for {}, dropping {} feature updates", twin_id, updates.len());
        }
        return Ok(InvokeResponse::default());
    };

    let mut errors = Vec::new();
    for (key, value) in updates {
        if let Err(e) = maps.update_feature_state(&unit_id, key, value).await {
            error!("Error updating map unit {} {}: {}", unit_id, key, e);
            errors.push(e.to_string());
        }
    }
    if !errors.is_empty() {
        return Err(errors.join("; ").into());
    }

    Ok(InvokeResponse::default())
}
