//! Keeps the `contains` edge between a room twin and a device in line with
//! the room the device reports.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::events::MessageBody;
use crate::telemetry::SkipReason;
use crate::twins::{
    parents_of, rooms_by_number, BasicDigitalTwin, BasicRelationship, DynTwins, JsonPatch,
    ParentLink, TwinsError, CONTAINS,
};

/// Room value a device reports when it is not in any room.
pub const NO_ROOM: &str = "0";

pub const OCCUPIED: &str = "occupied";

/// The parent a device currently has, reduced to what planning needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentParent {
    pub twin_id: String,
    pub relationship_id: String,
    /// The parent's own room identifier, when it has one.
    pub room: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomTransition {
    Unchanged,
    /// Remove the device from its room and mark the room unoccupied.
    Detach { parent: String, relationship: String },
    /// Put the device into the room and mark the room occupied.
    Attach { room: String },
    /// Swap the old containment edge for one from the new room.
    Move {
        parent: String,
        relationship: String,
        room: String,
    },
}

/// Decides what to change given the device's current parent and the room it
/// reports.
pub fn plan(current: Option<&CurrentParent>, requested: &str) -> RoomTransition {
    match (current, requested == NO_ROOM) {
        (None, true) => RoomTransition::Unchanged,
        (Some(parent), true) => RoomTransition::Detach {
            parent: parent.twin_id.clone(),
            relationship: parent.relationship_id.clone(),
        },
        (None, false) => RoomTransition::Attach {
            room: requested.to_string(),
        },
        (Some(parent), false) if parent.room.as_deref() == Some(requested) => RoomTransition::Unchanged,
        (Some(parent), false) => RoomTransition::Move {
            parent: parent.twin_id.clone(),
            relationship: parent.relationship_id.clone(),
            room: requested.to_string(),
        },
    }
}

/// Room identifiers arrive as strings or numbers; both compare as text.
/// Whole floating point numbers read as integers, so `0.0` is `"0"`.
pub fn room_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                Some((f as i64).to_string())
            }
            _ => Some(n.to_string()),
        },
        _ => None,
    }
}

/// Room reported in a twin change event, falling back to the desired value.
pub fn requested_room(body: &Value, property: &str) -> Option<String> {
    let properties = body.get("properties")?;
    ["reported", "desired"]
        .iter()
        .find_map(|section| properties.get(section)?.get(property).and_then(room_value))
}

pub fn relationship_id(room_twin_id: &str, device_id: &str) -> String {
    format!("{}-{}-{}", room_twin_id, CONTAINS, device_id)
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoomOutcome {
    Unchanged,
    Detached { from: String },
    Attached { to: String, relationship: String },
    Moved { from: String, to: String, relationship: String },
    Skipped(SkipReason),
}

pub struct RoomMaintainer {
    twins: DynTwins,
    room_property: String,
    room_model_id: Option<String>,
}

impl RoomMaintainer {
    pub fn new(twins: DynTwins, room_property: &str, room_model_id: Option<&str>) -> Self {
        RoomMaintainer {
            twins,
            room_property: room_property.to_string(),
            room_model_id: room_model_id.map(String::from),
        }
    }

    pub async fn apply(&self, device_id: &str, body: &MessageBody) -> Result<RoomOutcome, TwinsError> {
        let Some(event) = body.json() else {
            return Ok(RoomOutcome::Skipped(SkipReason::PayloadNotJson));
        };
        let Some(requested) = requested_room(&event, &self.room_property) else {
            return Ok(RoomOutcome::Skipped(SkipReason::NoRoom));
        };

        let parents = parents_of(self.twins.as_ref(), device_id).await?;
        if parents.len() > 1 {
            warn!("{} has {} parents, leaving relationships alone", device_id, parents.len());
            return Ok(RoomOutcome::Skipped(SkipReason::MultipleParents(parents.len())));
        }
        let link = parents.into_iter().next();
        let current = link.as_ref().map(|l| self.current_parent(l));

        match plan(current.as_ref(), &requested) {
            RoomTransition::Unchanged => Ok(RoomOutcome::Unchanged),
            RoomTransition::Detach {
                parent,
                relationship,
            } => {
                self.twins.delete_relationship(&parent, &relationship).await?;
                if let Some(link) = &link {
                    self.set_occupied(&link.parent, false).await?;
                }
                info!("removed {} from {}", device_id, parent);
                Ok(RoomOutcome::Detached { from: parent })
            }
            RoomTransition::Attach { room } => {
                let room_twin = match self.find_room(&room).await? {
                    Ok(twin) => twin,
                    Err(reason) => return Ok(RoomOutcome::Skipped(reason)),
                };
                let relationship = self.attach(&room_twin.id, device_id).await?;
                self.set_occupied(&room_twin, true).await?;
                info!("placed {} in {}", device_id, room_twin.id);
                Ok(RoomOutcome::Attached {
                    to: room_twin.id,
                    relationship,
                })
            }
            RoomTransition::Move {
                parent,
                relationship,
                room,
            } => {
                // resolve before touching the old edge so an unknown room
                // leaves the device where it is
                let room_twin = match self.find_room(&room).await? {
                    Ok(twin) => twin,
                    Err(reason) => return Ok(RoomOutcome::Skipped(reason)),
                };
                if room_twin.id == parent {
                    return Ok(RoomOutcome::Unchanged);
                }
                self.twins.delete_relationship(&parent, &relationship).await?;
                let relationship = self.attach(&room_twin.id, device_id).await?;
                info!("moved {} from {} to {}", device_id, parent, room_twin.id);
                Ok(RoomOutcome::Moved {
                    from: parent,
                    to: room_twin.id,
                    relationship,
                })
            }
        }
    }

    fn current_parent(&self, link: &ParentLink) -> CurrentParent {
        CurrentParent {
            twin_id: link.parent.id.clone(),
            relationship_id: link.relationship.id.clone(),
            room: link
                .parent
                .contents
                .get(&self.room_property)
                .and_then(room_value),
        }
    }

    async fn find_room(&self, room: &str) -> Result<Result<BasicDigitalTwin, SkipReason>, TwinsError> {
        let mut rooms = rooms_by_number(
            self.twins.as_ref(),
            &self.room_property,
            room,
            self.room_model_id.as_deref(),
        )
        .await?;
        Ok(match rooms.len() {
            1 => Ok(rooms.remove(0)),
            0 => {
                warn!("no room twin has {} {}", self.room_property, room);
                Err(SkipReason::UnknownRoom(room.to_string()))
            }
            n => {
                warn!("{} room twins have {} {}", n, self.room_property, room);
                Err(SkipReason::AmbiguousRoom(room.to_string()))
            }
        })
    }

    async fn attach(&self, room_twin_id: &str, device_id: &str) -> Result<String, TwinsError> {
        let relationship = BasicRelationship {
            id: relationship_id(room_twin_id, device_id),
            source_id: room_twin_id.to_string(),
            target_id: device_id.to_string(),
            name: CONTAINS.to_string(),
            ..Default::default()
        };
        self.twins.create_relationship(&relationship).await?;
        Ok(relationship.id)
    }

    async fn set_occupied(&self, room: &BasicDigitalTwin, occupied: bool) -> Result<(), TwinsError> {
        let mut patch = JsonPatch::new();
        patch.upsert(room, OCCUPIED, json!(occupied));
        self.twins.update_twin(&room.id, &patch).await
    }
}
