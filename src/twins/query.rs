use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::twins::{BasicDigitalTwin, BasicRelationship, DigitalTwins, TwinsError};

/// Relationship name linking a room (or any container) to what it holds.
pub const CONTAINS: &str = "contains";

/// Escapes a value for use inside a single-quoted query string literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub fn parents_query(child_id: &str) -> String {
    format!(
        "SELECT Parent, R FROM DIGITALTWINS Parent JOIN Child RELATED Parent.{} R WHERE Child.$dtId = '{}'",
        CONTAINS,
        escape_literal(child_id)
    )
}

/// Rooms whose `property` equals `room`. Numeric room identifiers also match
/// twins that store the property as a number.
pub fn rooms_query(property: &str, room: &str, model_id: Option<&str>) -> String {
    let mut condition = format!("Room.{} = '{}'", property, escape_literal(room));
    if !room.is_empty() && room.chars().all(|c| c.is_ascii_digit()) {
        condition = format!("({} OR Room.{} = {})", condition, property, room);
    }
    match model_id {
        Some(model_id) => format!(
            "SELECT Room FROM DIGITALTWINS Room WHERE {} AND IS_OF_MODEL(Room, '{}')",
            condition,
            escape_literal(model_id)
        ),
        None => format!("SELECT Room FROM DIGITALTWINS Room WHERE {}", condition),
    }
}

/// A parent twin together with the relationship that makes it the parent.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ParentLink {
    #[serde(rename = "Parent")]
    pub parent: BasicDigitalTwin,
    #[serde(rename = "R")]
    pub relationship: BasicRelationship,
}

#[derive(Deserialize)]
struct RoomRow {
    #[serde(rename = "Room")]
    room: BasicDigitalTwin,
}

/// Twins holding `child_id` through a single incoming `contains` edge.
pub async fn parents_of(twins: &dyn DigitalTwins, child_id: &str) -> Result<Vec<ParentLink>, TwinsError> {
    let rows = twins.query(&parents_query(child_id)).await?;
    debug!("{} parent rows for {}", rows.len(), child_id);
    rows.into_iter()
        .map(|row| ParentLink::deserialize(row).map_err(TwinsError::from))
        .collect()
}

pub async fn rooms_by_number(
    twins: &dyn DigitalTwins,
    property: &str,
    room: &str,
    model_id: Option<&str>,
) -> Result<Vec<BasicDigitalTwin>, TwinsError> {
    let rows = twins.query(&rooms_query(property, room, model_id)).await?;
    rows.into_iter()
        .map(|row: Value| {
            RoomRow::deserialize(row)
                .map(|r| r.room)
                .map_err(TwinsError::from)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parents_query() {
        assert_eq!(
            parents_query("thermostat1"),
            "SELECT Parent, R FROM DIGITALTWINS Parent JOIN Child RELATED Parent.contains R WHERE Child.$dtId = 'thermostat1'"
        );
    }

    #[test]
    fn test_literal_cannot_break_out() {
        let query = parents_query(r"x' OR 1=1 OR Child.$dtId = '\");
        assert!(query.ends_with(r"WHERE Child.$dtId = 'x\' OR 1=1 OR Child.$dtId = \'\\'"));
    }

    #[test]
    fn test_rooms_query() {
        assert_eq!(
            rooms_query("roomNumber", "101", Some("dtmi:com:example:Room;1")),
            "SELECT Room FROM DIGITALTWINS Room WHERE (Room.roomNumber = '101' OR Room.roomNumber = 101) AND IS_OF_MODEL(Room, 'dtmi:com:example:Room;1')"
        );
        assert_eq!(
            rooms_query("roomNumber", "B-12", None),
            "SELECT Room FROM DIGITALTWINS Room WHERE Room.roomNumber = 'B-12'"
        );
    }
}
