use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::events::{SignalRMessage, SystemProperties};
use crate::telemetry::MessageSource;

pub const EVENT_TYPE: &str = "Event Hubs";

/// What web clients receive for every device event, serialized to JSON text
/// as the single argument of the SignalR message.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_id: String,
    pub event_type: String,
    pub device_id: String,
    pub event_source: String,
    pub event_time: String,
    pub data: String,
    pub dt_data_schema: String,
}

/// `yyyy-MM-ddTHH:mm:ss.fffZ`
pub fn format_event_time(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

impl Notification {
    pub fn new(
        properties: &SystemProperties,
        source: &MessageSource,
        device_id: &str,
        event_id: String,
        enqueued_time: &DateTime<Utc>,
        data: String,
    ) -> Self {
        Notification {
            event_id,
            event_type: EVENT_TYPE.to_string(),
            device_id: device_id.to_string(),
            event_source: source.to_string(),
            event_time: format_event_time(enqueued_time),
            data,
            dt_data_schema: properties.data_schema().unwrap_or_default(),
        }
    }

    pub fn into_signalr(self, target: &str) -> Result<SignalRMessage, serde_json::Error> {
        Ok(SignalRMessage {
            target: target.to_string(),
            arguments: vec![Value::String(serde_json::to_string(&self)?)],
        })
    }
}
