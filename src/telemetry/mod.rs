//! `Telemetry_Processor`: IoT Hub messages routed through Event Hubs.
//!
//! Every message with a known source is relayed to web clients through
//! SignalR. Telemetry is additionally propagated to the device's parent twin
//! and twin change events keep the device's room relationship current.

use std::fmt;
use tracing::{debug, error, info};

use crate::clients::Clients;
use crate::config::Config;
use crate::events::{EventHubMessage, InvokeRequest, InvokeResponse, SignalRMessage};
use crate::Error;

pub mod notification;
pub mod reconcile;
pub mod room;

pub use notification::Notification;
pub use reconcile::{Outcome, SemanticMap, TelemetryReconciler};
pub use room::{plan, RoomMaintainer, RoomOutcome, RoomTransition};

pub const EVENT_HUB_BINDING: &str = "eventHubMessages";
pub const SIGNALR_BINDING: &str = "signalRMessages";

/// `iothub-message-source` of a routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Telemetry,
    TwinChangeEvents,
    DigitalTwinChangeEvents,
    DeviceLifecycleEvents,
    Other(String),
}

impl From<&str> for MessageSource {
    fn from(value: &str) -> Self {
        match value {
            "Telemetry" => MessageSource::Telemetry,
            "twinChangeEvents" => MessageSource::TwinChangeEvents,
            "digitalTwinChangeEvents" => MessageSource::DigitalTwinChangeEvents,
            "deviceLifecycleEvents" => MessageSource::DeviceLifecycleEvents,
            other => MessageSource::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            MessageSource::Telemetry => "Telemetry",
            MessageSource::TwinChangeEvents => "twinChangeEvents",
            MessageSource::DigitalTwinChangeEvents => "digitalTwinChangeEvents",
            MessageSource::DeviceLifecycleEvents => "deviceLifecycleEvents",
            MessageSource::Other(other) => other,
        };
        f.write_str(name)
    }
}

impl MessageSource {
    /// Client method the notification is delivered to.
    pub fn signalr_target(&self) -> Option<&'static str> {
        match self {
            MessageSource::Telemetry => Some("DeviceTelemetry"),
            MessageSource::TwinChangeEvents => Some("DeviceTwinChange"),
            MessageSource::DigitalTwinChangeEvents => Some("DigitalTwinChange"),
            MessageSource::DeviceLifecycleEvents => Some("DeviceLifecycle"),
            MessageSource::Other(_) => None,
        }
    }
}

/// Why a message left the twin graph untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoModel,
    ModelUnresolved(String),
    PayloadNotJson,
    NoMatchingTelemetry,
    NoParent,
    MultipleParents(usize),
    NoRoom,
    UnknownRoom(String),
    AmbiguousRoom(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SkipReason::NoModel => write!(f, "message carries no model id"),
            SkipReason::ModelUnresolved(reason) => write!(f, "model unresolvable: {}", reason),
            SkipReason::PayloadNotJson => write!(f, "payload is not a JSON object"),
            SkipReason::NoMatchingTelemetry => write!(f, "no mapped telemetry in payload"),
            SkipReason::NoParent => write!(f, "device has no parent"),
            SkipReason::MultipleParents(n) => write!(f, "device has {} parents", n),
            SkipReason::NoRoom => write!(f, "no room in twin change"),
            SkipReason::UnknownRoom(room) => write!(f, "no room twin for {}", room),
            SkipReason::AmbiguousRoom(room) => write!(f, "several room twins for {}", room),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("system property {0} missing")]
    MissingProperty(&'static str),
    #[error("failed to serialize notification: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct BatchProcessor {
    reconciler: Option<TelemetryReconciler>,
    rooms: Option<RoomMaintainer>,
}

impl BatchProcessor {
    fn new(clients: &Clients, config: &Config) -> Self {
        BatchProcessor {
            reconciler: clients
                .twins
                .clone()
                .map(|twins| TelemetryReconciler::new(twins, clients.models.clone())),
            rooms: clients.twins.clone().map(|twins| {
                RoomMaintainer::new(twins, &config.room_property, config.room_model_id.as_deref())
            }),
        }
    }

    async fn process(&self, message: &EventHubMessage) -> Result<Option<SignalRMessage>, MessageError> {
        let props = &message.system_properties;
        let Some(source) = props.message_source() else {
            info!("Unsupported Message Source");
            return Ok(None);
        };
        let source = MessageSource::from(source.as_str());
        let Some(target) = source.signalr_target() else {
            info!("IoT Hub message source {} not relayed", source);
            return Ok(None);
        };

        let device_id = props
            .device_id()
            .ok_or(MessageError::MissingProperty("iothub-connection-device-id"))?;
        let event_id = props
            .sequence_number()
            .ok_or(MessageError::MissingProperty("x-opt-sequence-number"))?;
        let enqueued_time = props
            .enqueued_time()
            .ok_or(MessageError::MissingProperty("iothub-enqueuedtime"))?;
        debug!(device = device_id.as_str(), source = %source, "message body: {}", message.body.as_str());

        let data = match source {
            MessageSource::Telemetry => {
                self.on_telemetry(&device_id, message).await;
                message.body.as_str().to_string()
            }
            MessageSource::TwinChangeEvents => {
                self.on_twin_change(&device_id, message).await;
                message.body.as_str().to_string()
            }
            MessageSource::DeviceLifecycleEvents => serde_json::to_string(&message.properties)?,
            _ => message.body.as_str().to_string(),
        };

        let notification = Notification::new(props, &source, &device_id, event_id, &enqueued_time, data);
        Ok(Some(notification.into_signalr(target)?))
    }

    // graph failures are logged, they never hold back the notification
    async fn on_telemetry(&self, device_id: &str, message: &EventHubMessage) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };
        let props = &message.system_properties;
        let model_id = props.data_schema();
        let component = props.subject();
        match reconciler
            .reconcile(device_id, model_id.as_deref(), component.as_deref(), &message.body)
            .await
        {
            Ok(Outcome::Skipped(reason)) => debug!("telemetry from {} not propagated: {}", device_id, reason),
            Ok(outcome) => debug!("telemetry from {}: {:?}", device_id, outcome),
            Err(e) => error!("Error updating parent twin of {}: {}", device_id, e),
        }
    }

    async fn on_twin_change(&self, device_id: &str, message: &EventHubMessage) {
        let Some(rooms) = &self.rooms else {
            return;
        };
        match rooms.apply(device_id, &message.body).await {
            Ok(RoomOutcome::Skipped(reason)) => debug!("room of {} not maintained: {}", device_id, reason),
            Ok(outcome) => debug!("room of {}: {:?}", device_id, outcome),
            Err(e) => error!("Error maintaining room relationship of {}: {}", device_id, e),
        }
    }
}

pub async fn handle(clients: &Clients, config: &Config, request: InvokeRequest) -> Result<InvokeResponse, Error> {
    let messages = EventHubMessage::batch(&request, EVENT_HUB_BINDING)?;
    info!("Handling {} event hub messages", messages.len());

    let processor = BatchProcessor::new(clients, config);
    let mut notifications = Vec::new();
    let mut errors = Vec::new();
    for message in &messages {
        match processor.process(message).await {
            Ok(Some(notification)) => notifications.push(notification),
            Ok(None) => {}
            Err(e) => {
                error!("Error processing message: {}", e);
                errors.push(e.to_string());
            }
        }
    }

    // one bad message fails the batch and drops the notifications of its good
    // messages too, so a host retry policy replays the batch as a unit
    if !errors.is_empty() {
        return Err(format!(
            "{} of {} messages failed: {}",
            errors.len(),
            messages.len(),
            errors.join("; ")
        )
        .into());
    }

    Ok(InvokeResponse::default().output(SIGNALR_BINDING, notifications)?)
}
