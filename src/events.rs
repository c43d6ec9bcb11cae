//! Payloads exchanged with the Functions host.
//!
//! The host POSTs an [`InvokeRequest`] to `/{FunctionName}` carrying the
//! trigger and input bindings under `Data` and trigger metadata under
//! `Metadata`, and expects an [`InvokeResponse`] with the output bindings.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum EventError {
    #[error("binding {0} missing from invocation")]
    MissingBinding(String),
    #[error("binding {name} is malformed: {source}")]
    InvalidBinding {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct InvokeRequest {
    #[serde(rename = "Data", default)]
    pub data: HashMap<String, Value>,
    #[serde(rename = "Metadata", default)]
    pub metadata: HashMap<String, Value>,
}

impl InvokeRequest {
    /// Deserializes a binding, accepting JSON text where the host hands the
    /// binding over as a string.
    pub fn binding<T: DeserializeOwned>(&self, name: &str) -> Result<T, EventError> {
        let value = self
            .data
            .get(name)
            .ok_or_else(|| EventError::MissingBinding(name.to_string()))?;
        from_binding(name, value)
    }

    pub fn optional_binding<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, EventError> {
        match self.data.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => from_binding(name, value).map(Some),
        }
    }

    fn metadata_array<T: DeserializeOwned>(&self, name: &str) -> Vec<T> {
        match self.metadata.get(name) {
            Some(value) => from_binding::<Vec<T>>(name, value).unwrap_or_else(|e| {
                debug!("ignoring metadata {}: {}", name, e);
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

fn from_binding<T: DeserializeOwned>(name: &str, value: &Value) -> Result<T, EventError> {
    match T::deserialize(value) {
        Ok(v) => Ok(v),
        Err(source) => match value {
            Value::String(text) => serde_json::from_str(text).map_err(|_| EventError::InvalidBinding {
                name: name.to_string(),
                source,
            }),
            _ => Err(EventError::InvalidBinding {
                name: name.to_string(),
                source,
            }),
        },
    }
}

#[derive(Serialize, Debug, Default)]
pub struct InvokeResponse {
    #[serde(rename = "Outputs")]
    pub outputs: Map<String, Value>,
    #[serde(rename = "Logs")]
    pub logs: Vec<String>,
    #[serde(rename = "ReturnValue")]
    pub return_value: Option<Value>,
}

impl InvokeResponse {
    pub fn output<T: Serialize>(mut self, name: &str, value: T) -> Result<Self, serde_json::Error> {
        self.outputs
            .insert(name.to_string(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }
}

/// Event body normalized to text. IoT Hub routes JSON telemetry as objects
/// but the host may also pass it through as an encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageBody(pub String);

impl<'de> Deserialize<'de> for MessageBody {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw_value: Value = Deserialize::deserialize(deserializer)?;
        match raw_value {
            Value::String(text) => Ok(MessageBody(text)),
            Value::Null => Err(de::Error::custom("event body is null")),
            other => Ok(MessageBody(other.to_string())),
        }
    }
}

impl MessageBody {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.0).ok()
    }
}

/// Event Hub system properties stamped by IoT Hub. The host reports some of
/// them under its own names, so lookups accept both spellings.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(transparent)]
pub struct SystemProperties(pub Map<String, Value>);

impl SystemProperties {
    fn text(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .find_map(|key| self.0.get(*key))
            .and_then(|value| match value {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
    }

    pub fn device_id(&self) -> Option<String> {
        self.text(&["iothub-connection-device-id"])
    }

    pub fn message_source(&self) -> Option<String> {
        self.text(&["iothub-message-source"])
    }

    pub fn data_schema(&self) -> Option<String> {
        self.text(&["dt-dataschema"])
    }

    pub fn subject(&self) -> Option<String> {
        self.text(&["dt-subject"])
    }

    pub fn sequence_number(&self) -> Option<String> {
        self.text(&["x-opt-sequence-number", "SequenceNumber"])
    }

    pub fn enqueued_time(&self) -> Option<DateTime<Utc>> {
        let text = self.text(&["iothub-enqueuedtime", "EnqueuedTimeUtc", "x-opt-enqueued-time"])?;
        if let Ok(time) = DateTime::parse_from_rfc3339(&text) {
            return Some(time.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventHubMessage {
    pub body: MessageBody,
    pub system_properties: SystemProperties,
    pub properties: Map<String, Value>,
}

impl EventHubMessage {
    /// Zips the batch bodies with the per-message property arrays from the
    /// trigger metadata. A single-event trigger is treated as a batch of one.
    pub fn batch(request: &InvokeRequest, binding: &str) -> Result<Vec<EventHubMessage>, EventError> {
        let bodies = match request.data.get(binding) {
            Some(Value::Array(_)) => request.binding::<Vec<MessageBody>>(binding)?,
            Some(_) => vec![request.binding::<MessageBody>(binding)?],
            None => return Err(EventError::MissingBinding(binding.to_string())),
        };

        let mut system_properties = request.metadata_array::<SystemProperties>("SystemPropertiesArray");
        let mut properties = request.metadata_array::<Map<String, Value>>("PropertiesArray");
        if bodies.len() == 1 {
            if let Some(single) = request.metadata.get("SystemProperties") {
                if let Ok(props) = from_binding::<SystemProperties>("SystemProperties", single) {
                    system_properties = vec![props];
                }
            }
            if let Some(single) = request.metadata.get("Properties") {
                if let Ok(props) = from_binding::<Map<String, Value>>("Properties", single) {
                    properties = vec![props];
                }
            }
        }

        let mut system_properties = system_properties.into_iter();
        let mut properties = properties.into_iter();
        Ok(bodies
            .into_iter()
            .map(|body| EventHubMessage {
                body,
                system_properties: system_properties.next().unwrap_or_default(),
                properties: properties.next().unwrap_or_default(),
            })
            .collect())
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventGridEvent {
    #[serde(default)]
    pub id: Option<String>,
    pub subject: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// `Microsoft.DigitalTwins.Twin.Update` payload.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TwinUpdate {
    pub model_id: String,
    #[serde(default)]
    pub patch: Vec<PatchOperation>,
}

/// One operation of a received JSON patch. Unlike the patches this crate
/// sends, ops are kept as text since the service may emit any of them.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PatchOperation {
    pub op: String,
    pub path: String,
    #[serde(default)]
    pub value: Option<Value>,
}

impl EventGridEvent {
    /// The twin-update payload, which Digital Twins nests one level down
    /// under `data.data`.
    pub fn twin_update(&self) -> Result<TwinUpdate, EventError> {
        let data = match &self.data {
            Value::String(text) => serde_json::from_str(text).map_err(|source| EventError::InvalidBinding {
                name: "data".to_string(),
                source,
            })?,
            other => other.clone(),
        };
        let inner = match data.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => &data,
        };
        TwinUpdate::deserialize(inner).map_err(|source| EventError::InvalidBinding {
            name: "data".to_string(),
            source,
        })
    }
}

/// HTTP trigger binding as forwarded by the host.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub query: HashMap<String, Value>,
    #[serde(default)]
    pub headers: HashMap<String, Value>,
    #[serde(default)]
    pub body: Value,
}

impl HttpRequest {
    pub fn body_text(&self) -> String {
        match &self.body {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    pub fn body_json(&self) -> Result<Value, serde_json::Error> {
        match &self.body {
            Value::String(text) => serde_json::from_str(text),
            other => Ok(other.clone()),
        }
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| match value {
                Value::Array(values) => values.first().and_then(Value::as_str).map(String::from),
                Value::String(s) => Some(s.clone()),
                _ => None,
            })
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn json<T: Serialize>(status_code: u16, body: &T) -> Result<Self, serde_json::Error> {
        Ok(HttpResponse {
            status_code,
            body: serde_json::to_value(body)?,
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
        })
    }

    pub fn text(status_code: u16, body: impl Into<String>) -> Self {
        HttpResponse {
            status_code,
            body: Value::String(body.into()),
            headers: HashMap::from([("Content-Type".to_string(), "text/plain".to_string())]),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SignalRMessage {
    pub target: String,
    pub arguments: Vec<Value>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_hub_batch() {
        let request: InvokeRequest = serde_json::from_value(json!({
            "Data": {
                "eventHubMessages": [
                    {"temperature": 21.5},
                    "{\"light\": 300}"
                ]
            },
            "Metadata": {
                "SystemPropertiesArray": [
                    {
                        "iothub-connection-device-id": "thermostat1",
                        "iothub-message-source": "Telemetry",
                        "iothub-enqueuedtime": "2021-03-01T10:20:30.123Z",
                        "x-opt-sequence-number": 42,
                        "dt-dataschema": "dtmi:com:example:Thermostat;1"
                    },
                    {
                        "iothub-connection-device-id": "light1",
                        "iothub-message-source": "Telemetry",
                        "EnqueuedTimeUtc": "2021-03-01T10:20:31.5",
                        "SequenceNumber": "43"
                    }
                ],
                "PropertiesArray": [{}, {"alert": "true"}]
            }
        }))
        .unwrap();

        let batch = EventHubMessage::batch(&request, "eventHubMessages").unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].body.json(), Some(json!({"temperature": 21.5})));
        assert_eq!(batch[1].body.as_str(), "{\"light\": 300}");

        let first = &batch[0].system_properties;
        assert_eq!(first.device_id().as_deref(), Some("thermostat1"));
        assert_eq!(first.sequence_number().as_deref(), Some("42"));
        assert_eq!(first.data_schema().as_deref(), Some("dtmi:com:example:Thermostat;1"));
        assert_eq!(
            first.enqueued_time().unwrap().to_rfc3339(),
            "2021-03-01T10:20:30.123+00:00"
        );

        let second = &batch[1].system_properties;
        assert_eq!(second.sequence_number().as_deref(), Some("43"));
        assert!(second.enqueued_time().is_some());
        assert_eq!(second.data_schema(), None);
        assert_eq!(batch[1].properties.get("alert"), Some(&json!("true")));
    }

    #[test]
    fn test_missing_binding() {
        let request = InvokeRequest::default();
        let err = EventHubMessage::batch(&request, "eventHubMessages").unwrap_err();
        assert!(matches!(err, EventError::MissingBinding(_)));
    }

    #[test]
    fn test_twin_update_nested_and_encoded() {
        let nested = EventGridEvent {
            id: None,
            subject: "room-101".to_string(),
            event_type: "Microsoft.DigitalTwins.Twin.Update".to_string(),
            event_time: None,
            data: json!({
                "data": {
                    "modelId": "dtmi:com:example:Room;1",
                    "patch": [{"op": "replace", "path": "/temperature", "value": 22}]
                },
                "contenttype": "application/json"
            }),
        };
        let update = nested.twin_update().unwrap();
        assert_eq!(update.model_id, "dtmi:com:example:Room;1");
        assert_eq!(update.patch[0].path, "/temperature");

        let encoded = EventGridEvent {
            data: Value::String(
                r#"{"modelId": "dtmi:com:example:Room;1", "patch": [{"op": "remove", "path": "/light"}]}"#
                    .to_string(),
            ),
            ..nested
        };
        let update = encoded.twin_update().unwrap();
        assert_eq!(update.patch[0].value, None);
    }

    #[test]
    fn test_http_request_binding_from_string() {
        let request: InvokeRequest = serde_json::from_value(json!({
            "Data": {
                "req": {
                    "Url": "http://localhost:7071/api/Dps_Processor",
                    "Method": "POST",
                    "Headers": {"Origin": ["https://portal"]},
                    "Body": "{\"linkedHubs\": [\"hub1\"]}"
                }
            }
        }))
        .unwrap();
        let req: HttpRequest = request.binding("req").unwrap();
        assert_eq!(req.header("origin").as_deref(), Some("https://portal"));
        assert_eq!(req.body_json().unwrap(), json!({"linkedHubs": ["hub1"]}));
    }

    #[test]
    fn test_invoke_response_shape() {
        let response = InvokeResponse::default()
            .output("res", HttpResponse::text(200, "ok"))
            .unwrap()
            .log("done");
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "Outputs": {"res": {"statusCode": 200, "body": "ok", "headers": {"Content-Type": "text/plain"}}},
                "Logs": ["done"],
                "ReturnValue": null
            })
        );
    }
}
