use serde_json::Value;
use tracing::{error, info};

use crate::events::{HttpRequest, HttpResponse, InvokeRequest, InvokeResponse, SignalRMessage};
use crate::Error;

pub const CONNECTION_INFO_BINDING: &str = "connectionInfo";
pub const MESSAGES_BINDING: &str = "signalRMessages";
pub const REQUEST_BINDING: &str = "req";
pub const RESPONSE_BINDING: &str = "res";
pub const TEST_TARGET: &str = "SignalRTest";

/// `negotiate`: hands the connection info from the input binding to the client.
pub async fn negotiate(request: InvokeRequest) -> Result<InvokeResponse, Error> {
    let req: Option<HttpRequest> = request.optional_binding(REQUEST_BINDING)?;
    let connection_info: Option<Value> = request.optional_binding(CONNECTION_INFO_BINDING)?;

    let response = match connection_info {
        Some(info) => {
            let origin = req.and_then(|r| r.header("Origin")).unwrap_or_default();
            info!("Request from : {}", origin);
            HttpResponse::json(200, &info)?
        }
        None => {
            error!("Connection Info Missing");
            HttpResponse::text(400, "Connection Info Missing")
        }
    };

    Ok(InvokeResponse::default().output(RESPONSE_BINDING, response)?)
}

/// `SignalR_Test`: broadcasts whatever was posted, for checking the hub.
pub async fn test_message(request: InvokeRequest) -> Result<InvokeResponse, Error> {
    info!("SignalR Test Function");
    let req: HttpRequest = request.binding(REQUEST_BINDING)?;
    let data = req
        .body_json()
        .unwrap_or_else(|_| Value::String(req.body_text()));
    let echoed = match &data {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };

    let message = SignalRMessage {
        target: TEST_TARGET.to_string(),
        arguments: vec![data],
    };
    info!("SignalR Test Function.  Message Sent.");

    Ok(InvokeResponse::default()
        .output(MESSAGES_BINDING, vec![message])?
        .output(RESPONSE_BINDING, HttpResponse::text(200, format!("Received Message : {}", echoed)))?)
}
