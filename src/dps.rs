//! `Dps_Processor`: custom allocation webhook for the Device Provisioning
//! Service. Devices go to the first linked hub; devices announcing a model
//! get a twin of that model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::clients::Clients;
use crate::events::{HttpRequest, HttpResponse, InvokeRequest, InvokeResponse};
use crate::models::Dtmi;
use crate::twins::{BasicDigitalTwin, DigitalTwins, TwinsError};
use crate::Error;

pub const REQUEST_BINDING: &str = "req";
pub const RESPONSE_BINDING: &str = "res";

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    #[serde(default)]
    pub device_runtime_context: Option<DeviceRuntimeContext>,
    #[serde(default)]
    pub linked_hubs: Vec<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRuntimeContext {
    #[serde(default)]
    pub registration_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl AllocationRequest {
    pub fn registration_id(&self) -> Option<&str> {
        self.device_runtime_context
            .as_ref()?
            .registration_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// `modelId` the device sent in its provisioning payload.
    pub fn model_id(&self) -> Option<&str> {
        self.device_runtime_context
            .as_ref()?
            .payload
            .as_ref()?
            .get("modelId")?
            .as_str()
            .filter(|id| !id.is_empty())
    }
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResponse {
    pub iot_hub_host_name: String,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AllocationError {
    #[error("Registration ID not provided")]
    MissingRegistrationId,
    #[error("No linked IoT Hub")]
    NoLinkedHub,
}

pub fn allocate(request: &AllocationRequest) -> Result<AllocationResponse, AllocationError> {
    request
        .registration_id()
        .ok_or(AllocationError::MissingRegistrationId)?;
    let hub = request
        .linked_hubs
        .first()
        .ok_or(AllocationError::NoLinkedHub)?;
    Ok(AllocationResponse {
        iot_hub_host_name: hub.clone(),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum TwinProvisioning {
    Created,
    AlreadyExists,
    /// The model has not been uploaded to the twin instance.
    ModelMissing,
}

/// Makes sure a twin named after the registration id exists.
pub async fn ensure_twin(
    twins: &dyn DigitalTwins,
    registration_id: &str,
    model_id: &Dtmi,
) -> Result<TwinProvisioning, TwinsError> {
    if twins.get_model(model_id.as_str()).await?.is_none() {
        return Ok(TwinProvisioning::ModelMissing);
    }
    if twins.get_twin(registration_id).await?.is_some() {
        return Ok(TwinProvisioning::AlreadyExists);
    }

    match twins
        .create_twin(&BasicDigitalTwin::new(registration_id, model_id.as_str()))
        .await
    {
        Ok(_) => Ok(TwinProvisioning::Created),
        // created concurrently by another registration attempt
        Err(e) if e.status() == Some(412) => Ok(TwinProvisioning::AlreadyExists),
        Err(e) => Err(e),
    }
}

async fn provision_twin(clients: &Clients, registration_id: &str, model_id: Option<&str>) {
    let (Some(twins), Some(model_id)) = (&clients.twins, model_id) else {
        return;
    };
    let model_id = match Dtmi::parse(model_id) {
        Ok(model_id) => model_id,
        Err(e) => {
            warn!("not creating a twin for {}: {}", registration_id, e);
            return;
        }
    };

    match ensure_twin(twins.as_ref(), registration_id, &model_id).await {
        Ok(TwinProvisioning::ModelMissing) => {
            warn!("model {} is not uploaded to digital twins, no twin for {}", model_id, registration_id)
        }
        Ok(result) => info!("twin {} of {}: {:?}", registration_id, model_id, result),
        Err(e) => error!("Error provisioning twin {}: {}", registration_id, e),
    }
}

pub async fn handle(clients: &Clients, request: InvokeRequest) -> Result<InvokeResponse, Error> {
    let req: HttpRequest = request.binding(REQUEST_BINDING)?;
    info!("Request.Body: {}", req.body_text());

    let allocation_request = match req.body_json() {
        Ok(body) => AllocationRequest::deserialize(body).unwrap_or_default(),
        Err(e) => {
            warn!("allocation request is not JSON: {}", e);
            AllocationRequest::default()
        }
    };

    let response = match allocate(&allocation_request) {
        Ok(allocation) => {
            let registration_id = allocation_request.registration_id().unwrap_or_default();
            info!(
                "RegID: {} ModelId: {} Hub: {}",
                registration_id,
                allocation_request.model_id().unwrap_or_default(),
                allocation.iot_hub_host_name
            );
            provision_twin(clients, registration_id, allocation_request.model_id()).await;
            HttpResponse::json(200, &allocation)?
        }
        Err(e) => {
            warn!("rejecting allocation: {}", e);
            HttpResponse::text(400, e.to_string())
        }
    };

    Ok(InvokeResponse::default().output(RESPONSE_BINDING, response)?)
}
