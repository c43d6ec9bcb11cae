use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub const MAPS_API_VERSION: &str = "2.0";

#[derive(thiserror::Error, Debug)]
pub enum MapsError {
    #[error("azure maps request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("azure maps returned {status}: {body}")]
    Service { status: u16, body: String },
}

/// Azure Maps Creator: WFS unit lookup and feature stateset updates.
#[derive(Clone, Debug)]
pub struct MapsClient {
    http: reqwest::Client,
    base_url: String,
    subscription_key: String,
    stateset_id: String,
    dataset_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
    #[serde(default)]
    number_returned: u64,
}

#[derive(Deserialize, Debug)]
struct Feature {
    id: String,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
struct FeatureStates<'a> {
    states: Vec<FeatureState<'a>>,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
struct FeatureState<'a> {
    key_name: &'a str,
    value: &'a Value,
    event_timestamp: String,
}

impl MapsClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        subscription_key: &str,
        stateset_id: &str,
        dataset_id: Option<&str>,
    ) -> Self {
        MapsClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            subscription_key: subscription_key.to_string(),
            stateset_id: stateset_id.to_string(),
            dataset_id: dataset_id.map(String::from),
        }
    }

    /// Id of the unit feature named `room_number`, when exactly one matches.
    pub async fn unit_id(&self, room_number: &str) -> Result<Option<String>, MapsError> {
        let Some(dataset_id) = &self.dataset_id else {
            debug!("no dataset configured, cannot look up unit for {}", room_number);
            return Ok(None);
        };

        let url = format!(
            "{}/wfs/datasets/{}/collections/unit/items",
            self.base_url, dataset_id
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("api-version", MAPS_API_VERSION),
                ("limit", "1"),
                ("subscription-key", self.subscription_key.as_str()),
                ("name", room_number),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MapsError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let mut features: FeatureCollection = response.json().await?;
        if features.number_returned != 1 || features.features.is_empty() {
            info!("{} unit features named {}", features.number_returned, room_number);
            return Ok(None);
        }
        Ok(Some(features.features.remove(0).id))
    }

    pub async fn update_feature_state(
        &self,
        feature_id: &str,
        key_name: &str,
        value: &Value,
    ) -> Result<(), MapsError> {
        let url = format!(
            "{}/featureStateSets/{}/featureStates/{}",
            self.base_url, self.stateset_id, feature_id
        );
        let body = FeatureStates {
            states: vec![FeatureState {
                key_name,
                value,
                event_timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            }],
        };

        let response = self
            .http
            .put(&url)
            .query(&[
                ("api-version", MAPS_API_VERSION),
                ("subscription-key", self.subscription_key.as_str()),
            ])
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MapsError::Service {
                status: status.as_u16(),
                body,
            });
        }

        info!("updated map feature {} {} to {}", feature_id, key_name, value);
        Ok(())
    }
}
