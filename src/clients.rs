use std::sync::Arc;
use tracing::info;

use crate::auth::credential;
use crate::config::Config;
use crate::maps::{MapsClient, UnitCache};
use crate::models::{ModelRepository, ModelResolver};
use crate::twins::{DigitalTwinsClient, DynTwins};

/// Service clients shared by every invocation the worker handles.
#[derive(Clone)]
pub struct Clients {
    /// `None` when no Digital Twins instance is configured.
    pub twins: Option<DynTwins>,
    pub models: Arc<ModelResolver>,
    /// `None` unless both the map key and stateset are configured.
    pub maps: Option<MapsClient>,
    pub units: Arc<UnitCache>,
}

impl Clients {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        let twins: Option<DynTwins> = match (&config.adt_host_url, &config.credential) {
            (Some(host_url), Some(credential_config)) => {
                info!("using digital twins instance {}", host_url);
                Some(Arc::new(DigitalTwinsClient::new(
                    http.clone(),
                    host_url,
                    credential(credential_config, http.clone()),
                )))
            }
            (Some(host_url), None) => {
                info!("no credential configured for {}, twin updates disabled", host_url);
                None
            }
            _ => None,
        };

        let repository = ModelRepository::new(
            http.clone(),
            config.model_repository.clone(),
            config.model_repository_token.clone(),
            config.public_model_repository.clone(),
        );

        let maps = match (&config.map_key, &config.map_stateset_id) {
            (Some(key), Some(stateset_id)) => Some(MapsClient::new(
                http.clone(),
                &config.map_base_url,
                key,
                stateset_id,
                config.map_dataset_id.as_deref(),
            )),
            _ => None,
        };

        Clients {
            twins,
            models: Arc::new(ModelResolver::new(Arc::new(repository))),
            maps,
            units: Arc::new(UnitCache::default()),
        }
    }
}
