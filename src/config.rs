use std::env;
use std::string::String;

use crate::models::PUBLIC_MODEL_REPOSITORY;

pub const DEFAULT_MAP_BASE_URL: &str = "https://us.atlas.microsoft.com";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

pub struct Config {
    pub adt_host_url: Option<String>,
    pub credential: Option<CredentialConfig>,
    pub model_repository: Option<String>,
    pub model_repository_token: Option<String>,
    pub public_model_repository: String,
    pub map_key: Option<String>,
    pub map_stateset_id: Option<String>,
    pub map_dataset_id: Option<String>,
    pub map_base_url: String,
    pub room_property: String,
    pub room_model_id: Option<String>,
    pub room_model_prefix: String,
    pub http_timeout: u64,
    pub port: u16,
}

/// How the functions authenticate against Azure Digital Twins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialConfig {
    Static(String),
    ClientSecret {
        authority_host: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ManagedIdentity {
        endpoint: String,
        header: String,
        client_id: Option<String>,
    },
}

impl CredentialConfig {
    /// Picks, in order: a static token, a service principal secret, the
    /// managed identity endpoint of the function app.
    pub fn from_env() -> Option<CredentialConfig> {
        if let Some(token) = var("ADT_ACCESS_TOKEN") {
            return Some(CredentialConfig::Static(token));
        }

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) = (
            var("AZURE_TENANT_ID"),
            var("AZURE_CLIENT_ID"),
            var("AZURE_CLIENT_SECRET"),
        ) {
            return Some(CredentialConfig::ClientSecret {
                authority_host: var("AZURE_AUTHORITY_HOST")
                    .unwrap_or(DEFAULT_AUTHORITY_HOST.to_string()),
                tenant_id,
                client_id,
                client_secret,
            });
        }

        if let (Some(endpoint), Some(header)) = (var("IDENTITY_ENDPOINT"), var("IDENTITY_HEADER"))
        {
            return Some(CredentialConfig::ManagedIdentity {
                endpoint,
                header,
                client_id: var("AZURE_CLIENT_ID"),
            });
        }

        None
    }
}

// unset and blank variables are treated the same
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    pub fn load_from_env() -> Result<Config, String> {
        let conf = Config {
            adt_host_url: var("ADT_HOST_URL").map(|url| normalize_host_url(&url)),
            credential: CredentialConfig::from_env(),
            model_repository: var("ModelRepository"),
            model_repository_token: var("GitToken"),
            public_model_repository: var("PUBLIC_MODEL_REPOSITORY")
                .unwrap_or(PUBLIC_MODEL_REPOSITORY.to_string()),
            map_key: var("MAP_KEY"),
            map_stateset_id: var("MAP_STATESET_ID"),
            map_dataset_id: var("MAP_DATASET_ID"),
            map_base_url: var("MAP_BASE_URL").unwrap_or(DEFAULT_MAP_BASE_URL.to_string()),
            room_property: var("ROOM_PROPERTY").unwrap_or("roomNumber".to_string()),
            room_model_id: var("ROOM_MODEL_ID"),
            room_model_prefix: var("ROOM_MODEL_PREFIX")
                .unwrap_or("dtmi:com:example:Room".to_string()),
            http_timeout: env::var("HTTP_TIMEOUT_SECONDS")
                .unwrap_or("30".to_string())
                .parse::<u64>()
                .map_err(|e| format!("Error parsing HTTP_TIMEOUT_SECONDS to u64 - {}", e))?,
            port: env::var("FUNCTIONS_CUSTOMHANDLER_PORT")
                .unwrap_or("3000".to_string())
                .parse::<u16>()
                .map_err(|e| format!("Error parsing FUNCTIONS_CUSTOMHANDLER_PORT to u16 - {}", e))?,
        };

        if let Some(room_model_id) = &conf.room_model_id {
            if !crate::models::is_valid_dtmi(room_model_id) {
                return Err(format!("ROOM_MODEL_ID is not a valid model id - {}", room_model_id));
            }
        }

        Ok(conf)
    }
}

/// Accepts instance host names with or without scheme.
fn normalize_host_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("https://") || url.starts_with("http://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}
