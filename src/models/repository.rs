use crate::models::dtmi::{Dtmi, InvalidDtmi};
use crate::models::parser::ParseError;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use std::collections::HashMap;
use tracing::{debug, warn};

pub const PUBLIC_MODEL_REPOSITORY: &str = "https://devicemodels.azure.com";

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidDtmi(#[from] InvalidDtmi),
    #[error("model {dtmi} not found in any repository: {reason}")]
    NotFound { dtmi: String, reason: String },
    #[error("failed to parse model: {0}")]
    Parse(#[from] ParseError),
}

/// Where the parser gets the JSON text of models it needs to resolve.
#[async_trait]
pub trait ModelSource: Send + Sync {
    async fn fetch(&self, dtmi: &Dtmi) -> Result<String, ResolveError>;
}

/// Models served from memory, keyed by identifier.
#[async_trait]
impl ModelSource for HashMap<Dtmi, String> {
    async fn fetch(&self, dtmi: &Dtmi) -> Result<String, ResolveError> {
        self.get(dtmi).cloned().ok_or_else(|| ResolveError::NotFound {
            dtmi: dtmi.to_string(),
            reason: "not in local model store".to_string(),
        })
    }
}

/// Two-tier model repository: an optional private repository (usually a
/// GitHub raw content URL with a token) tried first, and the public device
/// model repository as the fallback.
#[derive(Clone, Debug)]
pub struct ModelRepository {
    http: reqwest::Client,
    private_url: Option<String>,
    token: Option<String>,
    public_url: String,
}

impl ModelRepository {
    pub fn new(
        http: reqwest::Client,
        private_url: Option<String>,
        token: Option<String>,
        public_url: String,
    ) -> Self {
        ModelRepository {
            http,
            private_url: private_url.map(|u| u.trim_end_matches('/').to_string()),
            token,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn public(http: reqwest::Client) -> Self {
        Self::new(http, None, None, PUBLIC_MODEL_REPOSITORY.to_string())
    }

    async fn get_model_content(
        &self,
        repository_url: &str,
        dtmi: &Dtmi,
        token: Option<&str>,
    ) -> Result<String, String> {
        let url = format!("{}{}", repository_url, dtmi.to_path());
        debug!("fetching model {} from {}", dtmi, url);

        let mut request = self.http.get(&url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request to {} failed - {}", url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("{} returned {}", url, status));
        }

        let content = response
            .text()
            .await
            .map_err(|e| format!("failed reading {} - {}", url, e))?;
        if content.trim().is_empty() {
            return Err(format!("{} returned an empty document", url));
        }
        Ok(content)
    }
}

#[async_trait]
impl ModelSource for ModelRepository {
    async fn fetch(&self, dtmi: &Dtmi) -> Result<String, ResolveError> {
        let mut reasons = Vec::new();

        if let Some(private_url) = &self.private_url {
            match self
                .get_model_content(private_url, dtmi, self.token.as_deref())
                .await
            {
                Ok(content) => return Ok(content),
                Err(e) => {
                    warn!("private repository lookup failed, trying public repository - {}", e);
                    reasons.push(e);
                }
            }
        }

        match self.get_model_content(&self.public_url, dtmi, None).await {
            Ok(content) => Ok(content),
            Err(e) => {
                reasons.push(e);
                Err(ResolveError::NotFound {
                    dtmi: dtmi.to_string(),
                    reason: reasons.join("; "),
                })
            }
        }
    }
}
