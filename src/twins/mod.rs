use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE, IF_NONE_MATCH};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::{AuthError, DynCredential, DIGITAL_TWINS_RESOURCE};

#[cfg(test)]
pub(crate) mod fake;
pub mod patch;
pub mod query;

pub use patch::{property_path, JsonPatch, PatchOp};
pub use query::{parents_of, rooms_by_number, ParentLink, CONTAINS};

pub const API_VERSION: &str = "2023-10-31";

// unreserved characters stay as they are in a path segment
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(thiserror::Error, Debug)]
pub enum TwinsError {
    #[error("digital twins request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("digital twins returned {status} {code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },
    #[error("unexpected digital twins payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl TwinsError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TwinsError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TwinMetadata {
    #[serde(rename = "$model", default)]
    pub model: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BasicDigitalTwin {
    #[serde(rename = "$dtId")]
    pub id: String,
    #[serde(rename = "$etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "$metadata", default)]
    pub metadata: TwinMetadata,
    #[serde(flatten)]
    pub contents: Map<String, Value>,
}

impl BasicDigitalTwin {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        BasicDigitalTwin {
            id: id.into(),
            metadata: TwinMetadata {
                model: model.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BasicRelationship {
    #[serde(rename = "$relationshipId")]
    pub id: String,
    #[serde(rename = "$sourceId")]
    pub source_id: String,
    #[serde(rename = "$targetId")]
    pub target_id: String,
    #[serde(rename = "$relationshipName")]
    pub name: String,
    #[serde(rename = "$etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// The twin graph operations the handlers rely on.
#[async_trait]
pub trait DigitalTwins: Send + Sync {
    /// Runs a query and returns every row across all result pages.
    async fn query(&self, query: &str) -> Result<Vec<Value>, TwinsError>;

    /// `None` when the twin does not exist.
    async fn get_twin(&self, id: &str) -> Result<Option<BasicDigitalTwin>, TwinsError>;

    async fn update_twin(&self, id: &str, patch: &JsonPatch) -> Result<(), TwinsError>;

    /// Creates the twin only if no twin with that id exists.
    async fn create_twin(&self, twin: &BasicDigitalTwin) -> Result<BasicDigitalTwin, TwinsError>;

    async fn create_relationship(&self, relationship: &BasicRelationship) -> Result<(), TwinsError>;

    async fn delete_relationship(&self, source_id: &str, relationship_id: &str) -> Result<(), TwinsError>;

    /// `None` when the model has not been uploaded to the instance.
    async fn get_model(&self, id: &str) -> Result<Option<Value>, TwinsError>;
}

pub type DynTwins = Arc<dyn DigitalTwins>;

/// REST client for the Digital Twins data plane.
pub struct DigitalTwinsClient {
    http: reqwest::Client,
    host_url: String,
    credential: DynCredential,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(default)]
    continuation_token: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: ErrorDetail,
}

#[derive(Deserialize, Default)]
struct ErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

fn segment(id: &str) -> String {
    utf8_percent_encode(id, SEGMENT).to_string()
}

impl DigitalTwinsClient {
    pub fn new(http: reqwest::Client, host_url: &str, credential: DynCredential) -> Self {
        DigitalTwinsClient {
            http,
            host_url: host_url.trim_end_matches('/').to_string(),
            credential,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}?api-version={}", self.host_url, path, API_VERSION)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TwinsError> {
        let token = self.credential.get_token(DIGITAL_TWINS_RESOURCE).await?;
        let response = request
            .header(AUTHORIZATION, format!("Bearer {}", token.token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        Err(TwinsError::Service {
            status: status.as_u16(),
            code: body.error.code,
            message: if body.error.message.is_empty() {
                text
            } else {
                body.error.message
            },
        })
    }
}

#[async_trait]
impl DigitalTwins for DigitalTwinsClient {
    async fn query(&self, query: &str) -> Result<Vec<Value>, TwinsError> {
        debug!("running twin query: {}", query);
        let mut rows = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let body = match &continuation_token {
                Some(token) => json!({ "query": query, "continuationToken": token }),
                None => json!({ "query": query }),
            };
            let page: QueryPage = self
                .send(self.http.post(self.url("/query")).json(&body))
                .await?
                .json()
                .await?;
            rows.extend(page.value);

            match page.continuation_token {
                Some(token) if !token.is_empty() => continuation_token = Some(token),
                _ => break,
            }
        }
        Ok(rows)
    }

    async fn get_twin(&self, id: &str) -> Result<Option<BasicDigitalTwin>, TwinsError> {
        let url = self.url(&format!("/digitaltwins/{}", segment(id)));
        match self.send(self.http.get(url)).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_twin(&self, id: &str, patch: &JsonPatch) -> Result<(), TwinsError> {
        let url = self.url(&format!("/digitaltwins/{}", segment(id)));
        let body = serde_json::to_vec(patch)?;
        self.send(
            self.http
                .patch(url)
                .header(CONTENT_TYPE, "application/json-patch+json")
                .body(body),
        )
        .await?;
        info!("updated twin {} ({} operations)", id, patch.len());
        Ok(())
    }

    async fn create_twin(&self, twin: &BasicDigitalTwin) -> Result<BasicDigitalTwin, TwinsError> {
        let url = self.url(&format!("/digitaltwins/{}", segment(&twin.id)));
        let created = self
            .send(self.http.put(url).header(IF_NONE_MATCH, "*").json(twin))
            .await?
            .json()
            .await?;
        info!("created twin {} of model {}", twin.id, twin.metadata.model);
        Ok(created)
    }

    async fn create_relationship(&self, relationship: &BasicRelationship) -> Result<(), TwinsError> {
        let url = self.url(&format!(
            "/digitaltwins/{}/relationships/{}",
            segment(&relationship.source_id),
            segment(&relationship.id)
        ));
        self.send(self.http.put(url).json(relationship)).await?;
        info!(
            "created relationship {} from {} to {}",
            relationship.id, relationship.source_id, relationship.target_id
        );
        Ok(())
    }

    async fn delete_relationship(&self, source_id: &str, relationship_id: &str) -> Result<(), TwinsError> {
        let url = self.url(&format!(
            "/digitaltwins/{}/relationships/{}",
            segment(source_id),
            segment(relationship_id)
        ));
        self.send(self.http.delete(url)).await?;
        info!("deleted relationship {} from {}", relationship_id, source_id);
        Ok(())
    }

    async fn get_model(&self, id: &str) -> Result<Option<Value>, TwinsError> {
        let url = self.url(&format!("/models/{}", segment(id)));
        match self.send(self.http.get(url)).await {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND.as_u16()) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
