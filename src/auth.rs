use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::CredentialConfig;

/// Resource the Digital Twins data plane issues tokens for.
pub const DIGITAL_TWINS_RESOURCE: &str = "https://digitaltwins.azure.net";

const MANAGED_IDENTITY_API_VERSION: &str = "2019-08-01";

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("token request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    Endpoint {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_on - Duration::minutes(5) > Utc::now()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, AuthError>;
}

pub type DynCredential = Arc<dyn TokenCredential>;

/// Builds the credential described by the configuration, wrapped in a cache.
pub fn credential(config: &CredentialConfig, http: reqwest::Client) -> DynCredential {
    let inner: DynCredential = match config {
        CredentialConfig::Static(token) => Arc::new(StaticTokenCredential(token.clone())),
        CredentialConfig::ClientSecret {
            authority_host,
            tenant_id,
            client_id,
            client_secret,
        } => {
            info!("using client secret credential for client {}", client_id);
            Arc::new(ClientSecretCredential {
                http,
                authority_host: authority_host.trim_end_matches('/').to_string(),
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            })
        }
        CredentialConfig::ManagedIdentity {
            endpoint,
            header,
            client_id,
        } => {
            info!("using managed identity credential");
            Arc::new(ManagedIdentityCredential {
                http,
                endpoint: endpoint.clone(),
                header: header.clone(),
                client_id: client_id.clone(),
            })
        }
    };
    Arc::new(CachedCredential::new(inner))
}

/// A fixed bearer token, for local runs against a twin instance.
pub struct StaticTokenCredential(pub String);

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _resource: &str) -> Result<AccessToken, AuthError> {
        Ok(AccessToken {
            token: self.0.clone(),
            expires_on: DateTime::<Utc>::MAX_UTC,
        })
    }
}

/// App Service / Functions managed identity endpoint.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    header: String,
    client_id: Option<String>,
}

#[derive(Deserialize)]
struct ManagedIdentityToken {
    access_token: String,
    // seconds since epoch, sent as a string by the App Service endpoint
    expires_on: Value,
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, AuthError> {
        let mut query = vec![
            ("resource", resource.to_string()),
            ("api-version", MANAGED_IDENTITY_API_VERSION.to_string()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }

        let response = self
            .http
            .get(&self.endpoint)
            .header("X-IDENTITY-HEADER", &self.header)
            .query(&query)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Endpoint { status, body });
        }

        let token: ManagedIdentityToken = response.json().await?;
        let seconds = match &token.expires_on {
            Value::String(s) => s.parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
        .ok_or_else(|| {
            AuthError::InvalidResponse(format!("unexpected expires_on {}", token.expires_on))
        })?;
        let expires_on = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidResponse(format!("expires_on out of range {}", seconds)))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_on,
        })
    }
}

/// Service principal with a client secret (OAuth2 client credentials flow).
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority_host: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct ClientCredentialsToken {
    access_token: String,
    expires_in: i64,
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, AuthError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host, self.tenant_id
        );
        let scope = format!("{}/.default", resource.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Endpoint { status, body });
        }

        let token: ClientCredentialsToken = response.json().await?;
        Ok(AccessToken {
            token: token.access_token,
            expires_on: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}

/// Reuses a token until it is within five minutes of expiring.
pub struct CachedCredential {
    inner: DynCredential,
    cached: Mutex<Option<(String, AccessToken)>>,
}

impl CachedCredential {
    pub fn new(inner: DynCredential) -> Self {
        CachedCredential {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenCredential for CachedCredential {
    async fn get_token(&self, resource: &str) -> Result<AccessToken, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some((cached_resource, token)) = cached.as_ref() {
            if cached_resource == resource && token.is_fresh() {
                return Ok(token.clone());
            }
        }

        debug!("requesting new access token for {}", resource);
        let token = self.inner.get_token(resource).await?;
        *cached = Some((resource.to_string(), token.clone()));
        Ok(token)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_managed_identity_token_is_cached() {
        let server = MockServer::start().await;
        let expires_on = (Utc::now() + Duration::hours(1)).timestamp().to_string();
        Mock::given(method("GET"))
            .and(path("/msi/token"))
            .and(header("X-IDENTITY-HEADER", "identity-secret"))
            .and(query_param("resource", DIGITAL_TWINS_RESOURCE))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "mi-token",
                "expires_on": expires_on,
                "resource": DIGITAL_TWINS_RESOURCE,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = credential(
            &CredentialConfig::ManagedIdentity {
                endpoint: format!("{}/msi/token", server.uri()),
                header: "identity-secret".to_string(),
                client_id: None,
            },
            reqwest::Client::new(),
        );
        for _ in 0..3 {
            let token = cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
            assert_eq!(token.token, "mi-token");
        }
    }

    #[tokio::test]
    async fn test_client_secret_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_id=app-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "sp-token",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let cred = credential(
            &CredentialConfig::ClientSecret {
                authority_host: server.uri(),
                tenant_id: "tenant-1".to_string(),
                client_id: "app-1".to_string(),
                client_secret: "shh".to_string(),
            },
            reqwest::Client::new(),
        );
        let token = cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
        assert_eq!(token.token, "sp-token");
        assert!(token.is_fresh());
    }

    struct CountingCredential {
        lifetime: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenCredential for CountingCredential {
        async fn get_token(&self, _resource: &str) -> Result<AccessToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("token-{}", n),
                expires_on: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_token_near_expiry_is_refreshed() {
        let inner = Arc::new(CountingCredential {
            lifetime: Duration::minutes(4),
            calls: AtomicUsize::new(0),
        });
        let cred = CachedCredential::new(inner.clone());

        let first = cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
        let second = cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
        assert_eq!(first.token, "token-0");
        assert_eq!(second.token, "token-1");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_cached_per_resource() {
        let inner = Arc::new(CountingCredential {
            lifetime: Duration::minutes(10),
            calls: AtomicUsize::new(0),
        });
        let cred = CachedCredential::new(inner.clone());

        cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
        cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let other = cred.get_token("https://management.azure.com").await.unwrap();
        assert_eq!(other.token, "token-1");
    }

    #[tokio::test]
    async fn test_endpoint_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let cred = credential(
            &CredentialConfig::ManagedIdentity {
                endpoint: server.uri(),
                header: "h".to_string(),
                client_id: None,
            },
            reqwest::Client::new(),
        );
        let err = cred.get_token(DIGITAL_TWINS_RESOURCE).await.unwrap_err();
        assert!(matches!(err, AuthError::Endpoint { .. }), "got {:?}", err);
    }
}
