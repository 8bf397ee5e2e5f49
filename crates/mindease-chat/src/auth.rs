//! Bearer credentials and the external refresh collaborator.
//!
//! Issuing credentials is outside this crate. The connection manager only
//! needs the current bearer token and a way to exchange a refresh token for
//! a new one when the server reports expiry.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use mindease_core::error::{MindeaseError, Result};

/// Bearer credential for one signed-in user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of bearer credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// The credential to use right now, if the session is signed in.
    async fn current(&self) -> Option<Credentials>;

    /// Obtain a fresh credential after the server reported expiry.
    async fn refresh(&self) -> Result<Credentials>;
}

/// Fixed credentials that cannot be refreshed.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            credentials: Credentials {
                user_id: user_id.into(),
                token: token.into(),
            },
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn current(&self) -> Option<Credentials> {
        Some(self.credentials.clone())
    }

    async fn refresh(&self) -> Result<Credentials> {
        Err(MindeaseError::Unauthenticated)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    token: Option<String>,
    refresh_token: Option<String>,
}

struct TokenPair {
    access: String,
    refresh: Option<String>,
}

/// Credential provider backed by `POST /api/auth/refresh`.
///
/// The refresh token is rotated whenever the server returns a new one.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
    tokens: Arc<Mutex<TokenPair>>,
}

impl HttpCredentialProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        user_id: impl Into<String>,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            tokens: Arc::new(Mutex::new(TokenPair {
                access: access_token.into(),
                refresh: refresh_token,
            })),
        }
    }

    fn credentials(&self, token: String) -> Credentials {
        Credentials {
            user_id: self.user_id.clone(),
            token,
        }
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn current(&self) -> Option<Credentials> {
        let tokens = self.tokens.lock().ok()?;
        if tokens.access.is_empty() {
            return None;
        }
        Some(self.credentials(tokens.access.clone()))
    }

    async fn refresh(&self) -> Result<Credentials> {
        let refresh_token = {
            let tokens = self
                .tokens
                .lock()
                .map_err(|e| MindeaseError::Storage(format!("Token lock poisoned: {}", e)))?;
            tokens.refresh.clone().ok_or(MindeaseError::Unauthenticated)?
        };

        let url = format!("{}/api/auth/refresh", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| MindeaseError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Credential refresh rejected");
            return Err(MindeaseError::Unauthenticated);
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| MindeaseError::Serialization(e.to_string()))?;
        let access = body.token.filter(|t| !t.is_empty()).ok_or_else(|| {
            MindeaseError::Serialization("refresh response has no token".to_string())
        })?;

        {
            let mut tokens = self
                .tokens
                .lock()
                .map_err(|e| MindeaseError::Storage(format!("Token lock poisoned: {}", e)))?;
            tokens.access = access.clone();
            if let Some(rotated) = body.refresh_token {
                tokens.refresh = Some(rotated);
            }
        }

        info!(user_id = %self.user_id, "Access token refreshed");
        Ok(self.credentials(access))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_static_credentials_cannot_refresh() {
        let creds = StaticCredentials::new("u1", "t1");
        assert_eq!(creds.current().await.unwrap().token, "t1");
        assert!(matches!(
            creds.refresh().await,
            Err(MindeaseError::Unauthenticated)
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let creds = Credentials {
            user_id: "u1".into(),
            token: "secret".into(),
        };
        assert!(!format!("{:?}", creds).contains("secret"));
    }

    #[tokio::test]
    async fn test_http_refresh_rotates_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .and(body_json(json!({"refreshToken": "r1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"token": "t2", "refreshToken": "r2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpCredentialProvider::new(
            reqwest::Client::new(),
            server.uri(),
            "u1",
            "t1",
            Some("r1".to_string()),
        );
        let fresh = provider.refresh().await.unwrap();
        assert_eq!(fresh.token, "t2");
        assert_eq!(provider.current().await.unwrap().token, "t2");
    }

    #[tokio::test]
    async fn test_http_refresh_rejected_is_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/refresh"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider =
            HttpCredentialProvider::new(reqwest::Client::new(), server.uri(), "u1", "t1", Some("r1".into()));
        assert!(matches!(
            provider.refresh().await,
            Err(MindeaseError::Unauthenticated)
        ));
        // The old token is left in place.
        assert_eq!(provider.current().await.unwrap().token, "t1");
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let provider =
            HttpCredentialProvider::new(reqwest::Client::new(), "http://127.0.0.1:9", "u1", "t1", None);
        assert!(matches!(
            provider.refresh().await,
            Err(MindeaseError::Unauthenticated)
        ));
    }
}
