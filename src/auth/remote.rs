//! Identity verification delegated to an external HTTP endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::jwt::UserMetadata;
use super::{AuthError, Identity, IdentityProvider};

/// Upper bound on a single verification round trip
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// User record returned by the identity endpoint
#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    user_metadata: Option<UserMetadata>,
}

/// Asks the identity service who a bearer credential belongs to
pub struct RemoteIdentityProvider {
    client: reqwest::Client,
    verify_url: String,
    api_key: Option<String>,
}

impl RemoteIdentityProvider {
    pub fn new(verify_url: impl Into<String>, api_key: Option<String>) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            verify_url: verify_url.into(),
            api_key,
        })
    }
}

#[async_trait]
impl IdentityProvider for RemoteIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        let mut request = self.client.get(&self.verify_url).bearer_auth(credential);
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AuthError::Rejected("identity provider refused credential".to_string()));
            }
            status if !status.is_success() => {
                debug!("Identity provider answered {}", status);
                return Err(AuthError::ProviderUnavailable(format!("status {}", status)));
            }
            _ => {}
        }

        let user: RemoteUser = response
            .json()
            .await
            .map_err(|e| AuthError::ProviderUnavailable(e.to_string()))?;

        let email = user
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AuthError::Rejected("identity has no email".to_string()))?;

        Ok(Identity {
            user_id: user.id,
            email,
            name: user.name.or_else(|| user.user_metadata.and_then(|m| m.name)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode as HttpStatus},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };

    async fn user_endpoint(headers: HeaderMap) -> axum::response::Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let has_key = headers.get("apikey").is_some();

        match auth {
            "Bearer good" if has_key => Json(serde_json::json!({
                "id": "user-1",
                "email": "alice@example.com",
                "user_metadata": { "name": "Alice" }
            }))
            .into_response(),
            "Bearer broken" => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
            _ => HttpStatus::UNAUTHORIZED.into_response(),
        }
    }

    async fn start_stub() -> String {
        let app = Router::new().route("/auth/v1/user", get(user_endpoint));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/auth/v1/user", addr)
    }

    #[tokio::test]
    async fn test_remote_accepts_valid_credential() {
        let url = start_stub().await;
        let provider = RemoteIdentityProvider::new(url, Some("anon".to_string())).unwrap();

        let identity = provider.verify("good").await.unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_remote_rejects_unknown_credential() {
        let url = start_stub().await;
        let provider = RemoteIdentityProvider::new(url, Some("anon".to_string())).unwrap();

        assert!(matches!(provider.verify("bad").await, Err(AuthError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_remote_server_error_is_unavailable() {
        let url = start_stub().await;
        let provider = RemoteIdentityProvider::new(url, None).unwrap();

        assert!(matches!(
            provider.verify("broken").await,
            Err(AuthError::ProviderUnavailable(_))
        ));
    }
}
