//! Connection authentication.
//!
//! Every WebSocket upgrade and authenticated HTTP request presents an opaque
//! credential which is checked against an [`IdentityProvider`]:
//! - `jwt` verifies HS256 tokens locally
//! - `remote` asks an external identity endpoint
//!
//! A connection that fails here is refused before the socket exists.

mod jwt;
mod remote;

pub use jwt::{JwtIdentityProvider, TokenClaims};
pub use remote::RemoteIdentityProvider;

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::AuthConfig;

/// Errors that can occur while authenticating a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Credential rejected: {0}")]
    Rejected(String),

    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

/// Verified identity bound to a connection for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// External identity verification service
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Front door for connection credentials
#[derive(Clone)]
pub struct Authenticator {
    provider: Arc<dyn IdentityProvider>,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    /// Build the provider selected by configuration
    pub fn from_config(config: &AuthConfig) -> Result<Self, AuthError> {
        let provider: Arc<dyn IdentityProvider> = match config {
            AuthConfig::Jwt { secret, audience } => {
                Arc::new(JwtIdentityProvider::new(secret, audience.clone()))
            }
            AuthConfig::Remote { verify_url, api_key } => {
                Arc::new(RemoteIdentityProvider::new(verify_url, api_key.clone())?)
            }
        };
        Ok(Self::new(provider))
    }

    /// Authenticate a credential taken from the connection handshake
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        self.provider.verify(credential).await
    }
}

/// Pull the credential out of a request: bearer header first, then `?token=`
pub fn extract_credential(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        })
        .filter(|t| !t.is_empty());

    from_header.or_else(|| {
        query_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Accepts credentials of the form `user-id:email`
    pub struct StaticProvider;

    #[async_trait]
    impl IdentityProvider for StaticProvider {
        async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
            let (user_id, email) = credential
                .split_once(':')
                .ok_or_else(|| AuthError::Rejected("malformed".to_string()))?;
            Ok(Identity::new(user_id, email))
        }
    }

    pub fn authenticator() -> Authenticator {
        Authenticator::new(Arc::new(StaticProvider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn test_missing_credential_rejected() {
        let auth = test_support::authenticator();

        assert_eq!(auth.authenticate(None).await, Err(AuthError::MissingCredential));
        assert_eq!(auth.authenticate(Some("  ")).await, Err(AuthError::MissingCredential));
    }

    #[tokio::test]
    async fn test_provider_result_passed_through() {
        let auth = test_support::authenticator();

        let identity = auth.authenticate(Some("u-1:alice@example.com")).await.unwrap();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.email, "alice@example.com");

        let rejected = auth.authenticate(Some("garbage")).await;
        assert!(matches!(rejected, Err(AuthError::Rejected(_))));
    }

    #[test]
    fn test_extract_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));

        assert_eq!(extract_credential(&headers, Some("other")), Some("abc.def".to_string()));
    }

    #[test]
    fn test_extract_query_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));

        assert_eq!(extract_credential(&headers, Some("tok")), Some("tok".to_string()));
        assert_eq!(extract_credential(&HeaderMap::new(), None), None);
    }
}
