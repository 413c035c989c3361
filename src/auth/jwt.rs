//! Local verification of HS256 access tokens.
//!
//! Tokens are the ones the web application already issues to signed-in users:
//! `sub` is the user id, `email` is required, and the display name is read
//! from `name` or from `user_metadata.name`.

use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, Identity, IdentityProvider};

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user id)
    pub sub: String,
    /// User email
    #[serde(default)]
    pub email: Option<String>,
    /// Expiration timestamp
    pub exp: u64,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form profile data set by the identity service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<UserMetadata>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default)]
    pub name: Option<String>,
}

/// Verifies tokens signed with a shared secret
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityProvider {
    pub fn new(secret: &str, audience: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Decode and validate a token into an identity
    pub fn decode_identity(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Rejected("token expired".to_string()),
                ErrorKind::InvalidSignature => AuthError::Rejected("bad signature".to_string()),
                _ => AuthError::Rejected(e.to_string()),
            }
        })?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::Rejected("token has no subject".to_string()));
        }
        let email = claims
            .email
            .filter(|e| !e.is_empty())
            .ok_or_else(|| AuthError::Rejected("token has no email".to_string()))?;

        let name = claims
            .name
            .or_else(|| claims.user_metadata.and_then(|m| m.name));

        Ok(Identity {
            user_id: claims.sub,
            email,
            name,
        })
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        self.decode_identity(credential)
    }
}

/// Sign a token the way the web application does
#[cfg(test)]
pub fn issue_token(secret: &str, claims: &TokenClaims) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[cfg(test)]
pub fn claims_for(user_id: &str, email: &str, ttl_seconds: i64) -> TokenClaims {
    let exp = chrono::Utc::now().timestamp() + ttl_seconds;
    TokenClaims {
        sub: user_id.to_string(),
        email: Some(email.to_string()),
        exp: exp.max(0) as u64,
        name: None,
        user_metadata: None,
    }
}
