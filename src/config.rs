//! Server configuration loaded from the environment.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::sync::CollabConfig;

/// Errors raised while reading configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("OFFLINE_AFTER_SECS ({offline}) must be greater than IDLE_AFTER_SECS ({idle})")]
    ThresholdOrder { idle: u64, offline: u64 },

    #[error("No identity provider configured: set AUTH_JWT_SECRET or AUTH_VERIFY_URL")]
    MissingIdentityProvider,
}

/// How connection credentials are verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthConfig {
    /// Locally verified HS256 tokens
    Jwt {
        secret: String,
        audience: Option<String>,
    },
    /// Delegate to a remote identity endpoint
    Remote {
        verify_url: String,
        api_key: Option<String>,
    },
}

/// Top-level server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port
    pub port: u16,
    /// Allowed CORS origin (any when unset)
    pub cors_origin: Option<String>,
    /// Presence and relay tuning
    pub collab: CollabConfig,
    /// Identity provider selection
    pub auth: AuthConfig,
}

impl ServerConfig {
    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(&lookup, "PORT", 5000u16)?;
        let cors_origin = non_empty(&lookup, "CORS_ORIGIN");

        let defaults = CollabConfig::default();
        let idle = parse_or(&lookup, "IDLE_AFTER_SECS", defaults.idle_after.as_secs())?;
        let offline = parse_or(&lookup, "OFFLINE_AFTER_SECS", defaults.offline_after.as_secs())?;
        let sweep = parse_or(&lookup, "SWEEP_INTERVAL_SECS", defaults.sweep_interval.as_secs())?;
        let max_edit_bytes = parse_or(&lookup, "MAX_EDIT_BYTES", defaults.max_edit_bytes)?;

        if idle == 0 {
            return Err(ConfigError::ZeroDuration("IDLE_AFTER_SECS"));
        }
        if sweep == 0 {
            return Err(ConfigError::ZeroDuration("SWEEP_INTERVAL_SECS"));
        }
        if offline <= idle {
            return Err(ConfigError::ThresholdOrder { idle, offline });
        }

        let auth = if let Some(secret) = non_empty(&lookup, "AUTH_JWT_SECRET") {
            AuthConfig::Jwt {
                secret,
                audience: non_empty(&lookup, "AUTH_JWT_AUDIENCE"),
            }
        } else if let Some(verify_url) = non_empty(&lookup, "AUTH_VERIFY_URL") {
            AuthConfig::Remote {
                verify_url,
                api_key: non_empty(&lookup, "AUTH_API_KEY"),
            }
        } else {
            return Err(ConfigError::MissingIdentityProvider);
        };

        Ok(Self {
            port,
            cors_origin,
            collab: CollabConfig {
                idle_after: Duration::from_secs(idle),
                offline_after: Duration::from_secs(offline),
                sweep_interval: Duration::from_secs(sweep),
                max_edit_bytes,
            },
            auth,
        })
    }
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match non_empty(lookup, name) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        None => Ok(default),
    }
}
