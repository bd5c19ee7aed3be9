pub mod refresh;
pub mod store;

pub use refresh::HttpTokenRefresher;
pub use store::{CredentialStore, PendingOAuthState, ProviderStatus};

use crate::config::OAuthConfig;
use crate::http::HttpError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tokens this close to expiry are refreshed before a batch starts.
pub const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("OAuth provider must be 'microsoft' or 'google'.")]
    UnknownProvider(String),

    #[error("OAuth for {0} is not configured. Please set CLIENT_ID and CLIENT_SECRET.")]
    NotConfigured(Provider),

    #[error("OAuth token has expired. Please log in again.")]
    MissingRefreshToken,

    #[error("OAuth error: {0}")]
    Provider(String),

    #[error("OAuth provider did not answer with JSON (HTTP {0}).")]
    InvalidResponse(u16),

    #[error("OAuth access_token missing in provider response.")]
    MissingAccessToken,

    #[error(transparent)]
    Http(#[from] HttpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Microsoft,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Microsoft, Provider::Google];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Microsoft => "microsoft",
            Provider::Google => "google",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Provider::Microsoft => "Microsoft",
            Provider::Google => "Google",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Provider {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "microsoft" => Ok(Provider::Microsoft),
            "google" => Ok(Provider::Google),
            other => Err(OAuthError::UnknownProvider(other.to_string())),
        }
    }
}

/// Access/refresh token pair for one `(client id, provider)`. Held in memory
/// only.
#[derive(Debug, Clone)]
pub struct OAuthToken {
    pub provider: Provider,
    pub client_id: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
    pub email: String,
}

impl OAuthToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.is_expired(now + Duration::seconds(EXPIRY_SKEW_SECS))
    }

    /// Applies a refresh result, keeping the old refresh token when the
    /// provider did not issue a new one.
    pub fn refreshed(&self, grant: TokenGrant) -> Self {
        OAuthToken {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: grant.expires_at,
            ..self.clone()
        }
    }
}

/// What a token endpoint hands back.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: DateTime<Utc>,
}

impl TokenGrant {
    /// Provider lifetimes are shortened by a minute, never below one minute.
    pub fn expires_at_from(now: DateTime<Utc>, expires_in: Option<i64>) -> DateTime<Utc> {
        let expires_in = expires_in.unwrap_or(3600);
        now + Duration::seconds((expires_in - 60).max(60))
    }
}

/// Exchanges a refresh token for a new access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: Provider, refresh_token: &SecretString)
        -> Result<TokenGrant, OAuthError>;
}

/// Which providers have registered application credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderCatalog {
    pub microsoft: bool,
    pub google: bool,
}

impl ProviderCatalog {
    pub fn from_config(config: &OAuthConfig) -> Self {
        ProviderCatalog {
            microsoft: config.microsoft.as_ref().is_some_and(|app| app.is_configured()),
            google: config.google.as_ref().is_some_and(|app| app.is_configured()),
        }
    }

    pub fn is_configured(&self, provider: Provider) -> bool {
        match provider {
            Provider::Microsoft => self.microsoft,
            Provider::Google => self.google,
        }
    }
}
