use super::{OAuthError, Provider, TokenGrant, TokenRefresher};
use crate::config::{OAuthConfig, ProviderApp};
use crate::http::{ApiClient, HttpError};
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secrecy::{ExposeSecret, SecretString};

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const MICROSOFT_SCOPE: &str = "offline_access User.Read Mail.Send";

// application/x-www-form-urlencoded leaves these unescaped
const FORM: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'*');

/// Refreshes tokens against the Microsoft identity platform and Google.
#[derive(Clone)]
pub struct HttpTokenRefresher {
    http: ApiClient,
    microsoft: Option<ProviderApp>,
    google: Option<ProviderApp>,
}

impl HttpTokenRefresher {
    pub fn new(http: ApiClient, config: &OAuthConfig) -> Self {
        Self {
            http,
            microsoft: config.microsoft.clone(),
            google: config.google.clone(),
        }
    }

    fn app(&self, provider: Provider) -> Result<&ProviderApp, OAuthError> {
        let app = match provider {
            Provider::Microsoft => self.microsoft.as_ref(),
            Provider::Google => self.google.as_ref(),
        };
        app.filter(|app| app.is_configured())
            .ok_or(OAuthError::NotConfigured(provider))
    }
}

pub fn token_url(provider: Provider, app: &ProviderApp) -> String {
    match provider {
        Provider::Microsoft => {
            let tenant = match app.tenant.trim() {
                "" => "common",
                tenant => tenant,
            };
            format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token")
        }
        Provider::Google => GOOGLE_TOKEN_URL.to_string(),
    }
}

pub fn refresh_form(provider: Provider, app: &ProviderApp, refresh_token: &str) -> String {
    let mut fields = vec![
        ("client_id", app.client_id.trim()),
        ("client_secret", app.client_secret.expose_secret()),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];
    if provider == Provider::Microsoft {
        fields.push(("scope", MICROSOFT_SCOPE));
    }
    fields
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, FORM)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Reads a token endpoint response into a grant.
pub fn parse_grant(status: u16, body: &[u8]) -> Result<TokenGrant, OAuthError> {
    let data: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| OAuthError::InvalidResponse(status))?;

    if status >= 400 {
        let description = ["error_description", "error"]
            .iter()
            .filter_map(|field| data.get(field).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {status}"));
        return Err(OAuthError::Provider(description));
    }

    let access_token = data
        .get("access_token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(OAuthError::MissingAccessToken)?;
    let refresh_token = data
        .get("refresh_token")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| SecretString::from(t.to_string()));
    let expires_in = data.get("expires_in").and_then(|v| {
        v.as_i64()
            .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
    });

    Ok(TokenGrant {
        access_token: SecretString::from(access_token.to_string()),
        refresh_token,
        expires_at: TokenGrant::expires_at_from(Utc::now(), expires_in),
    })
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, provider: Provider, refresh_token: &SecretString) -> Result<TokenGrant, OAuthError> {
        let refresh_token = refresh_token.expose_secret().trim();
        if refresh_token.is_empty() {
            return Err(OAuthError::MissingRefreshToken);
        }
        let app = self.app(provider)?;

        let response = self
            .http
            .post_form(&token_url(provider, app), refresh_form(provider, app, refresh_token))
            .await
            .map_err(|e: HttpError| {
                warn!("{} token refresh request failed: {}", provider, e);
                OAuthError::Http(e)
            })?;
        let grant = parse_grant(response.status.as_u16(), &response.body)?;
        info!("Refreshed {} access token", provider);
        Ok(grant)
    }
}
