use crate::email_sender::{AuthMode, MailAppKind, SmtpSettings};
use crate::oauth::{OAuthToken, Provider};
use chrono::{Duration, Utc};
use config::{Config, ConfigError, Environment, File};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

// Structure for SMTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub sender: String,
    // Use `secrecy::Secret` for the password to prevent accidental logging
    #[serde(default = "empty_secret")] // Make password optional in file if set by env
    pub password: SecretString,
}

impl SmtpConfig {
    pub fn settings(&self) -> SmtpSettings {
        SmtpSettings {
            host: self.host.clone(),
            port: self.port,
            sender: self.sender.clone(),
            password: self.password.clone(),
        }
    }
}

/// Registered application credentials for one OAuth provider.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderApp {
    pub client_id: String,
    #[serde(default = "empty_secret")]
    pub client_secret: SecretString,
    /// Microsoft only.
    #[serde(default = "default_tenant")]
    pub tenant: String,
}

impl ProviderApp {
    pub fn is_configured(&self) -> bool {
        !self.client_id.trim().is_empty() && !self.client_secret.expose_secret().trim().is_empty()
    }
}

/// A token obtained out of band, loaded into the in-memory store at start-up.
#[derive(Debug, Deserialize, Clone)]
pub struct StaticToken {
    pub provider: Provider,
    pub email: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
}

impl StaticToken {
    pub fn to_token(&self, client_id: &str) -> OAuthToken {
        OAuthToken {
            provider: self.provider,
            client_id: client_id.to_string(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_at: Utc::now() + Duration::seconds(self.expires_in),
            email: self.email.trim().to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OAuthConfig {
    pub microsoft: Option<ProviderApp>,
    pub google: Option<ProviderApp>,
    /// Client id the binary acts as when talking to the token store.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub token: Option<StaticToken>,
}

// A config without an [oauth] table still acts as the default client id.
impl Default for OAuthConfig {
    fn default() -> Self {
        OAuthConfig {
            microsoft: None,
            google: None,
            client_id: default_client_id(),
            token: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MailAppConfig {
    #[serde(default)]
    pub provider: MailAppKind,
}

/// The batch the binary runs.
#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    pub recipients_path: PathBuf,
    pub template_path: PathBuf,
    pub email_column: String,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub auth_mode: AuthMode,
    pub oauth_provider: Option<Provider>,
}

// Top-level application configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub mail_app: MailAppConfig,
    pub batch: Option<BatchConfig>,
}

impl AppConfig {
    /// Loads configuration from files and environment variables.
    ///
    /// Reads configuration from:
    /// 1. `config.toml` (optional)
    /// 2. Environment variables prefixed with `POSTPANDA__`
    ///    (e.g., `POSTPANDA__SMTP__PASSWORD`)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    pub fn load_from(name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(name).required(false))
            // `__` separates struct levels: POSTPANDA__OAUTH__GOOGLE__CLIENT_ID
            .add_source(
                Environment::with_prefix("POSTPANDA")
                    .prefix_separator("__")
                    .separator("__"),
            );

        builder.build()?.try_deserialize()
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn default_tenant() -> String {
    "common".to_string()
}

fn default_client_id() -> String {
    "postpanda-cli".to_string()
}

fn default_expires_in() -> i64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::ProviderCatalog;
    use std::io::Write;

    fn load(toml: &str) -> AppConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postpanda.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(toml.as_bytes())
            .unwrap();
        AppConfig::load_from(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn reads_smtp_and_batch_sections() {
        let config = load(
            r#"
            [smtp]
            host = "smtp.example.com"
            port = 587
            sender = "me@example.com"
            password = "hunter2"

            [batch]
            recipients_path = "people.json"
            template_path = "invite.txt"
            email_column = "Email"
            auth_mode = "mailapp"
            variables = { First = "FirstName" }
            "#,
        );

        let smtp = config.smtp.unwrap().settings();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.password.expose_secret(), "hunter2");
        let batch = config.batch.unwrap();
        assert_eq!(batch.auth_mode, AuthMode::MailApp);
        assert_eq!(batch.variables["First"], "FirstName");
        assert_eq!(config.oauth.client_id, "postpanda-cli");
    }

    #[test]
    fn provider_needs_id_and_secret_to_be_configured() {
        let config = load(
            r#"
            [oauth.microsoft]
            client_id = "abc"
            client_secret = "shh"

            [oauth.google]
            client_id = "xyz"
            "#,
        );
        let catalog = ProviderCatalog::from_config(&config.oauth);
        assert!(catalog.is_configured(Provider::Microsoft));
        assert!(!catalog.is_configured(Provider::Google));
        assert_eq!(config.oauth.microsoft.unwrap().tenant, "common");
    }

    #[test]
    fn missing_oauth_table_uses_default_client_id() {
        let config = load("[mail_app]\nprovider = \"gmail\"\n");
        assert_eq!(config.oauth.client_id, "postpanda-cli");
        assert!(config.oauth.token.is_none());
        assert_eq!(OAuthConfig::default().client_id, "postpanda-cli");
    }

    #[test]
    fn unknown_mail_app_falls_back_to_custom() {
        let config = load("[mail_app]\nprovider = \"thunderbird\"\n");
        assert_eq!(config.mail_app.provider, MailAppKind::Custom);
    }

    #[test]
    fn static_token_becomes_a_live_token() {
        let config = load(
            r#"
            [oauth.token]
            provider = "google"
            email = " me@gmail.com "
            access_token = "ya29"
            "#,
        );
        let token = config.oauth.token.unwrap().to_token("cli");
        assert_eq!(token.provider, Provider::Google);
        assert_eq!(token.email, "me@gmail.com");
        assert!(token.refresh_token.is_none());
        assert!(!token.is_expired(Utc::now()));
    }
}
