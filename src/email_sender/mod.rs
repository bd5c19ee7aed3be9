pub mod mail_api;
pub mod mail_app;
pub mod message;
pub mod smtp;

pub use mail_api::ProviderMailApi;
pub use mail_app::SystemMailApp;
pub use smtp::{LettreSmtpClient, SmtpSettings};

use crate::http::HttpError;
use crate::oauth::{OAuthToken, Provider};
use crate::template::RenderedMessage;
use async_trait::async_trait;
use chrono::Utc;
use lettre::{address::AddressError, error::Error as LettreError};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// --- Error Handling ---
#[derive(Error, Debug)]
pub enum EmailError {
    #[error("Failed to parse email address: {0}")]
    Address(#[from] AddressError),

    #[error("Failed to build email message: {0}")]
    MessageBuild(#[from] LettreError),

    #[error("Failed to create SMTP transport: {0}")]
    TransportCreation(lettre::transport::smtp::Error),

    #[error("Failed to send email: {0}")]
    Send(lettre::transport::smtp::Error),

    #[error("Configuration error for TLS: {0}")]
    TlsConfig(String),

    #[error("{provider} send failed: {detail}")]
    Api { provider: Provider, detail: String },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("Could not open mail app: {0}")]
    MailApp(String),
}

/// How a batch is delivered. Chosen once per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    #[serde(alias = "password")]
    Smtp,
    OAuth,
    MailApp,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthMode::Smtp => "smtp",
            AuthMode::OAuth => "oauth",
            AuthMode::MailApp => "mailapp",
        })
    }
}

/// Local mail program a draft is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailAppKind {
    Outlook,
    Gmail,
    #[default]
    Custom,
}

impl MailAppKind {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "outlook" => MailAppKind::Outlook,
            "gmail" => MailAppKind::Gmail,
            _ => MailAppKind::Custom,
        }
    }
}

impl<'de> Deserialize<'de> for MailAppKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(MailAppKind::parse(&name))
    }
}

/// Per-mode settings supplied by the caller for one send call.
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    pub smtp: Option<SmtpSettings>,
    pub oauth: Option<OAuthSelection>,
    pub mail_app: MailAppKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSelection {
    pub client_id: String,
    pub provider: Provider,
}

/// Outcome of handing one message to a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeliveryResult {
    Delivered,
    Failed { reason: String },
    /// The message was handed to a local mail program for the user to send.
    RequiresManualStep { drafted: bool },
}

impl DeliveryResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        DeliveryResult::Failed {
            reason: reason.into(),
        }
    }
}

impl From<Result<(), EmailError>> for DeliveryResult {
    fn from(result: Result<(), EmailError>) -> Self {
        match result {
            Ok(()) => DeliveryResult::Delivered,
            Err(e) => DeliveryResult::failed(e.to_string()),
        }
    }
}

/// Socket-level SMTP send.
#[async_trait]
pub trait SmtpClient: Send + Sync {
    async fn send(&self, settings: &SmtpSettings, to: &str, message: &RenderedMessage) -> Result<(), EmailError>;
}

/// Provider HTTP send using an OAuth access token.
#[async_trait]
pub trait MailApi: Send + Sync {
    async fn send(&self, token: &OAuthToken, to: &str, message: &RenderedMessage) -> Result<(), EmailError>;
}

/// Hands a message to the local mail program.
pub trait MailAppLauncher: Send + Sync {
    fn open_draft(&self, app: MailAppKind, to: &str, message: &RenderedMessage) -> Result<(), EmailError>;
}

/// One of the three delivery strategies, fixed for a whole batch.
#[derive(Clone)]
pub enum Transport {
    Smtp {
        client: Arc<dyn SmtpClient>,
        settings: SmtpSettings,
    },
    OAuth {
        api: Arc<dyn MailApi>,
        token: OAuthToken,
    },
    MailApp {
        launcher: Arc<dyn MailAppLauncher>,
        app: MailAppKind,
    },
}

impl Transport {
    pub fn mode(&self) -> AuthMode {
        match self {
            Transport::Smtp { .. } => AuthMode::Smtp,
            Transport::OAuth { .. } => AuthMode::OAuth,
            Transport::MailApp { .. } => AuthMode::MailApp,
        }
    }

    /// Our own address, where test messages go. Mail-app mode has none.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Transport::Smtp { settings, .. } => Some(settings.sender.trim()),
            Transport::OAuth { token, .. } => Some(token.email.trim()),
            Transport::MailApp { .. } => None,
        }
    }

    /// Delivers one rendered message to one address.
    pub async fn deliver(&self, message: &RenderedMessage, to: &str) -> DeliveryResult {
        debug!("Delivering message #{} to {} via {}", message.recipient_index, to, self.mode());
        match self {
            Transport::Smtp { client, settings } => client.send(settings, to, message).await.into(),
            Transport::OAuth { api, token } => {
                if token.is_expired(Utc::now()) {
                    return DeliveryResult::failed(format!(
                        "{} token expired, reconnect required",
                        token.provider
                    ));
                }
                api.send(token, to, message).await.into()
            }
            Transport::MailApp { launcher, app } => match launcher.open_draft(*app, to, message) {
                Ok(()) => DeliveryResult::RequiresManualStep { drafted: true },
                Err(e) => DeliveryResult::failed(e.to_string()),
            },
        }
    }
}
