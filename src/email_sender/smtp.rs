use super::message::build_message;
use super::{EmailError, SmtpClient};
use crate::bulk::SendError;
use crate::template::{is_valid_email, RenderedMessage};
use async_trait::async_trait;
use lettre::transport::smtp::{
    authentication::Credentials,
    client::{Tls, TlsParameters},
};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{info, warn};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
const IMPLICIT_TLS_PORT: u16 = 465;

/// Password-authenticated SMTP account.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub sender: String,
    pub password: SecretString,
}

impl SmtpSettings {
    /// Every field is required before a batch may start.
    pub fn validate(&self) -> Result<(), SendError> {
        if !is_valid_email(&self.sender) {
            return Err(SendError::InvalidSender);
        }
        if self.password.expose_secret().trim().is_empty() {
            return Err(SendError::MissingSmtpSetting("password"));
        }
        if self.host.trim().is_empty() {
            return Err(SendError::MissingSmtpSetting("host"));
        }
        if self.port == 0 {
            return Err(SendError::InvalidPort);
        }
        Ok(())
    }
}

/// Sends through `lettre`'s async SMTP transport: STARTTLS, or implicit TLS
/// on port 465.
#[derive(Debug, Clone, Copy, Default)]
pub struct LettreSmtpClient;

impl LettreSmtpClient {
    fn transport(settings: &SmtpSettings) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        let host = settings.host.trim();
        let creds = Credentials::new(
            settings.sender.trim().to_string(),
            settings.password.expose_secret().to_string(),
        );

        let tls_parameters = TlsParameters::new(host.to_string())
            .map_err(|e| EmailError::TlsConfig(format!("Invalid SMTP host for TLS: {}", e)))?;
        let tls = if settings.port == IMPLICIT_TLS_PORT {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Required(tls_parameters)
        };

        Ok(AsyncSmtpTransport::<Tokio1Executor>::relay(host)
            .map_err(EmailError::TransportCreation)?
            .port(settings.port)
            .credentials(creds)
            .tls(tls)
            .timeout(Some(SMTP_TIMEOUT))
            .build())
    }
}

#[async_trait]
impl SmtpClient for LettreSmtpClient {
    async fn send(&self, settings: &SmtpSettings, to: &str, message: &RenderedMessage) -> Result<(), EmailError> {
        let email = build_message(&settings.sender, to, message)?;
        let transport = Self::transport(settings)?;

        match transport.send(email).await {
            Ok(_) => {
                info!("Email sent to {} via {}:{}", to, settings.host, settings.port);
                Ok(())
            }
            Err(e) => {
                warn!("Error sending email to {}: {}", to, e);
                Err(EmailError::Send(e))
            }
        }
    }
}
