use crate::email_sender::{AuthMode, DeliveryResult, Transport};
use crate::oauth::{OAuthError, Provider};
use crate::session::{RecipientSession, SessionError};
use crate::template::{is_valid_email, ColumnMapping, EmailTemplate, MappingError};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Configuration problems. These fail a whole send call before any
/// recipient is touched.
#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error("Please enter a subject.")]
    MissingSubject,

    #[error("Please enter a message body.")]
    MissingBody,

    #[error("Please select an email column.")]
    MissingEmailColumn,

    #[error("SMTP settings are required for password mode.")]
    MissingSmtpSettings,

    #[error("Please enter a valid sender email.")]
    InvalidSender,

    #[error("Please enter an SMTP {0}.")]
    MissingSmtpSetting(&'static str),

    #[error("SMTP port must be between 1 and 65535.")]
    InvalidPort,

    #[error("clientId is required for OAuth.")]
    MissingClientId,

    #[error("Please choose an OAuth provider.")]
    MissingProvider,

    #[error("OAuth for {0} is not configured. Please set CLIENT_ID and CLIENT_SECRET.")]
    OAuthNotConfigured(Provider),

    #[error("No {0} login found. Please connect first.")]
    NotConnected(Provider),

    #[error("{0} login expired, reconnect required: {1}")]
    Reconnect(Provider, OAuthError),

    #[error("Recipient for test draft is invalid: '{0}'")]
    InvalidTestRecipient(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SendOutcome {
    Sent,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientOutcome {
    pub index: usize,
    pub address: String,
    pub outcome: SendOutcome,
}

/// Counts for one send-all call, plus the per-row outcomes in sheet order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSendReport {
    pub total: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub mode: AuthMode,
    pub outcomes: Vec<RecipientOutcome>,
}

impl BulkSendReport {
    fn new(total: usize, mode: AuthMode) -> Self {
        BulkSendReport {
            total,
            sent: 0,
            skipped: 0,
            failed: 0,
            mode,
            outcomes: Vec::with_capacity(total),
        }
    }

    /// In mail-app mode "sent" means a draft was opened.
    pub fn drafted(&self) -> Option<usize> {
        (self.mode == AuthMode::MailApp).then_some(self.sent)
    }

    fn record(&mut self, index: usize, address: String, outcome: SendOutcome) {
        match &outcome {
            SendOutcome::Sent => {
                self.sent += 1;
                debug!("#{} {}: sent", index, address);
            }
            SendOutcome::Skipped { reason } => {
                self.skipped += 1;
                info!("#{} skipped: {}", index, reason);
            }
            SendOutcome::Failed { reason } => {
                self.failed += 1;
                warn!("#{} {} failed: {}", index, address, reason);
            }
        }
        self.outcomes.push(RecipientOutcome {
            index,
            address,
            outcome,
        });
    }
}

impl fmt::Display for BulkSendReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.drafted() {
            Some(drafted) => write!(
                f,
                "drafted {}, skipped {}, failed {} of {}",
                drafted, self.skipped, self.failed, self.total
            ),
            None => write!(
                f,
                "sent {}, skipped {}, failed {} of {}",
                self.sent, self.skipped, self.failed, self.total
            ),
        }
    }
}

/// Checks the parts of a request every send mode needs.
pub fn check_message(template: &EmailTemplate, mapping: &ColumnMapping) -> Result<(), SendError> {
    if template.subject_template.trim().is_empty() {
        return Err(SendError::MissingSubject);
    }
    if template.body_template.trim().is_empty() {
        return Err(SendError::MissingBody);
    }
    if !mapping.has_email_column() {
        return Err(SendError::MissingEmailColumn);
    }
    Ok(())
}

fn skip_reason(address: &str) -> Option<&'static str> {
    if address.is_empty() {
        Some("no email")
    } else if !is_valid_email(address) {
        Some("invalid email")
    } else {
        None
    }
}

/// Renders and delivers every row in sheet order. A failed delivery is
/// recorded and the loop moves on; only configuration errors fail the call.
pub async fn send_all(
    session: &RecipientSession,
    template: &EmailTemplate,
    mapping: &ColumnMapping,
    transport: &Transport,
) -> Result<BulkSendReport, SendError> {
    if session.total() == 0 {
        return Err(SessionError::NoRecipients.into());
    }
    check_message(template, mapping)?;

    let mut report = BulkSendReport::new(session.total(), transport.mode());
    info!(
        "Sending session {} to {} recipients via {}",
        session.id,
        report.total,
        report.mode
    );

    for (index, row) in session.rows.iter().enumerate() {
        let message = template.render(index, row, mapping);
        if let Some(reason) = skip_reason(&message.address) {
            report.record(
                index,
                message.address,
                SendOutcome::Skipped {
                    reason: reason.to_string(),
                },
            );
            continue;
        }

        let outcome = match transport.deliver(&message, &message.address).await {
            DeliveryResult::Delivered | DeliveryResult::RequiresManualStep { drafted: true } => SendOutcome::Sent,
            DeliveryResult::RequiresManualStep { drafted: false } => SendOutcome::Failed {
                reason: "draft was not created".to_string(),
            },
            DeliveryResult::Failed { reason } => SendOutcome::Failed { reason },
        };
        report.record(index, message.address, outcome);
    }

    info!("Finished session {}: {}", session.id, report);
    Ok(report)
}

/// Renders the recipient at `index` and delivers it once. SMTP and OAuth
/// send the rendering to our own address; mail-app mode drafts it for the
/// recipient.
pub async fn send_test(
    session: &RecipientSession,
    index: usize,
    template: &EmailTemplate,
    mapping: &ColumnMapping,
    transport: &Transport,
) -> Result<DeliveryResult, SendError> {
    if session.total() == 0 {
        return Err(SessionError::NoRecipients.into());
    }
    check_message(template, mapping)?;

    let index = index % session.total();
    let message = template.render(index, session.row_at(index)?, mapping);
    let target = match transport.sender() {
        Some(sender) => sender.to_string(),
        None if is_valid_email(&message.address) => message.address.clone(),
        None => return Err(SendError::InvalidTestRecipient(message.address)),
    };

    info!("Sending test message for #{} to {} via {}", index, target, transport.mode());
    Ok(transport.deliver(&message, &target).await)
}
