//! The operations offered to the API layer.

use crate::bulk::{self, BulkSendReport, SendError};
use crate::config::OAuthConfig;
use crate::email_sender::{
    AuthMode, DeliveryResult, LettreSmtpClient, MailApi, MailAppLauncher, ProviderMailApi,
    SmtpClient, SystemMailApp, Transport, TransportContext,
};
use crate::http::{ApiClient, HttpError};
use crate::oauth::{
    CredentialStore, HttpTokenRefresher, OAuthToken, PendingOAuthState, Provider, ProviderCatalog,
    ProviderStatus, TokenRefresher,
};
use crate::preview;
use crate::session::{ParsedSpreadsheet, SessionError, SessionRegistry, SessionSummary};
use crate::template::{is_valid_email, ColumnMapping, EmailTemplate, RenderedMessage};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The external pieces that actually move mail.
#[derive(Clone)]
pub struct Collaborators {
    pub smtp: Arc<dyn SmtpClient>,
    pub mail_api: Arc<dyn MailApi>,
    pub mail_app: Arc<dyn MailAppLauncher>,
    pub refresher: Option<Arc<dyn TokenRefresher>>,
}

impl Collaborators {
    /// Real SMTP, provider HTTP APIs and the desktop mail program.
    pub fn system(oauth: &OAuthConfig) -> Result<Self, HttpError> {
        let http = ApiClient::new()?;
        Ok(Collaborators {
            smtp: Arc::new(LettreSmtpClient),
            mail_api: Arc::new(ProviderMailApi::new(http.clone())),
            mail_app: Arc::new(SystemMailApp),
            refresher: Some(Arc::new(HttpTokenRefresher::new(http, oauth)) as Arc<dyn TokenRefresher>),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub index: usize,
    pub total_rows: usize,
    pub recipient_valid: bool,
    pub message: RenderedMessage,
}

/// Engine entry point. Sessions and tokens live in the registries handed
/// in; both last until the process exits.
pub struct Mailer {
    sessions: Arc<SessionRegistry>,
    credentials: Arc<CredentialStore>,
    catalog: ProviderCatalog,
    collaborators: Collaborators,
}

impl Mailer {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        credentials: Arc<CredentialStore>,
        catalog: ProviderCatalog,
        collaborators: Collaborators,
    ) -> Self {
        Mailer {
            sessions,
            credentials,
            catalog,
            collaborators,
        }
    }

    pub fn create_session(&self, sheet: ParsedSpreadsheet) -> Result<SessionSummary, SessionError> {
        let (columns, rows) = sheet.into_parts();
        self.sessions.create(columns, rows)
    }

    /// Forgets an uploaded session. Later calls with its id fail with
    /// `NotFound`.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id)
    }

    /// Renders the recipient at `index`, wrapped into range.
    pub fn preview(
        &self,
        session_id: &str,
        index: i64,
        template: &EmailTemplate,
        mapping: &ColumnMapping,
    ) -> Result<Preview, SessionError> {
        let session = self.sessions.get(session_id)?;
        let index = preview::normalize_index(index, session.total())?;
        let message = preview::current(&session, index, template, mapping)?;
        Ok(Preview {
            index,
            total_rows: session.total(),
            recipient_valid: is_valid_email(&message.address),
            message,
        })
    }

    pub fn oauth_status(&self, client_id: &str) -> BTreeMap<Provider, ProviderStatus> {
        self.credentials.status(client_id, &self.catalog)
    }

    /// Called by the OAuth exchange once a login completed.
    pub fn oauth_connect(&self, client_id: &str, provider: Provider, token: OAuthToken) {
        self.credentials.store(client_id, provider, token);
    }

    pub fn oauth_disconnect(&self, client_id: &str, provider: Provider) {
        self.credentials.clear(client_id, provider);
    }

    /// Starts a provider login and returns the `state` to round-trip.
    pub fn oauth_begin(
        &self,
        client_id: &str,
        provider: Provider,
        frontend_origin: &str,
    ) -> Result<String, SendError> {
        if client_id.trim().is_empty() {
            return Err(SendError::MissingClientId);
        }
        if !self.catalog.is_configured(provider) {
            return Err(SendError::OAuthNotConfigured(provider));
        }
        Ok(self.credentials.create_pending_state(provider, client_id, frontend_origin))
    }

    /// Finishes a login started by [`Mailer::oauth_begin`]. Unknown or
    /// already used states store nothing.
    pub fn oauth_complete(&self, state: &str, token: OAuthToken) -> Option<PendingOAuthState> {
        let pending = self.credentials.consume_pending_state(state)?;
        self.credentials.store(&pending.client_id, pending.provider, token);
        Some(pending)
    }

    pub async fn send_test(
        &self,
        session_id: &str,
        index: i64,
        template: &EmailTemplate,
        mapping: &ColumnMapping,
        mode: AuthMode,
        context: &TransportContext,
    ) -> Result<DeliveryResult, SendError> {
        let session = self.sessions.get(session_id)?;
        let index = preview::normalize_index(index, session.total())?;
        bulk::check_message(template, mapping)?;
        let transport = self.transport(mode, context).await?;
        bulk::send_test(&session, index, template, mapping, &transport).await
    }

    pub async fn send_all(
        &self,
        session_id: &str,
        template: &EmailTemplate,
        mapping: &ColumnMapping,
        mode: AuthMode,
        context: &TransportContext,
    ) -> Result<BulkSendReport, SendError> {
        let session = self.sessions.get(session_id)?;
        if session.total() == 0 {
            return Err(SessionError::NoRecipients.into());
        }
        bulk::check_message(template, mapping)?;
        let transport = self.transport(mode, context).await?;
        bulk::send_all(&session, template, mapping, &transport).await
    }

    /// Picks and validates the strategy for one call.
    pub async fn transport(&self, mode: AuthMode, context: &TransportContext) -> Result<Transport, SendError> {
        match mode {
            AuthMode::Smtp => {
                let settings = context.smtp.clone().ok_or(SendError::MissingSmtpSettings)?;
                settings.validate()?;
                Ok(Transport::Smtp {
                    client: Arc::clone(&self.collaborators.smtp),
                    settings,
                })
            }
            AuthMode::OAuth => {
                let selection = context.oauth.as_ref().ok_or(SendError::MissingProvider)?;
                let client_id = selection.client_id.trim();
                if client_id.is_empty() {
                    return Err(SendError::MissingClientId);
                }
                let token = self.connected_token(client_id, selection.provider).await?;
                Ok(Transport::OAuth {
                    api: Arc::clone(&self.collaborators.mail_api),
                    token,
                })
            }
            AuthMode::MailApp => Ok(Transport::MailApp {
                launcher: Arc::clone(&self.collaborators.mail_app),
                app: context.mail_app,
            }),
        }
    }

    /// Token snapshot for a batch, refreshed first when it is about to
    /// expire.
    async fn connected_token(&self, client_id: &str, provider: Provider) -> Result<OAuthToken, SendError> {
        if !self.catalog.is_configured(provider) {
            return Err(SendError::OAuthNotConfigured(provider));
        }
        let token = self
            .credentials
            .get(client_id, provider)
            .ok_or(SendError::NotConnected(provider))?;

        let now = Utc::now();
        if !token.needs_refresh(now) {
            return Ok(token);
        }

        match (&token.refresh_token, &self.collaborators.refresher) {
            (Some(refresh_token), Some(refresher)) => {
                let grant = refresher
                    .refresh(provider, refresh_token)
                    .await
                    .map_err(|e| {
                        warn!("Could not refresh {} token for {}: {}", provider, client_id, e);
                        SendError::Reconnect(provider, e)
                    })?;
                let refreshed = token.refreshed(grant);
                self.credentials.store(client_id, provider, refreshed.clone());
                info!("Using refreshed {} token for {}", provider, client_id);
                Ok(refreshed)
            }
            _ if token.is_expired(now) => Err(SendError::NotConnected(provider)),
            _ => Ok(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::tests::{smtp_settings, RecordingSender};
    use crate::email_sender::OAuthSelection;
    use crate::oauth::{OAuthError, TokenGrant};
    use async_trait::async_trait;
    use chrono::Duration;
    use secrecy::{ExposeSecret, SecretString};
    use std::sync::Mutex;

    struct FakeRefresher {
        calls: Mutex<usize>,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _: Provider, _: &SecretString) -> Result<TokenGrant, OAuthError> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(OAuthError::Provider("invalid_grant".to_string()));
            }
            Ok(TokenGrant {
                access_token: SecretString::from("fresh".to_string()),
                refresh_token: None,
                expires_at: Utc::now() + Duration::hours(1),
            })
        }
    }

    struct Harness {
        mailer: Mailer,
        sender: Arc<RecordingSender>,
        refresher: Arc<FakeRefresher>,
    }

    fn harness(fail_refresh: bool) -> Harness {
        let sender = Arc::new(RecordingSender::failing_for(&["c@x.io"]));
        let refresher = Arc::new(FakeRefresher {
            calls: Mutex::new(0),
            fail: fail_refresh,
        });
        let collaborators = Collaborators {
            smtp: sender.clone(),
            mail_api: sender.clone(),
            mail_app: sender.clone(),
            refresher: Some(refresher.clone() as Arc<dyn TokenRefresher>),
        };
        let mailer = Mailer::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(CredentialStore::new()),
            ProviderCatalog {
                microsoft: true,
                google: false,
            },
            collaborators,
        );
        Harness {
            mailer,
            sender,
            refresher,
        }
    }

    fn upload(mailer: &Mailer) -> String {
        let sheet = ParsedSpreadsheet {
            columns: vec!["Email".to_string(), "FirstName".to_string(), "Company".to_string()],
            rows: ["a@x.io", "b@x.io", "c@x.io", "", "e@x.io"]
                .iter()
                .map(|email| vec![email.to_string(), "Ana".to_string(), "Acme".to_string()])
                .collect(),
        };
        mailer.create_session(sheet).unwrap().session_id
    }

    fn template() -> EmailTemplate {
        EmailTemplate::from_content("For {{First}}", "Hi {{First}}, from {{Co}}")
    }

    fn mapping() -> ColumnMapping {
        ColumnMapping::new("Email", [("First", "FirstName"), ("Co", "Company")]).unwrap()
    }

    fn smtp_context() -> TransportContext {
        TransportContext {
            smtp: Some(smtp_settings()),
            ..TransportContext::default()
        }
    }

    fn oauth_context() -> TransportContext {
        TransportContext {
            oauth: Some(OAuthSelection {
                client_id: "c1".to_string(),
                provider: Provider::Microsoft,
            }),
            ..TransportContext::default()
        }
    }

    fn token(expires_in: i64, refresh: bool) -> OAuthToken {
        OAuthToken {
            provider: Provider::Microsoft,
            client_id: "c1".to_string(),
            access_token: SecretString::from("stale".to_string()),
            refresh_token: refresh.then(|| SecretString::from("r".to_string())),
            expires_at: Utc::now() + Duration::seconds(expires_in),
            email: "me@corp.com".to_string(),
        }
    }

    #[test]
    fn preview_wraps_and_renders() {
        let h = harness(false);
        let id = upload(&h.mailer);
        let preview = h.mailer.preview(&id, -1, &template(), &mapping()).unwrap();
        assert_eq!(preview.index, 4);
        assert_eq!(preview.total_rows, 5);
        assert!(preview.recipient_valid);
        assert_eq!(preview.message.body_text, "Hi Ana, from Acme");
        assert_eq!(preview.message.subject_text, "For Ana");

        let empty_address = h.mailer.preview(&id, 3, &template(), &mapping()).unwrap();
        assert!(!empty_address.recipient_valid);
    }

    #[test]
    fn unknown_session_needs_new_upload() {
        let h = harness(false);
        assert!(matches!(
            h.mailer.preview("nope", 0, &template(), &mapping()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn closed_session_needs_new_upload() {
        let h = harness(false);
        let id = upload(&h.mailer);
        assert!(h.mailer.close_session(&id));
        assert!(matches!(
            h.mailer.preview(&id, 0, &template(), &mapping()),
            Err(SessionError::NotFound(_))
        ));
        assert!(!h.mailer.close_session(&id));
    }

    #[tokio::test]
    async fn send_all_reports_counts() {
        let h = harness(false);
        let id = upload(&h.mailer);
        let report = h
            .mailer
            .send_all(&id, &template(), &mapping(), AuthMode::Smtp, &smtp_context())
            .await
            .unwrap();
        assert_eq!(
            (report.total, report.sent, report.skipped, report.failed),
            (5, 3, 1, 1)
        );
        assert_eq!(report.mode, AuthMode::Smtp);
        assert_eq!(h.sender.attempts().len(), 4);
    }

    #[tokio::test]
    async fn configuration_errors_fail_before_sending() {
        let h = harness(false);
        let id = upload(&h.mailer);
        let no_smtp = TransportContext::default();
        assert!(matches!(
            h.mailer
                .send_all(&id, &template(), &mapping(), AuthMode::Smtp, &no_smtp)
                .await,
            Err(SendError::MissingSmtpSettings)
        ));
        assert!(matches!(
            h.mailer
                .send_all("gone", &template(), &mapping(), AuthMode::Smtp, &smtp_context())
                .await,
            Err(SendError::Session(SessionError::NotFound(_)))
        ));
        assert!(matches!(
            h.mailer
                .send_all(&id, &template(), &mapping(), AuthMode::OAuth, &oauth_context())
                .await,
            Err(SendError::NotConnected(Provider::Microsoft))
        ));

        let google = TransportContext {
            oauth: Some(OAuthSelection {
                client_id: "c1".to_string(),
                provider: Provider::Google,
            }),
            ..TransportContext::default()
        };
        assert!(matches!(
            h.mailer
                .send_all(&id, &template(), &mapping(), AuthMode::OAuth, &google)
                .await,
            Err(SendError::OAuthNotConfigured(Provider::Google))
        ));
        assert!(h.sender.attempts().is_empty());
    }

    #[tokio::test]
    async fn oauth_batch_uses_connected_token() {
        let h = harness(false);
        let id = upload(&h.mailer);
        h.mailer.oauth_connect("c1", Provider::Microsoft, token(3600, true));

        let report = h
            .mailer
            .send_all(&id, &template(), &mapping(), AuthMode::OAuth, &oauth_context())
            .await
            .unwrap();
        assert_eq!((report.sent, report.failed), (3, 1));
        assert_eq!(*h.refresher.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_stored() {
        let h = harness(false);
        h.mailer.oauth_connect("c1", Provider::Microsoft, token(10, true));

        let transport = h.mailer.transport(AuthMode::OAuth, &oauth_context()).await.unwrap();
        assert!(matches!(transport, Transport::OAuth { .. }));
        assert_eq!(*h.refresher.calls.lock().unwrap(), 1);

        let stored = h.mailer.credentials.get("c1", Provider::Microsoft).unwrap();
        assert_eq!(stored.access_token.expose_secret(), "fresh");
        assert!(stored.refresh_token.is_some());
    }

    #[tokio::test]
    async fn expired_token_without_refresh_needs_reconnect() {
        let h = harness(false);
        h.mailer.oauth_connect("c1", Provider::Microsoft, token(-10, false));
        assert!(matches!(
            h.mailer.transport(AuthMode::OAuth, &oauth_context()).await,
            Err(SendError::NotConnected(Provider::Microsoft))
        ));

        let failing = harness(true);
        failing.mailer.oauth_connect("c1", Provider::Microsoft, token(-10, true));
        assert!(matches!(
            failing.mailer.transport(AuthMode::OAuth, &oauth_context()).await,
            Err(SendError::Reconnect(Provider::Microsoft, _))
        ));
    }

    #[test]
    fn disconnect_twice_stays_disconnected() {
        let h = harness(false);
        h.mailer.oauth_connect("c1", Provider::Microsoft, token(3600, false));
        assert!(h.mailer.oauth_status("c1")[&Provider::Microsoft].connected);

        h.mailer.oauth_disconnect("c1", Provider::Microsoft);
        assert!(!h.mailer.oauth_status("c1")[&Provider::Microsoft].connected);
        h.mailer.oauth_disconnect("c1", Provider::Microsoft);
        assert!(!h.mailer.oauth_status("c1")[&Provider::Microsoft].connected);
    }

    #[test]
    fn login_state_is_single_use() {
        let h = harness(false);
        assert!(matches!(
            h.mailer.oauth_begin("c1", Provider::Google, "http://localhost"),
            Err(SendError::OAuthNotConfigured(Provider::Google))
        ));

        let state = h
            .mailer
            .oauth_begin("c1", Provider::Microsoft, "http://localhost")
            .unwrap();
        let pending = h.mailer.oauth_complete(&state, token(3600, true)).unwrap();
        assert_eq!(pending.client_id, "c1");
        assert!(h.mailer.oauth_status("c1")[&Provider::Microsoft].connected);
        assert!(h.mailer.oauth_complete(&state, token(3600, true)).is_none());
    }

    #[tokio::test]
    async fn test_send_renders_cursor_recipient_for_sender() {
        let h = harness(false);
        let id = upload(&h.mailer);
        let result = h
            .mailer
            .send_test(&id, 6, &template(), &mapping(), AuthMode::Smtp, &smtp_context())
            .await
            .unwrap();
        assert_eq!(result, DeliveryResult::Delivered);
        assert_eq!(h.sender.attempts(), vec![(1, "me@example.com".to_string())]);
    }

    #[tokio::test]
    async fn mail_app_batch_drafts_each_valid_row() {
        let h = harness(false);
        let id = upload(&h.mailer);
        let report = h
            .mailer
            .send_all(
                &id,
                &template(),
                &mapping(),
                AuthMode::MailApp,
                &TransportContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(report.drafted(), Some(3));
        assert_eq!(report.failed, 1);
    }
}
