use super::message::build_message;
use super::{EmailError, MailApi};
use crate::http::ApiClient;
use crate::oauth::{OAuthToken, Provider};
use crate::template::RenderedMessage;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{info, warn};
use serde_json::{json, Value};

const GRAPH_SEND_URL: &str = "https://graph.microsoft.com/v1.0/me/sendMail";
const GMAIL_SEND_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

/// Microsoft Graph `sendMail` request body.
pub fn graph_payload(to: &str, message: &RenderedMessage) -> Value {
    json!({
        "message": {
            "subject": message.subject_text,
            "body": {
                "contentType": "HTML",
                "content": message.body_html,
            },
            "toRecipients": [
                { "emailAddress": { "address": to.trim() } }
            ],
        },
        "saveToSentItems": "true",
    })
}

/// Gmail `messages.send` request body: the full MIME message, base64url
/// without padding.
pub fn gmail_payload(from: &str, to: &str, message: &RenderedMessage) -> Result<Value, EmailError> {
    let email = build_message(from, to, message)?;
    Ok(json!({ "raw": URL_SAFE_NO_PAD.encode(email.formatted()) }))
}

/// Sends through each provider's REST API with the stored access token.
#[derive(Clone)]
pub struct ProviderMailApi {
    http: ApiClient,
}

impl ProviderMailApi {
    pub fn new(http: ApiClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MailApi for ProviderMailApi {
    async fn send(&self, token: &OAuthToken, to: &str, message: &RenderedMessage) -> Result<(), EmailError> {
        let (url, payload) = match token.provider {
            Provider::Microsoft => (GRAPH_SEND_URL, graph_payload(to, message)),
            Provider::Google => (GMAIL_SEND_URL, gmail_payload(&token.email, to, message)?),
        };

        let response = self
            .http
            .post_json(url, Some(&token.access_token), &payload)
            .await?;
        if response.is_error() {
            let detail = response.error_detail();
            warn!("{} send to {} failed: {}", token.provider, to, detail);
            return Err(EmailError::Api {
                provider: token.provider,
                detail,
            });
        }

        info!("Email sent to {} via {}", to, token.provider);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered() -> RenderedMessage {
        RenderedMessage {
            recipient_index: 3,
            address: "ana@acme.io".to_string(),
            subject_text: "Hello Ana".to_string(),
            body_text: "Hi Ana".to_string(),
            body_html: "<p>Hi Ana</p>".to_string(),
            body_plain: "Hi Ana".to_string(),
        }
    }

    #[test]
    fn graph_payload_is_html_with_one_recipient() {
        let payload = graph_payload(" ana@acme.io ", &rendered());
        assert_eq!(payload["message"]["subject"], "Hello Ana");
        assert_eq!(payload["message"]["body"]["contentType"], "HTML");
        assert_eq!(payload["message"]["body"]["content"], "<p>Hi Ana</p>");
        assert_eq!(
            payload["message"]["toRecipients"][0]["emailAddress"]["address"],
            "ana@acme.io"
        );
        assert_eq!(payload["saveToSentItems"], "true");
    }

    #[test]
    fn gmail_payload_is_unpadded_base64url_mime() {
        let payload = gmail_payload("me@gmail.com", "ana@acme.io", &rendered()).unwrap();
        let raw = payload["raw"].as_str().unwrap();
        assert!(!raw.contains('='));
        assert!(!raw.contains('+') && !raw.contains('/'));
        let mime = String::from_utf8(URL_SAFE_NO_PAD.decode(raw).unwrap()).unwrap();
        assert!(mime.contains("From: me@gmail.com"));
        assert!(mime.contains("Subject: Hello Ana"));
    }
}
