//! Minimal HTTPS client shared by the provider send calls and the token
//! refresher.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use log::trace;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use thiserror::Error;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type TokioConnector = HttpsConnector<HttpConnector>;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Failed to load TLS root certificates: {0}")]
    TlsRoots(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("Request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

/// A response reduced to what the callers look at.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn is_error(&self) -> bool {
        self.status.as_u16() >= 400
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Best human-readable error text a provider gave us.
    pub fn error_detail(&self) -> String {
        if let Some(serde_json::Value::Object(data)) = self.json() {
            let message = data
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str());
            let description = data.get("error_description").and_then(|d| d.as_str());
            let code = data.get("error").and_then(|e| e.as_str());
            for candidate in [message, description, code].into_iter().flatten() {
                let candidate = candidate.trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
        let text = String::from_utf8_lossy(&self.body).trim().to_string();
        if text.is_empty() {
            format!("HTTP {}", self.status.as_u16())
        } else {
            text
        }
    }
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client<TokioConnector, Full<Bytes>>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new() -> Result<Self, HttpError> {
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(rustls::crypto::ring::default_provider())?
            .https_only()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            client,
            timeout: REQUEST_TIMEOUT,
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        bearer: Option<&SecretString>,
        body: &serde_json::Value,
    ) -> Result<ApiResponse, HttpError> {
        self.post(url, bearer, "application/json", body.to_string().into_bytes())
            .await
    }

    pub async fn post_form(&self, url: &str, body: String) -> Result<ApiResponse, HttpError> {
        self.post(
            url,
            None,
            "application/x-www-form-urlencoded",
            body.into_bytes(),
        )
        .await
    }

    async fn post(
        &self,
        url: &str,
        bearer: Option<&SecretString>,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> Result<ApiResponse, HttpError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token.expose_secret()));
        }
        let request = builder.body(Full::new(Bytes::from(body)))?;

        trace!("POST {}", url);
        let response = tokio::time::timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??;
        let status = response.status();
        let body = tokio::time::timeout(self.timeout, response.into_body().collect())
            .await
            .map_err(|_| HttpError::Timeout(self.timeout))??
            .to_bytes();
        trace!("POST {} -> {}", url, status);

        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn prefers_nested_error_message() {
        let r = response(400, r#"{"error":{"code":"x","message":"Mailbox not enabled"}}"#);
        assert!(r.is_error());
        assert_eq!(r.error_detail(), "Mailbox not enabled");
    }

    #[test]
    fn falls_back_to_description_then_code() {
        assert_eq!(
            response(400, r#"{"error":"invalid_grant","error_description":"Token revoked"}"#)
                .error_detail(),
            "Token revoked"
        );
        assert_eq!(
            response(401, r#"{"error":"invalid_client"}"#).error_detail(),
            "invalid_client"
        );
    }

    #[test]
    fn falls_back_to_body_or_status() {
        assert_eq!(response(502, "Bad gateway").error_detail(), "Bad gateway");
        assert_eq!(response(500, "").error_detail(), "HTTP 500");
        assert!(!response(202, "").is_error());
    }
}
