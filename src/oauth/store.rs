use super::{OAuthToken, Provider, ProviderCatalog};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Login states older than this are dropped.
const PENDING_STATE_MAX_AGE_SECS: i64 = 900;

/// What a client sees for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub label: &'static str,
    pub configured: bool,
    pub connected: bool,
    pub email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// An OAuth login that was started but has not called back yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOAuthState {
    pub provider: Provider,
    pub client_id: String,
    pub frontend_origin: String,
    pub created_at: DateTime<Utc>,
}

type TokenKey = (String, Provider);

/// Process-lifetime token store keyed by `(client id, provider)`.
///
/// Starts empty and is never persisted: a restart disconnects everyone.
#[derive(Debug, Default)]
pub struct CredentialStore {
    tokens: Mutex<HashMap<TokenKey, OAuthToken>>,
    pending: Mutex<HashMap<String, PendingOAuthState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key(client_id: &str, provider: Provider) -> TokenKey {
    (client_id.trim().to_string(), provider)
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, client_id: &str, catalog: &ProviderCatalog) -> BTreeMap<Provider, ProviderStatus> {
        let now = Utc::now();
        let tokens = lock(&self.tokens);
        Provider::ALL
            .into_iter()
            .map(|provider| {
                let token = tokens
                    .get(&key(client_id, provider))
                    .filter(|token| !token.is_expired(now));
                let status = ProviderStatus {
                    label: provider.label(),
                    configured: catalog.is_configured(provider),
                    connected: token.is_some(),
                    email: token.map(|t| t.email.clone()),
                    expires_at: token.map(|t| t.expires_at),
                };
                (provider, status)
            })
            .collect()
    }

    /// Saves the token for `(client_id, provider)`, replacing any earlier one.
    pub fn store(&self, client_id: &str, provider: Provider, mut token: OAuthToken) {
        let key = key(client_id, provider);
        token.client_id = key.0.clone();
        token.provider = provider;
        info!("Stored {} token for client {} ({})", provider, key.0, token.email);
        lock(&self.tokens).insert(key, token);
    }

    /// Disconnects. Clearing an absent entry is fine.
    pub fn clear(&self, client_id: &str, provider: Provider) {
        if lock(&self.tokens).remove(&key(client_id, provider)).is_some() {
            info!("Disconnected {} for client {}", provider, client_id.trim());
        }
    }

    /// Snapshot of the stored token; never refreshes.
    pub fn get(&self, client_id: &str, provider: Provider) -> Option<OAuthToken> {
        lock(&self.tokens).get(&key(client_id, provider)).cloned()
    }

    pub fn create_pending_state(&self, provider: Provider, client_id: &str, frontend_origin: &str) -> String {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(PENDING_STATE_MAX_AGE_SECS);
        let state = Uuid::new_v4().simple().to_string();

        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, p| p.created_at >= cutoff);
        if pending.len() < before {
            debug!("Dropped {} expired OAuth login states", before - pending.len());
        }
        pending.insert(
            state.clone(),
            PendingOAuthState {
                provider,
                client_id: client_id.trim().to_string(),
                frontend_origin: frontend_origin.trim().to_string(),
                created_at: now,
            },
        );
        state
    }

    /// Single use: a second call with the same state returns `None`.
    pub fn consume_pending_state(&self, state: &str) -> Option<PendingOAuthState> {
        lock(&self.pending).remove(state.trim())
    }
}
