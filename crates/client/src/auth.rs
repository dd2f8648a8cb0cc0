use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Session expired and no refresh token is available")]
    SessionExpired,
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Token pair as returned by the backend login and refresh endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
    fn apply(&mut self, pair: TokenPair) {
        self.expires_at = pair
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(Duration::try_seconds)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .or_else(|| jwt_expiry(&pair.access_token));
        self.access_token = Some(pair.access_token);
        if pair.refresh_token.is_some() {
            self.refresh_token = pair.refresh_token;
        }
    }

    fn expires_within(&self, skew: Duration) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at <= Utc::now() + skew,
            (Some(_), None) => false,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_within(Duration::zero())
    }
}

/// Holds the session's bearer tokens and refreshes them before they expire.
///
/// Refreshes are serialised behind one lock, so a burst of concurrent requests
/// near expiry triggers a single refresh call.
pub struct TokenManager {
    state: Mutex<TokenState>,
    refresh_url: String,
    skew: Duration,
}

impl TokenManager {
    pub fn new(refresh_url: String, skew: std::time::Duration) -> Self {
        Self {
            state: Mutex::new(TokenState::default()),
            refresh_url,
            skew: Duration::from_std(skew).unwrap_or_else(|_| Duration::seconds(60)),
        }
    }

    pub async fn set_tokens(&self, pair: TokenPair) {
        self.state.lock().await.apply(pair);
    }

    pub async fn set_refresh_token(&self, refresh_token: String) {
        self.state.lock().await.refresh_token = Some(refresh_token);
    }

    pub async fn clear(&self) {
        *self.state.lock().await = TokenState::default();
    }

    pub async fn is_authenticated(&self) -> bool {
        let state = self.state.lock().await;
        state.access_token.is_some() || state.refresh_token.is_some()
    }

    /// Returns the access token to send, refreshing it first when it is missing
    /// or about to expire. `None` means the session has no credentials at all.
    pub async fn bearer(&self, http: &Client) -> Result<Option<String>, AuthError> {
        let mut state = self.state.lock().await;

        if state.access_token.is_none() && state.refresh_token.is_none() {
            return Ok(None);
        }
        if !state.expires_within(self.skew) {
            return Ok(state.access_token.clone());
        }

        let Some(refresh_token) = state.refresh_token.clone() else {
            if state.is_expired() {
                return Err(AuthError::SessionExpired);
            }
            return Ok(state.access_token.clone());
        };

        match self.refresh(http, &refresh_token).await {
            Ok(pair) => {
                state.apply(pair);
                debug!(expires_at = ?state.expires_at, "Access token refreshed");
                Ok(state.access_token.clone())
            }
            Err(e) if !state.is_expired() => {
                warn!(error = %e, "Proactive token refresh failed, using current token");
                Ok(state.access_token.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, http: &Client, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let resp = http
            .post(&self.refresh_url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!("refresh endpoint returned {status}")));
        }

        resp.json::<TokenPair>()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("invalid token response: {e}")))
    }
}

/// Reads the `exp` claim of a JWT without verifying its signature; the backend
/// verifies, the console only needs to know when to refresh.
fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct ExpiryClaim {
        exp: i64,
    }

    let header = decode_header(token).ok()?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}
