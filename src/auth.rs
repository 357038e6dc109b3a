//! OAuth2 client-credentials authentication for the Falcon API.
//!
//! Acquires bearer tokens from `{base_url}/oauth2/token`. The token is cached
//! in `TokenProvider` and treated as stale once either bound is hit:
//! - the freshness window (600 s since acquisition), or
//! - the server-reported `expires_in` minus a safety buffer.
//!
//! Consumers (e.g. `FalconClient`) read the cached token via `token()` and
//! call `refresh_token()` when it is absent or stale.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{FalconError, Result};

/// Tokens older than this are renewed even if the server says they are
/// still valid.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(600);

/// Subtracted from `expires_in` so requests never race the expiry boundary.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// Form body sent to the token endpoint.
#[derive(Serialize)]
pub struct TokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
}

/// Form body sent to the revoke endpoint.
#[derive(Serialize)]
struct RevokeRequest<'a> {
    token: &'a str,
}

/// Subset of the token response that we need.
#[derive(Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    pub expires_in: u64,
}

/// Manages OAuth2 token acquisition and caching.
///
/// Invariants:
/// - `response` is `None` until the first successful `refresh_token()` call
///   and again after `invalidate()` or `close()`.
/// - `acquired_at` is always `Some` when `response` is `Some`.
pub struct TokenProvider {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    response: Option<TokenResponse>,
    acquired_at: Option<Instant>,
}

impl TokenProvider {
    /// `base_url` must end with a slash, e.g. `https://api.crowdstrike.com/`.
    pub fn new(base_url: &str, client_id: &str, client_secret: &str) -> Self {
        TokenProvider {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            response: None,
            acquired_at: None,
        }
    }

    /// Creates a `TokenProvider` with a pre-set token, bypassing the token
    /// endpoint. Used by tests; the token counts as freshly acquired.
    pub fn with_token(token: &str) -> Self {
        TokenProvider {
            client: reqwest::Client::new(),
            base_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            response: Some(TokenResponse {
                access_token: token.to_string(),
                token_type: Some("bearer".to_string()),
                expires_in: 1799,
            }),
            acquired_at: Some(Instant::now()),
        }
    }

    /// Fetches a new token and caches it.
    ///
    /// The body is read as text before the status check so a rejected
    /// request keeps the vendor's error message.
    pub async fn refresh_token(&mut self) -> Result<()> {
        let body = TokenRequest {
            client_id: &self.client_id,
            client_secret: &self.client_secret,
        };
        let url = format!("{}oauth2/token", self.base_url);

        let response = self
            .client
            .post(&url)
            .form(&body)
            .send()
            .await
            .map_err(|e| FalconError::Auth {
                message: format!("token request to {url} failed"),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| FalconError::Auth {
            message: "failed to read token response".to_string(),
            source: Some(Box::new(e)),
        })?;

        if !status.is_success() {
            return Err(FalconError::Auth {
                message: format!("token request failed ({status}): {text}"),
                source: None,
            });
        }

        let resp: TokenResponse = serde_json::from_str(&text).map_err(|e| FalconError::Auth {
            message: "failed to parse token response".to_string(),
            source: Some(Box::new(e)),
        })?;
        tracing::info!(expires_in = resp.expires_in, "authenticated to Falcon API");
        self.acquired_at = Some(Instant::now());
        self.response = Some(resp);

        Ok(())
    }

    /// `true` if a token exists but is past either freshness bound.
    /// `false` if no token is cached.
    fn is_expired(&self) -> bool {
        match (&self.response, self.acquired_at) {
            (Some(resp), Some(acquired)) => {
                let lifetime = Duration::from_secs(resp.expires_in.saturating_sub(EXPIRY_BUFFER_SECS));
                acquired.elapsed() >= lifetime.min(FRESHNESS_WINDOW)
            }
            _ => false,
        }
    }

    /// Returns the cached access token, or `None` if there is none or it is
    /// stale.
    pub fn token(&self) -> Option<&str> {
        if self.is_expired() {
            return None;
        }
        self.response.as_ref().map(|ret| ret.access_token.as_str())
    }

    /// When the current token was acquired, if any.
    pub fn last_auth_time(&self) -> Option<Instant> {
        self.acquired_at
    }

    /// Drops the cached token so the next `token()` call returns `None`.
    pub fn invalidate(&mut self) {
        self.response = None;
        self.acquired_at = None;
    }

    /// Revokes the current token server-side (best effort) and invalidates
    /// it locally. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(resp) = self.response.take() {
            let url = format!("{}oauth2/revoke", self.base_url);
            let result = self
                .client
                .post(&url)
                .basic_auth(&self.client_id, Some(&self.client_secret))
                .form(&RevokeRequest {
                    token: &resp.access_token,
                })
                .send()
                .await;
            match result {
                Ok(r) if r.status().is_success() => tracing::debug!("revoked Falcon API token"),
                Ok(r) => tracing::warn!(status = %r.status(), "token revocation rejected"),
                Err(e) => tracing::warn!(error = %e, "token revocation failed"),
            }
        }
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_none_before_refresh() {
        let tp = TokenProvider::new("https://api.crowdstrike.com/", "client", "secret");
        assert!(tp.token().is_none());
        assert!(tp.last_auth_time().is_none());
    }

    #[test]
    fn token_request_serializes_as_form() {
        let req = TokenRequest {
            client_id: "cid",
            client_secret: "secret~value",
        };
        let encoded = serde_urlencoded::to_string(&req).unwrap();
        assert!(encoded.contains("client_id=cid"));
        assert!(encoded.contains("client_secret=secret"));
    }

    #[test]
    fn token_response_deserializes_from_falcon_format() {
        let json = r#"{
            "access_token": "eyJhbGciOi.test.token",
            "token_type": "bearer",
            "expires_in": 1799
        }"#;
        let resp: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.access_token, "eyJhbGciOi.test.token");
        assert_eq!(resp.token_type.as_deref(), Some("bearer"));
        assert_eq!(resp.expires_in, 1799);
    }

    #[test]
    fn fresh_token_is_available() {
        let tp = TokenProvider::with_token("test-token");
        assert_eq!(tp.token(), Some("test-token"));
    }

    #[test]
    fn token_older_than_freshness_window_returns_none() {
        // expires_in is 1799s, but the 600s freshness window applies first.
        let mut tp = TokenProvider::with_token("test-token");
        tp.acquired_at = Some(Instant::now() - Duration::from_secs(601));
        assert!(tp.token().is_none());
    }

    #[test]
    fn token_within_freshness_window_returns_some() {
        let mut tp = TokenProvider::with_token("test-token");
        tp.acquired_at = Some(Instant::now() - Duration::from_secs(590));
        assert!(tp.token().is_some());
    }

    #[test]
    fn short_server_expiry_wins_over_freshness_window() {
        // expires_in=90 minus the 60s buffer leaves 30s of usable lifetime.
        let mut tp = TokenProvider::with_token("test-token");
        tp.response.as_mut().unwrap().expires_in = 90;
        tp.acquired_at = Some(Instant::now() - Duration::from_secs(31));
        assert!(tp.token().is_none());
    }

    #[test]
    fn invalidate_clears_token() {
        let mut tp = TokenProvider::with_token("test-token");
        tp.invalidate();
        assert!(tp.token().is_none());
        assert!(tp.last_auth_time().is_none());
    }
}
