//! Authenticated HTTP client for the Falcon API.
//!
//! `FalconClient` wraps a `reqwest::Client` and a `TokenProvider` behind a
//! `Mutex` and speaks the Falcon envelope format: every JSON call returns an
//! [`ApiResponse`] carrying the HTTP status and decoded
//! `{resources, errors, meta}` body, including for non-2xx statuses. RTR
//! callers need the vendor error list to decide whether a failure is fatal
//! or belongs to one host in a batch, so the client never calls
//! `error_for_status()` on envelope responses.
//!
//! Token lifecycle:
//! - Lazy acquisition on the first request.
//! - Freshness-aware: `TokenProvider::token()` returns `None` once the token
//!   is older than the freshness window, which triggers a refresh.
//! - One-shot 401 retry: a `401 Unauthorized` invalidates the cached token,
//!   refreshes once and retries exactly once. A second 401 is returned to
//!   the caller like any other status.

use bytes::Bytes;
use reqwest::{Client, Method, StatusCode, header};
use serde::{Serialize, de::DeserializeOwned};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::auth::TokenProvider;
use crate::envelope::{ApiResponse, Envelope};
use crate::error::{FalconError, Result};

/// Default Falcon cloud (US-1).
pub const DEFAULT_BASE_URL: &str = "https://api.crowdstrike.com/";

/// Covers TCP + TLS handshake only.
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Full round-trip including body download. Extracted-file archives can be
/// large memory dumps, so this is generous.
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

fn build_api_client() -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(API_CONNECT_TIMEOUT)
        .timeout(API_REQUEST_TIMEOUT)
        .build()?)
}

/// Result of an extracted-file download.
///
/// The endpoint answers with raw archive bytes on success and with a JSON
/// envelope when it cannot serve the file; the latter is a value, not an
/// error, so batch retrieval can record it against one host and move on.
#[derive(Debug)]
pub enum Download {
    /// Raw archive bytes.
    Content(Bytes),
    /// The server answered with an error object instead of bytes.
    Rejected {
        /// HTTP status of the response.
        status: StatusCode,
        /// Vendor errors or raw body text.
        detail: String,
    },
}

/// Authenticated HTTP client for the Falcon REST API.
///
/// `auth` sits behind an async `Mutex` because refreshing needs `&mut`. The
/// lock is held across the token request, so concurrent callers wait for a
/// single refresh rather than each fetching their own token. API requests
/// themselves run without it.
pub struct FalconClient {
    client: Client,
    base_url: String,
    auth: Mutex<TokenProvider>,
}

impl FalconClient {
    pub fn new(auth: TokenProvider) -> Result<Self> {
        Self::with_base_url(auth, DEFAULT_BASE_URL)
    }

    /// Constructor with a custom base URL (another Falcon cloud, or a mock
    /// server in tests). The URL must end with a slash.
    pub fn with_base_url(auth: TokenProvider, base_url: &str) -> Result<Self> {
        Ok(FalconClient {
            client: build_api_client()?,
            base_url: base_url.to_string(),
            auth: Mutex::new(auth),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn bearer_token(&self) -> Result<String> {
        let mut auth = self.auth.lock().await;
        if auth.token().is_none() {
            auth.refresh_token().await?;
        }

        auth.token().map(str::to_owned).ok_or_else(|| FalconError::Auth {
            message: "token missing after refresh".to_string(),
            source: None,
        })
    }

    async fn force_refresh(&self) -> Result<String> {
        let mut auth = self.auth.lock().await;
        auth.invalidate();
        auth.refresh_token().await?;

        auth.token().map(str::to_owned).ok_or_else(|| FalconError::Auth {
            message: "token missing after forced refresh".to_string(),
            source: None,
        })
    }

    /// Sends an authenticated request, retrying once on 401.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);

        let token = self.bearer_token().await?;
        let resp = self
            .build_request(method.clone(), &url, &token, query, body)
            .send()
            .await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            tracing::debug!(%url, "401 from Falcon API, refreshing token and retrying once");
            let fresh_token = self.force_refresh().await?;
            return Ok(self
                .build_request(method, &url, &fresh_token, query, body)
                .send()
                .await?);
        }

        Ok(resp)
    }

    fn build_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url).bearer_auth(token);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(payload) = body {
            req = req.json(payload);
        }
        req
    }

    /// Core envelope call. All verb helpers delegate here.
    ///
    /// - 2xx: the body must decode as an envelope (an empty body decodes as
    ///   an empty envelope, e.g. `204 No Content` from DELETE).
    /// - non-2xx: returned as a value when the body is an envelope, so the
    ///   vendor's `errors` survive; otherwise `FalconError::Api`.
    pub async fn request<R, B>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<ApiResponse<R>>
    where
        R: DeserializeOwned + Default,
        B: Serialize + ?Sized,
    {
        let resp = self.send(method, path, query, body).await?;
        let status = resp.status();
        let text = resp.text().await?;

        if text.trim().is_empty() {
            return Ok(ApiResponse {
                status,
                body: Envelope::default(),
            });
        }

        match serde_json::from_str::<Envelope<R>>(&text) {
            Ok(body) => Ok(ApiResponse { status, body }),
            Err(e) if status.is_success() => Err(FalconError::Parse(e)),
            Err(_) => Err(FalconError::Api { status, body: text }),
        }
    }

    /// Authenticated GET returning the decoded envelope.
    pub async fn get<R: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse<R>> {
        self.request::<R, ()>(Method::GET, path, query, None).await
    }

    /// Authenticated POST with a JSON body.
    pub async fn post<B: Serialize + ?Sized, R: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &B,
    ) -> Result<ApiResponse<R>> {
        self.request(Method::POST, path, query, Some(body)).await
    }

    /// Authenticated DELETE.
    pub async fn delete<R: DeserializeOwned + Default>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<ApiResponse<R>> {
        self.request::<R, ()>(Method::DELETE, path, query, None).await
    }

    /// Authenticated GET for binary content.
    ///
    /// A success status with a non-JSON content type is payload. Anything
    /// else is reported as [`Download::Rejected`].
    pub async fn download(&self, path: &str, query: &[(&str, &str)]) -> Result<Download> {
        let resp = self.send::<()>(Method::GET, path, query, None).await?;
        let status = resp.status();
        let is_json = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if status.is_success() && !is_json {
            return Ok(Download::Content(resp.bytes().await?));
        }

        let text = resp.text().await?;
        let detail = match serde_json::from_str::<Envelope<Vec<serde_json::Value>>>(&text) {
            Ok(env) if !env.errors.is_empty() => env
                .errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
            _ => text,
        };
        Ok(Download::Rejected { status, detail })
    }

    /// Revokes and forgets the API token. Later requests re-authenticate.
    pub async fn close(&self) {
        self.auth.lock().await.close().await;
    }
}
