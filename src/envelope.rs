//! Falcon API response envelope.
//!
//! Every Falcon endpoint answers with the same outer shape:
//!
//! ```json
//! { "meta": {...}, "resources": [...], "errors": [...] }
//! ```
//!
//! `resources` is usually a list but batch RTR endpoints return a map keyed
//! by host id, so the envelope is generic over its resource container.
//! The API frequently sends `"errors": null` or `"resources": null`; both
//! decode as empty containers.

use std::fmt;

use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};

/// A single vendor-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Vendor error code (often, but not always, an HTTP status).
    #[serde(default)]
    pub code: i64,
    /// Human-readable message. For host actions this text embeds the
    /// affected host id.
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Response metadata. Only the fields the RTR layer reads are modelled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Meta {
    /// Server-side trace id, useful when opening vendor support cases.
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Seconds the query took server-side.
    #[serde(default)]
    pub query_time: Option<f64>,
}

/// The `body` part of a Falcon response.
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "R: Deserialize<'de> + Default"))]
pub struct Envelope<R> {
    /// Successful results.
    #[serde(default, deserialize_with = "null_as_default")]
    pub resources: R,
    /// Failures, in vendor order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub errors: Vec<ApiError>,
    /// Response metadata.
    #[serde(default, deserialize_with = "null_as_default")]
    pub meta: Meta,
    /// Present only on batch session endpoints.
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl<R: Default> Default for Envelope<R> {
    fn default() -> Self {
        Envelope {
            resources: R::default(),
            errors: Vec::new(),
            meta: Meta::default(),
            batch_id: None,
        }
    }
}

/// A complete Falcon response: HTTP status plus decoded envelope.
///
/// Unlike a plain `error_for_status()` flow, non-2xx responses are returned
/// as values so RTR callers can read the vendor error list and decide
/// whether the failure is fatal or per-host.
#[derive(Debug, Clone)]
pub struct ApiResponse<R> {
    /// HTTP status code.
    pub status: StatusCode,
    /// Decoded body.
    pub body: Envelope<R>,
}

impl<R> ApiResponse<R> {
    /// `true` for any 2xx status with no vendor errors attached.
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.body.errors.is_empty()
    }

    /// Summarises the vendor errors for log lines and error messages.
    pub fn error_summary(&self) -> String {
        if self.body.errors.is_empty() {
            format!("HTTP {}", self.status)
        } else {
            let rendered: Vec<String> = self.body.errors.iter().map(ToString::to_string).collect();
            format!("HTTP {}: {}", self.status, rendered.join("; "))
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
