//! Typed error hierarchy for the falcon-rtr crate.
//!
//! `FalconError` separates the failure boundaries a Real Time Response
//! caller has to tell apart:
//! - Transport and authentication (`Network`, `Auth`).
//! - Vendor-reported failures, which keep every `[code] message` pair the
//!   Falcon API returned (`Vendor`, `Api`).
//! - RTR protocol failures: a session that would not initialize, a command
//!   that never got a cloud request id, a poll that ran past its deadline.
//! - Local failures while staging a retrieved archive (`Archive`, `Io`).
//!
//! Batch operations never surface per-host failures through this type;
//! they are folded into [`ExecutionOutcome`](crate::outcome::ExecutionOutcome)
//! records and only escalate when the caller asks for it via
//! `raise_on_error()`.

use reqwest::StatusCode;

use crate::envelope::ApiError;

/// Unified error type for all falcon-rtr library operations.
#[derive(Debug, thiserror::Error)]
pub enum FalconError {
    /// Failure at the OAuth2 token endpoint: bad credentials, an
    /// unreadable token response, or a transport failure reaching it.
    #[error("authentication failed: {message}")]
    Auth {
        /// Human-readable description including the HTTP status and the
        /// vendor error body when available.
        message: String,
        /// The underlying transport or parse error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The API returned a non-success status whose body was not a
    /// Falcon response envelope. The raw body is kept for diagnostics.
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code of the response.
        status: StatusCode,
        /// Raw response body text.
        body: String,
    },

    /// The API returned a Falcon envelope carrying one or more errors.
    #[error("vendor reported {status}: {}", render_errors(.errors))]
    Vendor {
        /// HTTP status code of the response.
        status: StatusCode,
        /// Every error the vendor reported, in the order received.
        errors: Vec<ApiError>,
    },

    /// An RTR session (single or batch) did not fully initialize.
    #[error("failed to initialise RTR session: {message}")]
    SessionInit {
        /// What went wrong, including the vendor response where useful.
        message: String,
    },

    /// A command submission was rejected and produced no cloud request id.
    #[error("failed to execute command '{command}': {message}")]
    Submission {
        /// The full command line that was submitted.
        command: String,
        /// Vendor response detail.
        message: String,
    },

    /// A polling loop passed its configured deadline. This is a local
    /// bound, not a vendor failure: the remote execution may still finish.
    #[error("polling timed out after {elapsed:?} waiting for {target}")]
    PollTimeout {
        /// Time spent polling when the deadline was detected.
        elapsed: std::time::Duration,
        /// The cloud request id (or file lookup) being waited on.
        target: String,
    },

    /// A command completed with non-empty stderr where the operation
    /// needed it to succeed.
    #[error("command '{command}' failed: {stderr}")]
    CommandFailed {
        /// The full command line.
        command: String,
        /// Trimmed stderr reported by the endpoint.
        stderr: String,
    },

    /// The extracted-file download returned an error object instead of
    /// archive bytes.
    #[error("file download failed: {message}")]
    Download {
        /// Vendor response detail.
        message: String,
    },

    /// The operation is not available on the endpoint's platform.
    #[error("{operation} is not supported on {endpoint}; only available on Windows")]
    Unsupported {
        operation: String,
        endpoint: String,
    },

    /// The downloaded archive could not be opened or unpacked.
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Local filesystem failure in the staging area.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON deserialization failed on an API response body.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Transport-level failure (DNS, TCP, TLS, request timeout).
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Invalid configuration file or value.
    #[error("invalid configuration: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// A soft per-endpoint failure escalated by
    /// [`ExecutionOutcome::raise_on_error`](crate::outcome::ExecutionOutcome::raise_on_error).
    #[error("{message}")]
    OperationFailed {
        /// The outcome's error message, or a generic fallback.
        message: String,
    },
}

/// Renders vendor errors as `[code] message` pairs joined by `; `.
fn render_errors(errors: &[ApiError]) -> String {
    if errors.is_empty() {
        return "no error detail".to_string();
    }
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, FalconError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::time::Duration;

    #[test]
    fn auth_error_displays_message() {
        let err = FalconError::Auth {
            message: "token request failed (401): access denied, invalid bearer token".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("authentication failed"));
        assert!(msg.contains("invalid bearer token"));
    }

    #[test]
    fn auth_error_with_source_chains_correctly() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("not-json").unwrap_err();
        let err = FalconError::Auth {
            message: "failed to parse token response".to_string(),
            source: Some(Box::new(json_err)),
        };
        assert!(err.source().is_some());
    }

    #[test]
    fn vendor_error_renders_every_code_and_message() {
        let err = FalconError::Vendor {
            status: StatusCode::BAD_REQUEST,
            errors: vec![
                ApiError {
                    code: 40401,
                    message: "session not found".to_string(),
                },
                ApiError {
                    code: 500,
                    message: "command timed out".to_string(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("[40401] session not found"));
        assert!(msg.contains("[500] command timed out"));
        assert!(msg.contains("400"));
    }

    #[test]
    fn vendor_error_without_detail_is_still_readable() {
        let err = FalconError::Vendor {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            errors: vec![],
        };
        assert!(err.to_string().contains("no error detail"));
    }

    #[test]
    fn poll_timeout_names_target_and_duration() {
        let err = FalconError::PollTimeout {
            elapsed: Duration::from_secs(605),
            target: "cloud-req-123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("cloud-req-123"));
        assert!(msg.contains("605"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn operation_failed_displays_message_verbatim() {
        let err = FalconError::OperationFailed {
            message: "Access Denied".to_string(),
        };
        assert_eq!(err.to_string(), "Access Denied");
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FalconError>();
    }
}
