//! The per-endpoint result record returned by every RTR operation.
//!
//! An [`ExecutionOutcome`] is built once, by the operation that produced it,
//! and is read-only afterwards. Its failure signal has two faces that always
//! agree: `is_error()` is true exactly when `error_message()` is `Some`.
//! Command completions derive the message from stderr, so for those
//! `is_error()` is also exactly "stderr is non-blank".

use bytes::Bytes;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::{FalconError, Result};

/// Message used by `raise_on_error` if an error outcome somehow has no text.
pub const GENERIC_FAILURE: &str = "bulk operation failed";

fn non_blank(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}

/// Uniform per-endpoint result.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    endpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
    #[serde(skip)]
    content: Option<Bytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    error: bool,
}

impl ExecutionOutcome {
    fn base(endpoint_id: &str) -> Self {
        ExecutionOutcome {
            endpoint_id: endpoint_id.to_string(),
            session_id: None,
            batch_id: None,
            cloud_request_id: None,
            command: None,
            stdout: None,
            stderr: None,
            content: None,
            error_message: None,
            error: false,
        }
    }

    /// Outcome of a command the poller saw complete. Non-blank stderr marks
    /// it failed, with stderr as the error message.
    pub fn completed(
        endpoint_id: &str,
        cloud_request_id: &str,
        command: &str,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        let error_message = non_blank(stderr.as_deref()).map(str::to_string);
        ExecutionOutcome {
            cloud_request_id: Some(cloud_request_id.to_string()),
            command: Some(command.to_string()),
            error: error_message.is_some(),
            error_message,
            stdout,
            stderr,
            ..Self::base(endpoint_id)
        }
    }

    /// Successful file retrieval carrying the payload bytes.
    pub fn retrieved(endpoint_id: &str, cloud_request_id: &str, command: &str, content: Bytes) -> Self {
        ExecutionOutcome {
            cloud_request_id: Some(cloud_request_id.to_string()),
            command: Some(command.to_string()),
            content: Some(content),
            ..Self::base(endpoint_id)
        }
    }

    /// Successful action with no output (host lifecycle actions).
    pub fn succeeded(endpoint_id: &str, command: &str) -> Self {
        ExecutionOutcome {
            command: Some(command.to_string()),
            ..Self::base(endpoint_id)
        }
    }

    /// Failure that never produced a completed execution: a rejected
    /// submission, a poll error, a failed download, a vendor action error.
    pub fn failed(endpoint_id: &str, command: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            GENERIC_FAILURE.to_string()
        } else {
            message
        };
        ExecutionOutcome {
            command: Some(command.to_string()),
            error_message: Some(message),
            error: true,
            ..Self::base(endpoint_id)
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_batch(mut self, batch_id: Option<&str>) -> Self {
        self.batch_id = batch_id.map(str::to_string);
        self
    }

    pub fn with_cloud_request(mut self, cloud_request_id: &str) -> Self {
        self.cloud_request_id = Some(cloud_request_id.to_string());
        self
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    pub fn cloud_request_id(&self) -> Option<&str> {
        self.cloud_request_id.as_deref()
    }

    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    pub fn stdout(&self) -> Option<&str> {
        self.stdout.as_deref()
    }

    pub fn stderr(&self) -> Option<&str> {
        self.stderr.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    pub fn has_content(&self) -> bool {
        self.content.is_some()
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn content_as_string(&self) -> Option<String> {
        self.content
            .as_ref()
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    /// Writes the payload to `path`, truncating any existing file.
    /// Does nothing if there is no payload.
    pub fn write_content_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(content) = &self.content {
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    /// Appends the payload to `path`, optionally preceded by a newline.
    /// Does nothing if there is no payload.
    pub fn append_content_to_file(&self, path: impl AsRef<Path>, insert_newline: bool) -> Result<()> {
        if let Some(content) = &self.content {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            if insert_newline {
                file.write_all(b"\n")?;
            }
            file.write_all(content)?;
        }
        Ok(())
    }

    /// Escalates a soft failure into an error.
    pub fn raise_on_error(&self) -> Result<()> {
        if !self.error {
            return Ok(());
        }
        Err(FalconError::OperationFailed {
            message: self
                .error_message
                .clone()
                .unwrap_or_else(|| GENERIC_FAILURE.to_string()),
        })
    }
}
