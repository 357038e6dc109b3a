//! Batch RTR operations across many hosts.
//!
//! A batch command runs in two passes over the session's hosts:
//!
//! 1. **Submit**: for each host, refresh the batch session and submit the
//!    command. Every submission is one blocking round trip; nothing is
//!    polled yet.
//! 2. **Resolve**: poll each cloud request to completion, in submission
//!    order.
//!
//! Wall-clock time is then roughly `hosts × round_trip + slowest host`
//! rather than the sum of every host's full runtime. The result is always
//! one [`ExecutionOutcome`] per host, in session order: a rejected
//! submission, a poll failure or a failed download becomes an error
//! outcome, never a missing entry.
//!
//! Host lifecycle actions (isolate, hide, suppress detections, ...) use a
//! separate single-call protocol; see [`BatchOperations::perform_action`].

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::client::FalconClient;
use crate::config::RtrConfig;
use crate::envelope::{ApiError, ApiResponse};
use crate::error::{FalconError, Result};
use crate::outcome::ExecutionOutcome;
use crate::poll::{PollConfig, poll_command};
use crate::retrieval::{FileRetriever, Retrieval};
use crate::session::{CommandInvocation, HostSession, Session, build_command_line};

const DEVICE_ACTION_PATH: &str = "devices/entities/devices-actions/v2";

// ── Host lifecycle actions ─────────────────────────────────────────────

/// Lifecycle actions applied to every host of a batch in one vendor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Isolate,
    LiftIsolation,
    Hide,
    Unhide,
    SuppressDetections,
    UnsuppressDetections,
}

impl HostAction {
    pub const ALL: [HostAction; 6] = [
        HostAction::Isolate,
        HostAction::LiftIsolation,
        HostAction::Hide,
        HostAction::Unhide,
        HostAction::SuppressDetections,
        HostAction::UnsuppressDetections,
    ];

    /// The vendor's `action_name` query parameter.
    pub fn action_name(self) -> &'static str {
        match self {
            HostAction::Isolate => "contain",
            HostAction::LiftIsolation => "lift_containment",
            HostAction::Hide => "hide_host",
            HostAction::Unhide => "unhide_host",
            HostAction::SuppressDetections => "detection_suppress",
            HostAction::UnsuppressDetections => "detection_unsuppress",
        }
    }

    /// The label recorded as the outcome's command.
    pub fn label(self) -> &'static str {
        match self {
            HostAction::Isolate => "isolate",
            HostAction::LiftIsolation => "lift_isolation",
            HostAction::Hide => "hide_host",
            HostAction::Unhide => "unhide_host",
            HostAction::SuppressDetections => "suppress_detections",
            HostAction::UnsuppressDetections => "unsuppress_detections",
        }
    }
}

impl fmt::Display for HostAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for HostAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        HostAction::ALL
            .into_iter()
            .find(|a| a.label() == s || a.action_name() == s)
            .ok_or_else(|| {
                let labels: Vec<&str> = HostAction::ALL.iter().map(|a| a.label()).collect();
                format!("unknown host action '{s}', expected one of: {}", labels.join(", "))
            })
    }
}

#[derive(Serialize)]
struct DeviceActionRequest<'a> {
    ids: &'a [&'a str],
}

#[derive(Debug, Default, Deserialize)]
struct DeviceActionResource {
    #[serde(default)]
    id: Option<String>,
}

/// Vendor errors from a device action, mapped to the hosts they name.
#[derive(Debug, Default)]
pub struct CorrelatedErrors<'a> {
    /// Error messages per host id, in vendor order.
    pub by_endpoint: HashMap<&'a str, Vec<String>>,
    /// Errors that named none of the requested hosts.
    pub uncorrelated: Vec<ApiError>,
}

/// Maps device-action errors to hosts.
///
/// The device-actions API reports per-host failures only as free text, with
/// the host id embedded in the message, so an error belongs to every
/// requested id that occurs in its message.
pub fn correlate_action_errors<'a>(endpoint_ids: &[&'a str], errors: &[ApiError]) -> CorrelatedErrors<'a> {
    let mut correlated = CorrelatedErrors::default();
    for error in errors {
        let mut matched = false;
        for id in endpoint_ids.iter().filter(|id| !id.is_empty()) {
            if error.message.contains(id) {
                correlated
                    .by_endpoint
                    .entry(*id)
                    .or_default()
                    .push(error.message.clone());
                matched = true;
            }
        }
        if !matched {
            correlated.uncorrelated.push(error.clone());
        }
    }
    correlated
}

// ── Batch operations ───────────────────────────────────────────────────

/// RTR operations over an open batch [`Session`].
pub struct BatchOperations {
    session: Session,
    retriever: FileRetriever,
    command_poll: PollConfig,
    quoting_marker: String,
    script_timeout_secs: u64,
}

impl BatchOperations {
    /// Opens a batch session for `endpoint_ids`.
    pub async fn open(client: Arc<FalconClient>, endpoint_ids: &[String], config: &RtrConfig) -> Result<Self> {
        let session = Session::open(client, endpoint_ids).await?;
        Ok(Self::from_session(session, config))
    }

    pub fn from_session(session: Session, config: &RtrConfig) -> Self {
        BatchOperations {
            session,
            retriever: config.file_retriever(),
            command_poll: config.command_poll.clone(),
            quoting_marker: config.quoting_marker.clone(),
            script_timeout_secs: config.script_timeout_secs,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Releases the batch's server-side sessions.
    pub async fn close(&mut self) {
        self.session.close().await;
    }

    /// Refreshes then submits `command_line` to every host, in order.
    async fn submit_all(&self, base_command: &str, command_line: &str) -> Vec<CommandInvocation> {
        let mut invocations = Vec::with_capacity(self.session.hosts().len());
        for host in self.session.hosts() {
            if let Err(e) = self.session.refresh().await {
                tracing::warn!(batch_id = self.session.batch_id(), error = %e, "batch session refresh failed");
            }
            let invocation = match self.session.submit(host, base_command, command_line).await {
                Ok(invocation) => invocation,
                Err(e) => rejected(host, base_command, command_line, e.to_string()),
            };
            invocations.push(invocation);
        }
        invocations
    }

    /// Polls one invocation to an outcome. Never fails: every problem is
    /// recorded on the outcome.
    async fn resolve(&self, invocation: &CommandInvocation) -> ExecutionOutcome {
        let outcome = match invocation.require_cloud_request_id() {
            Err(e) => ExecutionOutcome::failed(&invocation.endpoint_id, &invocation.command_line, e.to_string()),
            Ok(crid) => match poll_command(self.session.client(), crid, &self.command_poll).await {
                Ok(done) => ExecutionOutcome::completed(
                    &invocation.endpoint_id,
                    crid,
                    &invocation.command_line,
                    done.stdout,
                    done.stderr,
                ),
                Err(e) => ExecutionOutcome::failed(&invocation.endpoint_id, &invocation.command_line, e.to_string())
                    .with_cloud_request(crid),
            },
        };
        outcome
            .with_session(Some(&invocation.session_id))
            .with_batch(self.session.batch_id())
    }

    async fn run_line(&self, base_command: &str, command_line: &str) -> Vec<ExecutionOutcome> {
        let invocations = self.submit_all(base_command, command_line).await;
        let mut outcomes = Vec::with_capacity(invocations.len());
        for invocation in &invocations {
            outcomes.push(self.resolve(invocation).await);
        }
        log_summary(self.session.batch_id(), command_line, &outcomes);
        outcomes
    }

    /// Runs a command on every host using the configured quoting marker.
    pub async fn run_command(
        &self,
        base_command: &str,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Vec<ExecutionOutcome> {
        self.run_command_quoted(base_command, arguments, timeout_secs, &self.quoting_marker)
            .await
    }

    /// Runs a command on every host with an explicit quoting marker.
    pub async fn run_command_quoted(
        &self,
        base_command: &str,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
        marker: &str,
    ) -> Vec<ExecutionOutcome> {
        let line = build_command_line(base_command, arguments, timeout_secs, marker);
        self.run_line(base_command, &line).await
    }

    /// Runs raw script text on every host via `runscript -Raw=`, with the
    /// configured script timeout.
    pub async fn run_script(&self, script: &str) -> Vec<ExecutionOutcome> {
        let raw = format!("-Raw=```{script}```");
        self.run_command("runscript", Some(&raw), Some(self.script_timeout_secs))
            .await
    }

    /// Checks for `path` on every host. A host that could not be asked
    /// reports `false`.
    pub async fn file_exists(&self, path: &str) -> Vec<(String, bool)> {
        self.run_line("ls", &format!("ls \"{path}\""))
            .await
            .into_iter()
            .map(|o| (o.endpoint_id().to_string(), !o.is_error()))
            .collect()
    }

    /// Collects `path` from every host.
    ///
    /// Per-host failures (rejected submission, stderr, download error
    /// object, file never listed) become error outcomes. A corrupt archive
    /// or a staging I/O failure aborts the batch.
    pub async fn get_file(&self, path: &str) -> Result<Vec<ExecutionOutcome>> {
        let command_line = format!("get \"{path}\"");
        let invocations = self.submit_all("get", &command_line).await;

        let mut outcomes = Vec::with_capacity(invocations.len());
        for invocation in &invocations {
            let completed = self.resolve(invocation).await;
            let crid = match (completed.cloud_request_id(), completed.stderr()) {
                (Some(crid), Some(stderr)) if completed.is_error() => {
                    let message = format!(
                        "Failed to get file '{path}' ({}) from {}",
                        stderr.trim(),
                        invocation.endpoint_id
                    );
                    outcomes.push(
                        ExecutionOutcome::failed(&invocation.endpoint_id, &command_line, message)
                            .with_cloud_request(crid)
                            .with_session(Some(&invocation.session_id))
                            .with_batch(self.session.batch_id()),
                    );
                    continue;
                }
                (Some(crid), _) if !completed.is_error() => crid.to_string(),
                _ => {
                    outcomes.push(completed);
                    continue;
                }
            };

            let outcome = match self
                .retriever
                .retrieve(self.session.client(), &invocation.session_id, &crid)
                .await
            {
                Ok(Retrieval::Content(content)) => {
                    ExecutionOutcome::retrieved(&invocation.endpoint_id, &crid, &command_line, content)
                }
                Ok(Retrieval::Rejected(detail)) => ExecutionOutcome::failed(
                    &invocation.endpoint_id,
                    &command_line,
                    format!("failed to download '{path}' from {}: {detail}", invocation.endpoint_id),
                )
                .with_cloud_request(&crid),
                Err(e @ (FalconError::Archive(_) | FalconError::Io(_))) => return Err(e),
                Err(e) => ExecutionOutcome::failed(
                    &invocation.endpoint_id,
                    &command_line,
                    format!("failed to retrieve '{path}' from {}: {e}", invocation.endpoint_id),
                )
                .with_cloud_request(&crid),
            };
            outcomes.push(
                outcome
                    .with_session(Some(&invocation.session_id))
                    .with_batch(self.session.batch_id()),
            );
        }
        log_summary(self.session.batch_id(), &command_line, &outcomes);
        Ok(outcomes)
    }

    /// Applies a lifecycle action to every host of the batch.
    ///
    /// Returns one outcome per host, in session order. Hosts the vendor
    /// listed as successful and not named by any error succeed; hosts named
    /// by an error fail with that message; hosts that appear in neither
    /// list fail with an explicit "no result" message.
    pub async fn perform_action(&self, action: HostAction) -> Result<Vec<ExecutionOutcome>> {
        let ids = self.session.endpoint_ids();
        let resp: ApiResponse<Vec<DeviceActionResource>> = self
            .session
            .client()
            .post(
                DEVICE_ACTION_PATH,
                &[("action_name", action.action_name())],
                &DeviceActionRequest { ids: &ids },
            )
            .await?;

        let outcomes = action_outcomes(action, &ids, &resp, self.session.batch_id());
        log_summary(self.session.batch_id(), action.label(), &outcomes);
        Ok(outcomes)
    }

    pub async fn isolate(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::Isolate).await
    }

    pub async fn lift_isolation(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::LiftIsolation).await
    }

    pub async fn hide_hosts(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::Hide).await
    }

    pub async fn unhide_hosts(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::Unhide).await
    }

    pub async fn suppress_detections(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::SuppressDetections).await
    }

    pub async fn unsuppress_detections(&self) -> Result<Vec<ExecutionOutcome>> {
        self.perform_action(HostAction::UnsuppressDetections).await
    }
}

fn rejected(host: &HostSession, base_command: &str, command_line: &str, message: String) -> CommandInvocation {
    CommandInvocation {
        endpoint_id: host.endpoint_id.clone(),
        session_id: host.session_id.clone(),
        base_command: base_command.to_string(),
        command_line: command_line.to_string(),
        cloud_request_id: None,
        rejection: Some(message),
    }
}

fn action_outcomes(
    action: HostAction,
    ids: &[&str],
    resp: &ApiResponse<Vec<DeviceActionResource>>,
    batch_id: Option<&str>,
) -> Vec<ExecutionOutcome> {
    let succeeded: HashSet<&str> = resp
        .body
        .resources
        .iter()
        .filter_map(|r| r.id.as_deref())
        .collect();
    let errors = correlate_action_errors(ids, &resp.body.errors);

    ids.iter()
        .map(|id| {
            let outcome = if let Some(messages) = errors.by_endpoint.get(id) {
                ExecutionOutcome::failed(id, action.label(), messages.join("; "))
            } else if succeeded.contains(id) {
                ExecutionOutcome::succeeded(id, action.label())
            } else {
                tracing::warn!(endpoint_id = %id, action = action.label(), "host missing from action response");
                let mut message = format!("no result reported for {id} ({})", status_text(resp.status));
                if !errors.uncorrelated.is_empty() {
                    let rendered: Vec<String> = errors.uncorrelated.iter().map(ToString::to_string).collect();
                    message.push_str(&format!("; vendor errors: {}", rendered.join("; ")));
                }
                ExecutionOutcome::failed(id, action.label(), message)
            };
            outcome.with_batch(batch_id)
        })
        .collect()
}

fn status_text(status: StatusCode) -> String {
    format!("HTTP {status}")
}

fn log_summary(batch_id: Option<&str>, command: &str, outcomes: &[ExecutionOutcome]) {
    let failed = outcomes.iter().filter(|o| o.is_error()).count();
    tracing::info!(
        batch_id,
        command,
        hosts = outcomes.len(),
        failed,
        "batch operation finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn api_error(message: &str) -> ApiError {
        ApiError {
            code: 404,
            message: message.to_string(),
        }
    }

    fn action_response(status: StatusCode, ok: &[&str], errors: &[&str]) -> ApiResponse<Vec<DeviceActionResource>> {
        ApiResponse {
            status,
            body: Envelope {
                resources: ok
                    .iter()
                    .map(|id| DeviceActionResource {
                        id: Some(id.to_string()),
                    })
                    .collect(),
                errors: errors.iter().map(|m| api_error(m)).collect(),
                ..Envelope::default()
            },
        }
    }

    #[test]
    fn host_action_names_and_labels() {
        assert_eq!(HostAction::Isolate.action_name(), "contain");
        assert_eq!(HostAction::LiftIsolation.action_name(), "lift_containment");
        assert_eq!(HostAction::SuppressDetections.action_name(), "detection_suppress");
        assert_eq!(HostAction::Unhide.label(), "unhide_host");
    }

    #[test]
    fn host_action_parses_label_or_vendor_name() {
        assert_eq!("isolate".parse::<HostAction>().unwrap(), HostAction::Isolate);
        assert_eq!("contain".parse::<HostAction>().unwrap(), HostAction::Isolate);
        assert_eq!(
            "unsuppress_detections".parse::<HostAction>().unwrap(),
            HostAction::UnsuppressDetections
        );
        let err = "reboot".parse::<HostAction>().unwrap_err();
        assert!(err.contains("lift_isolation"));
    }

    #[test]
    fn correlation_matches_ids_embedded_in_messages() {
        let errors = vec![
            api_error("Could not find host e2 in your environment"),
            api_error("rate limit exceeded"),
        ];
        let c = correlate_action_errors(&["e1", "e2"], &errors);
        assert_eq!(c.by_endpoint.len(), 1);
        assert_eq!(c.by_endpoint["e2"], vec!["Could not find host e2 in your environment"]);
        assert_eq!(c.uncorrelated, vec![api_error("rate limit exceeded")]);
    }

    #[test]
    fn correlation_ignores_empty_ids() {
        let c = correlate_action_errors(&[""], &[api_error("anything")]);
        assert!(c.by_endpoint.is_empty());
        assert_eq!(c.uncorrelated.len(), 1);
    }

    #[test]
    fn action_outcomes_cover_success_and_error_lists() {
        let resp = action_response(StatusCode::OK, &["e1"], &["e2 not found"]);
        let outcomes = action_outcomes(HostAction::Isolate, &["e1", "e2"], &resp, Some("b-1"));

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].endpoint_id(), "e1");
        assert!(!outcomes[0].is_error());
        assert_eq!(outcomes[0].command(), Some("isolate"));
        assert_eq!(outcomes[1].endpoint_id(), "e2");
        assert!(outcomes[1].is_error());
        assert!(outcomes[1].error_message().unwrap().contains("e2"));
        assert!(outcomes.iter().all(|o| o.batch_id() == Some("b-1")));
    }

    #[test]
    fn host_absent_from_both_lists_is_not_dropped() {
        let resp = action_response(StatusCode::OK, &["e1"], &[]);
        let outcomes = action_outcomes(HostAction::Hide, &["e1", "e2", "e3"], &resp, None);

        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[0].is_error());
        for missing in &outcomes[1..] {
            assert!(missing.is_error());
            assert!(missing.error_message().unwrap().contains("no result reported"));
            assert!(missing.error_message().unwrap().contains(missing.endpoint_id()));
        }
    }

    #[test]
    fn uncorrelated_vendor_errors_are_attached_to_unreported_hosts() {
        let resp = action_response(StatusCode::FORBIDDEN, &[], &["access denied"]);
        let outcomes = action_outcomes(HostAction::SuppressDetections, &["e1"], &resp, None);
        assert_eq!(outcomes.len(), 1);
        let msg = outcomes[0].error_message().unwrap();
        assert!(msg.contains("access denied"));
        assert!(msg.contains("403"));
    }

    #[test]
    fn error_wins_when_host_is_in_both_lists() {
        let resp = action_response(StatusCode::OK, &["e1"], &["e1 already contained"]);
        let outcomes = action_outcomes(HostAction::Isolate, &["e1"], &resp, None);
        assert!(outcomes[0].is_error());
    }

    #[test]
    fn device_action_request_serializes_ids() {
        let ids = ["e1", "e2"];
        let json = serde_json::to_value(DeviceActionRequest { ids: &ids }).unwrap();
        assert_eq!(json, serde_json::json!({"ids": ["e1", "e2"]}));
    }
}
