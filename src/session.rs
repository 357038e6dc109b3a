//! RTR session lifecycle and command submission.
//!
//! A [`Session`] owns the server-side RTR sessions opened for one host
//! (`InitSession`) or for a batch of hosts (`BatchInitSessions`). Server
//! sessions count against a tenant quota, so they are always released:
//! explicitly via [`Session::close`], or on drop as a fallback, which
//! spawns the release onto the current tokio runtime.
//!
//! Submitting a command (`ExecuteAdminCommand`) returns a
//! [`CommandInvocation`] carrying the cloud request id the poller follows.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use reqwest::StatusCode;

use crate::client::FalconClient;
use crate::envelope::{ApiError, ApiResponse};
use crate::error::{FalconError, Result};
use crate::poll::ADMIN_COMMAND_PATH;

const SESSION_PATH: &str = "real-time-response/entities/sessions/v1";
const REFRESH_SESSION_PATH: &str = "real-time-response/entities/refresh-session/v1";
const BATCH_INIT_PATH: &str = "real-time-response/combined/batch-init-session/v1";
const BATCH_REFRESH_PATH: &str = "real-time-response/combined/batch-refresh-session/v1";

/// Default wrapper around command arguments. The RTR shell treats text
/// between triple backticks as one literal argument.
pub const DEFAULT_QUOTING_MARKER: &str = "```";

// ── Wire types ─────────────────────────────────────────────────────────

#[derive(Serialize)]
struct InitSessionRequest<'a> {
    device_id: &'a str,
    queue_offline: bool,
}

#[derive(Serialize)]
struct BatchInitRequest<'a> {
    host_ids: &'a [String],
    queue_offline: bool,
}

#[derive(Serialize)]
struct RefreshSessionRequest<'a> {
    device_id: &'a str,
}

#[derive(Serialize)]
struct BatchRefreshRequest<'a> {
    batch_id: &'a str,
}

#[derive(Serialize)]
struct AdminCommandRequest<'a> {
    base_command: &'a str,
    command_string: &'a str,
    session_id: &'a str,
    persist: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SessionResource {
    #[serde(default)]
    session_id: Option<String>,
}

/// Per-host entry of a `BatchInitSessions` response.
#[derive(Debug, Default, Deserialize)]
struct BatchHostResource {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    errors: Option<Vec<ApiError>>,
}

#[derive(Debug, Default, Deserialize)]
struct AdminCommandResource {
    #[serde(default)]
    cloud_request_id: Option<String>,
}

// ── Session ────────────────────────────────────────────────────────────

/// One host's RTR session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSession {
    pub endpoint_id: String,
    pub session_id: String,
}

/// A command submitted against one host session.
#[derive(Debug, Clone)]
pub struct CommandInvocation {
    pub endpoint_id: String,
    pub session_id: String,
    pub base_command: String,
    pub command_line: String,
    /// Set when the vendor accepted the command.
    pub cloud_request_id: Option<String>,
    /// Vendor response detail when it did not.
    pub rejection: Option<String>,
}

impl CommandInvocation {
    /// The cloud request id, or `FalconError::Submission` if the vendor
    /// rejected the command.
    pub fn require_cloud_request_id(&self) -> Result<&str> {
        self.cloud_request_id
            .as_deref()
            .ok_or_else(|| FalconError::Submission {
                command: self.command_line.clone(),
                message: self
                    .rejection
                    .clone()
                    .unwrap_or_else(|| "no cloud request id returned".to_string()),
            })
    }
}

/// Assembles an RTR command line.
///
/// `arguments` is wrapped in `marker` unless it already contains it (the
/// caller quoted it themselves) or `marker` is empty. A timeout appends
/// `-Timeout=<seconds>`.
pub fn build_command_line(
    base_command: &str,
    arguments: Option<&str>,
    timeout_secs: Option<u64>,
    marker: &str,
) -> String {
    let mut line = match arguments.filter(|a| !a.is_empty()) {
        Some(args) if !marker.is_empty() && !args.contains(marker) => {
            format!("{base_command} {marker}{args}{marker}")
        }
        Some(args) => format!("{base_command} {args}"),
        None => base_command.to_string(),
    };
    if let Some(timeout) = timeout_secs {
        line.push_str(&format!(" -Timeout={timeout}"));
    }
    line
}

/// Owner of one or more open RTR sessions.
pub struct Session {
    client: Arc<FalconClient>,
    batch_id: Option<String>,
    hosts: Vec<HostSession>,
    closed: bool,
}

impl Session {
    /// Opens a batch session across `endpoint_ids` in one vendor call.
    ///
    /// Duplicate ids are collapsed, keeping first-seen order; that order is
    /// the order of every batch result. Succeeds only on HTTP 201 with a
    /// session id for every host. On partial success the sessions that did
    /// open are released before the error is returned.
    pub async fn open(client: Arc<FalconClient>, endpoint_ids: &[String]) -> Result<Session> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = endpoint_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(FalconError::SessionInit {
                message: "no endpoints requested".to_string(),
            });
        }

        let resp: ApiResponse<HashMap<String, BatchHostResource>> = client
            .post(
                BATCH_INIT_PATH,
                &[],
                &BatchInitRequest {
                    host_ids: &ids,
                    queue_offline: false,
                },
            )
            .await?;

        let batch_id = resp.body.batch_id.clone().filter(|b| !b.is_empty());
        let mut hosts = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();
        for id in &ids {
            match resp.body.resources.get(id) {
                Some(BatchHostResource {
                    session_id: Some(sid),
                    errors,
                }) if !sid.is_empty() && errors.as_ref().is_none_or(Vec::is_empty) => {
                    hosts.push(HostSession {
                        endpoint_id: id.clone(),
                        session_id: sid.clone(),
                    });
                }
                _ => missing.push(id.as_str()),
            }
        }

        if resp.status != StatusCode::CREATED || batch_id.is_none() || !missing.is_empty() {
            let message = format!(
                "batch init for {} hosts returned {}; no session for [{}]",
                ids.len(),
                resp.error_summary(),
                missing.join(", ")
            );
            let mut partial = Session {
                client,
                batch_id,
                hosts,
                closed: false,
            };
            partial.close().await;
            return Err(FalconError::SessionInit { message });
        }

        tracing::info!(batch_id = batch_id.as_deref(), hosts = hosts.len(), "opened RTR batch session");
        Ok(Session {
            client,
            batch_id,
            hosts,
            closed: false,
        })
    }

    /// Opens a session against a single host.
    pub async fn open_single(client: Arc<FalconClient>, endpoint_id: &str) -> Result<Session> {
        let resp: ApiResponse<Vec<SessionResource>> = client
            .post(
                SESSION_PATH,
                &[],
                &InitSessionRequest {
                    device_id: endpoint_id,
                    queue_offline: false,
                },
            )
            .await?;

        let session_id = match resp.body.resources.as_slice() {
            [SessionResource {
                session_id: Some(sid),
            }] if resp.status.is_success() && !sid.is_empty() => sid.clone(),
            _ => {
                return Err(FalconError::SessionInit {
                    message: format!("host {endpoint_id}: {}", resp.error_summary()),
                });
            }
        };

        tracing::info!(endpoint_id, session_id = %session_id, "opened RTR session");
        Ok(Session {
            client,
            batch_id: None,
            hosts: vec![HostSession {
                endpoint_id: endpoint_id.to_string(),
                session_id,
            }],
            closed: false,
        })
    }

    pub fn client(&self) -> &FalconClient {
        &self.client
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.batch_id.as_deref()
    }

    /// Host sessions in submission order.
    pub fn hosts(&self) -> &[HostSession] {
        &self.hosts
    }

    pub fn endpoint_ids(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.endpoint_id.as_str()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Extends session lifetime server-side. Sessions expire on inactivity
    /// independently of any command timeout.
    pub async fn refresh(&self) -> Result<()> {
        let resp: ApiResponse<serde_json::Value> = match &self.batch_id {
            Some(batch_id) => {
                self.client
                    .post(BATCH_REFRESH_PATH, &[], &BatchRefreshRequest { batch_id })
                    .await?
            }
            None => {
                let Some(host) = self.hosts.first() else {
                    return Ok(());
                };
                self.client
                    .post(
                        REFRESH_SESSION_PATH,
                        &[],
                        &RefreshSessionRequest {
                            device_id: &host.endpoint_id,
                        },
                    )
                    .await?
            }
        };

        if !resp.status.is_success() {
            return Err(FalconError::Vendor {
                status: resp.status,
                errors: resp.body.errors,
            });
        }
        Ok(())
    }

    /// Submits a command line against one host session.
    ///
    /// A vendor rejection is returned inside the invocation, not as an
    /// error; only transport and auth failures are `Err`.
    pub async fn submit(
        &self,
        host: &HostSession,
        base_command: &str,
        command_line: &str,
    ) -> Result<CommandInvocation> {
        let resp: ApiResponse<Vec<AdminCommandResource>> = self
            .client
            .post(
                ADMIN_COMMAND_PATH,
                &[],
                &AdminCommandRequest {
                    base_command,
                    command_string: command_line,
                    session_id: &host.session_id,
                    persist: false,
                },
            )
            .await?;

        let cloud_request_id = resp
            .body
            .resources
            .iter()
            .find_map(|r| r.cloud_request_id.clone())
            .filter(|id| !id.is_empty());
        let rejection = match cloud_request_id {
            Some(_) => None,
            None => {
                tracing::warn!(
                    endpoint_id = %host.endpoint_id,
                    command = command_line,
                    "command rejected: {}",
                    resp.error_summary()
                );
                Some(resp.error_summary())
            }
        };

        Ok(CommandInvocation {
            endpoint_id: host.endpoint_id.clone(),
            session_id: host.session_id.clone(),
            base_command: base_command.to_string(),
            command_line: command_line.to_string(),
            cloud_request_id,
            rejection,
        })
    }

    /// Releases every server-side session held. Best effort: a session the
    /// vendor no longer knows (404) counts as released, other failures are
    /// logged. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        release_sessions(&self.client, &self.hosts).await;
        tracing::info!(batch_id = self.batch_id.as_deref(), hosts = self.hosts.len(), "closed RTR session");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed || self.hosts.is_empty() {
            return;
        }
        let hosts = std::mem::take(&mut self.hosts);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = Arc::clone(&self.client);
                handle.spawn(async move { release_sessions(&client, &hosts).await });
            }
            Err(_) => tracing::warn!(
                sessions = hosts.len(),
                "RTR session dropped outside a runtime without close(); server sessions will expire on their own"
            ),
        }
    }
}

async fn release_sessions(client: &FalconClient, hosts: &[HostSession]) {
    for host in hosts {
        let result = client
            .delete::<Vec<serde_json::Value>>(SESSION_PATH, &[("session_id", host.session_id.as_str())])
            .await;
        match result {
            Ok(resp) if resp.status.is_success() || resp.status == StatusCode::NOT_FOUND => {}
            Ok(resp) => tracing::warn!(
                endpoint_id = %host.endpoint_id,
                session_id = %host.session_id,
                "failed to delete RTR session: {}",
                resp.error_summary()
            ),
            Err(e) => tracing::warn!(
                endpoint_id = %host.endpoint_id,
                session_id = %host.session_id,
                error = %e,
                "failed to delete RTR session"
            ),
        }
    }
}
