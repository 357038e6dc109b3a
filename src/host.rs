//! RTR operations against a single host.
//!
//! Unlike [`BatchOperations`](crate::batch::BatchOperations), failures here
//! are errors: a rejected submission, a poll timeout or a failed download
//! all come back as `Err`. A command that ran and wrote to stderr is still
//! an `Ok` outcome with `is_error()` set, except where the operation needs
//! the command to succeed (`get_file`).

use bytes::Bytes;
use std::sync::Arc;

use crate::client::FalconClient;
use crate::config::RtrConfig;
use crate::endpoint::Endpoint;
use crate::error::{FalconError, Result};
use crate::outcome::ExecutionOutcome;
use crate::poll::{PollConfig, poll_command};
use crate::retrieval::{FileRetriever, Retrieval};
use crate::session::{HostSession, Session, build_command_line};

/// An open RTR session on one endpoint.
pub struct HostResponse {
    endpoint: Endpoint,
    session: Session,
    retriever: FileRetriever,
    command_poll: PollConfig,
    quoting_marker: String,
    script_timeout_secs: u64,
}

impl HostResponse {
    pub async fn open(client: Arc<FalconClient>, endpoint: Endpoint, config: &RtrConfig) -> Result<Self> {
        let session = Session::open_single(client, &endpoint.id).await?;
        Ok(HostResponse {
            endpoint,
            session,
            retriever: config.file_retriever(),
            command_poll: config.command_poll.clone(),
            quoting_marker: config.quoting_marker.clone(),
            script_timeout_secs: config.script_timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn host(&self) -> Result<&HostSession> {
        self.session.hosts().first().ok_or_else(|| FalconError::SessionInit {
            message: format!("no open session for {}", self.endpoint),
        })
    }

    async fn execute(&self, base_command: &str, command_line: &str) -> Result<ExecutionOutcome> {
        let host = self.host()?;
        if let Err(e) = self.session.refresh().await {
            tracing::warn!(endpoint_id = %host.endpoint_id, error = %e, "session refresh failed");
        }
        let invocation = self.session.submit(host, base_command, command_line).await?;
        let crid = invocation.require_cloud_request_id()?;
        let done = poll_command(self.session.client(), crid, &self.command_poll).await?;
        Ok(
            ExecutionOutcome::completed(&host.endpoint_id, crid, command_line, done.stdout, done.stderr)
                .with_session(Some(&host.session_id)),
        )
    }

    /// Runs a command, wrapping `arguments` in the configured quoting marker.
    pub async fn run_command(
        &self,
        base_command: &str,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ExecutionOutcome> {
        self.run_command_quoted(base_command, arguments, timeout_secs, &self.quoting_marker)
            .await
    }

    pub async fn run_command_quoted(
        &self,
        base_command: &str,
        arguments: Option<&str>,
        timeout_secs: Option<u64>,
        marker: &str,
    ) -> Result<ExecutionOutcome> {
        let line = build_command_line(base_command, arguments, timeout_secs, marker);
        self.execute(base_command, &line).await
    }

    pub async fn run_script(&self, script: &str) -> Result<ExecutionOutcome> {
        let raw = format!("-Raw=```{script}```");
        self.run_command("runscript", Some(&raw), Some(self.script_timeout_secs))
            .await
    }

    /// `ls` on the unquoted path; any stderr means "not there".
    pub async fn file_exists(&self, path: &str) -> Result<bool> {
        let outcome = self.run_command_quoted("ls", Some(path), None, "").await?;
        Ok(!outcome.is_error())
    }

    /// Collects `path` and returns its contents.
    pub async fn get_file(&self, path: &str) -> Result<Bytes> {
        let command_line = format!("get \"{path}\"");
        let outcome = self.execute("get", &command_line).await?;
        if let Some(stderr) = outcome.error_message() {
            return Err(FalconError::CommandFailed {
                command: command_line,
                stderr: stderr.to_string(),
            });
        }
        let host = self.host()?;
        let crid = outcome.cloud_request_id().unwrap_or_default();
        match self
            .retriever
            .retrieve(self.session.client(), &host.session_id, crid)
            .await?
        {
            Retrieval::Content(content) => Ok(content),
            Retrieval::Rejected(detail) => Err(FalconError::Download {
                message: format!("'{path}' from {}: {detail}", self.endpoint),
            }),
        }
    }

    /// Removes `path` with `rm`, falling back to `runscript del` when `rm`
    /// reports an error.
    pub async fn delete_file(&self, path: &str) -> Result<ExecutionOutcome> {
        let outcome = self.run_command("rm", Some(path), None).await?;
        if !outcome.is_error() {
            return Ok(outcome);
        }
        tracing::debug!(endpoint_id = %self.endpoint.id, path, "rm failed, retrying with del");
        self.run_script(&format!("del {path}")).await
    }

    /// Process listing from `wmic process`. Windows only.
    pub async fn get_processes(&self) -> Result<String> {
        self.windows_script("get_processes", "wmic process").await
    }

    /// Connection table from `netstat -a`. Windows only.
    pub async fn get_netstat(&self) -> Result<String> {
        self.windows_script("get_netstat", "netstat -a").await
    }

    async fn windows_script(&self, operation: &str, script: &str) -> Result<String> {
        require_windows(&self.endpoint, operation)?;
        let outcome = self.run_script(script).await?;
        outcome.raise_on_error()?;
        Ok(outcome.stdout().unwrap_or_default().to_string())
    }

    pub async fn close(&mut self) {
        self.session.close().await;
    }
}

fn require_windows(endpoint: &Endpoint, operation: &str) -> Result<()> {
    if endpoint.is_windows() {
        return Ok(());
    }
    Err(FalconError::Unsupported {
        operation: operation.to_string(),
        endpoint: endpoint.to_string(),
    })
}
