//! Polling policy and the RTR completion poller.
//!
//! RTR commands execute asynchronously: submission returns a cloud request
//! id and the caller polls `CheckAdminCommandStatus` until the vendor marks
//! the execution `complete`. Per cloud request id the poller runs
//!
//! ```text
//! PENDING --poll--> PENDING | COMPLETE | FAILED
//! ```
//!
//! The delay between polls is jittered and grows exponentially inside
//! `[min_delay, max_delay]`. An optional deadline bounds the whole wait and
//! surfaces as [`FalconError::PollTimeout`], distinct from a vendor-reported
//! failure. A `None` deadline waits indefinitely.

use rand::Rng;
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::client::FalconClient;
use crate::envelope::ApiResponse;
use crate::error::{FalconError, Result};

pub(crate) const ADMIN_COMMAND_PATH: &str = "real-time-response/entities/admin-command/v1";

// ── Polling configuration ────────────────────────────────────────────

/// Controls the cadence and bound of a polling loop.
///
/// Use [`PollConfig::command_default`] for command completion and
/// [`PollConfig::file_listing_default`] for waiting on a retrieved file to
/// show up in the session's file list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Lower bound of the first delay.
    pub min_delay: Duration,
    /// Upper bound of every delay.
    pub max_delay: Duration,
    /// Maximum total time to spend polling, measured from the first poll.
    /// `None` polls until the vendor answers.
    pub deadline: Option<Duration>,
}

impl PollConfig {
    /// Creates a config. `max_delay` is raised to `min_delay` if smaller.
    pub fn new(min_delay: Duration, max_delay: Duration, deadline: Option<Duration>) -> Self {
        PollConfig {
            min_delay,
            max_delay: max_delay.max(min_delay),
            deadline,
        }
    }

    /// 5 to 10 seconds between polls, four hour deadline. Remote scripts
    /// submitted with `-Timeout=3600` fit comfortably.
    pub fn command_default() -> Self {
        PollConfig::new(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Some(Duration::from_secs(4 * 60 * 60)),
        )
    }

    /// 1 to 5 seconds between polls, ten minute deadline.
    pub fn file_listing_default() -> Self {
        PollConfig::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Some(Duration::from_secs(10 * 60)),
        )
    }

    /// Same cadence, no deadline.
    pub fn unbounded(mut self) -> Self {
        self.deadline = None;
        self
    }

    pub(crate) fn check_deadline(&self, started: Instant, target: &str) -> Result<()> {
        match self.deadline {
            Some(deadline) if started.elapsed() > deadline => Err(FalconError::PollTimeout {
                elapsed: started.elapsed(),
                target: target.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig::command_default()
    }
}

/// Jittered exponential backoff over a [`PollConfig`].
///
/// Attempt `n` sleeps a uniform random duration in `[floor, max_delay]`,
/// where the floor is `min_delay * 2^n` capped at half of `max_delay` and
/// never below `min_delay`. Delays stay randomized after the floor stops
/// growing.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a PollConfig,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(config: &'a PollConfig) -> Self {
        Backoff { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let max = self.config.max_delay;
        let floor = self
            .config
            .min_delay
            .saturating_mul(factor)
            .min(max / 2)
            .max(self.config.min_delay);
        let lo = floor.as_millis() as u64;
        let hi = max.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}

// ── Completion poller ────────────────────────────────────────────────

/// One execution record from `CheckAdminCommandStatus`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandStatus {
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub base_command: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Captured output of a completed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCompletion {
    pub cloud_request_id: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Polls a cloud request until the vendor reports it complete.
///
/// stdout/stderr are last-write-wins across every execution record seen,
/// never concatenated.
///
/// # Errors
///
/// - `FalconError::Vendor`: completion was observed with a non-success
///   status; carries every vendor error pair.
/// - `FalconError::PollTimeout`: the configured deadline passed.
/// - `FalconError::Network` / `FalconError::Auth` / `FalconError::Api`:
///   a poll request itself failed.
pub async fn poll_command(
    client: &FalconClient,
    cloud_request_id: &str,
    config: &PollConfig,
) -> Result<CommandCompletion> {
    let started = Instant::now();
    let mut backoff = Backoff::new(config);
    let mut stdout = None;
    let mut stderr = None;

    loop {
        tokio::time::sleep(backoff.next_delay()).await;
        config.check_deadline(started, cloud_request_id)?;

        let resp: ApiResponse<Vec<CommandStatus>> = client
            .get(
                ADMIN_COMMAND_PATH,
                &[("cloud_request_id", cloud_request_id), ("sequence_id", "0")],
            )
            .await?;

        // A failed status with no execution record cannot make progress.
        let complete = match resp.body.resources.first() {
            Some(record) => record.complete,
            None => !resp.status.is_success(),
        };

        if complete && !resp.status.is_success() {
            return Err(FalconError::Vendor {
                status: resp.status,
                errors: resp.body.errors,
            });
        }

        for execution in resp.body.resources {
            if execution.stdout.is_some() {
                stdout = execution.stdout;
            }
            if execution.stderr.is_some() {
                stderr = execution.stderr;
            }
        }

        if complete {
            tracing::debug!(cloud_request_id, elapsed = ?started.elapsed(), "command complete");
            return Ok(CommandCompletion {
                cloud_request_id: cloud_request_id.to_string(),
                stdout,
                stderr,
            });
        }
        tracing::debug!(cloud_request_id, "command still running");
    }
}
