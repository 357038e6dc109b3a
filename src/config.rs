//! Runtime configuration for RTR operations.
//!
//! Every field has a default, so an empty or missing file is valid. In TOML,
//! durations are whole seconds and a command poll deadline of `0` means
//! "wait indefinitely":
//!
//! ```toml
//! base_url = "https://api.us-2.crowdstrike.com/"
//! staging_dir = "/var/tmp/falcon-rtr"
//! command_poll_min_secs = 5
//! command_poll_max_secs = 10
//! command_poll_deadline_secs = 14400
//! file_poll_deadline_secs = 600
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::DEFAULT_BASE_URL;
use crate::error::{FalconError, Result};
use crate::poll::PollConfig;
use crate::retrieval::FileRetriever;
use crate::session::DEFAULT_QUOTING_MARKER;

/// Seconds passed as `-Timeout=` to `runscript`.
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 3600;

/// On-disk representation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    base_url: String,
    staging_dir: Option<PathBuf>,
    quoting_marker: String,
    script_timeout_secs: u64,
    command_poll_min_secs: u64,
    command_poll_max_secs: u64,
    command_poll_deadline_secs: u64,
    file_poll_min_secs: u64,
    file_poll_max_secs: u64,
    file_poll_deadline_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        let command = PollConfig::command_default();
        let files = PollConfig::file_listing_default();
        FileConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            staging_dir: None,
            quoting_marker: DEFAULT_QUOTING_MARKER.to_string(),
            script_timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            command_poll_min_secs: command.min_delay.as_secs(),
            command_poll_max_secs: command.max_delay.as_secs(),
            command_poll_deadline_secs: command.deadline.map_or(0, |d| d.as_secs()),
            file_poll_min_secs: files.min_delay.as_secs(),
            file_poll_max_secs: files.max_delay.as_secs(),
            file_poll_deadline_secs: files.deadline.map_or(0, |d| d.as_secs()),
        }
    }
}

/// Resolved configuration handed to the RTR operations.
#[derive(Debug, Clone)]
pub struct RtrConfig {
    pub base_url: String,
    /// Where retrieved archives are staged. Defaults to the platform temp dir.
    pub staging_dir: PathBuf,
    pub quoting_marker: String,
    pub script_timeout_secs: u64,
    pub command_poll: PollConfig,
    pub file_poll: PollConfig,
}

impl Default for RtrConfig {
    fn default() -> Self {
        RtrConfig::from_file_config(FileConfig::default())
    }
}

impl RtrConfig {
    /// Loads a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| match e {
            FalconError::Config { message } => FalconError::Config {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: FileConfig = toml::from_str(content).map_err(|e| FalconError::Config {
            message: e.to_string(),
        })?;
        check_base_url(&file.base_url)?;
        if file.command_poll_max_secs == 0 {
            return Err(FalconError::Config {
                message: "command_poll_max_secs must be at least 1".to_string(),
            });
        }
        Ok(Self::from_file_config(file))
    }

    /// Replaces the base URL, e.g. from a command-line override.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self> {
        check_base_url(base_url)?;
        self.base_url = base_url.to_string();
        Ok(self)
    }

    fn from_file_config(file: FileConfig) -> Self {
        let deadline = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        RtrConfig {
            base_url: file.base_url,
            staging_dir: file.staging_dir.unwrap_or_else(std::env::temp_dir),
            quoting_marker: file.quoting_marker,
            script_timeout_secs: file.script_timeout_secs,
            command_poll: PollConfig::new(
                Duration::from_secs(file.command_poll_min_secs),
                Duration::from_secs(file.command_poll_max_secs),
                deadline(file.command_poll_deadline_secs),
            ),
            file_poll: PollConfig::new(
                Duration::from_secs(file.file_poll_min_secs),
                Duration::from_secs(file.file_poll_max_secs),
                deadline(file.file_poll_deadline_secs),
            ),
        }
    }

    pub fn file_retriever(&self) -> FileRetriever {
        FileRetriever::new(&self.staging_dir, self.file_poll.clone())
    }
}

fn check_base_url(base_url: &str) -> Result<()> {
    if base_url.ends_with('/') {
        Ok(())
    } else {
        Err(FalconError::Config {
            message: format!("base_url must end with '/': {base_url}"),
        })
    }
}
