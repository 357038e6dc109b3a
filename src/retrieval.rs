//! Retrieval of files collected with the RTR `get` command.
//!
//! After a `get` completes, the collected file shows up in the session's
//! file list keyed by the command's cloud request id. Retrieval then runs:
//!
//! 1. **Locate**: poll `ListFiles` until an entry with the matching cloud
//!    request id appears, and take its SHA-256.
//! 2. **Download**: fetch `GetExtractedFileContents` for that hash. The
//!    vendor wraps the file in a zip protected with the fixed, publicly
//!    documented password `infected` so the payload is never executed by
//!    accident on the analyst's machine.
//! 3. **Extract**: write the archive into `<staging_dir>/<cloud_request_id>/`,
//!    unpack its first entry there, read it into memory, and remove the
//!    whole per-request directory whatever the result.
//!
//! A download answered with an error object is a [`Retrieval::Rejected`]
//! value, so a batch can record it against one host and carry on. A corrupt
//! archive is an error.

use bytes::Bytes;
use serde::Deserialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use zip::ZipArchive;
use zip::result::ZipError;

use crate::client::{Download, FalconClient};
use crate::envelope::ApiResponse;
use crate::error::{FalconError, Result};
use crate::poll::{Backoff, PollConfig};

const LIST_FILES_PATH: &str = "real-time-response/entities/file/v1";
const EXTRACTED_FILE_PATH: &str = "real-time-response/entities/extracted-file-contents/v1";

/// Password on every archive served by `GetExtractedFileContents`.
pub const ARCHIVE_PASSWORD: &[u8] = b"infected";

/// One entry of a session's collected-file list.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionFile {
    #[serde(default)]
    pub cloud_request_id: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

/// Result of a retrieval that reached the download step.
#[derive(Debug)]
pub enum Retrieval {
    /// The extracted payload.
    Content(Bytes),
    /// The vendor answered the download with an error object.
    Rejected(String),
}

/// Removes a per-request staging directory when dropped.
struct StagingDir(PathBuf);

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.0.display(), error = %e, "failed to clean staging directory");
            }
        }
    }
}

fn staging_name(cloud_request_id: &str) -> String {
    cloud_request_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Unpacks the first entry of a vendor archive via the staging area.
///
/// Everything written under `staging_dir` is removed before returning,
/// on success and on every error path.
pub fn extract_archive(staging_dir: &Path, cloud_request_id: &str, archive: &[u8]) -> Result<Bytes> {
    let name = staging_name(cloud_request_id);
    let work_dir = staging_dir.join(&name);
    std::fs::create_dir_all(&work_dir)?;
    let _cleanup = StagingDir(work_dir.clone());

    let archive_path = work_dir.join(format!("{name}.zip"));
    std::fs::write(&archive_path, archive)?;

    let mut zip = ZipArchive::new(File::open(&archive_path)?)?;
    if zip.is_empty() {
        return Err(ZipError::FileNotFound.into());
    }
    let encrypted = zip.by_index_raw(0)?.encrypted();
    let mut entry = if encrypted {
        zip.by_index_decrypt(0, ARCHIVE_PASSWORD)?
    } else {
        zip.by_index(0)?
    };

    let member = entry.enclosed_name().map(|p| p.to_path_buf()).ok_or_else(|| {
        FalconError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("archive member '{}' escapes the staging directory", entry.name()),
        ))
    })?;
    let payload_path = work_dir.join(&member);
    if let Some(parent) = payload_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let mut out = File::create(&payload_path)?;
        io::copy(&mut entry, &mut out)?;
    }
    drop(entry);

    let data = std::fs::read(&payload_path)?;
    Ok(Bytes::from(data))
}

/// Drives locate, download and extract for one `get` command.
#[derive(Debug, Clone)]
pub struct FileRetriever {
    staging_dir: PathBuf,
    list_poll: PollConfig,
}

impl FileRetriever {
    pub fn new(staging_dir: impl Into<PathBuf>, list_poll: PollConfig) -> Self {
        FileRetriever {
            staging_dir: staging_dir.into(),
            list_poll,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Polls the session file list until the file produced by
    /// `cloud_request_id` appears, returning its SHA-256.
    pub async fn locate(&self, client: &FalconClient, session_id: &str, cloud_request_id: &str) -> Result<String> {
        let started = Instant::now();
        let mut backoff = Backoff::new(&self.list_poll);

        loop {
            let resp: ApiResponse<Vec<SessionFile>> =
                client.get(LIST_FILES_PATH, &[("session_id", session_id)]).await?;
            if !resp.status.is_success() {
                return Err(FalconError::Vendor {
                    status: resp.status,
                    errors: resp.body.errors,
                });
            }

            let found = resp
                .body
                .resources
                .into_iter()
                .find(|f| f.cloud_request_id.as_deref() == Some(cloud_request_id))
                .and_then(|f| f.sha256)
                .filter(|sha| !sha.is_empty());
            if let Some(sha256) = found {
                return Ok(sha256);
            }

            self.list_poll
                .check_deadline(started, &format!("file listing for {cloud_request_id}"))?;
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    /// Downloads the vendor archive for `sha256`.
    pub async fn download(&self, client: &FalconClient, session_id: &str, sha256: &str, filename: &str) -> Result<Download> {
        client
            .download(
                EXTRACTED_FILE_PATH,
                &[("session_id", session_id), ("sha256", sha256), ("filename", filename)],
            )
            .await
    }

    /// Unpacks a downloaded archive off the async runtime.
    pub async fn extract_payload(&self, cloud_request_id: &str, archive: Bytes) -> Result<Bytes> {
        let staging_dir = self.staging_dir.clone();
        let cloud_request_id = cloud_request_id.to_string();
        tokio::task::spawn_blocking(move || extract_archive(&staging_dir, &cloud_request_id, &archive))
            .await
            .map_err(|e| FalconError::Io(io::Error::other(e)))?
    }

    /// Locate, download and extract the file produced by a completed `get`.
    pub async fn retrieve(&self, client: &FalconClient, session_id: &str, cloud_request_id: &str) -> Result<Retrieval> {
        let sha256 = self.locate(client, session_id, cloud_request_id).await?;
        let filename = format!("{}.zip", staging_name(cloud_request_id));

        match self.download(client, session_id, &sha256, &filename).await? {
            Download::Content(archive) => {
                let payload = self.extract_payload(cloud_request_id, archive).await?;
                tracing::debug!(cloud_request_id, bytes = payload.len(), "retrieved file");
                Ok(Retrieval::Content(payload))
            }
            Download::Rejected { status, detail } => {
                tracing::warn!(cloud_request_id, %status, "file download rejected: {detail}");
                Ok(Retrieval::Rejected(format!("HTTP {status}: {detail}")))
            }
        }
    }
}
