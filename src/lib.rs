//! Async Rust client library for CrowdStrike Falcon Real Time Response (RTR).
//!
//! Runs shell commands, scripts and file collection on one or many managed
//! hosts through the Falcon REST API, and applies host lifecycle actions
//! (network isolation, hiding, detection suppression) in bulk. Every batch
//! operation returns exactly one [`ExecutionOutcome`](outcome::ExecutionOutcome)
//! per host, in submission order.
//!
//! # Modules
//!
//! - [`auth`]: OAuth2 client credentials token provider with freshness tracking.
//! - [`client`]: Authenticated HTTP wrapper returning vendor envelopes.
//! - [`envelope`]: Falcon response envelope types.
//! - [`error`]: Typed error hierarchy (`FalconError`).
//! - [`config`]: TOML-loadable runtime configuration.
//! - [`poll`]: Jittered backoff and the command completion poller.
//! - [`session`]: RTR session lifecycle and command submission.
//! - [`retrieval`]: Locate, download and unpack files collected with `get`.
//! - [`outcome`]: Per-host result record.
//! - [`batch`]: Multi-host orchestration and lifecycle actions.
//! - [`host`]: Single-host operations that fail loudly.
//! - [`endpoint`]: Host identity and platform.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use falcon_rtr::auth::TokenProvider;
//! use falcon_rtr::batch::BatchOperations;
//! use falcon_rtr::client::{DEFAULT_BASE_URL, FalconClient};
//! use falcon_rtr::config::RtrConfig;
//!
//! let tp = TokenProvider::new(DEFAULT_BASE_URL, "client_id", "secret");
//! let client = Arc::new(FalconClient::new(tp)?);
//! let hosts = vec!["aid-1".to_string(), "aid-2".to_string()];
//! let mut batch = BatchOperations::open(client, &hosts, &RtrConfig::default()).await?;
//! for outcome in batch.run_command("ls", Some("C:\\Windows\\Temp"), None).await {
//!     println!("{}: {:?}", outcome.endpoint_id(), outcome.stdout());
//! }
//! batch.close().await;
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod host;
pub mod outcome;
pub mod poll;
pub mod retrieval;
pub mod session;
