//! CLI entry point for falcon-rtr, a CrowdStrike Falcon Real Time Response client.
//!
//! Authenticates via OAuth2 client credentials, opens one batch RTR session
//! across every `--device-id`, then dispatches the single action selected
//! by flag. Each host's outcome is printed as one JSON line on stdout; logs
//! go to stderr (`RUST_LOG` overrides the default `info` level).
//!
//! Exit codes:
//! - 0: every host succeeded
//! - 1: runtime error, or at least one host reported a failure
//! - 2: argument validation error (clap handles this automatically)

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use falcon_rtr::auth::TokenProvider;
use falcon_rtr::batch::{BatchOperations, HostAction};
use falcon_rtr::client::FalconClient;
use falcon_rtr::config::RtrConfig;
use falcon_rtr::error::Result;
use falcon_rtr::outcome::ExecutionOutcome;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Falcon agent id (AID) to target. Repeat for a batch.
    #[arg(long = "device-id", required = true)]
    device_ids: Vec<String>,

    /// Falcon API client id.
    #[arg(long)]
    client_id: String,

    /// Falcon API client secret. Prefer setting via the FALCON_CLIENT_SECRET
    /// environment variable to keep it out of process listings and shell
    /// history.
    #[arg(long, env = "FALCON_CLIENT_SECRET")]
    secret: String,

    /// API base URL for another Falcon cloud (e.g. https://api.us-2.crowdstrike.com/).
    #[arg(long)]
    base_url: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Remote file path (required for -g and -e).
    #[arg(long)]
    file: Option<String>,

    /// Directory retrieved files are written to (used with -g).
    #[arg(long)]
    output: Option<PathBuf>,

    /// RTR base command to run (used with -r unless --script is given).
    #[arg(long)]
    command: Option<String>,

    /// Arguments to the base command. Allows leading hyphens since RTR
    /// switches use that syntax.
    #[arg(long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Raw script text to run through `runscript` (used with -r).
    #[arg(long, allow_hyphen_values = true)]
    script: Option<String>,

    /// Command timeout in seconds, appended as `-Timeout=`.
    #[arg(long)]
    timeout: Option<u64>,

    #[command(flatten)]
    actions: ActionFlags,
}

/// Action flags: exactly one must be set per invocation.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct ActionFlags {
    /// Collect --file from every host.
    #[arg(short)]
    get: bool,

    /// Run --command (with --args) or --script on every host.
    #[arg(short)]
    run: bool,

    /// Check whether --file exists on every host.
    #[arg(short)]
    exists: bool,

    /// Apply a host lifecycle action: isolate, lift_isolation, hide_host,
    /// unhide_host, suppress_detections, unsuppress_detections.
    #[arg(long)]
    action: Option<HostAction>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();
    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the operation ran but some host failed.
async fn run(args: Cli) -> Result<bool> {
    // Semantic requirements clap's group can't express, since the value
    // flags are shared across actions.
    if (args.actions.get || args.actions.exists) && args.file.is_none() {
        eprintln!("Error: --file is required when using -g or -e");
        return Ok(false);
    }
    if args.actions.run && args.command.is_none() && args.script.is_none() {
        eprintln!("Error: --command or --script is required when using -r");
        return Ok(false);
    }

    let mut config = match &args.config {
        Some(path) => RtrConfig::load(path)?,
        None => RtrConfig::default(),
    };
    if let Some(url) = &args.base_url {
        config = config.with_base_url(url)?;
    }

    let tp = TokenProvider::new(&config.base_url, &args.client_id, &args.secret);
    let client = Arc::new(FalconClient::with_base_url(tp, &config.base_url)?);
    let mut batch = BatchOperations::open(Arc::clone(&client), &args.device_ids, &config).await?;

    let result = dispatch(&batch, &args).await;
    batch.close().await;
    client.close().await;
    result
}

async fn dispatch(batch: &BatchOperations, args: &Cli) -> Result<bool> {
    let file = args.file.as_deref().unwrap_or_default();

    if args.actions.exists {
        let mut all_present = true;
        for (endpoint_id, exists) in batch.file_exists(file).await {
            println!("{}", serde_json::json!({ "endpoint_id": endpoint_id, "exists": exists }));
            all_present &= exists;
        }
        return Ok(all_present);
    }

    let outcomes = if args.actions.get {
        let outcomes = batch.get_file(file).await?;
        if let Some(dir) = &args.output {
            save_retrieved(dir, file, &outcomes)?;
        }
        outcomes
    } else if args.actions.run {
        match (&args.script, &args.command) {
            (Some(script), _) => batch.run_script(script).await,
            (None, Some(command)) => {
                batch
                    .run_command(command, args.args.as_deref(), args.timeout)
                    .await
            }
            (None, None) => Vec::new(),
        }
    } else if let Some(action) = args.actions.action {
        batch.perform_action(action).await?
    } else {
        // Unreachable: clap enforces exactly one action flag.
        eprintln!("Error: no action flag provided");
        return Ok(false);
    };

    for outcome in &outcomes {
        println!("{}", serde_json::to_string(outcome)?);
    }
    Ok(outcomes.iter().all(|o| !o.is_error()))
}

/// Writes each host's payload to `<dir>/<endpoint_id>_<file name>`.
fn save_retrieved(dir: &Path, remote_path: &str, outcomes: &[ExecutionOutcome]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let name = local_file_name(remote_path);
    for outcome in outcomes.iter().filter(|o| o.has_content()) {
        let target = dir.join(format!("{}_{name}", outcome.endpoint_id()));
        outcome.write_content_to_file(&target)?;
        tracing::info!(endpoint_id = outcome.endpoint_id(), path = %target.display(), "saved retrieved file");
    }
    Ok(())
}

/// Last component of a Windows or POSIX remote path.
fn local_file_name(remote_path: &str) -> &str {
    remote_path
        .rsplit(['\\', '/'])
        .find(|part| !part.is_empty())
        .unwrap_or("retrieved")
}
