use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hexpart::{FailureStore, ManifestStatusProvider, ManifestSubmitter, ManifestTemplate, TierConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// `hexpart-orchestrator` - drives indexed tiling jobs through increasing
/// resource tiers until no unit fails or no tier is left.
///
/// All state lives in plain files, so any step can be re-run after a crash:
/// `failed_indices_tier{N}.json` and `job_tier{N}.json` in the state
/// directory, job specs and manifests in the jobs directory, and scheduler
/// status documents (`<job>.status.json`) in the status directory.
#[derive(Parser, Debug)]
#[command(name = "hexpart-orchestrator", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub state: StateArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write and submit the dense tier 0 job.
    Init {
        /// Number of work units (completions) of the plan.
        #[arg(long)]
        completions: u64,
    },
    /// Record the failures of a completed tier and submit the next one.
    Escalate {
        /// The completed tier.
        #[arg(long)]
        tier: u32,
    },
    /// Print the scheduler manifest of a recorded tier.
    Render {
        #[arg(long)]
        tier: u32,
    },
    /// Run every tier locally, one worker process per completion index.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct StateArgs {
    #[arg(long, global = true, env = "HEXPART_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    #[arg(long, global = true, env = "HEXPART_JOBS_DIR", default_value = "jobs")]
    pub jobs_dir: PathBuf,

    #[arg(long, global = true, env = "HEXPART_STATUS_DIR", default_value = "status")]
    pub status_dir: PathBuf,

    /// Tier ladder as JSON; the built-in 4Gi -> 32Gi ladder when absent.
    #[arg(long, global = true, env = "HEXPART_TIER_CONFIG")]
    pub tier_config: Option<PathBuf>,

    /// Manifest template (image, namespace, command, env) as JSON.
    #[arg(long, global = true, env = "HEXPART_MANIFEST_TEMPLATE")]
    pub manifest_template: Option<PathBuf>,
}

impl StateArgs {
    pub fn tier_config(&self) -> Result<TierConfig> {
        match &self.tier_config {
            Some(path) => TierConfig::load(path)
                .with_context(|| format!("Failed to load tier config {}", path.display())),
            None => Ok(TierConfig::default()),
        }
    }

    pub fn manifest_template(&self) -> Result<ManifestTemplate> {
        match &self.manifest_template {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read manifest template {}", path.display()))?;
                serde_json::from_str(&text).context("Failed to parse manifest template")
            }
            None => Ok(ManifestTemplate::default()),
        }
    }

    pub fn store(&self) -> FailureStore {
        FailureStore::new(&self.state_dir)
    }

    pub fn status_provider(&self) -> ManifestStatusProvider {
        ManifestStatusProvider::new(&self.status_dir)
    }

    pub fn submitter(&self) -> Result<ManifestSubmitter> {
        Ok(ManifestSubmitter::new(&self.jobs_dir, self.manifest_template()?))
    }
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Number of work units (completions) of the plan.
    #[arg(long)]
    pub completions: u64,

    /// Worker executable, run as `<worker> chunk <worker-args>`.
    #[arg(long, env = "HEXPART_WORKER_BINARY", default_value = "hexpart-worker")]
    pub worker_binary: String,

    /// Extra arguments for every worker (dataset, `plan`'s id column and chunk size, ...).
    #[arg(long = "worker-arg", allow_hyphen_values = true)]
    pub worker_args: Vec<String>,

    /// Base delay between attempts of the same index; doubles per attempt.
    #[arg(long, env = "HEXPART_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub backoff_ms: u64,

    /// Grace period between SIGTERM and SIGKILL on shutdown.
    #[arg(long, default_value_t = 5)]
    pub kill_grace_secs: u64,

    /// Serve Prometheus metrics on this address while running.
    #[arg(long, env = "HEXPART_METRICS_LISTEN_ADDR")]
    pub metrics_listen_addr: Option<SocketAddr>,
}

impl RunArgs {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
