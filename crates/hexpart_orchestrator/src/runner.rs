use crate::metrics::Metrics;
use anyhow::{Context, Result};
use hexpart::manifest::{ENV_COMPLETION_INDEX, ENV_INDEX_MAPPING, ENV_RETRY_TIER, OOM_EXIT_CODE};
use hexpart::{JobSpec, JobStatus};
use std::collections::BTreeSet;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    process::{Child, Command},
    sync::{watch, Semaphore},
    task::JoinSet,
    time::sleep,
};

/// How worker processes are started and stopped.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    /// Full argument list; the unit itself is selected through the environment.
    pub args: Vec<String>,
    /// Delay before the second attempt of an index; doubled for every later one.
    pub backoff: Duration,
    pub kill_grace: Duration,
}

/// What became of a locally executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRun {
    Finished(JobStatus),
    /// Shutdown was requested before every index settled.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexOutcome {
    Succeeded,
    Failed,
    Interrupted,
}

enum Attempt {
    Exited(ExitStatus),
    Interrupted,
}

/// Executes an indexed job on this machine, one worker process per
/// completion index, with the same per-index retry and fail-fast rules the
/// batch scheduler applies to the rendered manifest.
pub struct LocalRunner {
    config: RunnerConfig,
    metrics: Arc<Metrics>,
}

impl LocalRunner {
    pub fn new(config: RunnerConfig, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self { config, metrics })
    }

    pub async fn run_job(self: &Arc<Self>, spec: &JobSpec, shutdown_rx: watch::Receiver<()>) -> Result<JobRun> {
        let mapping = spec
            .index_mapping
            .as_ref()
            .map(|m| m.to_json())
            .transpose()
            .context("Failed to encode index mapping")?;
        let parallelism = usize::try_from(spec.parallelism.max(1)).unwrap_or(usize::MAX);
        let completions =
            u32::try_from(spec.completions).context("Job has more completions than indices")?;
        let permits = Arc::new(Semaphore::new(parallelism));
        let spec = Arc::new(spec.clone());
        let mapping = Arc::new(mapping);

        tracing::info!(
            job = %spec.job_name,
            completions,
            parallelism,
            memory = %spec.tier.memory,
            cpu = %spec.tier.cpu,
            "Starting job"
        );

        let mut tasks = JoinSet::new();
        for index in 0..completions {
            let runner = self.clone();
            let spec = spec.clone();
            let mapping = mapping.clone();
            let permits = permits.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, IndexOutcome::Interrupted);
                };
                let outcome = runner
                    .run_index(&spec, mapping.as_deref(), index, shutdown_rx)
                    .await;
                (index, outcome)
            });
        }

        let mut succeeded = BTreeSet::new();
        let mut interrupted = false;
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined.context("Index task panicked")?;
            match outcome {
                IndexOutcome::Succeeded => {
                    succeeded.insert(index);
                }
                IndexOutcome::Failed => {}
                IndexOutcome::Interrupted => interrupted = true,
            }
        }

        if interrupted {
            tracing::warn!(job = %spec.job_name, "Job interrupted before every index settled");
            return Ok(JobRun::Interrupted);
        }
        Ok(JobRun::Finished(JobStatus::from_succeeded(
            &spec.job_name,
            spec.completions,
            succeeded,
        )))
    }

    /// Runs one index until it succeeds, hits the OOM exit code or uses up its retries.
    async fn run_index(
        &self,
        spec: &JobSpec,
        mapping: Option<&str>,
        index: u32,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> IndexOutcome {
        let attempts = spec.backoff_limit_per_index.saturating_add(1);
        let mut delay = self.config.backoff;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => return IndexOutcome::Interrupted,
                }
                delay = delay.saturating_mul(2);
            }

            self.metrics.unit_attempts_total.inc();
            self.metrics.units_running.inc();
            let result = self.attempt(spec, mapping, index, &mut shutdown_rx).await;
            self.metrics.units_running.dec();

            match result {
                Ok(Attempt::Exited(status)) if status.success() => {
                    tracing::debug!(job = %spec.job_name, index, attempt, "Index succeeded");
                    self.metrics.units_succeeded_total.inc();
                    return IndexOutcome::Succeeded;
                }
                Ok(Attempt::Exited(status)) if out_of_memory(&status) => {
                    tracing::warn!(job = %spec.job_name, index, attempt, exit_status = %status, "Worker ran out of memory; failing index");
                    break;
                }
                Ok(Attempt::Exited(status)) => {
                    tracing::warn!(job = %spec.job_name, index, attempt, attempts, exit_status = %status, "Worker failed");
                }
                Ok(Attempt::Interrupted) => return IndexOutcome::Interrupted,
                Err(e) => {
                    tracing::error!(job = %spec.job_name, index, attempt, error = %e, "Failed to run worker");
                }
            }
        }

        self.metrics.units_failed_total.inc();
        IndexOutcome::Failed
    }

    async fn attempt(
        &self,
        spec: &JobSpec,
        mapping: Option<&str>,
        index: u32,
        shutdown_rx: &mut watch::Receiver<()>,
    ) -> Result<Attempt> {
        if shutdown_rx.has_changed().is_err() {
            return Ok(Attempt::Interrupted);
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env(ENV_COMPLETION_INDEX, index.to_string())
            .env(ENV_RETRY_TIER, spec.tier.level.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(mapping) = mapping {
            command.env(ENV_INDEX_MAPPING, mapping);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker binary at '{}'", self.config.program))?;

        tokio::select! {
            status = child.wait() => Ok(Attempt::Exited(status.context("Failed to wait for worker")?)),
            _ = shutdown_rx.changed() => {
                self.terminate(&mut child).await;
                Ok(Attempt::Interrupted)
            }
        }
    }

    /// Stops a worker, gracefully at first, then forcefully.
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return;
        };
        tracing::debug!(pid, "Sending SIGTERM to worker process.");
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );

        tokio::select! {
            _ = sleep(self.config.kill_grace) => {
                tracing::warn!(pid, "Worker did not terminate gracefully. Sending SIGKILL.");
                if let Err(e) = child.start_kill() {
                    tracing::error!(pid, error = %e, "Failed to SIGKILL worker process.");
                }
            }
            _ = child.wait() => {
                tracing::debug!(pid, "Worker terminated gracefully.");
            }
        }
    }
}

/// Exit code 137, or death by SIGKILL as the kernel OOM killer delivers it.
fn out_of_memory(status: &ExitStatus) -> bool {
    if status.code() == Some(OOM_EXIT_CODE) {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32) {
            return true;
        }
    }
    false
}
