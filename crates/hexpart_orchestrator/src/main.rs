mod config;
mod metrics;
mod runner;

use crate::config::{Cli, Command, RunArgs, StateArgs};
use crate::metrics::Metrics;
use crate::runner::{JobRun, LocalRunner, RunnerConfig};
use anyhow::{bail, Context};
use clap::Parser;
use hexpart::{
    Escalation, FailureStore, JobSpec, ManifestStatusProvider, TierConfig, TierEscalator,
    Transition,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Init { completions } => init(&cli.state, *completions),
        Command::Escalate { tier } => escalate(&cli.state, *tier),
        Command::Render { tier } => render(&cli.state, *tier),
        Command::Run(args) => run(&cli.state, args).await,
    }
}

fn init(state: &StateArgs, completions: u64) -> anyhow::Result<()> {
    let config = state.tier_config()?;
    let store = state.store();
    let status = state.status_provider();
    let submitter = state.submitter()?;
    let escalator = TierEscalator::new(&config, &store, &status, &submitter);

    let transition = escalator.init(completions).context("Failed to submit tier 0")?;
    print_transition(&transition);
    Ok(())
}

fn escalate(state: &StateArgs, tier: u32) -> anyhow::Result<()> {
    let config = state.tier_config()?;
    let store = state.store();
    let status = state.status_provider();
    let submitter = state.submitter()?;
    let escalator = TierEscalator::new(&config, &store, &status, &submitter);

    let step = escalator
        .escalate(tier)
        .with_context(|| format!("Failed to escalate tier {tier}"))?;
    print_escalation(&step, &store);
    Ok(())
}

fn render(state: &StateArgs, tier: u32) -> anyhow::Result<()> {
    let spec: JobSpec = state
        .store()
        .read_job(tier)?
        .with_context(|| format!("No job recorded for tier {tier}"))?;
    let manifest = state.manifest_template()?.render(&spec)?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

/// Runs tiers locally until nothing fails, the ladder is exhausted or a
/// shutdown signal arrives. Picks up at the latest recorded tier.
async fn run(state: &StateArgs, args: &RunArgs) -> anyhow::Result<()> {
    let config = state.tier_config()?;
    let store = state.store();
    let status = state.status_provider();
    let submitter = state.submitter()?;
    let escalator = TierEscalator::new(&config, &store, &status, &submitter);

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
    if let Some(addr) = args.metrics_listen_addr {
        let router = metrics.router();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!(%addr, "Serving metrics");
            axum::serve(listener, router.into_make_service()).await?;
            Ok::<(), anyhow::Error>(())
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received. Terminating workers...");
        // The drop of the sender will cause all receivers to receive the shutdown signal.
        drop(shutdown_tx);
    });

    let mut worker_args = vec!["chunk".to_string()];
    worker_args.extend(args.worker_args.iter().cloned());
    let runner = LocalRunner::new(
        RunnerConfig {
            program: args.worker_binary.clone(),
            args: worker_args,
            backoff: args.backoff(),
            kill_grace: args.kill_grace(),
        },
        metrics.clone(),
    );

    let mut next = match resume_point(&config, &store, &status, args.completions)? {
        Resume::Run(spec) => Transition::Next(spec),
        Resume::Escalate(tier) => {
            let step = escalator.escalate(tier)?;
            print_escalation(&step, &store);
            step.transition
        }
        Resume::Fresh => {
            let transition = escalator.init(args.completions)?;
            print_transition(&transition);
            transition
        }
    };

    loop {
        let spec = match next {
            Transition::Next(spec) => spec,
            Transition::Complete => return Ok(()),
            Transition::Exhausted => bail!("failures remain after the last configured tier"),
        };
        let level = spec.tier.level;
        metrics.start_tier(level);

        let job_status = match runner.run_job(&spec, shutdown_rx.clone()).await? {
            JobRun::Finished(job_status) => job_status,
            JobRun::Interrupted => {
                println!("tier {level} interrupted; run again to resume it");
                return Ok(());
            }
        };
        status
            .record(&job_status)
            .with_context(|| format!("Failed to record status of {}", spec.job_name))?;

        let step = escalator.escalate(level)?;
        print_escalation(&step, &store);
        next = step.transition;
    }
}

enum Resume {
    /// Nothing recorded yet.
    Fresh,
    /// The job of this tier is recorded but has not run to completion.
    Run(JobSpec),
    /// The job of this tier already finished; only escalation is left.
    Escalate(u32),
}

fn resume_point(
    config: &TierConfig,
    store: &FailureStore,
    status: &ManifestStatusProvider,
    completions: u64,
) -> anyhow::Result<Resume> {
    let mut latest = None;
    for tier in &config.tiers {
        let Some(spec) = store.read_job::<JobSpec>(tier.level)? else {
            break;
        };
        if tier.level == 0 && spec.completions != completions {
            bail!(
                "tier 0 in {} has {} completions, not {completions}; use a fresh state directory",
                store.dir().display(),
                spec.completions
            );
        }
        latest = Some(spec);
    }
    let Some(spec) = latest else {
        return Ok(Resume::Fresh);
    };

    tracing::info!(job = %spec.job_name, tier = spec.tier.level, "Resuming from recorded tier");

    if store.read_failures(spec.tier.level)?.is_some() || status.path_for(&spec.job_name).exists() {
        Ok(Resume::Escalate(spec.tier.level))
    } else {
        Ok(Resume::Run(spec))
    }
}

fn print_transition(transition: &Transition) {
    match transition {
        Transition::Next(spec) => {
            println!(
                "submitted {} (tier {}, {} completions, parallelism {}, memory {}, cpu {})",
                spec.job_name,
                spec.tier.level,
                spec.completions,
                spec.parallelism,
                spec.tier.memory,
                spec.tier.cpu
            );
            if let Some(mapping) = &spec.index_mapping {
                println!("  completion index -> original index: {:?}", mapping.as_slice());
            }
        }
        Transition::Complete => println!("complete: no failed units remain"),
        Transition::Exhausted => println!("exhausted: failures remain and no higher tier is configured"),
    }
}

fn print_escalation(step: &Escalation, store: &FailureStore) {
    match &step.status {
        Some(status) => println!(
            "tier {}: {} succeeded, {} failed",
            step.completed_tier,
            status.succeeded.len(),
            status.failed.len()
        ),
        None => println!(
            "tier {}: {} failed (from recorded failures)",
            step.completed_tier,
            step.failed.len()
        ),
    }
    if !step.failed.is_empty() {
        println!("  failed original indices: {:?}", step.failed);
    }
    println!(
        "  failed indices file: {}",
        store.failed_indices_path(step.completed_tier).display()
    );
    print_transition(&step.transition);
}

/// Listens for OS shutdown signals (SIGINT, SIGTERM) and resolves when one is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
