//! Tier escalation: retry the failed units of one tier at the next resource tier.
//!
//! `Tier(0)` is the dense initial run over `0..N`. Escalating a completed
//! `Tier(k)` persists its failed original indices before anything else, then
//! builds `Tier(k+1)` over a compact index space with an [`IndexMapping`].
//! Escalating the same tier again reads the persisted record and only
//! re-submits when the next job does not already exist. The recorded spec of
//! a submitted job is fixed; a rebuild that disagrees with it is an error.

use crate::error::{HexpartError, Result};
use crate::manifest::ManifestTemplate;
use crate::retry::{map_failures, FailureRecord, FailureStore, IndexMapping};
use crate::status::{JobStatus, JobStatusProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// One resource allocation level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTier {
    pub level: u32,
    /// Memory request/limit, e.g. `"8Gi"`.
    pub memory: String,
    /// CPU request/limit, e.g. `"2"`.
    pub cpu: String,
}

impl RetryTier {
    pub fn new(level: u32, memory: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            level,
            memory: memory.into(),
            cpu: cpu.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub tiers: Vec<RetryTier>,
    /// Retries of a single index within one tier before it counts as failed.
    pub backoff_limit_per_index: u32,
    pub max_parallelism: u64,
    pub job_name_prefix: String,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                RetryTier::new(0, "4Gi", "1"),
                RetryTier::new(1, "8Gi", "2"),
                RetryTier::new(2, "16Gi", "4"),
                RetryTier::new(3, "32Gi", "8"),
            ],
            backoff_limit_per_index: 2,
            max_parallelism: 50,
            job_name_prefix: "hexpart".to_string(),
        }
    }
}

impl TierConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Tiers must be non-empty with levels `0, 1, 2, ...` in order.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(HexpartError::InvalidConfig("at least one tier is required".into()));
        }
        for (position, tier) in self.tiers.iter().enumerate() {
            if tier.level as usize != position {
                return Err(HexpartError::InvalidConfig(format!(
                    "tier levels must increase by one from 0; found level {} at position {position}",
                    tier.level
                )));
            }
            if tier.memory.trim().is_empty() || tier.cpu.trim().is_empty() {
                return Err(HexpartError::InvalidConfig(format!(
                    "tier {} needs both memory and cpu",
                    tier.level
                )));
            }
        }
        if self.max_parallelism == 0 {
            return Err(HexpartError::InvalidConfig("max_parallelism must be > 0".into()));
        }
        validate_job_name(&self.job_name(0))?;
        Ok(())
    }

    pub fn tier(&self, level: u32) -> Option<&RetryTier> {
        self.tiers.get(level as usize)
    }

    pub fn job_name(&self, level: u32) -> String {
        format!("{}-tier{level}", self.job_name_prefix)
    }
}

/// Scheduler job names double as DNS labels.
fn validate_job_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_ends = name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric());

    if name.is_empty() || name.len() > 63 || !valid_chars || !valid_ends {
        return Err(HexpartError::JobSpec(format!(
            "'{name}' is not a valid job name (lowercase alphanumerics and '-', at most 63 chars)"
        )));
    }
    Ok(())
}

/// Everything the scheduler needs to run one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_name: String,
    pub tier: RetryTier,
    pub completions: u64,
    pub parallelism: u64,
    pub backoff_limit_per_index: u32,
    /// Absent for a dense tier whose completion indices are the logical indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_mapping: Option<IndexMapping>,
}

impl JobSpec {
    pub fn builder() -> JobSpecBuilder {
        JobSpecBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct JobSpecBuilder {
    job_name: Option<String>,
    tier: Option<RetryTier>,
    completions: Option<u64>,
    max_parallelism: Option<u64>,
    backoff_limit_per_index: u32,
    index_mapping: Option<IndexMapping>,
}

impl JobSpecBuilder {
    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn tier(mut self, tier: RetryTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn completions(mut self, completions: u64) -> Self {
        self.completions = Some(completions);
        self
    }

    /// Upper bound on parallelism; the job runs `min(max, completions)` at once.
    pub fn max_parallelism(mut self, max: u64) -> Self {
        self.max_parallelism = Some(max);
        self
    }

    pub fn backoff_limit_per_index(mut self, limit: u32) -> Self {
        self.backoff_limit_per_index = limit;
        self
    }

    pub fn index_mapping(mut self, mapping: IndexMapping) -> Self {
        self.index_mapping = Some(mapping);
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        let job_name = self
            .job_name
            .ok_or_else(|| HexpartError::JobSpec("job name is required".into()))?;
        validate_job_name(&job_name)?;
        let tier = self
            .tier
            .ok_or_else(|| HexpartError::JobSpec("resource tier is required".into()))?;
        let completions = self
            .completions
            .ok_or_else(|| HexpartError::JobSpec("completions is required".into()))?;
        if completions == 0 {
            return Err(HexpartError::JobSpec("a job needs at least one completion".into()));
        }
        let max_parallelism = self.max_parallelism.unwrap_or(completions);
        if max_parallelism == 0 {
            return Err(HexpartError::JobSpec("parallelism must be > 0".into()));
        }
        if let Some(mapping) = &self.index_mapping {
            if mapping.len() as u64 != completions {
                return Err(HexpartError::JobSpec(format!(
                    "index mapping has {} entries for {completions} completions",
                    mapping.len()
                )));
            }
        }

        Ok(JobSpec {
            job_name,
            tier,
            completions,
            parallelism: max_parallelism.min(completions),
            backoff_limit_per_index: self.backoff_limit_per_index,
            index_mapping: self.index_mapping,
        })
    }
}

/// Hands job specifications to the batch scheduler.
pub trait JobSubmitter: Send + Sync {
    fn exists(&self, job_name: &str) -> Result<bool>;
    fn submit(&self, spec: &JobSpec) -> Result<()>;
}

/// Writes `<job>.job.json` and a rendered `<job>.manifest.json` into a
/// directory for an operator (or the local runner) to pick up.
#[derive(Debug, Clone)]
pub struct ManifestSubmitter {
    dir: PathBuf,
    template: ManifestTemplate,
}

impl ManifestSubmitter {
    pub fn new(dir: impl Into<PathBuf>, template: ManifestTemplate) -> Self {
        Self {
            dir: dir.into(),
            template,
        }
    }

    pub fn spec_path(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{job_name}.job.json"))
    }

    pub fn manifest_path(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{job_name}.manifest.json"))
    }
}

impl JobSubmitter for ManifestSubmitter {
    fn exists(&self, job_name: &str) -> Result<bool> {
        Ok(self.spec_path(job_name).exists())
    }

    fn submit(&self, spec: &JobSpec) -> Result<()> {
        let manifest = self.template.render(spec)?;
        crate::retry::write_json_atomic(&self.manifest_path(&spec.job_name), &manifest)?;
        // The job file goes last: its presence is what `exists` checks.
        crate::retry::write_json_atomic(&self.spec_path(&spec.job_name), spec)
    }
}

/// Where escalation goes after a completed tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The next tier's job, submitted (or found already submitted).
    Next(JobSpec),
    /// No failures remain.
    Complete,
    /// Failures remain but no further tier is configured.
    Exhausted,
}

/// Accounting for one escalation step.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub completed_tier: u32,
    /// Status read from the scheduler; `None` when a persisted record was reused.
    pub status: Option<JobStatus>,
    /// Original logical indices that failed the completed tier.
    pub failed: BTreeSet<u64>,
    pub transition: Transition,
}

pub struct TierEscalator<'a> {
    config: &'a TierConfig,
    store: &'a FailureStore,
    status: &'a dyn JobStatusProvider,
    submitter: &'a dyn JobSubmitter,
}

impl<'a> TierEscalator<'a> {
    pub fn new(
        config: &'a TierConfig,
        store: &'a FailureStore,
        status: &'a dyn JobStatusProvider,
        submitter: &'a dyn JobSubmitter,
    ) -> Self {
        Self {
            config,
            store,
            status,
            submitter,
        }
    }

    /// Build, persist and submit the dense `Tier(0)` job. Zero work units is
    /// immediately `Complete`.
    pub fn init(&self, total_work_count: u64) -> Result<Transition> {
        if total_work_count == 0 {
            tracing::info!("no work units; nothing to submit");
            return Ok(Transition::Complete);
        }

        let tier = self
            .config
            .tier(0)
            .cloned()
            .ok_or_else(|| HexpartError::InvalidConfig("at least one tier is required".into()))?;
        let spec = JobSpec::builder()
            .job_name(self.config.job_name(0))
            .tier(tier)
            .completions(total_work_count)
            .max_parallelism(self.config.max_parallelism)
            .backoff_limit_per_index(self.config.backoff_limit_per_index)
            .build()?;

        self.persist_and_submit(0, &spec)?;
        Ok(Transition::Next(spec))
    }

    /// Escalate the completed tier `completed_tier`.
    pub fn escalate(&self, completed_tier: u32) -> Result<Escalation> {
        let completed: JobSpec = self.store.read_job(completed_tier)?.ok_or_else(|| {
            HexpartError::JobSpec(format!(
                "no job specification recorded for tier {completed_tier} in {}",
                self.store.dir().display()
            ))
        })?;

        let (status, failed) = match self.store.read_failures(completed_tier)? {
            Some(record) => {
                tracing::info!(
                    tier = completed_tier,
                    failed = record.failed.len(),
                    "reusing persisted failure record"
                );
                (None, record.failed_set())
            }
            None => {
                let status = self.status.status(&completed.job_name)?;
                let failed = map_failures(&status.failed, completed.index_mapping.as_ref())?;
                self.store
                    .write_failures(&FailureRecord::new(completed_tier, &completed.job_name, &failed))?;
                tracing::info!(
                    tier = completed_tier,
                    job = %completed.job_name,
                    succeeded = status.succeeded.len(),
                    failed = failed.len(),
                    "recorded tier failures"
                );
                (Some(status), failed)
            }
        };

        let transition = self.next_transition(completed_tier, &failed)?;
        Ok(Escalation {
            completed_tier,
            status,
            failed,
            transition,
        })
    }

    fn next_transition(&self, completed_tier: u32, failed: &BTreeSet<u64>) -> Result<Transition> {
        if failed.is_empty() {
            return Ok(Transition::Complete);
        }

        let next_level = completed_tier + 1;
        let Some(tier) = self.config.tier(next_level).cloned() else {
            tracing::warn!(
                tier = completed_tier,
                failed = failed.len(),
                "failures remain and no higher tier is configured"
            );
            return Ok(Transition::Exhausted);
        };

        let spec = JobSpec::builder()
            .job_name(self.config.job_name(next_level))
            .tier(tier)
            .completions(failed.len() as u64)
            .max_parallelism(self.config.max_parallelism)
            .backoff_limit_per_index(self.config.backoff_limit_per_index)
            .index_mapping(IndexMapping::from_retry_set(failed))
            .build()?;

        self.persist_and_submit(next_level, &spec)?;
        Ok(Transition::Next(spec))
    }

    /// The recorded spec of a submitted job is what its failures are mapped
    /// through later, so it is never rewritten once the job exists.
    fn persist_and_submit(&self, level: u32, spec: &JobSpec) -> Result<()> {
        if self.submitter.exists(&spec.job_name)? {
            match self.store.read_job::<JobSpec>(level)? {
                Some(recorded) if recorded == *spec => {
                    tracing::info!(job = %spec.job_name, "job already exists; not resubmitting");
                }
                Some(recorded) => {
                    return Err(HexpartError::JobSpec(format!(
                        "{} was already submitted with {} completions and mapping {:?}; \
                         the rebuilt job has {} completions and mapping {:?}. \
                         Delete the submitted job and {} to resubmit",
                        spec.job_name,
                        recorded.completions,
                        recorded.index_mapping.as_ref().map(IndexMapping::as_slice),
                        spec.completions,
                        spec.index_mapping.as_ref().map(IndexMapping::as_slice),
                        self.store.job_path(level).display()
                    )));
                }
                None => {
                    tracing::warn!(job = %spec.job_name, "job exists without a recorded spec; recording the rebuilt one");
                    self.store.write_job(level, spec)?;
                }
            }
            return Ok(());
        }

        self.store.write_job(level, spec)?;
        self.submitter.submit(spec)?;
        tracing::info!(
            job = %spec.job_name,
            tier = level,
            completions = spec.completions,
            parallelism = spec.parallelism,
            memory = %spec.tier.memory,
            "submitted job"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeScheduler {
        statuses: Mutex<HashMap<String, JobStatus>>,
        submitted: Mutex<Vec<String>>,
        queries: Mutex<usize>,
    }

    impl FakeScheduler {
        fn finish(&self, job: &str, completions: u64, failed: &[u32]) {
            let failed: BTreeSet<u32> = failed.iter().copied().collect();
            let succeeded = (0..completions as u32).filter(|i| !failed.contains(i)).collect();
            self.statuses.lock().unwrap().insert(
                job.to_string(),
                JobStatus {
                    job_name: job.to_string(),
                    completions,
                    succeeded,
                    failed,
                },
            );
        }
    }

    impl JobStatusProvider for FakeScheduler {
        fn status(&self, job_name: &str) -> Result<JobStatus> {
            *self.queries.lock().unwrap() += 1;
            self.statuses
                .lock()
                .unwrap()
                .get(job_name)
                .cloned()
                .ok_or_else(|| HexpartError::JobSpec(format!("unknown job {job_name}")))
        }
    }

    impl JobSubmitter for FakeScheduler {
        fn exists(&self, job_name: &str) -> Result<bool> {
            Ok(self.submitted.lock().unwrap().iter().any(|j| j == job_name))
        }

        fn submit(&self, spec: &JobSpec) -> Result<()> {
            self.submitted.lock().unwrap().push(spec.job_name.clone());
            Ok(())
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TierConfig::default();
        config.validate().unwrap();
        assert_eq!(config.tiers.len(), 4);
        assert_eq!(config.job_name(2), "hexpart-tier2");
    }

    #[test]
    fn test_config_rejects_gaps_and_empty() {
        let mut config = TierConfig::default();
        config.tiers[2].level = 5;
        assert!(config.validate().is_err());

        let empty = r#"{"tiers": []}"#;
        assert!(TierConfig::from_json(empty).is_err());
    }

    #[test]
    fn test_config_json_fills_defaults() {
        let config = TierConfig::from_json(
            r#"{"tiers": [{"level": 0, "memory": "2Gi", "cpu": "1"}], "job_name_prefix": "roads"}"#,
        )
        .unwrap();
        assert_eq!(config.backoff_limit_per_index, 2);
        assert_eq!(config.job_name(0), "roads-tier0");
    }

    #[test]
    fn test_builder_validates() {
        let tier = RetryTier::new(0, "4Gi", "1");
        assert!(JobSpec::builder().tier(tier.clone()).completions(1).build().is_err());
        assert!(JobSpec::builder()
            .job_name("Bad_Name")
            .tier(tier.clone())
            .completions(1)
            .build()
            .is_err());
        assert!(JobSpec::builder()
            .job_name("ok")
            .tier(tier.clone())
            .completions(3)
            .index_mapping(IndexMapping::from(vec![1, 2]))
            .build()
            .is_err());

        let spec = JobSpec::builder()
            .job_name("ok")
            .tier(tier)
            .completions(3)
            .max_parallelism(10)
            .build()
            .unwrap();
        assert_eq!(spec.parallelism, 3);
    }

    #[test]
    fn test_escalation_chain() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig::default();
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);

        let Transition::Next(tier0) = escalator.init(10).unwrap() else {
            panic!("expected a tier 0 job");
        };
        assert_eq!(tier0.completions, 10);
        assert!(tier0.index_mapping.is_none());

        scheduler.finish("hexpart-tier0", 10, &[2, 7]);
        let step = escalator.escalate(0).unwrap();
        assert_eq!(step.failed, [2u64, 7].into_iter().collect());
        let Transition::Next(tier1) = step.transition else {
            panic!("expected a tier 1 job");
        };
        assert_eq!(tier1.completions, 2);
        assert_eq!(tier1.index_mapping, Some(IndexMapping::from(vec![2, 7])));
        assert_eq!(tier1.tier.memory, "8Gi");

        scheduler.finish("hexpart-tier1", 2, &[0]);
        let Transition::Next(tier2) = escalator.escalate(1).unwrap().transition else {
            panic!("expected a tier 2 job");
        };
        assert_eq!(tier2.completions, 1);
        assert_eq!(tier2.index_mapping, Some(IndexMapping::from(vec![2])));

        scheduler.finish("hexpart-tier2", 1, &[]);
        assert_eq!(escalator.escalate(2).unwrap().transition, Transition::Complete);
    }

    #[test]
    fn test_escalating_twice_reuses_record_and_skips_resubmission() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig::default();
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);

        escalator.init(4).unwrap();
        scheduler.finish("hexpart-tier0", 4, &[1]);

        let first = escalator.escalate(0).unwrap();
        assert!(first.status.is_some());
        let second = escalator.escalate(0).unwrap();
        assert!(second.status.is_none());
        assert_eq!(first.transition, second.transition);

        assert_eq!(*scheduler.queries.lock().unwrap(), 1);
        let submitted = scheduler.submitted.lock().unwrap();
        assert_eq!(submitted.iter().filter(|j| *j == "hexpart-tier1").count(), 1);
    }

    #[test]
    fn test_edited_failures_never_rewrite_a_submitted_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig::default();
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);

        escalator.init(10).unwrap();
        scheduler.finish("hexpart-tier0", 10, &[2, 7]);
        escalator.escalate(0).unwrap();

        fs::write(store.failed_indices_path(0), "[7]").unwrap();
        assert!(matches!(escalator.escalate(0), Err(HexpartError::JobSpec(_))));

        let recorded: JobSpec = store.read_job(1).unwrap().unwrap();
        assert_eq!(recorded.index_mapping, Some(IndexMapping::from(vec![2, 7])));

        // Tier 1 index 0 still traces back to unit 2.
        scheduler.finish("hexpart-tier1", 2, &[0]);
        let step = escalator.escalate(1).unwrap();
        assert_eq!(step.failed, [2u64].into_iter().collect());
    }

    #[test]
    fn test_edited_failures_apply_before_submission() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig::default();
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);

        escalator.init(10).unwrap();
        store
            .write_failures(&FailureRecord::new(0, "hexpart-tier0", &[2u64, 7].into_iter().collect()))
            .unwrap();
        fs::write(store.failed_indices_path(0), "[7]").unwrap();

        let Transition::Next(tier1) = escalator.escalate(0).unwrap().transition else {
            panic!("expected a tier 1 job");
        };
        assert_eq!(tier1.index_mapping, Some(IndexMapping::from(vec![7])));
    }

    #[test]
    fn test_last_tier_failures_are_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig {
            tiers: vec![RetryTier::new(0, "1Gi", "1")],
            ..TierConfig::default()
        };
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);

        escalator.init(3).unwrap();
        scheduler.finish("hexpart-tier0", 3, &[0, 2]);
        let step = escalator.escalate(0).unwrap();
        assert_eq!(step.transition, Transition::Exhausted);
        assert!(store.failed_indices_path(0).exists());
    }

    #[test]
    fn test_init_without_work_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FailureStore::new(dir.path());
        let config = TierConfig::default();
        let scheduler = FakeScheduler::default();
        let escalator = TierEscalator::new(&config, &store, &scheduler, &scheduler);
        assert_eq!(escalator.init(0).unwrap(), Transition::Complete);
        assert!(scheduler.submitted.lock().unwrap().is_empty());
    }

    #[test]
    fn test_manifest_submitter_writes_spec_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = ManifestSubmitter::new(dir.path(), ManifestTemplate::default());
        let spec = JobSpec::builder()
            .job_name("hexpart-tier1")
            .tier(RetryTier::new(1, "8Gi", "2"))
            .completions(2)
            .index_mapping(IndexMapping::from(vec![2, 7]))
            .build()
            .unwrap();

        assert!(!submitter.exists("hexpart-tier1").unwrap());
        submitter.submit(&spec).unwrap();
        assert!(submitter.exists("hexpart-tier1").unwrap());
        assert!(submitter.manifest_path("hexpart-tier1").exists());
    }
}
