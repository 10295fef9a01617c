//! Indexed batch-job manifests rendered from a [`JobSpec`].

use crate::error::Result;
use crate::escalation::JobSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Completion index injected by the scheduler into each pod.
pub const ENV_COMPLETION_INDEX: &str = "JOB_COMPLETION_INDEX";
/// JSON array mapping completion indices to original logical indices.
pub const ENV_INDEX_MAPPING: &str = "HEXPART_INDEX_MAPPING";
pub const ENV_RETRY_TIER: &str = "HEXPART_RETRY_TIER";
/// Identifier column resolved once by `plan`; every worker of a job reuses it.
pub const ENV_ID_COLUMN: &str = "HEXPART_ID_COLUMN";
/// Rows per work unit as planned; workers never re-plan.
pub const ENV_CHUNK_SIZE: &str = "HEXPART_CHUNK_SIZE";

/// Exit code of an OOM-killed container.
pub const OOM_EXIT_CODE: i32 = 137;

const CONTAINER_NAME: &str = "worker";

/// Deployment-specific parts of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestTemplate {
    pub image: String,
    pub namespace: Option<String>,
    pub command: Vec<String>,
    /// Extra environment, e.g. dataset location and chunk size.
    pub env: BTreeMap<String, String>,
}

impl Default for ManifestTemplate {
    fn default() -> Self {
        Self {
            image: "hexpart-worker:latest".to_string(),
            namespace: None,
            command: vec!["hexpart-worker".to_string(), "chunk".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl ManifestTemplate {
    pub fn render(&self, spec: &JobSpec) -> Result<JobManifest> {
        let mut env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(name, value)| EnvVar::new(name, value))
            .collect();
        env.push(EnvVar::new(ENV_RETRY_TIER, spec.tier.level.to_string()));
        if let Some(mapping) = &spec.index_mapping {
            env.push(EnvVar::new(ENV_INDEX_MAPPING, mapping.to_json()?));
        }

        let resources: BTreeMap<String, String> = [
            ("memory".to_string(), spec.tier.memory.clone()),
            ("cpu".to_string(), spec.tier.cpu.clone()),
        ]
        .into_iter()
        .collect();

        let labels: BTreeMap<String, String> = [
            ("app.kubernetes.io/name".to_string(), "hexpart".to_string()),
            ("hexpart/tier".to_string(), spec.tier.level.to_string()),
        ]
        .into_iter()
        .collect();

        Ok(JobManifest {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            metadata: ObjectMeta {
                name: spec.job_name.clone(),
                namespace: self.namespace.clone(),
                labels,
            },
            spec: BatchSpec {
                completion_mode: "Indexed".to_string(),
                completions: spec.completions,
                parallelism: spec.parallelism,
                backoff_limit_per_index: spec.backoff_limit_per_index,
                // Large enough that index failures never fail the job as a whole.
                max_failed_indexes: spec.completions,
                pod_failure_policy: PodFailurePolicy {
                    rules: vec![PodFailurePolicyRule {
                        action: "FailIndex".to_string(),
                        on_exit_codes: OnExitCodes {
                            container_name: CONTAINER_NAME.to_string(),
                            operator: "In".to_string(),
                            values: vec![OOM_EXIT_CODE],
                        },
                    }],
                },
                template: PodTemplate {
                    spec: PodSpec {
                        restart_policy: "Never".to_string(),
                        containers: vec![Container {
                            name: CONTAINER_NAME.to_string(),
                            image: self.image.clone(),
                            command: self.command.clone(),
                            env,
                            resources: Resources {
                                requests: resources.clone(),
                                limits: resources,
                            },
                        }],
                    },
                },
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: BatchSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSpec {
    pub completion_mode: String,
    pub completions: u64,
    pub parallelism: u64,
    pub backoff_limit_per_index: u32,
    pub max_failed_indexes: u64,
    pub pod_failure_policy: PodFailurePolicy,
    pub template: PodTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodFailurePolicy {
    pub rules: Vec<PodFailurePolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodFailurePolicyRule {
    pub action: String,
    pub on_exit_codes: OnExitCodes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnExitCodes {
    pub container_name: String,
    pub operator: String,
    pub values: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodTemplate {
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub restart_policy: String,
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub requests: BTreeMap<String, String>,
    pub limits: BTreeMap<String, String>,
}
