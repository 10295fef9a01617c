//! Retry bookkeeping: index mappings between tiers and persisted failure records.
//!
//! Tier 0 runs the dense range `0..N`, so completion index and logical index
//! coincide. Every later tier runs a compact range `0..M` over only the
//! failed units, and carries an [`IndexMapping`] from its completion indices
//! back to the original logical indices.

use crate::error::{HexpartError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Position = completion index in a tier's job, value = original logical index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexMapping(Vec<u64>);

impl IndexMapping {
    /// Mapping over the sorted retry set.
    pub fn from_retry_set(retry: &BTreeSet<u64>) -> Self {
        Self(retry.iter().copied().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    /// Original logical index of `completion_index`.
    pub fn original(&self, completion_index: u32) -> Result<u64> {
        self.0
            .get(completion_index as usize)
            .copied()
            .ok_or(HexpartError::MappingOutOfRange {
                index: completion_index,
                len: self.0.len(),
            })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl From<Vec<u64>> for IndexMapping {
    fn from(values: Vec<u64>) -> Self {
        Self(values)
    }
}

/// Resolve the logical index a worker should process.
pub fn logical_index(completion_index: u32, mapping: Option<&IndexMapping>) -> Result<u64> {
    match mapping {
        Some(mapping) => mapping.original(completion_index),
        None => Ok(completion_index as u64),
    }
}

/// Translate failed completion indices of the current tier into original
/// logical indices. Without a mapping (tier 0) they are the same numbers.
pub fn map_failures(failed: &BTreeSet<u32>, mapping: Option<&IndexMapping>) -> Result<BTreeSet<u64>> {
    failed
        .iter()
        .map(|&index| logical_index(index, mapping))
        .collect()
}

/// Original logical indices that failed one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub tier: u32,
    pub job_name: String,
    pub failed: Vec<u64>,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(tier: u32, job_name: impl Into<String>, failed: &BTreeSet<u64>) -> Self {
        Self {
            tier,
            job_name: job_name.into(),
            failed: failed.iter().copied().collect(),
            recorded_at: Utc::now(),
        }
    }

    pub fn failed_set(&self) -> BTreeSet<u64> {
        self.failed.iter().copied().collect()
    }
}

/// Directory holding the durable escalation state.
///
/// Layout:
/// - `failed_indices_tier{N}.json`: ordered original indices that failed tier N
/// - `failure_record_tier{N}.json`: the same set with its job name and timestamp
/// - `job_tier{N}.json`: the job specification submitted for tier N
#[derive(Debug, Clone)]
pub struct FailureStore {
    dir: PathBuf,
}

impl FailureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn failed_indices_path(&self, tier: u32) -> PathBuf {
        self.dir.join(format!("failed_indices_tier{tier}.json"))
    }

    fn record_path(&self, tier: u32) -> PathBuf {
        self.dir.join(format!("failure_record_tier{tier}.json"))
    }

    pub fn job_path(&self, tier: u32) -> PathBuf {
        self.dir.join(format!("job_tier{tier}.json"))
    }

    /// Persist the failures of `record.tier`. The plain index list is written
    /// last, so its presence means the record is complete.
    pub fn write_failures(&self, record: &FailureRecord) -> Result<()> {
        write_json_atomic(&self.record_path(record.tier), record)?;
        write_json_atomic(&self.failed_indices_path(record.tier), &record.failed)
    }

    pub fn read_failures(&self, tier: u32) -> Result<Option<FailureRecord>> {
        let list_path = self.failed_indices_path(tier);
        if !list_path.exists() {
            return Ok(None);
        }

        let failed: Vec<u64> = serde_json::from_str(&fs::read_to_string(&list_path)?)?;
        let record_path = self.record_path(tier);
        let record = if record_path.exists() {
            let mut record: FailureRecord = serde_json::from_str(&fs::read_to_string(&record_path)?)?;
            record.failed = failed;
            record
        } else {
            FailureRecord {
                tier,
                job_name: String::new(),
                failed,
                recorded_at: Utc::now(),
            }
        };
        Ok(Some(record))
    }

    pub fn write_job<T: Serialize>(&self, tier: u32, job: &T) -> Result<()> {
        write_json_atomic(&self.job_path(tier), job)
    }

    pub fn read_job<T: for<'de> Deserialize<'de>>(&self, tier: u32) -> Result<Option<T>> {
        let path = self.job_path(tier);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }
}

pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = crate::dataset::temp_path_for(path);
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
