//! Completed-job status as reported by the batch scheduler.

use crate::error::{HexpartError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Per-index outcome of one indexed job, in that job's completion-index space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub job_name: String,
    pub completions: u64,
    pub succeeded: BTreeSet<u32>,
    pub failed: BTreeSet<u32>,
}

impl JobStatus {
    /// Build a status where every index not listed as succeeded counts as failed.
    pub fn from_succeeded(job_name: impl Into<String>, completions: u64, succeeded: BTreeSet<u32>) -> Self {
        let failed = complement(&succeeded, completions);
        Self {
            job_name: job_name.into(),
            completions,
            succeeded,
            failed,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Scheduler-shaped status document, the inverse of [`JobStatus::from_document`].
    pub fn to_document(&self) -> JobDocument {
        JobDocument {
            metadata: Metadata {
                name: self.job_name.clone(),
            },
            spec: DocumentSpec {
                completions: self.completions,
            },
            status: DocumentStatus {
                completed_indexes: Some(format_index_ranges(&self.succeeded)),
                failed_indexes: Some(format_index_ranges(&self.failed)),
                succeeded: Some(self.succeeded.len() as u64),
                failed: Some(self.failed.len() as u64),
            },
        }
    }

    /// Interpret a scheduler status document.
    ///
    /// When `failedIndexes` is absent, failures are all indices below
    /// `completions` that are not listed in `completedIndexes`.
    pub fn from_document(doc: &JobDocument) -> Result<Self> {
        let succeeded = match &doc.status.completed_indexes {
            Some(ranges) => parse_index_ranges(ranges)?,
            None => BTreeSet::new(),
        };
        let failed = match &doc.status.failed_indexes {
            Some(ranges) => parse_index_ranges(ranges)?,
            None => complement(&succeeded, doc.spec.completions),
        };

        if let Some(&index) = succeeded.iter().chain(failed.iter()).find(|&&i| i as u64 >= doc.spec.completions) {
            return Err(HexpartError::InvalidIndexRange(format!(
                "index {index} is outside completions {}",
                doc.spec.completions
            )));
        }

        Ok(Self {
            job_name: doc.metadata.name.clone(),
            completions: doc.spec.completions,
            succeeded,
            failed,
        })
    }
}

fn complement(listed: &BTreeSet<u32>, completions: u64) -> BTreeSet<u32> {
    (0..completions)
        .filter_map(|i| u32::try_from(i).ok())
        .filter(|i| !listed.contains(i))
        .collect()
}

/// Parse a range list such as `"0-3,5,9-10"`. The empty string is the empty set.
pub fn parse_index_ranges(text: &str) -> Result<BTreeSet<u32>> {
    let mut indices = BTreeSet::new();
    let text = text.trim();
    if text.is_empty() {
        return Ok(indices);
    }

    let invalid = || HexpartError::InvalidIndexRange(text.to_string());
    for part in text.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.trim().parse().map_err(|_| invalid())?;
                let end: u32 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                indices.extend(start..=end);
            }
            None => {
                indices.insert(part.parse().map_err(|_| invalid())?);
            }
        }
    }
    Ok(indices)
}

/// Render indices in the compact range form accepted by [`parse_index_ranges`].
pub fn format_index_ranges(indices: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();

    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDocument {
    pub metadata: Metadata,
    pub spec: DocumentSpec,
    #[serde(default)]
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSpec {
    pub completions: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_indexes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_indexes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
}

/// Source of completed-job status.
pub trait JobStatusProvider: Send + Sync {
    fn status(&self, job_name: &str) -> Result<JobStatus>;
}

/// Reads `<job>.status.json` documents from a directory, as exported from the
/// scheduler (e.g. `kubectl get job <job> -o json`) or written by the local runner.
#[derive(Debug, Clone)]
pub struct ManifestStatusProvider {
    dir: PathBuf,
}

impl ManifestStatusProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, job_name: &str) -> PathBuf {
        self.dir.join(format!("{job_name}.status.json"))
    }

    /// Persist `status` where [`JobStatusProvider::status`] will find it.
    pub fn record(&self, status: &JobStatus) -> Result<()> {
        crate::retry::write_json_atomic(&self.path_for(&status.job_name), &status.to_document())
    }

    fn read(&self, path: &Path) -> Result<JobDocument> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

impl JobStatusProvider for ManifestStatusProvider {
    fn status(&self, job_name: &str) -> Result<JobStatus> {
        let doc = self.read(&self.path_for(job_name))?;
        JobStatus::from_document(&doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(values: &[u32]) -> BTreeSet<u32> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_parse_ranges() {
        assert_eq!(parse_index_ranges("0-2,5").unwrap(), set(&[0, 1, 2, 5]));
        assert_eq!(parse_index_ranges(" 7 ").unwrap(), set(&[7]));
        assert!(parse_index_ranges("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_ranges_rejected() {
        for bad in ["3-1", "a", "1,,2", "1-", "-4"] {
            assert!(
                matches!(parse_index_ranges(bad), Err(HexpartError::InvalidIndexRange(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_format_ranges() {
        assert_eq!(format_index_ranges(&set(&[0, 1, 2, 5, 7, 8])), "0-2,5,7-8");
        assert_eq!(format_index_ranges(&BTreeSet::new()), "");
    }

    #[test]
    fn test_missing_failed_indexes_uses_complement() {
        let doc: JobDocument = serde_json::from_str(
            r#"{
                "metadata": {"name": "hexpart-tier0"},
                "spec": {"completions": 10},
                "status": {"completedIndexes": "0-1,3-6,8-9", "succeeded": 8}
            }"#,
        )
        .unwrap();

        let status = JobStatus::from_document(&doc).unwrap();
        assert_eq!(status.failed, set(&[2, 7]));
        assert_eq!(status.succeeded.len(), 8);
    }

    #[test]
    fn test_index_beyond_completions_rejected() {
        let doc: JobDocument = serde_json::from_str(
            r#"{"metadata": {"name": "j"}, "spec": {"completions": 2}, "status": {"failedIndexes": "2"}}"#,
        )
        .unwrap();
        assert!(JobStatus::from_document(&doc).is_err());
    }

    #[test]
    fn test_provider_reads_recorded_status() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ManifestStatusProvider::new(dir.path());
        let status = JobStatus::from_succeeded("hexpart-tier1", 2, set(&[1]));
        provider.record(&status).unwrap();

        let read = provider.status("hexpart-tier1").unwrap();
        assert_eq!(read, status);
        assert_eq!(read.failed, set(&[0]));
    }
}
