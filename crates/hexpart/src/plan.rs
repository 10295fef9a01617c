//! Chunk planning: fixed-size row windows over a dataset.

use crate::error::{EstimationFailed, HexpartError, Result};
use serde::{Deserialize, Serialize};

/// One bounded slice of the dataset, processed by exactly one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub logical_index: u64,
    pub row_offset: u64,
    pub row_count: u64,
}

impl WorkUnit {
    /// The unit at `logical_index` of a plan with the given chunk size,
    /// computed without the row count. A unit past the end reads no rows.
    pub fn fixed(logical_index: u64, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(HexpartError::InvalidConfig("chunk size must be > 0".into()));
        }
        let row_offset = logical_index.checked_mul(chunk_size).ok_or_else(|| {
            HexpartError::InvalidConfig(format!(
                "unit {logical_index} of {chunk_size} rows lies beyond any row position"
            ))
        })?;
        Ok(Self {
            logical_index,
            row_offset,
            row_count: chunk_size,
        })
    }
}

/// How the chunk size is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    /// Fixed number of rows per unit.
    ChunkSize(u64),
    /// Spread the rows over roughly this many completions.
    Completions(u64),
}

/// Where the row count used for planning came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    Exact,
    /// Metadata was unreadable; a caller-supplied default stood in.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_count: u64,
    pub chunk_size: u64,
    pub completions: u64,
    pub parallelism: u64,
    pub count_source: CountSource,
}

impl ChunkPlan {
    pub fn is_empty(&self) -> bool {
        self.completions == 0
    }

    /// The unit for `logical_index`, or `None` past the last completion.
    ///
    /// All units but the last hold exactly `chunk_size` rows. When the count
    /// is a fallback estimate the last unit is not truncated, since the real
    /// bound is only discovered when reading.
    pub fn work_unit(&self, logical_index: u64) -> Option<WorkUnit> {
        if logical_index >= self.completions {
            return None;
        }

        let row_offset = logical_index * self.chunk_size;
        let row_count = match self.count_source {
            CountSource::Exact => self.chunk_size.min(self.total_count - row_offset),
            CountSource::Fallback => self.chunk_size,
        };

        Some(WorkUnit {
            logical_index,
            row_offset,
            row_count,
        })
    }

    pub fn work_units(&self) -> impl Iterator<Item = WorkUnit> + '_ {
        (0..self.completions).filter_map(|i| self.work_unit(i))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    pub sizing: Sizing,
    pub max_parallelism: u64,
}

impl ChunkPlanner {
    pub fn new(sizing: Sizing, max_parallelism: u64) -> Result<Self> {
        match sizing {
            Sizing::ChunkSize(0) => {
                return Err(HexpartError::InvalidConfig("chunk size must be > 0".into()))
            }
            Sizing::Completions(0) => {
                return Err(HexpartError::InvalidConfig(
                    "target completions must be > 0".into(),
                ))
            }
            _ => {}
        }
        if max_parallelism == 0 {
            return Err(HexpartError::InvalidConfig(
                "max parallelism must be > 0".into(),
            ));
        }

        Ok(Self {
            sizing,
            max_parallelism,
        })
    }

    /// Plan over an exactly known row count.
    pub fn plan(&self, total_count: u64) -> ChunkPlan {
        self.plan_with_source(total_count, CountSource::Exact)
    }

    /// Plan over a count that may have failed, substituting `default_count`.
    pub fn plan_or_fallback(
        &self,
        count: std::result::Result<u64, EstimationFailed>,
        default_count: u64,
    ) -> ChunkPlan {
        match count {
            Ok(total) => self.plan(total),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    default_count,
                    "row count unavailable; planning with default estimate"
                );
                self.plan_with_source(default_count, CountSource::Fallback)
            }
        }
    }

    fn plan_with_source(&self, total_count: u64, count_source: CountSource) -> ChunkPlan {
        let chunk_size = match self.sizing {
            Sizing::ChunkSize(size) => size,
            Sizing::Completions(target) => total_count.div_ceil(target).max(1),
        };
        let completions = total_count.div_ceil(chunk_size);

        ChunkPlan {
            total_count,
            chunk_size,
            completions,
            parallelism: self.max_parallelism.min(completions),
            count_source,
        }
    }
}
