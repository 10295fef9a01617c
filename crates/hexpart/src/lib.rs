//! hexpart: chunked H3 tiling of large geospatial tables, partition
//! consolidation, and tiered retry bookkeeping for indexed batch jobs.
//!
//! Data flow:
//!   ChunkPlanner -> WorkUnit -> HexTiler -> chunk files -> Consolidator -> partitions
//!
//! Escalation runs beside it: a completed tier's job status is mapped back to
//! original logical indices, persisted, and turned into a smaller job for the
//! next resource tier until nothing fails or no tier is left.
//!
//! On-disk layout:
//!   <chunks>/chunk_{logical_index:06}.parquet      identifier + h3_res{N} columns only
//!   <output>/h3_res{root}={cell:x}/part-00000.parquet
//!                                                   cells joined with attributes, no geometry
//!   <state>/failed_indices_tier{N}.json            ordered original indices that failed tier N
//!   <state>/job_tier{N}.json                       job spec of tier N, with its index mapping
//!
//! Every file is written to a `.tmp-` sibling first and renamed into place;
//! discovery ignores temp files, so an interrupted writer leaves nothing that
//! looks complete.

pub mod dataset;
pub mod error;
pub mod escalation;
pub mod geometry;
pub mod grid;
pub mod identifier;
pub mod manifest;
pub mod partition;
pub mod plan;
pub mod retry;
pub mod status;
pub mod tiler;
pub mod upload;

pub use dataset::{write_parquet_atomic, ParquetDataset, TableSource};
pub use error::{EstimationFailed, HexpartError, Result};
pub use escalation::{Escalation, JobSpec, JobSubmitter, ManifestSubmitter, RetryTier, TierConfig, TierEscalator, Transition};
pub use geometry::GeometryAccessor;
pub use grid::{Containment, H3Grid, HexGrid, Resolution, ResolutionPlan};
pub use identifier::{IdentifierColumn, IdentifierResolver, Resolved};
pub use manifest::ManifestTemplate;
pub use partition::{AttributeSource, ChunkWriter, ConsolidationOptions, ConsolidationReport, Consolidator};
pub use plan::{ChunkPlan, ChunkPlanner, CountSource, Sizing, WorkUnit};
pub use retry::{map_failures, FailureRecord, FailureStore, IndexMapping};
pub use status::{JobStatus, JobStatusProvider, ManifestStatusProvider};
pub use tiler::{HexTiler, TileOutcome, UnitOutcome};
pub use upload::{LocalCopy, SyncCommand, Uploader, WriteMode};
