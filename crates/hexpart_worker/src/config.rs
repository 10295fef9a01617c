use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hexpart::manifest::{
    ENV_CHUNK_SIZE, ENV_COMPLETION_INDEX, ENV_ID_COLUMN, ENV_INDEX_MAPPING, ENV_RETRY_TIER,
};
use hexpart::{
    ChunkPlan, ChunkPlanner, Containment, GeometryAccessor, IdentifierResolver, IndexMapping,
    ParquetDataset, ResolutionPlan, Sizing, TableSource, WorkUnit,
};
use std::path::PathBuf;

/// `hexpart-worker` - tiles one bounded slice of a geospatial table into H3
/// cells, and consolidates the resulting chunks into root-cell partitions.
///
/// Every option the batch scheduler injects can also be given through the
/// environment, so a pod only needs `hexpart-worker chunk`.
#[derive(Parser, Debug)]
#[command(name = "hexpart-worker", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the chunk plan and resolved identifier as JSON.
    Plan(PlanArgs),
    /// Tile the unit of one completion index.
    Chunk(ChunkArgs),
    /// Tile every unit of the plan in-process.
    ChunkAll(ChunkAllArgs),
    /// Join chunk files with source attributes and partition by root cell.
    Consolidate(ConsolidateArgs),
}

/// Where the rows and their geometry come from.
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Parquet file or directory of Parquet files.
    #[arg(long, env = "HEXPART_DATASET")]
    pub dataset: PathBuf,

    /// WKT geometry column. Ignored when `--x-column`/`--y-column` are set.
    #[arg(long, env = "HEXPART_GEOMETRY_COLUMN", default_value = "wkt")]
    pub geometry_column: String,

    /// Longitude column of a coordinate-pair table (e.g. raster cells).
    #[arg(long, env = "HEXPART_X_COLUMN", requires = "y_column")]
    pub x_column: Option<String>,

    /// Latitude column of a coordinate-pair table.
    #[arg(long, env = "HEXPART_Y_COLUMN", requires = "x_column")]
    pub y_column: Option<String>,
}

impl SourceArgs {
    pub fn open(&self) -> Result<ParquetDataset> {
        ParquetDataset::open(&self.dataset)
            .with_context(|| format!("opening dataset {}", self.dataset.display()))
    }

    pub fn geometry(&self) -> GeometryAccessor {
        geometry_accessor(&self.geometry_column, &self.x_column, &self.y_column)
    }
}

fn geometry_accessor(column: &str, x: &Option<String>, y: &Option<String>) -> GeometryAccessor {
    match (x, y) {
        (Some(x), Some(y)) => GeometryAccessor::Coordinates {
            x: x.clone(),
            y: y.clone(),
        },
        _ => GeometryAccessor::Wkt {
            column: column.to_string(),
        },
    }
}

/// How units are tiled and where chunks go. All workers of one job must
/// agree on these.
#[derive(Args, Debug, Clone)]
pub struct TilingArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Target H3 resolution.
    #[arg(long, env = "HEXPART_RESOLUTION", default_value_t = 9)]
    pub resolution: u8,

    /// Coarser resolutions to materialize beside the target (0 is always added).
    #[arg(long, env = "HEXPART_PARENT_RESOLUTIONS", value_delimiter = ',')]
    pub parent_resolutions: Vec<u8>,

    /// Polygon coverage mode: intersects, centroid or covers.
    #[arg(long, env = "HEXPART_CONTAINMENT", default_value = "intersects")]
    pub containment: Containment,

    /// Directory receiving `chunk_{index}.parquet` files.
    #[arg(long, env = "HEXPART_CHUNK_DIR", default_value = "chunks")]
    pub chunk_dir: PathBuf,
}

impl TilingArgs {
    pub fn resolutions(&self) -> Result<ResolutionPlan> {
        ResolutionPlan::new(self.resolution, &self.parent_resolutions).context("invalid resolutions")
    }
}

/// Dataset-wide decisions taken once: the identifier and the chunk size.
#[derive(Args, Debug, Clone)]
pub struct PlanningArgs {
    /// Identifier column; auto-detected (or synthesized) when absent.
    #[arg(long, env = ENV_ID_COLUMN)]
    pub id_column: Option<String>,

    /// Skip the rows-vs-distinct uniqueness check of the identifier.
    #[arg(long, env = "HEXPART_SKIP_UNIQUE_CHECK", default_value_t = false)]
    pub skip_unique_check: bool,

    /// Rows per work unit.
    #[arg(long, env = ENV_CHUNK_SIZE, conflicts_with = "completions")]
    pub chunk_size: Option<u64>,

    /// Spread the rows over this many work units instead of a fixed chunk size.
    #[arg(long, env = "HEXPART_COMPLETIONS")]
    pub completions: Option<u64>,

    #[arg(long, env = "HEXPART_MAX_PARALLELISM", default_value_t = 50)]
    pub max_parallelism: u64,

    /// Row count assumed when the dataset metadata cannot be read.
    #[arg(long, env = "HEXPART_DEFAULT_COUNT", default_value_t = 1_000_000)]
    pub default_count: u64,
}

impl PlanningArgs {
    pub fn resolver(&self) -> IdentifierResolver {
        IdentifierResolver {
            check_unique: !self.skip_unique_check,
            ..IdentifierResolver::default()
        }
    }

    fn sizing(&self) -> Result<Sizing> {
        Ok(match (self.chunk_size, self.completions) {
            (Some(size), _) => Sizing::ChunkSize(size),
            (None, Some(target)) => Sizing::Completions(target),
            (None, None) => bail!("either --chunk-size or --completions is required"),
        })
    }

    pub fn plan(&self, source: &dyn TableSource) -> Result<ChunkPlan> {
        let planner = ChunkPlanner::new(self.sizing()?, self.max_parallelism)?;
        Ok(planner.plan_or_fallback(source.count_rows(), self.default_count))
    }
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub tiling: TilingArgs,

    #[command(flatten)]
    pub planning: PlanningArgs,
}

/// One scheduled execution. The identifier and chunk size come from `plan`
/// (usually through the manifest environment); nothing is re-derived here.
#[derive(Args, Debug)]
pub struct ChunkArgs {
    #[command(flatten)]
    pub tiling: TilingArgs,

    /// Identifier column as resolved by `plan` (`hexpart_row_id` when synthetic).
    #[arg(long, env = ENV_ID_COLUMN)]
    pub id_column: String,

    /// Rows per work unit as planned.
    #[arg(long, env = ENV_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Completion index of this execution within its job.
    #[arg(long, env = ENV_COMPLETION_INDEX)]
    pub index: u32,

    /// JSON array mapping completion indices to original logical indices.
    #[arg(long, env = ENV_INDEX_MAPPING, conflicts_with = "index_mapping_file")]
    pub index_mapping: Option<String>,

    /// File holding the index mapping JSON.
    #[arg(long, env = "HEXPART_INDEX_MAPPING_FILE")]
    pub index_mapping_file: Option<PathBuf>,

    /// Retry tier of the job running this unit; informational.
    #[arg(long, env = ENV_RETRY_TIER, default_value_t = 0)]
    pub tier: u32,
}

impl ChunkArgs {
    pub fn mapping(&self) -> Result<Option<IndexMapping>> {
        let text = match (&self.index_mapping, &self.index_mapping_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading index mapping {}", path.display()))?,
            (None, None) => return Ok(None),
        };
        let mapping = IndexMapping::from_json(&text).context("parsing index mapping")?;
        Ok(Some(mapping))
    }

    pub fn work_unit(&self, logical_index: u64) -> Result<WorkUnit> {
        WorkUnit::fixed(logical_index, self.chunk_size).context("invalid chunk size")
    }
}

#[derive(Args, Debug)]
pub struct ChunkAllArgs {
    #[command(flatten)]
    pub tiling: TilingArgs,

    #[command(flatten)]
    pub planning: PlanningArgs,

    /// Directory receiving `failed_indices_tier0.json`.
    #[arg(long, env = "HEXPART_STATE_DIR", default_value = "state")]
    pub state_dir: PathBuf,

    /// Worker threads; defaults to the number of CPUs.
    #[arg(long)]
    pub threads: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ConsolidateArgs {
    #[arg(long, env = "HEXPART_CHUNK_DIR", default_value = "chunks")]
    pub chunk_dir: PathBuf,

    /// Source table to join attributes from; without it only cell records are written.
    #[arg(long, env = "HEXPART_DATASET")]
    pub source: Option<PathBuf>,

    #[arg(long, env = "HEXPART_GEOMETRY_COLUMN", default_value = "wkt")]
    pub geometry_column: String,

    #[arg(long, env = "HEXPART_X_COLUMN", requires = "y_column")]
    pub x_column: Option<String>,

    #[arg(long, env = "HEXPART_Y_COLUMN", requires = "x_column")]
    pub y_column: Option<String>,

    /// Identifier column of the chunk files; auto-detected when absent.
    #[arg(long, env = ENV_ID_COLUMN)]
    pub id_column: Option<String>,

    /// Local directory the partitions are assembled in before upload.
    #[arg(long, env = "HEXPART_STAGING_DIR", default_value = "staging")]
    pub staging_dir: PathBuf,

    /// Final location: a local directory, or an `s3://` URI synced with `aws s3 sync`.
    #[arg(long, env = "HEXPART_OUTPUT")]
    pub output: String,

    /// Replace the whole output directory instead of overwriting matching files.
    #[arg(long, default_value_t = false)]
    pub overwrite: bool,

    /// Delete chunk files after a successful upload.
    #[arg(long, env = "HEXPART_CLEANUP", default_value_t = false)]
    pub cleanup: bool,
}

impl ConsolidateArgs {
    pub fn geometry(&self) -> GeometryAccessor {
        geometry_accessor(&self.geometry_column, &self.x_column, &self.y_column)
    }
}
