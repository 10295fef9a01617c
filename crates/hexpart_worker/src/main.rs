mod config;

use anyhow::{Context, Result};
use clap::Parser;
use config::{
    ChunkAllArgs, ChunkArgs, Cli, Command, ConsolidateArgs, PlanArgs, PlanningArgs, TilingArgs,
};
use hexpart::manifest::{ENV_CHUNK_SIZE, ENV_ID_COLUMN};
use hexpart::retry::logical_index;
use hexpart::{
    AttributeSource, ChunkPlan, ChunkWriter, ConsolidationOptions, Consolidator, CountSource,
    FailureRecord, FailureStore, H3Grid, HexTiler, IdentifierColumn, IdentifierResolver, LocalCopy,
    ParquetDataset, SyncCommand, UnitOutcome, Uploader, WriteMode,
};
use log::{info, warn};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Dataset, identifier and plan: the decisions taken once per dataset.
struct Prepared {
    source: ParquetDataset,
    identifier: IdentifierColumn,
    plan: ChunkPlan,
}

fn prepare(tiling: &TilingArgs, planning: &PlanningArgs) -> Result<Prepared> {
    let source = tiling.source.open()?;
    let identifier = planning
        .resolver()
        .resolve_or_synthesize(&source, planning.id_column.as_deref())
        .context("resolving identifier column")?;
    let plan = planning.plan(&source)?;

    Ok(Prepared {
        source,
        identifier,
        plan,
    })
}

#[derive(serde::Serialize)]
struct PlanSummary<'a> {
    plan: &'a ChunkPlan,
    identifier: &'a IdentifierColumn,
    cell_columns: Vec<String>,
    /// Environment every `chunk` execution of this plan needs.
    worker_env: BTreeMap<&'static str, String>,
}

fn run_plan(args: &PlanArgs) -> Result<()> {
    let prepared = prepare(&args.tiling, &args.planning)?;
    if prepared.plan.count_source == CountSource::Fallback {
        warn!(
            "Row count unavailable; {} units of {} rows are an estimate, units past the real end will be empty",
            prepared.plan.completions, prepared.plan.chunk_size
        );
    }
    let worker_env = [
        (ENV_ID_COLUMN, prepared.identifier.name.clone()),
        (ENV_CHUNK_SIZE, prepared.plan.chunk_size.to_string()),
    ]
    .into_iter()
    .collect();

    let summary = PlanSummary {
        plan: &prepared.plan,
        identifier: &prepared.identifier,
        cell_columns: args.tiling.resolutions()?.column_names(),
        worker_env,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Entry point of one scheduled execution. Returns normally for "no data at
/// this index" so the process exits 0; any error exits nonzero and is retried.
fn run_chunk(args: &ChunkArgs) -> Result<()> {
    let started = Instant::now();
    let mapping = args.mapping()?;
    let logical = logical_index(args.index, mapping.as_ref())?;
    info!(
        "Tier {} completion index {} -> logical index {}",
        args.tier, args.index, logical
    );

    let source = args.tiling.source.open()?;
    let identifier = IdentifierResolver::default()
        .attach(&source, &args.id_column)
        .context("attaching identifier column")?;
    let unit = args.work_unit(logical)?;

    let grid = H3Grid::new(args.tiling.containment);
    let tiler = HexTiler::new(
        &source,
        &grid,
        identifier,
        args.tiling.source.geometry(),
        args.tiling.resolutions()?,
    );
    let writer = ChunkWriter::new(&args.tiling.chunk_dir);

    match tiler
        .run(&unit, &writer)
        .with_context(|| format!("tiling unit {logical}"))?
    {
        UnitOutcome::Empty => info!("Unit {} has no rows", logical),
        UnitOutcome::Written {
            path,
            rows_read,
            records,
        } => info!(
            "Unit {}: {} rows -> {} cell records in {} ({:.1?})",
            logical,
            rows_read,
            records,
            path.display(),
            started.elapsed()
        ),
    }
    Ok(())
}

fn run_chunk_all(args: &ChunkAllArgs) -> Result<()> {
    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("configuring worker threads")?;
    }

    let prepared = prepare(&args.tiling, &args.planning)?;
    let grid = H3Grid::new(args.tiling.containment);
    let tiler = HexTiler::new(
        &prepared.source,
        &grid,
        prepared.identifier.clone(),
        args.tiling.source.geometry(),
        args.tiling.resolutions()?,
    );
    let writer = ChunkWriter::new(&args.tiling.chunk_dir);

    let units: Vec<_> = prepared.plan.work_units().collect();
    info!("Processing {} units...", units.len());

    // Units are independent; a failure is recorded and never stops its siblings.
    let failed: BTreeSet<u64> = units
        .par_iter()
        .filter_map(|unit| match tiler.run(unit, &writer) {
            Ok(_) => None,
            Err(err) => {
                warn!("Error processing unit {}: {:#}", unit.logical_index, err);
                Some(unit.logical_index)
            }
        })
        .collect();

    let store = FailureStore::new(&args.state_dir);
    store.write_failures(&FailureRecord::new(0, "local", &failed))?;

    println!(
        "units: {}  succeeded: {}  failed: {}",
        units.len(),
        units.len() - failed.len(),
        failed.len()
    );
    if !failed.is_empty() {
        println!("failed logical indices: {:?}", failed);
    }
    println!("failure record: {}", store.failed_indices_path(0).display());
    Ok(())
}

fn run_consolidate(args: &ConsolidateArgs) -> Result<()> {
    let uploader: Box<dyn Uploader> = if args.output.starts_with("s3://") {
        Box::new(SyncCommand::aws_s3(&args.output))
    } else {
        let mode = if args.overwrite {
            WriteMode::Overwrite
        } else {
            WriteMode::OverwriteOrIgnore
        };
        Box::new(LocalCopy::new(&args.output, mode))
    };

    let source = args
        .source
        .as_ref()
        .map(|path| {
            ParquetDataset::open(path).with_context(|| format!("opening dataset {}", path.display()))
        })
        .transpose()?;
    let attributes = source.as_ref().map(|table| AttributeSource {
        table,
        geometry: args.geometry(),
    });

    let options = ConsolidationOptions {
        staging_dir: args.staging_dir.clone(),
        identifier_hint: args.id_column.clone(),
        cleanup: args.cleanup,
    };
    let report = Consolidator::new(
        ChunkWriter::new(&args.chunk_dir),
        options,
        attributes,
        uploader.as_ref(),
    )
    .run()
    .context("consolidating chunks")?;

    if report.cleanup_failures > 0 {
        warn!("{} chunk files could not be deleted", report.cleanup_failures);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Plan(args) => run_plan(args),
        Command::Chunk(args) => run_chunk(args),
        Command::ChunkAll(args) => run_chunk_all(args),
        Command::Consolidate(args) => run_consolidate(args),
    }
}
