//! Consolidation of chunk files into root-cell partitions.

mod common;

use arrow::array::AsArray;
use arrow::datatypes::{Int64Type, UInt64Type};
use common::{anonymous_batch, feature_batch, read_all, rect_wkt, write_table, SquareGrid};
use hexpart::{
    AttributeSource, ChunkPlanner, ChunkWriter, ConsolidationOptions, Consolidator, GeometryAccessor,
    HexTiler, IdentifierResolver, LocalCopy, ParquetDataset, ResolutionPlan, Sizing, TableSource,
    UnitOutcome, WriteMode,
};
use std::collections::HashMap;
use std::path::Path;

fn wkt() -> GeometryAccessor {
    GeometryAccessor::Wkt {
        column: "wkt".into(),
    }
}

/// Six features over five root cells: one spans two target cells, one has no
/// geometry.
fn sample(dir: &Path) -> ParquetDataset {
    let geoms = vec![
        Some(rect_wkt(0.2, 0.2, 0.4, 0.4)),
        Some(rect_wkt(9.2, 0.2, 9.4, 0.4)),
        Some(rect_wkt(0.5, 9.2, 1.5, 9.4)),
        None,
        Some(rect_wkt(-5.0, -5.0, -4.8, -4.8)),
        Some(rect_wkt(17.1, 17.1, 17.2, 17.2)),
    ];
    write_table(
        &dir.join("source.parquet"),
        &feature_batch(&[10, 11, 12, 13, 14, 15], &["a", "b", "c", "d", "e", "f"], &geoms),
    )
}

fn tile_all(source: &ParquetDataset, chunks: &ChunkWriter, synthetic: bool) -> u64 {
    let identifier = if synthetic {
        IdentifierResolver::default().resolve_or_synthesize(source, None).unwrap()
    } else {
        IdentifierResolver::default()
            .resolve_or_synthesize(source, Some("objectid"))
            .unwrap()
    };
    let grid = SquareGrid;
    let tiler = HexTiler::new(source, &grid, identifier, wkt(), ResolutionPlan::new(3, &[1]).unwrap());
    let plan = ChunkPlanner::new(Sizing::ChunkSize(4), 2)
        .unwrap()
        .plan(source.count_rows().unwrap());

    let mut records = 0;
    for unit in plan.work_units() {
        if let UnitOutcome::Written { records: n, .. } = tiler.run(&unit, chunks).unwrap() {
            records += n;
        }
    }
    records
}

fn options(root: &Path, cleanup: bool) -> ConsolidationOptions {
    ConsolidationOptions {
        staging_dir: root.join("staging"),
        identifier_hint: None,
        cleanup,
    }
}

#[test]
fn test_consolidation_joins_attributes_and_partitions_by_root() {
    let dir = tempfile::tempdir().unwrap();
    let source = sample(dir.path());
    let chunks = ChunkWriter::new(dir.path().join("chunks"));
    let tiled = tile_all(&source, &chunks, false);
    assert_eq!(tiled, 6);
    assert_eq!(chunks.discover().unwrap().len(), 2);

    let out = dir.path().join("out");
    let uploader = LocalCopy::new(&out, WriteMode::OverwriteOrIgnore);
    let report = Consolidator::new(
        chunks.clone(),
        options(dir.path(), false),
        Some(AttributeSource {
            table: &source,
            geometry: wkt(),
        }),
        &uploader,
    )
    .run()
    .unwrap();

    assert_eq!(report.chunk_files, 2);
    assert_eq!(report.records_read, 6);
    assert_eq!(report.records_written, 6);
    assert_eq!(report.partitions, 5);

    let mut partition_dirs: Vec<String> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    partition_dirs.sort();
    assert_eq!(partition_dirs.len(), 5);
    assert!(partition_dirs.iter().all(|d| d.starts_with("h3_res0=")));

    let output = read_all(&out);
    let columns: Vec<String> = output.schema().fields().iter().map(|f| f.name().clone()).collect();
    assert_eq!(columns, ["OBJECTID", "h3_res3", "h3_res1", "name"]);

    let ids = output.column(0).as_primitive::<Int64Type>();
    let names = output.column(3).as_string::<i32>();
    let by_id: HashMap<i64, &str> = (0..output.num_rows()).map(|i| (ids.value(i), names.value(i))).collect();
    assert_eq!(by_id[&10], "a");
    assert_eq!(by_id[&12], "c");
    assert_eq!(by_id[&15], "f");
    assert!(!by_id.contains_key(&13));

    // Chunks are kept unless cleanup was requested.
    assert_eq!(chunks.discover().unwrap().len(), 2);
}

#[test]
fn test_consolidation_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = sample(dir.path());
    let chunks = ChunkWriter::new(dir.path().join("chunks"));
    tile_all(&source, &chunks, false);

    let out = dir.path().join("out");
    let uploader = LocalCopy::new(&out, WriteMode::OverwriteOrIgnore);
    let consolidator = Consolidator::new(
        chunks,
        options(dir.path(), false),
        Some(AttributeSource {
            table: &source,
            geometry: wkt(),
        }),
        &uploader,
    );

    let first = consolidator.run().unwrap();
    let first_output = read_all(&out);
    let second = consolidator.run().unwrap();
    let second_output = read_all(&out);

    assert_eq!(first, second);
    assert_eq!(first_output.num_rows(), second_output.num_rows());
    assert_eq!(first_output.schema(), second_output.schema());
}

#[test]
fn test_cleanup_removes_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let source = sample(dir.path());
    let chunks = ChunkWriter::new(dir.path().join("chunks"));
    tile_all(&source, &chunks, false);

    let uploader = LocalCopy::new(dir.path().join("out"), WriteMode::Overwrite);
    let report = Consolidator::new(chunks.clone(), options(dir.path(), true), None, &uploader)
        .run()
        .unwrap();

    assert_eq!(report.cleanup_failures, 0);
    assert!(chunks.discover().unwrap().is_empty());

    // Without a source the output is the cell records alone.
    let output = read_all(&dir.path().join("out"));
    assert_eq!(output.num_columns(), 3);
    assert_eq!(output.num_rows(), 6);
}

#[test]
fn test_synthetic_identifier_joins_by_row_position() {
    let dir = tempfile::tempdir().unwrap();
    let geoms = vec![
        Some(rect_wkt(0.2, 0.2, 0.4, 0.4)),
        Some(rect_wkt(9.2, 0.2, 9.4, 0.4)),
        Some(rect_wkt(-5.0, -5.0, -4.8, -4.8)),
    ];
    let source = write_table(
        &dir.path().join("source.parquet"),
        &anonymous_batch(&["first", "second", "third"], &geoms),
    );
    let chunks = ChunkWriter::new(dir.path().join("chunks"));
    tile_all(&source, &chunks, true);

    let out = dir.path().join("out");
    let uploader = LocalCopy::new(&out, WriteMode::Overwrite);
    Consolidator::new(
        chunks,
        options(dir.path(), false),
        Some(AttributeSource {
            table: &source,
            geometry: wkt(),
        }),
        &uploader,
    )
    .run()
    .unwrap();

    let output = read_all(&out);
    let ids = output
        .column_by_name("hexpart_row_id")
        .unwrap()
        .as_primitive::<UInt64Type>();
    let names = output.column_by_name("name").unwrap().as_string::<i32>();
    let by_id: HashMap<u64, &str> = (0..output.num_rows()).map(|i| (ids.value(i), names.value(i))).collect();
    assert_eq!(by_id.len(), 3);
    assert_eq!(by_id[&0], "first");
    assert_eq!(by_id[&1], "second");
    assert_eq!(by_id[&2], "third");
}

#[test]
fn test_missing_chunks_is_an_empty_report() {
    let dir = tempfile::tempdir().unwrap();
    let uploader = LocalCopy::new(dir.path().join("out"), WriteMode::Overwrite);
    let report = Consolidator::new(
        ChunkWriter::new(dir.path().join("nothing-here")),
        options(dir.path(), true),
        None,
        &uploader,
    )
    .run()
    .unwrap();
    assert_eq!(report.chunk_files, 0);
    assert!(!dir.path().join("out").exists());
}
