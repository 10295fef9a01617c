//! Shared helpers for integration tests.
#![allow(dead_code)]

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use geo_types::{Point, Polygon};
use hexpart::{write_parquet_atomic, HexGrid, HexpartError, ParquetDataset, Resolution, TableSource};
use std::path::Path;
use std::sync::Arc;

const OFFSET: i64 = 1 << 23;

/// Axis-aligned square grid: cells at resolution `r` are `8 / 2^r` degrees
/// wide, so every cell has exactly four children at `r + 1`. A polygon's
/// cells are those its bounding box touches (upper edges exclusive).
#[derive(Debug, Default, Clone, Copy)]
pub struct SquareGrid;

impl SquareGrid {
    pub fn size(res: Resolution) -> f64 {
        8.0 / f64::from(1u32 << res.get())
    }

    pub fn encode(res: Resolution, ix: i64, iy: i64) -> u64 {
        ((res.get() as u64) << 48) | (((ix + OFFSET) as u64) << 24) | ((iy + OFFSET) as u64)
    }

    pub fn decode(cell: u64) -> (u8, i64, i64) {
        let res = (cell >> 48) as u8;
        let ix = ((cell >> 24) & 0xFF_FFFF) as i64 - OFFSET;
        let iy = (cell & 0xFF_FFFF) as i64 - OFFSET;
        (res, ix, iy)
    }

    pub fn cell_at(lon: f64, lat: f64, res: Resolution) -> u64 {
        let size = Self::size(res);
        Self::encode(res, (lon / size).floor() as i64, (lat / size).floor() as i64)
    }
}

impl HexGrid for SquareGrid {
    fn cells_for_polygon(&self, polygon: &Polygon<f64>, res: Resolution) -> hexpart::Result<Vec<u64>> {
        let coords: Vec<_> = polygon.exterior().coords().collect();
        if coords.is_empty() {
            return Ok(Vec::new());
        }
        let min_x = coords.iter().map(|c| c.x).fold(f64::INFINITY, f64::min);
        let max_x = coords.iter().map(|c| c.x).fold(f64::NEG_INFINITY, f64::max);
        let min_y = coords.iter().map(|c| c.y).fold(f64::INFINITY, f64::min);
        let max_y = coords.iter().map(|c| c.y).fold(f64::NEG_INFINITY, f64::max);

        let size = Self::size(res);
        let x0 = (min_x / size).floor() as i64;
        let x1 = ((max_x / size).ceil() as i64 - 1).max(x0);
        let y0 = (min_y / size).floor() as i64;
        let y1 = ((max_y / size).ceil() as i64 - 1).max(y0);

        let mut cells = Vec::new();
        for ix in x0..=x1 {
            for iy in y0..=y1 {
                cells.push(Self::encode(res, ix, iy));
            }
        }
        Ok(cells)
    }

    fn cell_for_point(&self, point: Point<f64>, res: Resolution) -> hexpart::Result<u64> {
        Ok(Self::cell_at(point.x(), point.y(), res))
    }

    fn ancestor_cell(&self, cell: u64, res: Resolution) -> hexpart::Result<u64> {
        let (from, ix, iy) = Self::decode(cell);
        if res.get() > from {
            return Err(HexpartError::Grid(format!("resolution {res} is finer than {from}")));
        }
        let factor = 1i64 << (from - res.get());
        Ok(Self::encode(res, ix.div_euclid(factor), iy.div_euclid(factor)))
    }
}

/// Axis-aligned rectangle as WKT.
pub fn rect_wkt(x0: f64, y0: f64, x1: f64, y1: f64) -> String {
    format!("POLYGON(({x0} {y0}, {x1} {y0}, {x1} {y1}, {x0} {y1}, {x0} {y0}))")
}

/// A table of `(OBJECTID, name, wkt)` rows.
pub fn feature_batch(ids: &[i64], names: &[&str], wkt: &[Option<String>]) -> RecordBatch {
    let columns: Vec<(&str, ArrayRef)> = vec![
        ("OBJECTID", Arc::new(Int64Array::from(ids.to_vec()))),
        ("name", Arc::new(StringArray::from(names.to_vec()))),
        ("wkt", Arc::new(StringArray::from(wkt.to_vec()))),
    ];
    RecordBatch::try_from_iter(columns).unwrap()
}

/// A table of `(name, wkt)` rows with no identifier column.
pub fn anonymous_batch(names: &[&str], wkt: &[Option<String>]) -> RecordBatch {
    let columns: Vec<(&str, ArrayRef)> = vec![
        ("name", Arc::new(StringArray::from(names.to_vec()))),
        ("wkt", Arc::new(StringArray::from(wkt.to_vec()))),
    ];
    RecordBatch::try_from_iter(columns).unwrap()
}

pub fn write_table(path: &Path, batch: &RecordBatch) -> ParquetDataset {
    write_parquet_atomic(path, batch.schema(), std::slice::from_ref(batch)).unwrap();
    ParquetDataset::open(path).unwrap()
}

/// Every row of a dataset in one batch.
pub fn read_all(path: &Path) -> RecordBatch {
    let dataset = ParquetDataset::open(path).unwrap();
    let schema = dataset.schema().unwrap();
    let batches = dataset.scan(&[]).unwrap();
    arrow::compute::concat_batches(&schema, &batches).unwrap()
}
