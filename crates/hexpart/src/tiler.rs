//! Per-unit hex tiling.
//!
//! A unit reads only its identifier and geometry columns, explodes every
//! geometry into simple parts, computes the cell set of each part and unnests
//! it into one record per (identifier, cell) pair. Attributes never enter
//! this step; they are joined back during consolidation.

use crate::dataset::TableSource;
use crate::error::{HexpartError, Result};
use crate::geometry::{explode, normalize, GeometryAccessor, SimplePart};
use crate::grid::{HexGrid, ResolutionPlan};
use crate::identifier::IdentifierColumn;
use crate::partition::ChunkWriter;
use crate::plan::WorkUnit;
use arrow::array::{Array, ArrayRef, UInt64Array};
use arrow::compute::{concat, take};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use geo_types::Geometry;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Result of tiling one unit.
#[derive(Debug)]
pub enum TileOutcome {
    /// The unit's offset lies beyond the data; nothing to write.
    Empty,
    Cells { rows_read: u64, batch: RecordBatch },
}

/// What happened to a unit end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Empty,
    Written {
        path: PathBuf,
        rows_read: u64,
        records: u64,
    },
}

pub struct HexTiler<'a> {
    source: &'a dyn TableSource,
    grid: &'a dyn HexGrid,
    identifier: IdentifierColumn,
    geometry: GeometryAccessor,
    resolutions: ResolutionPlan,
}

impl<'a> HexTiler<'a> {
    pub fn new(
        source: &'a dyn TableSource,
        grid: &'a dyn HexGrid,
        identifier: IdentifierColumn,
        geometry: GeometryAccessor,
        resolutions: ResolutionPlan,
    ) -> Self {
        Self {
            source,
            grid,
            identifier,
            geometry,
            resolutions,
        }
    }

    pub fn identifier(&self) -> &IdentifierColumn {
        &self.identifier
    }

    /// Columns read from the source: identifier (unless synthetic) and geometry.
    fn read_columns(&self) -> Vec<&str> {
        let mut columns = Vec::new();
        if !self.identifier.is_synthetic {
            columns.push(self.identifier.name.as_str());
        }
        for c in self.geometry.columns() {
            if !columns.contains(&c) {
                columns.push(c);
            }
        }
        columns
    }

    fn output_schema(&self, id_type: DataType) -> SchemaRef {
        let mut fields = vec![Field::new(&self.identifier.name, id_type, true)];
        fields.extend(
            self.resolutions
                .column_names()
                .into_iter()
                .map(|name| Field::new(name, DataType::UInt64, false)),
        );
        Arc::new(Schema::new(fields))
    }

    /// Distinct target-resolution cells of one geometry, in ascending order.
    fn cells_for_geometry(&self, geometry: Geometry<f64>) -> Result<BTreeSet<u64>> {
        let target = self.resolutions.target();
        let mut cells = BTreeSet::new();

        for multi in normalize(geometry)? {
            for part in explode(multi) {
                match part {
                    SimplePart::Polygon(polygon) => {
                        cells.extend(self.grid.cells_for_polygon(&polygon, target)?);
                    }
                    SimplePart::Point(point) => {
                        cells.insert(self.grid.cell_for_point(point, target)?);
                    }
                }
            }
        }

        Ok(cells)
    }

    fn id_type(&self, batches: &[RecordBatch]) -> Result<DataType> {
        if self.identifier.is_synthetic {
            return Ok(DataType::UInt64);
        }
        let schema = batches[0].schema();
        let field = schema
            .field_with_name(&self.identifier.name)
            .map_err(|_| HexpartError::ColumnNotFound(self.identifier.name.clone()))?;
        Ok(field.data_type().clone())
    }

    /// Tile one unit into a sparse (identifier, cells) batch.
    pub fn tile(&self, unit: &WorkUnit) -> Result<TileOutcome> {
        let batches = self
            .source
            .read_rows(unit.row_offset, unit.row_count, &self.read_columns())?;

        let rows_read: u64 = batches.iter().map(|b| b.num_rows() as u64).sum();
        if rows_read == 0 {
            return Ok(TileOutcome::Empty);
        }

        let schema = self.output_schema(self.id_type(&batches)?);
        let mut id_parts: Vec<ArrayRef> = Vec::with_capacity(batches.len());
        let mut cells: Vec<u64> = Vec::new();
        let mut position = unit.row_offset;

        for batch in &batches {
            let mut row_of_record: Vec<u64> = Vec::new();

            for (row, geometry) in self.geometry.decode(batch)?.into_iter().enumerate() {
                let Some(geometry) = geometry else {
                    continue;
                };
                for cell in self.cells_for_geometry(geometry)? {
                    row_of_record.push(row as u64);
                    cells.push(cell);
                }
            }

            let ids: ArrayRef = if self.identifier.is_synthetic {
                Arc::new(UInt64Array::from_iter_values(
                    row_of_record.iter().map(|&r| position + r),
                ))
            } else {
                let column = batch
                    .column_by_name(&self.identifier.name)
                    .ok_or_else(|| HexpartError::ColumnNotFound(self.identifier.name.clone()))?;
                take(column.as_ref(), &UInt64Array::from(row_of_record), None)?
            };

            id_parts.push(ids);
            position += batch.num_rows() as u64;
        }

        let id_refs: Vec<&dyn Array> = id_parts.iter().map(|a| a.as_ref()).collect();
        let mut ancestor_columns: Vec<ArrayRef> = Vec::with_capacity(self.resolutions.parents().len());
        for parent in self.resolutions.parents().iter().rev() {
            let ancestors = cells
                .iter()
                .map(|&cell| self.grid.ancestor_cell(cell, *parent))
                .collect::<Result<Vec<u64>>>()?;
            ancestor_columns.push(Arc::new(UInt64Array::from(ancestors)));
        }

        let mut columns: Vec<ArrayRef> = vec![concat(&id_refs)?, Arc::new(UInt64Array::from(cells))];
        columns.extend(ancestor_columns);

        let batch = RecordBatch::try_new(schema, columns)?;
        Ok(TileOutcome::Cells { rows_read, batch })
    }

    /// Tile `unit` and persist its chunk file.
    pub fn run(&self, unit: &WorkUnit, writer: &ChunkWriter) -> Result<UnitOutcome> {
        match self.tile(unit)? {
            TileOutcome::Empty => {
                tracing::info!(
                    logical_index = unit.logical_index,
                    row_offset = unit.row_offset,
                    "unit is past the end of the data; nothing to do"
                );
                Ok(UnitOutcome::Empty)
            }
            TileOutcome::Cells { rows_read, batch } => {
                let records = batch.num_rows() as u64;
                let path = writer.write(unit.logical_index, &batch)?;
                tracing::info!(
                    logical_index = unit.logical_index,
                    rows_read,
                    records,
                    path = %path.display(),
                    "wrote chunk"
                );
                Ok(UnitOutcome::Written {
                    path,
                    rows_read,
                    records,
                })
            }
        }
    }
}
