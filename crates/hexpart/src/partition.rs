//! Chunk files and their consolidation into root-cell partitions.
//!
//! Chunk phase: each unit writes one sparse file holding only the identifier
//! and cell columns, named by its logical index.
//!
//! Consolidation phase: all chunk files are joined back to the source
//! attributes (geometry excluded) and rewritten as one file per root cell
//! under `h3_res0={cell:x}/`. Partitions are staged locally and handed to an
//! [`Uploader`] in one go. Output file names are deterministic, so running
//! consolidation again over the same chunks rewrites the same files.

use crate::dataset::{
    list_parquet_files, temp_path_for, write_parquet_atomic, writer_properties, ParquetDataset,
    TableSource,
};
use crate::error::{HexpartError, Result};
use crate::geometry::GeometryAccessor;
use crate::grid::{parse_cell_column, Resolution};
use crate::identifier::{IdentifierResolver, SYNTHETIC_ID_COLUMN};
use crate::upload::Uploader;
use arrow::array::{Array, ArrayRef, AsArray, UInt64Array};
use arrow::compute::{cast, concat_batches, take};
use arrow::datatypes::UInt64Type;
use arrow::record_batch::RecordBatch;
use arrow::row::{OwnedRow, RowConverter, SortField};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::arrow::ArrowWriter;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CHUNK_PREFIX: &str = "chunk_";
const PARTITION_FILE: &str = "part-00000.parquet";

/// Writes per-unit chunk files into one directory.
#[derive(Debug, Clone)]
pub struct ChunkWriter {
    dir: PathBuf,
}

impl ChunkWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, logical_index: u64) -> PathBuf {
        self.dir
            .join(format!("{CHUNK_PREFIX}{logical_index:06}.parquet"))
    }

    /// Atomically write (or replace) the chunk file of `logical_index`.
    pub fn write(&self, logical_index: u64, batch: &RecordBatch) -> Result<PathBuf> {
        let path = self.path_for(logical_index);
        write_parquet_atomic(&path, batch.schema(), std::slice::from_ref(batch))?;
        Ok(path)
    }

    /// Completed chunk files currently present, sorted.
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        list_parquet_files(&self.dir, |p| {
            p.file_name()
                .and_then(|s| s.to_str())
                .map(|s| s.starts_with(CHUNK_PREFIX))
                .unwrap_or(false)
        })
    }
}

/// Source table the attributes are joined from.
pub struct AttributeSource<'a> {
    pub table: &'a dyn TableSource,
    pub geometry: GeometryAccessor,
}

#[derive(Debug, Clone)]
pub struct ConsolidationOptions {
    pub staging_dir: PathBuf,
    pub identifier_hint: Option<String>,
    /// Delete chunk files after a successful upload.
    pub cleanup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsolidationReport {
    pub chunk_files: usize,
    pub records_read: u64,
    pub records_written: u64,
    pub partitions: usize,
    pub cleanup_failures: usize,
}

/// Source attributes indexed by join key.
struct AttributeIndex {
    attributes: RecordBatch,
    key_type: DataType,
    converter: RowConverter,
    /// Source row position of each key.
    rows: HashMap<OwnedRow, u64>,
}

impl AttributeIndex {
    fn build(source: &AttributeSource<'_>, chunk_id: &str, reserved: &[String]) -> Result<Self> {
        let schema = source.table.schema()?;
        let columns: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        let resolver = IdentifierResolver::default();

        let source_id = resolver.find(&columns, chunk_id).map(str::to_string);
        if source_id.is_none() && !chunk_id.eq_ignore_ascii_case(SYNTHETIC_ID_COLUMN) {
            return Err(HexpartError::ColumnNotFound(format!(
                "identifier '{chunk_id}' in source attributes"
            )));
        }

        let excluded = source.geometry.excluded_from_output();
        let attribute_columns: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !excluded.contains(c))
            .filter(|c| Some(*c) != source_id.as_deref())
            .filter(|c| !reserved.iter().any(|r| r.eq_ignore_ascii_case(c)))
            .collect();

        let mut projection = attribute_columns.clone();
        if let Some(id) = source_id.as_deref() {
            projection.push(id);
        }

        let batches = if projection.is_empty() {
            Vec::new()
        } else {
            source.table.scan(&projection)?
        };
        let scanned_schema = match batches.first() {
            Some(b) => b.schema(),
            None => Arc::new(Schema::new(
                projection
                    .iter()
                    .map(|c| schema.field_with_name(c).cloned())
                    .collect::<std::result::Result<Vec<Field>, _>>()?,
            )),
        };
        let combined = concat_batches(&scanned_schema, &batches)?;

        let key: ArrayRef = match source_id.as_deref() {
            Some(id) => combined
                .column_by_name(id)
                .cloned()
                .ok_or_else(|| HexpartError::ColumnNotFound(id.to_string()))?,
            None => {
                let rows = if projection.is_empty() {
                    source.table.count_rows().map_err(|e| {
                        HexpartError::InvalidConfig(format!("cannot number source rows: {e}"))
                    })?
                } else {
                    combined.num_rows() as u64
                };
                Arc::new(UInt64Array::from_iter_values(0..rows))
            }
        };

        let attribute_indices: Vec<usize> = attribute_columns
            .iter()
            .map(|c| combined.schema().index_of(c))
            .collect::<std::result::Result<_, _>>()?;
        let attributes = combined.project(&attribute_indices)?;

        let key_type = key.data_type().clone();
        let converter = RowConverter::new(vec![SortField::new(key_type.clone())])?;
        let keys = converter.convert_columns(&[key])?;

        let mut rows = HashMap::with_capacity(keys.num_rows());
        let mut duplicates = 0u64;
        for (i, row) in keys.iter().enumerate() {
            if rows.insert(row.owned(), i as u64).is_some() {
                duplicates += 1;
            }
        }
        if duplicates > 0 {
            tracing::warn!(duplicates, "source identifier has duplicate values; last row wins");
        }

        Ok(Self {
            attributes,
            key_type,
            converter,
            rows,
        })
    }

    /// Inner-join `chunk` to the attributes on `id_column`.
    fn join(&self, chunk: &RecordBatch, id_column: &str) -> Result<RecordBatch> {
        let ids = chunk
            .column_by_name(id_column)
            .ok_or_else(|| HexpartError::ColumnNotFound(id_column.to_string()))?;
        let ids = if ids.data_type() == &self.key_type {
            ids.clone()
        } else {
            cast(ids, &self.key_type)?
        };

        let keys = self.converter.convert_columns(&[ids])?;
        let mut left = Vec::with_capacity(chunk.num_rows());
        let mut right = Vec::with_capacity(chunk.num_rows());
        for (i, key) in keys.iter().enumerate() {
            if let Some(&row) = self.rows.get(&key.owned()) {
                left.push(i as u64);
                right.push(row);
            }
        }

        let left = UInt64Array::from(left);
        let right = UInt64Array::from(right);

        let mut fields: Vec<Field> = chunk.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
        fields.extend(self.attributes.schema().fields().iter().map(|f| f.as_ref().clone()));

        let mut columns = Vec::with_capacity(fields.len());
        for column in chunk.columns() {
            columns.push(take(column.as_ref(), &left, None)?);
        }
        for column in self.attributes.columns() {
            columns.push(take(column.as_ref(), &right, None)?);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }
}

/// One open writer per root cell, finalized by rename.
struct PartitionSink {
    dir: PathBuf,
    column: String,
    writers: BTreeMap<u64, (PathBuf, PathBuf, ArrowWriter<File>)>,
    records: u64,
}

impl PartitionSink {
    fn new(dir: &Path, column: String) -> Self {
        Self {
            dir: dir.to_path_buf(),
            column,
            writers: BTreeMap::new(),
            records: 0,
        }
    }

    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        let root_idx = batch.schema().index_of(&self.column)?;
        let roots = batch.column(root_idx).as_primitive::<UInt64Type>().clone();

        let mut groups: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for (i, cell) in roots.iter().enumerate() {
            if let Some(cell) = cell {
                groups.entry(cell).or_default().push(i as u64);
            }
        }

        let keep: Vec<usize> = (0..batch.num_columns()).filter(|&i| i != root_idx).collect();
        let body = batch.project(&keep)?;

        for (cell, rows) in groups {
            let indices = UInt64Array::from(rows);
            let columns = body
                .columns()
                .iter()
                .map(|c| take(c.as_ref(), &indices, None))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let part = RecordBatch::try_new(body.schema(), columns)?;

            let writer = match self.writers.entry(cell) {
                std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::btree_map::Entry::Vacant(e) => {
                    let dir = self.dir.join(format!("{}={cell:x}", self.column));
                    fs::create_dir_all(&dir)?;
                    let path = dir.join(PARTITION_FILE);
                    let tmp = temp_path_for(&path);
                    let writer = ArrowWriter::try_new(
                        File::create(&tmp)?,
                        body.schema(),
                        Some(writer_properties()),
                    )?;
                    e.insert((tmp, path, writer))
                }
            };
            writer.2.write(&part)?;
            self.records += part.num_rows() as u64;
        }

        Ok(())
    }

    fn finish(self) -> Result<(usize, u64)> {
        let partitions = self.writers.len();
        for (_, (tmp, path, writer)) in self.writers {
            writer.close()?;
            fs::rename(&tmp, &path)?;
        }
        Ok((partitions, self.records))
    }
}

pub struct Consolidator<'a> {
    chunks: ChunkWriter,
    options: ConsolidationOptions,
    source: Option<AttributeSource<'a>>,
    uploader: &'a dyn Uploader,
}

impl<'a> Consolidator<'a> {
    pub fn new(
        chunks: ChunkWriter,
        options: ConsolidationOptions,
        source: Option<AttributeSource<'a>>,
        uploader: &'a dyn Uploader,
    ) -> Self {
        Self {
            chunks,
            options,
            source,
            uploader,
        }
    }

    /// Identifier and root cell column of the chunk schema.
    fn chunk_columns(&self, schema: &SchemaRef) -> Result<(String, Resolution)> {
        let mut root: Option<Resolution> = None;
        let mut other: Vec<&str> = Vec::new();
        for field in schema.fields() {
            match parse_cell_column(field.name()) {
                Some(res) => root = Some(root.map_or(res, |r| r.min(res))),
                None => other.push(field.name().as_str()),
            }
        }

        let root = root.ok_or_else(|| HexpartError::ColumnNotFound("h3_res* cell column".into()))?;
        let id = IdentifierResolver::default()
            .match_name(&other, self.options.identifier_hint.as_deref())?
            .ok_or_else(|| HexpartError::ColumnNotFound("identifier column in chunk files".into()))?;

        Ok((id, root))
    }

    pub fn run(&self) -> Result<ConsolidationReport> {
        let files = self.chunks.discover()?;
        if files.is_empty() {
            tracing::warn!(dir = %self.chunks.dir().display(), "no chunk files to consolidate");
            return Ok(ConsolidationReport::default());
        }

        let first_schema = ParquetDataset::open(&files[0])?.schema()?;
        let (id_column, root) = self.chunk_columns(&first_schema)?;
        let root_column = root.column_name();
        tracing::info!(
            chunk_files = files.len(),
            identifier = %id_column,
            root = %root_column,
            "consolidating"
        );

        let reserved: Vec<String> = first_schema
            .fields()
            .iter()
            .filter(|f| f.name() != &id_column)
            .map(|f| f.name().clone())
            .collect();
        let index = self
            .source
            .as_ref()
            .map(|s| AttributeIndex::build(s, &id_column, &reserved))
            .transpose()?;

        let staging = &self.options.staging_dir;
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        fs::create_dir_all(staging)?;

        let mut sink = PartitionSink::new(staging, root_column);
        let mut records_read = 0u64;

        for file in &files {
            let chunk = ParquetDataset::open(file)?;
            if chunk.schema()? != first_schema {
                return Err(HexpartError::InvalidConfig(format!(
                    "chunk file {} has a different schema",
                    file.display()
                )));
            }

            for batch in chunk.scan(&[])? {
                records_read += batch.num_rows() as u64;
                let joined = match &index {
                    Some(index) => index.join(&batch, &id_column)?,
                    None => batch,
                };
                sink.write(&joined)?;
            }
        }

        let (partitions, records_written) = sink.finish()?;

        tracing::info!(
            destination = %self.uploader.destination(),
            partitions,
            "uploading staged partitions"
        );
        self.uploader.upload(staging)?;

        let mut cleanup_failures = 0;
        if self.options.cleanup {
            for file in &files {
                if let Err(e) = fs::remove_file(file) {
                    cleanup_failures += 1;
                    tracing::warn!(file = %file.display(), error = %e, "failed to delete chunk file");
                }
            }
        }

        Ok(ConsolidationReport {
            chunk_files: files.len(),
            records_read,
            records_written,
            partitions,
            cleanup_failures,
        })
    }
}
