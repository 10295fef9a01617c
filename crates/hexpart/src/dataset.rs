//! Table sources and atomic Parquet writes.
//!
//! A [`ParquetDataset`] is either one Parquet file or a directory of them.
//! Files are always visited in sorted path order, so a global row position
//! means the same row for every reader.

use crate::error::{EstimationFailed, HexpartError, Result};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const READ_BATCH_SIZE: usize = 8192;

/// Marker embedded in in-flight file names; discovery skips such files.
pub const TEMP_MARKER: &str = ".tmp-";

/// A readable table with a known schema and a countable number of rows.
pub trait TableSource: Send + Sync {
    fn schema(&self) -> Result<SchemaRef>;

    /// Total rows, or [`EstimationFailed`] when metadata cannot be read.
    fn count_rows(&self) -> std::result::Result<u64, EstimationFailed>;

    /// Read up to `limit` rows starting at global row `offset`, projected to
    /// `columns` (all columns when empty). Returns no batches past the end.
    fn read_rows(&self, offset: u64, limit: u64, columns: &[&str]) -> Result<Vec<RecordBatch>>;

    /// Read every row, projected to `columns`.
    fn scan(&self, columns: &[&str]) -> Result<Vec<RecordBatch>> {
        self.read_rows(0, u64::MAX, columns)
    }
}

/// One Parquet file or a directory tree of Parquet files.
#[derive(Debug, Clone)]
pub struct ParquetDataset {
    files: Vec<PathBuf>,
}

impl ParquetDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let files = if path.is_dir() {
            list_parquet_files(path, |_| true)?
        } else if path.is_file() {
            vec![path.to_path_buf()]
        } else {
            return Err(HexpartError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("dataset not found: {}", path.display()),
            )));
        };

        if files.is_empty() {
            return Err(HexpartError::InvalidConfig(format!(
                "no parquet files under {}",
                path.display()
            )));
        }

        Ok(Self { files })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn file_rows(path: &Path) -> Result<u64> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        Ok(builder.metadata().file_metadata().num_rows().max(0) as u64)
    }

    fn read_file(
        path: &Path,
        offset: usize,
        limit: usize,
        columns: &[&str],
        out: &mut Vec<RecordBatch>,
    ) -> Result<()> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;

        let builder = if columns.is_empty() {
            builder
        } else {
            let arrow_schema = builder.schema().clone();
            let mut roots = Vec::with_capacity(columns.len());
            for name in columns {
                let idx = arrow_schema
                    .index_of(name)
                    .map_err(|_| HexpartError::ColumnNotFound(name.to_string()))?;
                roots.push(idx);
            }
            let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
            builder.with_projection(mask)
        };

        let reader = builder
            .with_batch_size(READ_BATCH_SIZE)
            .with_offset(offset)
            .with_limit(limit)
            .build()?;

        for batch in reader {
            let batch = batch?;
            if batch.num_rows() > 0 {
                out.push(batch);
            }
        }
        Ok(())
    }
}

impl TableSource for ParquetDataset {
    fn schema(&self) -> Result<SchemaRef> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&self.files[0])?)?;
        Ok(builder.schema().clone())
    }

    fn count_rows(&self) -> std::result::Result<u64, EstimationFailed> {
        let mut total = 0u64;
        for file in &self.files {
            total += Self::file_rows(file)
                .map_err(|e| EstimationFailed::new(format!("{}: {e}", file.display())))?;
        }
        Ok(total)
    }

    fn read_rows(&self, offset: u64, limit: u64, columns: &[&str]) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        let mut skip = offset;
        let mut remaining = limit;

        for file in &self.files {
            if remaining == 0 {
                break;
            }

            let rows = Self::file_rows(file)?;
            if skip >= rows {
                skip -= rows;
                continue;
            }

            let take = remaining.min(rows - skip);
            Self::read_file(file, skip as usize, take as usize, columns, &mut out)?;
            remaining -= take;
            skip = 0;
        }

        Ok(out)
    }
}

/// Recursively list `*.parquet` files under `dir` (sorted), skipping in-flight
/// temp files and anything `keep` rejects.
pub fn list_parquet_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.map_err(|e| HexpartError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.contains(TEMP_MARKER) {
            continue;
        }

        let is_parquet = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.eq_ignore_ascii_case("parquet"))
            .unwrap_or(false);

        if is_parquet && keep(&path) {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

/// Temp path beside `path`, unique per writer.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4().simple()))
}

pub fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Write `batches` to `path` via a temp file and rename, so readers never
/// observe a partial file. An existing file at `path` is replaced.
pub fn write_parquet_atomic(path: &Path, schema: SchemaRef, batches: &[RecordBatch]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path_for(path);
    let written = (|| -> Result<()> {
        let mut writer = ArrowWriter::try_new(File::create(&tmp)?, schema, Some(writer_properties()))?;
        for batch in batches {
            writer.write(batch)?;
        }
        writer.close()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int64Array, StringArray};
    use arrow::datatypes::Int64Type;
    use arrow::array::AsArray;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn write_ids(path: &Path, ids: std::ops::Range<i64>) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let names: Vec<String> = ids.clone().map(|i| format!("n{i}")).collect();
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from_iter_values(ids)) as ArrayRef,
                Arc::new(StringArray::from(names)) as ArrayRef,
            ],
        )
        .unwrap();
        write_parquet_atomic(path, schema, &[batch]).unwrap();
    }

    fn collect_ids(batches: &[RecordBatch]) -> Vec<i64> {
        batches
            .iter()
            .flat_map(|b| {
                b.column_by_name("id")
                    .unwrap()
                    .as_primitive::<Int64Type>()
                    .values()
                    .to_vec()
            })
            .collect()
    }

    #[test]
    fn test_reads_span_files_in_path_order() {
        let dir = tempfile::tempdir().unwrap();
        write_ids(&dir.path().join("b.parquet"), 10..20);
        write_ids(&dir.path().join("a.parquet"), 0..10);

        let ds = ParquetDataset::open(dir.path()).unwrap();
        assert_eq!(ds.count_rows().unwrap(), 20);

        let batches = ds.read_rows(8, 4, &["id"]).unwrap();
        assert_eq!(collect_ids(&batches), vec![8, 9, 10, 11]);
        assert_eq!(batches[0].num_columns(), 1);
    }

    #[test]
    fn test_read_past_end_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        write_ids(&dir.path().join("a.parquet"), 0..5);

        let ds = ParquetDataset::open(dir.path()).unwrap();
        assert!(ds.read_rows(5, 10, &[]).unwrap().is_empty());
        assert!(ds.read_rows(500, 10, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_missing_column_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_ids(&dir.path().join("a.parquet"), 0..5);

        let ds = ParquetDataset::open(dir.path()).unwrap();
        assert!(matches!(
            ds.read_rows(0, 5, &["nope"]),
            Err(HexpartError::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_listing_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        write_ids(&dir.path().join("a.parquet"), 0..5);
        fs::write(dir.path().join("b.parquet.tmp-123"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let files = list_parquet_files(dir.path(), |_| true).unwrap();
        assert_eq!(files.len(), 1);
    }
}
