//! Row identifier resolution.
//!
//! Datasets rarely agree on what their identifier column is called, or on its
//! casing. Resolution tries a user hint first and otherwise walks an ordered
//! list of conventional names against a case-normalized view of the schema.

use crate::dataset::TableSource;
use crate::error::{HexpartError, Result};
use arrow::row::{OwnedRow, RowConverter, SortField};
use std::collections::{HashMap, HashSet};

/// Name of the generated identifier column.
pub const SYNTHETIC_ID_COLUMN: &str = "hexpart_row_id";

/// Conventional identifier names, most specific first.
pub const ID_CANDIDATES: &[&str] = &[
    SYNTHETIC_ID_COLUMN,
    "ogc_fid",
    "objectid",
    "fid",
    "id",
    "gid",
    "feature_id",
    "uid",
];

/// A resolved row identifier.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdentifierColumn {
    pub name: String,
    pub is_unique: bool,
    pub is_synthetic: bool,
}

impl IdentifierColumn {
    pub fn synthetic() -> Self {
        Self {
            name: SYNTHETIC_ID_COLUMN.to_string(),
            is_unique: true,
            is_synthetic: true,
        }
    }
}

/// Outcome of resolution. `NotFound` is a valid answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// Column named by the caller.
    Specified(IdentifierColumn),
    /// Column found through the candidate list.
    Detected(IdentifierColumn),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct IdentifierResolver {
    pub case_insensitive: bool,
    pub check_unique: bool,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self {
            case_insensitive: true,
            check_unique: true,
        }
    }
}

impl IdentifierResolver {
    /// Find `name` in `columns`, returning the schema's own spelling.
    pub fn find<'a>(&self, columns: &[&'a str], name: &str) -> Option<&'a str> {
        if self.case_insensitive {
            let wanted = name.to_lowercase();
            columns.iter().copied().find(|c| c.to_lowercase() == wanted)
        } else {
            columns.iter().copied().find(|c| *c == name)
        }
    }

    /// Schema-only resolution: match the hint, else the first candidate.
    pub fn match_name(&self, columns: &[&str], specified: Option<&str>) -> Result<Option<String>> {
        if let Some(name) = specified {
            return self
                .find(columns, name)
                .map(|c| Some(c.to_string()))
                .ok_or_else(|| HexpartError::ColumnNotFound(name.to_string()));
        }

        let normalized: HashMap<String, &str> = if self.case_insensitive {
            columns.iter().map(|c| (c.to_lowercase(), *c)).collect()
        } else {
            columns.iter().map(|c| (c.to_string(), *c)).collect()
        };

        Ok(ID_CANDIDATES
            .iter()
            .find_map(|candidate| normalized.get(*candidate))
            .map(|c| c.to_string()))
    }

    /// Resolve the identifier of `source`, checking uniqueness if enabled.
    ///
    /// A non-unique user-specified column is an error; a non-unique detected
    /// column is reported with `is_unique = false` and left to the caller.
    pub fn resolve(&self, source: &dyn TableSource, specified: Option<&str>) -> Result<Resolved> {
        let schema = source.schema()?;
        let columns: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();

        let Some(name) = self.match_name(&columns, specified)? else {
            return Ok(Resolved::NotFound);
        };

        let is_unique = if self.check_unique {
            let (rows, distinct) = value_counts(source, &name)?;
            if rows != distinct {
                if specified.is_some() {
                    return Err(HexpartError::NonUniqueIdentifier {
                        column: name,
                        rows,
                        distinct,
                    });
                }
                tracing::warn!(
                    column = %name,
                    rows,
                    distinct,
                    "auto-detected identifier column is not unique"
                );
                false
            } else {
                true
            }
        } else {
            true
        };

        let column = IdentifierColumn {
            name,
            is_unique,
            is_synthetic: false,
        };

        Ok(if specified.is_some() {
            Resolved::Specified(column)
        } else {
            Resolved::Detected(column)
        })
    }

    /// Resolve, substituting the synthetic identifier when none is usable.
    pub fn resolve_or_synthesize(
        &self,
        source: &dyn TableSource,
        specified: Option<&str>,
    ) -> Result<IdentifierColumn> {
        match self.resolve(source, specified)? {
            Resolved::Specified(column) => Ok(column),
            Resolved::Detected(column) if column.is_unique => Ok(column),
            Resolved::Detected(column) => {
                tracing::warn!(
                    column = %column.name,
                    "falling back to synthetic identifier '{}'",
                    SYNTHETIC_ID_COLUMN
                );
                Ok(IdentifierColumn::synthetic())
            }
            Resolved::NotFound => {
                tracing::info!(
                    "no identifier column found; generating '{}'",
                    SYNTHETIC_ID_COLUMN
                );
                Ok(IdentifierColumn::synthetic())
            }
        }
    }

    /// Reattach an identifier resolved once for the dataset, from its name.
    ///
    /// Only the schema is read. The synthetic name stands for the generated
    /// identifier unless the table really has such a column.
    pub fn attach(&self, source: &dyn TableSource, name: &str) -> Result<IdentifierColumn> {
        let schema = source.schema()?;
        let columns: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();

        match self.find(&columns, name) {
            Some(column) => Ok(IdentifierColumn {
                name: column.to_string(),
                is_unique: true,
                is_synthetic: false,
            }),
            None if name == SYNTHETIC_ID_COLUMN => Ok(IdentifierColumn::synthetic()),
            None => Err(HexpartError::ColumnNotFound(name.to_string())),
        }
    }
}

/// Total and distinct (null-aware) value counts of one column.
pub fn value_counts(source: &dyn TableSource, column: &str) -> Result<(u64, u64)> {
    let batches = source.scan(&[column])?;

    let Some(first) = batches.first() else {
        return Ok((0, 0));
    };
    let field = first.schema().field(0).clone();
    let converter = RowConverter::new(vec![SortField::new(field.data_type().clone())])?;

    let mut seen: HashSet<OwnedRow> = HashSet::new();
    let mut rows = 0u64;
    for batch in &batches {
        rows += batch.num_rows() as u64;
        let converted = converter.convert_columns(&[batch.column(0).clone()])?;
        for row in converted.iter() {
            seen.insert(row.owned());
        }
    }

    Ok((rows, seen.len() as u64))
}
