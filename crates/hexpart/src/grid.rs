//! Hex-cell grid primitive and resolution bookkeeping.
//!
//! The cell math itself is delegated to a [`HexGrid`] implementation. The
//! default one, [`H3Grid`], is backed by `h3o`; tests substitute their own.
//!
//! Cell columns are always `UInt64` and named `h3_res{N}`.

use crate::error::{HexpartError, Result};
use geo_types::{Point, Polygon};
use h3o::geom::{ContainmentMode, TilerBuilder};
use h3o::{CellIndex, LatLng};
use serde::{Deserialize, Serialize};

/// Finest resolution supported by the grid.
pub const MAX_RESOLUTION: u8 = 15;

/// Resolution used for final output partitioning.
pub const ROOT_RESOLUTION: Resolution = Resolution(0);

const CELL_COLUMN_PREFIX: &str = "h3_res";

/// A validated grid resolution (0 = coarsest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Resolution(u8);

impl Resolution {
    pub fn new(value: u8) -> Result<Self> {
        if value > MAX_RESOLUTION {
            return Err(HexpartError::InvalidResolution(value));
        }
        Ok(Self(value))
    }

    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Name of the cell column holding cells at this resolution.
    pub fn column_name(self) -> String {
        format!("{CELL_COLUMN_PREFIX}{}", self.0)
    }
}

impl TryFrom<u8> for Resolution {
    type Error = HexpartError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Resolution> for u8 {
    fn from(res: Resolution) -> u8 {
        res.0
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns the resolution encoded in a cell column name, if `name` is one.
pub fn parse_cell_column(name: &str) -> Option<Resolution> {
    let digits = name.strip_prefix(CELL_COLUMN_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u8>().ok().and_then(|r| Resolution::new(r).ok())
}

#[inline]
pub fn is_cell_column(name: &str) -> bool {
    parse_cell_column(name).is_some()
}

/// Target resolution plus the coarser ancestors materialized beside it.
///
/// Parents are sorted coarse-to-fine, deduplicated, strictly coarser than the
/// target, and always include the root resolution (unless the target is the root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionPlan {
    target: Resolution,
    parents: Vec<Resolution>,
}

impl ResolutionPlan {
    pub fn new(target: u8, parents: &[u8]) -> Result<Self> {
        let target = Resolution::new(target)?;

        let mut resolved = Vec::with_capacity(parents.len() + 1);
        for &p in parents {
            let parent = Resolution::new(p)?;
            if parent >= target {
                return Err(HexpartError::InvalidConfig(format!(
                    "parent resolution {parent} must be coarser than target {target}"
                )));
            }
            resolved.push(parent);
        }

        if target != ROOT_RESOLUTION {
            resolved.push(ROOT_RESOLUTION);
        }
        resolved.sort_unstable();
        resolved.dedup();

        Ok(Self {
            target,
            parents: resolved,
        })
    }

    pub fn target(&self) -> Resolution {
        self.target
    }

    pub fn parents(&self) -> &[Resolution] {
        &self.parents
    }

    /// Coarsest resolution in the plan; output is partitioned by it.
    pub fn root(&self) -> Resolution {
        self.parents.first().copied().unwrap_or(self.target)
    }

    /// Cell column names in output order: target first, then parents fine-to-coarse.
    pub fn column_names(&self) -> Vec<String> {
        std::iter::once(self.target)
            .chain(self.parents.iter().rev().copied())
            .map(Resolution::column_name)
            .collect()
    }
}

/// The hex-cell primitive: cell sets for simple geometries and ancestor lookup.
pub trait HexGrid: Send + Sync {
    /// Cells at `res` covering a simple polygon (lon/lat degrees). May be empty.
    fn cells_for_polygon(&self, polygon: &Polygon<f64>, res: Resolution) -> Result<Vec<u64>>;

    /// Cell at `res` containing a point (x = lon, y = lat, degrees).
    fn cell_for_point(&self, point: Point<f64>, res: Resolution) -> Result<u64>;

    /// Ancestor of `cell` at the coarser resolution `res`.
    fn ancestor_cell(&self, cell: u64, res: Resolution) -> Result<u64>;
}

/// How polygon coverage decides whether a cell belongs to a polygon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Containment {
    /// Cells whose centroid lies inside the polygon.
    Centroid,
    /// Cells intersecting the polygon; a polygon inside one cell yields that cell.
    #[default]
    Intersects,
    /// Cells fully covering the polygon, possibly with a margin.
    Covers,
}

impl std::str::FromStr for Containment {
    type Err = HexpartError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "centroid" => Ok(Self::Centroid),
            "intersects" => Ok(Self::Intersects),
            "covers" => Ok(Self::Covers),
            other => Err(HexpartError::InvalidConfig(format!(
                "unknown containment mode '{other}'"
            ))),
        }
    }
}

/// [`HexGrid`] backed by the H3 system.
#[derive(Debug, Clone, Copy, Default)]
pub struct H3Grid {
    containment: Containment,
}

impl H3Grid {
    pub fn new(containment: Containment) -> Self {
        Self { containment }
    }

    fn h3_resolution(res: Resolution) -> Result<h3o::Resolution> {
        h3o::Resolution::try_from(res.get()).map_err(|e| HexpartError::Grid(e.to_string()))
    }
}

impl HexGrid for H3Grid {
    fn cells_for_polygon(&self, polygon: &Polygon<f64>, res: Resolution) -> Result<Vec<u64>> {
        let mode = match self.containment {
            Containment::Centroid => ContainmentMode::ContainsCentroid,
            Containment::Intersects => ContainmentMode::IntersectsBoundary,
            Containment::Covers => ContainmentMode::Covers,
        };

        let mut tiler = TilerBuilder::new(Self::h3_resolution(res)?)
            .containment_mode(mode)
            .build();
        tiler
            .add(polygon.clone())
            .map_err(|e| HexpartError::Grid(e.to_string()))?;

        Ok(tiler.into_coverage().map(u64::from).collect())
    }

    fn cell_for_point(&self, point: Point<f64>, res: Resolution) -> Result<u64> {
        let ll = LatLng::new(point.y(), point.x()).map_err(|e| HexpartError::Grid(e.to_string()))?;
        Ok(u64::from(ll.to_cell(Self::h3_resolution(res)?)))
    }

    fn ancestor_cell(&self, cell: u64, res: Resolution) -> Result<u64> {
        let index = CellIndex::try_from(cell).map_err(|e| HexpartError::Grid(e.to_string()))?;
        index
            .parent(Self::h3_resolution(res)?)
            .map(u64::from)
            .ok_or_else(|| {
                HexpartError::Grid(format!(
                    "cell {cell:x} at resolution {} has no ancestor at {res}",
                    u8::from(index.resolution())
                ))
            })
    }
}
