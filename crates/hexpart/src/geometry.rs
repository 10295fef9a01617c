//! Geometry access, normalization and explosion into simple parts.
//!
//! Rows carry geometry either as WKT text or as a coordinate pair (raster
//! cells and point tables). Every geometry is normalized to its multi-part
//! form before being exploded, so the cell computation only ever sees simple
//! polygons and points.

use crate::error::{HexpartError, Result};
use arrow::array::{Array, AsArray, Float64Array};
use arrow::compute::cast;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use geo_types::{Geometry, MultiPoint, MultiPolygon, Point, Polygon};
use serde::{Deserialize, Serialize};

/// Where a row's geometry lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GeometryAccessor {
    /// WKT text in a single string column.
    Wkt { column: String },
    /// Longitude/latitude pair in two numeric columns.
    Coordinates { x: String, y: String },
}

impl GeometryAccessor {
    /// Source columns the accessor reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            GeometryAccessor::Wkt { column } => vec![column.as_str()],
            GeometryAccessor::Coordinates { x, y } => vec![x.as_str(), y.as_str()],
        }
    }

    /// Columns dropped from the consolidated output. Coordinate pairs are
    /// ordinary attributes and are kept.
    pub fn excluded_from_output(&self) -> Vec<&str> {
        match self {
            GeometryAccessor::Wkt { column } => vec![column.as_str()],
            GeometryAccessor::Coordinates { .. } => Vec::new(),
        }
    }

    /// Decode the geometry of every row in `batch`. Nulls decode to `None`.
    pub fn decode(&self, batch: &RecordBatch) -> Result<Vec<Option<Geometry<f64>>>> {
        match self {
            GeometryAccessor::Wkt { column } => {
                let array = batch
                    .column_by_name(column)
                    .ok_or_else(|| HexpartError::ColumnNotFound(column.clone()))?;
                decode_wkt_column(array.as_ref())
            }
            GeometryAccessor::Coordinates { x, y } => {
                let xs = float_column(batch, x)?;
                let ys = float_column(batch, y)?;
                Ok((0..batch.num_rows())
                    .map(|i| {
                        if xs.is_null(i) || ys.is_null(i) {
                            None
                        } else {
                            Some(Geometry::Point(Point::new(xs.value(i), ys.value(i))))
                        }
                    })
                    .collect())
            }
        }
    }
}

fn float_column(batch: &RecordBatch, name: &str) -> Result<Float64Array> {
    let array = batch
        .column_by_name(name)
        .ok_or_else(|| HexpartError::ColumnNotFound(name.to_string()))?;
    let casted = cast(array, &DataType::Float64)?;
    Ok(casted.as_primitive::<arrow::datatypes::Float64Type>().clone())
}

fn decode_wkt_column(array: &dyn Array) -> Result<Vec<Option<Geometry<f64>>>> {
    let values: Vec<Option<&str>> = match array.data_type() {
        DataType::Utf8 => array.as_string::<i32>().iter().collect(),
        DataType::LargeUtf8 => array.as_string::<i64>().iter().collect(),
        other => {
            return Err(HexpartError::InvalidConfig(format!(
                "WKT geometry column must be a string column, found {other}"
            )))
        }
    };

    values
        .into_iter()
        .map(|v| match v {
            Some(text) if !text.trim().is_empty() => parse_wkt(text).map(Some),
            _ => Ok(None),
        })
        .collect()
}

/// Parse a WKT string into a geo-types geometry.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>> {
    use std::str::FromStr;
    wkt::Wkt::from_str(text)
        .map_err(|e| HexpartError::WktParse(format!("{:?}", e)))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| HexpartError::WktParse(format!("{:?}", e)))
        })
}

/// A geometry promoted to its multi-part form.
#[derive(Debug, Clone, PartialEq)]
pub enum MultiGeometry {
    Polygons(MultiPolygon<f64>),
    Points(MultiPoint<f64>),
}

/// A single simple part, the unit the cell primitive operates on.
#[derive(Debug, Clone, PartialEq)]
pub enum SimplePart {
    Polygon(Polygon<f64>),
    Point(Point<f64>),
}

/// Promote single geometries to multi-geometries. Collections are flattened
/// into one multi-geometry per member.
pub fn normalize(geometry: Geometry<f64>) -> Result<Vec<MultiGeometry>> {
    match geometry {
        Geometry::Polygon(p) => Ok(vec![MultiGeometry::Polygons(MultiPolygon(vec![p]))]),
        Geometry::MultiPolygon(mp) => Ok(vec![MultiGeometry::Polygons(mp)]),
        Geometry::Point(p) => Ok(vec![MultiGeometry::Points(MultiPoint(vec![p]))]),
        Geometry::MultiPoint(mp) => Ok(vec![MultiGeometry::Points(mp)]),
        Geometry::Rect(r) => Ok(vec![MultiGeometry::Polygons(MultiPolygon(vec![
            r.to_polygon()
        ]))]),
        Geometry::Triangle(t) => Ok(vec![MultiGeometry::Polygons(MultiPolygon(vec![
            t.to_polygon()
        ]))]),
        Geometry::GeometryCollection(gc) => {
            let mut out = Vec::new();
            for member in gc.0 {
                out.extend(normalize(member)?);
            }
            Ok(out)
        }
        Geometry::Line(_) => Err(HexpartError::UnsupportedGeometry("Line".into())),
        Geometry::LineString(_) => Err(HexpartError::UnsupportedGeometry("LineString".into())),
        Geometry::MultiLineString(_) => {
            Err(HexpartError::UnsupportedGeometry("MultiLineString".into()))
        }
    }
}

/// Explode a multi-geometry into its simple parts, one per member.
pub fn explode(multi: MultiGeometry) -> impl Iterator<Item = SimplePart> {
    let parts: Vec<SimplePart> = match multi {
        MultiGeometry::Polygons(mp) => mp.0.into_iter().map(SimplePart::Polygon).collect(),
        MultiGeometry::Points(mp) => mp.0.into_iter().map(SimplePart::Point).collect(),
    };
    parts.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, Int32Array, StringArray};
    use arrow_schema::{Field, Schema};
    use std::sync::Arc;

    #[test]
    fn test_polygon_is_promoted_then_exploded() {
        let geom = parse_wkt("POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))").unwrap();
        let normalized = normalize(geom).unwrap();
        assert_eq!(normalized.len(), 1);
        assert!(matches!(&normalized[0], MultiGeometry::Polygons(mp) if mp.0.len() == 1));

        let parts: Vec<_> = normalized.into_iter().flat_map(explode).collect();
        assert_eq!(parts.len(), 1);
        assert!(matches!(parts[0], SimplePart::Polygon(_)));
    }

    #[test]
    fn test_multipolygon_explodes_per_part() {
        let geom = parse_wkt(
            "MULTIPOLYGON(((0 0, 1 0, 1 1, 0 1, 0 0)), ((5 5, 6 5, 6 6, 5 6, 5 5)))",
        )
        .unwrap();
        let parts: Vec<_> = normalize(geom).unwrap().into_iter().flat_map(explode).collect();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_collection_is_flattened() {
        let geom =
            parse_wkt("GEOMETRYCOLLECTION(POINT(1 2), POLYGON((0 0, 1 0, 1 1, 0 1, 0 0)))").unwrap();
        let parts: Vec<_> = normalize(geom).unwrap().into_iter().flat_map(explode).collect();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[0], SimplePart::Point(_)));
        assert!(matches!(parts[1], SimplePart::Polygon(_)));
    }

    #[test]
    fn test_linestring_is_rejected() {
        let geom = parse_wkt("LINESTRING(0 0, 1 1)").unwrap();
        assert!(matches!(
            normalize(geom),
            Err(HexpartError::UnsupportedGeometry(_))
        ));
    }

    #[test]
    fn test_bad_wkt() {
        assert!(matches!(parse_wkt("POLYGON((0 0"), Err(HexpartError::WktParse(_))));
    }

    #[test]
    fn test_decode_coordinates_with_nulls() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("lon", DataType::Int32, true),
            Field::new("lat", DataType::Int32, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![Some(10), None])) as ArrayRef,
                Arc::new(Int32Array::from(vec![Some(20), Some(5)])) as ArrayRef,
            ],
        )
        .unwrap();

        let accessor = GeometryAccessor::Coordinates {
            x: "lon".into(),
            y: "lat".into(),
        };
        let decoded = accessor.decode(&batch).unwrap();
        assert_eq!(decoded[0], Some(Geometry::Point(Point::new(10.0, 20.0))));
        assert_eq!(decoded[1], None);
    }

    #[test]
    fn test_decode_wkt_empty_is_null() {
        let schema = Arc::new(Schema::new(vec![Field::new("geom", DataType::Utf8, true)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(vec![Some("POINT(1 2)"), Some(""), None])) as ArrayRef],
        )
        .unwrap();

        let accessor = GeometryAccessor::Wkt {
            column: "geom".into(),
        };
        let decoded = accessor.decode(&batch).unwrap();
        assert!(decoded[0].is_some());
        assert!(decoded[1].is_none());
        assert!(decoded[2].is_none());
    }
}
