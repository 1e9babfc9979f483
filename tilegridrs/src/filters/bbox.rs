use tracing::debug;

use crate::error::{Result, TilegridError};

use super::{DEFAULT_GEOMETRY_COLUMN, DEFAULT_SRID};

#[derive(Debug, Clone, Default)]
pub struct BboxFilterDefinition {
    pub column: Option<String>,
    pub srid: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct BboxParams {
    /// Comma-separated `west,south,east,north`, in the filter SRID.
    pub bbox: Option<String>,
    /// SRID the bbox coordinates are expressed in (defaults to 4326).
    pub srid: Option<i32>,
}

/// Restricts rows to those intersecting a bounding box, reprojecting the
/// envelope when its SRID differs from the geometry column's.
#[derive(Debug, Clone)]
pub struct BboxFilter {
    column: String,
    column_srid: i32,
    filter_srid: i32,
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl BboxFilter {
    pub fn new(definition: &BboxFilterDefinition, params: &BboxParams) -> Result<Self> {
        let bbox = params
            .bbox
            .as_deref()
            .ok_or_else(|| TilegridError::Filter("Bounding box filter expects to have a \"bbox\" param".to_string()))?;

        let bounds: Vec<f64> = bbox
            .split(',')
            .map(|part| part.trim().parse::<f64>().unwrap_or(f64::NAN))
            .collect();
        if bounds.len() != 4 || bounds.iter().any(|v| !v.is_finite()) {
            return Err(TilegridError::Filter(
                "Invalid bbox parameter, expected 4 finite numbers: \"west,south,east,north\""
                    .to_string(),
            ));
        }

        Ok(Self {
            column: definition
                .column
                .clone()
                .unwrap_or_else(|| DEFAULT_GEOMETRY_COLUMN.to_string()),
            column_srid: definition.srid.unwrap_or(DEFAULT_SRID),
            filter_srid: params.srid.unwrap_or(4326),
            west: bounds[0],
            south: bounds[1],
            east: bounds[2],
            north: bounds[3],
        })
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        let envelope = format!(
            "ST_MakeEnvelope({}, {}, {}, {}, {})",
            self.west, self.south, self.east, self.north, self.filter_srid
        );
        let envelope = if self.filter_srid != self.column_srid {
            format!("ST_Transform({}, {})", envelope, self.column_srid)
        } else {
            envelope
        };
        let bbox_sql = format!(
            "SELECT\n    *\nFROM ({raw_sql}) _cdb_bbox_filter\nWHERE\n    ST_Intersects({column}, {envelope})",
            column = self.column,
        );
        debug!(target: "tilegrid::filter::bbox", "{bbox_sql}");
        bbox_sql
    }
}
