use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, TilegridError};

use super::{DEFAULT_GEOMETRY_COLUMN, DEFAULT_SRID};

#[derive(Debug, Clone, Default)]
pub struct PolygonFilterDefinition {
    pub column: Option<String>,
    pub srid: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PolygonGeojson {
    #[serde(rename = "type")]
    geometry_type: String,
    coordinates: Value,
}

/// Restricts rows to those intersecting a GeoJSON polygon (given in
/// EPSG:4326, transformed to the geometry column's SRID).
#[derive(Debug, Clone)]
pub struct PolygonFilter {
    column: String,
    srid: i32,
    geojson: PolygonGeojson,
}

impl PolygonFilter {
    pub fn new(definition: &PolygonFilterDefinition, polygon: Option<&str>) -> Result<Self> {
        let polygon = polygon.ok_or_else(|| {
            TilegridError::Filter("Polygon filter expects to have a \"polygon\" param".to_string())
        })?;

        let geojson: PolygonGeojson = serde_json::from_str(polygon).map_err(|_| {
            TilegridError::Filter("Invalid polygon parameter. Expected a valid GeoJSON".to_string())
        })?;

        if geojson.geometry_type != "Polygon" {
            return Err(TilegridError::Filter(
                "Invalid type of geometry. Valid ones: \"Polygon\"".to_string(),
            ));
        }

        let ring = geojson.coordinates.as_array().ok_or_else(|| {
            TilegridError::Filter("Invalid geometry, it must be a closed polygon".to_string())
        })?;
        if ring.first() != ring.last() {
            return Err(TilegridError::Filter(
                "Invalid geometry, it must be a closed polygon".to_string(),
            ));
        }

        Ok(Self {
            column: definition
                .column
                .clone()
                .unwrap_or_else(|| DEFAULT_GEOMETRY_COLUMN.to_string()),
            srid: definition.srid.unwrap_or(DEFAULT_SRID),
            geojson,
        })
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        let geojson = serde_json::to_string(&self.geojson).expect("geojson serializes");
        let polygon_sql = format!(
            "SELECT\n    *\nFROM ({raw_sql}) _cdb_polygon_filter\nWHERE\n    ST_Intersects(\n        {column},\n        ST_Transform(\n            ST_SetSRID(ST_GeomFromGeoJSON('{geojson}'), 4326),\n            {srid}\n        )\n    )",
            column = self.column,
            srid = self.srid,
        );
        debug!(target: "tilegrid::filter::polygon", "{polygon_sql}");
        polygon_sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str =
        r#"{"type":"Polygon","coordinates":[[[0,0],[0,1],[1,1],[1,0],[0,0]]]}"#;

    #[test]
    fn wraps_query_with_geojson_intersection() {
        let filter =
            PolygonFilter::new(&PolygonFilterDefinition::default(), Some(SQUARE)).unwrap();
        let sql = filter.sql("SELECT * FROM t");
        assert!(sql.contains("_cdb_polygon_filter"));
        assert!(sql.contains("ST_GeomFromGeoJSON('{\"type\":\"Polygon\""));
        assert!(sql.contains(", 4326)"));
        assert!(sql.contains("3857"));
    }

    #[test]
    fn rejects_non_polygon_geometry() {
        let point = r#"{"type":"Point","coordinates":[0,0]}"#;
        let err =
            PolygonFilter::new(&PolygonFilterDefinition::default(), Some(point)).unwrap_err();
        assert!(err.to_string().contains("Valid ones: \"Polygon\""));
    }

    #[test]
    fn rejects_open_ring() {
        let open = r#"{"type":"Polygon","coordinates":[[0,0],[0,1],[1,1]]}"#;
        let err = PolygonFilter::new(&PolygonFilterDefinition::default(), Some(open)).unwrap_err();
        assert!(err.to_string().contains("closed polygon"));
    }

    #[test]
    fn rejects_invalid_json_and_missing_param() {
        assert!(PolygonFilter::new(&PolygonFilterDefinition::default(), Some("{{")).is_err());
        assert!(PolygonFilter::new(&PolygonFilterDefinition::default(), None).is_err());
    }
}
