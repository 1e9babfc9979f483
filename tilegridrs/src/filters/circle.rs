use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, TilegridError};

use super::{DEFAULT_GEOMETRY_COLUMN, DEFAULT_SRID};

#[derive(Debug, Clone, Default)]
pub struct CircleFilterDefinition {
    pub column: Option<String>,
    pub srid: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct CircleParams {
    lng: f64,
    lat: f64,
    radius: f64,
}

/// Restricts rows to those within `radius` meters of a point. The center
/// is given in web-mercator coordinates; the buffer is computed over
/// geography so the radius is meters on the ground.
#[derive(Debug, Clone)]
pub struct CircleFilter {
    column: String,
    srid: i32,
    lng: f64,
    lat: f64,
    radius: f64,
}

impl CircleFilter {
    pub fn new(definition: &CircleFilterDefinition, circle: Option<&str>) -> Result<Self> {
        let circle = circle.ok_or_else(|| {
            TilegridError::Filter("Circle filter expects to have a \"circle\" param".to_string())
        })?;

        let params: CircleParams = serde_json::from_str(circle).map_err(|_| {
            TilegridError::Filter(
                "Missing parameter for Circle Filter, expected: \"lng\", \"lat\", and \"radius\""
                    .to_string(),
            )
        })?;

        if !params.lng.is_finite() || !params.lat.is_finite() || !params.radius.is_finite() {
            return Err(TilegridError::Filter(
                "Missing parameter for Circle Filter, expected: \"lng\", \"lat\", and \"radius\""
                    .to_string(),
            ));
        }

        Ok(Self {
            column: definition
                .column
                .clone()
                .unwrap_or_else(|| DEFAULT_GEOMETRY_COLUMN.to_string()),
            srid: definition.srid.unwrap_or(DEFAULT_SRID),
            lng: params.lng,
            lat: params.lat,
            radius: params.radius,
        })
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        let circle_sql = format!(
            "SELECT\n    *\nFROM ({raw_sql}) _cdb_circle_filter\nWHERE\n    ST_Intersects(\n        {column},\n        ST_Transform(\n            ST_Buffer(\n                ST_Transform(\n                    ST_SetSRID(ST_Point({lng},{lat}), 3857),\n                    4326\n                )::geography,\n                {radius}\n            )::geometry,\n            {srid}\n        )\n    )",
            column = self.column,
            lng = self.lng,
            lat = self.lat,
            radius = self.radius,
            srid = self.srid,
        );
        debug!(target: "tilegrid::filter::circle", "{circle_sql}");
        circle_sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_buffer_intersection() {
        let filter = CircleFilter::new(
            &CircleFilterDefinition::default(),
            Some(r#"{"lng": -100.0, "lat": 20.5, "radius": 3000}"#),
        )
        .unwrap();
        let sql = filter.sql("SELECT * FROM pts");
        assert!(sql.contains("_cdb_circle_filter"));
        assert!(sql.contains("ST_SetSRID(ST_Point(-100,20.5), 3857)"));
        assert!(sql.contains("3000"));
    }

    #[test]
    fn rejects_missing_param() {
        let err = CircleFilter::new(&CircleFilterDefinition::default(), None).unwrap_err();
        assert!(matches!(err, TilegridError::Filter(_)));
    }

    #[test]
    fn rejects_unparsable_json() {
        assert!(CircleFilter::new(&CircleFilterDefinition::default(), Some("not json")).is_err());
    }

    #[test]
    fn rejects_non_finite_values() {
        let missing_radius = r#"{"lng": 1, "lat": 2}"#;
        assert!(CircleFilter::new(&CircleFilterDefinition::default(), Some(missing_radius)).is_err());
    }
}
