//! Aggregation feasibility, validation and query generation for a whole
//! MapConfig.
//!
//! [`AggregationMapConfig`] wraps a parsed MapConfig, validates every
//! layer's aggregation options up front and answers the per-layer
//! questions the tile pipeline asks: is this layer aggregated, what is its
//! aggregated query, which columns does the aggregation need, and does the
//! layer's feature count justify aggregating at all.

pub mod query;
pub mod time_dimension;
pub mod validator;

pub use query::{
    AggregateFunction, AggregationOptions, AggregationQueryBuilder, DimensionInfo,
    FilterCondition, Placement, DEFAULT_PLACEMENT, GEOMETRY_COLUMN,
    SUPPORTED_AGGREGATE_FUNCTIONS, SUPPORTED_PLACEMENTS,
};
pub use time_dimension::{classify, TimeDimensionExpression, TimeFamily};

use serde_json::Value;

use crate::error::{Result, TilegridError};
use crate::executor::QueryExecutor;
use crate::mapconfig::{AggregationSpec, AggregationState, MapConfig};
use crate::mercator::WebMercatorHelper;
use crate::tokens;

/// Feature count at or above which a layer is worth aggregating.
pub const THRESHOLD: f64 = 1e5;

/// Default grid cells per 256px tile side.
pub const RESOLUTION: f64 = 1.0;

pub const SUPPORTED_GEOMETRY_TYPES: &[&str] = &["ST_Point"];

const GEOMETRY_COLUMNS: &[&str] = &["the_geom", "the_geom_webmercator"];

pub fn supports_geometry_type(geometry_type: &str) -> bool {
    SUPPORTED_GEOMETRY_TYPES.contains(&geometry_type)
}

#[derive(Debug, Clone)]
pub struct AggregationMapConfig {
    config: MapConfig,
    builder: AggregationQueryBuilder,
}

impl AggregationMapConfig {
    /// Wrap and validate; every layer's aggregation options are checked
    /// before any query is generated.
    pub fn new(config: MapConfig) -> Result<Self> {
        validator::validate(&config)?;
        Ok(Self {
            config,
            builder: AggregationQueryBuilder::new(WebMercatorHelper::default()),
        })
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Self::new(MapConfig::from_value(value)?)
    }

    pub fn map_config(&self) -> &MapConfig {
        &self.config
    }

    /// A layer is aggregated when it asks for aggregation explicitly, or
    /// when the MapConfig is vector-only and the layer has not explicitly
    /// opted out.
    pub fn is_aggregation_layer(&self, index: usize) -> bool {
        let state = match self.config.layer(index) {
            Some(layer) => layer.aggregation_state(),
            None => return false,
        };
        match state {
            AggregationState::Enabled => true,
            AggregationState::Disabled => false,
            AggregationState::Unset => self.config.is_vector_only(),
        }
    }

    pub fn is_aggregation_map_config(&self) -> bool {
        (0..self.config.layers.len()).any(|index| self.is_aggregation_layer(index))
    }

    /// The typed aggregation options of a layer; `true`/`false` and absent
    /// values all map to the empty spec.
    pub fn aggregation(&self, index: usize) -> Result<AggregationSpec> {
        let raw = self
            .config
            .layer(index)
            .and_then(|layer| layer.options.aggregation.as_ref());
        Ok(AggregationSpec::from_layer_value(raw)?)
    }

    /// The full aggregation statement for a layer, built from `sql_raw`
    /// when present and `sql` otherwise.
    pub fn aggregated_query(&self, index: usize) -> Result<String> {
        let layer = self.config.layer(index).ok_or_else(|| {
            TilegridError::Sql(format!("No layer at index {index}"))
        })?;
        let source = layer
            .options
            .sql_raw
            .as_deref()
            .or(layer.options.sql.as_deref())
            .ok_or_else(|| TilegridError::Sql(format!("Missing sql for layer {index}")))?;
        let spec = self.aggregation(index)?;
        let options = AggregationOptions {
            query: source.to_string(),
            resolution: spec.resolution.unwrap_or(RESOLUTION),
            columns: spec.columns.clone(),
            dimensions: spec.dimensions.clone(),
            filters: spec.filters.clone(),
            placement: spec.placement.clone(),
            is_default_aggregation: self.is_default_layer_aggregation(index),
        };
        self.builder.sql(&options)
    }

    /// The default aggregation keeps a full sample record per cell; it is
    /// in effect when no placement, columns, dimensions or filters were
    /// requested.
    pub fn is_default_layer_aggregation(&self, index: usize) -> bool {
        self.is_aggregation_layer(index)
            && AggregationSpec::from_layer_value(
                self.config
                    .layer(index)
                    .and_then(|layer| layer.options.aggregation.as_ref()),
            )
            .map(|spec| spec.is_default())
            .unwrap_or(false)
    }

    pub fn does_layer_reach_threshold(&self, index: usize, feature_count: f64) -> bool {
        let threshold = self
            .aggregation(index)
            .ok()
            .and_then(|spec| spec.threshold)
            .filter(|t| *t > 0.0)
            .unwrap_or(THRESHOLD);
        feature_count >= threshold
    }

    /// Output columns the aggregation will produce for a non-default
    /// layer: the representative id and feature count plus every declared
    /// column and dimension, deduplicated.
    pub fn required_aggregation_columns(&self, index: usize) -> Result<Vec<String>> {
        let spec = self.aggregation(index)?;
        let mut columns = vec!["cartodb_id".to_string(), "_cdb_feature_count".to_string()];
        for name in spec.columns.keys().chain(spec.dimensions.keys()) {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
        Ok(columns)
    }

    /// Columns the aggregation needs for a layer: the probed source
    /// columns for the default aggregation, the declared ones otherwise.
    pub async fn layer_aggregation_columns(
        &self,
        executor: &dyn QueryExecutor,
        index: usize,
    ) -> Result<Vec<String>> {
        if self.is_default_layer_aggregation(index) {
            return self.layer_columns(executor, index, true).await;
        }
        self.required_aggregation_columns(index)
    }

    /// Probe the source query's column names with a `LIMIT 0` select,
    /// substituting dummy values for any tile tokens.
    pub async fn layer_columns(
        &self,
        executor: &dyn QueryExecutor,
        index: usize,
        skip_geometries: bool,
    ) -> Result<Vec<String>> {
        let layer = self.config.layer(index).ok_or_else(|| {
            TilegridError::Sql(format!("No layer at index {index}"))
        })?;
        let source = layer
            .options
            .sql
            .as_deref()
            .ok_or_else(|| TilegridError::Sql(format!("Missing sql for layer {index}")))?;
        let probe = format!(
            "SELECT * FROM ({}) __cdb_aggregation_schema LIMIT 0",
            tokens::replace_dummy(source)
        );
        let result = executor.query(&probe, true).await?;
        let mut columns: Vec<String> =
            result.columns.into_iter().map(|column| column.name).collect();
        if skip_geometries {
            columns.retain(|column| !GEOMETRY_COLUMNS.contains(&column.as_str()));
        }
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn aggregation_config(layers: Value) -> AggregationMapConfig {
        AggregationMapConfig::from_value(json!({
            "version": "1.8.0",
            "layers": layers
        }))
        .unwrap()
    }

    #[test]
    fn vector_only_layers_aggregate_unless_disabled() {
        let config = aggregation_config(json!([
            { "type": "mapnik", "options": { "sql": "SELECT 1" } },
            { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": false } }
        ]));
        assert!(config.is_aggregation_layer(0));
        assert!(!config.is_aggregation_layer(1));
        assert!(config.is_aggregation_map_config());
    }

    #[test]
    fn styled_layers_require_explicit_aggregation() {
        let config = aggregation_config(json!([
            { "type": "mapnik", "options": { "sql": "SELECT 1", "cartocss": "#l {}" } }
        ]));
        assert!(!config.is_aggregation_layer(0));
        assert!(!config.is_aggregation_map_config());
    }

    #[test]
    fn empty_spec_is_default_aggregation() {
        let config = aggregation_config(json!([
            { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": {} } },
            {
                "type": "mapnik",
                "options": { "sql": "SELECT 1", "aggregation": { "placement": "centroid" } }
            }
        ]));
        assert!(config.is_default_layer_aggregation(0));
        assert!(!config.is_default_layer_aggregation(1));
    }

    #[test]
    fn threshold_defaults_to_one_hundred_thousand() {
        let config = aggregation_config(json!([
            { "type": "mapnik", "options": { "sql": "SELECT 1" } },
            { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": { "threshold": 10 } } }
        ]));
        assert!(!config.does_layer_reach_threshold(0, 99_999.0));
        assert!(config.does_layer_reach_threshold(0, 100_000.0));
        assert!(config.does_layer_reach_threshold(1, 10.0));
    }

    #[test]
    fn required_columns_are_deduplicated() {
        let config = aggregation_config(json!([
            {
                "type": "mapnik",
                "options": {
                    "sql": "SELECT 1",
                    "aggregation": {
                        "columns": {
                            "cartodb_id": { "aggregate_function": "max", "aggregated_column": "cartodb_id" },
                            "total": { "aggregate_function": "sum", "aggregated_column": "price" }
                        },
                        "dimensions": { "make": "car_make" }
                    }
                }
            }
        ]));
        assert_eq!(
            config.required_aggregation_columns(0).unwrap(),
            vec!["cartodb_id", "_cdb_feature_count", "total", "make"]
        );
    }

    #[test]
    fn aggregated_query_prefers_raw_sql() {
        let config = aggregation_config(json!([
            {
                "type": "mapnik",
                "options": {
                    "sql": "SELECT * FROM wrapped",
                    "sql_raw": "SELECT * FROM raw_points",
                    "aggregation": {}
                }
            }
        ]));
        let sql = config.aggregated_query(0).unwrap();
        assert!(sql.contains("SELECT * FROM raw_points"));
        assert!(!sql.contains("wrapped"));
    }

    #[test]
    fn validation_failure_surfaces_at_construction() {
        let err = AggregationMapConfig::from_value(json!({
            "version": "1.8.0",
            "layers": [
                { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": { "resolution": -1 } } }
            ]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Invalid resolution"));
    }

    #[test]
    fn only_points_are_aggregable() {
        assert!(supports_geometry_type("ST_Point"));
        assert!(!supports_geometry_type("ST_Polygon"));
    }
}
