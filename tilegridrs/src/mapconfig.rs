//! Input model for MapConfig layers and their aggregation options.
//!
//! The MapConfig itself is an external, caller-supplied JSON document; only
//! the pieces the SQL-generation core reads are modeled here. The
//! `aggregation` field of a layer is kept as raw JSON because it is
//! three-valued: an object (or `true`) enables aggregation, `false`
//! disables it explicitly, and absence leaves the decision to the
//! vector-only default.

use std::collections::BTreeMap;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub version: Option<String>,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub layer_type: Option<String>,
    #[serde(default)]
    pub options: LayerOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerOptions {
    pub sql: Option<String>,
    /// Query with substitution tokens already replaced, preferred over
    /// `sql` when present.
    pub sql_raw: Option<String>,
    pub cartocss: Option<String>,
    pub aggregation: Option<Value>,
}

/// Three-valued aggregation flag for a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationState {
    /// Explicit aggregation (`{}`-like object or `true`).
    Enabled,
    /// No aggregation field present.
    Unset,
    /// Explicitly disabled with `false`.
    Disabled,
}

impl Layer {
    pub fn aggregation_state(&self) -> AggregationState {
        match &self.options.aggregation {
            Some(Value::Bool(false)) => AggregationState::Disabled,
            Some(Value::Bool(true)) | Some(Value::Object(_)) => AggregationState::Enabled,
            _ => AggregationState::Unset,
        }
    }
}

impl MapConfig {
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn layer(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layer_id(&self, index: usize) -> Option<String> {
        self.layer(index).and_then(|l| l.id.clone())
    }

    pub fn layer_type(&self, index: usize) -> String {
        self.layer(index)
            .and_then(|l| l.layer_type.clone())
            .unwrap_or_else(|| "mapnik".to_string())
    }

    /// A MapConfig is vector-only when every layer is a plain data layer
    /// without CartoCSS styling attached.
    pub fn is_vector_only(&self) -> bool {
        !self.layers.is_empty()
            && self.layers.iter().all(|layer| {
                matches!(layer.layer_type.as_deref(), None | Some("mapnik") | Some("cartodb"))
                    && layer.options.cartocss.is_none()
            })
    }
}

/// Aggregation options of a single layer, as declared in the MapConfig.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub resolution: Option<f64>,
    pub threshold: Option<f64>,
    pub placement: Option<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnSpec>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, DimensionSpec>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterInput>,
}

impl AggregationSpec {
    /// Extract the spec from a layer's raw aggregation value. `true` and
    /// `false` both map to the empty (default) spec.
    pub fn from_layer_value(value: Option<&Value>) -> serde_json::Result<Self> {
        match value {
            Some(object @ Value::Object(_)) => serde_json::from_value(object.clone()),
            _ => Ok(Self::default()),
        }
    }

    /// The default aggregation has no placement, columns, dimensions or
    /// filters and returns a full sample record per grid cell.
    pub fn is_default(&self) -> bool {
        self.placement.is_none()
            && self.columns.is_empty()
            && self.dimensions.is_empty()
            && self.filters.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub aggregate_function: Option<String>,
    pub aggregated_column: Option<String>,
}

/// A grouping dimension: a plain column, or a time-bucketed column when
/// `group` is present.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionSpec {
    pub column: String,
    pub group: Option<TimeGroup>,
    pub format: Option<String>,
}

// Accept the legacy shorthand where a dimension is just a column name.
impl<'de> Deserialize<'de> for DimensionSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(column) => Ok(DimensionSpec {
                column,
                group: None,
                format: None,
            }),
            other => {
                #[derive(Deserialize)]
                struct Full {
                    column: String,
                    group: Option<TimeGroup>,
                    format: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(DimensionSpec {
                    column: full.column,
                    group: full.group,
                    format: full.format,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeGroup {
    pub units: Option<String>,
    pub timezone: Option<Timezone>,
    pub count: Option<u32>,
    pub starting: Option<String>,
}

/// Timezone as either a numeric offset in seconds or a tz/PG name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timezone {
    Offset(f64),
    Name(String),
}

/// A single filter spec or an array of specs to be OR-combined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterInput {
    One(FilterParams),
    Many(Vec<FilterParams>),
}

impl FilterInput {
    pub fn as_slice(&self) -> &[FilterParams] {
        match self {
            FilterInput::One(params) => std::slice::from_ref(params),
            FilterInput::Many(params) => params,
        }
    }
}

/// Raw filter parameters as they appear in the MapConfig.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterParams {
    pub less_than: Option<Value>,
    pub less_than_or_equal_to: Option<Value>,
    pub greater_than: Option<Value>,
    pub greater_than_or_equal_to: Option<Value>,
    pub equal: Option<Value>,
    pub not_equal: Option<Value>,
    pub between: Option<Value>,
    #[serde(rename = "in")]
    pub in_values: Option<Vec<Value>>,
    pub not_in: Option<Vec<Value>>,
}

/// Parameter names accepted inside a filter spec.
pub const FILTER_PARAMETERS: &[&str] = &[
    "less_than",
    "less_than_or_equal_to",
    "greater_than",
    "greater_than_or_equal_to",
    "equal",
    "not_equal",
    "between",
    "in",
    "not_in",
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aggregation_flag_is_three_valued() {
        let config: MapConfig = serde_json::from_value(json!({
            "version": "1.8.0",
            "layers": [
                { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": {} } },
                { "type": "mapnik", "options": { "sql": "SELECT 1", "aggregation": false } },
                { "type": "mapnik", "options": { "sql": "SELECT 1" } }
            ]
        }))
        .unwrap();
        assert_eq!(config.layers[0].aggregation_state(), AggregationState::Enabled);
        assert_eq!(config.layers[1].aggregation_state(), AggregationState::Disabled);
        assert_eq!(config.layers[2].aggregation_state(), AggregationState::Unset);
    }

    #[test]
    fn dimension_accepts_legacy_shorthand() {
        let spec: AggregationSpec = serde_json::from_value(json!({
            "dimensions": {
                "make": "car_make",
                "month": { "column": "ts", "group": { "units": "month" } }
            }
        }))
        .unwrap();
        assert_eq!(spec.dimensions["make"].column, "car_make");
        assert!(spec.dimensions["make"].group.is_none());
        assert_eq!(
            spec.dimensions["month"].group.as_ref().unwrap().units.as_deref(),
            Some("month")
        );
    }

    #[test]
    fn filters_accept_single_or_array() {
        let spec: AggregationSpec = serde_json::from_value(json!({
            "filters": {
                "a": { "equal": 1 },
                "b": [ { "less_than": 2 }, { "greater_than": 8 } ]
            }
        }))
        .unwrap();
        assert_eq!(spec.filters["a"].as_slice().len(), 1);
        assert_eq!(spec.filters["b"].as_slice().len(), 2);
    }

    #[test]
    fn cartocss_disqualifies_vector_only() {
        let styled: MapConfig = serde_json::from_value(json!({
            "version": "1.8.0",
            "layers": [
                { "type": "mapnik", "options": { "sql": "SELECT 1", "cartocss": "#l {}" } }
            ]
        }))
        .unwrap();
        assert!(!styled.is_vector_only());
    }
}
