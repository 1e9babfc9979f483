//! MapConfig-level validation of per-layer aggregation options.
//!
//! Validation runs over the raw JSON of each layer's `aggregation` field so
//! that unknown filter parameter names are caught before the typed model
//! silently drops them. Every violation is reported as a layer-scoped
//! error carrying the layer's id, index and type.

use serde_json::Value;

use crate::aggregation::query::{SUPPORTED_AGGREGATE_FUNCTIONS, SUPPORTED_PLACEMENTS};
use crate::error::{Result, TilegridError};
use crate::mapconfig::{MapConfig, FILTER_PARAMETERS};

pub fn validate(config: &MapConfig) -> Result<()> {
    for index in 0..config.layers.len() {
        let Some(aggregation) = config.layers[index].options.aggregation.as_ref() else {
            continue;
        };
        let Value::Object(aggregation) = aggregation else {
            continue;
        };
        if let Some(value) = aggregation.get("resolution") {
            validate_positive_number(config, index, "resolution", value)?;
        }
        if let Some(value) = aggregation.get("threshold") {
            validate_positive_number(config, index, "threshold", value)?;
        }
        if let Some(value) = aggregation.get("placement") {
            validate_placement(config, index, value)?;
        }
        if let Some(value) = aggregation.get("columns") {
            validate_columns(config, index, value)?;
        }
        if let Some(value) = aggregation.get("filters") {
            validate_filters(config, index, aggregation, value)?;
        }
    }
    Ok(())
}

fn layer_error(config: &MapConfig, index: usize, message: String) -> TilegridError {
    TilegridError::Layer {
        message,
        id: config.layer_id(index),
        index,
        layer_type: config.layer_type(index),
    }
}

fn validate_positive_number(
    config: &MapConfig,
    index: usize,
    key: &str,
    value: &Value,
) -> Result<()> {
    let valid = value
        .as_f64()
        .map(|n| n.is_finite() && n > 0.0)
        .unwrap_or(false);
    if !valid {
        return Err(layer_error(
            config,
            index,
            format!("Invalid {key}, should be a number greater than 0"),
        ));
    }
    Ok(())
}

fn validate_placement(config: &MapConfig, index: usize, value: &Value) -> Result<()> {
    let valid = value
        .as_str()
        .map(|name| SUPPORTED_PLACEMENTS.contains(&name))
        .unwrap_or(false);
    if !valid {
        return Err(layer_error(
            config,
            index,
            format!(
                "Invalid placement. Valid values: {}",
                SUPPORTED_PLACEMENTS.join(", ")
            ),
        ));
    }
    Ok(())
}

fn validate_columns(config: &MapConfig, index: usize, value: &Value) -> Result<()> {
    let Value::Object(columns) = value else {
        return Ok(());
    };
    for (column_name, spec) in columns {
        if column_name.is_empty() {
            return Err(layer_error(
                config,
                index,
                "Invalid column name, should be a non empty string".to_string(),
            ));
        }
        let function = spec.get("aggregate_function").and_then(Value::as_str);
        if !function
            .map(|f| SUPPORTED_AGGREGATE_FUNCTIONS.contains(&f))
            .unwrap_or(false)
        {
            return Err(layer_error(
                config,
                index,
                format!(
                    "Unsupported aggregation function {}, valid ones: {}",
                    function.unwrap_or("undefined"),
                    SUPPORTED_AGGREGATE_FUNCTIONS.join(", ")
                ),
            ));
        }
        let aggregated = spec.get("aggregated_column").and_then(Value::as_str);
        if !aggregated.map(|c| !c.is_empty()).unwrap_or(false) {
            return Err(layer_error(
                config,
                index,
                "Invalid aggregated column, should be a non empty string".to_string(),
            ));
        }
    }
    Ok(())
}

// A filtered name must be the name of an aggregated column or a dimension
// declared in the same layer, and every filter spec may only use the known
// parameter names.
fn validate_filters(
    config: &MapConfig,
    index: usize,
    aggregation: &serde_json::Map<String, Value>,
    value: &Value,
) -> Result<()> {
    let Value::Object(filters) = value else {
        return Ok(());
    };
    let declared: Vec<&str> = ["columns", "dimensions"]
        .iter()
        .filter_map(|key| aggregation.get(*key))
        .filter_map(Value::as_object)
        .flat_map(|map| map.keys().map(String::as_str))
        .collect();
    for (filtered_name, filter_value) in filters {
        if !declared.contains(&filtered_name.as_str()) {
            return Err(layer_error(
                config,
                index,
                format!("Invalid filtered column: {filtered_name}"),
            ));
        }
        let specs: Vec<&Value> = match filter_value {
            Value::Array(items) => items.iter().collect(),
            single => vec![single],
        };
        for spec in specs {
            let Value::Object(params) = spec else {
                continue;
            };
            for param_name in params.keys() {
                if !FILTER_PARAMETERS.contains(&param_name.as_str()) {
                    return Err(layer_error(
                        config,
                        index,
                        format!("Invalid filter parameter name: {param_name}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(aggregation: Value) -> MapConfig {
        serde_json::from_value(json!({
            "version": "1.8.0",
            "layers": [
                {
                    "id": "layer-0",
                    "type": "mapnik",
                    "options": { "sql": "SELECT 1", "aggregation": aggregation }
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn accepts_complete_valid_aggregation() {
        let result = validate(&config(json!({
            "resolution": 2,
            "threshold": 1000,
            "placement": "point-grid",
            "columns": { "total": { "aggregate_function": "sum", "aggregated_column": "price" } },
            "dimensions": { "make": "car_make" },
            "filters": { "total": { "greater_than": 100 } }
        })));
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_non_positive_resolution() {
        let err = validate(&config(json!({ "resolution": 0 }))).unwrap_err();
        assert!(err.to_string().contains("Invalid resolution"));
        match err {
            TilegridError::Layer { index, layer_type, id, .. } => {
                assert_eq!(index, 0);
                assert_eq!(layer_type, "mapnik");
                assert_eq!(id.as_deref(), Some("layer-0"));
            }
            other => panic!("expected layer error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_placement() {
        let err = validate(&config(json!({ "placement": "corner" }))).unwrap_err();
        assert!(err
            .to_string()
            .contains("Invalid placement. Valid values: centroid, point-grid, point-sample"));
    }

    #[test]
    fn rejects_unsupported_aggregate_function() {
        let err = validate(&config(json!({
            "columns": { "m": { "aggregate_function": "median", "aggregated_column": "price" } }
        })))
        .unwrap_err();
        assert!(err.to_string().contains(
            "Unsupported aggregation function median, valid ones: count, avg, sum, min, max, mode"
        ));
    }

    #[test]
    fn rejects_missing_aggregated_column() {
        let err = validate(&config(json!({
            "columns": { "m": { "aggregate_function": "sum" } }
        })))
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("Invalid aggregated column, should be a non empty string"));
    }

    #[test]
    fn rejects_undeclared_filtered_column() {
        let err = validate(&config(json!({
            "filters": { "total": { "greater_than": 1 } }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("Invalid filtered column: total"));
    }

    #[test]
    fn rejects_unknown_filter_parameter() {
        let err = validate(&config(json!({
            "columns": { "total": { "aggregate_function": "sum", "aggregated_column": "price" } },
            "filters": { "total": { "bigger_than": 1 } }
        })))
        .unwrap_err();
        assert!(err.to_string().contains("Invalid filter parameter name: bigger_than"));
    }

    #[test]
    fn disabled_aggregation_is_not_validated() {
        assert!(validate(&config(json!(false))).is_ok());
        assert!(validate(&config(json!(true))).is_ok());
    }
}
