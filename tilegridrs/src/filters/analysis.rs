use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TilegridError};

use super::{CategoryFilter, RangeFilter};

/// One entry of a layer's filters definition, as produced by the analysis
/// pipeline: a typed filter over a named column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDefinition {
    #[serde(rename = "type")]
    pub filter_type: String,
    pub column: String,
    #[serde(default)]
    pub params: FilterDefinitionParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterDefinitionParams {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub accept: Option<Vec<Value>>,
    pub reject: Option<Vec<Value>>,
}

#[derive(Debug)]
enum AnalysisFilter {
    Category(CategoryFilter),
    Range(RangeFilter),
}

impl AnalysisFilter {
    fn sql(&self, raw_sql: &str) -> String {
        match self {
            AnalysisFilter::Category(filter) => filter.sql(raw_sql),
            AnalysisFilter::Range(filter) => filter.sql(raw_sql),
        }
    }
}

/// An ordered set of category/range filters applied by successive
/// query wrapping.
#[derive(Debug)]
pub struct AnalysisFilters {
    filters: Vec<AnalysisFilter>,
}

impl AnalysisFilters {
    pub fn new(definitions: &BTreeMap<String, FilterDefinition>) -> Result<Self> {
        let mut filters = Vec::with_capacity(definitions.len());
        for (name, definition) in definitions {
            let filter = match definition.filter_type.as_str() {
                "category" => AnalysisFilter::Category(CategoryFilter::new(
                    &definition.column,
                    definition.params.accept.clone(),
                    definition.params.reject.clone(),
                )?),
                "range" => AnalysisFilter::Range(RangeFilter::new(
                    &definition.column,
                    definition.params.min,
                    definition.params.max,
                )?),
                other => {
                    return Err(TilegridError::Filter(format!(
                        "Unknown filter type \"{other}\" for filter \"{name}\""
                    )))
                }
            };
            filters.push(filter);
        }
        Ok(Self { filters })
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        self.filters
            .iter()
            .fold(raw_sql.to_string(), |query, filter| filter.sql(&query))
    }
}
