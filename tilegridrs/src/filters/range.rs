use crate::error::{Result, TilegridError};

/// Numeric range filter over a raw column: BETWEEN when both bounds are
/// present, a single comparison otherwise.
#[derive(Debug, Clone)]
pub struct RangeFilter {
    column: String,
    min: Option<f64>,
    max: Option<f64>,
}

impl RangeFilter {
    pub fn new(column: &str, min: Option<f64>, max: Option<f64>) -> Result<Self> {
        let min = min.filter(|v| v.is_finite());
        let max = max.filter(|v| v.is_finite());
        if min.is_none() && max.is_none() {
            return Err(TilegridError::Filter(
                "Range filter expect to have at least one value in min or max numeric params"
                    .to_string(),
            ));
        }
        Ok(Self {
            column: column.to_string(),
            min,
            max,
        })
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        let condition = match (self.min, self.max) {
            (Some(min), Some(max)) => format!("{} BETWEEN {} AND {}", self.column, min, max),
            (Some(min), None) => format!("{} >= {}", self.column, min),
            (None, Some(max)) => format!("{} <= {}", self.column, max),
            (None, None) => unreachable!("checked at construction"),
        };
        format!("SELECT * FROM ({raw_sql}) _camshaft_range_filter WHERE {condition}")
    }
}
