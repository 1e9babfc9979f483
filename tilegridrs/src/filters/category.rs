use serde_json::Value;

use crate::error::{Result, TilegridError};
use crate::sql;

/// Categorical filter over a raw column: accepted values become an `IN`
/// list, rejected values a `NOT IN` list. An explicitly empty accept list
/// matches nothing.
#[derive(Debug, Clone)]
pub struct CategoryFilter {
    column: String,
    accept: Option<Vec<Value>>,
    reject: Option<Vec<Value>>,
}

impl CategoryFilter {
    pub fn new(
        column: &str,
        accept: Option<Vec<Value>>,
        reject: Option<Vec<Value>>,
    ) -> Result<Self> {
        if accept.is_none() && reject.is_none() {
            return Err(TilegridError::Filter(
                "Category filter expects at least one array in accept or reject params".to_string(),
            ));
        }
        Ok(Self {
            column: column.to_string(),
            accept,
            reject,
        })
    }

    pub fn sql(&self, raw_sql: &str) -> String {
        let mut conditions = Vec::new();
        match &self.accept {
            Some(accept) if accept.is_empty() => conditions.push("1 = 0".to_string()),
            Some(accept) => conditions.push(format!(
                "{} IN ({})",
                self.column,
                accept.iter().map(sql::literal).collect::<Vec<_>>().join(",")
            )),
            None => {}
        }
        if let Some(reject) = &self.reject {
            if !reject.is_empty() {
                conditions.push(format!(
                    "{} NOT IN ({})",
                    self.column,
                    reject.iter().map(sql::literal).collect::<Vec<_>>().join(",")
                ));
            }
        }
        format!(
            "SELECT * FROM ({raw_sql}) _camshaft_category_filter WHERE {}",
            conditions.join(" AND ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accept_list_becomes_in_clause() {
        let filter =
            CategoryFilter::new("make", Some(vec![json!("BMW"), json!("Audi")]), None).unwrap();
        assert_eq!(
            filter.sql("SELECT * FROM cars"),
            "SELECT * FROM (SELECT * FROM cars) _camshaft_category_filter WHERE make IN ('BMW','Audi')"
        );
    }

    #[test]
    fn empty_accept_matches_nothing() {
        let filter = CategoryFilter::new("make", Some(vec![]), None).unwrap();
        assert!(filter.sql("q").ends_with("WHERE 1 = 0"));
    }

    #[test]
    fn reject_list_becomes_not_in_clause() {
        let filter = CategoryFilter::new("make", None, Some(vec![json!(4)])).unwrap();
        assert!(filter.sql("q").ends_with("WHERE make NOT IN (4)"));
    }

    #[test]
    fn requires_accept_or_reject() {
        assert!(CategoryFilter::new("make", None, None).is_err());
    }
}
