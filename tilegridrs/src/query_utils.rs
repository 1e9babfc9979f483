//! SQL helpers for probing a layer query: row counts, geometry type,
//! limited previews and filter selectivity estimates.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::executor::QueryExecutor;
use crate::filters::{AnalysisFilters, FilterDefinition};
use crate::mercator::WebMercatorHelper;
use crate::overviews::FilterStats;
use crate::tokens;

pub fn query_actual_row_count(query: &str) -> String {
    format!(
        "select COUNT(*) AS rows FROM ({}) AS __cdb_query",
        tokens::replace_dummy(query)
    )
}

// CDB_EstimateRowCount takes the query as text, hence the dollar quoting.
pub fn query_row_estimation(query: &str) -> String {
    format!(
        "select cartodb.CDB_EstimateRowCount($tilegrid${}$tilegrid$) as rows",
        tokens::replace_dummy(query)
    )
}

pub fn query_geometry_type(query: &str, geometry_column: &str) -> String {
    format!(
        r#"
        SELECT ST_GeometryType({geometry_column}) AS geom_type
            FROM ({}) AS __cdb_query
            WHERE {geometry_column} IS NOT NULL
            LIMIT 1
    "#,
        tokens::replace_dummy(query)
    )
}

/// Row estimate and geometry type in a single statement.
pub fn aggregation_metadata(query: &str, geometry_column: &str) -> String {
    format!(
        r#"
    WITH
    rowEstimation AS (
        {}
    ),
    geometryType AS (
        {}
    )
    SELECT
        rows AS count,
        geom_type AS type
    FROM rowEstimation, geometryType;
"#,
        query_row_estimation(query),
        query_geometry_type(query, geometry_column)
    )
}

pub fn query_limited(query: &str, limit: u64) -> String {
    format!(
        r#"
        SELECT *
            FROM ({}) AS __cdb_query
            LIMIT {limit}
    "#,
        tokens::replace_dummy(query)
    )
}

/// Substitute the zoom-dependent tokens using the whole-world tile bbox.
pub fn substitute_tokens_for_zoom(sql: &str, zoom: u32) -> String {
    let extent = WebMercatorHelper::new().extent(0, 0, 0);
    let bbox = format!(
        "ST_MakeEnvelope({}, {}, {}, {}, 3857)",
        extent.xmin, extent.ymin, extent.xmax, extent.ymax
    );
    tokens::replace_xyz(sql, zoom, &bbox)
}

/// Strip one pair of surrounding double quotes, if present.
pub fn strip_quotes(column_name: &str) -> &str {
    if column_name.len() > 2 && column_name.starts_with('"') && column_name.ends_with('"') {
        &column_name[1..column_name.len() - 1]
    } else {
        column_name
    }
}

/// Selectivity estimates for a filtered query: planner row counts for the
/// unfiltered query and, when filters are present, for the filtered one.
pub async fn fetch_filter_stats(
    executor: &dyn QueryExecutor,
    unfiltered_query: &str,
    filters: Option<&BTreeMap<String, FilterDefinition>>,
) -> Result<FilterStats> {
    let mut stats = FilterStats {
        unfiltered_rows: estimated_rows(executor, unfiltered_query).await?,
        filtered_rows: None,
    };

    let Some(filters) = filters.filter(|f| !f.is_empty()) else {
        return Ok(stats);
    };

    let filtered_query = AnalysisFilters::new(filters)?.sql(unfiltered_query);
    stats.filtered_rows = estimated_rows(executor, &filtered_query).await?;
    Ok(stats)
}

// Planner estimate from EXPLAIN output; None when the plan shape is not
// the expected single-document JSON.
async fn estimated_rows(executor: &dyn QueryExecutor, query: &str) -> Result<Option<f64>> {
    let explain = format!("EXPLAIN (FORMAT JSON) {query}");
    debug!(target: "tilegrid::query_utils", "estimating rows: {explain}");
    let result = executor.query(&explain, true).await?;

    let rows = result
        .rows
        .first()
        .and_then(|row| row.get("QUERY PLAN"))
        .and_then(Value::as_array)
        .and_then(|plans| plans.first())
        .and_then(|plan| plan.get("Plan"))
        .and_then(|plan| plan.get("Plan Rows"))
        .and_then(Value::as_f64);
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ColumnMeta, QueryResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn row_count_queries_substitute_tokens() {
        let sql = query_actual_row_count("SELECT * FROM t WHERE g && !bbox!");
        assert!(sql.starts_with("select COUNT(*) AS rows FROM ("));
        assert!(sql.contains("ST_MakeEnvelope(0,0,0,0,0)"));
        assert!(!sql.contains("!bbox!"));
    }

    #[test]
    fn row_estimation_uses_dollar_quoting() {
        let sql = query_row_estimation("SELECT * FROM t");
        assert_eq!(
            sql,
            "select cartodb.CDB_EstimateRowCount($tilegrid$SELECT * FROM t$tilegrid$) as rows"
        );
    }

    #[test]
    fn metadata_query_combines_estimation_and_geometry_type() {
        let sql = aggregation_metadata("SELECT * FROM t", "the_geom_webmercator");
        assert!(sql.contains("CDB_EstimateRowCount"));
        assert!(sql.contains("ST_GeometryType(the_geom_webmercator)"));
        assert!(sql.contains("rows AS count"));
        assert!(sql.contains("geom_type AS type"));
    }

    #[test]
    fn strips_only_surrounding_quotes() {
        assert_eq!(strip_quotes("\"cartodb_id\""), "cartodb_id");
        assert_eq!(strip_quotes("cartodb_id"), "cartodb_id");
        assert_eq!(strip_quotes("\"a"), "\"a");
        assert_eq!(strip_quotes("\"\""), "\"\"");
    }

    struct PlanExecutor {
        rows: Mutex<Vec<f64>>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueryExecutor for PlanExecutor {
        async fn query(&self, sql: &str, _read_only: bool) -> Result<QueryResult> {
            self.queries.lock().unwrap().push(sql.to_string());
            let estimate = self.rows.lock().unwrap().remove(0);
            let row = json!({
                "QUERY PLAN": [ { "Plan": { "Plan Rows": estimate } } ]
            });
            Ok(QueryResult {
                columns: vec![ColumnMeta {
                    name: "QUERY PLAN".to_string(),
                    type_name: None,
                }],
                rows: vec![row.as_object().unwrap().clone()],
            })
        }
    }

    #[tokio::test]
    async fn filter_stats_estimate_both_queries() {
        let executor = PlanExecutor {
            rows: Mutex::new(vec![1000.0, 250.0]),
            queries: Mutex::new(Vec::new()),
        };
        let filters: BTreeMap<String, FilterDefinition> = serde_json::from_value(json!({
            "f": { "type": "range", "column": "price", "params": { "min": 5 } }
        }))
        .unwrap();

        let stats = fetch_filter_stats(&executor, "SELECT * FROM t", Some(&filters))
            .await
            .unwrap();
        assert_eq!(stats.unfiltered_rows, Some(1000.0));
        assert_eq!(stats.filtered_rows, Some(250.0));

        let queries = executor.queries.lock().unwrap();
        assert!(queries[0].starts_with("EXPLAIN (FORMAT JSON) SELECT * FROM t"));
        assert!(queries[1].contains("_camshaft_range_filter"));
    }

    #[tokio::test]
    async fn filter_stats_skip_filtered_estimate_without_filters() {
        let executor = PlanExecutor {
            rows: Mutex::new(vec![1000.0]),
            queries: Mutex::new(Vec::new()),
        };
        let stats = fetch_filter_stats(&executor, "SELECT * FROM t", None)
            .await
            .unwrap();
        assert_eq!(stats.unfiltered_rows, Some(1000.0));
        assert_eq!(stats.filtered_rows, None);
        assert_eq!(executor.queries.lock().unwrap().len(), 1);
    }
}
