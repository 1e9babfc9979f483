//! Rewriting of layer queries to read from overview tables.
//!
//! Overview tables are pre-aggregated copies of a base table, each good up
//! to a maximum zoom level. When a layer query has a simple enough shape,
//! every reference to a base table with overviews is replaced either by the
//! single best overview (when the zoom level is known up front) or by a
//! UNION of zoom-conditional arms selected at execution time through a
//! `_vovw_scale` CTE computed by the database server.
//!
//! Names introduced by the rewrite carry the `_vovw_` prefix (for vector
//! overviews); no check is made for conflicts with identifiers already in
//! the query.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::filters::{
    AnalysisFilters, BboxFilter, BboxFilterDefinition, BboxParams, FilterDefinition,
};
use crate::table_name::{self, ParsedTableName};

/// Minimum number of filtered rows to use overviews.
const FILTER_MIN_ROWS: f64 = 65536.0;
/// Maximum filtered fraction below which overviews are not applied.
const FILTER_MAX_FRACTION: f64 = 0.2;

const BASIC_QUERY: &str = r#"\s*SELECT\s+[*a-z0-9_,\s]+?\s+FROM\s+(("[^"]+"|[a-z0-9_]+)\.)?("[^"]+"|[a-z0-9_]+)\s*;?\s*"#;

static UNWRAPPED_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!("(?i)^{BASIC_QUERY}$")).expect("valid unwrapped query regex")
});

// queries for named maps are wrapped like this
static WRAPPED_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^\s*SELECT\s+\*\s+FROM\s+\({BASIC_QUERY}\)\s+AS\s+wrapped_query\s+WHERE\s+\d+=1\s*$"
    ))
    .expect("valid wrapped query regex")
});

/// One overview table, valid up to its zoom level.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct OverviewTable {
    pub table: String,
}

/// Overviews of one base table: an optional schema plus a map from maximum
/// zoom level to overview table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOverviews {
    pub schema: Option<String>,
    pub levels: BTreeMap<u32, OverviewTable>,
}

// Metadata arrives with zoom levels and the schema as sibling keys of the
// same JSON object, so the numeric keys have to be picked apart by hand.
impl<'de> Deserialize<'de> for TableOverviews {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<String, Value> = BTreeMap::deserialize(deserializer)?;
        let mut overviews = TableOverviews::default();
        for (key, value) in raw {
            if key == "schema" {
                overviews.schema = match value {
                    Value::String(schema) => Some(schema),
                    Value::Null => None,
                    other => {
                        return Err(de::Error::custom(format!(
                            "unexpected schema value: {other}"
                        )))
                    }
                };
            } else if let Ok(zoom) = key.parse::<u32>() {
                let table = OverviewTable::deserialize(value).map_err(de::Error::custom)?;
                overviews.levels.insert(zoom, table);
            } else {
                return Err(de::Error::custom(format!(
                    "unexpected overview key: {key}"
                )));
            }
        }
        Ok(overviews)
    }
}

/// Overview metadata for every base table appearing in a query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverviewsMetadata(pub BTreeMap<String, TableOverviews>);

impl OverviewsMetadata {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Row estimates for the filtered and unfiltered forms of a query, used to
/// decide whether a filtered layer still benefits from overviews.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FilterStats {
    pub unfiltered_rows: Option<f64>,
    pub filtered_rows: Option<f64>,
}

/// Bbox filter to re-apply after a successful rewrite.
#[derive(Debug, Clone, Default)]
pub struct BboxFilterInput {
    pub options: BboxFilterDefinition,
    pub params: BboxParams,
}

/// Everything known about the query being rewritten.
#[derive(Debug, Clone, Default)]
pub struct RewriteData {
    pub overviews: Option<OverviewsMetadata>,
    pub filters: Option<BTreeMap<String, FilterDefinition>>,
    /// The query before filters were applied; substitution happens here
    /// and the filters are re-applied afterwards.
    pub unfiltered_query: Option<String>,
    pub bbox_filter: Option<BboxFilterInput>,
    pub filter_stats: Option<FilterStats>,
}

/// Per-request options.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteOptions {
    /// Definite zoom level, when the caller knows it.
    pub zoom_level: Option<u32>,
}

/// Rewriter configuration.
#[derive(Debug, Clone, Default)]
pub struct RewriterOptions {
    /// SQL expression yielding the current zoom level, evaluated by the
    /// database server (e.g. `CDB_ZoomFromScale(!scale_denominator!)`).
    pub zoom_level: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OverviewsQueryRewriter {
    options: RewriterOptions,
}

impl OverviewsQueryRewriter {
    pub fn new(options: RewriterOptions) -> Self {
        Self { options }
    }

    /// Rewrite `query` to use overview tables; returns the query unchanged
    /// when overviews are absent, the query shape is unsupported, the
    /// filter statistics say aggregating is not worth it, or no table
    /// could be substituted.
    pub fn rewrite(
        &self,
        query: &str,
        data: &RewriteData,
        options: &RewriteOptions,
    ) -> Result<String> {
        let unfiltered_query = data.unfiltered_query.as_deref().unwrap_or(query);

        let overviews = match &data.overviews {
            Some(overviews) if should_use_overviews(unfiltered_query, data) => overviews,
            _ => return Ok(query.to_string()),
        };

        let zoom_level = self.zoom_level_for_query(options);
        let rewritten = match zoom_level {
            Some(zoom) => query_with_definite_zoom(unfiltered_query, overviews, zoom),
            None => {
                let expression = self
                    .options
                    .zoom_level
                    .as_deref()
                    .unwrap_or("0");
                query_with_zoom_expression(unfiltered_query, overviews, expression)
            }
        };

        if rewritten == unfiltered_query {
            // could not or did not need to alter the query
            return Ok(query.to_string());
        }

        debug!(target: "tilegrid::overviews", "rewrote query to use overviews");
        apply_filters(rewritten, data)
    }

    // An explicit zoom option wins; without it the configured expression
    // defers the decision to the server, and with neither the zoom is 0.
    fn zoom_level_for_query(&self, options: &RewriteOptions) -> Option<u32> {
        if options.zoom_level.is_some() {
            return options.zoom_level;
        }
        if self.options.zoom_level.is_none() {
            return Some(0);
        }
        None
    }
}

fn apply_filters(query: String, data: &RewriteData) -> Result<String> {
    let mut query = query;
    if let Some(filters) = &data.filters {
        if !filters.is_empty() {
            query = AnalysisFilters::new(filters)?.sql(&query);
        }
    }
    if let Some(bbox) = &data.bbox_filter {
        query = BboxFilter::new(&bbox.options, &bbox.params)?.sql(&query);
    }
    Ok(query)
}

fn should_use_overviews(query: &str, data: &RewriteData) -> bool {
    let mut use_overviews = data.overviews.is_some() && is_supported_query(query);
    if use_overviews && data.filters.is_some() {
        if let Some(stats) = data.filter_stats {
            if let (Some(unfiltered_rows), Some(filtered_rows)) =
                (stats.unfiltered_rows.filter(|rows| *rows != 0.0), stats.filtered_rows)
            {
                use_overviews = filtered_rows >= FILTER_MIN_ROWS
                    || (filtered_rows / unfiltered_rows) > FILTER_MAX_FRACTION;
            }
        }
    }
    use_overviews
}

fn is_supported_query(sql: &str) -> bool {
    UNWRAPPED_QUERY.is_match(sql) || WRAPPED_QUERY.is_match(sql)
}

fn query_with_definite_zoom(query: &str, overviews: &OverviewsMetadata, zoom: u32) -> String {
    let mut replaced_query = query.to_string();
    for (table, table_overviews) in &overviews.0 {
        if let Some(replacement) = overview_table_for_zoom_level(table_overviews, zoom) {
            replaced_query = replace_table_in_query_with_schema(
                &replaced_query,
                table,
                table_overviews.schema.as_deref(),
                &replacement,
            );
        }
    }
    replaced_query
}

// The smallest-level overview valid for the zoom; none when the zoom is
// beyond every overview, leaving the base table in place.
fn overview_table_for_zoom_level(overviews: &TableOverviews, zoom: u32) -> Option<String> {
    overviews
        .levels
        .range(zoom..)
        .next()
        .map(|(_, overview)| overview.table.clone())
}

fn query_with_zoom_expression(
    query: &str,
    overviews: &OverviewsMetadata,
    zoom_level_expression: &str,
) -> String {
    let mut replaced_query = query.to_string();
    for (table, table_overviews) in &overviews.0 {
        let Some(view) = overviews_view_for_table(table, table_overviews) else {
            continue;
        };
        let Some(view_name) = overviews_view_name(table) else {
            continue;
        };
        let replacement = format!("(\n{view}\n  ) AS {view_name}");
        replaced_query = replace_table_in_query_with_schema(
            &replaced_query,
            table,
            table_overviews.schema.as_deref(),
            &replacement,
        );
    }
    if replaced_query != query {
        format!(
            "WITH\n  _vovw_scale AS ( SELECT {zoom_level_expression} AS _vovw_z )\n{replaced_query}"
        )
    } else {
        query.to_string()
    }
}

// UNION of overview arms partitioning the zoom axis, ending with the base
// table for every zoom beyond the last overview. Table and overview names
// may include a schema and are assumed to be quoted as needed.
fn overviews_view_for_table(table: &str, overviews: &TableOverviews) -> Option<String> {
    let parsed_table = table_name::parse(table)?;
    if overviews.levels.is_empty() {
        return None;
    }

    let indent = "    ";
    let mut arms: Vec<(String, String)> = Vec::with_capacity(overviews.levels.len() + 1);
    let mut z_lo: Option<u32> = None;
    for (z_hi, overview) in &overviews.levels {
        arms.push((overview_z_condition(z_lo, *z_hi), overview.table.clone()));
        z_lo = Some(*z_hi);
    }
    let z_max = z_lo?;
    arms.push((format!("_vovw_z > {z_max}"), table.to_string()));

    let mut selects = Vec::with_capacity(arms.len());
    for (condition, arm_table) in arms {
        let mut parsed_arm = table_name::parse(&arm_table)?;
        if parsed_arm.schema.is_none() {
            parsed_arm.schema = parsed_table.schema.clone();
        }
        let identifier = table_name::table_identifier(&parsed_arm);
        selects.push(format!(
            "{indent}SELECT * FROM {identifier}, _vovw_scale WHERE {condition}"
        ));
    }
    Some(selects.join(&format!("\n{indent}UNION ALL\n")))
}

// Adjacent levels collapse into an equality check; the first arm starts
// open-ended at zoom 0.
fn overview_z_condition(z_lo: Option<u32>, z_hi: u32) -> String {
    match z_lo {
        Some(z_lo) if z_lo + 1 == z_hi => format!("_vovw_z = {z_hi}"),
        Some(z_lo) => format!("_vovw_z > {z_lo} AND _vovw_z <= {z_hi}"),
        None if z_hi == 0 => format!("_vovw_z = {z_hi}"),
        None => format!("_vovw_z <= {z_hi}"),
    }
}

// Name for the view standing in for a table, always unqualified.
fn overviews_view_name(table: &str) -> Option<String> {
    let parsed = table_name::parse(table)?;
    Some(table_name::table_identifier(&ParsedTableName {
        schema: None,
        table: format!("_vovw_{}", parsed.table),
    }))
}

fn replace_table_in_query_with_schema(
    query: &str,
    table: &str,
    schema: Option<&str>,
    replacement: &str,
) -> String {
    let mut query = replace_table_in_query(query, table, replacement);
    if let Some(schema) = schema {
        if let Some(parsed) = table_name::parse(table) {
            if parsed.schema.is_none() {
                // replace also the qualified form of an unqualified table
                let qualified = table_name::table_identifier(&ParsedTableName {
                    schema: Some(schema.to_string()),
                    table: parsed.table,
                });
                query = replace_table_in_query(&query, &qualified, replacement);
            }
        }
    }
    query
}

// Replace every occurrence of a table name. The match must not sit inside
// a longer identifier, and an unqualified name must not follow a dot
// (which would make it a column or a table of an explicit schema).
fn replace_table_in_query(sql: &str, old_table_name: &str, replacement: &str) -> String {
    let Some(old_table) = table_name::parse(old_table_name) else {
        return sql.to_string();
    };
    let identifier = table_name::table_identifier(&old_table);
    let escaped = regex::escape(&identifier);
    let suffix = if identifier.ends_with('"') { "" } else { r"\b" };

    if old_table.schema.is_some() {
        let prefix = if identifier.starts_with('"') { "" } else { r"\b" };
        let Ok(pattern) = Regex::new(&format!("{prefix}{escaped}{suffix}")) else {
            return sql.to_string();
        };
        pattern.replace_all(sql, replacement).into_owned()
    } else {
        // the leading character is part of the match and has to be kept
        let Ok(pattern) = Regex::new(&format!("([^.a-z0-9_]|^){escaped}{suffix}")) else {
            return sql.to_string();
        };
        pattern
            .replace_all(sql, |caps: &regex::Captures<'_>| {
                format!(
                    "{}{replacement}",
                    caps.get(1).map_or("", |m| m.as_str())
                )
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: serde_json::Value) -> OverviewsMetadata {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn metadata_mixes_schema_and_zoom_keys() {
        let parsed = metadata(json!({
            "table1": {
                "schema": "public",
                "1": { "table": "table1_ov1" },
                "3": { "table": "table1_ov3" }
            }
        }));
        let table1 = &parsed.0["table1"];
        assert_eq!(table1.schema.as_deref(), Some("public"));
        assert_eq!(table1.levels[&1].table, "table1_ov1");
        assert_eq!(table1.levels[&3].table, "table1_ov3");
    }

    #[test]
    fn supported_query_shapes() {
        assert!(is_supported_query("SELECT * FROM table1"));
        assert!(is_supported_query("  select id, name FROM \"Table 2\" ; "));
        assert!(is_supported_query("SELECT * FROM schema1.table1"));
        assert!(is_supported_query(
            "SELECT * FROM (SELECT * FROM table1) AS wrapped_query WHERE 1=1"
        ));
        assert!(!is_supported_query("SELECT *, ST_X(g) FROM t GROUP BY x"));
        assert!(!is_supported_query("SELECT * FROM t1 JOIN t2 ON t1.id = t2.id"));
    }

    #[test]
    fn unrelated_tables_are_left_alone() {
        let sql = "SELECT * FROM table1_extended";
        assert_eq!(
            replace_table_in_query(sql, "table1", "repl"),
            "SELECT * FROM table1_extended"
        );
        assert_eq!(
            replace_table_in_query("SELECT * FROM xtable1", "table1", "repl"),
            "SELECT * FROM xtable1"
        );
        assert_eq!(
            replace_table_in_query("SELECT * FROM other.table1", "table1", "repl"),
            "SELECT * FROM other.table1"
        );
    }

    #[test]
    fn substitutes_quoted_and_qualified_names() {
        assert_eq!(
            replace_table_in_query("SELECT * FROM \"my table\"", "\"my table\"", "repl"),
            "SELECT * FROM repl"
        );
        assert_eq!(
            replace_table_in_query("SELECT * FROM s.t WHERE x > 0", "s.t", "repl"),
            "SELECT * FROM repl WHERE x > 0"
        );
    }

    #[test]
    fn definite_zoom_picks_the_smallest_covering_overview() {
        let overviews = metadata(json!({
            "table1": {
                "0": { "table": "table1_ov0" },
                "2": { "table": "table1_ov2" },
                "3": { "table": "table1_ov3" }
            }
        }));
        let rewritten = query_with_definite_zoom("SELECT * FROM table1", &overviews, 3);
        assert_eq!(rewritten, "SELECT * FROM table1_ov3");
        let rewritten = query_with_definite_zoom("SELECT * FROM table1", &overviews, 1);
        assert_eq!(rewritten, "SELECT * FROM table1_ov2");
        // zoom beyond every overview keeps the base table
        let rewritten = query_with_definite_zoom("SELECT * FROM table1", &overviews, 4);
        assert_eq!(rewritten, "SELECT * FROM table1");
    }

    #[test]
    fn zoom_conditions_partition_the_axis() {
        assert_eq!(overview_z_condition(None, 0), "_vovw_z = 0");
        assert_eq!(overview_z_condition(None, 2), "_vovw_z <= 2");
        assert_eq!(overview_z_condition(Some(2), 3), "_vovw_z = 3");
        assert_eq!(overview_z_condition(Some(2), 5), "_vovw_z > 2 AND _vovw_z <= 5");
    }

    #[test]
    fn symbolic_zoom_builds_union_view() {
        let rewriter = OverviewsQueryRewriter::new(RewriterOptions {
            zoom_level: Some("CDB_ZoomFromScale(!scale_denominator!)".to_string()),
        });
        let data = RewriteData {
            overviews: Some(metadata(json!({
                "table1": { "1": { "table": "table1_ov1" } }
            }))),
            ..Default::default()
        };
        let sql = rewriter
            .rewrite("SELECT * FROM table1", &data, &RewriteOptions::default())
            .unwrap();
        let expected = "WITH\n  _vovw_scale AS ( SELECT CDB_ZoomFromScale(!scale_denominator!) AS _vovw_z )\nSELECT * FROM (\n    SELECT * FROM table1_ov1, _vovw_scale WHERE _vovw_z <= 1\n    UNION ALL\n    SELECT * FROM table1, _vovw_scale WHERE _vovw_z > 1\n  ) AS _vovw_table1";
        assert_eq!(sql, expected);
    }

    #[test]
    fn unsupported_query_passes_through() {
        let rewriter = OverviewsQueryRewriter::default();
        let data = RewriteData {
            overviews: Some(metadata(json!({
                "table1": { "1": { "table": "table1_ov1" } }
            }))),
            ..Default::default()
        };
        let query = "SELECT t1.*, t2.x FROM table1 t1 JOIN t2 ON true";
        let sql = rewriter
            .rewrite(query, &data, &RewriteOptions::default())
            .unwrap();
        assert_eq!(sql, query);
    }

    #[test]
    fn missing_overviews_pass_through() {
        let rewriter = OverviewsQueryRewriter::default();
        let sql = rewriter
            .rewrite(
                "SELECT * FROM table1",
                &RewriteData::default(),
                &RewriteOptions::default(),
            )
            .unwrap();
        assert_eq!(sql, "SELECT * FROM table1");
    }

    #[test]
    fn selectivity_gate_blocks_highly_selective_filters() {
        let filters: BTreeMap<String, FilterDefinition> = serde_json::from_value(json!({
            "f": { "type": "range", "column": "price", "params": { "min": 1 } }
        }))
        .unwrap();
        let base = RewriteData {
            overviews: Some(metadata(json!({
                "table1": { "1": { "table": "table1_ov1" } }
            }))),
            filters: Some(filters),
            unfiltered_query: Some("SELECT * FROM table1".to_string()),
            ..Default::default()
        };

        // few filtered rows and a small fraction: not worth it
        let selective = RewriteData {
            filter_stats: Some(FilterStats {
                unfiltered_rows: Some(1_000_000.0),
                filtered_rows: Some(100.0),
            }),
            ..base.clone()
        };
        assert!(!should_use_overviews("SELECT * FROM table1", &selective));

        // large absolute count qualifies
        let many_rows = RewriteData {
            filter_stats: Some(FilterStats {
                unfiltered_rows: Some(10_000_000.0),
                filtered_rows: Some(70_000.0),
            }),
            ..base.clone()
        };
        assert!(should_use_overviews("SELECT * FROM table1", &many_rows));

        // large fraction qualifies even below the absolute minimum
        let large_fraction = RewriteData {
            filter_stats: Some(FilterStats {
                unfiltered_rows: Some(1_000.0),
                filtered_rows: Some(900.0),
            }),
            ..base.clone()
        };
        assert!(should_use_overviews("SELECT * FROM table1", &large_fraction));

        // no stats: benefit of the doubt
        assert!(should_use_overviews("SELECT * FROM table1", &base));
    }

    #[test]
    fn filters_are_reapplied_after_rewrite() {
        let filters: BTreeMap<String, FilterDefinition> = serde_json::from_value(json!({
            "f": { "type": "range", "column": "price", "params": { "min": 5 } }
        }))
        .unwrap();
        let rewriter = OverviewsQueryRewriter::default();
        let data = RewriteData {
            overviews: Some(metadata(json!({
                "table1": { "1": { "table": "table1_ov1" } }
            }))),
            filters: Some(filters),
            unfiltered_query: Some("SELECT * FROM table1".to_string()),
            ..Default::default()
        };
        let sql = rewriter
            .rewrite(
                "SELECT * FROM (SELECT * FROM table1) _camshaft_range_filter WHERE price >= 5",
                &data,
                &RewriteOptions { zoom_level: Some(1) },
            )
            .unwrap();
        assert!(sql.contains("table1_ov1"));
        assert!(sql.contains("_camshaft_range_filter"));
        assert!(sql.ends_with("price >= 5"));
    }

    #[test]
    fn schema_qualified_form_is_substituted_for_unqualified_metadata() {
        let overviews = metadata(json!({
            "table1": {
                "schema": "public",
                "1": { "table": "table1_ov1" }
            }
        }));
        let rewritten =
            query_with_definite_zoom("SELECT * FROM public.table1", &overviews, 0);
        assert_eq!(rewritten, "SELECT * FROM table1_ov1");
    }
}
