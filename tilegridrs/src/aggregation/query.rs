//! Grid-based aggregation query synthesis.
//!
//! Given a source query, a resolution (grid cells per 256px tile side), a
//! placement strategy and optional aggregate columns, dimensions and
//! filters, `AggregationQueryBuilder` emits a single SQL statement that
//! buckets rows into web-mercator grid cells and aggregates per cell.
//!
//! The default aggregation (no explicit placement, columns or dimensions)
//! returns a sample record with all original columns plus
//! `_cdb_feature_count` for each cell. Otherwise columns are aggregated as
//! requested and `the_geom_webmercator` is synthesized per the placement.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::aggregation::time_dimension;
use crate::error::{Result, TilegridError};
use crate::mapconfig::{ColumnSpec, DimensionSpec, FilterInput, FilterParams};
use crate::mercator::WebMercatorHelper;
use crate::sql;

pub const SUPPORTED_PLACEMENTS: &[&str] = &["centroid", "point-grid", "point-sample"];
pub const SUPPORTED_AGGREGATE_FUNCTIONS: &[&str] = &["count", "avg", "sum", "min", "max", "mode"];
pub const GEOMETRY_COLUMN: &str = "the_geom_webmercator";

pub const DEFAULT_PLACEMENT: Placement = Placement::PointSample;

/// Strategy for choosing the representative point of an aggregated cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    /// Average of the cell's point coordinates.
    Centroid,
    /// Exact midpoint of the grid cell.
    PointGrid,
    /// A real sampled point, joined back from the source query.
    #[default]
    PointSample,
}

impl FromStr for Placement {
    type Err = TilegridError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "centroid" => Ok(Placement::Centroid),
            "point-grid" => Ok(Placement::PointGrid),
            "point-sample" => Ok(Placement::PointSample),
            other => Err(TilegridError::Sql(format!(
                "Invalid aggregation placement \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Avg,
    Sum,
    Min,
    Max,
    Mode,
}

impl AggregateFunction {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "count" => Ok(AggregateFunction::Count),
            "avg" => Ok(AggregateFunction::Avg),
            "sum" => Ok(AggregateFunction::Sum),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            "mode" => Ok(AggregateFunction::Mode),
            other => Err(TilegridError::Sql(format!(
                "Invalid aggregate function: '{other}'"
            ))),
        }
    }

    /// SQL for aggregating `column_name` under the given column spec.
    /// `count` defaults its argument to `*`, the rest to the output
    /// column's own name.
    fn sql(&self, column_name: &str, spec: &ColumnSpec) -> String {
        let aggregated = spec.aggregated_column.as_deref();
        match self {
            AggregateFunction::Count => format!("count({})", aggregated.unwrap_or("*")),
            AggregateFunction::Avg => format!("avg({})", aggregated.unwrap_or(column_name)),
            AggregateFunction::Sum => format!("sum({})", aggregated.unwrap_or(column_name)),
            AggregateFunction::Min => format!("min({})", aggregated.unwrap_or(column_name)),
            AggregateFunction::Max => format!("max({})", aggregated.unwrap_or(column_name)),
            AggregateFunction::Mode => format!(
                "mode() WITHIN GROUP (ORDER BY {})",
                aggregated.unwrap_or(column_name)
            ),
        }
    }
}

/// One HAVING condition over an aggregate or dimension expression.
/// A filter spec maps to exactly one variant; when several parameter
/// combinations are present the first match below wins.
#[derive(Debug, Clone)]
pub enum FilterCondition {
    Between { lo: Value, hi: Value },
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Equal(Value),
    NotEqual(Value),
    Range(Vec<(&'static str, Value)>),
}

impl FilterCondition {
    pub fn from_params(params: &FilterParams) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (
            &params.greater_than_or_equal_to,
            &params.less_than_or_equal_to,
        ) {
            return Ok(FilterCondition::Between {
                lo: lo.clone(),
                hi: hi.clone(),
            });
        }
        if let Some(values) = &params.in_values {
            return Ok(FilterCondition::In(values.clone()));
        }
        if let Some(values) = &params.not_in {
            return Ok(FilterCondition::NotIn(values.clone()));
        }
        if let Some(value) = &params.equal {
            return Ok(FilterCondition::Equal(value.clone()));
        }
        if let Some(value) = &params.not_equal {
            return Ok(FilterCondition::NotEqual(value.clone()));
        }
        let mut bounds = Vec::new();
        if let Some(v) = &params.greater_than_or_equal_to {
            bounds.push((">=", v.clone()));
        }
        if let Some(v) = &params.greater_than {
            bounds.push((">", v.clone()));
        }
        if let Some(v) = &params.less_than_or_equal_to {
            bounds.push(("<=", v.clone()));
        }
        if let Some(v) = &params.less_than {
            bounds.push(("<", v.clone()));
        }
        if bounds.is_empty() {
            return Err(TilegridError::Filter(
                "Filter must specify at least one condition parameter".to_string(),
            ));
        }
        Ok(FilterCondition::Range(bounds))
    }

    pub fn sql(&self, expr: &str) -> String {
        match self {
            FilterCondition::Between { lo, hi } => {
                format!("({expr} BETWEEN {} AND {})", sql::literal(lo), sql::literal(hi))
            }
            FilterCondition::In(values) => {
                format!("({expr} IN ({}))", literal_list(values))
            }
            FilterCondition::NotIn(values) => {
                format!("({expr} NOT IN ({}))", literal_list(values))
            }
            FilterCondition::Equal(value) => format!("({expr} = {})", sql::literal(value)),
            FilterCondition::NotEqual(value) => format!("({expr} <> {})", sql::literal(value)),
            FilterCondition::Range(bounds) => bounds
                .iter()
                .map(|(op, value)| format!("({expr} {op} {})", sql::literal(value)))
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }
}

fn literal_list(values: &[Value]) -> String {
    values.iter().map(sql::literal).collect::<Vec<_>>().join(",")
}

/// Everything the builder needs for one layer.
#[derive(Debug, Clone, Default)]
pub struct AggregationOptions {
    pub query: String,
    /// Grid cells per 256px tile side. An aggregation cell is
    /// `resolution * resolution` pixels.
    pub resolution: f64,
    pub columns: BTreeMap<String, ColumnSpec>,
    pub dimensions: BTreeMap<String, DimensionSpec>,
    pub filters: BTreeMap<String, FilterInput>,
    pub placement: Option<String>,
    pub is_default_aggregation: bool,
}

/// Metadata about one emitted dimension expression.
#[derive(Debug, Clone)]
pub struct DimensionInfo {
    pub sql: String,
    pub params: Option<Map<String, Value>>,
    pub dimension_type: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationQueryBuilder {
    mercator: WebMercatorHelper,
}

impl AggregationQueryBuilder {
    pub fn new(mercator: WebMercatorHelper) -> Self {
        Self { mercator }
    }

    /// The full aggregation statement for the given options.
    pub fn sql(&self, options: &AggregationOptions) -> Result<String> {
        let placement = placement_for(options)?;
        let grid_info = self.grid_info_query(options.resolution);
        let point_select = aggregated_point_web_mercator(placement);
        let dimension_defs = dimension_defs(options)?;
        let column_defs = aggregate_column_defs(options)?;
        let pos_x = aggregated_pos_coordinate(placement, "x");
        let pos_y = aggregated_pos_coordinate(placement, "y");
        let group_dimensions = dimension_names(options);
        let having = having_clause(options)?;
        let join = aggregated_point_join(placement, options);
        let source = &options.query;

        Ok(format!(
            r#"
WITH __cdb_grid_params AS
(
    {grid_info}
)
SELECT * FROM
(
    SELECT
        min(cartodb_id) as cartodb_id
        {point_select}
        {dimension_defs}
        {column_defs}
    FROM
    (
        SELECT
            *,
            {pos_x} as cdb_pos_grid_x,
            {pos_y} as cdb_pos_grid_y
        FROM
        (
            SELECT
                __cdb_src_query.*,
                ST_X(the_geom_webmercator) cdb_x,
                ST_Y(the_geom_webmercator) cdb_y
            FROM
            (
                {source}
            ) __cdb_src_query, __cdb_grid_params
            WHERE the_geom_webmercator && cdb_point_bbox
            OFFSET 0
        ) __cdb_src_get_x_y, __cdb_grid_params
        WHERE cdb_x < __cdb_grid_params.cdb_xmax AND cdb_y < __cdb_grid_params.cdb_ymax
    ) __cdb_src_gridded
    GROUP BY cdb_pos_grid_x, cdb_pos_grid_y {group_dimensions}
    {having}
) __cdb_aggregation_src
{join}
"#
        ))
    }

    /// Per-dimension `{sql, params, type}` metadata, for callers that need
    /// to describe the aggregated columns without running the query.
    pub fn dimensions_info(
        &self,
        options: &AggregationOptions,
    ) -> Result<BTreeMap<String, DimensionInfo>> {
        dimension_names_and_expressions(options)
            .map(|infos| infos.into_iter().collect())
    }

    /// Query selecting every source row falling in the grid cell of the
    /// feature identified by `id`, for cluster expansion.
    pub fn features_query(&self, id: i64, options: &AggregationOptions) -> String {
        let resolution_sql = self.grid_resolution(options.resolution);
        let source = &options.query;
        format!(
            r#"
    WITH
    _cdb_params AS (
        SELECT
        {resolution_sql} AS res
    ),
    _cell AS (
        SELECT
        ST_MakeEnvelope(
            Floor(ST_X(_cdb_query.the_geom_webmercator)/_cdb_params.res)*_cdb_params.res,
            Floor(ST_Y(_cdb_query.the_geom_webmercator)/_cdb_params.res)*_cdb_params.res,
            Floor(ST_X(_cdb_query.the_geom_webmercator)/_cdb_params.res + 1)*_cdb_params.res,
            Floor(ST_Y(_cdb_query.the_geom_webmercator)/_cdb_params.res + 1)*_cdb_params.res,
            3857
        ) AS bbox
        FROM ({source}) _cdb_query, _cdb_params
        WHERE _cdb_query.cartodb_id = {id}
    )
    SELECT _cdb_query.* FROM _cell, ({source}) _cdb_query
        WHERE ST_Intersects(_cdb_query.the_geom_webmercator, _cell.bbox)
"#
        )
    }

    // Aggregation cells are always relative to 256px tiles while
    // !pixel_width! varies with the tile extent, so the resolution is
    // derived from !scale_denominator! instead. The 0.00028 factor comes
    // from OGC SLD. The zoom-38 pixel size (about 0.15mm) caps how small a
    // cell can get, avoiding divisions by zero.
    fn grid_resolution(&self, resolution: f64) -> String {
        let minimum_resolution = self.mercator.resolution(38);
        format!(
            "{resolution} * GREATEST(!scale_denominator! * 0.00028, {minimum_resolution})::double precision"
        )
    }

    // Boundaries of the area to be aggregated plus the cell size.
    // cdb_{x,y}{min,max} delimit the tile; aggregation covers [min, max)
    // in both axes. cdb_point_bbox is the [min, max] tile bounding box.
    fn grid_info_query(&self, resolution: f64) -> String {
        let resolution_sql = self.grid_resolution(resolution);
        format!(
            r#"
    SELECT
        cdb_xmin,
        cdb_ymin,
        cdb_xmax,
        cdb_ymax,
        cdb_res,
        ST_MakeEnvelope(cdb_xmin, cdb_ymin, cdb_xmax, cdb_ymax, 3857) AS cdb_point_bbox
    FROM
    (
        SELECT
            cdb_res,
            CEIL (ST_XMIN(cdb_full_bbox) / cdb_res) * cdb_res AS cdb_xmin,
            FLOOR(ST_XMAX(cdb_full_bbox) / cdb_res) * cdb_res AS cdb_xmax,
            CEIL (ST_YMIN(cdb_full_bbox) / cdb_res) * cdb_res AS cdb_ymin,
            FLOOR(ST_YMAX(cdb_full_bbox) / cdb_res) * cdb_res AS cdb_ymax
        FROM
        (
            SELECT
                {resolution_sql} AS cdb_res,
                !bbox! cdb_full_bbox
        ) _cdb_input_resources
    ) _cdb_grid_bbox_margins
"#
        )
    }
}

fn placement_for(options: &AggregationOptions) -> Result<Placement> {
    match options.placement.as_deref() {
        Some(name) => name.parse(),
        None => Ok(DEFAULT_PLACEMENT),
    }
}

// Joins a list as ", a, b" so it can be appended after a previous select
// item; empty lists vanish.
fn sep(items: Vec<String>) -> String {
    if items.is_empty() {
        String::new()
    } else {
        format!(", {}", items.join(", "))
    }
}

// The synthetic _cdb_feature_count column behaves as an extra requested
// count(*) column.
fn aggregate_columns(options: &AggregationOptions) -> BTreeMap<String, ColumnSpec> {
    let mut columns = options.columns.clone();
    columns.entry("_cdb_feature_count".to_string()).or_insert(ColumnSpec {
        aggregate_function: Some("count".to_string()),
        aggregated_column: None,
    });
    columns
}

fn aggregate_expression(column_name: &str, spec: &ColumnSpec) -> Result<String> {
    let function = AggregateFunction::from_name(
        spec.aggregate_function.as_deref().unwrap_or("count"),
    )?;
    Ok(function.sql(column_name, spec))
}

fn aggregate_column_defs(options: &AggregationOptions) -> Result<String> {
    let columns = aggregate_columns(options);
    let mut defs = Vec::with_capacity(columns.len());
    for (name, spec) in &columns {
        defs.push(format!("{} AS {name}", aggregate_expression(name, spec)?));
    }
    Ok(sep(defs))
}

// definition.column is expected to hold a wrapped date column.
fn time_dimension_parameters(definition: &DimensionSpec) -> Map<String, Value> {
    let group = definition.group.clone().unwrap_or_default();
    let mut params = Map::new();
    params.insert(
        "time".to_string(),
        Value::from(format!("to_timestamp(\"{}\")", definition.column)),
    );
    params.insert(
        "timezone".to_string(),
        group
            .timezone
            .map(|tz| serde_json::to_value(tz).unwrap_or(Value::Null))
            .unwrap_or_else(|| Value::from("utc")),
    );
    if let Some(units) = group.units {
        params.insert("units".to_string(), Value::from(units));
    }
    params.insert("count".to_string(), Value::from(group.count.unwrap_or(1)));
    if let Some(starting) = group.starting {
        params.insert("starting".to_string(), Value::from(starting));
    }
    if let Some(format) = &definition.format {
        params.insert("format".to_string(), Value::from(format.clone()));
    }
    params
}

fn dimension_expression(definition: &DimensionSpec) -> Result<DimensionInfo> {
    if definition.group.is_some() {
        // only time dimensions support grouping parameters
        let expression = time_dimension::classify(&time_dimension_parameters(definition))?;
        Ok(DimensionInfo {
            sql: expression.sql,
            params: Some(expression.effective_params),
            dimension_type: Some("timeDimension"),
        })
    } else {
        Ok(DimensionInfo {
            sql: format!("\"{}\"", definition.column),
            params: None,
            dimension_type: None,
        })
    }
}

fn dimension_names_and_expressions(
    options: &AggregationOptions,
) -> Result<Vec<(String, DimensionInfo)>> {
    options
        .dimensions
        .iter()
        .map(|(name, definition)| Ok((name.clone(), dimension_expression(definition)?)))
        .collect()
}

fn dimension_names(options: &AggregationOptions) -> String {
    sep(options
        .dimensions
        .keys()
        .map(|name| format!("\"{name}\""))
        .collect())
}

fn dimension_defs(options: &AggregationOptions) -> Result<String> {
    let defs = dimension_names_and_expressions(options)?
        .into_iter()
        .map(|(name, info)| format!("{} AS \"{name}\"", info.sql))
        .collect();
    Ok(sep(defs))
}

fn filter_condition_sql(expr: &str, input: &FilterInput) -> Result<String> {
    let conditions = input
        .as_slice()
        .iter()
        .map(|params| Ok(FilterCondition::from_params(params)?.sql(expr)))
        .collect::<Result<Vec<_>>>()?;
    Ok(conditions.join(" OR "))
}

// A filtered name must reference a declared aggregate column (including
// the implicit _cdb_feature_count) or a dimension; dimension filters
// compare against the emitted dimension expression.
fn filter_conditions(options: &AggregationOptions) -> Result<String> {
    let columns = aggregate_columns(options);
    let mut conditions = Vec::with_capacity(options.filters.len());
    for (filtered, input) in &options.filters {
        let expr = if let Some(spec) = columns.get(filtered) {
            aggregate_expression(filtered, spec)?
        } else if let Some(dimension) = options.dimensions.get(filtered) {
            dimension_expression(dimension)?.sql
        } else {
            return Err(TilegridError::Sql(format!(
                "Invalid filtered column: '{filtered}'"
            )));
        };
        conditions.push(filter_condition_sql(&expr, input)?);
    }
    Ok(conditions.join(" AND "))
}

fn having_clause(options: &AggregationOptions) -> Result<String> {
    let conditions = filter_conditions(options)?;
    Ok(if conditions.is_empty() {
        String::new()
    } else {
        format!("HAVING {conditions}")
    })
}

fn aggregated_point_web_mercator(placement: Placement) -> &'static str {
    match placement {
        Placement::Centroid => {
            ", ST_SetSRID(ST_MakePoint(AVG(cdb_x), AVG(cdb_y)), 3857) AS the_geom_webmercator"
        }
        Placement::PointGrid => {
            ", ST_SetSRID(ST_MakePoint(cdb_pos_grid_x, cdb_pos_grid_y), 3857) AS the_geom_webmercator"
        }
        // point-sample gets its geometry from the source join
        Placement::PointSample => "",
    }
}

fn aggregated_point_join(placement: Placement, options: &AggregationOptions) -> String {
    match placement {
        Placement::Centroid | Placement::PointGrid => String::new(),
        // The default aggregation keeps every source column for
        // backwards compatibility; explicit aggregations only need the id
        // and the geometry.
        Placement::PointSample => {
            let selected = if options.is_default_aggregation {
                "*"
            } else {
                "cartodb_id, the_geom_webmercator"
            };
            format!(
                r#"
            NATURAL JOIN
            (
                SELECT {selected}
                FROM
                (
                    {}
                ) __cdb_src_query
            ) __cdb_query_columns
        "#,
                options.query
            )
        }
    }
}

// For point-grid the common per-cell value is the midpoint coordinate, so
// it does not have to be recomputed downstream; otherwise it is the cell
// index relative to the world.
fn aggregated_pos_coordinate(placement: Placement, coordinate: &str) -> String {
    match placement {
        Placement::PointGrid => format!(
            "(FLOOR(cdb_{coordinate} / __cdb_grid_params.cdb_res) + 0.5) * __cdb_grid_params.cdb_res"
        ),
        _ => format!("FLOOR(cdb_{coordinate} / __cdb_grid_params.cdb_res)"),
    }
}
