//! Stateless SQL-wrapping filter transforms.
//!
//! Every filter is a small value object built from caller-supplied
//! parameters plus a `sql(raw)` method that wraps an arbitrary query in a
//! subselect with the filter's WHERE condition. Filters compose by
//! nesting: applying A then B ANDs the predicates without either filter
//! knowing about the other.

mod analysis;
mod bbox;
mod category;
mod circle;
mod polygon;
mod range;

pub use analysis::{AnalysisFilters, FilterDefinition, FilterDefinitionParams};
pub use bbox::{BboxFilter, BboxFilterDefinition, BboxParams};
pub use category::CategoryFilter;
pub use circle::{CircleFilter, CircleFilterDefinition};
pub use polygon::{PolygonFilter, PolygonFilterDefinition};
pub use range::RangeFilter;

/// Geometry column the spatial filters target unless told otherwise.
pub const DEFAULT_GEOMETRY_COLUMN: &str = "the_geom_webmercator";

/// SRID of the web-mercator geometry column.
pub const DEFAULT_SRID: i32 = 3857;
