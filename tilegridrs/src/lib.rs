//! SQL-generation core for a tile-serving backend.
//!
//! Everything here turns declarative layer options into PostgreSQL text:
//! grid-based aggregation queries with time-bucketing dimensions and
//! placement strategies ([`aggregation`]), zoom-aware rewriting of layer
//! queries onto overview tables ([`overviews`]), composable SQL filters
//! ([`filters`]) and the supporting identifier, token and probing helpers.
//! The crate performs no I/O of its own; the few helpers that need live
//! results go through the [`executor::QueryExecutor`] seam.

pub mod aggregation;
pub mod error;
pub mod executor;
pub mod filters;
pub mod mapconfig;
pub mod mercator;
pub mod overviews;
pub mod query_utils;
pub mod sql;
pub mod table_name;
pub mod tokens;

pub use aggregation::{AggregationMapConfig, AggregationOptions, AggregationQueryBuilder};
pub use error::{Result, TilegridError};
pub use executor::{ColumnMeta, QueryExecutor, QueryResult};
pub use mapconfig::MapConfig;
pub use mercator::WebMercatorHelper;
pub use overviews::{OverviewsQueryRewriter, RewriteData, RewriteOptions, RewriterOptions};

/// Install a formatting subscriber honoring `RUST_LOG`. Meant for example
/// binaries and tests; library users configure their own subscriber.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
