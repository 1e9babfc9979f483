//! Database seam for the helpers that need live query results.
//!
//! The crate never opens connections itself; callers hand in anything that
//! implements [`QueryExecutor`] and the schema-probing and stats helpers
//! run their generated SQL through it.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    /// Database-specific type name, when the driver reports one.
    pub type_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Map<String, Value>>,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn query(&self, sql: &str, read_only: bool) -> Result<QueryResult>;
}
