use thiserror::Error;

pub type Result<T> = std::result::Result<T, TilegridError>;

#[derive(Debug, Error)]
pub enum TilegridError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("filter error: {0}")]
    Filter(String),
    #[error("invalid time dimension:\n{}", .0.join("\n"))]
    TimeDimension(Vec<String>),
    #[error("sql generation error: {0}")]
    Sql(String),
    /// Validation error scoped to a single MapConfig layer.
    #[error("{message}")]
    Layer {
        message: String,
        id: Option<String>,
        index: usize,
        layer_type: String,
    },
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
