use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanSageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Workflow history error: {0}")]
    WorkflowHistory(String),

    #[error("Dependency graph error: {0}")]
    DependencyGraph(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for ScanSageError {
    fn from(err: rusqlite::Error) -> Self {
        ScanSageError::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanSageError>;
