use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing column '{column}' in {file}")]
    MissingColumn { column: String, file: String },

    #[error("Failed to parse {what}: {detail}")]
    Parse { what: String, detail: String },

    #[error("No samples left after {stage}")]
    EmptyJoin { stage: &'static str },

    #[error("Expression columns and response records diverge after {stage} at position {position}")]
    AlignmentMismatch { stage: &'static str, position: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Degenerate design for {metric}: {reason}")]
    DegenerateDesign { metric: String, reason: String },

    #[error("Normalization failed: {0}")]
    Normalization(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }
}
