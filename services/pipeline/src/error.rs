use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the pipeline stages.
///
/// Per-file failures (`Resolution`, `EmptyLoad`, `Workbook`) are recoverable:
/// the runner records them and moves on to the next source. `NoFeatureColumns`
/// and `EmptyInput` abort the stage that raised them.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot resolve data sheet in '{path}': {reason}")]
    Resolution { path: PathBuf, reason: String },
    #[error("'{path}' yielded no usable rows below header row {header_row}")]
    EmptyLoad { path: PathBuf, header_row: usize },
    #[error("cannot read workbook '{path}': {reason}")]
    Workbook { path: PathBuf, reason: String },
    #[error("no numeric feature columns besides identifier column '{0}'")]
    NoFeatureColumns(String),
    #[error("feature column '{column}' has {got} values, expected {expected}")]
    ShapeMismatch {
        column: String,
        expected: usize,
        got: usize,
    },
    #[error("column '{0}' not found")]
    MissingColumn(String),
    #[error("empty input to {0}")]
    EmptyInput(&'static str),
    #[error("no source files could be loaded from '{0}'")]
    NoSourcesLoaded(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Taxonomy label used in the run report.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Resolution { .. }
            | PipelineError::EmptyLoad { .. }
            | PipelineError::Workbook { .. } => "resolution_failure",
            PipelineError::NoFeatureColumns(_)
            | PipelineError::ShapeMismatch { .. }
            | PipelineError::MissingColumn(_)
            | PipelineError::EmptyInput(_)
            | PipelineError::NoSourcesLoaded(_) => "computation_failure",
            PipelineError::Io(_) | PipelineError::Csv(_) | PipelineError::Json(_) => "io_failure",
        }
    }

    /// True when the runner may skip the offending file and continue.
    pub fn is_per_file(&self) -> bool {
        self.category() == "resolution_failure"
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
