use std::path::PathBuf;

use thiserror::Error;

/// Failures of the filing core. Each variant maps to one stage of the
/// per-task pipeline; the engine decides which of them are fatal.
#[derive(Debug, Clone, Error)]
pub enum FilingError {
    #[error("configuration incomplete: {0}")]
    Config(String),
    #[error("ledger unavailable {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("row creation failed: {0}")]
    RowCreation(String),
    #[error("row {row} disagrees with filters: {details}")]
    ValidationMismatch { row: usize, details: String },
    #[error("path generation failed: {0}")]
    PathGeneration(String),
    #[error("back-reference write failed at row {row}, column {column}: {message}")]
    Link {
        row: usize,
        column: String,
        message: String,
    },
    #[error("file operation failed on {path}: {message}")]
    FileIo { path: PathBuf, message: String },
}

impl FilingError {
    pub fn load(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Load {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn file_io(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::FileIo {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn code(&self) -> FilingErrorCode {
        match self {
            Self::Config(_) => FilingErrorCode::Config,
            Self::Load { .. } => FilingErrorCode::Load,
            Self::RowCreation(_) => FilingErrorCode::RowCreation,
            Self::ValidationMismatch { .. } => FilingErrorCode::ValidationMismatch,
            Self::PathGeneration(_) => FilingErrorCode::PathGeneration,
            Self::Link { .. } => FilingErrorCode::Link,
            Self::FileIo { .. } => FilingErrorCode::FileIo,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilingErrorCode {
    Config,
    Load,
    RowCreation,
    ValidationMismatch,
    PathGeneration,
    Link,
    FileIo,
}

impl FilingErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "E_CONFIG",
            Self::Load => "E_LOAD",
            Self::RowCreation => "E_ROW_CREATION",
            Self::ValidationMismatch => "E_VALIDATION_MISMATCH",
            Self::PathGeneration => "E_PATH_GENERATION",
            Self::Link => "E_LINK",
            Self::FileIo => "E_FILE_IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = FilingError::Config("missing output_template".into());
        assert_eq!(err.code().as_str(), "E_CONFIG");
        let err = FilingError::file_io("/tmp/a.pdf", "denied");
        assert_eq!(err.code().as_str(), "E_FILE_IO");
        assert!(err.to_string().contains("/tmp/a.pdf"));
    }
}
