use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid input: {field} - {reason}")]
    InputValidation { field: String, reason: String },

    #[error("unknown account type in withdrawal order: {0}")]
    UnknownAccount(String),

    #[error("unknown province: {0}")]
    UnknownProvince(String),

    #[error("no benefit tables available for year {0}")]
    MissingTables(i32),

    #[error("could not load benefit tables: {0}")]
    TableLoad(String),

    #[error("scenario worker panicked")]
    WorkerPanic,
}

impl EngineError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        EngineError::InputValidation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::TableLoad(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
