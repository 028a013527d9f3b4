use thiserror::Error;

/// A scenario field that failed validation, named by its JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid scenario field `{field}`: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StressError {
    #[error("unknown stress scenario `{0}`")]
    UnknownScenario(String),
    #[error("invalid stress catalog: {0}")]
    Catalog(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
