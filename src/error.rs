use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable failure class reported across the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    CalculationError,
    InsufficientData,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::CalculationError => "CALCULATION_ERROR",
            ErrorKind::InsufficientData => "INSUFFICIENT_DATA",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Calculation(String),
    #[error("{0}")]
    InsufficientData(String),
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),
}

impl EngineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn calculation<S: Into<String>>(message: S) -> Self {
        EngineError::Calculation(message.into())
    }

    pub fn insufficient_data<S: Into<String>>(message: S) -> Self {
        EngineError::InsufficientData(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::UnknownStrategy(_) => {
                ErrorKind::ValidationError
            }
            EngineError::Calculation(_) => ErrorKind::CalculationError,
            EngineError::InsufficientData(_) => ErrorKind::InsufficientData,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_a_validation_failure() {
        let err = EngineError::UnknownStrategy("nope".to_string());
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert_eq!(err.to_string(), "Unknown strategy: nope");
    }

    #[test]
    fn kinds_serialize_as_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientData).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_DATA\"");
        assert_eq!(
            EngineError::calculation("boom").kind().as_str(),
            "CALCULATION_ERROR"
        );
    }
}
