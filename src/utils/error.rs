use thiserror::Error;

#[derive(Error, Debug)]
pub enum SendoutError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error in {field}: {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for {field}: {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error on {field}: {message}")]
    ValidationError { field: String, message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Cannot move sendout from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Sendout is {status} and cannot be {action}")]
    NotActionable {
        status: String,
        action: &'static str,
    },

    #[error("Store error: {message}")]
    StoreError { message: String },

    #[error("Mail transport unavailable: {message}")]
    TransportUnavailable { message: String },
}

impl SendoutError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        SendoutError::ValidationError {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SendoutError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Invocation-level failures the batch loop may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SendoutError::HttpError(_)
                | SendoutError::IoError(_)
                | SendoutError::StoreError { .. }
                | SendoutError::TransportUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SendoutError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let unavailable = SendoutError::TransportUnavailable {
            message: "connection refused".to_string(),
        };
        assert!(unavailable.is_retryable());

        let invalid = SendoutError::validation("subject", "required");
        assert!(!invalid.is_retryable());
        assert_eq!(invalid.to_string(), "Validation error on subject: required");
    }
}
