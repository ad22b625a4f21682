use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration errors (missing handler, bad settings)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Queue backend errors
    #[error("Queue error: {0}")]
    Queue(String),

    /// Stream backend errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Handler execution errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// Timeout errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection errors (Redis unreachable, dropped links)
    #[error("Connection error: {0}")]
    Connection(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get error code string (used for logs and metric labels)
    pub fn error_code(&self) -> &str {
        match self {
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Queue(_) => "QUEUE_ERROR",
            AppError::Stream(_) => "STREAM_ERROR",
            AppError::Handler(_) => "HANDLER_ERROR",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Connection(_) => "CONNECTION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error came from a timeout race rather than a thrown error
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Conversion from redis::RedisError
impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() {
            AppError::Connection(err.to_string())
        } else {
            AppError::Queue(err.to_string())
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::Configuration("test".to_string()).error_code(),
            "CONFIGURATION_ERROR"
        );
        assert_eq!(
            AppError::Timeout("test".to_string()).error_code(),
            "TIMEOUT"
        );
        assert_eq!(
            AppError::Handler("test".to_string()).error_code(),
            "HANDLER_ERROR"
        );
    }

    #[test]
    fn test_timeout_detection() {
        assert!(AppError::Timeout("hung".to_string()).is_timeout());
        assert!(!AppError::Handler("threw".to_string()).is_timeout());
    }

    #[test]
    fn test_serde_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.error_code(), "SERIALIZATION_ERROR");
    }
}
