#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("invalid apns signing key: {message}")]
    InvalidKey { message: String },
    #[error("failed to sign apns provider token: {message}")]
    Signing { message: String },
    #[error("failed to encode apns payload: {source}")]
    Encode {
        #[from]
        source: serde_json::Error,
    },
    #[error("apns transport error: {message}")]
    Transport { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("unknown push environment '{value}' in token store")]
    Environment { value: String },
    #[error("failed to create token store directory {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token store lock poisoned")]
    Poisoned,
    #[error("token store task failed: {message}")]
    Task { message: String },
}

#[cfg(test)]
mod tests {
    use super::{PushError, StoreError};

    #[test]
    fn transport_error_formats_message() {
        let err = PushError::Transport {
            message: "connection reset".to_string(),
        };
        assert_eq!(err.to_string(), "apns transport error: connection reset");
    }

    #[test]
    fn json_errors_convert_into_encode() {
        fn decode(text: &str) -> Result<serde_json::Value, PushError> {
            Ok(serde_json::from_str(text)?)
        }
        let err = decode("{").expect_err("truncated json");
        assert!(matches!(err, PushError::Encode { .. }));
        assert!(err.to_string().starts_with("failed to encode apns payload: "));
    }

    #[test]
    fn store_task_error_formats_message() {
        let err = StoreError::Task {
            message: "task panicked".to_string(),
        };
        assert_eq!(err.to_string(), "token store task failed: task panicked");
    }

    #[test]
    fn invalid_key_error_formats_message() {
        let err = PushError::InvalidKey {
            message: "not a pkcs8 document".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid apns signing key: not a pkcs8 document"
        );
    }
}
