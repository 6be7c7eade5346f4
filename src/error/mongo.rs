use serde::{Deserialize, Serialize};

use crate::error::kinds::{code_name, CollectionError, CommandFailure, ConnectionError};

/// Structured error information, serialisable for logs and APIs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ErrorInfo {
    /// Extract structured information from a collection error.
    pub fn from_error(error: &CollectionError) -> Self {
        let mut info = ErrorInfo {
            error_type: Some(error.kind_name().to_string()),
            ..Default::default()
        };

        match error {
            CollectionError::Command(failure) => {
                info.code = Some(failure.code);
                info.name = failure.code_name.clone();
                info.message = Some(failure.message.clone());
            }
            CollectionError::InvalidArgument(msg) | CollectionError::Decode(msg) => {
                info.message = Some(msg.clone());
            }
            CollectionError::Connection(e) => info.message = Some(e.to_string()),
            CollectionError::Config(e) => info.message = Some(e.to_string()),
            CollectionError::Io(e) => info.message = Some(e.to_string()),
        }

        info
    }

    /// Convert error info to pretty-printed JSON string.
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Convert error info to compact JSON string (single line).
    pub fn to_json_compact(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Classify a MongoDB driver error into the collection error taxonomy.
///
/// Typed driver structures are used directly; the `Display` output is only a
/// fallback for kinds that expose nothing structured.
pub fn classify(error: &mongodb::error::Error) -> CollectionError {
    use mongodb::error::{ErrorKind, WriteFailure};

    match error.kind.as_ref() {
        ErrorKind::Command(command_error) => CollectionError::Command(CommandFailure {
            code: command_error.code,
            code_name: if command_error.code_name.is_empty() {
                code_name(command_error.code).map(str::to_string)
            } else {
                Some(command_error.code_name.clone())
            },
            message: command_error.message.clone(),
        }),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            CollectionError::command(write_error.code, write_error.message.clone())
        }
        ErrorKind::Write(WriteFailure::WriteConcernError(wc_error)) => {
            CollectionError::command(wc_error.code, wc_error.message.clone())
        }
        ErrorKind::InsertMany(insert_error) => {
            if let Some(first) = insert_error.write_errors.as_ref().and_then(|e| e.first()) {
                CollectionError::command(first.code, first.message.clone())
            } else if let Some(wc_error) = &insert_error.write_concern_error {
                CollectionError::command(wc_error.code, wc_error.message.clone())
            } else {
                CollectionError::command(-1, error.to_string())
            }
        }
        ErrorKind::InvalidArgument { message, .. } => {
            CollectionError::InvalidArgument(message.clone())
        }
        ErrorKind::BsonDeserialization(e) => CollectionError::Decode(e.to_string()),
        ErrorKind::BsonSerialization(e) => CollectionError::InvalidArgument(e.to_string()),
        ErrorKind::InvalidResponse { message, .. } => CollectionError::Decode(message.clone()),
        ErrorKind::Io(io_error) if io_error.kind() == std::io::ErrorKind::TimedOut => {
            CollectionError::Connection(ConnectionError::Timeout)
        }
        ErrorKind::Io(io_error) => {
            CollectionError::Connection(ConnectionError::Transport(io_error.to_string()))
        }
        ErrorKind::ServerSelection { message, .. }
        | ErrorKind::ConnectionPoolCleared { message, .. }
        | ErrorKind::DnsResolve { message, .. } => {
            CollectionError::Connection(ConnectionError::Transport(message.clone()))
        }
        _ => CollectionError::Connection(ConnectionError::Transport(error.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_for_command_failure() {
        let err = CollectionError::command(11000, "E11000 duplicate key error");
        let info = ErrorInfo::from_error(&err);
        assert_eq!(info.error_type.as_deref(), Some("command_error"));
        assert_eq!(info.code, Some(11000));
        assert_eq!(info.name.as_deref(), Some("DuplicateKey"));

        let json = info.to_json_compact().unwrap();
        assert!(json.contains("\"type\":\"command_error\""));
        assert!(json.contains("\"code\":11000"));
    }

    #[test]
    fn test_error_info_skips_empty_fields() {
        let err = CollectionError::invalid_argument("empty key pattern");
        let json = ErrorInfo::from_error(&err).to_json_compact().unwrap();
        assert!(!json.contains("code"));
        assert!(json.contains("empty key pattern"));
    }
}
