use std::{fmt, io};

use crate::error::mongo::classify;

/// Crate-wide `Result` type using [`CollectionError`] as the error.
pub type Result<T> = std::result::Result<T, CollectionError>;

/// Top-level error type for collection operations.
#[derive(Debug, Clone)]
pub enum CollectionError {
    /// Caller-supplied parameters are structurally invalid.
    InvalidArgument(String),

    /// The server rejected the command.
    Command(CommandFailure),

    /// Transport failure or connection teardown.
    Connection(ConnectionError),

    /// A server reply could not be interpreted.
    Decode(String),

    /// Configuration errors.
    Config(ConfigError),

    /// I/O errors (configuration files).
    Io(IoError),
}

/// Server-reported command failure, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Numeric server error code.
    pub code: i32,

    /// Symbolic code name when the server or a known table provides one.
    pub code_name: Option<String>,

    /// Server error message.
    pub message: String,
}

/// Connection-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The owning client was shut down or dropped.
    Closed,

    /// Timed out waiting for the server.
    Timeout,

    /// Network or server selection failure.
    Transport(String),

    /// The client was created outside a tokio runtime.
    NoRuntime,
}

/// Configuration-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },
}

/// Cloneable wrapper over `io::Error`.
///
/// Errors are delivered to callbacks and also recorded on the operation
/// handle, so every variant has to be `Clone`.
#[derive(Debug, Clone)]
pub struct IoError {
    kind: io::ErrorKind,
    message: String,
}

impl CollectionError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CollectionError::InvalidArgument(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        CollectionError::Decode(msg.into())
    }

    pub fn command(code: i32, message: impl Into<String>) -> Self {
        CollectionError::Command(CommandFailure {
            code,
            code_name: code_name(code).map(str::to_string),
            message: message.into(),
        })
    }

    pub fn closed() -> Self {
        CollectionError::Connection(ConnectionError::Closed)
    }

    /// Server error code, for `Command` errors.
    pub fn code(&self) -> Option<i32> {
        match self {
            CollectionError::Command(failure) => Some(failure.code),
            _ => None,
        }
    }

    /// True for unique index violations.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.code(), Some(11000) | Some(11001))
    }

    /// True when the failure was caused by connection teardown.
    pub fn is_closed(&self) -> bool {
        matches!(self, CollectionError::Connection(ConnectionError::Closed))
    }

    /// Short machine-readable name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CollectionError::InvalidArgument(_) => "invalid_argument",
            CollectionError::Command(_) => "command_error",
            CollectionError::Connection(_) => "connection_error",
            CollectionError::Decode(_) => "decode_error",
            CollectionError::Config(_) => "config_error",
            CollectionError::Io(_) => "io_error",
        }
    }
}

/// Human-readable name for well-known server error codes.
pub(crate) fn code_name(code: i32) -> Option<&'static str> {
    let name = match code {
        2 => "BadValue",
        11000 | 11001 => "DuplicateKey",
        13 => "Unauthorized",
        18 => "AuthenticationFailed",
        26 => "NamespaceNotFound",
        27 => "IndexNotFound",
        43 => "CursorNotFound",
        48 => "NamespaceExists",
        50 => "MaxTimeMSExpired",
        59 => "CommandNotFound",
        67 => "CannotCreateIndex",
        73 => "InvalidNamespace",
        85 => "IndexOptionsConflict",
        115 => "CommandNotSupported",
        121 => "DocumentValidationFailure",
        _ => return None,
    };
    Some(name)
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for CollectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            CollectionError::Command(e) => write!(f, "Command failed: {e}"),
            CollectionError::Connection(e) => write!(f, "Connection error: {e}"),
            CollectionError::Decode(msg) => write!(f, "Decode error: {msg}"),
            CollectionError::Config(e) => write!(f, "Configuration error: {e}"),
            CollectionError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code_name {
            Some(name) => write!(f, "{} ({name}, code {})", self.message, self.code),
            None => write!(f, "{} (code {})", self.message, self.code),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Closed => write!(f, "Connection closed"),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Transport(msg) => write!(f, "Transport failure: {msg}"),
            ConnectionError::NoRuntime => write!(f, "No tokio runtime available"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl std::error::Error for CollectionError {}
impl std::error::Error for CommandFailure {}
impl std::error::Error for ConnectionError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for IoError {}

/* ========================= Conversions to CollectionError ========================= */

impl From<io::Error> for CollectionError {
    fn from(err: io::Error) -> Self {
        CollectionError::Io(IoError {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<mongodb::error::Error> for CollectionError {
    fn from(err: mongodb::error::Error) -> Self {
        classify(&err)
    }
}

impl From<bson::de::Error> for CollectionError {
    fn from(err: bson::de::Error) -> Self {
        CollectionError::Decode(err.to_string())
    }
}

impl From<bson::ser::Error> for CollectionError {
    fn from(err: bson::ser::Error) -> Self {
        CollectionError::InvalidArgument(err.to_string())
    }
}

impl From<CommandFailure> for CollectionError {
    fn from(err: CommandFailure) -> Self {
        CollectionError::Command(err)
    }
}

impl From<ConnectionError> for CollectionError {
    fn from(err: ConnectionError) -> Self {
        CollectionError::Connection(err)
    }
}

impl From<ConfigError> for CollectionError {
    fn from(err: ConfigError) -> Self {
        CollectionError::Config(err)
    }
}
