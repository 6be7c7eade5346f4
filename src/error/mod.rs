//! Error handling for collection operations.
//!
//! Every failure a caller can observe is one of four kinds:
//! - `InvalidArgument`: rejected before anything touches the network
//! - `Command`: the server refused the command (verbatim code and message)
//! - `Connection`: transport failure or connection teardown
//! - `Decode`: a reply that could not be interpreted
//!
//! Driver errors are classified into that taxonomy by [`mongo::classify`].
//!
//! # Example
//!
//! ```rust
//! use mongo_collection::error::{CollectionError, ErrorInfo};
//!
//! let err = CollectionError::invalid_argument("index key pattern is empty");
//! let info = ErrorInfo::from_error(&err);
//! assert_eq!(info.error_type.as_deref(), Some("invalid_argument"));
//! ```

pub mod kinds;
pub mod mongo;

pub use kinds::{CollectionError, CommandFailure, ConfigError, ConnectionError, Result};
pub use mongo::ErrorInfo;
