//! MongoDB collection operations
//!
//! A collection-level client: typed builders for the canonical command
//! documents, asynchronous operations with exactly-once completion callbacks,
//! lazy cursors with bounded batch prefetch, and read-preference routing.
//!
//! # Modules
//!
//! - `command`: Command document builders
//! - `read_preference`: Read preference values and resolution
//! - `operation`: Query handles and operation dispatch
//! - `cursor`: Lazy cursors
//! - `collection`: Client, database and collection handles
//! - `connection`: The driver boundary and its implementations
//! - `config`: Configuration management
//! - `error`: Error types and handling
//! - `cli`: Command-line interface
//!
//! # Example
//!
//! ```no_run
//! use mongo_collection::{Client, Config};
//! use mongo_collection::bson::doc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::connect(Config::default()).await?;
//!     let orders = client.database("shop")?.collection("orders")?;
//!
//!     let query = orders.count(doc! { "status": "active" }, None, |result, query| {
//!         println!("{} -> {:?}", query.operation(), result);
//!     })?;
//!     query.wait().await;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod collection;
pub mod command;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod operation;
pub mod read_preference;

pub use mongodb::bson;

// Re-export commonly used types
pub use collection::{AggregateOutput, Client, Collection, Database, WriteReply};
pub use command::{
    AggregateFlags, FindParams, IndexOptions, IndexSpec, MapReduceParams, Namespace, UpdateParams,
};
pub use config::Config;
pub use connection::{Connection, MemoryConnection, MongoConnection};
pub use cursor::Cursor;
pub use error::{CollectionError, Result};
pub use operation::{Query, QueryStatus};
pub use read_preference::{ReadMode, ReadPreference};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
