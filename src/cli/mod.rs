//! Command-line interface
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and argument overrides
//! - Running one collection operation and printing its result
//!
//! Results are printed as relaxed extended JSON, one document per line.

use clap::{Parser, Subcommand};
use mongodb::bson::{Bson, Document};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use tracing::debug;

use crate::collection::{Client, Collection};
use crate::config::Config;
use crate::error::{CollectionError, Result};
use crate::operation::Query;
use crate::read_preference::{ReadMode, ReadPreference};

/// Extract database name from MongoDB connection URI
///
/// # Arguments
/// * `uri` - MongoDB connection URI
///
/// # Returns
/// * `Option<String>` - Database name if found in URI
fn extract_database_from_uri(uri: &str) -> Option<String> {
    // Format: mongodb://[username:password@]host[:port][/database][?options]
    let after_scheme = uri.split("://").nth(1)?;
    let path = after_scheme.split('/').nth(1)?;
    let name = path.split('?').next().unwrap_or("");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Run single collection operations against MongoDB
#[derive(Parser, Debug)]
#[command(
    name = "mongo-collection",
    version,
    about = "Run collection operations against MongoDB"
)]
pub struct CliArgs {
    /// MongoDB connection URI
    ///
    /// Format: mongodb://[username:password@]host[:port][/database][?options]
    #[arg(long, value_name = "URI")]
    pub uri: Option<String>,

    /// Database name (defaults to the URI path, then "test")
    #[arg(long, value_name = "NAME")]
    pub database: Option<String>,

    /// Collection name
    #[arg(long, value_name = "NAME")]
    pub collection: String,

    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Read preference mode (primary, primaryPreferred, secondary, secondaryPreferred, nearest)
    #[arg(long, value_name = "MODE")]
    pub read_preference: Option<String>,

    /// Connection timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv")]
    pub very_verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Count documents matching a filter
    Count {
        /// Filter as (extended) JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,
    },

    /// Print documents matching a filter
    Find {
        /// Filter as (extended) JSON
        #[arg(long, value_name = "JSON")]
        filter: Option<String>,

        /// Sort specification as JSON, e.g. '{"qty": -1}'
        #[arg(long, value_name = "JSON")]
        sort: Option<String>,

        /// Fields to return
        #[arg(long, value_name = "FIELD", value_delimiter = ',')]
        fields: Vec<String>,

        /// Maximum number of documents (0 = no limit)
        #[arg(long, default_value_t = 0)]
        limit: i64,

        /// Number of documents to skip
        #[arg(long, default_value_t = 0)]
        skip: i64,

        /// Documents per batch
        #[arg(long, value_name = "N")]
        batch_size: Option<u32>,
    },

    /// Print collection statistics
    Stats,

    /// List indexes
    Indexes,
}

/// CLI interface handler
pub struct CliInterface {
    args: CliArgs,
    config: Config,
}

impl CliInterface {
    /// Parse arguments and load configuration.
    pub fn new() -> Result<Self> {
        let args = CliArgs::parse();
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    /// Build from already parsed arguments.
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Self::load_config(&args)?;
        Ok(Self { args, config })
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.args.config_file.as_deref()
    }

    /// Load configuration from file and apply argument overrides
    fn load_config(args: &CliArgs) -> Result<Config> {
        let mut config = Config::load_from_file(args.config_file.as_deref())?;
        Self::apply_args_to_config(&mut config, args)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_args_to_config(config: &mut Config, args: &CliArgs) -> Result<()> {
        if let Some(uri) = &args.uri {
            config.connection.uri = uri.clone();
        }
        if let Some(timeout) = args.timeout {
            config.connection.timeout = timeout;
        }
        if let Some(mode) = &args.read_preference {
            config.read_preference = Some(ReadPreference::new(parse_read_mode(mode)?));
        }
        Ok(())
    }

    /// Database from `--database`, the URI path, or `test`.
    pub fn database_name(&self) -> String {
        self.args
            .database
            .clone()
            .or_else(|| extract_database_from_uri(&self.config.connection.uri))
            .unwrap_or_else(|| "test".to_string())
    }

    /// Connect, run the selected subcommand and shut the client down.
    pub async fn execute(&self) -> Result<()> {
        let client = Client::connect(self.config.clone()).await?;
        let collection = client
            .database(&self.database_name())?
            .collection(&self.args.collection)?;
        debug!("Running {:?} on '{}'", self.args.command, collection.absolute_name());

        let result = self.run_command(&collection).await;
        client.shutdown().await;
        result
    }

    async fn run_command(&self, collection: &Collection) -> Result<()> {
        match &self.args.command {
            Commands::Count { filter } => {
                let criteria = parse_document(filter.as_deref())?;
                let (callback, rx) = channel();
                collection.count(criteria, None, callback)?;
                println!("{}", receive(rx).await?);
            }
            Commands::Find {
                filter,
                sort,
                fields,
                limit,
                skip,
                batch_size,
            } => {
                let criteria = parse_document(filter.as_deref())?;
                let sort = parse_document(sort.as_deref())?;
                let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                let mut cursor = collection.cursor(criteria, &fields, *skip, *limit, sort)?;
                if let Some(size) = batch_size {
                    cursor.set_batch_size(*size);
                }
                while let Some(document) = cursor.next().await? {
                    print_document(document)?;
                }
            }
            Commands::Stats => {
                let (callback, rx) = channel();
                collection.stats(callback)?;
                print_document(receive(rx).await?)?;
            }
            Commands::Indexes => {
                let (callback, rx) = channel();
                collection.index_list(callback)?;
                for index in receive(rx).await? {
                    print_document(index)?;
                }
            }
        }
        Ok(())
    }
}

/// Callback forwarding an operation result to a channel.
fn channel<T: Send + 'static>() -> (
    impl FnOnce(Result<T>, &Query) + Send + 'static,
    oneshot::Receiver<Result<T>>,
) {
    let (tx, rx) = oneshot::channel();
    let callback = move |result: Result<T>, _: &Query| {
        let _ = tx.send(result);
    };
    (callback, rx)
}

async fn receive<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.unwrap_or_else(|_| Err(CollectionError::closed()))
}

/// Parse an optional JSON argument into a document.
///
/// Extended JSON wrappers such as `{"$oid": ...}` are understood.
pub fn parse_document(json: Option<&str>) -> Result<Document> {
    let Some(json) = json else {
        return Ok(Document::new());
    };
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| CollectionError::invalid_argument(format!("invalid JSON: {e}")))?;
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(CollectionError::invalid_argument(format!(
            "expected a JSON object, got {other}"
        ))),
        Err(e) => Err(CollectionError::invalid_argument(format!(
            "invalid extended JSON: {e}"
        ))),
    }
}

pub fn parse_read_mode(mode: &str) -> Result<ReadMode> {
    match mode {
        "primary" => Ok(ReadMode::Primary),
        "primaryPreferred" => Ok(ReadMode::PrimaryPreferred),
        "secondary" => Ok(ReadMode::Secondary),
        "secondaryPreferred" => Ok(ReadMode::SecondaryPreferred),
        "nearest" => Ok(ReadMode::Nearest),
        other => Err(CollectionError::invalid_argument(format!(
            "unknown read preference mode '{other}'"
        ))),
    }
}

fn print_document(document: Document) -> Result<()> {
    let json = Bson::Document(document).into_relaxed_extjson();
    let line = serde_json::to_string(&json)
        .map_err(|e| CollectionError::decode(format!("cannot render document: {e}")))?;
    println!("{line}");
    Ok(())
}
