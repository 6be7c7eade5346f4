//! mongo-collection command-line tool
//!
//! Runs one collection operation and prints the result as relaxed extended
//! JSON.
//!
//! # Usage
//!
//! ```bash
//! mongo-collection --uri mongodb://localhost:27017/shop --collection orders \
//!     count --filter '{"status": "active"}'
//! ```

use tracing::Level;

use mongo_collection::cli::CliInterface;
use mongo_collection::error::Result;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Parse arguments, load configuration, initialize logging and run the
/// selected subcommand.
async fn run() -> Result<()> {
    let cli = CliInterface::new()?;
    initialize_logging(&cli);
    cli.execute().await
}

/// Initialize logging system based on verbosity level
///
/// Logs go to stderr so stdout carries only results.
///
/// # Arguments
/// * `cli` - CLI interface with verbosity settings
fn initialize_logging(cli: &CliInterface) {
    let level = if cli.args().very_verbose {
        Level::TRACE
    } else if cli.args().verbose {
        Level::DEBUG
    } else {
        cli.config().logging.level.to_tracing_level()
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    if cli.config().logging.timestamps {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}
