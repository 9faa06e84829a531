//! Inventory outbox daemon: dispatches committed domain events to the broker.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use inventory_config_and_utils::{init_logging, Config, Paths};

/// Inventory outbox command-line interface.
#[derive(Parser)]
#[command(name = "inventory-outboxd")]
#[command(about = "Transactional outbox dispatcher for the inventory service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for config, database and logs. Defaults to ~/.inventory-outbox
    #[arg(long, global = true, env = "INVENTORY_HOME")]
    base_dir: Option<PathBuf>,

    /// Use the in-process broker: events are confirmed locally and never leave the process
    #[arg(long, global = true)]
    demo: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher until interrupted
    Run,
    /// Print outbox counts per state
    Status,
    /// Insert a demo category with products and images
    Seed {
        /// Number of products to create
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
    /// Delete a product and deliver its product-deleted event
    DeleteProduct {
        /// Product ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    let mut config = Config::load(&paths)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    init_logging(&config.log_level, &paths.log_file())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => app::run_outbox(&config, &paths, cli.demo).await?,
        Commands::Status => app::print_status(&paths).await?,
        Commands::Seed { count } => app::seed_catalog(&paths, count).await?,
        Commands::DeleteProduct { id } => app::delete_product(&config, &paths, id, cli.demo).await?,
    }

    Ok(())
}
