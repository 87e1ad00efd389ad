use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use otd_storage::OrderStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "otd-cli")]
#[command(about = "Order transit dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the dashboard server (the default).
    Serve,
    /// Load demo orders from a YAML file into the snapshot.
    Seed {
        #[arg(long)]
        file: PathBuf,
    },
    /// Write a checksummed snapshot copy into a directory.
    Backup {
        #[arg(long)]
        dest: PathBuf,
    },
    /// Empty every table: orders, warehouse, delivered, archive.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

async fn open_store() -> OrderStore {
    let config = otd_web::ServerConfig::from_env();
    OrderStore::load_or_default(config.data_dir).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            otd_web::serve_from_env().await?;
        }
        Commands::Seed { file } => {
            let store = open_store().await;
            let inserted = store.seed_from_yaml(&file).await?;
            println!("seed complete: file={} inserted={}", file.display(), inserted);
        }
        Commands::Backup { dest } => {
            let store = open_store().await;
            let manifest = store.backup_to(&dest).await?;
            println!(
                "backup complete: file={} orders={} bytes={} sha256={}",
                manifest.file, manifest.orders, manifest.bytes, manifest.sha256
            );
        }
        Commands::Purge { yes } => {
            if !yes {
                eprintln!("purge empties every table; re-run with --yes to confirm");
                std::process::exit(2);
            }
            let store = open_store().await;
            let report = store.purge().await?;
            println!(
                "purge complete: orders={} warehouse={} delivered={} archived={}",
                report.orders, report.warehouse, report.delivered, report.archived
            );
        }
    }

    Ok(())
}
