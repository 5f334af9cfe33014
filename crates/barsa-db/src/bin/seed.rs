//! # Store Initialiser
//!
//! Creates (or opens) a store file, seeds the default administrator and
//! business configuration, prints a summary, and optionally writes a
//! backup.
//!
//! ## Usage
//! ```bash
//! # Initialise ./barsa_dev.db
//! cargo run -p barsa-db --bin seed
//!
//! # Specify database path and export a backup
//! cargo run -p barsa-db --bin seed -- --db ./data/barsa.db --export backup.json
//!
//! # Wipe and re-seed
//! cargo run -p barsa-db --bin seed -- --reset
//! ```

use std::env;

use barsa_core::Collection;
use barsa_db::{DbConfig, LocalStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./barsa_dev.db");
    let mut export_path: Option<String> = None;
    let mut reset = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--export" | "-e" => {
                if i + 1 < args.len() {
                    export_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--reset" => reset = true,
            "--help" | "-h" => {
                println!("Barsa Store Initialiser");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>       Database file path (default: ./barsa_dev.db)");
                println!("  -e, --export <PATH>   Write a backup of every collection to PATH");
                println!("      --reset           Clear every collection and re-seed defaults");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {}", other),
        }
        i += 1;
    }

    println!("Barsa Store Initialiser");
    println!("=======================");
    println!("Database: {}", db_path);
    println!();

    let store = LocalStore::open(DbConfig::new(&db_path)).await?;
    println!("✓ Store opened, migrations applied, defaults seeded");

    if reset {
        store.reset().await?;
        println!("✓ Store reset");
    }

    println!();
    for collection in Collection::ALL {
        let count = store.get(collection).await?.len();
        println!("  {:<8} {} records", collection, count);
    }

    let pending = store.database().dead_letters().count_pending().await?;
    println!("  {:<8} {} pending", "dead", pending);

    if let Some(path) = export_path {
        let backup = store.export_backup().await?;
        std::fs::write(&path, backup.to_json_pretty()?)?;
        println!();
        println!("✓ Backup written to {}", path);
    }

    store.database().close().await;
    Ok(())
}
