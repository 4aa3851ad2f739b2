//! sort_classify - manual classification against the smart bin store
//!
//! Looks up, learns and lists class→bin mappings and prints the sort history,
//! using the same database the daemon writes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use smart_bin::config::SmartBinConfig;
use smart_bin::prompt::ConsolePrompt;
use smart_bin::storage::shared;
use smart_bin::{
    BinColor, ClassificationResolver, EntrySource, PutOutcome, SortError,
    SqliteClassificationStore,
};

#[derive(Parser, Debug)]
#[command(name = "sort_classify", about = "Classify items and inspect the smart bin store")]
struct Args {
    /// Path to the classification database (defaults to the configured db_path)
    #[arg(long, value_name = "PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up the bin for an item, asking on the terminal if it is unknown
    Classify {
        item_name: String,
        /// Never prompt; report unknown items instead
        #[arg(long)]
        no_prompt: bool,
    },
    /// Store a mapping for an item
    Learn { item_name: String, bin_color: BinColor },
    /// List static and learned mappings
    List,
    /// Show recent sort events, newest first
    History {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Show per-bin counts
    Status,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let cfg = SmartBinConfig::load()?;
    let db_path = args.db.unwrap_or(cfg.db_path);

    let store = SqliteClassificationStore::open(&db_path)
        .with_context(|| format!("open classification store {}", db_path))?;
    let resolver = ClassificationResolver::new(shared(store), Arc::new(ConsolePrompt::stdio()));

    match args.command {
        Command::Classify {
            item_name,
            no_prompt,
        } => match resolver.resolve(&smart_bin::validate_class_name(&item_name)?, !no_prompt)? {
            Some(bin) => println!("{} -> {}", item_name, bin),
            None => {
                let err = SortError::UnknownClassification(smart_bin::normalize_class_name(&item_name));
                println!("{}", err);
                std::process::exit(1);
            }
        },
        Command::Learn {
            item_name,
            bin_color,
        } => match resolver.learn(&item_name, bin_color)? {
            PutOutcome::Inserted => println!("learned {} -> {}", item_name, bin_color),
            PutOutcome::Unchanged => println!("{} already maps to {}", item_name, bin_color),
            PutOutcome::Conflict(existing) => {
                println!("{} already maps to {}; unchanged", item_name, existing)
            }
        },
        Command::List => {
            for entry in resolver.entries()? {
                let source = match entry.source {
                    EntrySource::Static => "static",
                    EntrySource::Learned => "learned",
                };
                println!("{:<24} {:<7} {}", entry.class_name, entry.bin_color, source);
            }
        }
        Command::History { limit } => {
            let store = resolver.store().lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
            for event in store.recent_sort_events(limit)? {
                println!(
                    "{}  {:<24} {}",
                    event.timestamp.to_rfc3339(),
                    event.class_name,
                    event.bin_color
                );
            }
        }
        Command::Status => {
            let store = resolver.store().lock().map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
            for status in store.bin_status()? {
                let last = status
                    .last_sorted_at
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<7} {:>6}  last={}", status.bin_color, status.sorted_count, last);
            }
        }
    }
    Ok(())
}
