//! durablemap CLI
//!
//! Command-line access to string maps stored under a data directory.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};
use durablemap::{Config, DurableMap, Result, StorageFactory, SyncStrategy, Utf8Descriptor};
use tracing_subscriber::{fmt, EnvFilter};

/// durablemap CLI
#[derive(Parser, Debug)]
#[command(name = "durablemap-cli")]
#[command(about = "Inspect and edit a crash-resilient string map")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./durablemap_data")]
    dir: String,

    /// Map name inside the data directory
    #[arg(short, long, default_value = "default")]
    name: String,

    /// Index segment size in bytes
    #[arg(long, default_value = "32768")]
    segment_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Set a key-value pair
    Put {
        key: String,
        value: String,
    },

    /// Get a value by key
    Get {
        key: String,
    },

    /// Remove a key
    Remove {
        key: String,
    },

    /// Print every live entry in log order
    List,

    /// Rewrite the log keeping only live entries
    Compact,

    /// Print entry count, log size and index shape
    Stats,

    /// Rebuild the index from the log
    Rebuild,
}

type StringMap = DurableMap<Utf8Descriptor, Utf8Descriptor>;

fn main() -> ExitCode {
    // Logs go to stderr so command output stays parseable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,durablemap=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Command failed: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.dir)
        .index_segment_size(args.segment_size)
        .sync_strategy(SyncStrategy::EveryWrite)
        .build();
    let factory = StorageFactory::new(config)?;
    let map: StringMap = factory.open_map(&args.name, Utf8Descriptor, Utf8Descriptor)?;

    let report = map.open_report();
    if !report.was_clean() {
        tracing::warn!(index_action = ?report.index_action, "Map needed recovery on open");
    }

    let map = execute(map, args.command)?;
    map.close()
}

/// Run one command; returns the map to close (compaction replaces it)
fn execute(map: StringMap, command: Commands) -> Result<StringMap> {
    match command {
        Commands::Put { key, value } => {
            map.put(&key, &value)?;
            println!("OK");
        }
        Commands::Get { key } => match map.get(&key)? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Commands::Remove { key } => {
            let removed = map.remove(&key)?;
            println!("{}", if removed { "1" } else { "0" });
        }
        Commands::List => {
            map.for_each_entry(|key, value| {
                println!("{}\t{}", key, value);
                Ok(true)
            })?;
        }
        Commands::Compact => {
            let before = map.log_size();
            let map = map.compact()?;
            println!("log bytes: {} -> {}", before, map.log_size());
            return Ok(map);
        }
        Commands::Stats => {
            let stats = map.index_stats();
            println!("entries:          {}", map.len());
            println!("log bytes:        {}", map.log_size());
            println!("global depth:     {}", stats.global_depth);
            println!("directory size:   {}", stats.directory_size);
            println!("segments:         {}", stats.segments);
            println!("max probe length: {}", stats.max_probe_length);
        }
        Commands::Rebuild => {
            let report = map.rebuild_index(&AtomicBool::new(false))?;
            println!(
                "scanned {} chunks, indexed {} entries",
                report.chunks_scanned, report.entries_indexed
            );
        }
    }
    Ok(map)
}
