//! memlock admin CLI
//!
//! Small operational tool for inspecting and tuning a memlock store
//! directly, without going through the MCP server.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use memlock_core::{Settings, Storage};

#[derive(Parser)]
#[command(name = "memlock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Admin CLI for the memlock governed memory store")]
struct Cli {
    /// Path to the SQLite store. Defaults to the platform data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON file of settings defaults, overlaid by DB overrides.
    #[arg(long, global = true)]
    settings_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show memory counts by lifecycle state
    Stats,

    /// Set (or overwrite) a settings override
    SetOverride {
        /// Settings key, e.g. `memory_extraction_threshold` or `allowed_subjects`
        key: String,
        /// Value to store (for `allowed_subjects`, a JSON array string)
        value: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(cli.data_dir)?;

    match cli.command {
        Commands::Stats => run_stats(&storage),
        Commands::SetOverride { key, value } => run_set_override(&storage, &key, &value, cli.settings_file),
    }
}

fn run_stats(storage: &Storage) -> anyhow::Result<()> {
    let stats = storage.stats()?;

    println!("{}", "=== memlock store statistics ===".cyan().bold());
    println!();
    println!("{}: {}", "Total memories".white().bold(), stats.total_memories);
    println!("{}: {}", "Distinct users".white().bold(), stats.distinct_users);
    println!();
    println!("{}", "By lifecycle state:".white().bold());

    let mut states: Vec<_> = stats.by_state.into_iter().collect();
    states.sort_by(|a, b| a.0.cmp(&b.0));
    for (state, count) in states {
        println!("  {:<12} {}", state.green(), count);
    }

    Ok(())
}

fn run_set_override(
    storage: &Storage,
    key: &str,
    value: &str,
    settings_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    storage.set_setting_override(key, value)?;
    let settings = Settings::load(settings_file.as_deref(), storage)?;

    println!("{} {} = {}", "Set override:".green().bold(), key, value);
    match key {
        "memory_extraction_threshold" => {
            println!("Effective threshold is now {}", settings.memory_extraction_threshold());
        }
        "allowed_subjects" => {
            println!("Effective allowed subjects are now {:?}", settings.allowed_subjects());
        }
        _ => {
            println!("{}", "Note: unrecognized key; stored but not consumed by the policy engine.".yellow());
        }
    }

    Ok(())
}
