use clap::{Parser, Subcommand};
use log::{error, info};
use raftoral_state::db::open_state_db;
use raftoral_state::logging;
use raftoral_state::state::TimerInstanceState;
use raftoral_state::{ColumnFamily, StateConfig, TimerInstance};
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "raftoral-state")]
#[command(about = "Inspect the persisted workflow state of a Raftoral partition", long_about = None)]
struct Args {
    /// RocksDB directory of the partition
    #[arg(short, long)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of entries in every column family as JSON
    Stats,

    /// List timers due at or before a timestamp
    DueTimers {
        /// Epoch milliseconds
        #[arg(short, long)]
        before: i64,

        /// Stop after this many timers
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let config = StateConfig::persistent(&args.db).with_create_if_missing(false);
    let db = match open_state_db(&config) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open {}: {}", args.db.display(), e);
            return Err(e.into());
        }
    };
    info!("Opened state at {}", args.db.display());

    match args.command {
        Command::Stats => {
            let mut counts = serde_json::Map::new();
            for cf in ColumnFamily::ALL {
                counts.insert(cf.name().to_string(), json!(db.count(cf)?));
            }
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::DueTimers { before, limit } => {
            let timers = TimerInstanceState::new(db, logging::terminal_logger());
            let (due, next_due_date) = collect_due_timers(&timers, before, limit.unwrap_or(usize::MAX))?;

            info!("Found {} due timers", due.len());
            let output = json!({
                "timers": due,
                "next_due_date": next_due_date,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Take at most `limit` timers due at or before `before`
///
/// The returned hint is the due date of the first timer left out, if any.
fn collect_due_timers(
    timers: &TimerInstanceState,
    before: i64,
    limit: usize,
) -> raftoral_state::Result<(Vec<TimerInstance>, Option<i64>)> {
    let mut due = Vec::new();
    let next_due_date = timers.find_timers_with_due_date_before(before, |timer| {
        if due.len() >= limit {
            return false;
        }
        due.push(timer.clone());
        true
    })?;
    Ok((due, next_due_date))
}
