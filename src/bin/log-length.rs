use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use agent_relay::config::{default_state_dir, LOG_LENGTH_FILE};
use agent_relay::log_length::{LogLength, LogLengthStore};

/// Show or change how many screen lines notices and /screen include.
#[derive(Parser, Debug)]
#[command(name = "log-length")]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("action")
        .required(true)
        .args(["status", "set", "cycle", "reset"]),
))]
#[command(after_help = "\
ALLOWED VALUES:
    100, 150, 200, 300 (cycle order)

ENVIRONMENT VARIABLES:
    RELAY_STATE_DIR    State directory (default: ~/.agent-relay)
")]
struct Cli {
    /// Print the current setting.
    #[arg(long)]
    status: bool,

    /// Set the number of lines.
    #[arg(long, value_name = "LINES")]
    set: Option<u32>,

    /// Advance to the next allowed value.
    #[arg(long)]
    cycle: bool,

    /// Restore the default of 100.
    #[arg(long)]
    reset: bool,
}

fn store() -> Result<LogLengthStore> {
    let dir = match std::env::var("RELAY_STATE_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => default_state_dir()?,
    };
    Ok(LogLengthStore::new(dir.join(LOG_LENGTH_FILE)))
}

fn run(cli: Cli) -> Result<()> {
    let store = store()?;

    if cli.status {
        println!("Log length: {} lines", store.get());
    } else if let Some(lines) = cli.set {
        let length = LogLength::new(lines)?;
        store
            .set(length)
            .with_context(|| format!("writing {}", store.path().display()))?;
        println!("Log length set to {} lines", length);
    } else if cli.cycle {
        let length = store
            .cycle()
            .with_context(|| format!("writing {}", store.path().display()))?;
        println!("Log length set to {} lines", length);
    } else if cli.reset {
        let length = store
            .reset()
            .with_context(|| format!("writing {}", store.path().display()))?;
        println!("Log length reset to {} lines", length);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
