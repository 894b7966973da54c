//! Kurator: mirror Themes, Schools, Competencies and Lessons from the
//! source base into the local replica.
//!
//! # Usage
//!
//! ```text
//! kurator sync [--kind school|theme|competency|lesson] [--actor <id>]
//! kurator status [--json]
//! kurator history [--limit N] [--json]
//! kurator invalidate --actor <id> --role teacher|reviewer|admin
//! kurator daemon start|stop|status|sync|logs
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, history::HistoryArgs, invalidate::InvalidateArgs, status::StatusArgs,
    sync::SyncArgs,
};
use kurator_core::EntityKind;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "kurator",
    version,
    about = "Keep the local record replica in step with the source base",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile every kind (or one kind) right now, in this process.
    Sync(SyncArgs),

    /// Show the run metadata: status, last full run, record counts.
    Status(StatusArgs),

    /// List the most recent runs from the audit log.
    History(HistoryArgs),

    /// Mark every replica record inactive. Admin only.
    Invalidate(InvalidateArgs),

    /// Manage the background scheduler.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared EntityKind argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `EntityKind` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct KindArg(pub EntityKind);

impl FromStr for KindArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<EntityKind>()
            .map(Self)
            .map_err(|err| err.to_string())
    }
}

impl fmt::Display for KindArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<KindArg> for EntityKind {
    fn from(k: KindArg) -> Self {
        k.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Sync(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::History(args) => args.run(),
        Commands::Invalidate(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
