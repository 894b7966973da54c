//! `kurator history`: newest audit log entries first.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use kurator_core::{AuditLogEntry, SyncStatus};
use kurator_replica::RunLedger;

use super::{format_age, home, open_replica};

/// Arguments for `kurator history`.
#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// How many runs to show.
    #[arg(long, default_value_t = 10)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct RunRow {
    #[tabled(rename = "run")]
    id: String,
    #[tabled(rename = "when")]
    when: String,
    #[tabled(rename = "trigger")]
    trigger: String,
    #[tabled(rename = "scope")]
    scope: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "ms")]
    duration_ms: u64,
    #[tabled(rename = "+/~/-")]
    changes: String,
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let entries = open_replica(&home)?
            .recent_audits(self.limit)
            .context("failed to read the run audit log")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&entries)
                    .context("failed to serialize history JSON")?
            );
            return Ok(());
        }

        if entries.is_empty() {
            println!("No runs recorded yet. Run `kurator sync` first.");
            return Ok(());
        }

        let errors: Vec<(String, String)> = entries
            .iter()
            .flat_map(|entry| entry.errors.iter().map(|e| (entry.id.clone(), e.clone())))
            .collect();
        let rows: Vec<RunRow> = entries.into_iter().map(row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        for (id, error) in errors {
            println!("{} {id}: {error}", "error".red());
        }
        Ok(())
    }
}

fn row(entry: AuditLogEntry) -> RunRow {
    let (added, updated, deactivated) =
        entry
            .results
            .values()
            .fold((0, 0, 0), |(a, u, d), result| {
                (a + result.added, u + result.updated, d + result.deactivated)
            });
    let status = match entry.status {
        SyncStatus::Success => entry.status.to_string().green().to_string(),
        SyncStatus::Error => entry.status.to_string().red().to_string(),
        _ => entry.status.to_string(),
    };
    RunRow {
        id: entry.id,
        when: format!("{} ago", format_age(entry.timestamp)),
        trigger: match entry.triggered_by {
            Some(by) => format!("{} ({by})", entry.trigger),
            None => entry.trigger.to_string(),
        },
        scope: entry.scope.to_string(),
        status,
        duration_ms: entry.duration_ms,
        changes: format!("{added}/{updated}/{deactivated}"),
    }
}
