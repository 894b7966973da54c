//! `kurator status`: the run metadata singleton plus live replica counts.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use kurator_core::{EntityKind, RunMetadata, SyncStatus};
use kurator_replica::{Filter, ReplicaStore, RunLedger};

use super::{format_age, home, open_replica};

/// Arguments for `kurator status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusJson {
    #[serde(flatten)]
    metadata: RunMetadata,
    active_documents: BTreeMap<EntityKind, usize>,
}

#[derive(Tabled)]
struct CountRow {
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "last synced")]
    synced: u64,
    #[tabled(rename = "active in replica")]
    active: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let replica = open_replica(&home)?;
        let metadata = replica
            .read_metadata()
            .context("failed to read run metadata")?;

        let mut active = BTreeMap::new();
        for kind in EntityKind::SYNC_ORDER {
            let docs = replica
                .get_all(kind, Some(&Filter::active()))
                .with_context(|| format!("failed to read {} collection", kind.collection()))?;
            active.insert(kind, docs.len());
        }

        if self.json {
            let payload = StatusJson {
                metadata,
                active_documents: active,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_summary(&metadata);
        let rows: Vec<CountRow> = EntityKind::SYNC_ORDER
            .into_iter()
            .map(|kind| CountRow {
                kind: kind.collection().to_string(),
                synced: metadata.record_counts.get(kind),
                active: active.get(&kind).copied().unwrap_or_default(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn print_summary(metadata: &RunMetadata) {
    let status = match metadata.sync_status {
        SyncStatus::Idle => "IDLE".bright_black().bold(),
        SyncStatus::Syncing => "SYNCING".yellow().bold(),
        SyncStatus::Success => "SUCCESS".green().bold(),
        SyncStatus::Error => "ERROR".red().bold(),
    };
    println!("Kurator v{} | status {status} ({})", env!("CARGO_PKG_VERSION"), metadata.sync_status);

    match metadata.last_full_sync {
        Some(at) => println!("last full sync: {} ({} ago)", at.to_rfc3339(), format_age(at)),
        None => println!("last full sync: never"),
    }
    if let Some(ms) = metadata.last_sync_duration_ms {
        println!("last run took: {ms} ms");
    }
    if metadata.sync_status == SyncStatus::Syncing {
        if let (Some(id), Some(at)) = (&metadata.run_id, metadata.run_started_at) {
            println!("running: {id} (started {} ago)", format_age(at));
        }
    }
    if let Some(message) = &metadata.error_message {
        println!("{} {message}", "last error:".red());
    }
}
