//! `kurator sync`: reconcile in the foreground.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use kurator_core::{config, EntityKind, RunResult, SyncStatus, TriggerType};
use kurator_source::HttpSourceClient;
use kurator_sync::{EntityOutcome, RunOutcome, SyncEngine};

use super::{home, open_replica};
use crate::KindArg;

/// Arguments for `kurator sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Reconcile only this kind (school, theme, competency, lesson).
    #[arg(long)]
    pub kind: Option<KindArg>,

    /// Recorded as `triggeredBy` in the audit log.
    #[arg(long)]
    pub actor: Option<String>,
}

#[derive(Tabled)]
struct KindRow {
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "added")]
    added: u64,
    #[tabled(rename = "updated")]
    updated: u64,
    #[tabled(rename = "deactivated")]
    deactivated: u64,
    #[tabled(rename = "errors")]
    errors: usize,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let config = config::load_at(&home).context("failed to load ~/.kurator/config.yaml")?;
        let source = HttpSourceClient::from_config(config.source.clone())
            .context("cannot reach the source base")?;
        let engine = SyncEngine::new(source, open_replica(&home)?, config.sync.clone());

        let run = match self.kind.map(EntityKind::from) {
            None => match engine.run_full_sync(TriggerType::Manual, self.actor) {
                RunOutcome::Completed(run) => run,
                RunOutcome::AlreadyRunning { run_id, started_at } => {
                    print_declined(run_id, started_at);
                    return Ok(());
                }
            },
            Some(kind) => match engine.run_entity_sync(kind, TriggerType::Manual, self.actor) {
                EntityOutcome::Completed { run, .. } => run,
                EntityOutcome::AlreadyRunning { run_id, started_at } => {
                    print_declined(run_id, started_at);
                    return Ok(());
                }
            },
        };

        print_run(&run);
        if run.status == SyncStatus::Error {
            bail!("run {} finished with errors: {}", run.run_id, run.errors.join("; "));
        }
        Ok(())
    }
}

fn print_declined(run_id: Option<String>, started_at: Option<chrono::DateTime<chrono::Utc>>) {
    let owner = run_id.unwrap_or_else(|| "unknown run".to_string());
    match started_at {
        Some(at) => println!(
            "{} another run is in progress ({owner}, started {} ago); nothing was written",
            "•".yellow().bold(),
            super::format_age(at)
        ),
        None => println!(
            "{} another run is in progress ({owner}); nothing was written",
            "•".yellow().bold()
        ),
    }
}

fn print_run(run: &RunResult) {
    let marker = if run.is_success() {
        "✓".green().bold()
    } else {
        "✗".red().bold()
    };
    println!(
        "{marker} {} run {} ({}, {} ms)",
        run.scope, run.run_id, run.status, run.duration_ms
    );

    if !run.results.is_empty() {
        let rows: Vec<KindRow> = run
            .results
            .iter()
            .map(|(kind, result)| KindRow {
                kind: kind.to_string(),
                added: result.added,
                updated: result.updated,
                deactivated: result.deactivated,
                errors: result.errors.len(),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }

    for error in &run.errors {
        eprintln!("  {} {error}", "error:".red());
    }
}
