//! `kurator invalidate`: deactivate every replica document.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use kurator_core::{config, Actor, Role};
use kurator_source::HttpSourceClient;
use kurator_sync::SyncEngine;

use super::{home, open_replica};

/// Arguments for `kurator invalidate`.
#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Who is asking; recorded in the daemon log.
    #[arg(long)]
    pub actor: String,

    /// Caller role. Only `admin` may invalidate.
    #[arg(long, default_value_t = Role::Teacher)]
    pub role: Role,
}

impl InvalidateArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let config = config::load_at(&home).context("failed to load ~/.kurator/config.yaml")?;
        // Invalidation never reads the source, so no API key is needed.
        let source = HttpSourceClient::new(config.source.clone(), String::new());
        let engine = SyncEngine::new(source, open_replica(&home)?, config.sync.clone());

        let actor = Actor::new(self.actor, self.role);
        let report = engine
            .invalidate_all(&actor)
            .context("invalidation failed")?;

        println!(
            "{} invalidated by {}: {} document(s) deactivated",
            "✓".green().bold(),
            report.actor,
            report.total()
        );
        for (kind, count) in &report.deactivated {
            println!("  {:<13} {count}", kind.collection());
        }
        Ok(())
    }
}
