//! Server and orphan sweep commands: `clonesmith serve`, `clonesmith sweep`.

use anyhow::Result;
use clonesmith::config::Config;
use clonesmith::lock::InstanceLock;
use clonesmith::worker::{Breadcrumbs, sweep_breadcrumbs};

pub async fn cmd_serve(config: Config, dev: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    clonesmith::server::start_server(config, dev).await
}

pub async fn cmd_sweep(config: &Config) -> Result<()> {
    // Refuse to run next to a live server; its workers are not orphans.
    let _lock = InstanceLock::acquire(&config.storage.data_dir)?;

    let breadcrumbs = Breadcrumbs::new(config.breadcrumbs_dir());
    let swept = sweep_breadcrumbs(&breadcrumbs, config.worker.stop_grace(), &[]).await?;

    if swept.is_empty() {
        println!("No worker breadcrumbs in {}", breadcrumbs.dir().display());
        return Ok(());
    }

    for orphan in &swept {
        let pid = orphan
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "?".to_string());
        let outcome = match (&orphan.error, orphan.terminated) {
            (Some(e), _) => console::style(format!("failed: {}", e)).red(),
            (None, true) => console::style("terminated".to_string()).yellow(),
            (None, false) => console::style("stale".to_string()).dim(),
        };
        println!("  {:<38} pid {:<8} {}", orphan.clone_id, pid, outcome);
    }

    let failed = swept.iter().filter(|o| o.error.is_some()).count();
    if failed > 0 {
        anyhow::bail!("{} orphaned worker(s) could not be terminated", failed);
    }
    Ok(())
}
