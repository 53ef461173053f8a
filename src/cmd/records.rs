//! Read-only record listings: `clonesmith jobs`, `clonesmith clones`.
//!
//! These read the record files directly and never sanitize or write, so
//! they are safe to run next to a live server.

use anyhow::Result;
use clonesmith::config::Config;
use clonesmith::store::Records;
use clonesmith_common::{CloneStatus, JobStatus};
use console::style;

pub fn cmd_jobs(config: &Config, json: bool) -> Result<()> {
    let records = Records::load(&config.records_dir())?;
    let jobs = records.jobs.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("No jobs in {}", config.records_dir().display());
        return Ok(());
    }

    for job in &jobs {
        let status = match job.status {
            JobStatus::Succeeded => style(job.status.to_string()).green(),
            JobStatus::Failed => style(job.status.to_string()).red(),
            JobStatus::Running => style(job.status.to_string()).cyan(),
            _ => style(job.status.to_string()).dim(),
        };
        println!(
            "{}  {:<10} {:<24} {}",
            job.id,
            status,
            job.model_id,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(error) = &job.error {
            println!("    {}", style(error).red());
        }
    }
    Ok(())
}

pub fn cmd_clones(config: &Config, json: bool) -> Result<()> {
    let records = Records::load(&config.records_dir())?;
    let clones = records.clones.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&clones)?);
        return Ok(());
    }
    if clones.is_empty() {
        println!("No clones in {}", config.records_dir().display());
        return Ok(());
    }

    for clone in &clones {
        let status = match clone.status {
            CloneStatus::Ready => style(clone.status.to_string()).green(),
            CloneStatus::Failed => style(clone.status.to_string()).red(),
            _ => style(clone.status.to_string()).cyan(),
        };
        let running = if clone.is_running { "running" } else { "" };
        println!(
            "{}  {:<10} {:<20} {:<8} knowledge={}",
            clone.id, status, clone.name, running, clone.knowledge_count
        );
    }
    Ok(())
}
