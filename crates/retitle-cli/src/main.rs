mod cli;

use std::sync::mpsc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use retitle::config::{self, CONFIGURABLE_KEYS};
use retitle::db::job_repo::JobFilter;
use retitle::reconcile;
use retitle::{EnqueueSummary, Engine, JobId, JobSource, Settings};

use cli::{Cli, Command, SettingsAction};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(&cli)?;
    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    retitle::logging::init(level, cli.json_logs);

    let engine = Engine::open(settings).context("failed to start engine")?;

    match cli.command {
        Command::Worker {
            workers,
            sweep_interval,
        } => run_worker(&engine, workers, Duration::from_secs(sweep_interval.max(1))),
        Command::Enqueue {
            document_ids,
            source,
            reason,
        } => enqueue(&engine, &document_ids, source, reason.as_deref()),
        Command::ForceReprocess {
            document_ids,
            reason,
        } => enqueue(
            &engine,
            &document_ids,
            JobSource::ForceReprocess,
            reason.as_deref(),
        ),
        Command::Approve { job_id } => {
            let settings = engine.settings().snapshot()?;
            let status = engine.approval().approve_pending(JobId(job_id), &settings)?;
            println!("job {job_id}: {status}");
            Ok(())
        }
        Command::Deny { job_id, reason } => {
            let status = engine
                .approval()
                .deny_pending(JobId(job_id), reason.as_deref())?;
            println!("job {job_id}: {status}");
            Ok(())
        }
        Command::Pending { limit, offset } => {
            let (items, total) = engine.approval().list_pending(limit, offset)?;
            for item in &items {
                println!("{}", serde_json::to_string(item)?);
            }
            eprintln!("{} of {} pending", items.len(), total);
            Ok(())
        }
        Command::Jobs {
            status,
            source,
            document,
            limit,
            offset,
            ascending,
        } => {
            let filter = JobFilter {
                status,
                source,
                document_id: document,
                limit: Some(limit),
                offset: Some(offset),
                ascending,
            };
            let (jobs, total) = engine.jobs(&filter)?;
            println!(
                "{:>6}  {:>8}  {:<18}  {:<15}  {:>7}  {}",
                "JOB", "DOCUMENT", "STATUS", "SOURCE", "ATTEMPT", "REASON"
            );
            for job in &jobs {
                println!(
                    "{:>6}  {:>8}  {:<18}  {:<15}  {:>7}  {}",
                    job.id,
                    job.document_id,
                    job.status,
                    job.source,
                    job.attempt_count,
                    job.reason.as_deref().unwrap_or("-")
                );
            }
            eprintln!("{} of {} jobs", jobs.len(), total);
            Ok(())
        }
        Command::Stats => {
            let stats = engine.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::DryRun { document_id } => {
            let settings = engine.settings().snapshot()?;
            let plan = engine.planner().dry_run(document_id, &settings)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Reconcile {
            older_than,
            dry_run,
        } => {
            let settings = engine.settings().snapshot()?;
            let older_than = older_than
                .map(Duration::from_secs)
                .unwrap_or_else(|| reconcile::stale_after(&settings));
            if dry_run {
                let stale = reconcile::find_stale_running(engine.database(), older_than)?;
                for job in &stale {
                    println!(
                        "job {} (document {}) running since {}",
                        job.id,
                        job.document_id,
                        job.started_at.as_deref().unwrap_or(&job.queued_at)
                    );
                }
                eprintln!("{} stale jobs", stale.len());
            } else {
                let failed = reconcile::fail_stale(engine.database(), older_than)?;
                eprintln!("{} stale jobs marked failed", failed.len());
            }
            Ok(())
        }
        Command::Settings { action } => settings_command(&engine, action),
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    if let Some(path) = &cli.config {
        return config::load_settings(path)
            .with_context(|| format!("failed to load settings from {}", path.display()));
    }
    match config::default_settings_path() {
        Some(path) if path.exists() => config::load_settings(&path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        _ => Ok(Settings::default()),
    }
}

fn run_worker(engine: &Engine, workers: Option<usize>, sweep_interval: Duration) -> Result<()> {
    let settings = engine.settings().snapshot()?;
    let worker_count = workers.unwrap_or(settings.worker_count);

    // Jobs queued while no worker was running are only in the database.
    let requeued = reconcile::requeue_orphaned(
        engine.database(),
        engine.broker().as_ref(),
        &retitle::TaskOptions::from_settings(&settings),
        Duration::ZERO,
    )?;
    if !requeued.is_empty() {
        info!("Requeued {} jobs left from a previous run", requeued.len());
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("failed to install Ctrl-C handler")?;

    let pool = engine.start_workers(worker_count);
    let sweeper = engine.start_sweeper(sweep_interval);

    let _ = stop_rx.recv();
    info!("Interrupt received, stopping");

    pool.shutdown();
    pool.wait();
    sweeper.stop();
    engine.broker().close();
    Ok(())
}

fn enqueue(
    engine: &Engine,
    document_ids: &[i64],
    source: JobSource,
    reason: Option<&str>,
) -> Result<()> {
    let summary = engine.admission().enqueue_many(document_ids, source, reason)?;
    let (lines, handoff) = report(&summary);
    for line in lines {
        println!("{line}");
    }
    if let Some(notice) = handoff {
        warn!("{notice}");
    }
    Ok(())
}

/// Output lines for an enqueue, plus the worker handoff notice when
/// anything was queued. The broker of this process dies with it.
fn report(summary: &EnqueueSummary) -> (Vec<String>, Option<&'static str>) {
    let mut lines: Vec<String> = summary
        .queued
        .iter()
        .map(|(document_id, job_id)| format!("document {document_id}: job {job_id} queued"))
        .collect();
    lines.extend(
        summary
            .skipped
            .iter()
            .map(|skipped| format!("document {}: {}", skipped.document_id, skipped.reason)),
    );
    let handoff = (!summary.queued.is_empty())
        .then_some("Jobs are picked up by a running `retitle worker` on its next sweep");
    (lines, handoff)
}

fn settings_command(engine: &Engine, action: SettingsAction) -> Result<()> {
    let service = engine.settings();
    match action {
        SettingsAction::List => {
            let overrides = service.overrides()?;
            for key in CONFIGURABLE_KEYS {
                let value = overrides.get(key.key).map(String::as_str).unwrap_or("-");
                println!("{:<32}  {:<24}  {}", key.key, value, key.description);
            }
        }
        SettingsAction::Set { key, value } => {
            service.save(&key, &value)?;
            println!("{key} = {value}");
        }
        SettingsAction::Unset { key } => {
            if !service.delete(&key)? {
                bail!("no override stored for '{key}'");
            }
            println!("{key} reset");
        }
    }
    Ok(())
}
