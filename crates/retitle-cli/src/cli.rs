//! Command line interface of the `retitle` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use retitle::{JobSource, JobStatus};

/// Applies AI-generated document titles through a durable job queue.
#[derive(Debug, Parser)]
#[command(name = "retitle", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Settings file (JSON). Defaults to ~/.retitle/settings.json when present.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Log level, overridden by RUST_LOG.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs the worker pool until interrupted.
    Worker {
        /// Number of worker threads (defaults to the configured count).
        #[arg(long, short)]
        workers: Option<usize>,

        /// Seconds between stale-job and orphan sweeps.
        #[arg(long, default_value_t = 60)]
        sweep_interval: u64,
    },

    /// Queues documents for processing.
    Enqueue {
        #[arg(required = true)]
        document_ids: Vec<i64>,

        /// scanner, hook, api or manual.
        #[arg(long, default_value = "manual")]
        source: JobSource,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Queues documents again regardless of their recorded outcome.
    ForceReprocess {
        #[arg(required = true)]
        document_ids: Vec<i64>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Applies the pending title of a job awaiting approval.
    Approve { job_id: i64 },

    /// Rejects the pending title of a job awaiting approval.
    Deny {
        job_id: i64,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Lists documents awaiting approval.
    Pending {
        #[arg(long, default_value_t = 50)]
        limit: u64,

        #[arg(long, default_value_t = 0)]
        offset: u64,
    },

    /// Lists jobs, newest first.
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long)]
        source: Option<JobSource>,

        #[arg(long)]
        document: Option<i64>,

        #[arg(long, default_value_t = 50)]
        limit: u64,

        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// Oldest first.
        #[arg(long, default_value_t = false)]
        ascending: bool,
    },

    /// Shows job and document counts.
    Stats,

    /// Builds a plan for a document without writing anything.
    DryRun { document_id: i64 },

    /// Fails abandoned running jobs and requeues orphaned queued jobs.
    Reconcile {
        /// Age in seconds after which a running job counts as abandoned.
        #[arg(long)]
        older_than: Option<u64>,

        /// Only report stale jobs.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Inspects and changes runtime setting overrides.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum SettingsAction {
    /// Shows configurable keys with their stored overrides.
    List,
    /// Stores an override.
    Set { key: String, value: String },
    /// Removes an override.
    Unset { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_enqueue() {
        let cli = Cli::parse_from(["retitle", "enqueue", "1", "2", "--source", "hook"]);
        match cli.command {
            Command::Enqueue {
                document_ids,
                source,
                reason,
            } => {
                assert_eq!(document_ids, vec![1, 2]);
                assert_eq!(source, JobSource::Hook);
                assert!(reason.is_none());
            }
            _ => panic!("expected Enqueue command"),
        }
    }

    #[test]
    fn cli_parses_jobs_filters() {
        let cli = Cli::parse_from([
            "retitle",
            "--config",
            "/tmp/settings.json",
            "jobs",
            "--status",
            "awaiting_approval",
            "--limit",
            "5",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/settings.json")));
        match cli.command {
            Command::Jobs { status, limit, .. } => {
                assert_eq!(status, Some(JobStatus::AwaitingApproval));
                assert_eq!(limit, 5);
            }
            _ => panic!("expected Jobs command"),
        }
    }

    #[test]
    fn cli_parses_settings_set() {
        let cli = Cli::parse_from(["retitle", "settings", "set", "llm.model", "gpt-4o"]);
        match cli.command {
            Command::Settings {
                action: SettingsAction::Set { key, value },
            } => {
                assert_eq!(key, "llm.model");
                assert_eq!(value, "gpt-4o");
            }
            _ => panic!("expected Settings set"),
        }
    }

    #[test]
    fn cli_rejects_unknown_source() {
        assert!(Cli::try_parse_from(["retitle", "enqueue", "1", "--source", "cron"]).is_err());
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
