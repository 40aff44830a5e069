use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use tracing::{error, info};

use cloud_backup::config::{self, LoadMode, Settings};
use cloud_backup::ledger::Ledger;
use cloud_backup::logging::{self, LoggingConfig};
use cloud_backup::orchestrator::{Orchestrator, TracingSink, format_bytes};
use cloud_backup::{Error, Result, ops, tools};

// Some paths failed but the run itself completed.
const EXIT_PARTIAL: u8 = 2;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Config file (default: next to the binary, then ~/.config, then ~)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug logging, including every external command line
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up every due path (the default)
    Run,
    /// Show each path's schedule, last backup and whether it is due now
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Forget all backup state; every path becomes due
    Reset,
    /// Delete every configured path's remote archive
    Purge,
    /// Download a path's archive and unpack it
    Restore {
        /// A configured source path
        path: String,
        /// Directory to unpack into (default: the working directory)
        #[arg(long)]
        into: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            if tracing::dispatcher::has_been_set() {
                error!(kind = ?e.kind(), "{e}");
            } else {
                eprintln!("cloud-backup: {e}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let path = match args.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };
    let doc = config::load(&path)?;
    logging::init(&LoggingConfig::from_doc(&doc)?, doc.base_dir(), args.verbose)?;
    info!(config = %path.display(), "config loaded");
    let cmd = args.cmd.unwrap_or(Command::Run);
    let mode = match cmd {
        Command::Run => LoadMode::Backup,
        _ => LoadMode::ReadOnly,
    };
    let settings = Settings::from_doc_with(&doc, mode)?;

    match cmd {
        Command::Run => cmd_run(&settings),
        Command::Status { json } => cmd_status(&settings, json),
        Command::Reset => {
            ops::reset(&settings)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Purge => {
            tools::probe(&tools::required_tools(&settings.paths))?;
            let report = ops::purge(&settings);
            info!(removed = report.removed, failed = report.failed, "purge finished");
            Ok(exit_for_failures(report.failed))
        }
        Command::Restore { path, into } => {
            let spec = settings.find_path(&path)?;
            tools::probe(&tools::required_tools([spec]))?;
            ops::restore(&settings, &path, into.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn cmd_run(settings: &Settings) -> Result<ExitCode> {
    tools::probe(&tools::required_tools(&settings.paths))?;
    let mut ledger = Ledger::load(&settings.state_file);
    let sink = TracingSink;
    let report = Orchestrator::new(settings, &sink).run(&mut ledger, Local::now())?;
    Ok(exit_for_failures(report.failed()))
}

fn cmd_status(settings: &Settings, json: bool) -> Result<ExitCode> {
    let ledger = Ledger::load(&settings.state_file);
    let rows = ops::status(settings, &ledger, Local::now());
    if json {
        let out = serde_json::to_string_pretty(&rows)
            .map_err(|e| Error::msg(format!("failed to encode status: {e}")))?;
        println!("{out}");
        return Ok(ExitCode::SUCCESS);
    }
    for r in &rows {
        let last = r
            .last_backup
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "{:<40} {:<8} {:<16} {:<16} {:>8}  {}",
            r.path.display(),
            r.schedule,
            r.target,
            last,
            format_bytes(r.archive_size),
            if r.due { "due" } else { "-" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_for_failures(failed: usize) -> ExitCode {
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_PARTIAL)
    }
}
