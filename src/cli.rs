use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::{self, CommandReport};

#[derive(Debug, Parser)]
#[command(
    name = "cryo-archivist",
    version,
    about = "Tracks a microscopy processing pipeline and archives finished batches"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the pipeline: one tick with --once (default), or until finished with --daemon.
    Watch(WatchArgs),
    /// Show paths, configuration and ledger counts.
    Status,
    /// Show how paths resolve under the configured acquisition mode.
    Resolve(ResolveArgs),
    /// Re-arm a batch whose archival failed permanently.
    RetryBatch(RetryBatchArgs),
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long)]
    once: bool,
    #[arg(long)]
    daemon: bool,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct RetryBatchArgs {
    batch_key: String,
}

fn emit(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let report = match &cli.command {
        Command::Watch(args) => commands::watch::run(&commands::watch::WatchOptions {
            once: args.once,
            daemon: args.daemon,
        })?,
        Command::Status => commands::status::run()?,
        Command::Resolve(args) => commands::resolve::run(&args.paths)?,
        Command::RetryBatch(args) => commands::retry_batch::run(&args.batch_key)?,
    };
    emit(&report, cli.json)?;
    if !report.ok {
        anyhow::bail!("{} finished with {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_json_flag_parses_after_subcommand() {
        let cli = Cli::try_parse_from(["cryo-archivist", "retry-batch", "GridSquare_7", "--json"])
            .expect("parse");
        assert!(cli.json);
        assert!(matches!(cli.command, Command::RetryBatch(ref a) if a.batch_key == "GridSquare_7"));
    }
}
