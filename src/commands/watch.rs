use anyhow::Result;

use crate::archivist::watcher::{self, RunSummary};
use crate::commands::CommandReport;

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub once: bool,
    pub daemon: bool,
}

fn summarize(report: &mut CommandReport, run: &RunSummary) {
    report.detail(format!("ledger_file={}", run.ledger_file));
    report.detail(format!("backend={}", run.backend));
    report.detail(format!("ticks={}", run.ticks));
    report.detail(format!("finished={}", run.finished));
    report.detail(format!("hit_max_run={}", run.hit_max_run));
    let counts = &run.counts;
    report.detail(format!("artifacts={}", counts.artifacts));
    report.detail(format!("unrecognized={}", counts.unrecognized));
    report.detail(format!("archived_artifacts={}", counts.archived_artifacts));
    report.detail(format!("stage_results={}", counts.stage_results));
    report.detail(format!("stage_pending={}", counts.stage_pending));
    report.detail(format!("batches.open={}", counts.batches_open));
    report.detail(format!("batches.closing={}", counts.batches_closing));
    report.detail(format!("batches.archived={}", counts.batches_archived));
    report.detail(format!("batches.failed={}", counts.batches_failed));
    if !run.flushed_batches.is_empty() {
        report.detail(format!("flushed={}", run.flushed_batches.join(",")));
    }
    report.detail(format!(
        "drained.archived={} drained.recorded={} drained.failed={}",
        run.drained.batches_archived, run.drained.results_recorded, run.drained.failed
    ));
    if run.abandoned > 0 {
        report.issue(format!(
            "{} archival unit(s) still running after the drain grace period",
            run.abandoned
        ));
    }
}

pub fn run(opts: &WatchOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("watch");

    if opts.once && opts.daemon {
        report.issue("invalid flags: use only one of --once or --daemon");
        return Ok(report);
    }

    let run = if opts.daemon {
        report.detail("mode=daemon");
        watcher::run_daemon()?
    } else {
        report.detail("mode=once");
        watcher::run_once()?
    };
    summarize(&mut report, &run);
    Ok(report)
}
