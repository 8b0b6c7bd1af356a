use anyhow::Result;
use std::env;

use crate::archivist::GENERATED_ARCHIVIST_ENV_ALLOWLIST;
use crate::archivist::audit;
use crate::archivist::config::load_config;
use crate::archivist::ledger::{BatchState, LedgerStore};
use crate::archivist::paths::resolve_paths;
use crate::commands::CommandReport;

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("status");

    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("archivist_home={}", paths.archivist_home.display()));
    report.detail(format!("config_file={}", paths.config_file.display()));
    report.detail(format!("ledger_file={}", paths.ledger_file.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!("catalog_dir={}", paths.catalog_dir.display()));
    if let Some(staging) = &paths.staging_dir {
        report.detail(format!("staging_dir={}", staging.display()));
    }

    let overrides = GENERATED_ARCHIVIST_ENV_ALLOWLIST
        .iter()
        .filter(|key| env::var_os(key).is_some())
        .copied()
        .collect::<Vec<_>>();
    report.detail(format!("env_overrides={}", overrides.join(",")));

    match load_config(&paths) {
        Ok(cfg) => {
            report.detail(format!("mode={}", cfg.acquisition.mode.as_str()));
            report.detail(format!("backend={}", cfg.archive.backend));
            report.detail(format!("stages={}", cfg.stages.len()));
            for stage in &cfg.stages {
                report.detail(format!(
                    "stage name={} kind={:?} dir={}",
                    stage.name,
                    stage.kind,
                    stage.output_dir.display()
                ));
            }
            report.detail(format!(
                "quiescence_timeout_secs={}",
                cfg.batching.quiescence_timeout_secs
            ));
            report.detail(format!(
                "workers.batch={} workers.artifact={}",
                cfg.archive.batch_workers, cfg.archive.artifact_workers
            ));
        }
        Err(err) => report.issue(format!("config invalid: {err:#}")),
    }

    match LedgerStore::new(&paths.ledger_file).load() {
        Ok(ledger) => {
            let counts = ledger.counts();
            report.detail(format!("artifacts={}", counts.artifacts));
            report.detail(format!("unrecognized={}", counts.unrecognized));
            report.detail(format!("archived_artifacts={}", counts.archived_artifacts));
            report.detail(format!("stage_results={}", counts.stage_results));
            report.detail(format!("stage_pending={}", counts.stage_pending));
            report.detail(format!(
                "batches open={} closing={} archived={} failed={}",
                counts.batches_open,
                counts.batches_closing,
                counts.batches_archived,
                counts.batches_failed
            ));
            for (key, batch) in &ledger.batches {
                if batch.state == BatchState::Failed {
                    // Members that joined after the failure wait here too.
                    let held = batch.members.difference(&batch.closing_members).count();
                    report.detail(format!(
                        "failed_batch={key} cycle={} held_members={held} error={}",
                        batch.cycle,
                        batch.last_error.as_deref().unwrap_or("-")
                    ));
                }
            }
        }
        Err(err) => report.issue(format!("ledger unreadable: {err:#}")),
    }

    match audit::read_events(&paths) {
        Ok(events) => {
            if let Some(last) = events.last() {
                report.detail(format!(
                    "last_event phase={} status={} at={}",
                    last.phase, last.status, last.at_epoch_secs
                ));
            }
        }
        Err(err) => report.issue(format!("audit log unreadable: {err:#}")),
    }

    Ok(report)
}
