use anyhow::{Context, Result};

use crate::archivist::audit;
use crate::archivist::ledger::LedgerStore;
use crate::archivist::paths::resolve_paths;
use crate::commands::CommandReport;

/// Re-arms a batch whose archival failed permanently. The next watch tick closes it
/// again under the same cycle, so the backend sees the same dataset id.
pub fn run(batch_key: &str) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let store = LedgerStore::new(&paths.ledger_file);
    let mut ledger = store
        .load()
        .with_context(|| format!("cannot re-arm {batch_key}"))?;

    let mut report = CommandReport::new("retry-batch");
    report.detail(format!("ledger_file={}", store.path().display()));

    let Some(batch) = ledger.batch(batch_key) else {
        report.issue(format!("unknown batch: {batch_key}"));
        return Ok(report);
    };
    let state = batch.state;
    let cycle = batch.cycle;

    if !ledger.rearm_batch(batch_key)? {
        report.issue(format!(
            "batch {batch_key} is {}; only failed batches can be retried",
            state.as_str()
        ));
        return Ok(report);
    }
    store.persist(&ledger)?;
    audit::record(
        &paths,
        "retry-batch",
        "ok",
        &format!("batch={batch_key} cycle={cycle}"),
    );
    report.detail(format!("batch={batch_key} cycle={cycle} state=open"));
    Ok(report)
}
