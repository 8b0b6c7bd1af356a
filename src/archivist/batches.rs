use crate::archivist::ledger::{BatchState, PipelineLedger, StagePosition};

/// Batches ready to close at `now`, in ascending key order.
///
/// A batch is ready when it is open, still has members that were never archived,
/// and its most recent artifact is strictly older than the quiescence timeout.
pub fn evaluate(ledger: &PipelineLedger, now: u64, quiescence_timeout_secs: u64) -> Vec<String> {
    ledger
        .batches
        .iter()
        .filter(|(_, batch)| batch.state == BatchState::Open)
        .filter(|(_, batch)| {
            now.saturating_sub(batch.last_observed_epoch_secs) > quiescence_timeout_secs
        })
        .filter(|(_, batch)| {
            batch.members.iter().any(|k| {
                ledger
                    .artifacts
                    .get(k)
                    .is_some_and(|r| !r.not_an_artifact && !r.archived)
            })
        })
        .map(|(key, _)| key.clone())
        .collect()
}

/// Mean of the positions that are present; `None` when there are none.
pub fn mean_position(positions: &[StagePosition]) -> Option<StagePosition> {
    if positions.is_empty() {
        return None;
    }
    let n = positions.len() as f64;
    let (sx, sy) = positions
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Some(StagePosition {
        x: sx / n,
        y: sy / n,
    })
}
