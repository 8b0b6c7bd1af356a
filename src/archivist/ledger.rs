//! Durable per-artifact and per-batch pipeline state.
//!
//! The ledger is owned by the poll loop. Workers never touch it; they receive
//! snapshots and report back, and the loop applies the result here.

use crate::archivist::batches::mean_position;
use crate::archivist::util::write_json_atomically;
use crate::error::LedgerError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Batch that collects artifacts whose path carried no batch folder.
pub const UNGROUPED_BATCH_KEY: &str = "(ungrouped)";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StageProgress {
    /// `None` marks a placeholder for a stage whose output has not been seen yet.
    pub output_path: Option<String>,
    pub observed_at_epoch_secs: Option<u64>,
    pub metadata: BTreeMap<String, Value>,
    pub result_id: Option<String>,
    pub upload_failures: u32,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl StageProgress {
    pub fn is_placeholder(&self) -> bool {
        self.output_path.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArtifactRecord {
    pub raw_path: Option<String>,
    pub batch_key: Option<String>,
    pub sequence: Option<u64>,
    pub acquired_at_epoch_secs: Option<u64>,
    pub observed_at_epoch_secs: u64,
    pub position: Option<StagePosition>,
    pub tilt_angle: Option<f64>,
    pub grammar: Option<String>,
    /// Descriptive filename tail the key leaves out, e.g. `_Fractions`.
    pub suffix: Option<String>,
    pub not_an_artifact: bool,
    pub not_an_artifact_reason: Option<String>,
    pub stages: BTreeMap<String, StageProgress>,
    pub archived: bool,
    pub archived_in: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ArtifactRecord {
    pub fn batch_slot(&self) -> &str {
        self.batch_key.as_deref().unwrap_or(UNGROUPED_BATCH_KEY)
    }

    fn eligible_for_batch(&self) -> bool {
        !self.not_an_artifact && !self.archived
    }
}

/// Attributes merged by [`PipelineLedger::upsert_artifact`]. `None` never clears.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPatch {
    pub raw_path: Option<String>,
    pub batch_key: Option<String>,
    pub sequence: Option<u64>,
    pub acquired_at_epoch_secs: Option<u64>,
    pub position: Option<StagePosition>,
    pub tilt_angle: Option<f64>,
    pub grammar: Option<String>,
    pub suffix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BatchState {
    #[default]
    Open,
    CloseAttempted,
    Failed,
    Archived,
}

impl BatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::CloseAttempted => "close-attempted",
            Self::Failed => "failed",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedCycle {
    pub cycle: u32,
    pub record_id: String,
    pub members: usize,
    pub archived_at_epoch_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BatchRecord {
    pub members: BTreeSet<String>,
    pub last_observed_epoch_secs: u64,
    pub state: BatchState,
    pub cycle: u32,
    pub closing_members: BTreeSet<String>,
    pub mean_position: Option<StagePosition>,
    pub record_id: Option<String>,
    pub close_attempted_at_epoch_secs: Option<u64>,
    pub last_error: Option<String>,
    pub history: Vec<ArchivedCycle>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BatchRecord {
    pub fn is_archived(&self) -> bool {
        self.state == BatchState::Archived
    }
}

/// Point-in-time copy of a closing batch, handed to an archival worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSnapshot {
    pub batch_key: String,
    pub cycle: u32,
    pub members: Vec<(String, ArtifactRecord)>,
    pub mean_position: Option<StagePosition>,
    pub last_observed_epoch_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMark {
    Recorded,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    pub created: bool,
    pub reopened_batch: bool,
    /// The member landed in a failed batch and waits for `retry-batch`.
    pub held_by_failed_batch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchJoin {
    Joined,
    Reopened,
    HeldByFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerCounts {
    pub artifacts: usize,
    pub unrecognized: usize,
    pub archived_artifacts: usize,
    pub stage_results: usize,
    pub stage_pending: usize,
    pub batches_open: usize,
    pub batches_closing: usize,
    pub batches_failed: usize,
    pub batches_archived: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineLedger {
    pub schema_version: u32,
    pub metadata: BTreeMap<String, Value>,
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    pub batches: BTreeMap<String, BatchRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for PipelineLedger {
    fn default() -> Self {
        Self {
            schema_version: 1,
            metadata: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            batches: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl PipelineLedger {
    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_string(), value);
    }

    pub fn artifact(&self, key: &str) -> Option<&ArtifactRecord> {
        self.artifacts.get(key)
    }

    pub fn batch(&self, key: &str) -> Option<&BatchRecord> {
        self.batches.get(key)
    }

    /// Record a file that no grammar accepted. Returns `false` if it was already known.
    pub fn record_unrecognized(&mut self, path: &str, reason: &str, now: u64) -> bool {
        if self.artifacts.contains_key(path) {
            return false;
        }
        self.artifacts.insert(
            path.to_string(),
            ArtifactRecord {
                raw_path: Some(path.to_string()),
                observed_at_epoch_secs: now,
                not_an_artifact: true,
                not_an_artifact_reason: Some(reason.to_string()),
                ..ArtifactRecord::default()
            },
        );
        true
    }

    pub fn upsert_artifact(
        &mut self,
        key: &str,
        patch: ArtifactPatch,
        now: u64,
    ) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();
        let record = self.artifacts.entry(key.to_string()).or_insert_with(|| {
            outcome.created = true;
            ArtifactRecord {
                observed_at_epoch_secs: now,
                ..ArtifactRecord::default()
            }
        });
        if record.not_an_artifact {
            return outcome;
        }

        let previous_slot = (!outcome.created).then(|| record.batch_slot().to_string());
        if record.raw_path.is_none() {
            record.raw_path = patch.raw_path;
        }
        if record.batch_key.is_none() {
            record.batch_key = patch.batch_key;
        }
        if patch.sequence.is_some() {
            record.sequence = patch.sequence;
        }
        if patch.acquired_at_epoch_secs.is_some() {
            record.acquired_at_epoch_secs = patch.acquired_at_epoch_secs;
        }
        if patch.position.is_some() {
            record.position = patch.position;
        }
        if patch.tilt_angle.is_some() {
            record.tilt_angle = patch.tilt_angle;
        }
        if patch.grammar.is_some() && record.grammar.is_none() {
            record.grammar = patch.grammar;
        }
        if record.suffix.is_none() {
            record.suffix = patch.suffix;
        }

        let slot = record.batch_slot().to_string();
        let archived = record.archived;
        if previous_slot.as_deref() == Some(slot.as_str()) {
            return outcome;
        }
        if let Some(previous) = previous_slot
            && !archived
            && let Some(batch) = self.batches.get_mut(&previous)
            && !batch.closing_members.contains(key)
        {
            batch.members.remove(key);
        }
        match self.join_batch(&slot, key, now) {
            BatchJoin::Joined => {}
            BatchJoin::Reopened => outcome.reopened_batch = true,
            BatchJoin::HeldByFailure => outcome.held_by_failed_batch = true,
        }
        outcome
    }

    /// Adds `key` to the batch; an archived batch reopens as a new cycle. A failed
    /// batch keeps its state until an operator re-arms it.
    fn join_batch(&mut self, batch_key: &str, key: &str, now: u64) -> BatchJoin {
        let batch = self.batches.entry(batch_key.to_string()).or_default();
        let inserted = batch.members.insert(key.to_string());
        batch.last_observed_epoch_secs = batch.last_observed_epoch_secs.max(now);
        if !inserted {
            return BatchJoin::Joined;
        }
        match batch.state {
            BatchState::Archived => {
                batch.state = BatchState::Open;
                batch.cycle += 1;
                batch.closing_members.clear();
                BatchJoin::Reopened
            }
            BatchState::Failed => BatchJoin::HeldByFailure,
            BatchState::Open | BatchState::CloseAttempted => BatchJoin::Joined,
        }
    }

    /// Records a newly observed stage output. Earlier stages not yet seen get placeholders.
    pub fn record_stage_output(
        &mut self,
        key: &str,
        stage: &str,
        prerequisites: &[&str],
        output_path: &str,
        metadata: BTreeMap<String, Value>,
        now: u64,
    ) -> Result<bool, LedgerError> {
        let record = self
            .artifacts
            .get_mut(key)
            .ok_or_else(|| LedgerError::UnknownArtifact(key.to_string()))?;
        for prerequisite in prerequisites {
            record
                .stages
                .entry((*prerequisite).to_string())
                .or_default();
        }
        let progress = record.stages.entry(stage.to_string()).or_default();
        if !progress.is_placeholder() {
            return Ok(false);
        }
        progress.output_path = Some(output_path.to_string());
        progress.observed_at_epoch_secs = Some(now);
        progress.metadata = metadata;
        Ok(true)
    }

    pub fn has_stage_output(&self, key: &str, stage: &str) -> bool {
        self.artifacts
            .get(key)
            .and_then(|r| r.stages.get(stage))
            .is_some_and(|p| !p.is_placeholder())
    }

    pub fn mark_stage_complete(
        &mut self,
        key: &str,
        stage: &str,
        result_id: &str,
    ) -> Result<StageMark, LedgerError> {
        let record = self
            .artifacts
            .get_mut(key)
            .ok_or_else(|| LedgerError::UnknownArtifact(key.to_string()))?;
        let progress = record.stages.entry(stage.to_string()).or_default();
        match progress.result_id.as_deref() {
            Some(existing) if existing == result_id => Ok(StageMark::Unchanged),
            Some(existing) => Err(LedgerError::ConflictingResult {
                key: key.to_string(),
                stage: stage.to_string(),
                existing: existing.to_string(),
                attempted: result_id.to_string(),
            }),
            None => {
                progress.result_id = Some(result_id.to_string());
                progress.last_error = None;
                Ok(StageMark::Recorded)
            }
        }
    }

    pub fn record_upload_failure(&mut self, key: &str, stage: &str, error: &str) {
        if let Some(progress) = self
            .artifacts
            .get_mut(key)
            .and_then(|r| r.stages.get_mut(stage))
        {
            progress.upload_failures += 1;
            progress.last_error = Some(error.to_string());
        }
    }

    /// Moves an open batch to close-attempted and returns what should be archived.
    /// `Ok(None)` means the batch has no eligible members and nothing happens.
    pub fn close_batch(
        &mut self,
        batch_key: &str,
        now: u64,
    ) -> Result<Option<BatchSnapshot>, LedgerError> {
        let batch = self
            .batches
            .get(batch_key)
            .ok_or_else(|| LedgerError::UnknownBatch(batch_key.to_string()))?;
        if batch.state != BatchState::Open {
            return Ok(None);
        }
        let eligible = batch
            .members
            .iter()
            .filter(|k| {
                self.artifacts
                    .get(*k)
                    .is_some_and(ArtifactRecord::eligible_for_batch)
            })
            .cloned()
            .collect::<BTreeSet<_>>();
        if eligible.is_empty() {
            return Ok(None);
        }

        let positions = eligible
            .iter()
            .filter_map(|k| self.artifacts.get(k).and_then(|r| r.position))
            .collect::<Vec<_>>();
        let mean = mean_position(&positions);

        if let Some(batch) = self.batches.get_mut(batch_key) {
            batch.state = BatchState::CloseAttempted;
            batch.closing_members = eligible;
            batch.mean_position = mean;
            batch.close_attempted_at_epoch_secs = Some(now);
            batch.last_error = None;
        }
        Ok(self.closing_snapshot(batch_key))
    }

    /// Snapshot of a batch already in close-attempted state, e.g. after a restart.
    pub fn closing_snapshot(&self, batch_key: &str) -> Option<BatchSnapshot> {
        let batch = self.batches.get(batch_key)?;
        if batch.state != BatchState::CloseAttempted {
            return None;
        }
        let members = batch
            .closing_members
            .iter()
            .filter_map(|k| self.artifacts.get(k).map(|r| (k.clone(), r.clone())))
            .collect::<Vec<_>>();
        Some(BatchSnapshot {
            batch_key: batch_key.to_string(),
            cycle: batch.cycle,
            members,
            mean_position: batch.mean_position,
            last_observed_epoch_secs: batch.last_observed_epoch_secs,
        })
    }

    /// Applies a confirmed batch archival. Returns `false` for stale or repeated
    /// confirmations, which leave the ledger untouched.
    pub fn confirm_batch_archived(
        &mut self,
        batch_key: &str,
        cycle: u32,
        dataset_id: &str,
        record_id: &str,
        now: u64,
    ) -> Result<bool, LedgerError> {
        let batch = self
            .batches
            .get_mut(batch_key)
            .ok_or_else(|| LedgerError::UnknownBatch(batch_key.to_string()))?;
        if batch.state != BatchState::CloseAttempted || batch.cycle != cycle {
            return Ok(false);
        }
        let closing = std::mem::take(&mut batch.closing_members);
        batch.state = BatchState::Archived;
        batch.record_id = Some(record_id.to_string());
        batch.history.push(ArchivedCycle {
            cycle,
            record_id: record_id.to_string(),
            members: closing.len(),
            archived_at_epoch_secs: now,
        });
        let members = batch.members.clone();

        for key in &closing {
            if let Some(record) = self.artifacts.get_mut(key)
                && !record.archived
            {
                record.archived = true;
                record.archived_in = Some(dataset_id.to_string());
            }
        }

        let late_joiners = members.iter().any(|k| {
            self.artifacts
                .get(k)
                .is_some_and(ArtifactRecord::eligible_for_batch)
        });
        if late_joiners && let Some(batch) = self.batches.get_mut(batch_key) {
            batch.state = BatchState::Open;
            batch.cycle += 1;
        }
        Ok(true)
    }

    pub fn fail_batch(&mut self, batch_key: &str, cycle: u32, error: &str) -> bool {
        let Some(batch) = self.batches.get_mut(batch_key) else {
            return false;
        };
        if batch.state != BatchState::CloseAttempted || batch.cycle != cycle {
            return false;
        }
        batch.state = BatchState::Failed;
        batch.last_error = Some(error.to_string());
        true
    }

    /// Operator re-arm of a failed batch. The cycle, and therefore the dataset id, is kept.
    pub fn rearm_batch(&mut self, batch_key: &str) -> Result<bool, LedgerError> {
        let batch = self
            .batches
            .get_mut(batch_key)
            .ok_or_else(|| LedgerError::UnknownBatch(batch_key.to_string()))?;
        if batch.state != BatchState::Failed {
            return Ok(false);
        }
        batch.state = BatchState::Open;
        batch.closing_members.clear();
        Ok(true)
    }

    /// Rebuilds batch membership from artifact records. Batches are derived data.
    pub fn reconcile_batches(&mut self) -> usize {
        let mut added = 0usize;
        let assignments = self
            .artifacts
            .iter()
            .filter(|(_, r)| !r.not_an_artifact)
            .map(|(k, r)| (r.batch_slot().to_string(), k.clone(), r.observed_at_epoch_secs))
            .collect::<Vec<_>>();
        for (slot, key, observed) in assignments {
            let batch = self.batches.entry(slot).or_default();
            if batch.members.insert(key) {
                batch.last_observed_epoch_secs = batch.last_observed_epoch_secs.max(observed);
                added += 1;
            }
        }
        added
    }

    pub fn counts(&self) -> LedgerCounts {
        let mut out = LedgerCounts::default();
        for record in self.artifacts.values() {
            if record.not_an_artifact {
                out.unrecognized += 1;
                continue;
            }
            out.artifacts += 1;
            if record.archived {
                out.archived_artifacts += 1;
            }
            for progress in record.stages.values() {
                if progress.result_id.is_some() {
                    out.stage_results += 1;
                } else if !progress.is_placeholder() {
                    out.stage_pending += 1;
                }
            }
        }
        for batch in self.batches.values() {
            match batch.state {
                BatchState::Open => out.batches_open += 1,
                BatchState::CloseAttempted => out.batches_closing += 1,
                BatchState::Failed => out.batches_failed += 1,
                BatchState::Archived => out.batches_archived += 1,
            }
        }
        out
    }
}

/// On-disk home of the ledger snapshot.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file is an empty ledger; malformed content is an error.
    pub fn load(&self) -> Result<PipelineLedger> {
        if !self.path.exists() {
            return Ok(PipelineLedger::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut ledger: PipelineLedger = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        ledger.reconcile_batches();
        Ok(ledger)
    }

    /// Like [`load`](Self::load) but a corrupt snapshot is moved aside and replaced by
    /// an empty ledger. The returned string describes what happened.
    pub fn load_or_recover(&self, now: u64) -> (PipelineLedger, Option<String>) {
        match self.load() {
            Ok(ledger) => (ledger, None),
            Err(err) => {
                let aside = self.path.with_extension(format!("corrupt-{now}.json"));
                let moved = fs::rename(&self.path, &aside).is_ok();
                let note = if moved {
                    format!("{err:#}; moved to {}", aside.display())
                } else {
                    format!("{err:#}; could not move aside")
                };
                (PipelineLedger::default(), Some(note))
            }
        }
    }

    /// Full-snapshot write through a temporary file in the same directory.
    pub fn persist(&self, ledger: &PipelineLedger) -> Result<()> {
        write_json_atomically(&self.path, ledger)
            .with_context(|| format!("failed to persist ledger {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn patch(batch: Option<&str>) -> ArtifactPatch {
        ArtifactPatch {
            raw_path: Some("/raw/movie.mrc".to_string()),
            batch_key: batch.map(str::to_string),
            sequence: Some(1),
            ..ArtifactPatch::default()
        }
    }

    #[test]
    fn mark_stage_complete_is_idempotent() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);

        assert_eq!(
            ledger.mark_stage_complete("m1", "ctf", "rec-1"),
            Ok(StageMark::Recorded)
        );
        let after_first = ledger.clone();
        assert_eq!(
            ledger.mark_stage_complete("m1", "ctf", "rec-1"),
            Ok(StageMark::Unchanged)
        );
        assert_eq!(ledger, after_first);
    }

    #[test]
    fn conflicting_result_id_is_surfaced_not_overwritten() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        ledger.mark_stage_complete("m1", "ctf", "rec-1").expect("first");

        let err = ledger
            .mark_stage_complete("m1", "ctf", "rec-2")
            .expect_err("conflict");
        assert!(matches!(err, LedgerError::ConflictingResult { .. }));
        assert_eq!(
            ledger.artifacts["m1"].stages["ctf"].result_id.as_deref(),
            Some("rec-1")
        );
    }

    #[test]
    fn unknown_artifact_cannot_be_marked() {
        let mut ledger = PipelineLedger::default();
        assert_eq!(
            ledger.mark_stage_complete("ghost", "ctf", "rec"),
            Err(LedgerError::UnknownArtifact("ghost".to_string()))
        );
    }

    #[test]
    fn upsert_never_clears_known_attributes() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact(
            "m1",
            ArtifactPatch {
                position: Some(StagePosition { x: 1.0, y: 2.0 }),
                ..patch(Some("G1"))
            },
            5,
        );
        ledger
            .record_stage_output("m1", "mc", &[], "/proc/m1.mrc", BTreeMap::new(), 5)
            .expect("stage");
        ledger.mark_stage_complete("m1", "mc", "rec-9").expect("mark");

        let outcome = ledger.upsert_artifact("m1", ArtifactPatch::default(), 9);
        assert!(!outcome.created);
        let record = &ledger.artifacts["m1"];
        assert_eq!(record.batch_key.as_deref(), Some("G1"));
        assert_eq!(record.position, Some(StagePosition { x: 1.0, y: 2.0 }));
        assert_eq!(record.stages["mc"].result_id.as_deref(), Some("rec-9"));
        assert_eq!(record.observed_at_epoch_secs, 5);
    }

    #[test]
    fn later_stage_first_fills_placeholders() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", ArtifactPatch::default(), 0);
        let fresh = ledger
            .record_stage_output(
                "m1",
                "ctf",
                &["import", "mc"],
                "/proc/ctf/m1.txt",
                BTreeMap::new(),
                0,
            )
            .expect("record");
        assert!(fresh);
        let record = &ledger.artifacts["m1"];
        assert!(record.stages["import"].is_placeholder());
        assert!(record.stages["mc"].is_placeholder());
        assert!(!record.stages["ctf"].is_placeholder());

        let filled = ledger
            .record_stage_output("m1", "mc", &["import"], "/proc/mc/m1.mrc", BTreeMap::new(), 3)
            .expect("fill placeholder");
        assert!(filled);
        assert!(ledger.has_stage_output("m1", "mc"));
        let again = ledger
            .record_stage_output("m1", "mc", &["import"], "/proc/mc/m1.mrc", BTreeMap::new(), 4)
            .expect("repeat");
        assert!(!again);
    }

    #[test]
    fn unrecognized_files_are_recorded_once() {
        let mut ledger = PipelineLedger::default();
        assert!(ledger.record_unrecognized("/raw/gain.mrc", "no-grammar-matched", 1));
        assert!(!ledger.record_unrecognized("/raw/gain.mrc", "no-grammar-matched", 2));
        assert_eq!(ledger.artifacts.len(), 1);
        assert!(ledger.artifacts["/raw/gain.mrc"].not_an_artifact);
        assert!(ledger.batches.is_empty());
    }

    #[test]
    fn close_then_confirm_archives_exactly_once() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        ledger.upsert_artifact("m2", patch(Some("G1")), 10);

        let snap = ledger.close_batch("G1", 50).expect("close").expect("snapshot");
        assert_eq!(snap.members.len(), 2);
        assert_eq!(ledger.batches["G1"].state, BatchState::CloseAttempted);
        assert_eq!(ledger.close_batch("G1", 51).expect("second close"), None);

        assert!(ledger
            .confirm_batch_archived("G1", snap.cycle, "ds", "rec-G1", 60)
            .expect("confirm"));
        assert!(!ledger
            .confirm_batch_archived("G1", snap.cycle, "ds", "rec-G1", 61)
            .expect("repeat confirm"));
        let batch = &ledger.batches["G1"];
        assert!(batch.is_archived());
        assert_eq!(batch.history.len(), 1);
        assert!(ledger.artifacts["m1"].archived);
        assert_eq!(ledger.artifacts["m2"].archived_in.as_deref(), Some("ds"));
    }

    #[test]
    fn member_joining_archived_batch_opens_new_cycle() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        let snap = ledger.close_batch("G1", 50).expect("close").expect("snap");
        ledger
            .confirm_batch_archived("G1", snap.cycle, "ds0", "rec-0", 51)
            .expect("confirm");

        let outcome = ledger.upsert_artifact("m3", patch(Some("G1")), 70);
        assert!(outcome.reopened_batch);
        let batch = &ledger.batches["G1"];
        assert_eq!(batch.state, BatchState::Open);
        assert_eq!(batch.cycle, 1);

        let next = ledger.close_batch("G1", 200).expect("close").expect("snap");
        assert_eq!(next.cycle, 1);
        assert_eq!(next.members.len(), 1);
        assert_eq!(next.members[0].0, "m3");
    }

    #[test]
    fn member_joining_during_close_rolls_into_next_cycle() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        let snap = ledger.close_batch("G1", 50).expect("close").expect("snap");
        ledger.upsert_artifact("m2", patch(Some("G1")), 55);
        ledger
            .confirm_batch_archived("G1", snap.cycle, "ds0", "rec-0", 60)
            .expect("confirm");

        let batch = &ledger.batches["G1"];
        assert_eq!(batch.state, BatchState::Open);
        assert_eq!(batch.cycle, 1);
        assert!(!ledger.artifacts["m2"].archived);
        assert!(ledger.artifacts["m1"].archived);
    }

    #[test]
    fn failed_batch_waits_for_operator() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        let snap = ledger.close_batch("G1", 50).expect("close").expect("snap");
        assert!(ledger.fail_batch("G1", snap.cycle, "catalog down"));
        assert_eq!(ledger.close_batch("G1", 99).expect("close"), None);

        assert!(ledger.rearm_batch("G1").expect("rearm"));
        let again = ledger.close_batch("G1", 100).expect("close").expect("snap");
        assert_eq!(again.cycle, snap.cycle);
    }

    #[test]
    fn member_joining_failed_batch_is_held_not_reopened() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        let snap = ledger.close_batch("G1", 50).expect("close").expect("snap");
        assert!(ledger.fail_batch("G1", snap.cycle, "catalog down"));

        let late = ledger.upsert_artifact("m2", patch(Some("G1")), 60);
        assert!(late.held_by_failed_batch);
        assert!(!late.reopened_batch);
        assert_eq!(ledger.batches["G1"].state, BatchState::Failed);
        assert_eq!(ledger.batches["G1"].cycle, snap.cycle);

        let again = ledger.upsert_artifact("m2", patch(Some("G1")), 70);
        assert!(!again.held_by_failed_batch);
    }

    #[test]
    fn empty_batch_produces_no_snapshot() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 0);
        ledger.artifacts.get_mut("m1").expect("m1").archived = true;
        assert_eq!(ledger.close_batch("G1", 100).expect("close"), None);
        assert_eq!(ledger.batches["G1"].state, BatchState::Open);
    }

    #[test]
    fn ungrouped_artifact_moves_to_its_batch_once_known() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", ArtifactPatch::default(), 0);
        assert!(ledger.batches[UNGROUPED_BATCH_KEY].members.contains("m1"));

        ledger.upsert_artifact("m1", patch(Some("G7")), 5);
        assert!(!ledger.batches[UNGROUPED_BATCH_KEY].members.contains("m1"));
        assert!(ledger.batches["G7"].members.contains("m1"));
    }

    #[test]
    fn reconcile_rebuilds_missing_batches() {
        let mut ledger = PipelineLedger::default();
        ledger.upsert_artifact("m1", patch(Some("G1")), 3);
        ledger.upsert_artifact("m2", patch(Some("G2")), 4);
        ledger.batches.clear();

        assert_eq!(ledger.reconcile_batches(), 2);
        assert_eq!(ledger.batches["G1"].last_observed_epoch_secs, 3);
        assert!(ledger.batches["G2"].members.contains("m2"));
    }

    #[test]
    fn persist_then_load_round_trips_including_unknown_fields() {
        let tmp = tempdir().expect("tempdir");
        let store = LedgerStore::new(tmp.path().join("state/ledger.json"));

        let mut ledger = PipelineLedger::default();
        ledger.set_metadata("proposal", json!("mx2112"));
        ledger.upsert_artifact(
            "m1",
            ArtifactPatch {
                position: Some(StagePosition {
                    x: 6.77869113934214e-9,
                    y: -4.123456789012345e-4,
                }),
                acquired_at_epoch_secs: Some(1_710_152_130),
                tilt_angle: Some(-3.0),
                suffix: Some("_Fractions".to_string()),
                ..patch(Some("G1"))
            },
            7,
        );
        // Stage coordinates in metres across the +-1 mm travel range.
        for idx in 0..500u32 {
            let t = f64::from(idx);
            ledger.upsert_artifact(
                &format!("sweep{idx}"),
                ArtifactPatch {
                    position: Some(StagePosition {
                        x: (t * 0.7071067811865476).sin() * 1e-3,
                        y: (t * 1.618033988749895).cos() * 9.99e-4 / 3.0,
                    }),
                    ..patch(Some("G2"))
                },
                7,
            );
        }
        let mut meta = BTreeMap::new();
        meta.insert("defocus_u".to_string(), json!(12345.6));
        meta.insert("total_drift".to_string(), json!(0.1 + 0.2));
        meta.insert("resolution_limit".to_string(), Value::Null);
        ledger
            .record_stage_output("m1", "ctf", &["mc"], "/proc/m1.txt", meta, 8)
            .expect("stage");
        ledger.mark_stage_complete("m1", "ctf", "rec-1").expect("mark");
        ledger.record_unrecognized("/raw/notes.txt", "no-grammar-matched", 9);
        ledger
            .artifacts
            .get_mut("m1")
            .expect("m1")
            .extra
            .insert("future_field".to_string(), json!({"nested": [1, 2]}));
        ledger
            .extra
            .insert("written_by".to_string(), json!("newer-build"));

        store.persist(&ledger).expect("persist");
        let loaded = store.load().expect("load");
        let position = loaded.artifacts["m1"].position.expect("position");
        assert_eq!(position.x.to_bits(), 6.77869113934214e-9f64.to_bits());
        assert_eq!(loaded.artifacts["m1"].suffix.as_deref(), Some("_Fractions"));
        for (key, record) in &ledger.artifacts {
            assert_eq!(loaded.artifacts[key].position, record.position, "{key}");
        }
        assert_eq!(loaded, ledger);
    }

    #[test]
    fn unknown_fields_from_disk_survive_a_rewrite() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.json");
        fs::write(
            &path,
            r#"{"schema_version":1,"artifacts":{"m1":{"observed_at_epoch_secs":4,"batch_key":"G1","ice_thickness_nm":38.5}},"operator_note":"keep me"}"#,
        )
        .expect("write");
        let store = LedgerStore::new(&path);
        let ledger = store.load().expect("load");
        assert_eq!(ledger.artifacts["m1"].extra["ice_thickness_nm"], json!(38.5));
        assert!(ledger.batches["G1"].members.contains("m1"));

        store.persist(&ledger).expect("persist");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("ice_thickness_nm"));
        assert!(raw.contains("operator_note"));
    }

    #[test]
    fn missing_snapshot_loads_empty() {
        let tmp = tempdir().expect("tempdir");
        let store = LedgerStore::new(tmp.path().join("nope.json"));
        assert_eq!(store.load().expect("load"), PipelineLedger::default());
    }

    #[test]
    fn corrupt_snapshot_is_moved_aside() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("ledger.json");
        fs::write(&path, "{ not json").expect("write");
        let store = LedgerStore::new(&path);
        assert!(store.load().is_err());

        let (ledger, note) = store.load_or_recover(42);
        assert_eq!(ledger, PipelineLedger::default());
        assert!(note.expect("note").contains("failed to parse"));
        assert!(!path.exists());
        assert!(tmp.path().join("ledger.corrupt-42.json").exists());
    }

    #[test]
    fn persist_replaces_previous_snapshot() {
        let tmp = tempdir().expect("tempdir");
        let store = LedgerStore::new(tmp.path().join("ledger.json"));
        let mut ledger = PipelineLedger::default();
        store.persist(&ledger).expect("first");
        ledger.upsert_artifact("m1", patch(Some("G1")), 1);
        store.persist(&ledger).expect("second");
        assert_eq!(store.load().expect("load").artifacts.len(), 1);
        let leftovers = fs::read_dir(tmp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1);
    }
}
