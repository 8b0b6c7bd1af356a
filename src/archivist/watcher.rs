//! The poll loop. One thread owns the ledger; every tick discovers new stage
//! outputs, closes quiescent batches, hands work to the pool and persists.

use crate::archivist::archive::{Archiver, Completion, RetryPolicy, StageResultUnit, WorkUnit};
use crate::archivist::audit;
use crate::archivist::batches;
use crate::archivist::config::{ArchivistConfig, StageArchival, StageConfig, StageKind, load_config};
use crate::archivist::extract::{ExtractRequest, ExtractionOutcome, extract};
use crate::archivist::identity::{Resolution, Resolver};
use crate::archivist::ledger::{
    ArtifactPatch, BatchState, LedgerCounts, LedgerStore, PipelineLedger, StageMark,
};
use crate::archivist::paths::{ArchivistPaths, resolve_paths};
use crate::archivist::pool::WorkerPool;
use crate::archivist::stages::{DirectoryStageSource, StageSource};
use crate::archivist::util::now_epoch_secs;
use crate::archivist::wait::{Deadlines, WaitOutcome};
use crate::archivist::warn::{self, WarnEvent};
use crate::backend::{ArchiveBackend, build_backend};
use crate::error::ArchivistErrorCode;
use anyhow::Result;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickOutcome {
    pub tick: u64,
    pub now_epoch_secs: u64,
    pub new_artifacts: usize,
    pub new_unrecognized: usize,
    pub stage_outputs: usize,
    pub sidecars_missing: usize,
    /// Outputs whose sidecar has not appeared yet; looked at again next tick.
    pub sidecars_pending: usize,
    pub source_errors: usize,
    pub closed_batches: Vec<String>,
    pub dispatched: usize,
    /// Units a saturated lane refused this tick.
    pub deferred: usize,
    pub completions: CompletionTally,
    pub in_flight: usize,
    pub active: bool,
    pub finished: bool,
    pub persisted: bool,
    pub counts: LedgerCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompletionTally {
    pub batches_archived: usize,
    pub results_recorded: usize,
    pub failed: usize,
    pub stale: usize,
}

impl CompletionTally {
    fn absorb(&mut self, other: CompletionTally) {
        self.batches_archived += other.batches_archived;
        self.results_recorded += other.results_recorded;
        self.failed += other.failed;
        self.stale += other.stale;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ledger_file: String,
    pub backend: String,
    pub ticks: u64,
    pub finished: bool,
    pub hit_max_run: bool,
    pub flushed_batches: Vec<String>,
    pub drained: CompletionTally,
    pub abandoned: usize,
    /// Ledger counts after the drain.
    pub counts: LedgerCounts,
    pub last_tick: TickOutcome,
}

fn session_metadata(cfg: &ArchivistConfig) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    if let Some(v) = &cfg.session.proposal {
        out.insert("proposal".to_string(), json!(v));
    }
    if let Some(v) = &cfg.session.session_name {
        out.insert("session_name".to_string(), json!(v));
    }
    if let Some(v) = &cfg.session.instrument {
        out.insert("instrument".to_string(), json!(v));
    }
    for (k, v) in &cfg.session.extra {
        out.insert(k.clone(), json!(v));
    }
    out.insert(
        "acquisition_mode".to_string(),
        json!(cfg.acquisition.mode.as_str()),
    );
    out
}

pub struct Monitor {
    cfg: ArchivistConfig,
    paths: ArchivistPaths,
    store: LedgerStore,
    ledger: PipelineLedger,
    resolver: Resolver,
    source: Box<dyn StageSource>,
    pool: WorkerPool,
    backend_name: &'static str,
    in_flight: BTreeSet<String>,
    sidecar_waits: Deadlines,
    ticks: u64,
}

impl Monitor {
    pub fn new(
        cfg: ArchivistConfig,
        paths: ArchivistPaths,
        source: Box<dyn StageSource>,
        backend: Arc<dyn ArchiveBackend>,
        now: u64,
    ) -> Result<Self> {
        let resolver = Resolver::new(
            cfg.acquisition.mode,
            &cfg.acquisition.grammars,
            &cfg.acquisition.timezone,
            cfg.acquisition.require_existing_files,
        )?;
        let store = LedgerStore::new(&paths.ledger_file);
        let (mut ledger, recovered) = store.load_or_recover(now);
        if let Some(note) = recovered {
            warn::emit(WarnEvent {
                code: ArchivistErrorCode::E002LedgerCorrupt,
                stage: "load",
                action: "start-empty",
                key: &store.path().display().to_string(),
                retry: "none",
                reason: "unreadable-snapshot",
                err: &note,
            });
            audit::record(&paths, "load", "degraded", &note);
        }

        let session = session_metadata(&cfg);
        for (k, v) in &session {
            ledger.set_metadata(k, v.clone());
        }

        let backend_name = backend.name();
        let archiver = Archiver::new(
            backend,
            RetryPolicy {
                max_attempts: cfg.archive.max_attempts,
                delay: Duration::from_millis(cfg.archive.retry_delay_ms),
            },
            &cfg.archive.dataset_prefix,
            paths.staging_dir.clone(),
            session,
        );
        let pool = WorkerPool::start(
            Arc::new(archiver),
            cfg.archive.batch_workers,
            cfg.archive.artifact_workers,
        )?;

        let sidecar_waits = Deadlines::new(cfg.monitor.sidecar_wait_secs);
        Ok(Self {
            cfg,
            paths,
            store,
            ledger,
            resolver,
            source,
            pool,
            backend_name,
            in_flight: BTreeSet::new(),
            sidecar_waits,
            ticks: 0,
        })
    }

    /// Monitor wired to the configured directories and backend.
    pub fn from_environment() -> Result<Self> {
        let paths = resolve_paths()?;
        let cfg = match load_config(&paths) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn::emit(WarnEvent {
                    code: ArchivistErrorCode::E001ConfigInvalid,
                    stage: "startup",
                    action: "abort",
                    key: &paths.config_file.display().to_string(),
                    retry: "none",
                    reason: "invalid-config",
                    err: &format!("{err:#}"),
                });
                return Err(err);
            }
        };
        let backend = build_backend(&cfg.archive, &paths)?;
        Self::new(
            cfg,
            paths,
            Box::new(DirectoryStageSource),
            backend,
            now_epoch_secs()?,
        )
    }

    pub fn ledger(&self) -> &PipelineLedger {
        &self.ledger
    }

    pub fn tick(&mut self, now: u64) -> Result<TickOutcome> {
        self.ticks += 1;
        let mut out = TickOutcome {
            tick: self.ticks,
            now_epoch_secs: now,
            ..TickOutcome::default()
        };

        for completion in self.pool.try_drain() {
            let tally = self.apply_completion(completion, now);
            out.completions.absorb(tally);
        }

        let stages = self.cfg.stages.clone();
        let mut any_active = false;
        for (idx, stage) in stages.iter().enumerate() {
            let prerequisites = stages[..idx]
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>();
            match self.source.list_outputs(stage) {
                Ok(outputs) => {
                    for path in outputs {
                        self.observe(stage, &prerequisites, &path, now, &mut out);
                    }
                }
                Err(err) => {
                    out.source_errors += 1;
                    any_active = true;
                    self.warn_source(stage, "list-outputs", &format!("{err:#}"));
                }
            }
            match self.source.is_stage_active(stage) {
                Ok(active) => any_active |= active,
                Err(err) => {
                    any_active = true;
                    self.warn_source(stage, "liveness", &format!("{err:#}"));
                }
            }
        }
        audit::record(
            &self.paths,
            "discover",
            if out.source_errors == 0 { "ok" } else { "degraded" },
            &format!(
                "tick={} new_artifacts={} new_unrecognized={} stage_outputs={} sidecars_missing={} sidecars_pending={}",
                out.tick,
                out.new_artifacts,
                out.new_unrecognized,
                out.stage_outputs,
                out.sidecars_missing,
                out.sidecars_pending
            ),
        );

        self.dispatch_stage_results(&mut out)?;
        self.redispatch_closing_batches(&mut out)?;
        for batch_key in batches::evaluate(&self.ledger, now, self.cfg.batching.quiescence_timeout_secs) {
            self.close_and_dispatch(&batch_key, now, &mut out)?;
        }
        if !out.closed_batches.is_empty() {
            audit::record(
                &self.paths,
                "batch",
                "ok",
                &format!("closed={}", out.closed_batches.join(",")),
            );
        }

        out.persisted = self.persist();
        out.active = any_active;
        // An output still waiting on its sidecar keeps the run alive.
        out.finished = !any_active && self.sidecar_waits.pending() == 0;
        out.in_flight = self.pool.outstanding();
        out.counts = self.ledger.counts();
        eprintln!("{}", status_line(&out, self.ledger.batches.len()));
        Ok(out)
    }

    fn warn_source(&self, stage: &StageConfig, action: &str, err: &str) {
        warn::emit(WarnEvent {
            code: ArchivistErrorCode::E004StageUnavailable,
            stage: &stage.name,
            action,
            key: &stage.output_dir.display().to_string(),
            retry: "next-tick",
            reason: "source-error",
            err,
        });
    }

    fn observe(
        &mut self,
        stage: &StageConfig,
        prerequisites: &[&str],
        path: &Path,
        now: u64,
        out: &mut TickOutcome,
    ) {
        let identity = match self.resolver.resolve(path) {
            Resolution::Artifact(identity) => identity,
            Resolution::NotAnArtifact { key, reason } => {
                if self.ledger.record_unrecognized(&key, &reason, now) {
                    out.new_unrecognized += 1;
                }
                return;
            }
        };
        if self.ledger.has_stage_output(&identity.key, &stage.name) {
            return;
        }

        let extraction = extract(&ExtractRequest {
            kind: stage.kind,
            key: &identity.key,
            output_path: path,
            working_dir: stage.working_dir.as_deref(),
        });
        let wait_slot = format!("{}:{}", stage.name, identity.key);
        let on_disk = extraction.outcome != ExtractionOutcome::Missing;
        let sidecar_problem = match self.sidecar_waits.check(&wait_slot, now, on_disk) {
            // Nothing is recorded until the sidecar shows up or the wait runs out.
            WaitOutcome::Pending { .. } => {
                out.sidecars_pending += 1;
                return;
            }
            WaitOutcome::GaveUp { waited_secs } => {
                Some(("missing", format!("gave up after {waited_secs}s")))
            }
            WaitOutcome::Ready { .. } => match &extraction.outcome {
                ExtractionOutcome::Unparsable(reason) => {
                    let file = extraction
                        .sidecar
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    Some(("unparsable", format!("{file}: {reason}")))
                }
                ExtractionOutcome::Parsed | ExtractionOutcome::Missing => None,
            },
        };
        if let Some((reason, err)) = sidecar_problem {
            out.sidecars_missing += 1;
            warn::emit(WarnEvent {
                code: ArchivistErrorCode::E005SidecarMissing,
                stage: &stage.name,
                action: "null-fields",
                key: &identity.key,
                retry: "none",
                reason,
                err: &err,
            });
        }

        let output_path = path.display().to_string();
        let patch = ArtifactPatch {
            raw_path: (stage.kind == StageKind::Import).then(|| output_path.clone()),
            batch_key: identity.batch_key.clone(),
            sequence: Some(identity.sequence),
            acquired_at_epoch_secs: identity.acquired_at_epoch_secs,
            position: extraction.position,
            tilt_angle: identity.tilt_angle,
            grammar: Some(identity.grammar.clone()),
            suffix: identity.suffix.clone(),
        };
        let upsert = self.ledger.upsert_artifact(&identity.key, patch, now);
        if upsert.created {
            out.new_artifacts += 1;
        }
        if upsert.reopened_batch
            && let Some(record) = self.ledger.artifact(&identity.key)
        {
            audit::record(
                &self.paths,
                "batch",
                "reopened",
                &format!("batch={} member={}", record.batch_slot(), identity.key),
            );
        }
        if upsert.held_by_failed_batch
            && let Some(record) = self.ledger.artifact(&identity.key)
        {
            let batch = record.batch_slot().to_string();
            warn::emit(WarnEvent {
                code: ArchivistErrorCode::E008BatchHeld,
                stage: &stage.name,
                action: "hold",
                key: &identity.key,
                retry: "retry-batch",
                reason: "batch-failed",
                err: &format!("member joined failed batch {batch}"),
            });
            audit::record(
                &self.paths,
                "batch",
                "held",
                &format!("batch={batch} member={}", identity.key),
            );
        }

        match self.ledger.record_stage_output(
            &identity.key,
            &stage.name,
            prerequisites,
            &output_path,
            extraction.metadata,
            now,
        ) {
            Ok(true) => out.stage_outputs += 1,
            Ok(false) => {}
            Err(err) => warn::emit(WarnEvent {
                code: ArchivistErrorCode::E007LedgerConflict,
                stage: &stage.name,
                action: "skip",
                key: &identity.key,
                retry: "none",
                reason: "record-stage-output",
                err: &err.to_string(),
            }),
        }
    }

    /// Offers `unit` to its lane. A refused unit stays out of `in_flight`, so the
    /// ledger state that produced it sends it again on a later tick.
    fn dispatch(&mut self, unit: WorkUnit, out: &mut TickOutcome) -> Result<()> {
        let slot = unit.slot();
        if self.in_flight.contains(&slot) {
            return Ok(());
        }
        if self.pool.try_submit(unit)? {
            self.in_flight.insert(slot);
            out.dispatched += 1;
        } else {
            out.deferred += 1;
        }
        Ok(())
    }

    /// Stage outputs with no result id yet. Failed uploads come back here next tick.
    fn dispatch_stage_results(&mut self, out: &mut TickOutcome) -> Result<()> {
        let per_artifact = self
            .cfg
            .stages
            .iter()
            .filter(|s| s.archival == StageArchival::PerArtifact)
            .map(|s| s.name.clone())
            .collect::<Vec<_>>();
        let mut units = Vec::new();
        for (key, record) in &self.ledger.artifacts {
            if record.not_an_artifact {
                continue;
            }
            for stage in &per_artifact {
                let Some(progress) = record.stages.get(stage) else {
                    continue;
                };
                let Some(output_path) = progress.output_path.as_deref() else {
                    continue;
                };
                if progress.result_id.is_some() {
                    continue;
                }
                units.push(WorkUnit::StageResult(StageResultUnit {
                    key: key.clone(),
                    stage: stage.clone(),
                    output_path: output_path.into(),
                    batch_key: record.batch_key.clone(),
                    metadata: progress.metadata.clone(),
                }));
            }
        }
        for unit in units {
            self.dispatch(unit, out)?;
        }
        Ok(())
    }

    /// Batches left in close-attempted by an earlier run go out again with the same cycle.
    fn redispatch_closing_batches(&mut self, out: &mut TickOutcome) -> Result<()> {
        let pending = self
            .ledger
            .batches
            .iter()
            .filter(|(key, b)| {
                b.state == BatchState::CloseAttempted
                    && !self.in_flight.contains(&format!("batch:{key}"))
            })
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in pending {
            if let Some(snapshot) = self.ledger.closing_snapshot(&key) {
                self.dispatch(WorkUnit::Batch(snapshot), out)?;
            }
        }
        Ok(())
    }

    fn close_and_dispatch(&mut self, batch_key: &str, now: u64, out: &mut TickOutcome) -> Result<()> {
        match self.ledger.close_batch(batch_key, now) {
            Ok(Some(snapshot)) => {
                out.closed_batches.push(batch_key.to_string());
                self.dispatch(WorkUnit::Batch(snapshot), out)
            }
            Ok(None) => Ok(()),
            Err(err) => {
                warn::emit(WarnEvent {
                    code: ArchivistErrorCode::E007LedgerConflict,
                    stage: "batch",
                    action: "skip",
                    key: batch_key,
                    retry: "none",
                    reason: "close-batch",
                    err: &err.to_string(),
                });
                Ok(())
            }
        }
    }

    fn apply_completion(&mut self, completion: Completion, now: u64) -> CompletionTally {
        self.in_flight.remove(&completion.slot());
        let mut tally = CompletionTally::default();
        match completion {
            Completion::BatchArchived {
                batch_key,
                cycle,
                dataset_id,
                record_id,
                attempts,
            } => match self
                .ledger
                .confirm_batch_archived(&batch_key, cycle, &dataset_id, &record_id, now)
            {
                Ok(true) => {
                    tally.batches_archived += 1;
                    audit::record(
                        &self.paths,
                        "archive",
                        "ok",
                        &format!(
                            "batch={batch_key} cycle={cycle} dataset={dataset_id} record={record_id} attempts={attempts}"
                        ),
                    );
                }
                Ok(false) => tally.stale += 1,
                Err(err) => self.warn_conflict("batch", &batch_key, &err.to_string()),
            },
            Completion::BatchFailed {
                batch_key,
                cycle,
                error,
                attempts,
            } => {
                if self.ledger.fail_batch(&batch_key, cycle, &error) {
                    tally.failed += 1;
                    audit::record(
                        &self.paths,
                        "archive",
                        "failed",
                        &format!("batch={batch_key} cycle={cycle} attempts={attempts} error={error}"),
                    );
                } else {
                    tally.stale += 1;
                }
            }
            Completion::StageArchived {
                key,
                stage,
                record_id,
                ..
            } => match self.ledger.mark_stage_complete(&key, &stage, &record_id) {
                Ok(StageMark::Recorded) => tally.results_recorded += 1,
                Ok(StageMark::Unchanged) => tally.stale += 1,
                Err(err) => self.warn_conflict(&stage, &key, &err.to_string()),
            },
            Completion::StageFailed {
                key,
                stage,
                error,
                attempts,
            } => {
                tally.failed += 1;
                self.ledger.record_upload_failure(&key, &stage, &error);
                audit::record(
                    &self.paths,
                    "archive",
                    "degraded",
                    &format!("stage={stage} artifact={key} attempts={attempts} error={error}"),
                );
            }
        }
        tally
    }

    fn warn_conflict(&self, stage: &str, key: &str, err: &str) {
        warn::emit(WarnEvent {
            code: ArchivistErrorCode::E007LedgerConflict,
            stage,
            action: "ignore-completion",
            key,
            retry: "none",
            reason: "ledger-rejected",
            err,
        });
    }

    /// Writes the snapshot. A failure keeps the in-memory state for the next attempt.
    fn persist(&self) -> bool {
        match self.store.persist(&self.ledger) {
            Ok(()) => true,
            Err(err) => {
                let err = format!("{err:#}");
                warn::emit(WarnEvent {
                    code: ArchivistErrorCode::E003PersistFailed,
                    stage: "persist",
                    action: "keep-in-memory",
                    key: &self.store.path().display().to_string(),
                    retry: "next-tick",
                    reason: "write-failed",
                    err: &err,
                });
                audit::record(&self.paths, "persist", "degraded", &err);
                false
            }
        }
    }

    /// Closes every open batch regardless of quiescence. Used once the pipeline has
    /// finished, when no further members can arrive.
    pub fn flush_open_batches(&mut self, now: u64) -> Result<Vec<String>> {
        let open = self
            .ledger
            .batches
            .iter()
            .filter(|(_, b)| b.state == BatchState::Open)
            .map(|(k, _)| k.clone())
            .collect::<Vec<_>>();
        let mut out = TickOutcome::default();
        for key in open {
            self.close_and_dispatch(&key, now, &mut out)?;
        }
        Ok(out.closed_batches)
    }

    /// Waits up to `grace` for in-flight work, applies what came back and persists.
    /// Closed batches a full lane turned away are offered again while time remains.
    pub fn drain(&mut self, grace: Duration, now: u64) -> CompletionTally {
        let deadline = Instant::now() + grace;
        let mut tally = CompletionTally::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            for completion in self.pool.drain_for(remaining) {
                let applied = self.apply_completion(completion, now);
                tally.absorb(applied);
            }
            if Instant::now() >= deadline {
                break;
            }
            let mut out = TickOutcome::default();
            if let Err(err) = self.redispatch_closing_batches(&mut out) {
                audit::record(&self.paths, "drain", "degraded", &format!("{err:#}"));
                break;
            }
            if out.dispatched == 0 {
                break;
            }
        }
        self.persist();
        tally
    }

    /// Stops the workers; returns how many units were still running.
    pub fn shutdown(self) -> usize {
        self.pool.shutdown()
    }
}

fn status_line(out: &TickOutcome, batches: usize) -> String {
    format!(
        "ARCHIVIST_TICK tick={} artifacts={} unrecognized={} batches={} batches_archived={} results_archived={} failed={} in_flight={} deferred={} sidecars_pending={} active={}",
        out.tick,
        out.counts.artifacts,
        out.counts.unrecognized,
        batches,
        out.counts.batches_archived,
        out.counts.stage_results,
        out.counts.batches_failed,
        out.in_flight,
        out.deferred,
        out.sidecars_pending,
        out.active
    )
}

/// Drives `monitor` until the pipeline finishes, the run ceiling is reached, or after
/// one tick when `daemon` is false. In-flight work gets the drain grace period.
pub fn drive(mut monitor: Monitor, daemon: bool) -> Result<RunSummary> {
    let poll = Duration::from_secs(monitor.cfg.monitor.poll_interval_secs);
    let max_run = Duration::from_secs(monitor.cfg.monitor.max_run_secs);
    let grace = Duration::from_secs(monitor.cfg.monitor.drain_grace_secs);
    let started = Instant::now();
    let mut hit_max_run = false;

    let last_tick = loop {
        let outcome = monitor.tick(now_epoch_secs()?)?;
        if outcome.finished || !daemon {
            break outcome;
        }
        let elapsed = started.elapsed();
        if elapsed >= max_run {
            hit_max_run = true;
            break outcome;
        }
        thread::sleep(poll.min(max_run - elapsed));
        if started.elapsed() >= max_run {
            hit_max_run = true;
            break outcome;
        }
    };

    let flushed_batches = if last_tick.finished && !hit_max_run {
        monitor.flush_open_batches(now_epoch_secs()?)?
    } else {
        Vec::new()
    };
    let drained = monitor.drain(grace, now_epoch_secs()?);
    audit::record(
        &monitor.paths,
        "watch",
        if hit_max_run { "ceiling" } else { "ok" },
        &format!(
            "ticks={} finished={} flushed={} archived={} recorded={} failed={}",
            monitor.ticks,
            last_tick.finished,
            flushed_batches.len(),
            drained.batches_archived,
            drained.results_recorded,
            drained.failed
        ),
    );

    let ledger_file = monitor.store.path().display().to_string();
    let backend = monitor.backend_name.to_string();
    let ticks = monitor.ticks;
    let counts = monitor.ledger.counts();
    let abandoned = monitor.shutdown();
    Ok(RunSummary {
        ledger_file,
        backend,
        ticks,
        finished: last_tick.finished,
        hit_max_run,
        flushed_batches,
        drained,
        abandoned,
        counts,
        last_tick,
    })
}

pub fn run_once() -> Result<RunSummary> {
    drive(Monitor::from_environment()?, false)
}

pub fn run_daemon() -> Result<RunSummary> {
    drive(Monitor::from_environment()?, true)
}
