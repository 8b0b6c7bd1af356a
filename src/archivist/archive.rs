//! Archival work units and their execution against a backend.
//!
//! A unit carries a point-in-time copy of everything it needs, so workers never
//! read the ledger. The outcome comes back as a [`Completion`] that only the poll
//! loop applies.

use crate::archivist::ledger::{BatchSnapshot, StagePosition};
use crate::archivist::util::{sanitize_slug, write_json_atomically};
use crate::archivist::warn::{self, WarnEvent};
use crate::backend::ArchiveBackend;
use crate::error::{ArchivistErrorCode, BackendError};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    Batch,
    Artifact,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Artifact => "artifact",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageResultUnit {
    pub key: String,
    pub stage: String,
    pub output_path: PathBuf,
    pub batch_key: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    Batch(BatchSnapshot),
    StageResult(StageResultUnit),
}

impl WorkUnit {
    pub fn category(&self) -> Category {
        match self {
            Self::Batch(_) => Category::Batch,
            Self::StageResult(_) => Category::Artifact,
        }
    }

    /// Identity used to de-duplicate in-flight work.
    pub fn slot(&self) -> String {
        match self {
            Self::Batch(snapshot) => format!("batch:{}", snapshot.batch_key),
            Self::StageResult(unit) => format!("stage:{}:{}", unit.stage, unit.key),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    BatchArchived {
        batch_key: String,
        cycle: u32,
        dataset_id: String,
        record_id: String,
        attempts: u32,
    },
    BatchFailed {
        batch_key: String,
        cycle: u32,
        error: String,
        attempts: u32,
    },
    StageArchived {
        key: String,
        stage: String,
        record_id: String,
        attempts: u32,
    },
    StageFailed {
        key: String,
        stage: String,
        error: String,
        attempts: u32,
    },
}

impl Completion {
    pub fn slot(&self) -> String {
        match self {
            Self::BatchArchived { batch_key, .. } | Self::BatchFailed { batch_key, .. } => {
                format!("batch:{batch_key}")
            }
            Self::StageArchived { key, stage, .. } | Self::StageFailed { key, stage, .. } => {
                format!("stage:{stage}:{key}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

fn short_digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..12].to_string()
}

/// Stable per batch cycle, so a retried or re-dispatched upload addresses the same record.
pub fn batch_dataset_id(prefix: &str, batch_key: &str, cycle: u32) -> String {
    format!("{prefix}-batch-{}-c{cycle}", short_digest(batch_key))
}

pub fn stage_dataset_id(prefix: &str, key: &str, stage: &str) -> String {
    format!(
        "{prefix}-{}-{}",
        sanitize_slug(stage),
        short_digest(&format!("{stage}\u{0}{key}"))
    )
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ManifestMember<'a> {
    key: &'a str,
    raw_path: Option<&'a str>,
    sequence: Option<u64>,
    acquired_at_epoch_secs: Option<u64>,
    position: Option<StagePosition>,
    tilt_angle: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchManifest<'a> {
    dataset_id: &'a str,
    batch_key: &'a str,
    cycle: u32,
    mean_position: Option<StagePosition>,
    members: Vec<ManifestMember<'a>>,
}

pub struct Archiver {
    backend: Arc<dyn ArchiveBackend>,
    policy: RetryPolicy,
    dataset_prefix: String,
    staging_dir: Option<PathBuf>,
    session: BTreeMap<String, Value>,
}

impl Archiver {
    pub fn new(
        backend: Arc<dyn ArchiveBackend>,
        policy: RetryPolicy,
        dataset_prefix: &str,
        staging_dir: Option<PathBuf>,
        session: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            backend,
            policy,
            dataset_prefix: dataset_prefix.to_string(),
            staging_dir,
            session,
        }
    }

    pub fn execute(&self, unit: &WorkUnit) -> Completion {
        match unit {
            WorkUnit::Batch(snapshot) => self.archive_batch(snapshot),
            WorkUnit::StageResult(result) => self.archive_stage_result(result),
        }
    }

    fn archive_batch(&self, snapshot: &BatchSnapshot) -> Completion {
        let dataset_id = batch_dataset_id(&self.dataset_prefix, &snapshot.batch_key, snapshot.cycle);
        let raw_ids = snapshot
            .members
            .iter()
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        let mut metadata = self.session.clone();
        metadata.insert("batch_key".to_string(), json!(snapshot.batch_key));
        metadata.insert("cycle".to_string(), json!(snapshot.cycle));
        metadata.insert("member_count".to_string(), json!(raw_ids.len()));
        metadata.insert(
            "last_observed_epoch_secs".to_string(),
            json!(snapshot.last_observed_epoch_secs),
        );
        if let Some(mean) = snapshot.mean_position {
            metadata.insert("mean_stage_x".to_string(), json!(mean.x));
            metadata.insert("mean_stage_y".to_string(), json!(mean.y));
        }

        let label = format!("batch:{}", snapshot.batch_key);
        let (result, attempts) = self.with_retry(&label, || {
            let source = self.stage_batch(&dataset_id, snapshot)?;
            let record_id = self.backend.create_record(&dataset_id, &source, &metadata)?;
            self.backend.link_raw_data(&record_id, &raw_ids)?;
            Ok(record_id)
        });
        match result {
            Ok(record_id) => Completion::BatchArchived {
                batch_key: snapshot.batch_key.clone(),
                cycle: snapshot.cycle,
                dataset_id,
                record_id,
                attempts,
            },
            Err(err) => Completion::BatchFailed {
                batch_key: snapshot.batch_key.clone(),
                cycle: snapshot.cycle,
                error: err.to_string(),
                attempts,
            },
        }
    }

    fn archive_stage_result(&self, unit: &StageResultUnit) -> Completion {
        let dataset_id = stage_dataset_id(&self.dataset_prefix, &unit.key, &unit.stage);
        let mut metadata = self.session.clone();
        metadata.extend(unit.metadata.clone());
        metadata.insert("artifact_key".to_string(), json!(unit.key));
        metadata.insert("stage".to_string(), json!(unit.stage));
        if let Some(batch_key) = &unit.batch_key {
            metadata.insert("batch_key".to_string(), json!(batch_key));
        }

        let label = format!("stage:{}:{}", unit.stage, unit.key);
        let (result, attempts) = self.with_retry(&label, || {
            let source = self.stage_file(&dataset_id, &unit.output_path)?;
            self.backend.create_record(&dataset_id, &source, &metadata)
        });
        match result {
            Ok(record_id) => Completion::StageArchived {
                key: unit.key.clone(),
                stage: unit.stage.clone(),
                record_id,
                attempts,
            },
            Err(err) => Completion::StageFailed {
                key: unit.key.clone(),
                stage: unit.stage.clone(),
                error: err.to_string(),
                attempts,
            },
        }
    }

    /// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
    fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, BackendError>,
    ) -> (Result<T, BackendError>, u32) {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return (Ok(value), attempt),
                Err(err) => {
                    let last = attempt >= max_attempts || !err.is_retryable();
                    warn::emit(WarnEvent {
                        code: ArchivistErrorCode::E006UploadFailed,
                        stage: "archive",
                        action: if last { "give-up" } else { "retry" },
                        key: label,
                        retry: &format!("{attempt}/{max_attempts}"),
                        reason: if err.is_retryable() { "transient" } else { "rejected" },
                        err: &err.to_string(),
                    });
                    if last {
                        return (Err(err), attempt);
                    }
                    if !self.policy.delay.is_zero() {
                        thread::sleep(self.policy.delay);
                    }
                }
            }
        }
    }

    fn staging_target(&self, dataset_id: &str) -> Option<PathBuf> {
        self.staging_dir
            .as_ref()
            .map(|dir| dir.join(sanitize_slug(dataset_id)))
    }

    fn stage_file(&self, dataset_id: &str, source: &Path) -> Result<PathBuf, BackendError> {
        let Some(target) = self.staging_target(dataset_id) else {
            return Ok(source.to_path_buf());
        };
        fs::create_dir_all(&target).map_err(|err| io_failure(&target, err))?;
        copy_into(source, &target)?;
        Ok(target)
    }

    fn stage_batch(&self, dataset_id: &str, snapshot: &BatchSnapshot) -> Result<PathBuf, BackendError> {
        let Some(target) = self.staging_target(dataset_id) else {
            return Ok(batch_source_dir(snapshot));
        };
        fs::create_dir_all(&target).map_err(|err| io_failure(&target, err))?;
        for (_, record) in &snapshot.members {
            if let Some(raw) = record.raw_path.as_deref()
                && Path::new(raw).is_file()
            {
                copy_into(Path::new(raw), &target)?;
            }
        }
        let manifest = BatchManifest {
            dataset_id,
            batch_key: &snapshot.batch_key,
            cycle: snapshot.cycle,
            mean_position: snapshot.mean_position,
            members: snapshot
                .members
                .iter()
                .map(|(key, record)| ManifestMember {
                    key,
                    raw_path: record.raw_path.as_deref(),
                    sequence: record.sequence,
                    acquired_at_epoch_secs: record.acquired_at_epoch_secs,
                    position: record.position,
                    tilt_angle: record.tilt_angle,
                })
                .collect(),
        };
        write_json_atomically(&target.join("manifest.json"), &manifest)
            .map_err(|err| BackendError::Transient(format!("{err:#}")))?;
        Ok(target)
    }
}

fn io_failure(path: &Path, err: std::io::Error) -> BackendError {
    BackendError::Transient(format!("staging {}: {err}", path.display()))
}

fn copy_into(source: &Path, target_dir: &Path) -> Result<(), BackendError> {
    let name = source
        .file_name()
        .ok_or_else(|| BackendError::Rejected(format!("no file name in {}", source.display())))?;
    let dest = target_dir.join(name);
    fs::copy(source, &dest).map_err(|err| io_failure(source, err))?;
    Ok(())
}

/// Directory holding the batch's raw files, or the batch key when none are known.
fn batch_source_dir(snapshot: &BatchSnapshot) -> PathBuf {
    snapshot
        .members
        .iter()
        .find_map(|(_, r)| r.raw_path.as_deref())
        .and_then(|raw| Path::new(raw).parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from(&snapshot.batch_key))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records calls and fails the first `fail_first` create requests. Each create
    /// takes `delay`.
    #[derive(Default)]
    pub struct ScriptedBackend {
        pub fail_first: u32,
        pub reject: bool,
        pub delay: Duration,
        pub create_calls: AtomicU32,
        pub created: Mutex<Vec<(String, BTreeMap<String, Value>)>>,
        pub links: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl ScriptedBackend {
        pub fn failing(fail_first: u32) -> Self {
            Self {
                fail_first,
                ..Self::default()
            }
        }

        pub fn created_ids(&self) -> Vec<String> {
            self.created
                .lock()
                .expect("lock")
                .iter()
                .map(|(id, _)| id.clone())
                .collect()
        }
    }

    impl ArchiveBackend for ScriptedBackend {
        fn create_record(
            &self,
            dataset_id: &str,
            _path: &Path,
            metadata: &BTreeMap<String, Value>,
        ) -> Result<String, BackendError> {
            let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.reject {
                return Err(BackendError::Rejected("schema mismatch".to_string()));
            }
            if call <= self.fail_first {
                return Err(BackendError::Transient(format!("503 on call {call}")));
            }
            self.created
                .lock()
                .expect("lock")
                .push((dataset_id.to_string(), metadata.clone()));
            Ok(format!("rec:{dataset_id}"))
        }

        fn link_raw_data(&self, record_id: &str, raw_ids: &[String]) -> Result<(), BackendError> {
            self.links
                .lock()
                .expect("lock")
                .push((record_id.to_string(), raw_ids.to_vec()));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }
}
