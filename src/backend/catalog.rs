use crate::archivist::util::{now_epoch_secs, sanitize_slug, write_json_atomically};
use crate::backend::ArchiveBackend;
use crate::error::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const RECORD_PREFIX: &str = "catalog:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub dataset_id: String,
    pub record_id: String,
    pub source_path: String,
    pub created_at_epoch_secs: u64,
    pub metadata: BTreeMap<String, Value>,
    #[serde(default)]
    pub raw_links: Vec<String>,
}

/// Local catalogue: one JSON file per dataset id.
#[derive(Debug)]
pub struct CatalogBackend {
    dir: PathBuf,
    // Serializes read-modify-write of record files across workers.
    write_lock: Mutex<()>,
}

impl CatalogBackend {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, dataset_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_slug(dataset_id)))
    }

    pub fn read_record(&self, dataset_id: &str) -> Result<Option<CatalogRecord>, BackendError> {
        let path = self.record_path(dataset_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .map_err(|err| BackendError::Transient(format!("read {}: {err}", path.display())))?;
        let record = serde_json::from_str(&raw).map_err(|err| {
            BackendError::Rejected(format!("corrupt catalog record {}: {err}", path.display()))
        })?;
        Ok(Some(record))
    }

    fn write_record(&self, record: &CatalogRecord) -> Result<(), BackendError> {
        let path = self.record_path(&record.dataset_id);
        write_json_atomically(&path, record)
            .map_err(|err| BackendError::Transient(format!("{err:#}")))
    }
}

impl ArchiveBackend for CatalogBackend {
    fn create_record(
        &self,
        dataset_id: &str,
        path: &Path,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, BackendError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BackendError::Transient("catalog lock poisoned".to_string()))?;
        if let Some(existing) = self.read_record(dataset_id)? {
            return Ok(existing.record_id);
        }
        let created_at_epoch_secs =
            now_epoch_secs().map_err(|err| BackendError::Transient(err.to_string()))?;
        let record = CatalogRecord {
            dataset_id: dataset_id.to_string(),
            record_id: format!("{RECORD_PREFIX}{dataset_id}"),
            source_path: path.display().to_string(),
            created_at_epoch_secs,
            metadata: metadata.clone(),
            raw_links: Vec::new(),
        };
        self.write_record(&record)?;
        Ok(record.record_id)
    }

    fn link_raw_data(&self, record_id: &str, raw_ids: &[String]) -> Result<(), BackendError> {
        let dataset_id = record_id
            .strip_prefix(RECORD_PREFIX)
            .ok_or_else(|| BackendError::Rejected(format!("not a catalog record id: {record_id}")))?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BackendError::Transient("catalog lock poisoned".to_string()))?;
        let mut record = self
            .read_record(dataset_id)?
            .ok_or_else(|| BackendError::Rejected(format!("unknown record {record_id}")))?;
        let mut changed = false;
        for raw in raw_ids {
            if !record.raw_links.contains(raw) {
                record.raw_links.push(raw.clone());
                changed = true;
            }
        }
        if changed {
            self.write_record(&record)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "catalog"
    }
}
