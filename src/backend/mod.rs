//! Bindings to the external metadata catalogue that archived datasets land in.

pub mod catalog;
pub mod command;

use crate::archivist::config::ArchiveConfig;
use crate::archivist::paths::ArchivistPaths;
use crate::error::BackendError;
use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub use catalog::CatalogBackend;
pub use command::CommandBackend;

/// Shared by every archival worker, so implementations must be thread safe.
pub trait ArchiveBackend: Send + Sync {
    /// Creates (or finds) the record for `dataset_id` and returns its record id.
    /// Calling it twice with the same dataset id must not create a second record.
    fn create_record(
        &self,
        dataset_id: &str,
        path: &Path,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, BackendError>;

    fn link_raw_data(&self, record_id: &str, raw_ids: &[String]) -> Result<(), BackendError>;

    fn name(&self) -> &'static str;
}

pub fn build_backend(cfg: &ArchiveConfig, paths: &ArchivistPaths) -> Result<Arc<dyn ArchiveBackend>> {
    match cfg.backend.as_str() {
        "catalog" => Ok(Arc::new(CatalogBackend::new(&paths.catalog_dir))),
        "command" => {
            let bin = cfg
                .command_bin
                .as_deref()
                .ok_or_else(|| anyhow!("command backend requires archive.command_bin"))?;
            let backend = CommandBackend::resolve(bin, cfg.command_timeout_secs)?;
            Ok(Arc::new(backend))
        }
        other => Err(anyhow!("unknown archive backend `{other}`")),
    }
}
