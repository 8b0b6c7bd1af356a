use crate::archivist::paths::ArchivistPaths;
use crate::archivist::util::now_epoch_secs;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at_epoch_secs: u64,
    pub phase: String,
    pub status: String,
    pub message: String,
}

pub fn audit_log_path(paths: &ArchivistPaths) -> PathBuf {
    paths.logs_dir.join("audit.log")
}

pub fn append_event(
    paths: &ArchivistPaths,
    phase: &str,
    status: &str,
    message: &str,
) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("failed to create {}", paths.logs_dir.display()))?;
    let event = AuditEvent {
        at_epoch_secs: now_epoch_secs()?,
        phase: phase.to_string(),
        status: status.to_string(),
        message: message.to_string(),
    };

    let line = format!("{}\n", serde_json::to_string(&event)?);
    let path = audit_log_path(paths);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}

/// Audit writes must never take the poll loop down with them.
pub fn record(paths: &ArchivistPaths, phase: &str, status: &str, message: &str) {
    if let Err(err) = append_event(paths, phase, status, message) {
        eprintln!("archivist audit warning: {err:#}");
    }
}

pub fn read_events(paths: &ArchivistPaths) -> Result<Vec<AuditEvent>> {
    let path = audit_log_path(paths);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let mut out = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let event: AuditEvent = serde_json::from_str(line)
            .with_context(|| format!("failed to parse audit line in {}", path.display()))?;
        out.push(event);
    }
    Ok(out)
}
