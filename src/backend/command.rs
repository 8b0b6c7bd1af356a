use crate::archivist::util::run_command_with_optional_timeout;
use crate::backend::ArchiveBackend;
use crate::error::BackendError;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Exit status the external tool uses for a request it will never accept.
pub const EXIT_REJECTED: i32 = 65;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRecordReply {
    record_id: String,
}

/// Delegates catalogue calls to an external executable:
///
/// ```text
/// <bin> create-record --dataset-id <ID> --path <PATH> --metadata <JSON>
/// <bin> link-raw-data --record-id <ID> [--raw-id <RAW>]...
/// ```
///
/// `create-record` prints `{"recordId": "..."}` on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    bin: PathBuf,
    timeout_secs: u64,
}

impl CommandBackend {
    pub fn resolve(bin: &str, timeout_secs: u64) -> Result<Self> {
        let candidate = Path::new(bin);
        let bin = if candidate.exists() {
            candidate.to_path_buf()
        } else {
            which::which(bin)
                .with_context(|| format!("archive command `{bin}` not found in PATH"))?
        };
        Ok(Self { bin, timeout_secs })
    }

    fn run(&self, cmd: &mut Command) -> Result<Output, BackendError> {
        let timeout = (self.timeout_secs > 0).then_some(self.timeout_secs);
        let output = run_command_with_optional_timeout(cmd, timeout)
            .map_err(|err| BackendError::Transient(format!("{}: {err:#}", self.bin.display())))?;
        if output.status.success() {
            return Ok(output);
        }
        let detail = format!(
            "{} exited with {}: {}",
            self.bin.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
        if output.status.code() == Some(EXIT_REJECTED) {
            return Err(BackendError::Rejected(detail));
        }
        Err(BackendError::Transient(detail))
    }
}

impl ArchiveBackend for CommandBackend {
    fn create_record(
        &self,
        dataset_id: &str,
        path: &Path,
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, BackendError> {
        let metadata = serde_json::to_string(metadata)
            .map_err(|err| BackendError::Rejected(format!("unserializable metadata: {err}")))?;
        let mut cmd = Command::new(&self.bin);
        cmd.arg("create-record")
            .arg("--dataset-id")
            .arg(dataset_id)
            .arg("--path")
            .arg(path)
            .arg("--metadata")
            .arg(metadata);
        let output = self.run(&mut cmd)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: CreateRecordReply = serde_json::from_str(stdout.trim()).map_err(|err| {
            BackendError::Transient(format!("unreadable create-record reply: {err}"))
        })?;
        Ok(reply.record_id)
    }

    fn link_raw_data(&self, record_id: &str, raw_ids: &[String]) -> Result<(), BackendError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("link-raw-data").arg("--record-id").arg(record_id);
        for raw in raw_ids {
            cmd.arg("--raw-id").arg(raw);
        }
        self.run(&mut cmd)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
