use thiserror::Error;

/// Ledger invariants that callers must surface rather than paper over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("artifact not present in ledger: {0}")]
    UnknownArtifact(String),
    #[error(
        "stage {stage} of {key} already completed with result {existing}, refusing to overwrite with {attempted}"
    )]
    ConflictingResult {
        key: String,
        stage: String,
        existing: String,
        attempted: String,
    },
    #[error("batch not present in ledger: {0}")]
    UnknownBatch(String),
}

/// Failures reported by an archive backend. Only `Transient` is retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchivistErrorCode {
    E001ConfigInvalid,
    E002LedgerCorrupt,
    E003PersistFailed,
    E004StageUnavailable,
    E005SidecarMissing,
    E006UploadFailed,
    E007LedgerConflict,
    E008BatchHeld,
}

impl ArchivistErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001ConfigInvalid => "E001_CONFIG_INVALID",
            Self::E002LedgerCorrupt => "E002_LEDGER_CORRUPT",
            Self::E003PersistFailed => "E003_PERSIST_FAILED",
            Self::E004StageUnavailable => "E004_STAGE_UNAVAILABLE",
            Self::E005SidecarMissing => "E005_SIDECAR_MISSING",
            Self::E006UploadFailed => "E006_UPLOAD_FAILED",
            Self::E007LedgerConflict => "E007_LEDGER_CONFLICT",
            Self::E008BatchHeld => "E008_BATCH_HELD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(BackendError::Transient("timeout".into()).is_retryable());
        assert!(!BackendError::Rejected("bad dataset".into()).is_retryable());
    }

    #[test]
    fn conflicting_result_message_names_both_ids() {
        let err = LedgerError::ConflictingResult {
            key: "FoilHole_1_Data_2_3_20240101_120000".into(),
            stage: "ctf".into(),
            existing: "rec-a".into(),
            attempted: "rec-b".into(),
        };
        let text = err.to_string();
        assert!(text.contains("rec-a"));
        assert!(text.contains("rec-b"));
    }
}
