use crate::archivist::identity::grammars_for;
use crate::archivist::paths::ArchivistPaths;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcquisitionMode {
    Mosaic,
    TiledFractions,
    TiltSeries,
}

impl AcquisitionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mosaic => "mosaic",
            Self::TiledFractions => "tiled-fractions",
            Self::TiltSeries => "tilt-series",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "mosaic" => Some(Self::Mosaic),
            "tiled-fractions" | "fractions" => Some(Self::TiledFractions),
            "tilt-series" | "tomo" => Some(Self::TiltSeries),
            _ => None,
        }
    }
}

/// Which sidecar reader and which upload semantics a stage gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Import,
    MotionCorrection,
    CtfEstimation,
    Classification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageArchival {
    PerArtifact,
    BatchOnly,
}

fn default_extensions() -> Vec<String> {
    vec!["mrc".to_string()]
}

fn default_recursive() -> bool {
    true
}

fn default_finished_marker() -> String {
    ".finished".to_string()
}

fn default_archival() -> StageArchival {
    StageArchival::PerArtifact
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    pub output_dir: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_archival")]
    pub archival: StageArchival,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_finished_marker")]
    pub finished_marker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub max_run_secs: u64,
    pub drain_grace_secs: u64,
    pub sidecar_wait_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_run_secs: 172_800,
            drain_grace_secs: 120,
            sidecar_wait_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub mode: AcquisitionMode,
    /// Restricts the mode's grammar set; empty keeps all of them.
    #[serde(default)]
    pub grammars: Vec<String>,
    pub timezone: String,
    #[serde(default)]
    pub require_existing_files: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::Mosaic,
            grammars: Vec::new(),
            timezone: "UTC".to_string(),
            require_existing_files: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub quiescence_timeout_secs: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            quiescence_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub backend: String,
    #[serde(default)]
    pub command_bin: Option<String>,
    pub command_timeout_secs: u64,
    pub batch_workers: usize,
    pub artifact_workers: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub dataset_prefix: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: "catalog".to_string(),
            command_bin: None,
            command_timeout_secs: 120,
            batch_workers: 2,
            artifact_workers: 4,
            max_attempts: 5,
            retry_delay_ms: 5_000,
            dataset_prefix: "cryo".to_string(),
        }
    }
}

/// Descriptive session fields copied into the ledger's global metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub proposal: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub instrument: Option<String>,
    /// Any other key in `[session]`, e.g. `grid_type`.
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArchivistConfig {
    pub monitor: MonitorConfig,
    pub acquisition: AcquisitionConfig,
    pub batching: BatchingConfig,
    pub archive: ArchiveConfig,
    pub session: SessionConfig,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialArchivistConfig {
    monitor: Option<MonitorConfig>,
    acquisition: Option<AcquisitionConfig>,
    batching: Option<BatchingConfig>,
    archive: Option<ArchiveConfig>,
    session: Option<SessionConfig>,
    stages: Option<Vec<StageConfig>>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_usize(var: &str, fallback: usize) -> usize {
    match env::var(var) {
        Ok(v) => v.trim().parse::<usize>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_or_mode(var: &str, fallback: AcquisitionMode) -> Result<AcquisitionMode> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => AcquisitionMode::parse(&v)
            .ok_or_else(|| anyhow!("invalid acquisition mode in {var}: {}", v.trim())),
        _ => Ok(fallback),
    }
}

pub fn validate(cfg: &ArchivistConfig) -> Result<()> {
    if cfg.monitor.poll_interval_secs == 0 {
        return Err(anyhow!("invalid poll interval: must be >= 1 second"));
    }
    if cfg.monitor.max_run_secs == 0 {
        return Err(anyhow!("invalid max run time: must be >= 1 second"));
    }
    if cfg.batching.quiescence_timeout_secs == 0 {
        return Err(anyhow!("invalid quiescence timeout: must be >= 1 second"));
    }
    if cfg.archive.batch_workers == 0 || cfg.archive.artifact_workers == 0 {
        return Err(anyhow!("invalid worker counts: each category needs >= 1 worker"));
    }
    if cfg.archive.max_attempts == 0 {
        return Err(anyhow!("invalid max attempts: must be >= 1"));
    }
    match cfg.archive.backend.as_str() {
        "catalog" => {}
        "command" => {
            let has_bin = cfg
                .archive
                .command_bin
                .as_deref()
                .is_some_and(|b| !b.trim().is_empty());
            if !has_bin {
                return Err(anyhow!("command backend requires archive.command_bin"));
            }
        }
        other => {
            return Err(anyhow!(
                "invalid archive backend `{other}`: use `catalog` or `command`"
            ));
        }
    }
    if cfg.acquisition.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(anyhow!(
            "invalid acquisition timezone: {}",
            cfg.acquisition.timezone
        ));
    }
    if grammars_for(cfg.acquisition.mode, &cfg.acquisition.grammars).is_empty() {
        return Err(anyhow!(
            "acquisition mode `{}` has no grammar rules after filtering by {:?}",
            cfg.acquisition.mode.as_str(),
            cfg.acquisition.grammars
        ));
    }

    let mut names = BTreeSet::new();
    for stage in &cfg.stages {
        if stage.name.trim().is_empty() {
            return Err(anyhow!("invalid stage: name cannot be empty"));
        }
        if !names.insert(stage.name.as_str()) {
            return Err(anyhow!("duplicate stage name: {}", stage.name));
        }
        if stage.extensions.is_empty() {
            return Err(anyhow!("stage {} lists no output extensions", stage.name));
        }
    }
    Ok(())
}

fn merge_file_config(base: &mut ArchivistConfig, path: &PathBuf) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: PartialArchivistConfig = toml::from_str(&raw)
        .map_err(|err| anyhow!("failed to parse archivist config {}: {err}", path.display()))?;
    if let Some(monitor) = parsed.monitor {
        base.monitor = monitor;
    }
    if let Some(acquisition) = parsed.acquisition {
        base.acquisition = acquisition;
    }
    if let Some(batching) = parsed.batching {
        base.batching = batching;
    }
    if let Some(archive) = parsed.archive {
        base.archive = archive;
    }
    if let Some(session) = parsed.session {
        base.session = session;
    }
    if let Some(stages) = parsed.stages {
        base.stages = stages;
    }
    Ok(())
}

fn apply_env_overrides(cfg: &mut ArchivistConfig) -> Result<()> {
    cfg.monitor.poll_interval_secs =
        env_or_u64("ARCHIVIST_POLL_INTERVAL_SECS", cfg.monitor.poll_interval_secs);
    cfg.monitor.max_run_secs = env_or_u64("ARCHIVIST_MAX_RUN_SECS", cfg.monitor.max_run_secs);
    cfg.monitor.drain_grace_secs =
        env_or_u64("ARCHIVIST_DRAIN_GRACE_SECS", cfg.monitor.drain_grace_secs);
    cfg.monitor.sidecar_wait_secs =
        env_or_u64("ARCHIVIST_SIDECAR_WAIT_SECS", cfg.monitor.sidecar_wait_secs);
    cfg.acquisition.mode = env_or_mode("ARCHIVIST_ACQUISITION_MODE", cfg.acquisition.mode)?;
    cfg.acquisition.timezone = env_or_string("ARCHIVIST_TIMEZONE", &cfg.acquisition.timezone);
    cfg.batching.quiescence_timeout_secs = env_or_u64(
        "ARCHIVIST_QUIESCENCE_SECS",
        cfg.batching.quiescence_timeout_secs,
    );
    cfg.archive.backend = env_or_string("ARCHIVIST_BACKEND", &cfg.archive.backend);
    if let Ok(bin) = env::var("ARCHIVIST_BACKEND_BIN")
        && !bin.trim().is_empty()
    {
        cfg.archive.command_bin = Some(bin.trim().to_string());
    }
    cfg.archive.batch_workers = env_or_usize("ARCHIVIST_BATCH_WORKERS", cfg.archive.batch_workers);
    cfg.archive.artifact_workers =
        env_or_usize("ARCHIVIST_ARTIFACT_WORKERS", cfg.archive.artifact_workers);
    cfg.archive.max_attempts = env_or_u64(
        "ARCHIVIST_MAX_ATTEMPTS",
        u64::from(cfg.archive.max_attempts),
    )
    .try_into()
    .unwrap_or(cfg.archive.max_attempts);
    cfg.archive.retry_delay_ms = env_or_u64("ARCHIVIST_RETRY_DELAY_MS", cfg.archive.retry_delay_ms);
    Ok(())
}

pub fn load_config(paths: &ArchivistPaths) -> Result<ArchivistConfig> {
    let mut cfg = ArchivistConfig::default();
    merge_file_config(&mut cfg, &paths.config_file)?;
    apply_env_overrides(&mut cfg)?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(raw: &str) -> ArchivistConfig {
        let parsed: PartialArchivistConfig = toml::from_str(raw).expect("toml");
        let mut cfg = ArchivistConfig::default();
        if let Some(v) = parsed.acquisition {
            cfg.acquisition = v;
        }
        if let Some(v) = parsed.archive {
            cfg.archive = v;
        }
        if let Some(v) = parsed.stages {
            cfg.stages = v;
        }
        cfg
    }

    #[test]
    fn defaults_validate() {
        validate(&ArchivistConfig::default()).expect("defaults are valid");
    }

    #[test]
    fn stages_parse_with_defaults() {
        let cfg = parse(
            r#"
[[stages]]
name = "import"
kind = "import"
output_dir = "/data/raw"
archival = "batch-only"

[[stages]]
name = "ctf"
kind = "ctf-estimation"
output_dir = "/data/proc/ctf"
extensions = ["txt"]
"#,
        );
        assert_eq!(cfg.stages.len(), 2);
        assert_eq!(cfg.stages[0].archival, StageArchival::BatchOnly);
        assert_eq!(cfg.stages[1].kind, StageKind::CtfEstimation);
        assert_eq!(cfg.stages[1].archival, StageArchival::PerArtifact);
        assert_eq!(cfg.stages[1].finished_marker, ".finished");
        assert!(cfg.stages[0].recursive);
        validate(&cfg).expect("valid");
    }

    #[test]
    fn unlisted_session_keys_land_in_extra() {
        let cfg = parse(
            r#"
[session]
proposal = "bi23047"
grid_type = "quantifoil"
magnification = 105000
"#,
        );
        assert_eq!(cfg.session.proposal.as_deref(), Some("bi23047"));
        assert_eq!(
            cfg.session.extra.get("grid_type"),
            Some(&toml::Value::String("quantifoil".to_string()))
        );
        assert_eq!(
            cfg.session.extra.get("magnification"),
            Some(&toml::Value::Integer(105_000))
        );
        assert!(!cfg.session.extra.contains_key("proposal"));
    }

    #[test]
    fn grammar_filter_matching_nothing_is_fatal() {
        let mut cfg = ArchivistConfig::default();
        cfg.acquisition.grammars = vec!["no-such-grammar".to_string()];
        let err = validate(&cfg).expect_err("empty grammar set");
        assert!(err.to_string().contains("no grammar rules"));
    }

    #[test]
    fn command_backend_requires_binary() {
        let mut cfg = ArchivistConfig::default();
        cfg.archive.backend = "command".to_string();
        assert!(validate(&cfg).is_err());
        cfg.archive.command_bin = Some("/usr/local/bin/catalog-cli".to_string());
        validate(&cfg).expect("valid with bin");
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let cfg = parse(
            r#"
[[stages]]
name = "mc"
kind = "motion-correction"
output_dir = "/a"

[[stages]]
name = "mc"
kind = "ctf-estimation"
output_dir = "/b"
"#,
        );
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let mut cfg = ArchivistConfig::default();
        cfg.acquisition.timezone = "Mars/Olympus".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn file_sections_replace_defaults() {
        let tmp = tempdir().expect("tempdir");
        let path = tmp.path().join("archivist.toml");
        fs::write(
            &path,
            "[batching]\nquiescence_timeout_secs = 45\n\n[acquisition]\nmode = \"tilt-series\"\ntimezone = \"Europe/Paris\"\n",
        )
        .expect("write");
        let mut cfg = ArchivistConfig::default();
        merge_file_config(&mut cfg, &path).expect("merge");
        assert_eq!(cfg.batching.quiescence_timeout_secs, 45);
        assert_eq!(cfg.acquisition.mode, AcquisitionMode::TiltSeries);
        assert_eq!(cfg.monitor.poll_interval_secs, 30);
        validate(&cfg).expect("valid");
    }
}
