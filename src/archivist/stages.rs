use crate::archivist::config::StageConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// The processing pipeline under observation.
pub trait StageSource {
    fn list_outputs(&self, stage: &StageConfig) -> Result<Vec<PathBuf>>;
    fn is_stage_active(&self, stage: &StageConfig) -> Result<bool>;
}

/// Observes stages through their output directories. A stage is finished once its
/// marker file exists; until then it counts as active.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryStageSource;

fn collect_files(root: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() {
            out.push(path);
            continue;
        }
        if recursive && path.is_dir() {
            collect_files(&path, recursive, out)?;
        }
    }
    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.starts_with('.'))
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

impl StageSource for DirectoryStageSource {
    fn list_outputs(&self, stage: &StageConfig) -> Result<Vec<PathBuf>> {
        if !stage.output_dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        collect_files(&stage.output_dir, stage.recursive, &mut files)?;
        files.retain(|p| !is_hidden(p) && has_extension(p, &stage.extensions));
        files.sort();
        Ok(files)
    }

    fn is_stage_active(&self, stage: &StageConfig) -> Result<bool> {
        Ok(!stage.output_dir.join(&stage.finished_marker).exists())
    }
}
