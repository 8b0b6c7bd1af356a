use anyhow::Result;
use std::path::PathBuf;

use crate::archivist::config::load_config;
use crate::archivist::identity::{Resolution, Resolver};
use crate::archivist::ledger::UNGROUPED_BATCH_KEY;
use crate::archivist::paths::resolve_paths;
use crate::commands::CommandReport;

pub fn run(targets: &[PathBuf]) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let cfg = load_config(&paths)?;
    let resolver = Resolver::new(
        cfg.acquisition.mode,
        &cfg.acquisition.grammars,
        &cfg.acquisition.timezone,
        cfg.acquisition.require_existing_files,
    )?;

    let mut report = CommandReport::new("resolve");
    report.detail(format!("mode={}", cfg.acquisition.mode.as_str()));
    report.detail(format!("grammars={}", resolver.grammar_names().join(",")));

    for target in targets {
        match resolver.resolve(target) {
            Resolution::Artifact(id) => {
                let acquired = id
                    .acquired_at_epoch_secs
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string());
                report.detail(format!(
                    "artifact key={} batch={} seq={} acquired={} grammar={}{}{}",
                    id.key,
                    id.batch_key.as_deref().unwrap_or(UNGROUPED_BATCH_KEY),
                    id.sequence,
                    acquired,
                    id.grammar,
                    id.suffix
                        .as_deref()
                        .map(|s| format!(" suffix={s}"))
                        .unwrap_or_default(),
                    id.tilt_angle
                        .map(|a| format!(" angle={a}"))
                        .unwrap_or_default(),
                ));
            }
            Resolution::NotAnArtifact { key, reason } => {
                report.detail(format!("not-an-artifact path={key} reason={reason}"));
            }
        }
    }
    Ok(report)
}
