use anyhow::Result;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ArchivistPaths {
    pub archivist_home: PathBuf,
    pub ledger_file: PathBuf,
    pub logs_dir: PathBuf,
    pub catalog_dir: PathBuf,
    pub staging_dir: Option<PathBuf>,
    pub config_file: PathBuf,
}

fn required_home_dir() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        return Ok(home);
    }
    Err(anyhow::anyhow!("HOME directory could not be resolved"))
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

fn env_optional_path(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    }
}

pub fn resolve_paths() -> Result<ArchivistPaths> {
    let archivist_home = match env_optional_path("ARCHIVIST_HOME") {
        Some(home) => home,
        None => required_home_dir()?.join(".cryo-archivist"),
    };

    let ledger_file = env_or_default_path(
        "ARCHIVIST_LEDGER_FILE",
        archivist_home.join("state").join("ledger.json"),
    );
    let logs_dir = env_or_default_path("ARCHIVIST_LOGS_DIR", archivist_home.join("logs"));
    let catalog_dir = env_or_default_path("ARCHIVIST_CATALOG_DIR", archivist_home.join("catalog"));
    let staging_dir = env_optional_path("ARCHIVIST_STAGING_DIR");
    let config_file = env_or_default_path(
        "ARCHIVIST_CONFIG_PATH",
        archivist_home.join("archivist.toml"),
    );

    Ok(ArchivistPaths {
        archivist_home,
        ledger_file,
        logs_dir,
        catalog_dir,
        staging_dir,
        config_file,
    })
}

#[cfg(test)]
pub fn test_paths(root: &std::path::Path) -> ArchivistPaths {
    ArchivistPaths {
        archivist_home: root.join("home"),
        ledger_file: root.join("home/state/ledger.json"),
        logs_dir: root.join("home/logs"),
        catalog_dir: root.join("home/catalog"),
        staging_dir: None,
        config_file: root.join("home/archivist.toml"),
    }
}
