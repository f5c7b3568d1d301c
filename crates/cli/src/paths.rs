//! Path resolution for casework data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `CASEWORK_DATA_DIR` env > `~/.casework`.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DATA_DIR_ENV: &str = "CASEWORK_DATA_DIR";

/// Resolve the data directory.
pub fn resolve_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    resolve_with(
        explicit,
        std::env::var(DATA_DIR_ENV).ok(),
        dirs::home_dir(),
    )
}

fn resolve_with(
    explicit: Option<&Path>,
    env_value: Option<String>,
    home: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return Ok(PathBuf::from(value));
    }
    home.map(|h| h.join(".casework"))
        .context("HOME directory not found; pass --data-dir")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Create the data dir and its subdirectories.
pub fn ensure_dirs(data_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(log_dir(data_dir))?;
    Ok(())
}
