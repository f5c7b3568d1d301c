//! Effective client configuration: CLI flags > environment > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use casework_client::{ClientConfig, TransportKind};

/// Overrides given on the command line
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub endpoint: Option<String>,
    pub transport: Option<String>,
    pub subject: Option<String>,
    pub tool: Option<String>,
}

/// Resolve the config. An explicit `--config` must exist; the default path
/// under the data dir may be missing.
pub fn resolve<F>(
    explicit_file: Option<&Path>,
    default_file: PathBuf,
    env: F,
    overrides: &Overrides,
) -> anyhow::Result<ClientConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match explicit_file {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::load_or_default(&default_file)
            .with_context(|| format!("loading {}", default_file.display()))?,
    };

    config.apply_env(env)?;

    if let Some(endpoint) = &overrides.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(transport) = &overrides.transport {
        config.transport = TransportKind::parse(transport)?;
    }
    if let Some(subject) = &overrides.subject {
        config.subject_id = Some(subject.clone());
    }
    if let Some(tool) = &overrides.tool {
        config.tool = Some(tool.clone());
    }

    config.validate()?;
    Ok(config)
}
