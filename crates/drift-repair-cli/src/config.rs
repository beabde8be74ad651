use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use drift_repair_resp::EndpointConfig;
use serde::Deserialize;

/// On-disk YAML configuration. Every field is optional; command-line flags
/// and environment variables take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<EndpointConfig>,
    pub target: Option<EndpointConfig>,
    pub catalog: CatalogConfig,
    pub options: OptionsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CatalogConfig {
    pub path: Option<PathBuf>,
    pub table: Option<String>,
    pub db: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptionsConfig {
    pub dry_run: Option<bool>,
    pub page_size: Option<usize>,
    pub tolerance_ms: Option<u64>,
    pub slice_size: Option<usize>,
    pub workers: Option<usize>,
    pub retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub filter: Option<String>,
}

impl FileConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid config.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}
