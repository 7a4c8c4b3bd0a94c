//! Loading the top-level configuration file

use std::path::{Path, PathBuf};

use serde::Deserialize;
use volley_dispatch::DispatchConfig;
use volley_metrics::MetricsConfig;

use crate::simulation::SimulationConfig;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "VOLLEY_CONFIG";

/// Locations searched, in order, when neither `--config` nor
/// [`CONFIG_ENV`] is given
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["./volley.config.ron", "/etc/volley/volley.config.ron"];

/// Everything the `volley` binary reads from its configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Volley {
    #[serde(default, alias = "engine")]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Volley {
    /// Read and parse the RON configuration at `path`
    ///
    /// # Errors
    ///
    /// If the file cannot be read or does not parse
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;
        Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }

    /// # Errors
    ///
    /// If `content` is not a valid configuration
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    /// Check the values, beyond what parsing already checked
    ///
    /// # Errors
    ///
    /// Names the first invalid value
    pub fn validate(&self) -> anyhow::Result<()> {
        self.dispatch.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

/// Find the configuration file using the following precedence:
/// 1. An explicit path (`--config`)
/// 2. The `VOLLEY_CONFIG` environment variable
/// 3. [`DEFAULT_CONFIG_PATHS`], first one that exists
///
/// # Errors
///
/// If an explicitly named file does not exist, or nothing was found
pub fn find_config_file(
    explicit: Option<&Path>,
    from_env: Option<String>,
    defaults: &[&str],
) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("Config file does not exist: {}", path.display());
    }

    if let Some(env_path) = from_env {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = defaults.iter().map(PathBuf::from).find(|path| path.exists()) {
        return Ok(path);
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - --config\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}
