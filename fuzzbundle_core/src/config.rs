use serde::Deserialize;
use std::path::PathBuf;

/// Project-level bundle settings loaded from `fuzzbundle.toml`. All fields
/// are optional; command-line flags take precedence over file values.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    #[serde(default)]
    pub build_system: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub project_dir: Option<PathBuf>,
    #[serde(default)]
    pub dict: Option<PathBuf>,
    #[serde(default)]
    pub seed_corpus_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub engine_args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl BundleConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: BundleConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
