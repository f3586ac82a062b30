use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::manifest::Manifest;
use super::types::EngineConfig;
use super::validator;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.yaml";

/// Load the engine config.
///
/// - An explicit `path` must exist.
/// - Without one, `stagehand.yaml` is used if present, else the defaults.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(p) => {
            if !p.is_file() {
                bail!("Config not found: '{}'", p.display());
            }
            parse_config(&read(p)?)
                .with_context(|| format!("Failed to parse YAML in: {}", p.display()))?
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                parse_config(&read(default)?)?
            } else {
                tracing::debug!("no config file, using defaults");
                EngineConfig::default()
            }
        }
    };
    validator::validate_config(&config)?;
    Ok(config)
}

/// Parse YAML content into an EngineConfig. An empty document yields defaults.
pub fn parse_config(content: &str) -> Result<EngineConfig> {
    if content.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    let config: EngineConfig =
        serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;
    Ok(config)
}

/// Load manifests from a `.yaml`/`.yml` file or from every such file in a
/// directory (non-recursive, in name order), then validate the merged set.
pub fn load_manifests(path: &Path) -> Result<Manifest> {
    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        let files = find_yaml_files(path)?;
        if files.is_empty() {
            bail!("No .yaml files found in directory: {}", path.display());
        }
        files
    } else {
        bail!("Manifest not found: '{}'", path.display());
    };

    tracing::info!(
        files = ?files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
        "Discovered manifest files"
    );

    let mut merged = Manifest::default();
    for file in &files {
        let content = read(file)?;
        if content.trim().is_empty() {
            continue;
        }
        let manifest: Manifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", file.display()))?;
        merged.extend(manifest);
    }
    validator::validate_manifest(&merged)?;
    Ok(merged)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read file: {}", path.display()))
}

fn find_yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    files.sort();
    Ok(files)
}
