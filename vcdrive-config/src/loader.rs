// Standard library
use std::fs;
use std::path::{Path, PathBuf};

// External crates
use tracing::debug;
use vcdrive_core::{DriverError, Result};

// Internal imports
use crate::config::DriverConfig;

/// Finds and loads the `vcdrive.yaml` configuration file.
///
/// Lookup order:
/// 1. An explicit path, when the caller provides one.
/// 2. `vcdrive.yaml` in the current working directory.
/// 3. `~/.vcdrive/config.yaml`.
///
/// Environment overrides (`VCDRIVE_*`) are applied after the file loads.
#[derive(Default)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load(&self, explicit: Option<&Path>) -> Result<DriverConfig> {
        let path = self.locate(explicit)?;
        debug!("Loading config from: {}", path.display());
        let config = self.load_file(&path)?;
        Ok(config.apply_env_overrides())
    }

    fn locate(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(DriverError::Config(format!(
                "Config file not found at {}",
                path.display()
            )));
        }

        let local = Path::new("vcdrive.yaml");
        if local.exists() {
            return Ok(local.to_path_buf());
        }

        if let Some(home) = dirs::home_dir() {
            let global = home.join(".vcdrive").join("config.yaml");
            if global.exists() {
                return Ok(global);
            }
        }

        Err(DriverError::Config(
            "No vcdrive.yaml found in the current directory and no ~/.vcdrive/config.yaml"
                .to_string(),
        ))
    }

    fn load_file(&self, path: &Path) -> Result<DriverConfig> {
        let contents = fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_yaml_ng::from_str(&contents).map_err(|e| {
            DriverError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}
