use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use lxdev_core::{BoxConfig, CONFIG_FILE};

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(rename = "box")]
    box_config: BoxConfig,
}

pub(crate) struct LoadedConfig {
    pub config: BoxConfig,
    /// Directory holding the config file; folders and `.lxdev/` live here.
    pub project_dir: PathBuf,
}

pub(crate) fn load_config(config_flag: Option<&str>) -> Result<LoadedConfig> {
    let path = match config_flag {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(CONFIG_FILE),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("{} not found", path.display())
        }
        Err(e) => bail!("Failed to read {}: {}", path.display(), e),
    };

    let file: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let project_dir = std::fs::canonicalize(parent)
        .with_context(|| format!("Failed to resolve {}", parent.display()))?;

    Ok(LoadedConfig {
        config: file.box_config,
        project_dir,
    })
}
