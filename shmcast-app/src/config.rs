//! Config file loading via TOML.
//!
//! An explicit `--config` path must exist and parse. Without one, the
//! per-user file at `<config_dir>/shmcast/shmcast.toml` is read if present;
//! a missing or corrupted per-user file yields an empty config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::options::FileConfig;

const FILE_NAME: &str = "shmcast.toml";

/// Load the config file named on the command line, or the per-user default.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    match explicit {
        Some(path) => load_file(path),
        None => Ok(default_path().map(|p| load_or_empty(&p)).unwrap_or_default()),
    }
}

/// Read and parse `path`, failing on any error.
pub fn load_file(path: &Path) -> Result<FileConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Read `path` if it exists; anything unreadable is logged and ignored.
pub fn load_or_empty(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "config loaded");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupted config file, ignoring it"
                );
                FileConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file");
            FileConfig::default()
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file, ignoring it"
            );
            FileConfig::default()
        }
    }
}

/// Per-user config file location, if the platform has one.
fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "shmcast").map(|d| d.config_dir().join(FILE_NAME))
}

#[cfg(test)]
mod tests {
    use shmcast_net::testing::init_test_tracing;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn explicit_file_is_parsed() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bridge.toml");
        std::fs::write(
            &path,
            "name = \"cam1\"\nwidth = 640\nheight = 480\ntune = \"zerolatency,fastdecode\"\naq-strength = 0.8\n",
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.name.as_deref(), Some("cam1"));
        assert_eq!(config.encoder.width, Some(640));
        assert_eq!(config.encoder.tune.as_deref(), Some("zerolatency,fastdecode"));
        assert_eq!(config.encoder.aq_strength, Some(0.8));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let err = load(Some(&tmp.path().join("absent.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config file"));
    }

    #[test]
    fn corrupted_explicit_file_is_an_error() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "{{{{not valid toml}}}}").unwrap();
        assert!(load_file(&path).is_err());
    }

    #[test]
    fn default_location_tolerates_missing_and_corrupted_files() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        assert_eq!(load_or_empty(&tmp.path().join(FILE_NAME)), FileConfig::default());

        let path = tmp.path().join(FILE_NAME);
        std::fs::write(&path, "width = \"wide\"").unwrap();
        assert_eq!(load_or_empty(&path), FileConfig::default());
    }
}
