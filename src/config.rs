use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::vfat::RedologMode;

const DEFAULT_SIZE_MB: u64 = 128;

/// Optional TOML configuration file. Command-line flags take precedence
/// over these values.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Virtual disk size in MiB.
    pub size_mb: Option<u64>,
    /// Path of a persistent (undoable) redo-log.
    pub redolog: Option<PathBuf>,
    /// "volatile" (default) or "undoable".
    pub subtype: Option<String>,
}

#[derive(Debug)]
pub struct Settings {
    pub size: u64,
    pub redolog: RedologMode,
}

impl Settings {
    /// Resolves the effective settings: CLI flags, then the config file,
    /// then defaults.
    pub fn load(
        config: Option<&Path>,
        size_mb: Option<u64>,
        redolog: Option<PathBuf>,
    ) -> Result<Settings> {
        let file = match config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parse {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let size_mb = size_mb.or(file.size_mb).unwrap_or(DEFAULT_SIZE_MB);
        if size_mb == 0 {
            bail!("disk size must be non-zero");
        }
        let size = size_mb * 1024 * 1024;

        let redolog = match (redolog.or(file.redolog), file.subtype.as_deref()) {
            (Some(path), _) => RedologMode::Undoable(path),
            (None, None) | (None, Some("volatile")) => RedologMode::Volatile,
            (None, Some("undoable")) => {
                bail!("subtype \"undoable\" needs a redolog path")
            }
            (None, Some(other)) => bail!("unknown redolog subtype {:?}", other),
        };

        Ok(Settings { size, redolog })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_config() {
        let settings = Settings::load(None, None, None).unwrap();
        assert_eq!(settings.size, 128 * 1024 * 1024);
        assert!(matches!(settings.redolog, RedologMode::Volatile));
    }

    #[test]
    fn test_config_file_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "size_mb = 64").unwrap();
        writeln!(file, "redolog = \"/tmp/mirror.redolog\"").unwrap();
        file.flush().unwrap();

        let settings = Settings::load(Some(file.path()), None, None).unwrap();
        assert_eq!(settings.size, 64 * 1024 * 1024);
        match settings.redolog {
            RedologMode::Undoable(path) => {
                assert_eq!(path, PathBuf::from("/tmp/mirror.redolog"))
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_cli_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "size_mb = 64").unwrap();
        file.flush().unwrap();

        let settings = Settings::load(Some(file.path()), Some(256), None).unwrap();
        assert_eq!(settings.size, 256 * 1024 * 1024);
    }

    #[test]
    fn test_bad_config_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "subtype = \"undoable\"").unwrap();
        file.flush().unwrap();
        assert!(Settings::load(Some(file.path()), None, None).is_err());

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "no_such_key = 1").unwrap();
        file.flush().unwrap();
        assert!(Settings::load(Some(file.path()), None, None).is_err());

        assert!(Settings::load(None, Some(0), None).is_err());
    }
}
