//! Persisted configuration.
//!
//! Exactly two things survive a restart: the user-chosen display name and
//! the download base path. Both live in a `config.toml`; a commented
//! template is written on first run so the defaults are discoverable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_TEMPLATE: &str = "\
# witra configuration
# display_name = \"My Laptop\"       # defaults to the machine hostname
# download_path = \"/path/to/dir\"   # defaults to <documents>/Witra Downloads
";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Human-readable name shown to peers. Hostname when unset.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Where incoming files land. Layered defaults when unset.
    #[serde(default)]
    pub download_path: Option<PathBuf>,
}

impl Config {
    /// Load `path`, writing a commented template first when it is missing.
    /// A missing file is not an error; the defaults work out of the box.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            std::fs::write(path, CONFIG_TEMPLATE)
                .with_context(|| format!("writing config template {}", path.display()))?;
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serialising config")?;
        std::fs::write(path, content)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// The configured display name, else the hostname, else a fixed label.
    pub fn resolve_display_name(&self) -> String {
        self.display_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(device_name)
    }

    /// The configured download path, else `<documents>/Witra Downloads`,
    /// else `<home>/Downloads/Witra`, else a directory next to the process.
    pub fn resolve_download_path(&self) -> PathBuf {
        if let Some(path) = &self.download_path {
            if !path.as_os_str().is_empty() {
                return path.clone();
            }
        }
        if let Some(documents) = dirs::document_dir() {
            return documents.join("Witra Downloads");
        }
        if let Some(home) = dirs::home_dir() {
            return home.join("Downloads").join("Witra");
        }
        PathBuf::from("Witra Downloads")
    }
}

/// The machine hostname, used as the device name in discovery datagrams.
pub fn device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "witra-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_load_writes_template_and_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(config.display_name.is_none());
        assert!(config.download_path.is_none());
        assert!(path.exists());

        let template = std::fs::read_to_string(&path).unwrap();
        assert!(template.contains("display_name"));
        assert!(template.contains("download_path"));

        // The template itself parses back to the defaults.
        let again = Config::load_or_init(&path).unwrap();
        assert!(again.display_name.is_none());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config {
            display_name: Some("Alice".to_string()),
            download_path: Some(PathBuf::from("/tmp/witra")),
        };
        config.save(&path).unwrap();

        let loaded = Config::load_or_init(&path).unwrap();
        assert_eq!(loaded.display_name.as_deref(), Some("Alice"));
        assert_eq!(loaded.resolve_download_path(), PathBuf::from("/tmp/witra"));
        assert_eq!(loaded.resolve_display_name(), "Alice");
    }

    #[test]
    fn empty_values_fall_back() {
        let config = Config {
            display_name: Some(String::new()),
            download_path: Some(PathBuf::new()),
        };
        assert!(!config.resolve_display_name().is_empty());
        assert!(!config.resolve_download_path().as_os_str().is_empty());
    }
}
