//! Client configuration management.
//!
//! Configuration is stored as TOML:
//! - Linux: `~/.config/scrubdrop/client.toml`
//! - Windows: `%APPDATA%/scrubdrop/client.toml`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// API root, e.g. `https://data.example.org/api/v1`.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Authentication token sent as `Girder-Token`.
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Automatic resume/restart attempts before giving up.
    #[serde(default = "default_attempts")]
    pub auto_resume_attempts: u32,

    /// DICOM attributes blanked before upload.
    #[serde(default = "default_scrub_tags")]
    pub scrub_tags: Vec<String>,

    #[serde(default = "default_strip_exif")]
    pub strip_exif: bool,
}

fn default_api_url() -> String {
    "http://localhost:8080/api/v1".into()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_attempts() -> u32 {
    3
}

fn default_scrub_tags() -> Vec<String> {
    vec!["PatientName".into(), "PatientBirthDate".into()]
}

fn default_strip_exif() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token: String::new(),
            chunk_size: default_chunk_size(),
            auto_resume_attempts: default_attempts(),
            scrub_tags: default_scrub_tags(),
            strip_exif: default_strip_exif(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from the default location, or creates a default
    /// if not found.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = ClientConfig::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Saves the configuration to `path`.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // Restrict permissions on Unix (may contain a token).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("scrubdrop")
            .join("client.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("scrubdrop").join("client.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/scrubdrop/client.toml"))
    }
}
