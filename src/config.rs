use crate::depot::storage::{DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_METADATA_FILE};
use crate::depot::DepotOptions;
use anyhow::{bail, Context, Result};
use chrono::TimeDelta;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable that overrides `storage_root`.
pub const STORAGE_ROOT_ENV: &str = "FILEDOCK_STORAGE_ROOT";
/// Older deployments set this instead.
const LEGACY_STORAGE_ROOT_ENV: &str = "UPLOAD_FOLDER";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for uploads; `~` is expanded.
    pub storage_root: String,
    /// Metadata document name inside the storage root.
    pub metadata_file: String,
    pub allowed_extensions: Vec<String>,
    /// Unviewed uploads younger than this are flagged new.
    pub new_file_window_hours: u32,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: "./uploads".into(),
            metadata_file: DEFAULT_METADATA_FILE.into(),
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect(),
            new_file_window_hours: 24,
            log_level: "info".into(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            max_upload_bytes: 100 * 1024 * 1024,
            request_timeout_secs: 120,
        }
    }
}

impl Config {
    /// Load from `path`, or from the per-user default location. A missing
    /// file yields defaults; environment overrides apply either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("Failed to read config {}", p.display()))?;
                Self::from_toml(&raw)
                    .with_context(|| format!("Failed to parse config {}", p.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        let root = std::env::var(STORAGE_ROOT_ENV)
            .or_else(|_| std::env::var(LEGACY_STORAGE_ROOT_ENV))
            .ok()
            .filter(|v| !v.trim().is_empty());
        if let Some(root) = root {
            self.storage_root = root;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_root.trim().is_empty() {
            bail!("storage_root must not be empty");
        }
        if self.metadata_file.trim().is_empty() {
            bail!("metadata_file must not be empty");
        }
        if self.metadata_file.contains(['/', '\\']) {
            bail!("metadata_file must be a bare file name, got {:?}", self.metadata_file);
        }
        if self.allowed_extensions.is_empty() {
            bail!("allowed_extensions must list at least one extension");
        }
        if self.gateway.max_upload_bytes == 0 {
            bail!("gateway.max_upload_bytes must be positive");
        }
        Ok(())
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.storage_root).into_owned())
    }

    pub fn depot_options(&self) -> DepotOptions {
        DepotOptions {
            metadata_file: self.metadata_file.clone(),
            allowed_extensions: self
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            new_file_window: TimeDelta::hours(i64::from(self.new_file_window_hours)),
        }
    }
}

/// `<config dir>/filedock/config.toml` for the current user.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "filedock").map(|dirs| dirs.config_dir().join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_gives_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.metadata_file, "file_metadata.json");
        assert_eq!(config.gateway.port, 5000);
        assert!(config.allowed_extensions.contains(&"zip".to_string()));
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_overrides() {
        let config = Config::from_toml(
            r#"
            storage_root = "~/filedock"
            allowed_extensions = [".TXT", "pdf"]
            new_file_window_hours = 48

            [gateway]
            port = 8080
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert!(!config.storage_root().to_string_lossy().starts_with('~'));

        let options = config.depot_options();
        assert!(options.allowed_extensions.contains("txt"));
        assert_eq!(options.allowed_extensions.len(), 2);
        assert_eq!(options.new_file_window, TimeDelta::hours(48));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = Config::default();
        config.metadata_file = "nested/meta.json".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.allowed_extensions.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.new_file_window_hours, 24);
    }
}
