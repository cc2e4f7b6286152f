//! Process-wide configuration (spec §3, §4.A). A `Config` is an immutable
//! snapshot assembled once at the start of a run: first from the YAML file
//! at [`DEFAULT_CONFIG_PATH`], falling back to the registry hive
//! `HKLM\SOFTWARE\Cimian\Config` on Windows when the file is absent.

#[cfg(windows)]
pub mod registry;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = r"C:\ProgramData\ManagedInstalls\Config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration file at {0} and no registry fallback was found")]
    NotFound(PathBuf),
    #[error("could not read configuration file at {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse configuration file at {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[cfg(windows)]
    #[error("could not read configuration from the registry")]
    Registry(#[source] registry::RegistryError),
}

fn default_arch() -> String {
    "x64".to_string()
}

fn default_catalog() -> String {
    "Production".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Process-wide immutable configuration snapshot (spec §3 `Configuration`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub repo_url: Url,
    pub cache_path: PathBuf,
    pub catalogs_path: PathBuf,
    pub manifests_path: PathBuf,
    #[serde(default)]
    pub local_manifests: Vec<String>,
    pub local_only_manifest: Option<PathBuf>,
    #[serde(default = "default_arch")]
    pub default_arch: String,
    #[serde(default = "default_catalog")]
    pub default_catalog: String,
    /// Catalogs to load, in listed order (later entries override earlier
    /// ones at `(name, version)` granularity, spec §4.C). Falls back to
    /// `[default_catalog]` when empty.
    #[serde(default)]
    pub catalogs: Vec<String>,
    pub client_identifier: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub force_execution_policy_bypass: bool,
    #[serde(default)]
    pub force_basic_auth: bool,
    #[serde(default)]
    pub open_imported_yaml: bool,
}

impl Config {
    /// The catalogs to load, in order. Falls back to `[default_catalog]`
    /// when `catalogs` was not set.
    pub fn catalog_list(&self) -> Vec<String> {
        if self.catalogs.is_empty() {
            vec![self.default_catalog.clone()]
        } else {
            self.catalogs.clone()
        }
    }

    pub fn load_default() -> Result<Config, ConfigError> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Loads configuration per the search order in spec §4.A: the YAML file
    /// at `path`, then (Windows only) the registry fallback, then failure.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                Self::load_fallback(path)
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    #[cfg(windows)]
    fn load_fallback(path: &Path) -> Result<Config, ConfigError> {
        registry::load().map_err(|e| match e {
            registry::RegistryError::KeyNotFound => ConfigError::NotFound(path.to_path_buf()),
            other => ConfigError::Registry(other),
        })
    }

    #[cfg(not(windows))]
    fn load_fallback(path: &Path) -> Result<Config, ConfigError> {
        Err(ConfigError::NotFound(path.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_parses_yaml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "repoUrl: https://cimian.example.org/repo\n\
             cachePath: C:\\ProgramData\\ManagedInstalls\\Cache\n\
             catalogsPath: C:\\ProgramData\\ManagedInstalls\\catalogs\n\
             manifestsPath: C:\\ProgramData\\ManagedInstalls\\manifests\n\
             clientIdentifier: lab-042\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.default_arch, "x64");
        assert_eq!(config.default_catalog, "Production");
        assert!(config.force_execution_policy_bypass);
        assert_eq!(config.client_identifier, "lab-042");
    }

    #[test]
    fn test_missing_file_falls_back_or_errors() {
        let path = Path::new("this/path/definitely/does/not/exist.yaml");
        let result = Config::load(path);
        assert!(result.is_err());
    }
}
