#![cfg(windows)]

//! Registry fallback for [`super::Config`] (spec §4.A, §6): `HKLM\SOFTWARE\Cimian\Config`.
//! Used only when `Config.yaml` is absent. Typed coercion rules: boolean
//! keys accept an integer `0`/`1` or a case-insensitive `true`/`false`;
//! array keys accept either a Windows multi-string (`REG_MULTI_SZ`) or a
//! single comma-separated string.

use std::path::PathBuf;

use thiserror::Error;
use url::Url;
use winreg::enums::*;
use winreg::RegKey;

use super::Config;

const KEY_PATH: &str = r"SOFTWARE\Cimian\Config";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry key HKLM\\SOFTWARE\\Cimian\\Config was not found")]
    KeyNotFound,
    #[error("registry value `{0}` is missing or of the wrong type")]
    MissingValue(&'static str),
    #[error("registry value `{0}` could not be interpreted: {1}")]
    InvalidValue(&'static str, String),
}

fn open_key() -> Result<RegKey, RegistryError> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    hklm.open_subkey(KEY_PATH)
        .or_else(|_| hklm.open_subkey_with_flags(KEY_PATH, KEY_READ | KEY_WOW64_64KEY))
        .map_err(|_| RegistryError::KeyNotFound)
}

fn read_string(key: &RegKey, name: &'static str) -> Result<String, RegistryError> {
    key.get_value(name)
        .map_err(|_| RegistryError::MissingValue(name))
}

fn read_string_opt(key: &RegKey, name: &'static str) -> Option<String> {
    key.get_value(name).ok()
}

fn read_bool(key: &RegKey, name: &'static str, default: bool) -> Result<bool, RegistryError> {
    // DWORD (0/1) first, then a string coerced case-insensitively.
    if let Ok(n) = key.get_value::<u32, _>(name) {
        return Ok(n != 0);
    }
    match key.get_value::<String, _>(name) {
        Ok(s) => match s.to_ascii_lowercase().as_str() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(RegistryError::InvalidValue(name, other.to_string())),
        },
        Err(_) => Ok(default),
    }
}

fn read_list(key: &RegKey, name: &'static str) -> Vec<String> {
    if let Ok(values) = key.get_value::<Vec<String>, _>(name) {
        return values;
    }
    match key.get_value::<String, _>(name) {
        Ok(s) => s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn load() -> Result<Config, RegistryError> {
    let key = open_key()?;

    let repo_url_str = read_string(&key, "RepoUrl")?;
    let repo_url =
        Url::parse(&repo_url_str).map_err(|e| RegistryError::InvalidValue("RepoUrl", e.to_string()))?;

    Ok(Config {
        repo_url,
        cache_path: PathBuf::from(read_string(&key, "CachePath")?),
        catalogs_path: PathBuf::from(read_string(&key, "CatalogsPath")?),
        manifests_path: PathBuf::from(read_string(&key, "ManifestsPath")?),
        local_manifests: read_list(&key, "LocalManifests"),
        local_only_manifest: read_string_opt(&key, "LocalOnlyManifest").map(PathBuf::from),
        default_arch: read_string_opt(&key, "DefaultArch").unwrap_or_else(|| "x64".to_string()),
        default_catalog: read_string_opt(&key, "DefaultCatalog")
            .unwrap_or_else(|| "Production".to_string()),
        catalogs: read_list(&key, "Catalogs"),
        client_identifier: read_string(&key, "ClientIdentifier")?,
        log_level: read_string_opt(&key, "LogLevel").unwrap_or_else(|| "info".to_string()),
        force_execution_policy_bypass: read_bool(&key, "ForceExecutionPolicyBypass", true)?,
        force_basic_auth: read_bool(&key, "ForceBasicAuth", false)?,
        open_imported_yaml: read_bool(&key, "OpenImportedYaml", false)?,
    })
}
