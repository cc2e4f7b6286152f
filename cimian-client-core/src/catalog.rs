//! The Catalog Store (spec §4.C): `LoadCatalogs(cfg, facts) -> CatalogIndex`.
//!
//! Catalogs are loaded in listed order; later catalogs override earlier
//! ones at `(name, version)` granularity. `by_name` returns, among entries
//! whose `supported_architectures` includes the host's arch, the one with
//! the greatest version; if no entry supports the arch at all it reports
//! `ArchitectureMismatch` rather than `NotFound`, per spec §4.C/§7 (a
//! warning, not an error).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cimian_types::{Architecture, CatalogItem, SystemFacts};
use thiserror::Error;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("could not read catalog file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse catalog file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub enum ByNameResult<'a> {
    Found(&'a CatalogItem),
    ArchitectureMismatch { supported: Vec<Architecture> },
    NotFound,
}

#[derive(Debug, Default)]
pub struct CatalogIndex {
    items: HashMap<(String, String), CatalogItem>,
}

impl CatalogIndex {
    fn insert(&mut self, item: CatalogItem) {
        let key = (item.name.clone(), item.version.as_str().to_string());
        self.items.insert(key, item);
    }

    pub fn by_version(&self, name: &str, version: &str) -> Option<&CatalogItem> {
        self.items.get(&(name.to_string(), version.to_string()))
    }

    pub fn by_name(&self, name: &str, arch: &str) -> ByNameResult<'_> {
        let candidates: Vec<&CatalogItem> =
            self.items.values().filter(|i| i.name == name).collect();

        if candidates.is_empty() {
            return ByNameResult::NotFound;
        }

        let supporting: Vec<&CatalogItem> = candidates
            .iter()
            .filter(|i| i.supports_arch(arch))
            .copied()
            .collect();

        if supporting.is_empty() {
            let mut supported: Vec<Architecture> = candidates
                .iter()
                .flat_map(|i| i.supported_architectures.clone())
                .collect();
            supported.dedup();
            return ByNameResult::ArchitectureMismatch { supported };
        }

        let best = supporting
            .into_iter()
            .max_by(|a, b| a.version.cmp(&b.version))
            .expect("non-empty after filter");

        ByNameResult::Found(best)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// All catalog entries across all names and versions, in no particular
    /// order. Used by the dependency walk to scan `requires`/`update_for`.
    pub fn all(&self) -> impl Iterator<Item = &CatalogItem> {
        self.items.values()
    }
}

pub fn load_catalogs(cfg: &Config, facts: &SystemFacts) -> Result<CatalogIndex, CatalogError> {
    let names = if !facts.catalogs.is_empty() {
        facts.catalogs.clone()
    } else {
        cfg.catalog_list()
    };

    let mut index = CatalogIndex::default();
    for name in names {
        let path = cfg.catalogs_path.join(format!("{}.yaml", name));
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(CatalogError::Read {
                    path,
                    source,
                })
            }
        };

        let items: Vec<CatalogItem> =
            serde_yaml::from_str(&contents).map_err(|source| CatalogError::Parse { path, source })?;

        for item in items {
            index.insert(item);
        }
    }

    Ok(index)
}

pub fn load_catalog_file(path: &Path) -> Result<Vec<CatalogItem>, CatalogError> {
    let contents = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn item(name: &str, version: &str, arch: Option<Architecture>) -> CatalogItem {
        CatalogItem::builder()
            .name(name.to_string())
            .display_name(name.to_string())
            .version(cimian_types::Version::from_str(version).unwrap())
            .supported_architectures(arch.into_iter().collect())
            .build()
    }

    #[test]
    fn test_by_name_picks_greatest_version() {
        let mut index = CatalogIndex::default();
        index.insert(item("Chrome", "1.0.0", None));
        index.insert(item("Chrome", "2.0.0", None));
        match index.by_name("Chrome", "x64") {
            ByNameResult::Found(i) => assert_eq!(i.version.as_str(), "2.0.0"),
            other => panic!("expected Found, got {:?}", other),
        }
    }

    #[test]
    fn test_by_name_arch_mismatch() {
        let mut index = CatalogIndex::default();
        index.insert(item("Chrome", "1.0.0", Some(Architecture::Arm64)));
        match index.by_name("Chrome", "x64") {
            ByNameResult::ArchitectureMismatch { supported } => {
                assert_eq!(supported, vec![Architecture::Arm64]);
            }
            other => panic!("expected ArchitectureMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_by_name_not_found() {
        let index = CatalogIndex::default();
        assert!(matches!(index.by_name("Missing", "x64"), ByNameResult::NotFound));
    }

    #[test]
    fn test_later_catalog_overrides_same_name_version() {
        let mut index = CatalogIndex::default();
        let mut first = item("Chrome", "1.0.0", None);
        first.display_name = "First".to_string();
        index.insert(first);
        let mut second = item("Chrome", "1.0.0", None);
        second.display_name = "Second".to_string();
        index.insert(second);
        assert_eq!(
            index.by_version("Chrome", "1.0.0").unwrap().display_name,
            "Second"
        );
    }
}
