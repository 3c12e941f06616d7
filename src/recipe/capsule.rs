// src/recipe/capsule.rs

//! Capsule registration: external archives packaged as-is
//!
//! A capsule (an RPM, typically) is carried through the build without being
//! exploded into individually managed files. The recipe records which
//! capsule owns which contained path together with the attributes the
//! capsule header declares, so packaging can reproduce ownership and modes
//! exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Capsule archive format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsuleKind {
    Rpm,
}

impl CapsuleKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rpm" => Ok(Self::Rpm),
            other => Err(Error::RecipeFileError(format!(
                "unknown capsule type '{other}'"
            ))),
        }
    }
}

/// Attributes a capsule header declares for one contained path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsulePathInfo {
    pub user: String,
    pub group: String,
    pub mode: u32,
    pub size: u64,
    pub rdev: u32,
    pub flags: u32,
    pub mtime: u64,
}

impl CapsulePathInfo {
    /// Attribute equality for conflict detection. Rebuilt archives get new
    /// mtimes, so mtime never counts as a conflict.
    fn agrees_with(&self, other: &Self) -> bool {
        self.user == other.user
            && self.group == other.group
            && self.mode == other.mode
            && self.size == other.size
            && self.rdev == other.rdev
            && self.flags == other.flags
    }
}

#[derive(Debug, Clone)]
struct CapsuleRecord {
    kind: CapsuleKind,
    package: String,
}

/// All capsules a recipe registers, with their per-path attribute claims
#[derive(Debug, Clone, Default)]
pub struct CapsuleMap {
    /// capsule path -> record
    capsules: BTreeMap<String, CapsuleRecord>,
    /// contained file path -> capsule path -> declared attributes
    paths: BTreeMap<String, BTreeMap<String, CapsulePathInfo>>,
}

impl CapsuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.capsules.is_empty()
    }

    /// `r.addCapsule(path, type, packageName)`
    pub fn add_capsule(&mut self, path: &str, kind: CapsuleKind, package: &str) -> Result<()> {
        if self.capsules.contains_key(path) {
            return Err(Error::RecipeFileError(format!(
                "capsule {path} registered twice"
            )));
        }
        debug!(capsule = path, package, "registered capsule");
        self.capsules.insert(
            path.to_string(),
            CapsuleRecord {
                kind,
                package: package.to_string(),
            },
        );
        Ok(())
    }

    pub fn kind_of(&self, capsule_path: &str) -> Option<CapsuleKind> {
        self.capsules.get(capsule_path).map(|r| r.kind)
    }

    /// Record the attributes `capsule_path` declares for `file_path`.
    ///
    /// Two capsules may claim the same path only when their attributes
    /// agree; mtime differences are tolerated.
    pub fn set_path_info_for_capsule(
        &mut self,
        capsule_path: &str,
        file_path: &str,
        info: CapsulePathInfo,
    ) -> Result<()> {
        if !self.capsules.contains_key(capsule_path) {
            return Err(Error::RecipeFileError(format!(
                "capsule {capsule_path} not registered"
            )));
        }
        let claims = self.paths.entry(file_path.to_string()).or_default();
        for (other_capsule, other_info) in claims.iter() {
            if other_capsule != capsule_path && !other_info.agrees_with(&info) {
                return Err(Error::RecipeFileError(format!(
                    "conflicting attributes for {file_path}: {capsule_path} vs {other_capsule}"
                )));
            }
        }
        claims.insert(capsule_path.to_string(), info);
        Ok(())
    }

    /// `r.getCapsulePathsForFile(path)`: which capsules contain this file.
    pub fn capsule_paths_for_file(&self, file_path: &str) -> Vec<&str> {
        self.paths
            .get(file_path)
            .map(|claims| claims.keys().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// (filePath, capsulePath, package) for every claim.
    pub fn iter_file_capsules(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.paths.iter().flat_map(move |(file, claims)| {
            claims.keys().filter_map(move |capsule| {
                self.capsules
                    .get(capsule)
                    .map(|r| (file.as_str(), capsule.as_str(), r.package.as_str()))
            })
        })
    }

    /// (filePath, package, declared attributes) for every claim.
    pub fn iter_file_ownership(&self) -> impl Iterator<Item = (&str, &str, &CapsulePathInfo)> {
        self.paths.iter().flat_map(move |(file, claims)| {
            claims.iter().filter_map(move |(capsule, info)| {
                self.capsules
                    .get(capsule)
                    .map(|r| (file.as_str(), r.package.as_str(), info))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(mode: u32, mtime: u64) -> CapsulePathInfo {
        CapsulePathInfo {
            user: "root".to_string(),
            group: "root".to_string(),
            mode,
            size: 100,
            rdev: 0,
            flags: 0,
            mtime,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut map = CapsuleMap::new();
        map.add_capsule("foo-1.0.rpm", CapsuleKind::Rpm, "foo").unwrap();
        map.set_path_info_for_capsule("foo-1.0.rpm", "/usr/bin/foo", info(0o755, 1))
            .unwrap();
        assert_eq!(map.capsule_paths_for_file("/usr/bin/foo"), ["foo-1.0.rpm"]);
        assert!(map.capsule_paths_for_file("/usr/bin/bar").is_empty());
        assert_eq!(map.kind_of("foo-1.0.rpm"), Some(CapsuleKind::Rpm));
    }

    #[test]
    fn test_duplicate_capsule_rejected() {
        let mut map = CapsuleMap::new();
        map.add_capsule("foo.rpm", CapsuleKind::Rpm, "foo").unwrap();
        assert!(map.add_capsule("foo.rpm", CapsuleKind::Rpm, "foo").is_err());
    }

    #[test]
    fn test_path_info_requires_registration() {
        let mut map = CapsuleMap::new();
        assert!(map
            .set_path_info_for_capsule("nope.rpm", "/etc/x", info(0o644, 1))
            .is_err());
    }

    #[test]
    fn test_conflict_ignores_mtime() {
        let mut map = CapsuleMap::new();
        map.add_capsule("a.rpm", CapsuleKind::Rpm, "a").unwrap();
        map.add_capsule("b.rpm", CapsuleKind::Rpm, "b").unwrap();
        map.set_path_info_for_capsule("a.rpm", "/etc/shared", info(0o644, 1))
            .unwrap();
        // Same attributes, different mtime: fine.
        map.set_path_info_for_capsule("b.rpm", "/etc/shared", info(0o644, 999))
            .unwrap();
        // Different mode: conflict.
        let err = map
            .set_path_info_for_capsule("b.rpm", "/etc/shared", info(0o600, 999))
            .unwrap_err();
        assert!(err.to_string().contains("/etc/shared"));
    }

    #[test]
    fn test_iterators() {
        let mut map = CapsuleMap::new();
        map.add_capsule("a.rpm", CapsuleKind::Rpm, "pkga").unwrap();
        map.set_path_info_for_capsule("a.rpm", "/usr/bin/a", info(0o755, 5))
            .unwrap();
        map.set_path_info_for_capsule("a.rpm", "/etc/a.conf", info(0o644, 5))
            .unwrap();

        let triples: Vec<_> = map.iter_file_capsules().collect();
        assert_eq!(
            triples,
            [("/etc/a.conf", "a.rpm", "pkga"), ("/usr/bin/a", "a.rpm", "pkga")]
        );

        let owners: Vec<_> = map
            .iter_file_ownership()
            .map(|(f, p, i)| (f, p, i.mode))
            .collect();
        assert_eq!(owners, [("/etc/a.conf", "pkga", 0o644), ("/usr/bin/a", "pkga", 0o755)]);
    }
}
