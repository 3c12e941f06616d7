// src/policy/mod.rs

//! Destdir policy pipeline
//!
//! After the build runner populates the destdir, a fixed sequence of
//! single-purpose passes normalizes the tree, partitions it into
//! (package, component) pairs, derives per-file dependencies, and enforces
//! build-requirement completeness. Passes run in four buckets; a failing
//! pass does not stop its bucket, and all failures in a bucket are reported
//! as one grouped error.

pub mod destdir;
pub mod packaging;

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::macros::Macros;
use crate::recipe::ManifestTarget;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Pipeline stage. Buckets run in declaration order; within a bucket the
/// pass order is the pipeline's registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bucket {
    DestdirPreparation,
    DestdirModification,
    PackageCreation,
    Enforcement,
}

const BUCKETS: [Bucket; 4] = [
    Bucket::DestdirPreparation,
    Bucket::DestdirModification,
    Bucket::PackageCreation,
    Bucket::Enforcement,
];

/// Per-pass exclusion patterns, keyed by pass name.
#[derive(Debug, Default)]
pub struct PolicyExceptions {
    patterns: BTreeMap<String, Vec<Regex>>,
}

impl PolicyExceptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude destdir paths matching `pattern` from the named pass.
    pub fn add(&mut self, policy: &str, pattern: &str) -> Result<()> {
        let re = Regex::new(pattern)
            .map_err(|e| Error::ParseError(format!("bad exception pattern '{pattern}': {e}")))?;
        self.patterns.entry(policy.to_string()).or_default().push(re);
        Ok(())
    }

    pub fn excluded(&self, policy: &str, path: &str) -> bool {
        self.patterns
            .get(policy)
            .map(|res| res.iter().any(|re| re.is_match(path)))
            .unwrap_or(false)
    }
}

/// Per-file dependency information accumulated by the packaging passes
#[derive(Debug, Clone, Default)]
pub struct FileDeps {
    pub provides: DependencySet,
    pub requires: DependencySet,
}

/// Shared state threaded through every pass
pub struct PolicyContext<'a> {
    pub destdir: &'a Path,
    /// Top of the build tree, for passes that read build outputs that were
    /// never installed (AutoDoc).
    pub builddir: Option<PathBuf>,
    pub macros: &'a Macros,
    /// Per-file attribution recorded by the build runner; moves performed
    /// by passes keep this in sync.
    pub manifest: BTreeMap<String, Option<ManifestTarget>>,
    /// (glob pattern, target) entries that override the global component
    /// patterns.
    pub explicit_manifest: &'a [(String, ManifestTarget)],
    pub default_package: String,
    pub build_requires: &'a BTreeSet<String>,
    pub exceptions: &'a PolicyExceptions,
    /// Explicit python interpreter choices, script path -> interpreter.
    pub python_version_map: BTreeMap<String, String>,
    /// soname -> trove name, for enforcement. Populated from the caller's
    /// database when one is available.
    pub soname_troves: BTreeMap<String, String>,

    pub warnings: Vec<String>,
    /// Directory path -> intended final mode, recorded by FixDirModes.
    pub dir_modes: BTreeMap<String, u32>,
    /// Destdir paths tagged as shared libraries.
    pub shlibs: BTreeSet<String>,
    /// Final (package, component) per surviving file.
    pub assignments: BTreeMap<String, (String, String)>,
    pub file_deps: BTreeMap<String, FileDeps>,
    /// Aggregated per-component dependency sets.
    pub component_provides: BTreeMap<(String, String), DependencySet>,
    pub component_requires: BTreeMap<(String, String), DependencySet>,
}

impl<'a> PolicyContext<'a> {
    pub fn new(
        destdir: &'a Path,
        macros: &'a Macros,
        manifest: BTreeMap<String, Option<ManifestTarget>>,
        explicit_manifest: &'a [(String, ManifestTarget)],
        default_package: &str,
        build_requires: &'a BTreeSet<String>,
        exceptions: &'a PolicyExceptions,
    ) -> Self {
        Self {
            destdir,
            builddir: None,
            macros,
            manifest,
            explicit_manifest,
            default_package: default_package.to_string(),
            build_requires,
            exceptions,
            python_version_map: BTreeMap::new(),
            soname_troves: BTreeMap::new(),
            warnings: Vec::new(),
            dir_modes: BTreeMap::new(),
            shlibs: BTreeSet::new(),
            assignments: BTreeMap::new(),
            file_deps: BTreeMap::new(),
            component_provides: BTreeMap::new(),
            component_requires: BTreeMap::new(),
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("{message}");
        self.warnings.push(message);
    }

    /// Absolute on-disk path for a destdir-relative path like `/usr/bin/x`.
    pub fn real_path(&self, rel: &str) -> PathBuf {
        self.destdir.join(rel.trim_start_matches('/'))
    }

    /// Destdir-relative form of an on-disk path, or `None` if outside.
    pub fn rel_path(&self, real: &Path) -> Option<String> {
        real.strip_prefix(self.destdir)
            .ok()
            .map(|p| format!("/{}", p.to_string_lossy()))
    }

    /// Move a file within the destdir, keeping the manifest in step.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let src = self.real_path(from);
        let dst = self.real_path(to);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&src, &dst)?;
        let target = self.manifest.remove(from).unwrap_or(None);
        self.manifest.insert(to.to_string(), target);
        debug!("moved {from} -> {to}");
        Ok(())
    }

    /// Delete a file and its manifest entry.
    pub fn remove(&mut self, rel: &str) -> Result<()> {
        std::fs::remove_file(self.real_path(rel))?;
        self.manifest.remove(rel);
        debug!("removed {rel}");
        Ok(())
    }

    /// Register a new file created by a pass (symlinks, doc copies).
    pub fn record(&mut self, rel: &str, target: Option<ManifestTarget>) {
        self.manifest.insert(rel.to_string(), target);
    }

    /// Destdir-relative paths of all regular files and symlinks, sorted.
    pub fn walk(&self) -> Vec<String> {
        let mut paths: Vec<String> = walkdir::WalkDir::new(self.destdir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .filter_map(|e| self.rel_path(e.path()))
            .collect();
        paths.sort();
        paths
    }
}

/// One pipeline pass
pub trait Policy {
    /// Pass name, used for exception lookup and error attribution.
    fn name(&self) -> &'static str;

    fn bucket(&self) -> Bucket;

    fn run(&self, ctx: &mut PolicyContext) -> Result<()>;
}

/// An ordered set of passes grouped into buckets
pub struct Pipeline {
    policies: Vec<Box<dyn Policy>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// The full standard pipeline.
    pub fn standard() -> Self {
        let mut p = Self::new();
        p.add(Box::new(destdir::FixDirModes));
        p.add(Box::new(destdir::AutoDoc));
        p.add(Box::new(destdir::RemoveNonPackageFiles));
        p.add(Box::new(destdir::FixupMultilibPaths));
        p.add(Box::new(destdir::ExecutableLibraries));
        p.add(Box::new(destdir::NormalizeCompression));
        p.add(Box::new(destdir::FixupManpagePaths));
        p.add(Box::new(destdir::NormalizeManPages));
        p.add(Box::new(destdir::NormalizeAppDefaults));
        p.add(Box::new(destdir::NormalizeInterpreterPaths));
        p.add(Box::new(destdir::NormalizePythonInterpreterVersion));
        p.add(Box::new(destdir::NormalizePkgConfig));
        p.add(Box::new(destdir::NormalizeInfoPages));
        p.add(Box::new(destdir::NormalizePamConfig));
        p.add(Box::new(destdir::RelativeSymlinks));
        p.add(Box::new(destdir::NormalizeLibrarySymlinks));
        p.add(Box::new(destdir::ReadableDocs));
        p.add(Box::new(destdir::Strip));
        p.add(Box::new(packaging::PackageSpec));
        p.add(Box::new(packaging::DeriveDependencies));
        p.add(Box::new(packaging::EnforceSonameBuildRequirements));
        p
    }

    pub fn add(&mut self, policy: Box<dyn Policy>) {
        self.policies.push(policy);
    }

    /// Reject registration orders that would let a normalization pass see
    /// files RemoveNonPackageFiles is about to delete.
    fn validate(&self) -> Result<()> {
        let remove_at = self
            .policies
            .iter()
            .position(|p| p.name() == "RemoveNonPackageFiles");
        if let Some(remove_at) = remove_at {
            for (i, p) in self.policies.iter().enumerate() {
                if p.name().starts_with("Normalize") && i < remove_at {
                    return Err(Error::PolicyError(vec![format!(
                        "{} must not run before RemoveNonPackageFiles",
                        p.name()
                    )]));
                }
            }
        }
        Ok(())
    }

    /// Run every bucket in order. All failures within a bucket are
    /// collected and reported together; a failed bucket stops the pipeline.
    pub fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        self.validate()?;
        for bucket in BUCKETS {
            let mut errors = Vec::new();
            for policy in self.policies.iter().filter(|p| p.bucket() == bucket) {
                debug!(policy = policy.name(), ?bucket, "running");
                if let Err(e) = policy.run(ctx) {
                    errors.push(format!("{}: {e}", policy.name()));
                }
            }
            if !errors.is_empty() {
                return Err(Error::PolicyError(errors));
            }
        }
        Ok(())
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::standard()
    }
}
