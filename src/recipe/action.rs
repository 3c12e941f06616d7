// src/recipe/action.rs

//! Action records accumulated by a recipe
//!
//! An action is immutable once appended: kind, positional inputs, keyword
//! options, an optional use-flavor guard, and the recipe source line it was
//! declared on. Actions whose output belongs to a non-default package or
//! component carry a manifest target.

use crate::error::{Error, Result};
use crate::flavor::Flavor;
use std::collections::BTreeMap;
use std::fmt;

/// Which list of the recipe an action belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    /// Fetch/unpack/patch, before the build starts
    Source,
    /// Compilation and installation into the destdir
    Build,
}

/// How the action does its work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionBody {
    /// A shell command template with `%(macro)s` placeholders
    Command(String),
    /// Copy a file from the build directory into the destdir
    Install {
        source: String,
        dest: String,
        mode: u32,
    },
    /// Create directories under the destdir
    MakeDirs { paths: Vec<String>, mode: u32 },
    /// Create a symlink inside the destdir
    Symlink { target: String, link: String },
    /// Remove destdir paths matching globs
    Remove { patterns: Vec<String> },
    /// Create a file in the destdir with literal contents
    Create {
        path: String,
        contents: String,
        mode: u32,
    },
    /// Unpack an archive into the build directory
    Unpack { archive: String, dir: String },
    /// Apply a unified diff to the build directory
    Patch { file: String, level: u32 },
}

/// Attribution target `package:component`; either side may be empty to
/// keep the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTarget {
    pub package: Option<String>,
    pub component: Option<String>,
}

impl ManifestTarget {
    /// Parse `pkg:comp`, `pkg:`, or `:comp`.
    pub fn parse(s: &str) -> Result<Self> {
        let (pkg, comp) = s
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("manifest target '{s}' needs a ':'")))?;
        if comp.contains(':') {
            return Err(Error::ParseError(format!(
                "manifest target '{s}' has too many ':'"
            )));
        }
        let none_if_empty = |part: &str| {
            if part.is_empty() {
                None
            } else {
                Some(part.to_string())
            }
        };
        Ok(Self {
            package: none_if_empty(pkg),
            component: none_if_empty(comp),
        })
    }
}

impl fmt::Display for ManifestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.package.as_deref().unwrap_or(""),
            self.component.as_deref().unwrap_or("")
        )
    }
}

/// Keyword options common to all actions
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ActionOptions {
    /// Working directory: absolute paths resolve under the destdir,
    /// relative paths under the builddir.
    pub dir: Option<String>,
    /// Missing inputs are a warning instead of an abort.
    pub allow_no_match: bool,
    /// Source action that must not be archived with the source trove.
    pub ephemeral: bool,
    /// Attribution override for files this action produces.
    pub manifest: Option<ManifestTarget>,
    /// Anything helper-specific, kept as strings the way the recipe wrote
    /// them.
    pub extra: BTreeMap<String, String>,
}

/// One recorded action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Helper name as invoked, e.g. "Configure"
    pub name: String,
    pub phase: ActionPhase,
    pub body: ActionBody,
    /// Positional inputs as written in the recipe
    pub inputs: Vec<String>,
    pub options: ActionOptions,
    /// Flavor expression; when unsatisfied the action is skipped
    pub use_guard: Option<Flavor>,
    /// Line in the recipe where the action was declared
    pub source_line: u32,
    /// Build requirements this helper implies, by trove name
    pub build_requires: Vec<String>,
    /// Build requirements implied by executable paths in the command
    pub path_requires: Vec<String>,
}

impl Action {
    /// True when the guard (if any) passes against the recipe's use flags.
    pub fn enabled(&self, use_flags: &Flavor) -> bool {
        match &self.use_guard {
            None => true,
            Some(guard) => use_flags.satisfies(guard),
        }
    }
}
