// src/deps/mod.rs

//! Dependency classes, single dependencies, and dependency sets
//!
//! A dependency is a (class, name, flags) triple like
//! `soname: ELF32/libfoo.so.0(SysV x86)` or `userinfo: foo`. Components
//! aggregate per-file dependencies into provides/requires sets; the
//! repository interns the triples in the Dependencies table.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Known dependency classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DepClass {
    Abi,
    Soname,
    File,
    Trove,
    Python,
    Perl,
    UserInfo,
    GroupInfo,
}

impl DepClass {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Abi => "abi",
            Self::Soname => "soname",
            Self::File => "file",
            Self::Trove => "trove",
            Self::Python => "python",
            Self::Perl => "perl",
            Self::UserInfo => "userinfo",
            Self::GroupInfo => "groupinfo",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "abi" => Ok(Self::Abi),
            "soname" => Ok(Self::Soname),
            "file" => Ok(Self::File),
            "trove" => Ok(Self::Trove),
            "python" => Ok(Self::Python),
            "perl" => Ok(Self::Perl),
            "userinfo" => Ok(Self::UserInfo),
            "groupinfo" => Ok(Self::GroupInfo),
            other => Err(Error::ParseError(format!(
                "unknown dependency class '{other}'"
            ))),
        }
    }

    /// Numeric tag used by the Dependencies table.
    pub fn id(&self) -> i64 {
        match self {
            Self::Abi => 0,
            Self::Soname => 1,
            Self::File => 2,
            Self::Trove => 3,
            Self::Python => 4,
            Self::Perl => 5,
            Self::UserInfo => 6,
            Self::GroupInfo => 7,
        }
    }
}

/// A single dependency
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dependency {
    pub class: DepClass,
    pub name: String,
    pub flags: BTreeSet<String>,
}

impl Dependency {
    pub fn new(class: DepClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
            flags: BTreeSet::new(),
        }
    }

    pub fn with_flags<I, S>(class: DepClass, name: impl Into<String>, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            class,
            name: name.into(),
            flags: flags.into_iter().map(Into::into).collect(),
        }
    }

    /// A provided dependency satisfies a required one when class and name
    /// match and the provider carries every required flag.
    pub fn satisfies(&self, required: &Dependency) -> bool {
        self.class == required.class
            && self.name == required.name
            && required.flags.is_subset(&self.flags)
    }

    /// Parse `class: name` or `class: name(flag flag)`.
    pub fn parse(s: &str) -> Result<Self> {
        let (class_tag, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("dependency '{s}' is missing a class")))?;
        let class = DepClass::from_tag(class_tag.trim())?;
        let rest = rest.trim();
        let (name, flags) = match rest.split_once('(') {
            Some((name, flag_part)) => {
                let flag_part = flag_part
                    .strip_suffix(')')
                    .ok_or_else(|| Error::ParseError(format!("unterminated flags in '{s}'")))?;
                let flags: BTreeSet<String> = flag_part
                    .split_whitespace()
                    .map(|f| f.to_string())
                    .collect();
                (name.trim(), flags)
            }
            None => (rest, BTreeSet::new()),
        };
        if name.is_empty() {
            return Err(Error::ParseError(format!("dependency '{s}' has no name")));
        }
        Ok(Self {
            class,
            name: name.to_string(),
            flags,
        })
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class.tag(), self.name)?;
        if !self.flags.is_empty() {
            let flags: Vec<&str> = self.flags.iter().map(|s| s.as_str()).collect();
            write!(f, "({})", flags.join(" "))?;
        }
        Ok(())
    }
}

/// An ordered, deduplicated set of dependencies
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencySet {
    deps: BTreeSet<Dependency>,
}

impl DependencySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dep: Dependency) {
        // Same (class, name) entries merge their flags.
        if let Some(existing) = self
            .deps
            .iter()
            .find(|d| d.class == dep.class && d.name == dep.name)
            .cloned()
        {
            self.deps.remove(&existing);
            let mut merged = existing;
            merged.flags.extend(dep.flags);
            self.deps.insert(merged);
        } else {
            self.deps.insert(dep);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter()
    }

    pub fn contains(&self, dep: &Dependency) -> bool {
        self.deps.contains(dep)
    }

    pub fn union(&self, other: &DependencySet) -> DependencySet {
        let mut merged = self.clone();
        for dep in other.iter() {
            merged.add(dep.clone());
        }
        merged
    }

    /// Requirements in `self` not satisfied by any dependency in `provides`.
    pub fn unsatisfied_by(&self, provides: &DependencySet) -> Vec<&Dependency> {
        self.deps
            .iter()
            .filter(|req| !provides.deps.iter().any(|p| p.satisfies(req)))
            .collect()
    }

    pub fn satisfied_by(&self, provides: &DependencySet) -> bool {
        self.unsatisfied_by(provides).is_empty()
    }

    /// Canonical multi-line frozen form, one dependency per line.
    pub fn freeze(&self) -> String {
        let mut lines: Vec<String> = self.deps.iter().map(|d| d.to_string()).collect();
        lines.sort();
        lines.join("\n")
    }

    pub fn thaw(s: &str) -> Result<Self> {
        let mut set = Self::new();
        for line in s.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            set.add(Dependency::parse(line)?);
        }
        Ok(set)
    }

    /// Group by class, for display.
    pub fn by_class(&self) -> BTreeMap<DepClass, Vec<&Dependency>> {
        let mut map: BTreeMap<DepClass, Vec<&Dependency>> = BTreeMap::new();
        for dep in &self.deps {
            map.entry(dep.class).or_default().push(dep);
        }
        map
    }
}

impl FromIterator<Dependency> for DependencySet {
    fn from_iter<T: IntoIterator<Item = Dependency>>(iter: T) -> Self {
        let mut set = Self::new();
        for dep in iter {
            set.add(dep);
        }
        set
    }
}
