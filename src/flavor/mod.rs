// src/flavor/mod.rs

//! Flavor parsing, matching, and scoring
//!
//! Flavors select among builds of the same trove. Syntax:
//! `[ssl, !debug, ~vmware, ~!xen, is: x86 x86_64]` where `is:` introduces
//! architecture items and everything else is a use flag. An empty flavor
//! matches anything.

use crate::error::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Sense of a single flavor item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlavorSense {
    /// Present, hard requirement (no prefix)
    Required,
    /// Absent, hard requirement (`!`)
    Disallowed,
    /// Present preferred (`~`)
    Preferred,
    /// Absent preferred (`~!`)
    Dispreferred,
}

impl FlavorSense {
    pub fn as_prefix(&self) -> &'static str {
        match self {
            Self::Required => "",
            Self::Disallowed => "!",
            Self::Preferred => "~",
            Self::Dispreferred => "~!",
        }
    }

    /// Parse a sense prefix, returning the sense and the remaining name.
    pub fn parse_with_name(s: &str) -> Result<(Self, &str)> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::ParseError("empty flavor item".to_string()));
        }
        let (sense, rest) = if let Some(rest) = s.strip_prefix("~!") {
            (Self::Dispreferred, rest)
        } else if let Some(rest) = s.strip_prefix('~') {
            (Self::Preferred, rest)
        } else if let Some(rest) = s.strip_prefix('!') {
            (Self::Disallowed, rest)
        } else {
            (Self::Required, s)
        };
        let name = rest.trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!(
                "missing name after {} operator",
                sense.as_prefix()
            )));
        }
        Ok((sense, name))
    }

    /// True for the hard senses.
    pub fn is_strong(&self) -> bool {
        matches!(self, Self::Required | Self::Disallowed)
    }
}

/// Class of a flavor item: use flag or architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlavorClass {
    Use,
    Arch,
}

/// A complete flavor: a map from (class, name) to sense
///
/// Names may carry a sub-flag spelled `name.flag` (e.g. `xen.domU`); the
/// flag travels inside the name and needs no special handling here.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Flavor {
    items: BTreeMap<(FlavorClass, String), FlavorSense>,
}

impl Flavor {
    /// The empty flavor; matches anything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Add or replace one item.
    pub fn insert(&mut self, class: FlavorClass, name: impl Into<String>, sense: FlavorSense) {
        self.items.insert((class, name.into()), sense);
    }

    pub fn get(&self, class: FlavorClass, name: &str) -> Option<FlavorSense> {
        self.items.get(&(class, name.to_string())).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FlavorClass, &str, FlavorSense)> {
        self.items
            .iter()
            .map(|((class, name), sense)| (*class, name.as_str(), *sense))
    }

    /// Parse a flavor string, bracketed or not.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let inner = if s.starts_with('[') && s.ends_with(']') {
            &s[1..s.len() - 1]
        } else {
            s
        };
        let mut flavor = Self::empty();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some(archs) = part.strip_prefix("is:") {
                let archs = archs.trim();
                if archs.is_empty() {
                    return Err(Error::ParseError(
                        "empty architecture specification after 'is:'".to_string(),
                    ));
                }
                for token in archs.split_whitespace() {
                    let (sense, name) = FlavorSense::parse_with_name(token)?;
                    flavor.insert(FlavorClass::Arch, name, sense);
                }
            } else {
                let (sense, name) = FlavorSense::parse_with_name(part)?;
                flavor.insert(FlavorClass::Use, name, sense);
            }
        }
        Ok(flavor)
    }

    /// Canonical frozen form; `thaw(freeze(f)) == f`.
    pub fn freeze(&self) -> String {
        self.to_string()
    }

    /// Parse a frozen flavor.
    pub fn thaw(s: &str) -> Result<Self> {
        Self::parse(s)
    }

    /// Build a flavor from a set of plainly-present names (all Required, all
    /// use-class). Used to express request properties like geo flags.
    pub fn from_present<'a, I: IntoIterator<Item = &'a str>>(names: I) -> Self {
        let mut f = Self::empty();
        for name in names {
            f.insert(FlavorClass::Use, name, FlavorSense::Required);
        }
        f
    }

    /// Score how well this flavor (the present/system side) satisfies
    /// `request`. `None` means a hard requirement failed; otherwise higher
    /// scores indicate better preference alignment. The empty request
    /// trivially scores 0.
    pub fn score(&self, request: &Flavor) -> Option<i32> {
        let mut score = 0;
        for ((class, name), sense) in &request.items {
            let present = matches!(
                self.items.get(&(*class, name.clone())),
                Some(FlavorSense::Required) | Some(FlavorSense::Preferred)
            );
            match sense {
                FlavorSense::Required => {
                    if !present {
                        return None;
                    }
                    score += 10;
                }
                FlavorSense::Disallowed => {
                    if present {
                        return None;
                    }
                    score += 10;
                }
                FlavorSense::Preferred => {
                    if present {
                        score += 5;
                    }
                }
                FlavorSense::Dispreferred => {
                    if !present {
                        score += 5;
                    }
                }
            }
        }
        Some(score)
    }

    /// True when every hard requirement of `request` holds here.
    pub fn satisfies(&self, request: &Flavor) -> bool {
        self.score(request).is_some()
    }

    /// Like `satisfies`, but soft senses in `request` are promoted to hard:
    /// `~ssl` must actually be present, `~!xen` actually absent.
    pub fn strongly_satisfies(&self, request: &Flavor) -> bool {
        let mut hardened = request.clone();
        for sense in hardened.items.values_mut() {
            *sense = match *sense {
                FlavorSense::Preferred => FlavorSense::Required,
                FlavorSense::Dispreferred => FlavorSense::Disallowed,
                other => other,
            };
        }
        self.satisfies(&hardened)
    }

    /// Merge `other` into a copy of this flavor; on conflicting items the
    /// sense from `other` wins.
    pub fn union(&self, other: &Flavor) -> Flavor {
        let mut merged = self.clone();
        for (key, sense) in &other.items {
            merged.items.insert(key.clone(), *sense);
        }
        merged
    }

    /// Satisfaction against a bare set of present names, e.g. request geo
    /// flags against a role's accept flavor.
    pub fn satisfied_by_set(&self, present: &HashSet<String>) -> bool {
        Flavor::from_present(present.iter().map(|s| s.as_str())).satisfies(self)
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        let mut use_parts = Vec::new();
        let mut arch_parts = Vec::new();
        for ((class, name), sense) in &self.items {
            let rendered = format!("{}{}", sense.as_prefix(), name);
            match class {
                FlavorClass::Use => use_parts.push(rendered),
                FlavorClass::Arch => arch_parts.push(rendered),
            }
        }
        let mut parts = use_parts;
        if !arch_parts.is_empty() {
            parts.push(format!("is: {}", arch_parts.join(" ")));
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

impl FromStr for Flavor {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Flavor::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        assert!(Flavor::parse("").unwrap().is_empty());
        assert!(Flavor::parse("[]").unwrap().is_empty());
    }

    #[test]
    fn test_parse_senses() {
        let f = Flavor::parse("[ssl, !debug, ~vmware, ~!xen]").unwrap();
        assert_eq!(f.get(FlavorClass::Use, "ssl"), Some(FlavorSense::Required));
        assert_eq!(f.get(FlavorClass::Use, "debug"), Some(FlavorSense::Disallowed));
        assert_eq!(f.get(FlavorClass::Use, "vmware"), Some(FlavorSense::Preferred));
        assert_eq!(f.get(FlavorClass::Use, "xen"), Some(FlavorSense::Dispreferred));
    }

    #[test]
    fn test_parse_arch() {
        let f = Flavor::parse("[is: x86 x86_64]").unwrap();
        assert_eq!(f.get(FlavorClass::Arch, "x86"), Some(FlavorSense::Required));
        assert_eq!(f.get(FlavorClass::Arch, "x86_64"), Some(FlavorSense::Required));
        assert_eq!(f.get(FlavorClass::Use, "x86"), None);
    }

    #[test]
    fn test_parse_subflag_name() {
        let f = Flavor::parse("[xen.domU]").unwrap();
        assert_eq!(f.get(FlavorClass::Use, "xen.domU"), Some(FlavorSense::Required));
    }

    #[test]
    fn test_parse_missing_name() {
        assert!(Flavor::parse("[!]").is_err());
        assert!(Flavor::parse("[~!]").is_err());
        assert!(Flavor::parse("[is: ]").is_err());
    }

    #[test]
    fn test_freeze_thaw_roundtrip() {
        let f = Flavor::parse("[ssl, !debug, ~vmware, ~!xen, is: x86 x86_64]").unwrap();
        let thawed = Flavor::thaw(&f.freeze()).unwrap();
        assert_eq!(f, thawed);
    }

    #[test]
    fn test_display_canonical_order() {
        let a = Flavor::parse("[ssl, debug]").unwrap();
        let b = Flavor::parse("[debug, ssl]").unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "[debug, ssl]");
    }

    #[test]
    fn test_empty_matches_anything() {
        let request = Flavor::empty();
        let present = Flavor::parse("[ssl, is: x86_64]").unwrap();
        assert_eq!(present.score(&request), Some(0));
        assert!(present.satisfies(&request));
    }

    #[test]
    fn test_required_must_be_present() {
        let request = Flavor::parse("[ssl]").unwrap();
        assert!(Flavor::parse("[ssl]").unwrap().satisfies(&request));
        assert!(!Flavor::empty().satisfies(&request));
        // Disallowed on the present side does not count as present.
        assert!(!Flavor::parse("[!ssl]").unwrap().satisfies(&request));
    }

    #[test]
    fn test_disallowed_must_be_absent() {
        let request = Flavor::parse("[!debug]").unwrap();
        assert!(Flavor::empty().satisfies(&request));
        assert!(!Flavor::parse("[debug]").unwrap().satisfies(&request));
    }

    #[test]
    fn test_preference_scoring() {
        let request = Flavor::parse("[~vmware]").unwrap();
        let with = Flavor::parse("[vmware]").unwrap();
        let without = Flavor::empty();
        assert!(with.score(&request).unwrap() > without.score(&request).unwrap());
    }

    #[test]
    fn test_strongly_satisfies() {
        let request = Flavor::parse("[~ssl]").unwrap();
        let with = Flavor::parse("[ssl]").unwrap();
        let without = Flavor::empty();
        // Weak satisfaction holds either way; strong needs presence.
        assert!(without.satisfies(&request));
        assert!(!without.strongly_satisfies(&request));
        assert!(with.strongly_satisfies(&request));
    }

    #[test]
    fn test_union_other_wins() {
        let a = Flavor::parse("[ssl, ~vmware]").unwrap();
        let b = Flavor::parse("[!ssl, is: x86_64]").unwrap();
        let u = a.union(&b);
        assert_eq!(u.get(FlavorClass::Use, "ssl"), Some(FlavorSense::Disallowed));
        assert_eq!(u.get(FlavorClass::Use, "vmware"), Some(FlavorSense::Preferred));
        assert_eq!(u.get(FlavorClass::Arch, "x86_64"), Some(FlavorSense::Required));
    }

    #[test]
    fn test_arch_mismatch() {
        let request = Flavor::parse("[is: x86_64]").unwrap();
        let arm = Flavor::parse("[is: aarch64]").unwrap();
        let x86_64 = Flavor::parse("[is: x86_64]").unwrap();
        assert!(!arm.satisfies(&request));
        assert!(x86_64.satisfies(&request));
    }

    #[test]
    fn test_satisfied_by_set() {
        let accept = Flavor::parse("[US]").unwrap();
        let mut flags = HashSet::new();
        flags.insert("US".to_string());
        assert!(accept.satisfied_by_set(&flags));
        flags.clear();
        flags.insert("DE".to_string());
        assert!(!accept.satisfied_by_set(&flags));
    }
}
