// src/label.rs

//! Labels: the namespace component of a version
//!
//! A label names a branch location using the format `host@namespace:tag`,
//! e.g. `repo.example.com@cook:devel`. The host half is what the commit
//! pipeline checks against the repository's configured server names.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A label identifying where on a repository a branch lives
///
/// Format: `host@namespace:tag`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    /// Repository hostname
    pub host: String,
    /// Namespace within the repository
    pub namespace: String,
    /// Branch tag
    pub tag: String,
}

/// Errors from parsing a label string
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelParseError {
    #[error("label '{0}' is missing '@' separator")]
    MissingAt(String),
    #[error("label '{0}' is missing ':' separator")]
    MissingColon(String),
    #[error("label '{0}' has an empty component")]
    EmptyComponent(String),
    #[error("label component '{0}' contains invalid characters")]
    InvalidComponent(String),
}

impl Label {
    pub fn new(
        host: impl Into<String>,
        namespace: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            tag: tag.into(),
        }
    }

    /// Parse `host@namespace:tag`.
    pub fn parse(s: &str) -> Result<Self, LabelParseError> {
        let at_pos = s
            .find('@')
            .ok_or_else(|| LabelParseError::MissingAt(s.to_string()))?;
        let colon_pos = s[at_pos..]
            .find(':')
            .map(|p| at_pos + p)
            .ok_or_else(|| LabelParseError::MissingColon(s.to_string()))?;

        let host = &s[..at_pos];
        let namespace = &s[at_pos + 1..colon_pos];
        let tag = &s[colon_pos + 1..];

        if host.is_empty() || namespace.is_empty() || tag.is_empty() {
            return Err(LabelParseError::EmptyComponent(s.to_string()));
        }

        let valid = |c: char| c.is_alphanumeric() || c == '.' || c == '-' || c == '_';
        for part in [host, namespace, tag] {
            if !part.chars().all(valid) {
                return Err(LabelParseError::InvalidComponent(part.to_string()));
            }
        }

        Ok(Self::new(host, namespace, tag))
    }

    /// Check against another label, treating `*` in any component as a
    /// wildcard.
    pub fn matches(&self, other: &Label) -> bool {
        let part = |a: &str, b: &str| a == "*" || b == "*" || a == b;
        part(&self.host, &other.host)
            && part(&self.namespace, &other.namespace)
            && part(&self.tag, &other.tag)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.host, self.namespace, self.tag)
    }
}

impl FromStr for Label {
    type Err = LabelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::parse(s)
    }
}
