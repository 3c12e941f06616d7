// src/version/mod.rs

//! Versions, branches, and shadows
//!
//! A version is a rooted path of (label, revision) history rendered as
//! `/host@ns:tag/1.0-1-1`. A branch is the label path without the trailing
//! revision; a shadow is a branch whose parent branch lives elsewhere,
//! rendered with a doubled slash: `/host@ns:tag//shadow.host@ns:fork/...`.
//! Revisions carry per-segment timestamps recorded at commit time.

use crate::error::{Error, Result};
use crate::label::Label;
use std::fmt;
use std::str::FromStr;

/// A revision: upstream version plus dotted source and build counts
///
/// `1.2-3-4` is upstream 1.2, source count 3, build count 4. On a shadow the
/// counts grow a dotted tail per shadow level (`1.2-3.1-4.2`).
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub upstream: String,
    pub source_count: Vec<u32>,
    pub build_count: Option<Vec<u32>>,
    /// Commit timestamp, seconds since the epoch. Not part of equality of
    /// the textual form; set by the repository at commit.
    pub timestamp: Option<f64>,
}

fn parse_counts(s: &str) -> Result<Vec<u32>> {
    s.split('.')
        .map(|p| {
            p.parse::<u32>()
                .map_err(|_| Error::ParseError(format!("invalid revision count '{s}'")))
        })
        .collect()
}

fn render_counts(counts: &[u32]) -> String {
    counts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

impl Revision {
    pub fn new(upstream: impl Into<String>, source_count: u32, build_count: Option<u32>) -> Self {
        Self {
            upstream: upstream.into(),
            source_count: vec![source_count],
            build_count: build_count.map(|c| vec![c]),
            timestamp: None,
        }
    }

    /// Parse `upstream-sourceCount[-buildCount]`. The upstream version may
    /// itself contain dashes; counts are the last one or two dash fields.
    pub fn parse(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.rsplitn(3, '-').collect();
        match fields.as_slice() {
            [build, source, upstream] => match parse_counts(source) {
                Ok(source_count) => Ok(Self {
                    upstream: upstream.to_string(),
                    source_count,
                    build_count: Some(parse_counts(build)?),
                    timestamp: None,
                }),
                // Dashed upstream like "1.0-rc1-2": only the last field is
                // a count and it is the source count.
                Err(_) => Ok(Self {
                    upstream: format!("{upstream}-{source}"),
                    source_count: parse_counts(build)?,
                    build_count: None,
                    timestamp: None,
                }),
            },
            [source, upstream] => Ok(Self {
                upstream: upstream.to_string(),
                source_count: parse_counts(source)?,
                build_count: None,
                timestamp: None,
            }),
            _ => Err(Error::ParseError(format!(
                "revision '{s}' is missing a source count"
            ))),
        }
    }

    /// Depth of shadow history encoded in the source count.
    pub fn shadow_depth(&self) -> usize {
        self.source_count.len() - 1
    }

    /// Drop one shadow level from the counts, for mapping back to the
    /// parent branch.
    fn parent_counts(&self) -> Self {
        let mut r = self.clone();
        if r.source_count.len() > 1 {
            r.source_count.pop();
        }
        if let Some(bc) = &mut r.build_count {
            if bc.len() > 1 {
                bc.pop();
            }
        }
        r.timestamp = None;
        r
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.upstream, render_counts(&self.source_count))?;
        if let Some(bc) = &self.build_count {
            write!(f, "-{}", render_counts(bc))?;
        }
        Ok(())
    }
}

/// A branch: an ordered path of labels, the last being where new commits go
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Branch {
    labels: Vec<Label>,
}

impl Branch {
    pub fn new(label: Label) -> Self {
        Self {
            labels: vec![label],
        }
    }

    /// Parse `/label` or `/parent//shadow[//...]`.
    pub fn parse(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('/')
            .ok_or_else(|| Error::ParseError(format!("branch '{s}' is not rooted")))?;
        let labels = body
            .split("//")
            .map(|part| {
                Label::parse(part).map_err(|e| Error::ParseError(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        if labels.is_empty() {
            return Err(Error::ParseError(format!("branch '{s}' has no labels")));
        }
        Ok(Self { labels })
    }

    /// The label new commits on this branch land on.
    pub fn label(&self) -> &Label {
        self.labels.last().expect("branch always has a label")
    }

    /// True when this branch shadows another.
    pub fn is_shadow(&self) -> bool {
        self.labels.len() > 1
    }

    /// The branch this shadow was taken from, if any.
    pub fn parent_branch(&self) -> Option<Branch> {
        if !self.is_shadow() {
            return None;
        }
        Some(Branch {
            labels: self.labels[..self.labels.len() - 1].to_vec(),
        })
    }

    /// Create a shadow of this branch on `label`.
    pub fn create_shadow(&self, label: Label) -> Branch {
        let mut labels = self.labels.clone();
        labels.push(label);
        Branch { labels }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.labels.iter().map(|l| l.to_string()).collect();
        write!(f, "/{}", rendered.join("//"))
    }
}

/// A full version: a branch plus a trailing revision
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub branch: Branch,
    pub revision: Revision,
}

impl Version {
    pub fn new(branch: Branch, revision: Revision) -> Self {
        Self { branch, revision }
    }

    /// Parse `/label[//label...]/upstream-source[-build]`.
    pub fn parse(s: &str) -> Result<Self> {
        let slash = s
            .rfind('/')
            .ok_or_else(|| Error::ParseError(format!("version '{s}' is not rooted")))?;
        if slash == 0 {
            return Err(Error::ParseError(format!(
                "version '{s}' is missing a revision"
            )));
        }
        let branch = Branch::parse(&s[..slash])?;
        let revision = Revision::parse(&s[slash + 1..])?;
        Ok(Self { branch, revision })
    }

    /// The label this version was committed on.
    pub fn label(&self) -> &Label {
        self.branch.label()
    }

    /// Repository host this version belongs to.
    pub fn host(&self) -> &str {
        &self.label().host
    }

    pub fn is_shadow(&self) -> bool {
        self.branch.is_shadow()
    }

    /// The corresponding version on the parent branch of a shadow.
    pub fn parent_version(&self) -> Option<Version> {
        let branch = self.branch.parent_branch()?;
        Some(Version {
            branch,
            revision: self.revision.parent_counts(),
        })
    }

    /// Shadow this version onto `label`; counts are unchanged until a
    /// commit happens on the shadow.
    pub fn create_shadow(&self, label: Label) -> Version {
        Version {
            branch: self.branch.create_shadow(label),
            revision: Revision {
                timestamp: None,
                ..self.revision.clone()
            },
        }
    }

    /// Stamp the trailing revision with a commit time.
    pub fn set_timestamp(&mut self, epoch_seconds: f64) {
        self.revision.timestamp = Some(epoch_seconds);
    }

    /// Timestamp of the trailing revision, the "final" timestamp of the
    /// whole path.
    pub fn final_timestamp(&self) -> Option<f64> {
        self.revision.timestamp
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.branch, self.revision)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Version::parse(s)
    }
}
