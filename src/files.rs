// src/files.rs

//! Content-addressed file streams
//!
//! A file stream is the serialized metadata of one packaged file: kind,
//! mode, ownership, mtime, flags, per-file dependencies, and either a
//! symlink target or a content sha1. The stream's own sha1 is the fileId
//! used by the repository to deduplicate and address streams.

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Hex sha1 of arbitrary bytes.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Per-file flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileFlags {
    /// Configuration file; merged on update rather than replaced
    #[serde(default)]
    pub config: bool,
    /// Contents are only installed if the file does not already exist
    #[serde(default)]
    pub initial_contents: bool,
    /// May be overwritten without being considered a conflict
    #[serde(default)]
    pub transient: bool,
    /// Source file fetched automatically rather than stored
    #[serde(default)]
    pub auto_source: bool,
    /// Tagged as a shared library by the policy pipeline
    #[serde(default)]
    pub shlib: bool,
}

/// What kind of filesystem object a stream describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileKind {
    Regular {
        /// Content sha1; `None` for cross-repository references whose
        /// contents live elsewhere
        sha1: Option<String>,
        size: u64,
    },
    Symlink {
        target: String,
    },
    Directory,
}

/// A complete file stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStream {
    #[serde(flatten)]
    pub kind: FileKind,
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub mtime: i64,
    #[serde(default)]
    pub flags: FileFlags,
    /// Frozen per-file dependency sets
    #[serde(default)]
    pub provides: String,
    #[serde(default)]
    pub requires: String,
}

impl FileStream {
    pub fn regular(sha1: Option<String>, size: u64, mode: u32) -> Self {
        Self {
            kind: FileKind::Regular { sha1, size },
            mode,
            owner: "root".to_string(),
            group: "root".to_string(),
            mtime: 0,
            flags: FileFlags::default(),
            provides: String::new(),
            requires: String::new(),
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            kind: FileKind::Symlink {
                target: target.into(),
            },
            mode: 0o777,
            owner: "root".to_string(),
            group: "root".to_string(),
            mtime: 0,
            flags: FileFlags::default(),
            provides: String::new(),
            requires: String::new(),
        }
    }

    pub fn directory(mode: u32) -> Self {
        Self {
            kind: FileKind::Directory,
            mode,
            owner: "root".to_string(),
            group: "root".to_string(),
            mtime: 0,
            flags: FileFlags::default(),
            provides: String::new(),
            requires: String::new(),
        }
    }

    /// Record the dependency sets on this stream.
    pub fn set_dependencies(&mut self, provides: &DependencySet, requires: &DependencySet) {
        self.provides = provides.freeze();
        self.requires = requires.freeze();
    }

    pub fn provides(&self) -> Result<DependencySet> {
        DependencySet::thaw(&self.provides)
    }

    pub fn requires(&self) -> Result<DependencySet> {
        DependencySet::thaw(&self.requires)
    }

    /// Content sha1, if this is a regular file with contents.
    pub fn content_sha1(&self) -> Option<&str> {
        match &self.kind {
            FileKind::Regular { sha1, .. } => sha1.as_deref(),
            _ => None,
        }
    }

    /// Serialize the stream deterministically.
    pub fn freeze(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::IntegrityError(format!("cannot freeze file stream: {e}")))
    }

    pub fn thaw(frozen: &str) -> Result<Self> {
        serde_json::from_str(frozen)
            .map_err(|e| Error::IntegrityError(format!("cannot thaw file stream: {e}")))
    }

    /// The fileId: sha1 of the frozen stream.
    pub fn file_id(&self) -> Result<String> {
        Ok(sha1_hex(self.freeze()?.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{DepClass, Dependency};

    #[test]
    fn test_sha1_hex_known_value() {
        // sha1("abc")
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_freeze_thaw_roundtrip() {
        let mut stream = FileStream::regular(Some(sha1_hex(b"hello")), 5, 0o644);
        stream.mtime = 1_700_000_000;
        stream.flags.config = true;
        let mut provides = DependencySet::new();
        provides.add(Dependency::new(DepClass::File, "/etc/foo.conf"));
        stream.set_dependencies(&provides, &DependencySet::new());

        let thawed = FileStream::thaw(&stream.freeze().unwrap()).unwrap();
        assert_eq!(stream, thawed);
        assert_eq!(thawed.provides().unwrap(), provides);
    }

    #[test]
    fn test_file_id_changes_with_metadata() {
        let a = FileStream::regular(Some(sha1_hex(b"x")), 1, 0o644);
        let mut b = a.clone();
        assert_eq!(a.file_id().unwrap(), b.file_id().unwrap());
        b.mode = 0o755;
        assert_ne!(a.file_id().unwrap(), b.file_id().unwrap());
    }

    #[test]
    fn test_contentless_stream() {
        let stream = FileStream::regular(None, 0, 0o644);
        assert!(stream.content_sha1().is_none());
        // Still freezable and addressable.
        assert_eq!(stream.file_id().unwrap().len(), 40);
    }

    #[test]
    fn test_symlink_stream() {
        let stream = FileStream::symlink("../lib/libfoo.so.1");
        match &stream.kind {
            FileKind::Symlink { target } => assert_eq!(target, "../lib/libfoo.so.1"),
            other => panic!("unexpected kind: {other:?}"),
        }
        assert!(stream.content_sha1().is_none());
    }
}
