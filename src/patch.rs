// src/patch.rs

//! Fuzzy unified-diff application for source patches
//!
//! Upstream patches often assume slightly different context than the tree
//! being built. Each hunk is located by nearest-neighbor search around its
//! declared position, and a patch whose hunks are all present already is
//! reported as a no-op instead of a failure.

use crate::error::{Error, Result};
use diffy::{Line, Patch};
use tracing::{debug, warn};

/// How far a hunk may drift from its declared position.
const MAX_OFFSET: usize = 200;

/// Result of applying one patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    /// At least one hunk was applied; records the largest offset used.
    Applied { max_offset: usize },
    /// Every hunk was already present in the target.
    AlreadyApplied,
}

fn strip_newline(s: &str) -> &str {
    s.strip_suffix('\n').unwrap_or(s)
}

/// Old-side and new-side line images of one hunk.
fn hunk_images<'a>(lines: &'a [Line<'a, str>]) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut old = Vec::new();
    let mut new = Vec::new();
    for line in lines {
        match line {
            Line::Context(s) => {
                old.push(strip_newline(s));
                new.push(strip_newline(s));
            }
            Line::Delete(s) => old.push(strip_newline(s)),
            Line::Insert(s) => new.push(strip_newline(s)),
        }
    }
    (old, new)
}

fn matches_at(lines: &[&str], image: &[&str], pos: usize) -> bool {
    pos + image.len() <= lines.len() && lines[pos..pos + image.len()] == *image
}

/// Search for `image` near `expected`, preferring the smallest offset;
/// ties go to the earlier position.
fn locate(lines: &[&str], image: &[&str], expected: usize) -> Option<usize> {
    if image.is_empty() {
        return Some(expected.min(lines.len()));
    }
    for offset in 0..=MAX_OFFSET {
        if offset <= expected && matches_at(lines, image, expected - offset) {
            return Some(expected - offset);
        }
        if offset > 0 && matches_at(lines, image, expected + offset) {
            return Some(expected + offset);
        }
    }
    None
}

/// Apply a unified diff to `content`, fuzzing hunk positions.
///
/// Returns the patched text and an outcome. Fails when the diff cannot be
/// parsed or when a hunk can be located neither in its old nor its new form.
pub fn apply_unified_diff(content: &str, diff: &str) -> Result<(String, PatchOutcome)> {
    let patch = Patch::from_str(diff)
        .map_err(|e| Error::ParseError(format!("cannot parse unified diff: {e}")))?;

    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<&str> = content.split('\n').collect();
    if had_trailing_newline {
        // split leaves a phantom empty element after the final newline
        lines.pop();
    }
    let mut owned: Vec<String> = lines.iter().map(|s| s.to_string()).collect();

    let mut drift: i64 = 0;
    let mut max_offset = 0usize;
    let mut applied_hunks = 0usize;
    let mut present_hunks = 0usize;

    for (index, hunk) in patch.hunks().iter().enumerate() {
        let (old_image, new_image) = hunk_images(hunk.lines());
        // Hunk starts are 1-based; an empty old side addresses the line
        // after the declared position.
        let declared = hunk.old_range().start().saturating_sub(1);
        let expected = ((declared as i64) + drift).max(0) as usize;

        let view: Vec<&str> = owned.iter().map(|s| s.as_str()).collect();
        if let Some(pos) = locate(&view, &old_image, expected) {
            let offset = pos.abs_diff(expected);
            if offset > 0 {
                debug!("hunk {} applied at offset {}", index + 1, offset);
            }
            max_offset = max_offset.max(offset);
            owned.splice(pos..pos + old_image.len(), new_image.iter().map(|s| s.to_string()));
            drift += new_image.len() as i64 - old_image.len() as i64;
            applied_hunks += 1;
        } else if locate(&view, &new_image, expected).is_some() {
            // The new-side image is already in place.
            warn!("hunk {} already applied, skipping", index + 1);
            present_hunks += 1;
        } else {
            return Err(Error::ParseError(format!(
                "hunk {} does not apply (expected near line {})",
                index + 1,
                expected + 1
            )));
        }
    }

    let mut result = owned.join("\n");
    if had_trailing_newline {
        result.push('\n');
    }
    let outcome = if applied_hunks == 0 && present_hunks > 0 {
        PatchOutcome::AlreadyApplied
    } else {
        PatchOutcome::Applied { max_offset }
    };
    Ok((result, outcome))
}

/// Strip `level` leading components from a diff header path.
fn strip_components(path: &str, level: u32) -> &str {
    let mut rest = path;
    for _ in 0..level {
        match rest.split_once('/') {
            Some((_, tail)) => rest = tail,
            None => break,
        }
    }
    rest
}

/// Apply a possibly multi-file unified diff to files under `root`.
///
/// The diff is split on `--- ` headers; each segment is applied to the path
/// named by its `+++` header with `level` leading components stripped.
/// Returns one outcome per file touched.
pub fn apply_patch_tree(
    root: &std::path::Path,
    diff: &str,
    level: u32,
) -> Result<Vec<(String, PatchOutcome)>> {
    let mut outcomes = Vec::new();
    let mut segment_starts: Vec<usize> = Vec::new();
    let mut offset = 0;
    for line in diff.split_inclusive('\n') {
        if line.starts_with("--- ") {
            segment_starts.push(offset);
        }
        offset += line.len();
    }
    if segment_starts.is_empty() {
        return Err(Error::ParseError("diff contains no file headers".to_string()));
    }
    segment_starts.push(diff.len());

    for window in segment_starts.windows(2) {
        let segment = &diff[window[0]..window[1]];
        let new_name = segment
            .lines()
            .find_map(|l| l.strip_prefix("+++ "))
            .map(|l| l.split_whitespace().next().unwrap_or(""))
            .ok_or_else(|| Error::ParseError("diff segment missing +++ header".to_string()))?;
        let rel = strip_components(new_name, level);
        let target = root.join(rel);
        let content = std::fs::read_to_string(&target)
            .map_err(|e| Error::IoError(format!("cannot read {}: {e}", target.display())))?;
        let (patched, outcome) = apply_unified_diff(&content, segment)?;
        if outcome != PatchOutcome::AlreadyApplied {
            std::fs::write(&target, patched)?;
        }
        outcomes.push((rel.to_string(), outcome));
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
--- a/file
+++ b/file
@@ -4,3 +4,3 @@
 ctx1
-abc
+def
 ctx2
";

    fn body(lines: &[&str]) -> String {
        let mut s = lines.join("\n");
        s.push('\n');
        s
    }

    #[test]
    fn test_exact_application() {
        let content = body(&["l1", "l2", "l3", "ctx1", "abc", "ctx2", "l7"]);
        let (patched, outcome) = apply_unified_diff(&content, DIFF).unwrap();
        assert_eq!(patched, body(&["l1", "l2", "l3", "ctx1", "def", "ctx2", "l7"]));
        assert_eq!(outcome, PatchOutcome::Applied { max_offset: 0 });
    }

    #[test]
    fn test_shifted_context_applies_with_offset() {
        // Old context shifted down by two lines.
        let content = body(&["x", "y", "l1", "l2", "l3", "ctx1", "abc", "ctx2", "l7"]);
        let (patched, outcome) = apply_unified_diff(&content, DIFF).unwrap();
        assert!(patched.contains("def"));
        assert!(!patched.contains("abc"));
        assert_eq!(outcome, PatchOutcome::Applied { max_offset: 2 });
    }

    #[test]
    fn test_already_applied_is_noop() {
        let content = body(&["l1", "l2", "l3", "ctx1", "def", "ctx2", "l7"]);
        let (patched, outcome) = apply_unified_diff(&content, DIFF).unwrap();
        assert_eq!(patched, content);
        assert_eq!(outcome, PatchOutcome::AlreadyApplied);
    }

    #[test]
    fn test_unlocatable_hunk_fails() {
        let content = body(&["nothing", "matches", "here"]);
        assert!(apply_unified_diff(&content, DIFF).is_err());
    }

    #[test]
    fn test_multi_hunk_drift() {
        let diff = "\
--- a/file
+++ b/file
@@ -1,2 +1,3 @@
 top
+added
 second
@@ -5,2 +6,2 @@
 fifth
-old
+new
";
        let content = body(&["top", "second", "third", "fourth", "fifth", "old"]);
        let (patched, _) = apply_unified_diff(&content, diff).unwrap();
        assert_eq!(
            patched,
            body(&["top", "added", "second", "third", "fourth", "fifth", "new"])
        );
    }

    #[test]
    fn test_bad_diff_rejected() {
        assert!(apply_unified_diff("text\n", "not a diff").is_err());
    }

    #[test]
    fn test_apply_patch_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/main.c"),
            body(&["l1", "l2", "l3", "ctx1", "abc", "ctx2", "l7"]),
        )
        .unwrap();

        let diff = "\
--- a/src/main.c
+++ b/src/main.c
@@ -4,3 +4,3 @@
 ctx1
-abc
+def
 ctx2
";
        let outcomes = apply_patch_tree(dir.path(), diff, 1).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, "src/main.c");
        let patched = std::fs::read_to_string(dir.path().join("src/main.c")).unwrap();
        assert!(patched.contains("def"));

        // Second application is a recorded no-op.
        let outcomes = apply_patch_tree(dir.path(), diff, 1).unwrap();
        assert_eq!(outcomes[0].1, PatchOutcome::AlreadyApplied);
    }
}
