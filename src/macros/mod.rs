// src/macros/mod.rs

//! Scoped, self-expanding macro table used by every recipe action
//!
//! Values are templates containing `%(name)s` references that stay lazy until
//! read. On assignment only references to the key being assigned are expanded,
//! against its previous value, so `prefix = "%(prefix)s/local"` composes.
//! Copies may shadow their parent (cheap, reads fall through) or be
//! materialized flat. A key may be overridden, after which later assignments
//! are ignored on read.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Read-time modifier appended to a key with a `.` separator,
/// e.g. `get("prefix.literalRegex")`.
const REP_LITERAL_REGEX: &str = "literalRegex";

/// Callback invoked whenever a key is read. Used by the recipe layer to
/// record build-requirement discovery.
pub type MacroCallback = Rc<dyn Fn(&str)>;

/// Depth bound for lazy expansion; a table with a reference cycle hits this.
const MAX_EXPANSION_DEPTH: usize = 64;

#[derive(Clone, Default)]
pub struct Macros {
    /// Local assignments. Copy-on-write so shadow copies stay cheap.
    local: Rc<HashMap<String, String>>,
    /// Parent table for shadow copies; reads fall through for unset keys.
    parent: Option<Rc<Macros>>,
    /// Override values win over any assignment, past or future.
    overrides: HashMap<String, String>,
    callbacks: HashMap<String, MacroCallback>,
    track: bool,
    tracked: HashSet<String>,
    /// Return "" for unknown keys instead of raising.
    ignore_unknown: bool,
}

impl std::fmt::Debug for Macros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Macros")
            .field("local", &self.local)
            .field("shadowed", &self.parent.is_some())
            .field("overrides", &self.overrides)
            .field("track", &self.track)
            .finish()
    }
}

impl Macros {
    /// Create an empty macro table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table that returns "" for unknown keys instead of erroring.
    pub fn new_ignore_unknown() -> Self {
        Self {
            ignore_unknown: true,
            ..Self::default()
        }
    }

    /// Assign `value` to `key`.
    ///
    /// `%(key)s` inside `value` refers to the previous value of `key` and is
    /// expanded now; references to other keys stay lazy until read. A `.` in
    /// the key is rejected because it is reserved for read modifiers.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if key.contains('.') {
            return Err(Error::MacroIllegalKey(key.to_string()));
        }
        if self.track {
            self.tracked.insert(key.to_string());
        }
        let old = self.raw(key).unwrap_or_default();
        let self_ref = format!("%({key})s");
        let stored = value.replace(&self_ref, &old);
        Rc::make_mut(&mut self.local).insert(key.to_string(), stored);
        Ok(())
    }

    /// Set every entry from an iterator. Keys with illegal characters abort.
    pub fn update<'a, I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (k, v) in entries {
            self.set(k, v)?;
        }
        Ok(())
    }

    /// Pin `key` to `value`; later `set` calls for this key are ignored on
    /// read. Overrides come from the command line or configuration and must
    /// survive recipe assignments.
    pub fn set_override(&mut self, key: &str, value: &str) -> Result<()> {
        if key.contains('.') {
            return Err(Error::MacroIllegalKey(key.to_string()));
        }
        self.overrides.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Register a per-key read callback.
    pub fn set_callback(&mut self, key: &str, callback: MacroCallback) {
        self.callbacks.insert(key.to_string(), callback);
    }

    /// Remove a per-key read callback.
    pub fn unset_callback(&mut self, key: &str) {
        self.callbacks.remove(key);
    }

    /// Enable or disable recording of assigned key names.
    pub fn track_changes(&mut self, flag: bool) {
        self.track = flag;
    }

    /// Names assigned while tracking was enabled.
    pub fn tracked_changes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tracked.iter().cloned().collect();
        names.sort();
        names
    }

    /// Copy this table. A shadow copy keeps reads falling through to this
    /// table for unset keys; a flat copy materializes every key.
    pub fn copy(&self, shadow: bool) -> Self {
        if shadow {
            Self {
                local: Rc::new(HashMap::new()),
                parent: Some(Rc::new(self.clone())),
                overrides: self.overrides.clone(),
                callbacks: self.callbacks.clone(),
                track: false,
                tracked: HashSet::new(),
                ignore_unknown: self.ignore_unknown,
            }
        } else {
            let mut flat = HashMap::new();
            self.collect_raw(&mut flat);
            Self {
                local: Rc::new(flat),
                parent: None,
                overrides: self.overrides.clone(),
                callbacks: self.callbacks.clone(),
                track: false,
                tracked: HashSet::new(),
                ignore_unknown: self.ignore_unknown,
            }
        }
    }

    /// Pull every parent key into the local map and drop the parent link.
    pub fn flatten(&mut self) {
        let mut flat = HashMap::new();
        self.collect_raw(&mut flat);
        self.local = Rc::new(flat);
        self.parent = None;
    }

    /// Look up `key`, expanding all `%(name)s` references recursively.
    ///
    /// A `.modifier` suffix post-processes the expanded value; the only
    /// modifier is `literalRegex`, which escapes regex metacharacters.
    pub fn get(&self, key: &str) -> Result<String> {
        let (name, modifier) = match key.split_once('.') {
            Some((n, m)) => (n, Some(m)),
            None => (key, None),
        };
        if let Some(cb) = self.callbacks.get(name) {
            cb(name);
        }
        let value = if let Some(v) = self.overrides.get(name) {
            v.clone()
        } else {
            match self.raw(name) {
                Some(template) => self.expand(&template, 0)?,
                None if self.ignore_unknown => String::new(),
                None => return Err(Error::MacroKeyError(name.to_string())),
            }
        };
        match modifier {
            None => Ok(value),
            Some(REP_LITERAL_REGEX) => Ok(regex::escape(&value)),
            Some(other) => Err(Error::ParseError(format!(
                "unknown representation method {other} for {name}"
            ))),
        }
    }

    /// Expand `%(name)s` references in an arbitrary template against this
    /// table. This is what actions use on their command strings.
    pub fn expand(&self, template: &str, depth: usize) -> Result<String> {
        if depth > MAX_EXPANSION_DEPTH {
            return Err(Error::ParseError(
                "macro expansion exceeded recursion limit (reference cycle?)".to_string(),
            ));
        }
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("%(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find(")s") {
                Some(end) => {
                    let name = &after[..end];
                    if let Some(cb) = self.callbacks.get(name) {
                        cb(name);
                    }
                    let replacement = if let Some(v) = self.overrides.get(name) {
                        v.clone()
                    } else {
                        match self.raw(name) {
                            Some(t) => self.expand(&t, depth + 1)?,
                            None if self.ignore_unknown => String::new(),
                            None => return Err(Error::MacroKeyError(name.to_string())),
                        }
                    };
                    out.push_str(&replacement);
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated reference; keep the text literally.
                    out.push_str(&rest[start..start + 2]);
                    rest = &rest[start + 2..];
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    /// True if the key is set anywhere in the shadow chain.
    pub fn contains(&self, key: &str) -> bool {
        self.overrides.contains_key(key) || self.raw(key).is_some()
    }

    /// All keys visible through the shadow chain, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut flat = HashMap::new();
        self.collect_raw(&mut flat);
        for k in self.overrides.keys() {
            flat.entry(k.clone()).or_default();
        }
        let mut keys: Vec<String> = flat.into_keys().collect();
        keys.sort();
        keys
    }

    /// Unexpanded template for `key`, searching the shadow chain.
    fn raw(&self, key: &str) -> Option<String> {
        if let Some(v) = self.local.get(key) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.raw(key))
    }

    fn collect_raw(&self, into: &mut HashMap<String, String>) {
        if let Some(parent) = &self.parent {
            parent.collect_raw(into);
        }
        for (k, v) in self.local.iter() {
            into.insert(k.clone(), v.clone());
        }
    }
}
