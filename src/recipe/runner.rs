// src/recipe/runner.rs

//! The build runner: executes a recipe's actions in declaration order
//!
//! Two reserved directories drive path resolution: relative `dir` options
//! resolve under the builddir, absolute ones under the destdir. Each action
//! runs to completion before the next starts; a failing action aborts the
//! recipe, but the auto-buildreq suggestion hook still runs so missing
//! dependencies are reported alongside the failure.

use crate::error::{Error, Result};
use crate::macros::Macros;
use crate::patch::apply_patch_tree;
use crate::recipe::action::{Action, ActionBody, ManifestTarget};
use crate::recipe::Recipe;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Runner configuration
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Keep the build directory on failure or cancellation for diagnosis
    pub no_clean: bool,
    /// Where staged source files live (already fetched; fetching is the
    /// lookaside's problem, not ours)
    pub source_dir: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            no_clean: true,
            source_dir: None,
        }
    }
}

/// What the runner hands to the policy pipeline
#[derive(Debug)]
pub struct BuildResult {
    /// Destdir-relative path of every file produced, with the manifest
    /// target of the action that produced it (None = default attribution)
    pub manifest: BTreeMap<String, Option<ManifestTarget>>,
    /// Accumulated build log
    pub log: String,
    pub warnings: Vec<String>,
    /// Build requirements discovered while running
    pub suggestions: Vec<String>,
}

/// Drives one recipe through its source and build actions
pub struct BuildRunner<'a> {
    recipe: &'a mut Recipe,
    config: RunnerConfig,
    root: TempDir,
    builddir: PathBuf,
    destdir: PathBuf,
    macros: Macros,
    manifest: BTreeMap<String, Option<ManifestTarget>>,
    log: String,
    warnings: Vec<String>,
}

impl<'a> BuildRunner<'a> {
    pub fn new(recipe: &'a mut Recipe, config: RunnerConfig) -> Result<Self> {
        let root = TempDir::new()?;
        let builddir = root.path().join("builddir");
        let destdir = root.path().join("destdir");
        fs::create_dir_all(&builddir)?;
        fs::create_dir_all(&destdir)?;

        let mut macros = recipe.macros.copy(true);
        macros.set("builddir", &builddir.to_string_lossy())?;
        macros.set("destdir", &destdir.to_string_lossy())?;

        Ok(Self {
            recipe,
            config,
            root,
            builddir,
            destdir,
            macros,
            manifest: BTreeMap::new(),
            log: String::new(),
            warnings: Vec::new(),
        })
    }

    pub fn builddir(&self) -> &Path {
        &self.builddir
    }

    pub fn destdir(&self) -> &Path {
        &self.destdir
    }

    /// Run all source actions, then all build actions, in declaration
    /// order. On failure the suggestion hook still runs and its findings
    /// ride along in the error message.
    pub fn run(mut self) -> Result<(BuildResult, TempDir)> {
        info!(recipe = %self.recipe.name, "starting build");
        let sources: Vec<Action> = self.recipe.source_actions().to_vec();
        let builds: Vec<Action> = self.recipe.build_actions().to_vec();

        for action in sources.iter().chain(builds.iter()) {
            if !action.enabled(&self.recipe.use_flags) {
                // Invariant suggestions still run for skipped actions.
                self.publish_requirements(action);
                debug!(action = %action.name, "skipped by use guard");
                continue;
            }
            let before = self.snapshot_destdir();
            if let Err(e) = self.execute(action) {
                self.suggest_missing_tools(action);
                let suggestions = self.recipe.suggested_build_requires();
                let mut message = e.to_string();
                if !suggestions.is_empty() {
                    message.push_str(&format!("; suggested buildRequires: {suggestions:?}"));
                }
                if !self.config.no_clean {
                    // Partial destdir is only kept when noClean is set.
                    let _ = fs::remove_dir_all(self.root.path());
                }
                return Err(Error::CookError {
                    action: action.name.clone(),
                    line: action.source_line,
                    message,
                });
            }
            self.publish_requirements(action);
            self.record_manifest(action, &before);
        }

        let result = BuildResult {
            manifest: self.manifest,
            log: self.log,
            warnings: self.warnings,
            suggestions: self.recipe.suggested_build_requires(),
        };
        Ok((result, self.root))
    }

    /// Resolve an action's working directory: absolute `dir` under the
    /// destdir, relative under the builddir.
    fn resolve_cwd(&self, action: &Action) -> Result<PathBuf> {
        let cwd = match &action.options.dir {
            None => self.builddir.clone(),
            Some(dir) => {
                let expanded = self.macros.expand(dir, 0)?;
                if let Some(stripped) = expanded.strip_prefix('/') {
                    self.destdir.join(stripped)
                } else {
                    self.builddir.join(expanded)
                }
            }
        };
        fs::create_dir_all(&cwd)?;
        Ok(cwd)
    }

    fn execute(&mut self, action: &Action) -> Result<()> {
        debug!(action = %action.name, line = action.source_line, "executing");
        match &action.body {
            ActionBody::Command(template) => self.execute_command(action, template),
            ActionBody::Install { source, dest, mode } => {
                self.execute_install(action, source, dest, *mode)
            }
            ActionBody::MakeDirs { paths, mode } => {
                for path in paths {
                    let expanded = self.macros.expand(path, 0)?;
                    let target = self.under_destdir(&expanded);
                    fs::create_dir_all(&target)?;
                    set_mode(&target, *mode)?;
                    self.log_line(&format!("MakeDirs: {expanded}"));
                }
                Ok(())
            }
            ActionBody::Symlink { target, link } => {
                let target = self.macros.expand(target, 0)?;
                let link = self.macros.expand(link, 0)?;
                let link_path = self.under_destdir(&link);
                if let Some(parent) = link_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                std::os::unix::fs::symlink(&target, &link_path)?;
                self.log_line(&format!("Symlink: {link} -> {target}"));
                Ok(())
            }
            ActionBody::Remove { patterns } => self.execute_remove(action, patterns),
            ActionBody::Create {
                path,
                contents,
                mode,
            } => {
                let expanded_path = self.macros.expand(path, 0)?;
                let contents = self.macros.expand(contents, 0)?;
                let target = self.under_destdir(&expanded_path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, contents)?;
                set_mode(&target, *mode)?;
                self.log_line(&format!("Create: {expanded_path}"));
                Ok(())
            }
            ActionBody::Unpack { archive, dir } => self.execute_unpack(action, archive, dir),
            ActionBody::Patch { file, level } => {
                let source = self.source_path(file)?;
                let diff = fs::read_to_string(&source)?;
                let outcomes = apply_patch_tree(&self.builddir, &diff, *level)?;
                for (path, outcome) in outcomes {
                    self.log_line(&format!("Patch: {path} ({outcome:?})"));
                }
                Ok(())
            }
        }
    }

    fn execute_command(&mut self, action: &Action, template: &str) -> Result<()> {
        let mut scope = self.macros.copy(true);
        let args = action.inputs.first().map(|s| s.as_str()).unwrap_or("");
        scope.set("args", args)?;
        let command = scope.expand(template, 0)?;
        let cwd = self.resolve_cwd(action)?;

        self.log_line(&format!("+ {command}"));
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .env("DESTDIR", &self.destdir)
            .output()
            .map_err(|e| Error::IoError(format!("cannot spawn shell: {e}")))?;

        self.log.push_str(&String::from_utf8_lossy(&output.stdout));
        self.log.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(Error::IoError(format!(
                "command failed with {}: {command}",
                output.status
            )));
        }
        Ok(())
    }

    fn execute_install(&mut self, action: &Action, source: &str, dest: &str, mode: u32) -> Result<()> {
        let dest = self.macros.expand(dest, 0)?;
        let source = self.macros.expand(source, 0)?;
        let from = if Path::new(&source).is_absolute() {
            PathBuf::from(&source)
        } else {
            // Prefer a staged source file; fall back to the builddir.
            match self.source_path(&source) {
                Ok(p) if p.exists() => p,
                _ => self.builddir.join(&source),
            }
        };
        if !from.exists() {
            if action.options.allow_no_match {
                let msg = format!("Install: no match for {source}, skipping");
                warn!("{msg}");
                self.warnings.push(msg);
                return Ok(());
            }
            return Err(Error::IoError(format!("install source {source} not found")));
        }
        let target = self.under_destdir(&dest);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&from, &target)?;
        set_mode(&target, mode)?;
        self.log_line(&format!("Install: {source} -> {dest}"));
        Ok(())
    }

    fn execute_remove(&mut self, action: &Action, patterns: &[String]) -> Result<()> {
        for pattern in patterns {
            let expanded = self.macros.expand(pattern, 0)?;
            let rooted = self.under_destdir(&expanded);
            let matches: Vec<PathBuf> = glob::glob(&rooted.to_string_lossy())
                .map_err(|e| Error::ParseError(format!("bad glob '{expanded}': {e}")))?
                .filter_map(|m| m.ok())
                .collect();
            if matches.is_empty() {
                if action.options.allow_no_match {
                    let msg = format!("Remove: no match for {expanded}");
                    warn!("{msg}");
                    self.warnings.push(msg);
                    continue;
                }
                return Err(Error::IoError(format!("Remove: no match for {expanded}")));
            }
            for path in matches {
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
                self.log_line(&format!("Remove: {}", path.display()));
            }
        }
        Ok(())
    }

    fn execute_unpack(&mut self, action: &Action, archive: &str, dir: &str) -> Result<()> {
        let archive_path = self.source_path(archive)?;
        if !archive_path.exists() {
            if action.options.allow_no_match {
                let msg = format!("addArchive: {archive} not staged, skipping");
                warn!("{msg}");
                self.warnings.push(msg);
                return Ok(());
            }
            return Err(Error::IoError(format!("archive {archive} not staged")));
        }
        let dest = self.builddir.join(self.macros.expand(dir, 0)?);
        fs::create_dir_all(&dest)?;
        let status = Command::new("tar")
            .arg("xf")
            .arg(&archive_path)
            .current_dir(&dest)
            .status()
            .map_err(|e| Error::IoError(format!("cannot spawn tar: {e}")))?;
        if !status.success() {
            return Err(Error::IoError(format!("tar failed for {archive}")));
        }
        self.log_line(&format!("addArchive: {archive}"));
        Ok(())
    }

    fn source_path(&self, file: &str) -> Result<PathBuf> {
        match &self.config.source_dir {
            Some(dir) => Ok(dir.join(file)),
            None => Ok(self.builddir.join(file)),
        }
    }

    /// Join a destdir-absolute path under the real destdir.
    fn under_destdir(&self, path: &str) -> PathBuf {
        self.destdir.join(path.trim_start_matches('/'))
    }

    /// Publish an action's implied build requirements to the recipe-global
    /// suggestion set. Runs even for guarded-off actions.
    fn publish_requirements(&mut self, action: &Action) {
        let suggestions = self.recipe.suggestions();
        let mut set = suggestions.borrow_mut();
        for req in &action.build_requires {
            if !self.recipe.build_requires.contains(req) {
                set.insert(req.clone());
            }
        }
        for path in &action.path_requires {
            set.insert(format!("file: {path}"));
        }
    }

    /// On failure, check whether the command's program is even reachable;
    /// an unreachable tool is the most common missing buildreq.
    fn suggest_missing_tools(&mut self, action: &Action) {
        if let ActionBody::Command(_) = &action.body {
            let args = action.inputs.first().map(|s| s.as_str()).unwrap_or("");
            if let Some(tool) = args.split_whitespace().next() {
                if !tool.is_empty() && !tool.starts_with('.') && which::which(tool).is_err() {
                    self.recipe
                        .suggestions()
                        .borrow_mut()
                        .insert(format!("command not found: {tool}"));
                }
            }
        }
    }

    fn snapshot_destdir(&self) -> BTreeSet<String> {
        WalkDir::new(&self.destdir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.destdir)
                    .ok()
                    .map(|p| format!("/{}", p.to_string_lossy()))
            })
            .collect()
    }

    /// Attribute files that appeared during this action to its manifest
    /// target (or the default).
    fn record_manifest(&mut self, action: &Action, before: &BTreeSet<String>) {
        let after = self.snapshot_destdir();
        for path in after.difference(before) {
            self.manifest
                .insert(path.clone(), action.options.manifest.clone());
        }
    }

    fn log_line(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::action::ActionOptions;

    fn recipe() -> Recipe {
        Recipe::new("foo", "1.0").unwrap()
    }

    #[test]
    fn test_create_and_manifest() {
        let mut r = recipe();
        r.create("%(bindir)s/foo", "#!/bin/sh\necho foo\n", 0o755).unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let (result, root) = runner.run().unwrap();
        assert!(result.manifest.contains_key("/usr/bin/foo"));
        assert!(root.path().join("destdir/usr/bin/foo").exists());
    }

    #[test]
    fn test_manifest_target_attribution() {
        let mut r = recipe();
        let mut opts = ActionOptions::default();
        opts.manifest = Some(ManifestTarget::parse("foo:devel").unwrap());
        r.create_with("%(includedir)s/foo.h", "#pragma once\n", 0o644, opts)
            .unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let (result, _root) = runner.run().unwrap();
        let target = result.manifest.get("/usr/include/foo.h").unwrap();
        assert_eq!(target.as_ref().unwrap().component.as_deref(), Some("devel"));
    }

    #[test]
    fn test_command_runs_in_builddir() {
        let mut r = recipe();
        r.run("touch marker").unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let (_result, root) = runner.run().unwrap();
        assert!(root.path().join("builddir/marker").exists());
    }

    #[test]
    fn test_absolute_dir_resolves_under_destdir() {
        let mut r = recipe();
        let mut opts = ActionOptions::default();
        opts.dir = Some("/etc".to_string());
        r.run_with("touch under-dest", opts).unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let (_result, root) = runner.run().unwrap();
        assert!(root.path().join("destdir/etc/under-dest").exists());
    }

    #[test]
    fn test_failure_reports_line_and_action() {
        let mut r = recipe();
        r.run("true").unwrap();
        r.run("exit 7").unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let err = runner.run().unwrap_err();
        match err {
            Error::CookError { action, line, .. } => {
                assert_eq!(action, "Run");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_guarded_action_skipped() {
        let mut r = recipe();
        r.run("exit 1").unwrap();
        r.guard_last("[neverset]").unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        // The action would fail if run; the unsatisfied guard skips it.
        let (_result, _root) = runner.run().unwrap();
        // Declared requirements are not affected by the guard.
        assert!(r.build_requires.contains("bash:runtime"));
    }

    #[test]
    fn test_remove_allow_no_match() {
        let mut r = recipe();
        let mut opts = ActionOptions::default();
        opts.allow_no_match = true;
        r.remove(&["%(bindir)s/nothing-here-*"], opts).unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        let (result, _root) = runner.run().unwrap();
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_remove_without_allow_no_match_aborts() {
        let mut r = recipe();
        r.remove(&["%(bindir)s/nothing-here-*"], ActionOptions::default())
            .unwrap();
        let runner = BuildRunner::new(&mut r, RunnerConfig::default()).unwrap();
        assert!(runner.run().is_err());
    }
}
