// src/recipe/mod.rs

//! Recipes: declarative build descriptions
//!
//! A recipe owns an ordered list of source actions, an ordered list of build
//! actions, a macro table seeded with system defaults, a set of build
//! requirements, and a capsule map. Helper calls like `Configure` or
//! `MakeInstall` are bound through an explicit registry of helper
//! specifications; each call appends one immutable `Action`.

pub mod action;
pub mod capsule;
pub mod infopkg;
pub mod runner;

pub use action::{Action, ActionBody, ActionOptions, ActionPhase, ManifestTarget};
pub use capsule::{CapsuleMap, CapsulePathInfo};
pub use infopkg::{GroupInfoRecipe, UserInfoRecipe};
pub use runner::{BuildResult, BuildRunner, RunnerConfig};

use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::macros::Macros;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tracing::debug;

/// A helper known to the registry: the command template it expands to and
/// the build requirements its use implies.
#[derive(Debug, Clone, Copy)]
pub struct HelperSpec {
    pub name: &'static str,
    pub phase: ActionPhase,
    /// Command template; `%(args)s` is replaced with the caller's input.
    pub template: &'static str,
    pub build_requires: &'static [&'static str],
}

/// Command helpers bound into every recipe.
pub const HELPER_REGISTRY: &[HelperSpec] = &[
    HelperSpec {
        name: "Run",
        phase: ActionPhase::Build,
        template: "%(args)s",
        build_requires: &[],
    },
    HelperSpec {
        name: "Configure",
        phase: ActionPhase::Build,
        template: "./configure --prefix=%(prefix)s --sysconfdir=%(sysconfdir)s \
                   --mandir=%(mandir)s --infodir=%(infodir)s --libdir=%(libdir)s %(args)s",
        build_requires: &["bash:runtime"],
    },
    HelperSpec {
        name: "ManualConfigure",
        phase: ActionPhase::Build,
        template: "./configure %(args)s",
        build_requires: &["bash:runtime"],
    },
    HelperSpec {
        name: "Make",
        phase: ActionPhase::Build,
        template: "make %(mflags)s %(args)s",
        build_requires: &["make:runtime"],
    },
    HelperSpec {
        name: "MakeParallel",
        phase: ActionPhase::Build,
        template: "make %(parallelmflags)s %(args)s",
        build_requires: &["make:runtime"],
    },
    HelperSpec {
        name: "MakeInstall",
        phase: ActionPhase::Build,
        template: "make DESTDIR=%(destdir)s %(args)s install",
        build_requires: &["make:runtime"],
    },
];

/// Default build requirements seeded into every recipe; `clear_build_reqs`
/// removes them.
const DEFAULT_BUILD_REQS: &[&str] = &[
    "bash:runtime",
    "coreutils:runtime",
    "filesystem",
    "findutils:runtime",
    "gzip:runtime",
    "tar:runtime",
];

/// A named, versioned, flavored build description
pub struct Recipe {
    pub name: String,
    pub version: String,
    /// Flavor this build is for
    pub flavor: Flavor,
    /// Use flags in force, consulted by action guards
    pub use_flags: Flavor,
    pub macros: Macros,
    source_actions: Vec<Action>,
    build_actions: Vec<Action>,
    pub build_requires: BTreeSet<String>,
    /// Build requirements discovered during the run (macro callbacks, path
    /// lookups); shared with the runner.
    suggested_build_requires: Rc<RefCell<BTreeSet<String>>>,
    pub capsules: CapsuleMap,
    /// Explicit (path pattern, target) attribution entries; these override
    /// the global component patterns during packaging.
    pub explicit_manifest: Vec<(String, ManifestTarget)>,
    /// Source line counter for appended actions
    next_line: u32,
}

impl Recipe {
    /// Create a recipe with system default macros and build requirements.
    ///
    /// Package names must not contain `:`; components are split off by the
    /// packaging policies, never named directly by a recipe.
    pub fn new(name: &str, version: &str) -> Result<Self> {
        if name.is_empty()
            || name.contains(':')
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '+')
        {
            return Err(Error::InvalidName(name.to_string()));
        }
        let mut macros = Macros::new();
        seed_default_macros(&mut macros, name, version)?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            flavor: Flavor::empty(),
            use_flags: Flavor::empty(),
            macros,
            source_actions: Vec::new(),
            build_actions: Vec::new(),
            build_requires: DEFAULT_BUILD_REQS.iter().map(|s| s.to_string()).collect(),
            suggested_build_requires: Rc::new(RefCell::new(BTreeSet::new())),
            capsules: CapsuleMap::new(),
            explicit_manifest: Vec::new(),
            next_line: 0,
        })
    }

    /// Remove the default build requirements. Used by bootstrap recipes
    /// that build before any of the defaults exist.
    pub fn clear_build_reqs(&mut self) {
        self.build_requires.clear();
    }

    /// Set a recipe flag, the `Flags.foo = True` surface.
    pub fn set_flag(&mut self, name: &str, enabled: bool) {
        use crate::flavor::{FlavorClass, FlavorSense};
        let sense = if enabled {
            FlavorSense::Required
        } else {
            FlavorSense::Disallowed
        };
        self.use_flags.insert(FlavorClass::Use, name, sense);
        self.flavor.insert(FlavorClass::Use, name, sense);
    }

    /// Shared handle the runner and macro callbacks use to publish
    /// discovered build requirements.
    pub fn suggestions(&self) -> Rc<RefCell<BTreeSet<String>>> {
        self.suggested_build_requires.clone()
    }

    /// Snapshot of discovered build requirements.
    pub fn suggested_build_requires(&self) -> Vec<String> {
        self.suggested_build_requires
            .borrow()
            .iter()
            .cloned()
            .collect()
    }

    pub fn source_actions(&self) -> &[Action] {
        &self.source_actions
    }

    pub fn build_actions(&self) -> &[Action] {
        &self.build_actions
    }

    /// Register an explicit attribution for destdir paths matching a glob.
    pub fn set_manifest(&mut self, pattern: &str, target: &str) -> Result<()> {
        let target = ManifestTarget::parse(target)?;
        self.explicit_manifest.push((pattern.to_string(), target));
        Ok(())
    }

    fn next_line(&mut self) -> u32 {
        self.next_line += 1;
        self.next_line
    }

    fn push(&mut self, action: Action) {
        for req in &action.build_requires {
            self.build_requires.insert(req.clone());
        }
        debug!(action = %action.name, line = action.source_line, "recorded action");
        match action.phase {
            ActionPhase::Source => self.source_actions.push(action),
            ActionPhase::Build => self.build_actions.push(action),
        }
    }

    /// Append a registry helper by name with a single argument string.
    /// This is the generic surface behind the typed methods below.
    pub fn add_helper(&mut self, name: &str, args: &str, options: ActionOptions) -> Result<()> {
        let spec = HELPER_REGISTRY
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| Error::RecipeFileError(format!("unknown build helper '{name}'")))?;
        let line = self.next_line();
        self.push(Action {
            name: spec.name.to_string(),
            phase: spec.phase,
            body: ActionBody::Command(spec.template.to_string()),
            inputs: vec![args.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: spec.build_requires.iter().map(|s| s.to_string()).collect(),
            path_requires: Vec::new(),
        });
        Ok(())
    }

    /// `r.Run("...")`
    pub fn run(&mut self, command: &str) -> Result<()> {
        self.run_with(command, ActionOptions::default())
    }

    pub fn run_with(&mut self, command: &str, options: ActionOptions) -> Result<()> {
        self.add_helper("Run", command, options)
    }

    /// `r.Configure("...")`
    pub fn configure(&mut self, args: &str) -> Result<()> {
        self.add_helper("Configure", args, ActionOptions::default())
    }

    /// `r.Make("...")`
    pub fn make(&mut self, args: &str) -> Result<()> {
        self.add_helper("Make", args, ActionOptions::default())
    }

    /// `r.MakeInstall()`
    pub fn make_install(&mut self, args: &str) -> Result<()> {
        self.add_helper("MakeInstall", args, ActionOptions::default())
    }

    /// `r.Install(src, dest, mode=...)`: copy from builddir into destdir.
    pub fn install(&mut self, source: &str, dest: &str, mode: u32) -> Result<()> {
        self.install_with(source, dest, mode, ActionOptions::default())
    }

    pub fn install_with(
        &mut self,
        source: &str,
        dest: &str,
        mode: u32,
        options: ActionOptions,
    ) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "Install".to_string(),
            phase: ActionPhase::Build,
            body: ActionBody::Install {
                source: source.to_string(),
                dest: dest.to_string(),
                mode,
            },
            inputs: vec![source.to_string(), dest.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.MakeDirs(...)`
    pub fn make_dirs(&mut self, paths: &[&str], mode: u32) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "MakeDirs".to_string(),
            phase: ActionPhase::Build,
            body: ActionBody::MakeDirs {
                paths: paths.iter().map(|s| s.to_string()).collect(),
                mode,
            },
            inputs: paths.iter().map(|s| s.to_string()).collect(),
            options: ActionOptions::default(),
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.Symlink(target, link)`
    pub fn symlink(&mut self, target: &str, link: &str) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "Symlink".to_string(),
            phase: ActionPhase::Build,
            body: ActionBody::Symlink {
                target: target.to_string(),
                link: link.to_string(),
            },
            inputs: vec![target.to_string(), link.to_string()],
            options: ActionOptions::default(),
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.Remove(...)`
    pub fn remove(&mut self, patterns: &[&str], options: ActionOptions) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "Remove".to_string(),
            phase: ActionPhase::Build,
            body: ActionBody::Remove {
                patterns: patterns.iter().map(|s| s.to_string()).collect(),
            },
            inputs: patterns.iter().map(|s| s.to_string()).collect(),
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.Create(path, contents=..., mode=...)`
    pub fn create(&mut self, path: &str, contents: &str, mode: u32) -> Result<()> {
        self.create_with(path, contents, mode, ActionOptions::default())
    }

    pub fn create_with(
        &mut self,
        path: &str,
        contents: &str,
        mode: u32,
        options: ActionOptions,
    ) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "Create".to_string(),
            phase: ActionPhase::Build,
            body: ActionBody::Create {
                path: path.to_string(),
                contents: contents.to_string(),
                mode,
            },
            inputs: vec![path.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.addArchive(...)`: source action that unpacks an archive into the
    /// build directory. Remote archives may be marked ephemeral so they are
    /// not archived with the source trove.
    pub fn add_archive(&mut self, archive: &str, dir: &str, options: ActionOptions) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "addArchive".to_string(),
            phase: ActionPhase::Source,
            body: ActionBody::Unpack {
                archive: archive.to_string(),
                dir: dir.to_string(),
            },
            inputs: vec![archive.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.addSource(...)`: stage a plain file into the build directory.
    pub fn add_source(&mut self, file: &str, dest: &str, options: ActionOptions) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "addSource".to_string(),
            phase: ActionPhase::Source,
            body: ActionBody::Install {
                source: file.to_string(),
                dest: dest.to_string(),
                mode: 0o644,
            },
            inputs: vec![file.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec![],
            path_requires: vec![],
        });
        Ok(())
    }

    /// `r.addPatch(...)`
    pub fn add_patch(&mut self, file: &str, level: u32, options: ActionOptions) -> Result<()> {
        let line = self.next_line();
        self.push(Action {
            name: "addPatch".to_string(),
            phase: ActionPhase::Source,
            body: ActionBody::Patch {
                file: file.to_string(),
                level,
            },
            inputs: vec![file.to_string()],
            options,
            use_guard: None,
            source_line: line,
            build_requires: vec!["patch:runtime".to_string()],
            path_requires: vec![],
        });
        Ok(())
    }

    /// Guard the most recently appended action with a use-flavor expression.
    pub fn guard_last(&mut self, guard: &str) -> Result<()> {
        let guard = Flavor::parse(guard)?;
        let slot = self
            .build_actions
            .last_mut()
            .or(self.source_actions.last_mut())
            .ok_or_else(|| Error::RecipeFileError("no action to guard".to_string()))?;
        slot.use_guard = Some(guard);
        Ok(())
    }
}

/// Seed the system default macros, including the multilib `lib` macro the
/// policies key on.
fn seed_default_macros(macros: &mut Macros, name: &str, version: &str) -> Result<()> {
    macros.update([
        ("name", name),
        ("version", version),
        ("prefix", "/usr"),
        ("exec_prefix", "%(prefix)s"),
        ("bindir", "%(exec_prefix)s/bin"),
        ("sbindir", "%(exec_prefix)s/sbin"),
        ("lib", "lib"),
        ("libdir", "%(exec_prefix)s/%(lib)s"),
        ("libexecdir", "%(exec_prefix)s/libexec"),
        ("includedir", "%(prefix)s/include"),
        ("datadir", "%(prefix)s/share"),
        ("mandir", "%(datadir)s/man"),
        ("infodir", "%(datadir)s/info"),
        ("docdir", "%(datadir)s/doc"),
        ("thisdocdir", "%(docdir)s/%(name)s-%(version)s"),
        ("sysconfdir", "/etc"),
        ("initdir", "%(sysconfdir)s/init.d"),
        ("localstatedir", "/var"),
        ("x11prefix", "%(prefix)s/X11R6"),
        ("userinfodir", "%(sysconfdir)s/cookery/userinfo"),
        ("groupinfodir", "%(sysconfdir)s/cookery/groupinfo"),
        ("mflags", ""),
        ("parallelmflags", ""),
        ("args", ""),
    ])
}
