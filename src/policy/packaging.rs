// src/policy/packaging.rs

//! Package-creation and enforcement passes: partition the destdir into
//! components, derive per-file dependencies, and check soname requirements
//! against the declared build requirements.

use super::{Bucket, FileDeps, Policy, PolicyContext};
use crate::deps::{DepClass, Dependency, DependencySet};
use crate::error::{Error, Result};
use crate::magic;
use regex::Regex;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tracing::debug;

/// Global component patterns, in priority order; the first match wins.
/// Explicit manifest entries override all of these.
const COMPONENT_PATTERNS: &[(&str, &str)] = &[
    ("devel", r"^/usr/include/"),
    ("devel", r"/pkgconfig/[^/]+\.pc$"),
    ("devel", r"\.(so|a)$"),
    ("devel", r"^/usr/share/man/man[23]/"),
    ("lib", r"^/(usr/)?(lib|lib64)(/|/.*/)[^/]+\.so\."),
    ("doc", r"^/usr/share/(doc|gtk-doc|man|info)/"),
    ("locale", r"^/usr/share/locale/"),
    ("config", r"^/etc/"),
];

/// Attribute every surviving destdir file to exactly one
/// (package, component) pair.
pub struct PackageSpec;

impl PackageSpec {
    fn global_component(patterns: &[(String, Regex)], rel: &str) -> String {
        for (component, re) in patterns {
            if re.is_match(rel) {
                return component.clone();
            }
        }
        "runtime".to_string()
    }
}

impl Policy for PackageSpec {
    fn name(&self) -> &'static str {
        "PackageSpec"
    }

    fn bucket(&self) -> Bucket {
        Bucket::PackageCreation
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let mut patterns = Vec::new();
        for (component, pattern) in COMPONENT_PATTERNS {
            let re = Regex::new(pattern).map_err(|e| Error::ParseError(e.to_string()))?;
            patterns.push((component.to_string(), re));
        }
        let mut explicit_globs = Vec::new();
        for (pattern, target) in ctx.explicit_manifest {
            let compiled = glob::Pattern::new(pattern)
                .map_err(|e| Error::ParseError(format!("bad manifest glob '{pattern}': {e}")))?;
            explicit_globs.push((compiled, target.clone()));
        }

        for rel in ctx.walk() {
            // Per-action attribution first, then recipe-level globs, then
            // the global patterns.
            let explicit = ctx.manifest.get(&rel).cloned().flatten().or_else(|| {
                explicit_globs
                    .iter()
                    .find(|(g, _)| g.matches(&rel))
                    .map(|(_, t)| t.clone())
            });
            let package = explicit
                .as_ref()
                .and_then(|t| t.package.clone())
                .unwrap_or_else(|| ctx.default_package.clone());
            let component = explicit
                .as_ref()
                .and_then(|t| t.component.clone())
                .unwrap_or_else(|| Self::global_component(&patterns, &rel));
            debug!("{rel} -> {package}:{component}");
            ctx.assignments.insert(rel, (package, component));
        }
        Ok(())
    }
}

/// Entries in a python egg's `requires.txt`, mapped to dependency names.
/// Section headers introduce extras, which are not required.
fn parse_egg_requires(body: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            break;
        }
        let name: String = line
            .chars()
            .take_while(|c| !" <>=!~;([".contains(*c))
            .collect();
        if !name.is_empty() {
            names.push(name);
        }
    }
    names
}

/// Derive per-file provides and requires from content magic, shebangs,
/// info files, and python egg metadata, then aggregate them per component.
pub struct DeriveDependencies;

impl DeriveDependencies {
    fn derive_file(ctx: &PolicyContext, rel: &str) -> Result<FileDeps> {
        let mut deps = FileDeps::default();
        let real = ctx.real_path(rel);
        if real.is_symlink() {
            return Ok(deps);
        }

        if let Some(info) = magic::elf_info_for_path(&real) {
            let flags = info.soname_flags();
            if info.is_shared_object {
                if let Some(soname) = &info.soname {
                    deps.provides
                        .add(Dependency::with_flags(DepClass::Soname, soname, flags.clone()));
                }
            }
            for needed in &info.needed {
                deps.requires
                    .add(Dependency::with_flags(DepClass::Soname, needed, flags.clone()));
            }
            if let Some(interpreter) = &info.interpreter {
                deps.requires.add(Dependency::new(DepClass::File, interpreter));
            }
            return Ok(deps);
        }

        let raw = fs::read(&real)?;
        let executable = fs::metadata(&real)?.permissions().mode() & 0o111 != 0;
        if executable {
            if let Some(line) = magic::shebang(&raw) {
                if let Some(interpreter) = line.split_whitespace().next() {
                    deps.requires.add(Dependency::new(DepClass::File, interpreter));
                }
            }
        }

        let userinfodir = ctx.macros.get("userinfodir")?;
        let groupinfodir = ctx.macros.get("groupinfodir")?;
        if let Some(name) = rel.strip_prefix(&format!("{userinfodir}/")) {
            deps.provides.add(Dependency::new(DepClass::UserInfo, name));
            for line in String::from_utf8_lossy(&raw).lines() {
                if let Some(group) = line.strip_prefix("GROUP=") {
                    deps.requires.add(Dependency::new(DepClass::GroupInfo, group));
                }
            }
        } else if let Some(name) = rel.strip_prefix(&format!("{groupinfodir}/")) {
            deps.provides.add(Dependency::new(DepClass::GroupInfo, name));
        }

        if rel.contains(".egg-info/") && rel.ends_with("/requires.txt") {
            for name in parse_egg_requires(&String::from_utf8_lossy(&raw)) {
                deps.requires.add(Dependency::new(DepClass::Python, name));
            }
        }
        Ok(deps)
    }
}

impl Policy for DeriveDependencies {
    fn name(&self) -> &'static str {
        "DeriveDependencies"
    }

    fn bucket(&self) -> Bucket {
        Bucket::PackageCreation
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let mut saw_egg_info = false;
        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            if rel.contains(".egg-info/") {
                saw_egg_info = true;
            }
            let deps = Self::derive_file(ctx, &rel)?;
            if !deps.provides.is_empty() || !deps.requires.is_empty() {
                ctx.file_deps.insert(rel, deps);
            }
        }
        if saw_egg_info && !ctx.build_requires.contains("python-setuptools:python") {
            ctx.warn(
                "egg-info present but python-setuptools:python is not in buildRequires"
                    .to_string(),
            );
        }

        // Aggregate per component; every component provides its own trove.
        let assignments = ctx.assignments.clone();
        for (rel, (package, component)) in &assignments {
            let key = (package.clone(), component.clone());
            let provides = ctx.component_provides.entry(key.clone()).or_default();
            provides.add(Dependency::new(
                DepClass::Trove,
                format!("{package}:{component}"),
            ));
            if let Some(deps) = ctx.file_deps.get(rel) {
                *provides = provides.union(&deps.provides);
                let requires = ctx.component_requires.entry(key).or_default();
                *requires = requires.union(&deps.requires);
            }
        }
        Ok(())
    }
}

/// Every soname requirement that nothing in the destdir satisfies must be
/// covered by a declared build requirement.
pub struct EnforceSonameBuildRequirements;

impl Policy for EnforceSonameBuildRequirements {
    fn name(&self) -> &'static str {
        "EnforceSonameBuildRequirements"
    }

    fn bucket(&self) -> Bucket {
        Bucket::Enforcement
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let mut all_provides = DependencySet::new();
        for provides in ctx.component_provides.values() {
            all_provides = all_provides.union(provides);
        }
        let mut all_requires = DependencySet::new();
        for requires in ctx.component_requires.values() {
            all_requires = all_requires.union(requires);
        }

        let mut errors = Vec::new();
        let mut unmapped = Vec::new();
        for dep in all_requires.unsatisfied_by(&all_provides) {
            if dep.class != DepClass::Soname {
                continue;
            }
            match ctx.soname_troves.get(&dep.name) {
                Some(trove) if !ctx.build_requires.contains(trove) => {
                    errors.push(format!(
                        "soname {} needs buildRequires entry '{trove}'",
                        dep.name
                    ));
                }
                Some(_) => {}
                None => unmapped.push(dep.name.clone()),
            }
        }
        for soname in unmapped {
            ctx.warn(format!("soname {soname} resolves to no known trove"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::PolicyError(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::Macros;
    use crate::policy::PolicyExceptions;
    use crate::recipe::ManifestTarget;
    use std::collections::{BTreeMap, BTreeSet};

    struct Fixture {
        dir: tempfile::TempDir,
        macros: Macros,
        reqs: BTreeSet<String>,
        exceptions: PolicyExceptions,
        explicit: Vec<(String, ManifestTarget)>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut macros = Macros::new();
            macros
                .update([
                    ("userinfodir", "/etc/cookery/userinfo"),
                    ("groupinfodir", "/etc/cookery/groupinfo"),
                ])
                .unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                macros,
                reqs: BTreeSet::new(),
                exceptions: PolicyExceptions::new(),
                explicit: Vec::new(),
            }
        }

        fn ctx(&self) -> PolicyContext<'_> {
            PolicyContext::new(
                self.dir.path(),
                &self.macros,
                BTreeMap::new(),
                &self.explicit,
                "foo",
                &self.reqs,
                &self.exceptions,
            )
        }

        fn write(&self, rel: &str, content: &[u8], mode: u32) {
            let path = self.dir.path().join(rel.trim_start_matches('/'));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }
    }

    fn assignment<'a>(ctx: &'a PolicyContext, rel: &str) -> (&'a str, &'a str) {
        let (p, c) = ctx.assignments.get(rel).unwrap();
        (p.as_str(), c.as_str())
    }

    #[test]
    fn test_component_partitioning() {
        let f = Fixture::new();
        f.write("/usr/bin/foo", b"#!/bin/sh\n", 0o755);
        f.write("/usr/include/foo.h", b"#pragma once\n", 0o644);
        f.write("/usr/lib/libfoo.so.1.2", b"elf-ish", 0o755);
        f.write("/usr/lib/libfoo.a", b"archive", 0o644);
        f.write("/usr/share/doc/foo-1.0/README", b"docs", 0o644);
        f.write("/usr/share/locale/de/foo.mo", b"mo", 0o644);
        f.write("/etc/foo.conf", b"key=1", 0o644);

        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        assert_eq!(assignment(&ctx, "/usr/bin/foo"), ("foo", "runtime"));
        assert_eq!(assignment(&ctx, "/usr/include/foo.h"), ("foo", "devel"));
        assert_eq!(assignment(&ctx, "/usr/lib/libfoo.so.1.2"), ("foo", "lib"));
        assert_eq!(assignment(&ctx, "/usr/lib/libfoo.a"), ("foo", "devel"));
        assert_eq!(
            assignment(&ctx, "/usr/share/doc/foo-1.0/README"),
            ("foo", "doc")
        );
        assert_eq!(
            assignment(&ctx, "/usr/share/locale/de/foo.mo"),
            ("foo", "locale")
        );
        assert_eq!(assignment(&ctx, "/etc/foo.conf"), ("foo", "config"));
    }

    #[test]
    fn test_explicit_manifest_overrides_patterns() {
        let mut f = Fixture::new();
        f.explicit.push((
            "/usr/share/doc/foo-1.0/*".to_string(),
            ManifestTarget::parse("foo:runtime").unwrap(),
        ));
        f.write("/usr/share/doc/foo-1.0/README", b"docs", 0o644);
        f.write("/usr/bin/tool", b"x", 0o755);

        let mut ctx = f.ctx();
        // Per-action attribution beats even the explicit globs.
        ctx.manifest.insert(
            "/usr/bin/tool".to_string(),
            Some(ManifestTarget::parse("bar:devel").unwrap()),
        );
        PackageSpec.run(&mut ctx).unwrap();
        assert_eq!(
            assignment(&ctx, "/usr/share/doc/foo-1.0/README"),
            ("foo", "runtime")
        );
        assert_eq!(assignment(&ctx, "/usr/bin/tool"), ("bar", "devel"));
    }

    #[test]
    fn test_every_file_attributed_once() {
        let f = Fixture::new();
        f.write("/usr/bin/a", b"x", 0o755);
        f.write("/usr/share/misc/b", b"y", 0o644);
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        assert_eq!(ctx.assignments.len(), 2);
    }

    #[test]
    fn test_shebang_requires() {
        let f = Fixture::new();
        f.write("/usr/bin/tool", b"#!/bin/bash -e\necho\n", 0o755);
        f.write("/usr/share/sample", b"#!/bin/bash\n", 0o644);
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        let deps = ctx.file_deps.get("/usr/bin/tool").unwrap();
        assert_eq!(deps.requires.freeze(), "file: /bin/bash");
        // No execute bit, no interpreter requirement.
        assert!(!ctx.file_deps.contains_key("/usr/share/sample"));
    }

    #[test]
    fn test_userinfo_provides_and_group_requires() {
        let f = Fixture::new();
        f.write(
            "/etc/cookery/userinfo/mysql",
            b"PREFERRED_UID=27\nGROUP=mysql\nSHELL=/sbin/nologin\n",
            0o644,
        );
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        let deps = ctx.file_deps.get("/etc/cookery/userinfo/mysql").unwrap();
        assert_eq!(deps.provides.freeze(), "userinfo: mysql");
        assert_eq!(deps.requires.freeze(), "groupinfo: mysql");
    }

    #[test]
    fn test_parse_egg_requires() {
        let body = "requests>=2.0\nsix\nchardet<4,>=3.0.2 ; python_version<'3'\n\n[socks]\nPySocks\n";
        assert_eq!(parse_egg_requires(body), ["requests", "six", "chardet"]);
    }

    #[test]
    fn test_egg_requires_and_setuptools_diagnostic() {
        let f = Fixture::new();
        f.write(
            "/usr/lib/python2.7/site-packages/foo.egg-info/requires.txt",
            b"requests>=2.0\n",
            0o644,
        );
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        let deps = ctx
            .file_deps
            .get("/usr/lib/python2.7/site-packages/foo.egg-info/requires.txt")
            .unwrap();
        assert_eq!(deps.requires.freeze(), "python: requests");
        assert!(ctx
            .warnings
            .iter()
            .any(|w| w.contains("python-setuptools:python")));
    }

    #[test]
    fn test_no_diagnostic_when_setuptools_declared() {
        let mut f = Fixture::new();
        f.reqs.insert("python-setuptools:python".to_string());
        f.write(
            "/usr/lib/python2.7/site-packages/foo.egg-info/requires.txt",
            b"six\n",
            0o644,
        );
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        assert!(ctx.warnings.is_empty());
    }

    #[test]
    fn test_component_trove_provides() {
        let f = Fixture::new();
        f.write("/usr/bin/foo", b"x", 0o755);
        f.write("/usr/include/foo.h", b"h", 0o644);
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        let runtime = ctx
            .component_provides
            .get(&("foo".to_string(), "runtime".to_string()))
            .unwrap();
        assert!(runtime.freeze().contains("trove: foo:runtime"));
        let devel = ctx
            .component_provides
            .get(&("foo".to_string(), "devel".to_string()))
            .unwrap();
        assert!(devel.freeze().contains("trove: foo:devel"));
    }

    #[test]
    fn test_elf_derivation_on_host_binary() {
        // Exercised only when the host shell is a dynamic ELF executable.
        let Ok(content) = fs::read("/bin/sh") else {
            return;
        };
        if magic::elf_info(&content).map(|i| i.needed.is_empty()) != Some(false) {
            return;
        }
        let f = Fixture::new();
        f.write("/usr/bin/sh", &content, 0o755);
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        let deps = ctx.file_deps.get("/usr/bin/sh").unwrap();
        assert!(deps
            .requires
            .iter()
            .any(|d| d.class == DepClass::Soname));
    }

    fn soname_dep(name: &str) -> Dependency {
        Dependency::with_flags(DepClass::Soname, name, ["SysV", "x86_64"])
    }

    fn enforcement_ctx<'a>(f: &'a Fixture) -> PolicyContext<'a> {
        let mut ctx = f.ctx();
        let key = ("foo".to_string(), "runtime".to_string());
        let mut requires = DependencySet::new();
        requires.add(soname_dep("libssl.so.3"));
        requires.add(soname_dep("libown.so.1"));
        ctx.component_requires.insert(key.clone(), requires);
        let mut provides = DependencySet::new();
        provides.add(soname_dep("libown.so.1"));
        ctx.component_provides.insert(key, provides);
        ctx.soname_troves
            .insert("libssl.so.3".to_string(), "openssl:lib".to_string());
        ctx
    }

    #[test]
    fn test_soname_enforcement_missing_buildreq() {
        let f = Fixture::new();
        let mut ctx = enforcement_ctx(&f);
        let err = EnforceSonameBuildRequirements.run(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("openssl:lib"));
    }

    #[test]
    fn test_soname_enforcement_satisfied_by_buildreq() {
        let mut f = Fixture::new();
        f.reqs.insert("openssl:lib".to_string());
        let mut ctx = enforcement_ctx(&f);
        EnforceSonameBuildRequirements.run(&mut ctx).unwrap();
    }

    #[test]
    fn test_soname_enforcement_unmapped_is_warning() {
        let f = Fixture::new();
        let mut ctx = f.ctx();
        let key = ("foo".to_string(), "runtime".to_string());
        let mut requires = DependencySet::new();
        requires.add(soname_dep("libmystery.so.9"));
        ctx.component_requires.insert(key, requires);
        EnforceSonameBuildRequirements.run(&mut ctx).unwrap();
        assert!(ctx.warnings.iter().any(|w| w.contains("libmystery.so.9")));
    }

    #[test]
    fn test_symlinks_carry_no_deps() {
        let f = Fixture::new();
        f.write("/usr/bin/real", b"#!/bin/sh\n", 0o755);
        let link = f.dir.path().join("usr/bin/alias");
        std::os::unix::fs::symlink("real", &link).unwrap();
        let mut ctx = f.ctx();
        PackageSpec.run(&mut ctx).unwrap();
        DeriveDependencies.run(&mut ctx).unwrap();
        assert!(!ctx.file_deps.contains_key("/usr/bin/alias"));
    }

    #[test]
    fn test_derive_file_skips_unreadable_elf_garbage() {
        let f = Fixture::new();
        f.write("/usr/bin/garbled", b"\x7fELFgarbage", 0o755);
        let ctx = f.ctx();
        let deps = DeriveDependencies::derive_file(&ctx, "/usr/bin/garbled").unwrap();
        // Not parseable as ELF, no shebang: nothing derived.
        assert!(deps.provides.is_empty() && deps.requires.is_empty());
    }
}
