// src/policy/destdir.rs

//! Destdir preparation and normalization passes

use super::{Bucket, Policy, PolicyContext};
use crate::error::{Error, Result};
use crate::magic;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use regex::Regex;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tracing::debug;

fn file_mode(path: &Path) -> Result<u32> {
    Ok(fs::symlink_metadata(path)?.permissions().mode() & 0o7777)
}

fn set_file_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Grant owner-traverse on every directory so later passes can descend,
/// recording the intended final mode for packaging.
pub struct FixDirModes;

impl Policy for FixDirModes {
    fn name(&self) -> &'static str {
        "FixDirModes"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirPreparation
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        for entry in walkdir::WalkDir::new(ctx.destdir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let mode = file_mode(entry.path())?;
            if mode & 0o700 != 0o700 {
                let Some(rel) = ctx.rel_path(entry.path()) else {
                    continue;
                };
                ctx.dir_modes.insert(rel, mode);
                set_file_mode(entry.path(), mode | 0o700)?;
            }
        }
        Ok(())
    }
}

/// Install recognizable top-level doc files from the build tree into
/// `%(thisdocdir)s` unless the recipe placed them explicitly.
pub struct AutoDoc;

impl Policy for AutoDoc {
    fn name(&self) -> &'static str {
        "AutoDoc"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let Some(builddir) = ctx.builddir.clone() else {
            return Ok(());
        };
        let docfile =
            Regex::new(r"(?i)^(README|NEWS|HACKING|COPYING|LICENSE|AUTHORS|ChangeLog|TODO)([.-].*)?$")
                .map_err(|e| Error::ParseError(e.to_string()))?;
        let docdir = ctx.macros.get("thisdocdir")?;

        let entries = match fs::read_dir(&builddir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !docfile.is_match(&name) {
                continue;
            }
            let rel = format!("{docdir}/{name}");
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let target = ctx.real_path(&rel);
            if target.exists() {
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            set_file_mode(&target, 0o644)?;
            ctx.record(&rel, None);
            debug!("auto-installed doc {rel}");
        }
        Ok(())
    }
}

/// Delete build litter that never belongs in a package: libtool archives
/// under library directories, editor backups and autosave files.
pub struct RemoveNonPackageFiles;

impl Policy for RemoveNonPackageFiles {
    fn name(&self) -> &'static str {
        "RemoveNonPackageFiles"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let junk = [
            Regex::new(r"^/usr/(lib|lib64|libexec)(/.*)?/[^/]+\.la$"),
            Regex::new(r"~$"),
            Regex::new(r"/#[^/]+#$"),
            Regex::new(r"/\.#[^/]+$"),
            Regex::new(r"/core$"),
        ];
        let mut patterns = Vec::new();
        for p in junk {
            patterns.push(p.map_err(|e| Error::ParseError(e.to_string()))?);
        }
        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            if patterns.iter().any(|re| re.is_match(&rel)) {
                ctx.remove(&rel)?;
            }
        }
        Ok(())
    }
}

/// On multilib platforms, move object files installed under `/usr/lib` to
/// the platform library directory. Classification is by content magic;
/// non-object files stay put with a warning.
pub struct FixupMultilibPaths;

impl Policy for FixupMultilibPaths {
    fn name(&self) -> &'static str {
        "FixupMultilibPaths"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let lib = ctx.macros.get("lib")?;
        if lib == "lib" {
            return Ok(());
        }
        let mut moves: Vec<(String, String)> = Vec::new();
        for rel in ctx.walk() {
            let Some(rest) = rel.strip_prefix("/usr/lib/") else {
                continue;
            };
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            if magic::path_is_elf(&real) {
                moves.push((rel.clone(), format!("/usr/{lib}/{rest}")));
            } else {
                ctx.warn(format!(
                    "{rel} is not an object file, left in place on a {lib} platform"
                ));
            }
        }
        for (from, to) in &moves {
            ctx.rename(from, to)?;
        }
        // Repoint symlinks that referenced moved files.
        for rel in ctx.walk() {
            let real = ctx.real_path(&rel);
            if !real.is_symlink() {
                continue;
            }
            let Ok(target) = fs::read_link(&real) else {
                continue;
            };
            let target_str = target.to_string_lossy().to_string();
            if let Some((_, to)) = moves.iter().find(|(from, _)| *from == target_str) {
                fs::remove_file(&real)?;
                std::os::unix::fs::symlink(to, &real)?;
                debug!("retargeted symlink {rel} -> {to}");
            }
        }
        Ok(())
    }
}

/// ELF shared objects must carry execute bits; anything fixed here is also
/// tagged as a shared library.
pub struct ExecutableLibraries;

impl Policy for ExecutableLibraries {
    fn name(&self) -> &'static str {
        "ExecutableLibraries"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let Some(info) = magic::elf_info_for_path(&real) else {
                continue;
            };
            if !info.is_shared_object {
                continue;
            }
            if file_mode(&real)? & 0o111 == 0 {
                set_file_mode(&real, 0o755)?;
                debug!("made {rel} executable");
            }
            ctx.shlibs.insert(rel);
        }
        Ok(())
    }
}

fn regzip(real: &Path) -> Result<()> {
    let mode = file_mode(real)?;
    let compressed = fs::read(real)?;
    let mut raw = Vec::new();
    GzDecoder::new(&compressed[..])
        .read_to_end(&mut raw)
        .map_err(|e| Error::IoError(format!("cannot decompress {}: {e}", real.display())))?;
    // No filename, zero mtime: the `gzip -9n` form.
    let mut encoder = GzBuilder::new().write(Vec::new(), Compression::best());
    encoder.write_all(&raw)?;
    let best = encoder
        .finish()
        .map_err(|e| Error::IoError(format!("cannot recompress {}: {e}", real.display())))?;
    fs::write(real, best)?;
    set_file_mode(real, mode)?;
    Ok(())
}

/// Recompress gzip members with `-9n` and bzip2 members with `-9`,
/// preserving permissions, so identical content yields identical bytes.
pub struct NormalizeCompression;

impl Policy for NormalizeCompression {
    fn name(&self) -> &'static str {
        "NormalizeCompression"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let mut head = [0u8; 3];
            {
                let Ok(mut f) = fs::File::open(&real) else {
                    continue;
                };
                if f.read_exact(&mut head).is_err() {
                    continue;
                }
            }
            if magic::is_gzip(&head) {
                regzip(&real)?;
            } else if magic::is_bzip2(&head) {
                if which::which("bzip2").is_err() {
                    ctx.warn(format!("bzip2 not available, {rel} left as-is"));
                    continue;
                }
                let mode = file_mode(&real)?;
                let status = Command::new("bzip2")
                    .args(["-d", "-q"])
                    .arg(&real)
                    .status()
                    .map_err(|e| Error::IoError(format!("cannot spawn bzip2: {e}")))?;
                if !status.success() {
                    return Err(Error::IoError(format!("bzip2 -d failed for {rel}")));
                }
                let plain = real.with_extension("");
                let status = Command::new("bzip2")
                    .args(["-9", "-q"])
                    .arg(&plain)
                    .status()
                    .map_err(|e| Error::IoError(format!("cannot spawn bzip2: {e}")))?;
                if !status.success() {
                    return Err(Error::IoError(format!("bzip2 -9 failed for {rel}")));
                }
                set_file_mode(&real, mode)?;
            }
        }
        Ok(())
    }
}

/// Relocate the obsolete `/usr/man` hierarchy before man pages are
/// normalized.
pub struct FixupManpagePaths;

impl Policy for FixupManpagePaths {
    fn name(&self) -> &'static str {
        "FixupManpagePaths"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let moves: Vec<(String, String)> = ctx
            .walk()
            .into_iter()
            .filter_map(|rel| {
                rel.strip_prefix("/usr/man/")
                    .map(|rest| (rel.clone(), format!("/usr/share/man/{rest}")))
            })
            .collect();
        for (from, to) in moves {
            ctx.rename(&from, &to)?;
        }
        let old = ctx.real_path("/usr/man");
        if old.exists() {
            fs::remove_dir_all(old)?;
        }
        Ok(())
    }
}

/// A page whose body is nothing but a `.so` directive (comments and blank
/// lines allowed) points at another page.
fn so_reference(body: &str) -> Option<String> {
    let mut reference = None;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(".\\\"") || line.starts_with("'\\\"") {
            continue;
        }
        if let Some(page) = line.strip_prefix(".so ") {
            if reference.is_some() {
                return None;
            }
            reference = Some(page.trim().to_string());
        } else {
            return None;
        }
    }
    reference
}

/// Decode man page bytes, falling back to latin-1 for legacy pages.
fn decode_page(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| b as char).collect(),
    }
}

/// Normalize man pages: strip destdir references from page bodies, turn
/// `.so`-only pages into symlinks, re-encode latin-1 pages as UTF-8, and
/// gzip everything at maximum compression.
pub struct NormalizeManPages;

impl Policy for NormalizeManPages {
    fn name(&self) -> &'static str {
        "NormalizeManPages"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let mandir = ctx.macros.get("mandir")?;
        let destdir_str = ctx.destdir.to_string_lossy().to_string();
        let pages: Vec<String> = ctx
            .walk()
            .into_iter()
            .filter(|rel| rel.starts_with(&format!("{mandir}/")))
            .filter(|rel| !ctx.exceptions.excluded(self.name(), rel))
            .collect();

        // Pass one: rewrite bodies and convert .so stubs to symlinks.
        for rel in &pages {
            let real = ctx.real_path(rel);
            if real.is_symlink() || rel.ends_with(".gz") {
                continue;
            }
            let raw = fs::read(&real)?;
            let mut body = decode_page(&raw);
            if body.contains(&destdir_str) {
                body = body.replace(&destdir_str, "");
            }
            if let Some(referenced) = so_reference(&body) {
                // `.so man1/foo.1` is relative to the man root.
                let target = format!("{mandir}/{referenced}.gz");
                let link_target = relative_path(rel, &target);
                fs::remove_file(&real)?;
                let link = ctx.real_path(&format!("{rel}.gz"));
                std::os::unix::fs::symlink(&link_target, &link)?;
                ctx.manifest.remove(rel.as_str());
                ctx.record(&format!("{rel}.gz"), None);
                debug!("converted .so stub {rel} to symlink");
                continue;
            }
            fs::write(&real, body.as_bytes())?;
        }

        // Pass two: compress what is left uncompressed.
        for rel in ctx.walk() {
            if !rel.starts_with(&format!("{mandir}/")) || rel.ends_with(".gz") {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let mode = file_mode(&real)?;
            let raw = fs::read(&real)?;
            let mut encoder = GzBuilder::new().write(Vec::new(), Compression::best());
            encoder.write_all(&raw)?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::IoError(format!("cannot compress {rel}: {e}")))?;
            let gz_rel = format!("{rel}.gz");
            fs::write(ctx.real_path(&gz_rel), compressed)?;
            set_file_mode(&ctx.real_path(&gz_rel), mode)?;
            fs::remove_file(&real)?;
            let target = ctx.manifest.remove(rel.as_str()).unwrap_or(None);
            ctx.record(&gz_rel, target);
        }
        Ok(())
    }
}

/// Relative path from the directory of `from` to `to` (both destdir-relative
/// absolute paths).
fn relative_path(from: &str, to: &str) -> String {
    let from_parts: Vec<&str> = from.split('/').filter(|s| !s.is_empty()).collect();
    let to_parts: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let from_dir = &from_parts[..from_parts.len().saturating_sub(1)];
    let common = from_dir
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<String> = vec!["..".to_string(); from_dir.len() - common];
    parts.extend(to_parts[common..].iter().map(|s| s.to_string()));
    parts.join("/")
}

/// X11 app-defaults belong under the X11 prefix, not `/etc`.
pub struct NormalizeAppDefaults;

impl Policy for NormalizeAppDefaults {
    fn name(&self) -> &'static str {
        "NormalizeAppDefaults"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let sysconfdir = ctx.macros.get("sysconfdir")?;
        let x11prefix = ctx.macros.get("x11prefix")?;
        let old_prefix = format!("{sysconfdir}/X11/app-defaults/");
        let moves: Vec<(String, String)> = ctx
            .walk()
            .into_iter()
            .filter_map(|rel| {
                rel.strip_prefix(&old_prefix)
                    .map(|rest| (rel.clone(), format!("{x11prefix}/lib/X11/app-defaults/{rest}")))
            })
            .collect();
        for (from, to) in moves {
            ctx.rename(&from, &to)?;
        }
        Ok(())
    }
}

fn rewrite_shebang(real: &Path, new_line: &str) -> Result<()> {
    let raw = fs::read(real)?;
    let header_end = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
    let mut out = Vec::with_capacity(raw.len());
    out.extend_from_slice(b"#!");
    out.extend_from_slice(new_line.as_bytes());
    out.extend_from_slice(&raw[header_end..]);
    fs::write(real, out)?;
    Ok(())
}

/// Resolve `#!/usr/bin/env x` shebangs to concrete interpreter paths,
/// preferring interpreters installed in the destdir.
pub struct NormalizeInterpreterPaths;

impl NormalizeInterpreterPaths {
    fn resolve(ctx: &PolicyContext, program: &str) -> Option<String> {
        for dir in ["/usr/bin", "/bin", "/usr/sbin", "/sbin"] {
            let candidate = format!("{dir}/{program}");
            if ctx.real_path(&candidate).exists() {
                return Some(candidate);
            }
        }
        which::which(program)
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    }
}

impl Policy for NormalizeInterpreterPaths {
    fn name(&self) -> &'static str {
        "NormalizeInterpreterPaths"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let docdir = ctx.macros.get("thisdocdir")?;
        let mut failures = Vec::new();
        for rel in ctx.walk() {
            if rel.starts_with(&format!("{docdir}/")) || ctx.exceptions.excluded(self.name(), &rel)
            {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            // Widen read permission temporarily when the build installed an
            // unreadable script.
            let mode = file_mode(&real)?;
            if mode & 0o400 == 0 {
                set_file_mode(&real, mode | 0o400)?;
            }
            let raw = fs::read(&real)?;
            let outcome = (|| -> Result<()> {
                let Some(line) = magic::shebang(&raw) else {
                    return Ok(());
                };
                let env_rest = line
                    .strip_prefix("/usr/bin/env ")
                    .or_else(|| line.strip_prefix("/bin/env "));
                let Some(rest) = env_rest else {
                    return Ok(());
                };
                let Some(program) = rest.split_whitespace().next() else {
                    return Ok(());
                };
                match Self::resolve(ctx, program) {
                    Some(path) => {
                        let args = rest[program.len()..].trim_end();
                        let new_line = format!("{path}{args}");
                        rewrite_shebang(&real, &new_line)?;
                        debug!("rewrote shebang of {rel} to {new_line}");
                        Ok(())
                    }
                    None => Err(Error::PolicyError(vec![format!(
                        "cannot resolve interpreter '{program}' for {rel}"
                    )])),
                }
            })();
            if mode & 0o400 == 0 {
                set_file_mode(&real, mode)?;
            }
            if let Err(e) = outcome {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PolicyError(failures))
        }
    }
}

/// Rewrite unversioned `#!/usr/bin/python` shebangs to the one python
/// version shipped in the destdir, or per the recipe's explicit map.
pub struct NormalizePythonInterpreterVersion;

impl Policy for NormalizePythonInterpreterVersion {
    fn name(&self) -> &'static str {
        "NormalizePythonInterpreterVersion"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let versioned = Regex::new(r"^/usr/bin/python[0-9]+(\.[0-9]+)*$")
            .map_err(|e| Error::ParseError(e.to_string()))?;
        let installed: Vec<String> = ctx
            .walk()
            .into_iter()
            .filter(|rel| versioned.is_match(rel))
            .collect();

        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() || file_mode(&real)? & 0o111 == 0 {
                continue;
            }
            let raw = fs::read(&real)?;
            let Some(line) = magic::shebang(&raw) else {
                continue;
            };
            let program = line.split_whitespace().next().unwrap_or("");
            if program != "/usr/bin/python" {
                continue;
            }
            let replacement = if let Some(mapped) = ctx.python_version_map.get(&rel) {
                mapped.clone()
            } else {
                match installed.as_slice() {
                    [] => continue,
                    [only] => only.clone(),
                    many => {
                        return Err(Error::PolicyError(vec![format!(
                            "{rel}: multiple python interpreters present ({}) and no explicit \
                             version map",
                            many.join(", ")
                        )]));
                    }
                }
            };
            let args = &line[program.len()..];
            rewrite_shebang(&real, &format!("{replacement}{args}"))?;
            debug!("versioned python shebang of {rel}");
        }
        Ok(())
    }
}

/// pkg-config files belong in the platform libdir.
pub struct NormalizePkgConfig;

impl Policy for NormalizePkgConfig {
    fn name(&self) -> &'static str {
        "NormalizePkgConfig"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let libdir = ctx.macros.get("libdir")?;
        if libdir == "/usr/lib" {
            return Ok(());
        }
        let moves: Vec<(String, String)> = ctx
            .walk()
            .into_iter()
            .filter(|rel| rel.ends_with(".pc"))
            .filter_map(|rel| {
                rel.strip_prefix("/usr/lib/pkgconfig/")
                    .map(|rest| (rel.clone(), format!("{libdir}/pkgconfig/{rest}")))
            })
            .collect();
        for (from, to) in moves {
            ctx.rename(&from, &to)?;
        }
        Ok(())
    }
}

/// GNU info pages go to `%(infodir)s`, compressed; the `dir` index is a
/// system file and never ships.
pub struct NormalizeInfoPages;

impl Policy for NormalizeInfoPages {
    fn name(&self) -> &'static str {
        "NormalizeInfoPages"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let infodir = ctx.macros.get("infodir")?;
        if infodir != "/usr/info" {
            let moves: Vec<(String, String)> = ctx
                .walk()
                .into_iter()
                .filter_map(|rel| {
                    rel.strip_prefix("/usr/info/")
                        .map(|rest| (rel.clone(), format!("{infodir}/{rest}")))
                })
                .collect();
            for (from, to) in moves {
                ctx.rename(&from, &to)?;
            }
            let old = ctx.real_path("/usr/info");
            if old.exists() {
                fs::remove_dir_all(old)?;
            }
        }
        let dir_index = format!("{infodir}/dir");
        if ctx.real_path(&dir_index).exists() {
            ctx.remove(&dir_index)?;
        }
        for rel in ctx.walk() {
            if !rel.starts_with(&format!("{infodir}/")) || rel.ends_with(".gz") {
                continue;
            }
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let mode = file_mode(&real)?;
            let raw = fs::read(&real)?;
            let mut encoder = GzBuilder::new().write(Vec::new(), Compression::best());
            encoder.write_all(&raw)?;
            let compressed = encoder
                .finish()
                .map_err(|e| Error::IoError(format!("cannot compress {rel}: {e}")))?;
            let gz_rel = format!("{rel}.gz");
            fs::write(ctx.real_path(&gz_rel), compressed)?;
            set_file_mode(&ctx.real_path(&gz_rel), mode)?;
            fs::remove_file(&real)?;
            let target = ctx.manifest.remove(rel.as_str()).unwrap_or(None);
            ctx.record(&gz_rel, target);
        }
        Ok(())
    }
}

/// Modernize PAM configuration: drop `$ISA` module path tokens and rewrite
/// obsolete `pam_stack` lines as `include` directives.
pub struct NormalizePamConfig;

impl Policy for NormalizePamConfig {
    fn name(&self) -> &'static str {
        "NormalizePamConfig"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let sysconfdir = ctx.macros.get("sysconfdir")?;
        let pam_prefix = format!("{sysconfdir}/pam.d/");
        let stack = Regex::new(r"(?m)^(\s*\S+\s+)\S+\s+pam_stack\.so\s+service=(\S+).*$")
            .map_err(|e| Error::ParseError(e.to_string()))?;
        for rel in ctx.walk() {
            if !rel.starts_with(&pam_prefix) || ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let body = fs::read_to_string(&real)?;
            let rewritten = stack.replace_all(&body, "${1}include ${2}").to_string();
            let rewritten = rewritten.replace("$ISA/", "");
            if rewritten != body {
                fs::write(&real, rewritten)?;
                debug!("normalized pam config {rel}");
            }
        }
        Ok(())
    }
}

/// Turn destdir-absolute symlink targets into relative ones so the link
/// works wherever the tree is installed.
pub struct RelativeSymlinks;

impl Policy for RelativeSymlinks {
    fn name(&self) -> &'static str {
        "RelativeSymlinks"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        for rel in ctx.walk() {
            let real = ctx.real_path(&rel);
            if !real.is_symlink() {
                continue;
            }
            let Ok(target) = fs::read_link(&real) else {
                continue;
            };
            let target_str = target.to_string_lossy().to_string();
            if target_str.starts_with("..") {
                ctx.warn(format!("{rel} is a back-referencing symlink ({target_str})"));
                continue;
            }
            if !target_str.starts_with('/') {
                continue;
            }
            // Only relativize when the target resolves inside the destdir.
            if !ctx.real_path(&target_str).exists() {
                continue;
            }
            let relative = relative_path(&rel, &target_str);
            fs::remove_file(&real)?;
            std::os::unix::fs::symlink(&relative, &real)?;
            debug!("relativized symlink {rel} -> {relative}");
        }
        Ok(())
    }
}

/// Run `ldconfig -n` over destdir library directories and report any links
/// it would add or remove.
pub struct NormalizeLibrarySymlinks;

impl Policy for NormalizeLibrarySymlinks {
    fn name(&self) -> &'static str {
        "NormalizeLibrarySymlinks"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let Ok(ldconfig) = which::which("ldconfig") else {
            ctx.warn("ldconfig not available, library symlinks unchecked".to_string());
            return Ok(());
        };
        let lib = ctx.macros.get("lib")?;
        let mut dirs = vec![format!("/usr/{lib}"), format!("/{lib}")];
        if lib != "lib" {
            dirs.push("/usr/lib".to_string());
            dirs.push("/lib".to_string());
        }
        for dir in dirs {
            let real_dir = ctx.real_path(&dir);
            if !real_dir.is_dir() {
                continue;
            }
            let listing = |d: &Path| -> std::collections::BTreeSet<String> {
                fs::read_dir(d)
                    .map(|entries| {
                        entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.file_name().to_string_lossy().to_string())
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let before = listing(&real_dir);
            let status = Command::new(&ldconfig)
                .arg("-n")
                .arg(&real_dir)
                .status()
                .map_err(|e| Error::IoError(format!("cannot spawn ldconfig: {e}")))?;
            if !status.success() {
                ctx.warn(format!("ldconfig -n failed in {dir}"));
                continue;
            }
            let after = listing(&real_dir);
            for added in after.difference(&before) {
                ctx.warn(format!("ldconfig added {added} in {dir}"));
                ctx.record(&format!("{dir}/{added}"), None);
            }
            for removed in before.difference(&after) {
                ctx.warn(format!("ldconfig removed {removed} in {dir}"));
                ctx.manifest.remove(&format!("{dir}/{removed}"));
            }
        }
        Ok(())
    }
}

/// Documentation must be world-readable; execute bits are left alone.
pub struct ReadableDocs;

impl Policy for ReadableDocs {
    fn name(&self) -> &'static str {
        "ReadableDocs"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let docdir = ctx.macros.get("thisdocdir")?;
        for rel in ctx.walk() {
            if !rel.starts_with(&format!("{docdir}/")) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let mode = file_mode(&real)?;
            if mode & 0o044 != 0o044 {
                set_file_mode(&real, mode | 0o044)?;
                debug!("made {rel} readable");
            }
        }
        Ok(())
    }
}

/// Strip ELF executables and shared objects. A missing `strip` binary
/// downgrades the pass to a no-op.
pub struct Strip;

impl Policy for Strip {
    fn name(&self) -> &'static str {
        "Strip"
    }

    fn bucket(&self) -> Bucket {
        Bucket::DestdirModification
    }

    fn run(&self, ctx: &mut PolicyContext) -> Result<()> {
        let Ok(strip) = which::which("strip") else {
            ctx.warn("strip not available, binaries left unstripped".to_string());
            return Ok(());
        };
        for rel in ctx.walk() {
            if ctx.exceptions.excluded(self.name(), &rel) {
                continue;
            }
            let real = ctx.real_path(&rel);
            if real.is_symlink() {
                continue;
            }
            let Some(info) = magic::elf_info_for_path(&real) else {
                continue;
            };
            if !info.is_executable && !info.is_shared_object {
                continue;
            }
            let output = Command::new(&strip)
                .arg("--strip-unneeded")
                .arg(&real)
                .output()
                .map_err(|e| Error::IoError(format!("cannot spawn strip: {e}")))?;
            if !output.status.success() {
                // Static archives and unusual objects are not fatal.
                debug!(
                    "strip failed for {rel}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macros::Macros;
    use crate::policy::PolicyExceptions;
    use std::collections::{BTreeMap, BTreeSet};

    struct Fixture {
        dir: tempfile::TempDir,
        macros: Macros,
        reqs: BTreeSet<String>,
        exceptions: PolicyExceptions,
    }

    impl Fixture {
        fn new() -> Self {
            let mut macros = Macros::new();
            macros
                .update([
                    ("lib", "lib"),
                    ("libdir", "/usr/lib"),
                    ("mandir", "/usr/share/man"),
                    ("infodir", "/usr/share/info"),
                    ("sysconfdir", "/etc"),
                    ("x11prefix", "/usr/X11R6"),
                    ("thisdocdir", "/usr/share/doc/foo-1.0"),
                ])
                .unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                macros,
                reqs: BTreeSet::new(),
                exceptions: PolicyExceptions::new(),
            }
        }

        fn ctx(&self) -> PolicyContext<'_> {
            PolicyContext::new(
                self.dir.path(),
                &self.macros,
                BTreeMap::new(),
                &[],
                "foo",
                &self.reqs,
                &self.exceptions,
            )
        }

        fn write(&self, rel: &str, content: &[u8], mode: u32) {
            let path = self.dir.path().join(rel.trim_start_matches('/'));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            set_file_mode(&path, mode).unwrap();
        }

        fn exists(&self, rel: &str) -> bool {
            self.dir
                .path()
                .join(rel.trim_start_matches('/'))
                .symlink_metadata()
                .is_ok()
        }
    }

    #[test]
    fn test_fix_dir_modes() {
        let f = Fixture::new();
        f.write("/opt/closed/file", b"x", 0o644);
        let closed = f.dir.path().join("opt/closed");
        set_file_mode(&closed, 0o500).unwrap();
        let mut ctx = f.ctx();
        FixDirModes.run(&mut ctx).unwrap();
        assert_eq!(file_mode(&closed).unwrap(), 0o700);
        assert_eq!(ctx.dir_modes.get("/opt/closed"), Some(&0o500));
    }

    #[test]
    fn test_remove_non_package_files() {
        let f = Fixture::new();
        f.write("/usr/lib/libfoo.la", b"libtool", 0o644);
        f.write("/usr/bin/script~", b"backup", 0o644);
        f.write("/usr/bin/script", b"keep", 0o755);
        let mut ctx = f.ctx();
        RemoveNonPackageFiles.run(&mut ctx).unwrap();
        assert!(!f.exists("/usr/lib/libfoo.la"));
        assert!(!f.exists("/usr/bin/script~"));
        assert!(f.exists("/usr/bin/script"));
    }

    #[test]
    fn test_remove_honors_exception() {
        let mut f = Fixture::new();
        f.exceptions
            .add("RemoveNonPackageFiles", r"\.la$")
            .unwrap();
        f.write("/usr/lib/libfoo.la", b"libtool", 0o644);
        let mut ctx = f.ctx();
        RemoveNonPackageFiles.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/lib/libfoo.la"));
    }

    #[test]
    fn test_autodoc_installs_readme() {
        let f = Fixture::new();
        let builddir = tempfile::tempdir().unwrap();
        fs::write(builddir.path().join("README.md"), "docs").unwrap();
        fs::write(builddir.path().join("main.c"), "int main(){}").unwrap();
        let mut ctx = f.ctx();
        ctx.builddir = Some(builddir.path().to_path_buf());
        AutoDoc.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/share/doc/foo-1.0/README.md"));
        assert!(!f.exists("/usr/share/doc/foo-1.0/main.c"));
        assert!(ctx.manifest.contains_key("/usr/share/doc/foo-1.0/README.md"));
    }

    #[test]
    fn test_fixup_manpage_paths() {
        let f = Fixture::new();
        f.write("/usr/man/man1/foo.1", b".TH FOO 1", 0o644);
        let mut ctx = f.ctx();
        ctx.manifest.insert("/usr/man/man1/foo.1".to_string(), None);
        FixupManpagePaths.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/share/man/man1/foo.1"));
        assert!(!f.exists("/usr/man"));
        assert!(ctx.manifest.contains_key("/usr/share/man/man1/foo.1"));
    }

    #[test]
    fn test_normalize_man_pages_compresses() {
        let f = Fixture::new();
        f.write("/usr/share/man/man1/foo.1", b".TH FOO 1\nbody\n", 0o644);
        let mut ctx = f.ctx();
        ctx.manifest
            .insert("/usr/share/man/man1/foo.1".to_string(), None);
        NormalizeManPages.run(&mut ctx).unwrap();
        assert!(!f.exists("/usr/share/man/man1/foo.1"));
        assert!(f.exists("/usr/share/man/man1/foo.1.gz"));
        let raw = fs::read(f.dir.path().join("usr/share/man/man1/foo.1.gz")).unwrap();
        assert!(magic::is_gzip(&raw));
    }

    #[test]
    fn test_so_stub_becomes_symlink() {
        let f = Fixture::new();
        f.write(
            "/usr/share/man/man1/alias.1",
            b".\\\" comment\n\n.so man1/real.1\n",
            0o644,
        );
        f.write("/usr/share/man/man1/real.1", b".TH REAL 1\n", 0o644);
        let mut ctx = f.ctx();
        NormalizeManPages.run(&mut ctx).unwrap();
        let link = f.dir.path().join("usr/share/man/man1/alias.1.gz");
        assert!(link.is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap().to_string_lossy(),
            "real.1.gz"
        );
    }

    #[test]
    fn test_so_reference_parsing() {
        assert_eq!(
            so_reference(".so man1/foo.1\n"),
            Some("man1/foo.1".to_string())
        );
        assert_eq!(so_reference(".\\\" header\n.so man1/foo.1\n").as_deref(), Some("man1/foo.1"));
        assert_eq!(so_reference(".so man1/a.1\n.so man1/b.1\n"), None);
        assert_eq!(so_reference(".TH FOO 1\n.so man1/foo.1\n"), None);
    }

    #[test]
    fn test_normalize_compression_regzips() {
        let f = Fixture::new();
        // A gzip member carrying a filename header, as `gzip file` writes.
        let mut encoder = GzBuilder::new()
            .filename("payload")
            .mtime(12345)
            .write(Vec::new(), Compression::fast());
        encoder.write_all(b"payload data").unwrap();
        let sloppy = encoder.finish().unwrap();
        f.write("/usr/share/doc/foo-1.0/notes.gz", &sloppy, 0o644);

        let mut ctx = f.ctx();
        NormalizeCompression.run(&mut ctx).unwrap();

        let normalized = fs::read(f.dir.path().join("usr/share/doc/foo-1.0/notes.gz")).unwrap();
        let mut body = Vec::new();
        GzDecoder::new(&normalized[..]).read_to_end(&mut body).unwrap();
        assert_eq!(body, b"payload data");
        // -9n form: zero mtime, no name flag.
        assert_eq!(&normalized[4..8], &[0, 0, 0, 0]);
        assert_eq!(normalized[3] & 0x08, 0);
    }

    #[test]
    fn test_normalize_pkgconfig_moves() {
        let mut f = Fixture::new();
        f.macros.set_override("libdir", "/usr/lib64").unwrap();
        f.write("/usr/lib/pkgconfig/foo.pc", b"prefix=/usr", 0o644);
        let mut ctx = f.ctx();
        ctx.manifest
            .insert("/usr/lib/pkgconfig/foo.pc".to_string(), None);
        NormalizePkgConfig.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/lib64/pkgconfig/foo.pc"));
        assert!(!f.exists("/usr/lib/pkgconfig/foo.pc"));
    }

    #[test]
    fn test_normalize_info_pages() {
        let f = Fixture::new();
        f.write("/usr/info/foo.info", b"info body", 0o644);
        f.write("/usr/share/info/dir", b"index", 0o644);
        let mut ctx = f.ctx();
        NormalizeInfoPages.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/share/info/foo.info.gz"));
        assert!(!f.exists("/usr/share/info/dir"));
        assert!(!f.exists("/usr/info"));
    }

    #[test]
    fn test_normalize_pam_config() {
        let f = Fixture::new();
        f.write(
            "/etc/pam.d/foo",
            b"auth required pam_stack.so service=system-auth\n\
              auth required $ISA/pam_env.so\n",
            0o644,
        );
        let mut ctx = f.ctx();
        NormalizePamConfig.run(&mut ctx).unwrap();
        let body = fs::read_to_string(f.dir.path().join("etc/pam.d/foo")).unwrap();
        assert!(body.contains("auth include system-auth"));
        assert!(!body.contains("pam_stack"));
        assert!(!body.contains("$ISA"));
        assert!(body.contains("pam_env.so"));
    }

    #[test]
    fn test_relative_symlinks() {
        let f = Fixture::new();
        f.write("/usr/lib/libfoo.so.1.0", b"\x7fELF", 0o755);
        let link = f.dir.path().join("usr/lib/libfoo.so");
        std::os::unix::fs::symlink("/usr/lib/libfoo.so.1.0", &link).unwrap();
        let mut ctx = f.ctx();
        RelativeSymlinks.run(&mut ctx).unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap().to_string_lossy(),
            "libfoo.so.1.0"
        );
    }

    #[test]
    fn test_back_reference_warns() {
        let f = Fixture::new();
        fs::create_dir_all(f.dir.path().join("usr/bin")).unwrap();
        let link = f.dir.path().join("usr/bin/up");
        std::os::unix::fs::symlink("../../outside", &link).unwrap();
        let mut ctx = f.ctx();
        RelativeSymlinks.run(&mut ctx).unwrap();
        assert!(ctx.warnings.iter().any(|w| w.contains("back-referencing")));
    }

    #[test]
    fn test_relative_path_helper() {
        assert_eq!(
            relative_path("/usr/lib/libfoo.so", "/usr/lib/libfoo.so.1"),
            "libfoo.so.1"
        );
        assert_eq!(
            relative_path("/usr/share/man/man1/a.1", "/usr/share/man/man5/b.5.gz"),
            "../man5/b.5.gz"
        );
        assert_eq!(relative_path("/usr/bin/x", "/etc/x.conf"), "../../etc/x.conf");
    }

    #[test]
    fn test_readable_docs() {
        let f = Fixture::new();
        f.write("/usr/share/doc/foo-1.0/secret", b"doc", 0o600);
        f.write("/usr/share/doc/foo-1.0/script.sh", b"#!/bin/sh", 0o700);
        let mut ctx = f.ctx();
        ReadableDocs.run(&mut ctx).unwrap();
        let base = f.dir.path().join("usr/share/doc/foo-1.0");
        assert_eq!(file_mode(&base.join("secret")).unwrap(), 0o644);
        // Execute bits preserved.
        assert_eq!(file_mode(&base.join("script.sh")).unwrap(), 0o744);
    }

    #[test]
    fn test_interpreter_paths_env_rewrite() {
        let f = Fixture::new();
        f.write("/usr/bin/mytool", b"#!/usr/bin/env sh\necho hi\n", 0o755);
        f.write("/usr/bin/sh", b"#!/bin/sh\n", 0o755);
        let mut ctx = f.ctx();
        NormalizeInterpreterPaths.run(&mut ctx).unwrap();
        let body = fs::read_to_string(f.dir.path().join("usr/bin/mytool")).unwrap();
        assert!(body.starts_with("#!/usr/bin/sh\n"));
        assert!(body.contains("echo hi"));
    }

    #[test]
    fn test_interpreter_paths_unresolvable_fails() {
        let f = Fixture::new();
        f.write(
            "/usr/bin/mytool",
            b"#!/usr/bin/env no-such-interpreter-xyzzy\n",
            0o755,
        );
        let mut ctx = f.ctx();
        assert!(NormalizeInterpreterPaths.run(&mut ctx).is_err());
    }

    #[test]
    fn test_python_version_single_interpreter() {
        let f = Fixture::new();
        f.write("/usr/bin/python2.7", b"\x7fELF", 0o755);
        f.write("/usr/bin/tool", b"#!/usr/bin/python\nprint 1\n", 0o755);
        let mut ctx = f.ctx();
        NormalizePythonInterpreterVersion.run(&mut ctx).unwrap();
        let body = fs::read_to_string(f.dir.path().join("usr/bin/tool")).unwrap();
        assert!(body.starts_with("#!/usr/bin/python2.7\n"));
    }

    #[test]
    fn test_python_version_multiple_refused() {
        let f = Fixture::new();
        f.write("/usr/bin/python2.7", b"\x7fELF", 0o755);
        f.write("/usr/bin/python3.9", b"\x7fELF", 0o755);
        f.write("/usr/bin/tool", b"#!/usr/bin/python\n", 0o755);
        let mut ctx = f.ctx();
        assert!(NormalizePythonInterpreterVersion.run(&mut ctx).is_err());
    }

    #[test]
    fn test_python_version_map_overrides() {
        let f = Fixture::new();
        f.write("/usr/bin/python2.7", b"\x7fELF", 0o755);
        f.write("/usr/bin/python3.9", b"\x7fELF", 0o755);
        f.write("/usr/bin/tool", b"#!/usr/bin/python\n", 0o755);
        let mut ctx = f.ctx();
        ctx.python_version_map
            .insert("/usr/bin/tool".to_string(), "/usr/bin/python3.9".to_string());
        NormalizePythonInterpreterVersion.run(&mut ctx).unwrap();
        let body = fs::read_to_string(f.dir.path().join("usr/bin/tool")).unwrap();
        assert!(body.starts_with("#!/usr/bin/python3.9\n"));
    }

    #[test]
    fn test_python_version_skips_non_executable() {
        let f = Fixture::new();
        f.write("/usr/bin/python2.7", b"\x7fELF", 0o755);
        f.write("/usr/share/foo/sample.py", b"#!/usr/bin/python\n", 0o644);
        let mut ctx = f.ctx();
        NormalizePythonInterpreterVersion.run(&mut ctx).unwrap();
        let body = fs::read_to_string(f.dir.path().join("usr/share/foo/sample.py")).unwrap();
        assert!(body.starts_with("#!/usr/bin/python\n"));
    }

    #[test]
    fn test_app_defaults_move() {
        let f = Fixture::new();
        f.write("/etc/X11/app-defaults/XTerm", b"*background: black", 0o644);
        let mut ctx = f.ctx();
        NormalizeAppDefaults.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/X11R6/lib/X11/app-defaults/XTerm"));
        assert!(!f.exists("/etc/X11/app-defaults/XTerm"));
    }

    #[test]
    fn test_multilib_moves_only_objects() {
        let mut f = Fixture::new();
        f.macros.set_override("lib", "lib64").unwrap();
        // Minimal ELF magic is enough for path_is_elf.
        f.write("/usr/lib/libfoo.so.0.0", b"\x7fELF\x02\x01\x01rest", 0o755);
        f.write("/usr/lib/foo.txt", b"not an object", 0o644);
        let mut ctx = f.ctx();
        ctx.manifest
            .insert("/usr/lib/libfoo.so.0.0".to_string(), None);
        FixupMultilibPaths.run(&mut ctx).unwrap();
        assert!(f.exists("/usr/lib64/libfoo.so.0.0"));
        assert!(!f.exists("/usr/lib/libfoo.so.0.0"));
        assert!(f.exists("/usr/lib/foo.txt"));
        assert!(ctx.manifest.contains_key("/usr/lib64/libfoo.so.0.0"));
        assert!(ctx.warnings.iter().any(|w| w.contains("foo.txt")));
    }

    #[test]
    fn test_multilib_updates_symlinks() {
        let mut f = Fixture::new();
        f.macros.set_override("lib", "lib64").unwrap();
        f.write("/usr/lib/libfoo.so.0.0", b"\x7fELF\x02\x01\x01rest", 0o755);
        let link = f.dir.path().join("usr/lib/libfoo.so");
        std::os::unix::fs::symlink("/usr/lib/libfoo.so.0.0", &link).unwrap();
        let mut ctx = f.ctx();
        FixupMultilibPaths.run(&mut ctx).unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap().to_string_lossy(),
            "/usr/lib64/libfoo.so.0.0"
        );
    }
}
