// src/magic.rs

//! File classification by content magic
//!
//! Policies decide by what a file is, not what it is named: multilib moves
//! operate on object files only, strip targets ELF executables and shared
//! objects, compression normalization looks at gzip/bzip2 magic, and the
//! dependency pass reads soname and DT_NEEDED entries out of ELF headers.

use goblin::elf::Elf;
use std::fs;
use std::path::Path;

/// Summary of an ELF object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    /// "ELF32" or "ELF64"
    pub class: &'static str,
    /// Machine architecture name, lowercased (e.g. "x86_64")
    pub arch: String,
    /// True for ET_DYN objects
    pub is_shared_object: bool,
    /// True for ET_EXEC, or ET_DYN with an interpreter (PIE)
    pub is_executable: bool,
    /// DT_SONAME, if present
    pub soname: Option<String>,
    /// DT_NEEDED entries
    pub needed: Vec<String>,
    /// PT_INTERP path, if present
    pub interpreter: Option<String>,
}

impl ElfInfo {
    /// Flags attached to soname dependencies derived from this object.
    pub fn soname_flags(&self) -> Vec<String> {
        vec!["SysV".to_string(), self.arch.clone()]
    }
}

pub fn is_elf(content: &[u8]) -> bool {
    content.len() >= 4 && &content[0..4] == b"\x7fELF"
}

pub fn is_gzip(content: &[u8]) -> bool {
    content.len() >= 2 && content[0] == 0x1f && content[1] == 0x8b
}

pub fn is_bzip2(content: &[u8]) -> bool {
    content.len() >= 3 && &content[0..3] == b"BZh"
}

/// Shebang line of a script, without the `#!` and trailing newline.
pub fn shebang(content: &[u8]) -> Option<String> {
    if content.len() < 2 || &content[0..2] != b"#!" {
        return None;
    }
    let end = content
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(content.len());
    String::from_utf8(content[2..end].to_vec())
        .ok()
        .map(|s| s.trim().to_string())
}

/// Parse ELF metadata out of file content. Returns `None` for anything that
/// is not a well-formed ELF object.
pub fn elf_info(content: &[u8]) -> Option<ElfInfo> {
    if !is_elf(content) {
        return None;
    }
    let elf = Elf::parse(content).ok()?;
    let class = if elf.is_64 { "ELF64" } else { "ELF32" };
    let arch = goblin::elf::header::machine_to_str(elf.header.e_machine).to_lowercase();
    let is_shared_object = elf.header.e_type == goblin::elf::header::ET_DYN;
    let is_executable = elf.header.e_type == goblin::elf::header::ET_EXEC
        || (is_shared_object && elf.interpreter.is_some());
    Some(ElfInfo {
        class,
        arch,
        is_shared_object,
        is_executable,
        soname: elf.soname.map(|s| s.to_string()),
        needed: elf.libraries.iter().map(|s| s.to_string()).collect(),
        interpreter: elf.interpreter.map(|s| s.to_string()),
    })
}

/// Read and classify a file on disk; I/O or parse failure yields `None`.
pub fn elf_info_for_path(path: &Path) -> Option<ElfInfo> {
    let content = fs::read(path).ok()?;
    elf_info(&content)
}

/// True when the on-disk file is an ELF object (executable, library, or
/// relocatable). Reads only the magic.
pub fn path_is_elf(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    match fs::File::open(path) {
        Ok(mut f) => {
            use std::io::Read;
            f.read_exact(&mut magic).is_ok() && &magic == b"\x7fELF"
        }
        Err(_) => false,
    }
}
