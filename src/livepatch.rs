//! Conversion of a finished module into a kernel livepatch module.
//!
//! The kernel resolves a livepatch's references to private kernel symbols
//! itself, at patch time. To ask for that, the module stops relocating
//! those symbols the ordinary way: every relocation against them is pulled
//! out of its section and re-emitted under `.klp.rela.<obj>.<sec>` with
//! the `SHF_RELA_LIVEPATCH` flag, and the symbols themselves are renamed
//! to `.klp.sym.<obj>.<name>,<pos>` with `SHN_LIVEPATCH` as their section
//! index, `<pos>` picking among same-named kernel symbols.

use log::debug;

use crate::elf::reloc::Rela;
use crate::elf::section_header::{
    SHF_ALLOC, SHF_RELA_LIVEPATCH, SHN_LIVEPATCH, SHT_RELA, SectionHeader,
};
use crate::elf::{Elf, Section};
use crate::error::{Error, Result};

/// `MODULE_NAME_LEN - 1` of the kernel: the longest object name a triple
/// may carry.
const MODULE_NAME_MAX: usize = 55;
/// `KSYM_NAME_LEN - 1` of the kernel: the longest symbol name a triple may
/// carry.
const SYMBOL_NAME_MAX: usize = 127;

/// One `objname.symname,pos` triple, parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolRef {
    pub obj: String,
    pub name: String,
    pub pos: u32,
}

/// Parse `objname.symname,pos`; the object name ends at the first dot,
/// the symbol name at the comma.
pub fn parse_symbol_ref(text: &str) -> Result<SymbolRef> {
    let bad = || Error::Malformed(format!("symbol '{text}' has an incorrectly formatted name"));
    let dot = text.find('.').ok_or_else(bad)?;
    let obj = &text[..dot];
    if obj.is_empty() || obj.len() > MODULE_NAME_MAX {
        return Err(bad());
    }
    let rest = &text[dot + 1..];
    let comma = rest.find(',').ok_or_else(bad)?;
    let name = &rest[..comma];
    if name.is_empty() || name.len() > SYMBOL_NAME_MAX {
        return Err(bad());
    }
    let pos: u32 = rest[comma + 1..].parse().map_err(|_| bad())?;
    Ok(SymbolRef {
        obj: obj.to_string(),
        name: name.to_string(),
        pos,
    })
}

struct KlpSymbol {
    /// `.klp.sym.obj.name,pos`, the symbol's name after conversion.
    klp_name: String,
    /// The plain symbol name the module currently uses.
    name: String,
    /// Offset of `klp_name` in `.strtab` once appended.
    str_off: u64,
}

struct RemovedGroup {
    header: SectionHeader,
    sec_name: String,
    relas: Vec<Rela>,
}

/// Convert `elf` in place.
pub fn convert(elf: &mut Elf, obj_name: &str, triples: &[String]) -> Result<()> {
    let mut to_relocate = Vec::with_capacity(triples.len());
    for text in triples {
        let parsed = parse_symbol_ref(text)?;
        to_relocate.push(KlpSymbol {
            klp_name: format!(".klp.sym.{text}"),
            name: parsed.name,
            str_off: 0,
        });
    }

    let names: Vec<String> = elf
        .symtab()?
        .symbols()?
        .iter()
        .map(|s| elf.sym_name(s).map(str::to_string))
        .collect::<Result<_>>()?;

    // strip every relocation against a targeted symbol, grouped by the
    // section it came from
    let mut groups: Vec<RemovedGroup> = Vec::new();
    for index in 0..elf.sections.len() {
        if elf.sections[index].header.sh_type != SHT_RELA {
            continue;
        }
        let sec_name = elf.sections[index].name.clone();
        if sec_name == ".rela.debug_info" || sec_name == ".rela__jump_table" {
            continue;
        }
        let mut kept = Vec::new();
        let mut removed = Vec::new();
        for rela in elf.sections[index].relas()? {
            let sym = rela.r_sym();
            let matched = names
                .get(sym)
                .is_some_and(|n| to_relocate.iter().any(|k| *n == k.name));
            if matched {
                debug!("remove relocation '{}' from '{sec_name}'", names[sym]);
                removed.push(rela);
            } else {
                kept.push(rela);
            }
        }
        if removed.is_empty() {
            continue;
        }
        groups.push(RemovedGroup {
            header: elf.sections[index].header,
            sec_name,
            relas: removed,
        });
        let section = &mut elf.sections[index];
        section.data.clear();
        section.header.sh_size = 0;
        for rela in kept {
            section.push_rela(rela)?;
        }
    }

    let strtab = elf
        .section_index_by_name(".strtab")
        .ok_or_else(|| Error::Malformed("Failed to find .strtab section".into()))?;
    for klp in &mut to_relocate {
        klp.str_off = elf.sections[strtab].append_str(&klp.klp_name);
    }

    // repoint every targeted symbol table entry at its livepatch name;
    // when several triples name the same symbol the last one wins
    let symtab = elf.symtab_index()?;
    for i in 0..elf.sections[symtab].entry_count() {
        let mut sym = elf.sections[symtab].symbol(i)?;
        let mut converted = false;
        for klp in &to_relocate {
            if names[i] == klp.name {
                sym.st_name = klp.str_off as u32;
                sym.st_shndx = SHN_LIVEPATCH;
                converted = true;
                debug!("convert to livepatch symbol '{}'", names[i]);
            }
        }
        if converted {
            elf.sections[symtab].set_symbol(i, sym)?;
        }
    }

    // re-emit each removed group under its .klp.rela.* section
    let shstrndx = elf.header.e_shstrndx as usize;
    let mut prev_sec = String::new();
    let mut name_off = 0u64;
    let mut new_name = String::new();
    for group in &groups {
        if prev_sec != group.sec_name {
            let suffix = group.sec_name.strip_prefix(".rela").ok_or_else(|| {
                Error::Malformed(format!(
                    "relocation section '{}' has an unexpected name",
                    group.sec_name
                ))
            })?;
            new_name = format!(".klp.rela.{obj_name}{suffix}");
            name_off = elf.sections[shstrndx].append_str(&new_name);
            debug!("add section '{new_name}' to string table");
            prev_sec = group.sec_name.clone();
        }
        let mut header = group.header;
        header.sh_name = name_off as u32;
        header.sh_flags = SHF_ALLOC | SHF_RELA_LIVEPATCH;
        header.sh_size = 0;
        let mut section = Section {
            name: new_name.clone(),
            header,
            data: Vec::new(),
        };
        for &rela in &group.relas {
            section.push_rela(rela)?;
        }
        elf.sections.push(section);
    }
    Ok(())
}

/// Convert the module at `path` in place.
pub fn make_livepatch(path: &str, obj_name: &str, triples: &[String]) -> Result<()> {
    let mut elf = Elf::open(path)?;
    convert(&mut elf, obj_name, triples)?;
    elf.write(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_parsing() {
        let parsed = parse_symbol_ref("vmlinux.bar,1").unwrap();
        assert_eq!(parsed.obj, "vmlinux");
        assert_eq!(parsed.name, "bar");
        assert_eq!(parsed.pos, 1);
        // the symbol name may itself carry dots
        let parsed = parse_symbol_ref("vmlinux.foo.cold,2").unwrap();
        assert_eq!(parsed.name, "foo.cold");
        assert!(parse_symbol_ref("nodotshere").is_err());
        assert!(parse_symbol_ref("obj.name").is_err());
        assert!(parse_symbol_ref("obj.name,x").is_err());
        assert!(parse_symbol_ref(".name,1").is_err());
        let long_obj = format!("{}.sym,1", "o".repeat(56));
        assert!(parse_symbol_ref(&long_obj).is_err());
    }
}
