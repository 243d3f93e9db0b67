//! The symbol view of an object and the relocation resolver.
//!
//! Compilers frequently express a reference not against the symbol an
//! engineer wrote but against the anonymous `STT_SECTION` symbol of its
//! defining section, with the real target folded into the addend.
//! [`resolve_reloc`] undoes that: it maps any relocation back to the
//! meaningful defining symbol, which is the precondition for diffing,
//! extraction and call-graph walks.

use crate::elf::reloc::{R_X86_64_PC32, R_X86_64_PLT32, Rela};
use crate::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_OBJECT, Sym, st_info};
use crate::elf::Elf;
use crate::error::{Error, Result};

/// A symbol together with everything the engines repeatedly ask about it.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    /// The raw symbol table entry.
    pub sym: Sym,
    /// Resolved name; empty for section symbols and the null entry.
    pub name: String,
    /// Original symbol table index.
    pub index: usize,
    /// A named local or global `STT_FUNC`.
    pub is_fun: bool,
    /// A local or global `STT_OBJECT` living in a `.data.*`, `.bss.*` or
    /// `.rodata.*` section.
    pub is_var: bool,
}

/// The symbol array of one object, indexed by original symbol number.
#[derive(Debug, Clone)]
pub struct Symbols {
    entries: Vec<SymbolInfo>,
}

impl Symbols {
    /// Snapshot the symbol table of `elf`.
    pub fn read(elf: &Elf) -> Result<Symbols> {
        let symtab = elf.symtab()?;
        let syms = symtab.symbols()?;
        let mut entries = Vec::with_capacity(syms.len());
        for (index, sym) in syms.into_iter().enumerate() {
            let name = elf.sym_name(&sym)?.to_string();
            let is_fun = (sym.st_info == st_info(STB_GLOBAL, STT_FUNC)
                || sym.st_info == st_info(STB_LOCAL, STT_FUNC))
                && !name.is_empty();
            let is_var = if sym.st_info == st_info(STB_GLOBAL, STT_OBJECT)
                || sym.st_info == st_info(STB_LOCAL, STT_OBJECT)
            {
                let scn_name = elf.section_name_of(&sym);
                scn_name.starts_with(".data.")
                    || scn_name.starts_with(".bss.")
                    || scn_name.starts_with(".rodata.")
            } else {
                false
            };
            entries.push(SymbolInfo {
                sym,
                name,
                index,
                is_fun,
                is_var,
            });
        }
        Ok(Symbols { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&SymbolInfo> {
        self.entries.get(index).ok_or_else(|| {
            Error::Malformed(format!(
                "symbol index {index} is out of range ({} symbols)",
                self.entries.len()
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.entries.iter()
    }
}

/// The addend as the linker will interpret it: `R_X86_64_PC32` and
/// `R_X86_64_PLT32` displacements are relative to the end of a 4-byte
/// field, so the referenced location is 4 past the raw addend.
pub fn effective_addend(rela: &Rela) -> i64 {
    match rela.r_type() {
        R_X86_64_PC32 | R_X86_64_PLT32 => rela.r_addend + 4,
        _ => rela.r_addend,
    }
}

/// Map a relocation to the meaningful defining symbol.
///
/// Undefined, sized, and `STT_FUNC`/`STT_OBJECT` targets are returned as
/// is. A bare section reference is resolved by scanning the symbols of the
/// same section for the one whose interval contains the adjusted addend.
/// When nothing covers it (a reference into a string pool, say) the
/// original section symbol comes back; callers tell the string-pool case
/// apart by the section's `SHF_MERGE|SHF_STRINGS` flags.
pub fn resolve_reloc(symbols: &Symbols, rela: &Rela) -> Result<usize> {
    let index = rela.r_sym();
    let raw = symbols.get(index)?;
    if raw.sym.st_shndx == 0 || raw.sym.st_size > 0 {
        return Ok(index);
    }
    if raw.sym.st_type() == STT_FUNC || raw.sym.st_type() == STT_OBJECT {
        return Ok(index);
    }
    let shndx = raw.sym.st_shndx;
    let target = effective_addend(rela) as u64;
    for s in symbols.iter() {
        if s.index != index
            && s.sym.st_shndx == shndx
            && target >= s.sym.st_value
            && target < s.sym.st_value.saturating_add(s.sym.st_size)
        {
            return Ok(s.index);
        }
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::reloc::{R_X86_64_64, r_info};
    use crate::elf::section_header::{SHT_PROGBITS, SectionHeader};
    use crate::elf::sym::STT_SECTION;
    use crate::elf::{Elf, Section};

    fn object_with_section_reloc() -> (Elf, Rela, Rela) {
        let mut elf = Elf::create_rel();
        let data = Section {
            header: SectionHeader {
                sh_type: SHT_PROGBITS,
                ..Default::default()
            },
            data: vec![0; 0x40],
            ..Default::default()
        };
        let data_index = elf.push_section(".data.counters", data).unwrap();
        let section_sym = Sym {
            st_info: st_info(STB_LOCAL, STT_SECTION),
            st_shndx: data_index as u16,
            ..Default::default()
        };
        elf.sections[3].push_symbol(section_sym).unwrap();
        let name_off = elf.sections[2].append_str("late_counter");
        let named = Sym {
            st_name: name_off as u32,
            st_info: st_info(STB_LOCAL, STT_OBJECT),
            st_shndx: data_index as u16,
            st_value: 0x10,
            st_size: 8,
            ..Default::default()
        };
        elf.sections[3].push_symbol(named).unwrap();
        // one reloc against the anonymous section symbol, one within range
        let miss = Rela {
            r_offset: 0,
            r_info: r_info(1, R_X86_64_64),
            r_addend: 0x30,
        };
        let hit = Rela {
            r_offset: 8,
            r_info: r_info(1, R_X86_64_64),
            r_addend: 0x12,
        };
        (elf, hit, miss)
    }

    #[test]
    fn section_relative_reference_finds_named_symbol() {
        let (elf, hit, _) = object_with_section_reloc();
        let symbols = Symbols::read(&elf).unwrap();
        let resolved = resolve_reloc(&symbols, &hit).unwrap();
        assert_eq!(symbols.get(resolved).unwrap().name, "late_counter");
        assert!(symbols.get(resolved).unwrap().is_var);
    }

    #[test]
    fn uncovered_reference_falls_back_to_section_symbol() {
        let (elf, _, miss) = object_with_section_reloc();
        let symbols = Symbols::read(&elf).unwrap();
        let resolved = resolve_reloc(&symbols, &miss).unwrap();
        assert_eq!(resolved, 1);
        assert!(symbols.get(resolved).unwrap().name.is_empty());
    }

    #[test]
    fn pc32_addend_is_end_of_field_relative() {
        let rela = Rela {
            r_offset: 0,
            r_info: r_info(1, R_X86_64_PC32),
            r_addend: -4,
        };
        assert_eq!(effective_addend(&rela), 0);
        let abs = Rela {
            r_offset: 0,
            r_info: r_info(1, R_X86_64_64),
            r_addend: 0x20,
        };
        assert_eq!(effective_addend(&abs), 0x20);
    }
}
