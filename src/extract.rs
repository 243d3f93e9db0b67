//! The symbol-closure extractor.
//!
//! Given a list of symbol names, builds a fresh self-contained relocatable
//! object holding those symbols, the static-key targets their code flips,
//! everything they relocate against, and the metadata sections the kernel
//! needs to accept the result as a module. Functions are rebound global
//! on the way out (renamed dot-free, since the module loader rejects dots
//! in global names) and their hardcoded near displacements to other
//! functions are promoted to real `R_X86_64_PC32` relocations so the
//! linker can re-resolve them against the live kernel.

use log::debug;

use crate::disasm::{decode_function, symbol_at_address};
use crate::elf::reloc::{
    R_X86_64_64, R_X86_64_32S, R_X86_64_PC32, R_X86_64_PLT32, Rela, r_info,
};
use crate::elf::section_header::{SHF_STRINGS, SHT_RELA, SectionHeader};
use crate::elf::sym::{STB_LOCAL, STT_FUNC, STT_SECTION, Sym, st_info};
use crate::elf::{Elf, Section};
use crate::error::{Error, Result};
use crate::resolve::{Symbols, resolve_reloc};

/// Sections pulled into every extraction when present, relocations
/// included.
const EXTRA_SECTIONS: [&str; 4] = [
    ".altinstructions",
    ".altinstr_aux",
    ".altinstr_replacement",
    "__bug_table",
];

/// Relocation-copy predicate used by [`Extractor::copy_rel_section`].
#[derive(Clone, Copy, PartialEq)]
enum RelaFilter {
    All,
    /// Keep a `__jump_table` triple only when its patched function was
    /// fully copied and its key symbol is defined.
    JumpTable,
}

/// Rewrite every 4-byte displacement branch of `fun` whose target is a
/// named symbol into a real `R_X86_64_PC32` relocation: the displacement
/// bytes are zeroed in `code` and an entry is appended to the relocation
/// section of `fun`'s defining section in `elf`.
///
/// A displacement that is already zero is skipped, so running this twice
/// adds nothing.
pub fn promote_relocations(elf: &mut Elf, fun: &Sym, code: &mut [u8]) -> Result<()> {
    for insn in decode_function(code) {
        let Some(vma) = insn.target else { continue };
        let resolved = symbol_at_address(elf, fun, code, insn.pc, vma)?;
        let Some((target_index, target)) = resolved.target else {
            continue;
        };
        if resolved.op_size != 4 {
            continue;
        }
        if resolved.operand == 0 {
            continue;
        }
        let field = insn.pc + resolved.op_off;
        code[field..field + 4].fill(0);
        let rs = elf.rela_section_for(fun.st_shndx as usize).ok_or_else(|| {
            Error::Malformed(format!(
                "no relocation section for section {}",
                fun.st_shndx
            ))
        })?;
        elf.sections[rs].push_rela(Rela {
            r_offset: fun.st_value + field as u64,
            r_info: r_info(target_index as u64, R_X86_64_PC32),
            r_addend: i64::from(resolved.sym_offset) - 4,
        })?;
        let name = elf.sym_name(&target).unwrap_or("").to_string();
        debug!("convert to relocation at 0x{:x} ({name})", field);
    }
    Ok(())
}

/// State of one extraction: the input object (mutated only by relocation
/// promotion), its symbol view, the output being built, and the
/// input-to-output copy maps that make every copy idempotent.
pub struct Extractor {
    elf: Elf,
    symbols: Symbols,
    out: Elf,
    copied_scn: Vec<Option<usize>>,
    copied_sym: Vec<Option<usize>>,
}

impl Extractor {
    pub fn new(elf: Elf) -> Result<Extractor> {
        let symbols = Symbols::read(&elf)?;
        let copied_scn = vec![None; elf.sections.len()];
        let copied_sym = vec![None; symbols.len()];
        Ok(Extractor {
            elf,
            symbols,
            out: Elf::create_rel(),
            copied_scn,
            copied_sym,
        })
    }

    /// The finished output object.
    pub fn into_output(self) -> Elf {
        self.out
    }

    fn copy_section(&mut self, index: usize, copy_data: bool) -> Result<usize> {
        if let Some(out_index) = self.copied_scn.get(index).copied().flatten() {
            return Ok(out_index);
        }
        let src = self.elf.sections.get(index).ok_or_else(|| {
            Error::Malformed(format!(
                "section to copy is out of range ({index}/{})",
                self.elf.sections.len()
            ))
        })?;
        let name = src.name.clone();
        let mut header = SectionHeader {
            sh_type: src.header.sh_type,
            sh_flags: src.header.sh_flags,
            sh_entsize: src.header.sh_entsize,
            sh_addralign: src.header.sh_addralign,
            ..Default::default()
        };
        let data = if copy_data {
            header.sh_size = src.header.sh_size;
            src.data.clone()
        } else {
            Vec::new()
        };
        let out_index = self.out.push_section(
            &name,
            Section {
                header,
                data,
                ..Default::default()
            },
        )?;
        self.copied_scn[index] = Some(out_index);
        Ok(out_index)
    }

    /// Copy symbol `index` into the output symbol table.
    ///
    /// With `copy_sec` the defining section comes along, bytes included,
    /// the symbol is rebound global, and function bodies get their near
    /// displacements promoted. Without it the symbol becomes an undefined
    /// global the final link resolves externally.
    fn copy_symbol(&mut self, index: usize, copy_sec: bool) -> Result<usize> {
        if let Some(copied) = self.copied_sym[index] {
            return Ok(copied);
        }
        let info = self.symbols.get(index)?.clone();
        let old = info.sym;
        let mut new_sym = old;
        let defined = old.st_shndx > 0 && (old.st_shndx as usize) < self.elf.sections.len();
        if defined && copy_sec {
            let out_scn = self.copy_section(old.st_shndx as usize, true)?;
            new_sym.st_shndx = out_scn as u16;
            if old.st_name != 0 {
                new_sym.st_info = st_info(crate::elf::sym::STB_GLOBAL, old.st_type());
                let strtab = self.out_strtab()?;
                if old.st_type() == STT_FUNC {
                    let fun_name = info.name.replace('.', "_");
                    new_sym.st_name = self.out.sections[strtab].append_str(&fun_name) as u32;
                    let mut data = std::mem::take(&mut self.out.sections[out_scn].data);
                    let start = old.st_value as usize;
                    let end = start + old.st_size as usize;
                    let code = data.get_mut(start..end).ok_or_else(|| {
                        Error::Malformed(format!("{} lies outside its section", info.name))
                    })?;
                    promote_relocations(&mut self.elf, &old, code)?;
                    self.out.sections[out_scn].data = data;
                } else {
                    new_sym.st_name = self.out.sections[strtab].append_str(&info.name) as u32;
                }
            }
        } else {
            if defined {
                new_sym.st_shndx = 0;
            }
            new_sym.st_size = 0;
            new_sym.st_info = st_info(crate::elf::sym::STB_GLOBAL, old.st_type());
            if old.st_name != 0 {
                let strtab = self.out_strtab()?;
                new_sym.st_name = self.out.sections[strtab].append_str(&info.name) as u32;
            }
        }
        let symtab = self.out.symtab_index()?;
        let new_index = self.out.sections[symtab].push_symbol(new_sym)?;
        self.copied_sym[index] = Some(new_index);
        Ok(new_index)
    }

    fn out_strtab(&self) -> Result<usize> {
        self.out
            .section_index_by_name(".strtab")
            .ok_or_else(|| Error::Malformed("output has no .strtab".into()))
    }

    fn keep_rela(&self, filter: RelaFilter, rela_sec: usize, index: usize) -> Result<bool> {
        match filter {
            RelaFilter::All => Ok(true),
            RelaFilter::JumpTable => {
                let base = index / 3 * 3;
                let code_rela = self.elf.sections[rela_sec].rela(base)?;
                let code_target = resolve_reloc(&self.symbols, &code_rela)?;
                let Some(copied) = self.copied_sym[code_target] else {
                    return Ok(false);
                };
                let out_sym = self.out.symtab()?.symbol(copied)?;
                if out_sym.st_size == 0 {
                    return Ok(false);
                }
                let key_rela = self.elf.sections[rela_sec].rela(base + 2)?;
                let key_target = resolve_reloc(&self.symbols, &key_rela)?;
                Ok(self.symbols.get(key_target)?.sym.st_size > 0)
            }
        }
    }

    /// Copy the relocation section `index` into the output, targeting the
    /// output section `rel_to`; `from_sym` restricts the copy to entries
    /// inside one symbol's byte range.
    fn copy_rel_section(
        &mut self,
        index: usize,
        rel_to: usize,
        from_sym: Option<Sym>,
        filter: RelaFilter,
    ) -> Result<()> {
        let out_scn = self.copy_section(index, false)?;
        let out_symtab = self.out.symtab_index()?;
        self.out.sections[out_scn].header.sh_link = out_symtab as u32;
        self.out.sections[out_scn].header.sh_info = rel_to as u32;

        let count = self.elf.sections[index].entry_count();
        for i in 0..count {
            let mut rela = self.elf.sections[index].rela(i)?;
            if let Some(fs) = from_sym {
                if rela.r_offset < fs.st_value
                    || rela.r_offset > fs.st_value.saturating_add(fs.st_size)
                {
                    continue;
                }
            }
            if !self.keep_rela(filter, index, i)? {
                continue;
            }
            let sym_index = rela.r_sym();
            let rtype = rela.r_type();
            let raw = self.symbols.get(sym_index)?.clone();
            let (sec_flags, sec_name) = match self.elf.sections.get(raw.sym.st_shndx as usize) {
                Some(s) => (s.header.sh_flags, s.name.clone()),
                None => (0, String::new()),
            };
            let new_sym_index = if sec_flags & SHF_STRINGS != 0
                || sec_name.starts_with(".rodata.__func__")
                || sec_name.starts_with(".rodata.cst16")
                || sec_name.starts_with("__tracepoint_str")
                || sec_name.starts_with("__trace_printk_fmt")
            {
                // references into pools: take the whole backing section
                self.copy_symbol(sym_index, true)?
            } else {
                let resolved_index = if from_sym.is_none() {
                    sym_index
                } else {
                    resolve_reloc(&self.symbols, &rela)?
                };
                let resolved = self.symbols.get(resolved_index)?.clone();
                let copy_sec = if from_sym.is_none() {
                    true
                } else {
                    !(resolved.is_fun || resolved.is_var)
                };
                let new_index = self.copy_symbol(resolved_index, copy_sec)?;
                if from_sym.is_some()
                    && matches!(
                        rtype,
                        R_X86_64_PC32 | R_X86_64_PLT32 | R_X86_64_32S | R_X86_64_64
                    )
                    && raw.sym.st_type() == STT_SECTION
                    && rela.r_addend != -4
                {
                    // make the addend relative to the named symbol we now
                    // reference instead of its section
                    rela.r_addend -= resolved.sym.st_value as i64;
                }
                new_index
            };
            rela.r_info = r_info(new_sym_index as u64, rtype);
            self.out.sections[out_scn].push_rela(rela)?;
        }
        Ok(())
    }

    fn copy_section_with_rel(
        &mut self,
        index: usize,
        from_sym: Option<Sym>,
        filter: RelaFilter,
    ) -> Result<usize> {
        let new_scn = self.copy_section(index, true)?;
        if let Some(rs) = self.elf.rela_section_for(index) {
            self.copy_rel_section(rs, new_scn, from_sym, filter)?;
        }
        Ok(new_scn)
    }

    /// Mark the named symbols, plus the static-key `key` symbols of every
    /// `__jump_table` entry whose patched code lands in a marked function.
    fn mark_symbols(&self, names: &[String]) -> Result<Vec<bool>> {
        let mut marked = vec![false; self.symbols.len()];
        for name in names {
            let (index, _) = self
                .elf
                .find_symbol_by_name(name)?
                .ok_or_else(|| Error::Unresolved(name.clone()))?;
            marked[index] = true;
        }
        if let Some(jt) = self.elf.section_index_by_name("__jump_table") {
            let rs = self.elf.rela_section_for(jt).ok_or_else(|| {
                Error::Malformed("Can't find relocation section for __jump_table".into())
            })?;
            let rsec = &self.elf.sections[rs];
            let count = rsec.entry_count();
            let mut i = 0;
            while i + 2 < count {
                let code_rela = rsec.rela(i)?;
                let code_target = resolve_reloc(&self.symbols, &code_rela)?;
                if marked[code_target] {
                    let key_rela = rsec.rela(i + 2)?;
                    let key_target = resolve_reloc(&self.symbols, &key_rela)?;
                    marked[key_target] = true;
                    debug!(
                        "mark '{}' symbol to copy as it's a static_key",
                        self.symbols.get(key_target)?.name
                    );
                }
                i += 3;
            }
        }
        Ok(marked)
    }

    /// Run the whole extraction.
    pub fn run(&mut self, names: &[String]) -> Result<()> {
        let marked = self.mark_symbols(names)?;

        for index in 0..marked.len() {
            if !marked[index] {
                continue;
            }
            let sym = self.symbols.get(index)?.sym;
            if sym.st_shndx > 0 && (sym.st_shndx as usize) < self.elf.sections.len() {
                self.copy_section(sym.st_shndx as usize, true)?;
            }
            self.copy_symbol(index, true)?;
        }

        for index in 0..marked.len() {
            if !marked[index] {
                continue;
            }
            let sym = self.symbols.get(index)?.sym;
            if sym.st_shndx > 0 && (sym.st_shndx as usize) < self.elf.sections.len() {
                self.copy_section_with_rel(sym.st_shndx as usize, Some(sym), RelaFilter::All)?;
            }
        }

        // relocation sections of copied .rodata whose own copy never
        // happened (string pools pulled in whole, mostly)
        for rs in 0..self.elf.sections.len() {
            if self.elf.sections[rs].header.sh_type != SHT_RELA {
                continue;
            }
            let parent = self.elf.sections[rs].header.sh_info as usize;
            let Some(copied_parent) = self.copied_scn.get(parent).copied().flatten() else {
                continue;
            };
            if self.copied_scn[rs].is_some() {
                continue;
            }
            if !self.elf.sections[parent].name.starts_with(".rodata") {
                continue;
            }
            debug!("copy missed {} section", self.elf.sections[rs].name);
            let everything = Sym {
                st_size: u64::MAX,
                ..Default::default()
            };
            self.copy_rel_section(rs, copied_parent, Some(everything), RelaFilter::All)?;
        }

        for name in EXTRA_SECTIONS {
            if let Some(index) = self.elf.section_index_by_name(name) {
                debug!("copy {name} section");
                self.copy_section_with_rel(index, None, RelaFilter::All)?;
            }
        }

        if let Some(jt) = self.elf.section_index_by_name("__jump_table") {
            debug!("copy __jump_table section");
            let new_scn = self.copy_section_with_rel(jt, None, RelaFilter::JumpTable)?;
            if let Some(out_rs) = self.out.rela_section_for(new_scn) {
                let count = self.out.sections[out_rs].entry_count();
                // each surviving triple describes one 16-byte entry
                let new_size = 16 * count / 3;
                self.out.sections[new_scn].data.truncate(new_size);
                self.out.sections[new_scn].header.sh_size = new_size as u64;
                for i in 0..count {
                    let mut rela = self.out.sections[out_rs].rela(i)?;
                    rela.r_offset = (i / 3 * 16 + i % 3 * 4) as u64;
                    self.out.sections[out_rs].set_rela(i, rela)?;
                }
            }
        }

        sort_symtab(&mut self.out)
    }
}

/// Stable-partition the symbol table so every local precedes every global
/// and weak symbol, rewrite each relocation's symbol index through the
/// permutation, and set `sh_info` to the first non-local index.
pub fn sort_symtab(elf: &mut Elf) -> Result<()> {
    let symtab_index = elf.symtab_index()?;
    let syms = elf.sections[symtab_index].symbols()?;
    let n = syms.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| u8::from(syms[i].st_bind() != STB_LOCAL));
    let mut perm = vec![0usize; n];
    for (new_index, &old_index) in order.iter().enumerate() {
        perm[old_index] = new_index;
        elf.sections[symtab_index].set_symbol(new_index, syms[old_index])?;
    }
    let first_global = syms.iter().filter(|s| s.st_bind() == STB_LOCAL).count();
    elf.sections[symtab_index].header.sh_info = first_global as u32;

    for section in 0..elf.sections.len() {
        if elf.sections[section].header.sh_type != SHT_RELA {
            continue;
        }
        for i in 0..elf.sections[section].entry_count() {
            let mut rela = elf.sections[section].rela(i)?;
            let old = rela.r_sym();
            if old < n {
                rela.r_info = r_info(perm[old] as u64, rela.r_type());
                elf.sections[section].set_rela(i, rela)?;
            }
        }
    }
    Ok(())
}

/// Extract `names` from the object at `path` into a fresh object at
/// `out_path`.
pub fn extract_symbols(path: &str, out_path: &str, names: &[String]) -> Result<()> {
    let elf = Elf::open(path)?;
    let mut extractor = Extractor::new(elf)?;
    extractor.run(names)?;
    extractor.into_output().write(out_path)
}
