//! The cross-compilation diff engine.
//!
//! Two builds of the same translation unit are compared symbol by symbol,
//! semantically rather than textually: function bytes are normalized for
//! static-key sites before comparison, a disassembled-text pass absorbs
//! layout-only encoding differences, and a relocation-name checksum
//! catches changes that live entirely in relocations (a different string
//! literal, a different callee) without being disturbed by section
//! renumbering or local-symbol reordering. Near jumps with displacements
//! too short to relink independently propagate a modified verdict into
//! their targets until a fixed point.

use log::debug;

use crate::disasm::{decode_function, disassemble_function, symbol_at_address};
use crate::elf::reloc::{R_X86_64_PC32, R_X86_64_PLT32};
use crate::elf::section_header::{SHF_MERGE, SHF_STRINGS};
use crate::elf::sym::{STT_FUNC, STT_OBJECT, STT_SECTION, Sym};
use crate::elf::Elf;
use crate::error::{Error, Result};

/// Per-symbol verdict of one comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoDiff,
    NewVariable,
    ModifiedVariable,
    NewFunction,
    ModifiedFunction,
}

/// One reported difference, carrying the symbol's name.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub verdict: Verdict,
    pub name: String,
}

const CRC_POLY: u32 = 0x04c1_1db7;

const fn build_crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = build_crc_table();

/// MSB-first table-driven CRC-32, zero initial value, no final xor.
pub fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = (crc << 8) ^ CRC_TABLE[(((crc >> 24) ^ u32::from(byte)) & 0xff) as usize];
    }
    crc
}

const NOP2: [u8; 2] = [0x66, 0x90];
const NOP4: [u8; 4] = [0x0f, 0x1f, 0x40, 0x00];
const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

/// Materialize every `__jump_table` entry landing inside `fun` as the jump
/// the kernel would patch in, so both sides of a comparison carry the same
/// bytes regardless of which nop shape the compiler emitted.
///
/// `bytes` is the whole payload of the function's section; jump-table
/// addends are section-relative. Applying this twice is a no-op: a site
/// already holding a jump opcode is left alone.
pub fn apply_static_keys(elf: &Elf, fun: &Sym, bytes: &mut [u8]) -> Result<()> {
    let Some(rs) = elf.section_index_by_name(".rela__jump_table") else {
        return Ok(());
    };
    let relas = elf.sections[rs].relas()?;
    let symtab = elf.symtab()?;
    let sym_count = symtab.entry_count();
    for (i, rela) in relas.iter().enumerate() {
        let rsym = if rela.r_sym() < sym_count {
            symtab.symbol(rela.r_sym())?
        } else {
            Sym::default()
        };
        if rsym.st_shndx != fun.st_shndx {
            continue;
        }
        if rela.r_offset % 16 != 0 {
            continue;
        }
        if rela.r_addend < fun.st_value as i64
            || rela.r_addend > (fun.st_value + fun.st_size) as i64
        {
            continue;
        }
        let jmp = relas.get(i + 1).ok_or_else(|| {
            Error::Malformed(format!("truncated __jump_table entry at relocation {i}"))
        })?;
        let at = rela.r_addend as usize;
        let Some(&first) = bytes.get(at) else {
            return Err(Error::Malformed(format!(
                "__jump_table code slot 0x{at:x} is outside its section"
            )));
        };
        let disp = jmp.r_addend - rela.r_addend;
        if bytes[at..].starts_with(&NOP2) {
            bytes[at] = 0xEB;
            bytes[at + 1] = (disp - 2) as u8;
        } else if bytes[at..].starts_with(&NOP4) {
            bytes[at] = 0xEA;
            bytes[at + 1..at + 3].copy_from_slice(&((disp - 3) as u16).to_le_bytes());
        } else if bytes[at..].starts_with(&NOP5) {
            bytes[at] = 0xE9;
            bytes[at + 1..at + 5].copy_from_slice(&((disp - 5) as u32).to_le_bytes());
        } else if first != 0xEB && first != 0xEA && first != 0xE9 {
            let name = elf.sym_name(fun).unwrap_or("");
            return Err(Error::Unrecognized(format!(
                "static_key at index {i} for {name} [0x{:x}] (0x{first:x})",
                fun.st_value
            )));
        }
    }
    Ok(())
}

/// Checksum of every relocation inside `fun`'s byte range, keyed by the
/// name it meaningfully refers to and its offset within the function.
pub fn rel_sym_hash(elf: &Elf, fun: &Sym) -> Result<u32> {
    let mut crc = 0u32;
    let Some(rs) = elf.rela_section_for(fun.st_shndx as usize) else {
        return Ok(crc);
    };
    let symtab = elf.symtab()?;
    let sym_count = symtab.entry_count();
    for rela in elf.sections[rs].relas()? {
        if rela.r_offset < fun.st_value || rela.r_offset > fun.st_value.saturating_add(fun.st_size)
        {
            continue;
        }
        let rsym = if rela.r_sym() < sym_count {
            symtab.symbol(rela.r_sym())?
        } else {
            Sym::default()
        };
        let merge_strings = elf
            .sections
            .get(rsym.st_shndx as usize)
            .filter(|s| s.header.sh_flags & (SHF_MERGE | SHF_STRINGS) != 0);
        let name = if rsym.st_type() != STT_SECTION {
            elf.sym_name(&rsym)?.to_string()
        } else if let Some(section) = merge_strings {
            if (section.header.sh_size as i64) > rela.r_addend {
                section.str_at(rela.r_addend as usize)?.to_string()
            } else {
                String::new()
            }
        } else {
            let mut addend = rela.r_addend;
            if rela.r_type() == R_X86_64_PC32 || rela.r_type() == R_X86_64_PLT32 {
                addend += 4;
            }
            match elf.find_symbol_starting_at(rsym.st_shndx, addend as u64)? {
                Some((_, s)) => elf.sym_name(&s)?.to_string(),
                None => String::new(),
            }
        };
        crc = crc32_update(crc, &(rela.r_offset - fun.st_value).to_le_bytes());
        crc = crc32_update(crc, name.as_bytes());
    }
    Ok(crc)
}

fn function_code<'a>(elf: &'a Elf, fun: &Sym) -> Result<&'a [u8]> {
    let section = elf
        .sections
        .get(fun.st_shndx as usize)
        .ok_or_else(|| Error::Malformed(format!("symbol section {} out of range", fun.st_shndx)))?;
    let start = fun.st_value as usize;
    let end = start + fun.st_size as usize;
    section.data.get(start..end).ok_or_else(|| {
        Error::Malformed(format!(
            "symbol range [0x{start:x}..0x{end:x}] is outside its section"
        ))
    })
}

/// Compare the function `name` between two objects.
pub fn equal_functions(a: &Elf, b: &Elf, name: &str) -> Result<bool> {
    let (_, sym_a) = a
        .find_symbol_by_name_type(name, STT_FUNC)?
        .ok_or_else(|| Error::Unresolved(name.to_string()))?;
    let (_, sym_b) = b
        .find_symbol_by_name_type(name, STT_FUNC)?
        .ok_or_else(|| Error::Unresolved(name.to_string()))?;
    if sym_a.st_size != sym_b.st_size {
        return Ok(false);
    }
    let section_of = |elf: &Elf, sym: &Sym| -> Result<Vec<u8>> {
        elf.sections
            .get(sym.st_shndx as usize)
            .map(|s| s.data.clone())
            .ok_or_else(|| Error::Malformed(format!("{name} has no defining section")))
    };
    let mut data_a = section_of(a, &sym_a)?;
    let mut data_b = section_of(b, &sym_b)?;
    apply_static_keys(a, &sym_a, &mut data_a)?;
    apply_static_keys(b, &sym_b, &mut data_b)?;
    let range_a = sym_a.st_value as usize..(sym_a.st_value + sym_a.st_size) as usize;
    let range_b = sym_b.st_value as usize..(sym_b.st_value + sym_b.st_size) as usize;
    let code_a = data_a
        .get(range_a)
        .ok_or_else(|| Error::Malformed(format!("{name} lies outside its section")))?;
    let code_b = data_b
        .get(range_b)
        .ok_or_else(|| Error::Malformed(format!("{name} lies outside its section")))?;

    if code_a != code_b {
        let lines_a = disassemble_function(a, &sym_a, code_a)?;
        let lines_b = disassemble_function(b, &sym_b, code_b)?;
        // the first instruction may be a placeholder the runtime rewrites
        // into the __fentry__ call; both nop and call forms must compare
        // equal there
        let starts_nop = |lines: &[String]| lines.first().is_some_and(|l| l.starts_with("nop"));
        let equal = if starts_nop(&lines_a) || starts_nop(&lines_b) {
            lines_a.get(1..) == lines_b.get(1..)
        } else {
            lines_a == lines_b
        };
        if !equal {
            return Ok(false);
        }
    }
    Ok(rel_sym_hash(a, &sym_a)? == rel_sym_hash(b, &sym_b)?)
}

fn near_jump_scan(elf: &Elf, fun: &Sym, verdicts: &mut [Verdict]) -> Result<()> {
    let code = function_code(elf, fun)?;
    for insn in decode_function(code) {
        let Some(vma) = insn.target else { continue };
        let resolved = symbol_at_address(elf, fun, code, insn.pc, vma)?;
        let Some((index, target)) = resolved.target else {
            continue;
        };
        if resolved.op_size == 4 || resolved.op_size == 0 {
            continue;
        }
        if target == *fun {
            continue;
        }
        if index < verdicts.len() && verdicts[index] == Verdict::NoDiff {
            verdicts[index] = Verdict::ModifiedFunction;
            debug!(
                "short jump into a neighbouring function detected ({} -> {})",
                elf.sym_name(fun).unwrap_or(""),
                elf.sym_name(&target).unwrap_or("")
            );
        }
    }
    Ok(())
}

/// Diff two loaded objects; entries come back in the new object's symbol
/// table order.
pub fn diff_objects(old: &Elf, new: &Elf) -> Result<Vec<DiffEntry>> {
    let symtab = new.symtab()?;
    let syms = symtab.symbols()?;
    let mut verdicts = vec![Verdict::NoDiff; syms.len()];
    let section_count = new.sections.len();

    for (i, sym) in syms.iter().enumerate() {
        if sym.st_size == 0
            || sym.st_shndx == 0
            || sym.st_shndx as usize >= section_count
            || sym.st_name == 0
        {
            continue;
        }
        let name = new.sym_name(sym)?.to_string();
        if sym.st_type() == STT_FUNC {
            if old.find_symbol_by_name_type(&name, STT_FUNC)?.is_none() {
                verdicts[i] = Verdict::NewFunction;
            } else if !equal_functions(new, old, &name)? {
                verdicts[i] = Verdict::ModifiedFunction;
            }
        } else if sym.st_type() == STT_OBJECT {
            if old.find_symbol_by_name_type(&name, STT_OBJECT)?.is_none() {
                let scn = new.section_name_of(sym);
                if scn == ".bss"
                    || scn == ".data"
                    || scn == ".rodata"
                    || scn == format!(".bss.{name}")
                    || scn == format!(".data.{name}")
                    || scn == format!(".rodata.{name}")
                {
                    verdicts[i] = Verdict::NewVariable;
                }
            } else if name.starts_with("__func__") {
                verdicts[i] = Verdict::NewVariable;
            }
        }
    }

    // short jumps cannot be relinked across a replaced neighbour, so keep
    // upgrading their targets until a full pass adds nothing
    loop {
        let before = verdicts.iter().filter(|v| **v != Verdict::NoDiff).count();
        for i in 0..syms.len() {
            if verdicts[i] == Verdict::NewFunction || verdicts[i] == Verdict::ModifiedFunction {
                near_jump_scan(new, &syms[i], &mut verdicts)?;
            }
        }
        let after = verdicts.iter().filter(|v| **v != Verdict::NoDiff).count();
        if after == before {
            break;
        }
    }

    let mut entries = Vec::new();
    for (i, sym) in syms.iter().enumerate() {
        if verdicts[i] != Verdict::NoDiff {
            entries.push(DiffEntry {
                verdict: verdicts[i],
                name: new.sym_name(sym)?.to_string(),
            });
        }
    }
    Ok(entries)
}

/// Diff two objects on disk and render the report lines.
pub fn diff_files(old_path: &str, new_path: &str) -> Result<Vec<String>> {
    let old = Elf::open(old_path)?;
    let new = Elf::open(new_path)?;
    let mut lines = Vec::new();
    for entry in diff_objects(&old, &new)? {
        let label = match entry.verdict {
            Verdict::ModifiedVariable => "Modified variable",
            Verdict::NewVariable => "New variable",
            Verdict::ModifiedFunction => "Modified function",
            Verdict::NewFunction => "New function",
            Verdict::NoDiff => continue,
        };
        lines.push(format!("{label}: {}", entry.name));
    }
    Ok(lines)
}
