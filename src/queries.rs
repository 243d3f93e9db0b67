//! Call-graph and cross-reference queries, and the call-target rewrite.

use crate::disasm::{decode_function, disassemble_function, symbol_at_address};
use crate::diff::apply_static_keys;
use crate::elf::reloc::{R_X86_64_PC32, R_X86_64_PLT32, r_info};
use crate::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS, SHT_RELA};
use crate::elf::sym::{STT_FUNC, STT_SECTION, Sym};
use crate::elf::Elf;
use crate::error::{Error, Result};
use crate::extract::promote_relocations;
use crate::resolve::{Symbols, resolve_reloc};

/// Rewrite every relocation referencing `from` to reference `to` instead,
/// preserving the relocation type, and return how many were rewritten.
/// The file is only touched when something changed.
pub fn change_call_symbol(path: &str, from: &str, to: &str) -> Result<usize> {
    let mut elf = Elf::open(path)?;
    let (from_index, _) = elf
        .find_symbol_by_name(from)?
        .ok_or_else(|| Error::Unresolved(from.to_string()))?;
    let (to_index, _) = elf
        .find_symbol_by_name(to)?
        .ok_or_else(|| Error::Unresolved(to.to_string()))?;
    let mut replaced = 0;
    for index in 0..elf.sections.len() {
        if elf.sections[index].header.sh_type != SHT_RELA {
            continue;
        }
        for i in 0..elf.sections[index].entry_count() {
            let mut rela = elf.sections[index].rela(i)?;
            if rela.r_sym() == from_index {
                rela.r_info = r_info(to_index as u64, rela.r_type());
                elf.sections[index].set_rela(i, rela)?;
                replaced += 1;
            }
        }
    }
    if replaced > 0 {
        elf.write(path)?;
    }
    Ok(replaced)
}

fn function_code<'a>(elf: &'a Elf, sym: &Sym) -> Option<&'a [u8]> {
    let section = elf.sections.get(sym.st_shndx as usize)?;
    let start = sym.st_value as usize;
    section.data.get(start..start + sym.st_size as usize)
}

fn callees_of(elf: &Elf, symbols: &Symbols, fun: &Sym) -> Result<Vec<usize>> {
    let mut callees = Vec::new();
    let Some(rs) = elf.rela_section_for(fun.st_shndx as usize) else {
        return Ok(callees);
    };
    for rela in elf.sections[rs].relas()? {
        if rela.r_offset < fun.st_value
            || rela.r_offset >= fun.st_value.saturating_add(fun.st_size)
        {
            continue;
        }
        let target = resolve_reloc(symbols, &rela)?;
        if symbols.get(target)?.is_fun && !callees.contains(&target) {
            callees.push(target);
        }
    }
    Ok(callees)
}

fn walk_chains(
    index: usize,
    callees: &[Vec<usize>],
    symbols: &Symbols,
    stack: &mut Vec<usize>,
    visited: &mut [bool],
    lines: &mut Vec<String>,
) -> Result<()> {
    if stack.contains(&index) || visited[index] {
        return Ok(());
    }
    visited[index] = true;
    stack.push(index);
    if callees[index].is_empty() {
        let mut parts = Vec::with_capacity(stack.len());
        for &i in stack.iter().rev() {
            parts.push(symbols.get(i)?.name.as_str());
        }
        lines.push(parts.join(" "));
    } else {
        for &callee in &callees[index] {
            walk_chains(callee, callees, symbols, stack, visited, lines)?;
        }
    }
    stack.pop();
    Ok(())
}

/// Every root-to-leaf path through the call graph, one line per path in
/// leaf-to-root order. Cycles are broken by the path itself; each node is
/// expanded once per root.
pub fn call_chains(path: &str) -> Result<Vec<String>> {
    let elf = Elf::open(path)?;
    let symbols = Symbols::read(&elf)?;
    let mut callees = vec![Vec::new(); symbols.len()];
    for info in symbols.iter() {
        if info.is_fun {
            callees[info.index] = callees_of(&elf, &symbols, &info.sym)?;
        }
    }
    let mut lines = Vec::new();
    for info in symbols.iter() {
        if !info.is_fun {
            continue;
        }
        let mut visited = vec![false; symbols.len()];
        let mut stack = Vec::new();
        walk_chains(
            info.index,
            &callees,
            &symbols,
            &mut stack,
            &mut visited,
            &mut lines,
        )?;
    }
    Ok(lines)
}

/// Every symbol referring to the function `name`: functions found by
/// disassembling their bodies, variables by scanning the relocations of
/// non-executable data sections. Lines are `f:<name>` or `v:<name>` in
/// symbol table order.
pub fn reference_from(path: &str, name: &str) -> Result<Vec<String>> {
    let elf = Elf::open(path)?;
    let (_, query) = elf
        .find_symbol_by_name_type(name, STT_FUNC)?
        .ok_or_else(|| Error::Unresolved(name.to_string()))?;
    let symbols = Symbols::read(&elf)?;
    let mut flagged = vec![false; symbols.len()];

    for info in symbols.iter() {
        if !info.is_fun {
            continue;
        }
        let Some(code) = function_code(&elf, &info.sym) else {
            continue;
        };
        for insn in decode_function(code) {
            let Some(vma) = insn.target else { continue };
            let resolved = symbol_at_address(&elf, &info.sym, code, insn.pc, vma)?;
            if let Some((_, target)) = resolved.target {
                if target == query {
                    flagged[info.index] = true;
                }
            }
        }
    }

    let symtab = elf.symtab()?;
    let sym_count = symtab.entry_count();
    for rs in 0..elf.sections.len() {
        if elf.sections[rs].header.sh_type != SHT_RELA {
            continue;
        }
        let parent_index = elf.sections[rs].header.sh_info as usize;
        let Some(parent) = elf.sections.get(parent_index) else {
            continue;
        };
        if parent.header.sh_type != SHT_PROGBITS
            || parent.header.sh_flags & SHF_ALLOC == 0
            || parent.header.sh_flags & SHF_EXECINSTR != 0
        {
            continue;
        }
        if parent.name.starts_with(".discard.") || parent.name.starts_with("___ksymtab+") {
            continue;
        }
        for rela in elf.sections[rs].relas()? {
            let rsym = if rela.r_sym() < sym_count {
                elf.symtab()?.symbol(rela.r_sym())?
            } else {
                Sym::default()
            };
            let candidate = if rsym.st_name != 0
                && (rela.r_addend == 0 || rela.r_addend == -4 || rela.r_addend == -5)
                && rsym.st_type() != STT_SECTION
            {
                Some(rsym)
            } else {
                let mut addend = rela.r_addend;
                if rela.r_type() == R_X86_64_PC32 || rela.r_type() == R_X86_64_PLT32 {
                    addend += 4;
                }
                elf.find_symbol_starting_at(rsym.st_shndx, addend as u64)?
                    .map(|(_, s)| s)
            };
            let Some(candidate) = candidate else { continue };
            if elf.sym_name(&candidate)? != name {
                continue;
            }
            if let Some((var_index, _)) =
                elf.find_symbol_covering(parent_index as u16, rela.r_offset)?
            {
                flagged[var_index] = true;
            }
        }
    }

    let mut lines = Vec::new();
    for info in symbols.iter() {
        if flagged[info.index] {
            lines.push(format!(
                "{}:{}",
                if info.is_fun { "f" } else { "v" },
                info.name
            ));
        }
    }
    Ok(lines)
}

/// Symbolic listing of the function `name`, one line per instruction.
/// With `convert`, near displacements to other functions are first
/// promoted to relocations, so the listing shows names where raw
/// displacements used to be.
pub fn disassemble_symbol(path: &str, name: &str, convert: bool) -> Result<Vec<String>> {
    let mut elf = Elf::open(path)?;
    let (_, sym) = elf
        .find_symbol_by_name_type(name, STT_FUNC)?
        .ok_or_else(|| Error::Unresolved(name.to_string()))?;
    let shndx = sym.st_shndx as usize;
    if shndx == 0 || shndx >= elf.sections.len() || sym.st_size == 0 {
        return Err(Error::Malformed(format!("{name} has no code to disassemble")));
    }
    let start = sym.st_value as usize;
    let end = start + sym.st_size as usize;
    if convert {
        let mut data = std::mem::take(&mut elf.sections[shndx].data);
        let code = data
            .get_mut(start..end)
            .ok_or_else(|| Error::Malformed(format!("{name} lies outside its section")))?;
        promote_relocations(&mut elf, &sym, code)?;
        elf.sections[shndx].data = data;
    }
    let mut data = std::mem::take(&mut elf.sections[shndx].data);
    apply_static_keys(&elf, &sym, &mut data)?;
    elf.sections[shndx].data = data;

    let code = elf.sections[shndx]
        .data
        .get(start..end)
        .ok_or_else(|| Error::Malformed(format!("{name} lies outside its section")))?;
    disassemble_function(&elf, &sym, code)
}
