//! The x86-64 disassembly bridge.
//!
//! The decoder supplies instruction lengths and, per instruction, at most
//! one interesting displacement: a near branch target or an IP-relative
//! memory address, always relative to the start of the function being
//! decoded. Everything symbolic is layered on top here: a displacement is
//! mapped back to a symbol through the relocations of the function's
//! section first, and through symbol intervals second, so the rendered
//! listing reads in terms of the names the engineer wrote.

use std::collections::HashMap;

use iced_x86::{
    Decoder, DecoderOptions, Formatter, GasFormatter, Instruction, OpKind, SymbolResolver,
    SymbolResult,
};

use crate::elf::Elf;
use crate::elf::reloc::{R_X86_64_PC32, R_X86_64_PLT32};
use crate::elf::sym::{STT_SECTION, Sym};
use crate::error::{Error, Result};

/// One decoded instruction: its offset within the function, its byte
/// length, and the function-relative target of its displacement operand,
/// when it has one.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub pc: usize,
    pub len: usize,
    pub target: Option<u64>,
}

/// A displacement operand resolved against the object's symbols.
#[derive(Debug, Clone)]
pub struct ResolvedOperand {
    /// Displacement field offset within the instruction; 0 when the
    /// instruction carries no operand of interest.
    pub op_off: usize,
    /// Displacement field width in bytes; 0 when there is none.
    pub op_size: usize,
    /// The raw displacement field, zero-extended.
    pub operand: u32,
    /// The target symbol, by symbol table index, if one was found.
    pub target: Option<(usize, Sym)>,
    /// Offset of the target within the resolved symbol, when the covering
    /// relocation lookup produced it.
    pub sym_offset: u32,
}

/// Displacement field position and width derived from the opcode bytes.
///
/// Only the near jump/call family carries a field the rewriting passes
/// care about; every other instruction reports `(0, 0)`.
pub fn operand_spec(inst: &[u8]) -> (usize, usize) {
    match inst {
        [0xE8, ..] => (1, 4),
        [0xE9, ..] => (1, 4),
        [0xEA, ..] => (1, 2),
        [0xEB, ..] => (1, 1),
        [b, ..] if (0x70..=0x7F).contains(b) => (1, 1),
        [0x0F, b, ..] if (0x80..=0x8F).contains(b) => (2, 4),
        _ => (0, 0),
    }
}

fn displacement_target(instruction: &Instruction) -> Option<u64> {
    match instruction.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instruction.near_branch_target())
        }
        _ if instruction.is_ip_rel_memory_operand() => Some(instruction.ip_rel_memory_address()),
        _ => None,
    }
}

/// Decode a whole function, front to back.
pub fn decode_function(code: &[u8]) -> Vec<Insn> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut insns = Vec::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        insns.push(Insn {
            pc: instruction.ip() as usize,
            len: instruction.len(),
            target: displacement_target(&instruction),
        });
    }
    insns
}

/// Find a symbol through a relocation stored at `offset` of the section's
/// rela table.
///
/// A relocation against a named non-section symbol with a plain addend is
/// taken at face value; a section-relative one is chased into the target
/// section's symbols, exactly (`exact`) or by interval. The returned u32
/// is the offset of the resolved location within the symbol.
fn reloc_symbol_at(
    elf: &Elf,
    shndx: u16,
    offset: u64,
    exact: bool,
) -> Result<Option<(usize, Sym, u32)>> {
    let Some(rs) = elf.rela_section_for(shndx as usize) else {
        return Ok(None);
    };
    let symtab = elf.symtab()?;
    let sym_count = symtab.entry_count();
    let rsec = &elf.sections[rs];
    for i in 0..rsec.entry_count() {
        let rela = rsec.rela(i)?;
        if rela.r_offset != offset {
            continue;
        }
        let index = rela.r_sym();
        let sym = if index < sym_count {
            elf.symtab()?.symbol(index)?
        } else {
            Sym::default()
        };
        if sym.st_name != 0
            && (rela.r_addend == 0 || rela.r_addend == -4 || rela.r_addend == -5)
            && sym.st_type() != STT_SECTION
        {
            return Ok(Some((index, sym, 0)));
        }
        let mut addend = rela.r_addend;
        if rela.r_type() == R_X86_64_PC32 || rela.r_type() == R_X86_64_PLT32 {
            addend += 4;
        }
        let found = if exact {
            elf.find_symbol_starting_at(sym.st_shndx, addend as u64)?
        } else {
            elf.find_symbol_covering(sym.st_shndx, addend as u64)?
        };
        if let Some((fi, fs)) = found {
            return Ok(Some((fi, fs, (addend as u64).wrapping_sub(fs.st_value) as u32)));
        }
    }
    Ok(None)
}

/// Resolve the displacement of the instruction at `pc` of `fun`.
///
/// `vma` is the function-relative target the decoder reported. Lookup
/// order: a relocation stored at the target itself (calls through
/// relocated data), a relocation stored at the displacement field, then a
/// symbol starting exactly at the target.
pub fn symbol_at_address(
    elf: &Elf,
    fun: &Sym,
    code: &[u8],
    pc: usize,
    vma: u64,
) -> Result<ResolvedOperand> {
    let inst = &code[pc..];
    let (op_off, op_size) = operand_spec(inst);
    let mut operand: u32 = 0;
    for k in 0..op_size.min(inst.len().saturating_sub(op_off)) {
        operand |= u32::from(inst[op_off + k]) << (8 * k);
    }
    let addr = pc as u64 + fun.st_value + op_off as u64;
    let sec_vma = vma.wrapping_add(fun.st_value);

    let probe = if op_off != 0 && operand == 0 { addr } else { sec_vma };
    let mut sym_offset = 0u32;
    let mut found = reloc_symbol_at(elf, fun.st_shndx, probe, true)?;
    if found.is_none() && inst.first() != Some(&0xE8) {
        let probe = if op_off != 0 { addr } else { sec_vma };
        if let Some((fi, fs, off)) = reloc_symbol_at(elf, fun.st_shndx, probe, false)? {
            sym_offset = off;
            found = Some((fi, fs, off));
        }
    }
    if found.is_none() {
        found = elf
            .find_symbol_starting_at(fun.st_shndx, sec_vma)?
            .map(|(i, s)| (i, s, 0));
    }
    Ok(ResolvedOperand {
        op_off,
        op_size,
        operand,
        target: found.map(|(i, s, _)| (i, s)),
        sym_offset,
    })
}

/// Render the operand the way the listing shows it: a bare name when the
/// target is the symbol itself, `<name+0xOFF>` into its interior, or
/// `<enclosing+0xVMA>` when nothing resolved.
pub fn render_target(
    elf: &Elf,
    fun: &Sym,
    resolved: &ResolvedOperand,
    pc: usize,
    vma: u64,
) -> Result<String> {
    let Some((_, target)) = resolved.target else {
        let enclosing = elf.sym_name(fun)?;
        return Ok(format!("<{enclosing}+0x{vma:X}>"));
    };
    let name = elf.sym_name(&target)?;
    if name.is_empty() {
        let enclosing = elf.sym_name(fun)?;
        return Err(Error::Unresolved(format!(
            "no name for instruction target at offset 0x{pc:x} while disassembling {enclosing}"
        )));
    }
    let sec_vma = vma.wrapping_add(fun.st_value);
    if resolved.sym_offset != 0 {
        Ok(format!("<{name}+0x{:X}>", resolved.sym_offset))
    } else if resolved.operand == 0 || sec_vma == 0 || sec_vma == target.st_value {
        Ok(name.to_string())
    } else {
        Ok(format!("<{name}+0x{vma:X}>"))
    }
}

struct MapResolver {
    map: HashMap<(u64, u64), String>,
}

impl SymbolResolver for MapResolver {
    fn symbol(
        &mut self,
        instruction: &Instruction,
        _operand: u32,
        _instruction_operand: Option<u32>,
        address: u64,
        _address_size: u32,
    ) -> Option<SymbolResult<'_>> {
        self.map
            .get(&(instruction.ip(), address))
            .map(|name| SymbolResult::with_string(address, name.clone()))
    }
}

/// Disassemble a function into symbolic GNU-syntax lines, one per
/// instruction.
pub fn disassemble_function(elf: &Elf, fun: &Sym, code: &[u8]) -> Result<Vec<String>> {
    let mut map = HashMap::new();
    for insn in decode_function(code) {
        if let Some(vma) = insn.target {
            let resolved = symbol_at_address(elf, fun, code, insn.pc, vma)?;
            let text = render_target(elf, fun, &resolved, insn.pc, vma)?;
            map.insert((insn.pc as u64, vma), text);
        }
    }
    let mut formatter = GasFormatter::with_options(Some(Box::new(MapResolver { map })), None);
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut lines = Vec::new();
    let mut line = String::new();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        line.clear();
        formatter.format(&instruction, &mut line);
        lines.push(line.clone());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_table() {
        assert_eq!(operand_spec(&[0xE8, 0, 0, 0, 0]), (1, 4));
        assert_eq!(operand_spec(&[0xE9, 0, 0, 0, 0]), (1, 4));
        assert_eq!(operand_spec(&[0xEB, 0x10]), (1, 1));
        assert_eq!(operand_spec(&[0x74, 0x02]), (1, 1));
        assert_eq!(operand_spec(&[0x0F, 0x84, 0, 0, 0, 0]), (2, 4));
        assert_eq!(operand_spec(&[0x55]), (0, 0));
        assert_eq!(operand_spec(&[0xC3]), (0, 0));
    }

    #[test]
    fn decode_lengths_and_branch_targets() {
        // push %rbp; call +0; jmp .-2 (self loop); ret
        let code = [0x55, 0xE8, 0x00, 0x00, 0x00, 0x00, 0xEB, 0xFE, 0xC3];
        let insns = decode_function(&code);
        assert_eq!(insns.len(), 4);
        assert_eq!(insns[0].len, 1);
        assert_eq!(insns[0].target, None);
        // call displacement 0 targets the next instruction
        assert_eq!(insns[1].target, Some(6));
        // jmp rel8 -2 targets itself
        assert_eq!(insns[2].target, Some(6));
        assert_eq!(insns[3].target, None);
    }

    #[test]
    fn rip_relative_load_reports_target() {
        // mov 0x10(%rip),%rax -> 48 8b 05 10 00 00 00, next ip 7, target 0x17
        let code = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        let insns = decode_function(&code);
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].target, Some(0x17));
    }
}
