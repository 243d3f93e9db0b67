mod common;

use std::io::Write;

use common::ObjBuilder;
use kpatchelf::elf::Elf;
use kpatchelf::elf::reloc::{R_X86_64_PC32, r_type};
use kpatchelf::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS};
use kpatchelf::elf::sym::{STB_GLOBAL, STT_FUNC, STT_NOTYPE, STT_OBJECT};
use kpatchelf::queries::{call_chains, change_call_symbol, disassemble_symbol, reference_from};

const TEXT: u64 = SHF_ALLOC | SHF_EXECINSTR;

fn write_temp(elf: &Elf) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&elf.to_bytes().unwrap()).unwrap();
    file.flush().unwrap();
    file
}

/// caller() does three relocated calls to printk.
fn object_with_printk_calls() -> Elf {
    let mut b = ObjBuilder::new();
    let mut code = Vec::new();
    for _ in 0..3 {
        code.extend_from_slice(&[0xE8, 0x00, 0x00, 0x00, 0x00]);
    }
    code.push(0xC3);
    let text = b.section(".text.caller", SHT_PROGBITS, TEXT, code);
    b.symbol("caller", text, 0, 0x10, STB_GLOBAL, STT_FUNC);
    b.symbol("printk", 0, 0, 0, STB_GLOBAL, STT_NOTYPE);
    b.symbol("pr_info", 0, 0, 0, STB_GLOBAL, STT_NOTYPE);
    let rela = b.rela_section(".rela.text.caller", text);
    b.rela(rela, 0x01, 2, R_X86_64_PC32, -4);
    b.rela(rela, 0x06, 2, R_X86_64_PC32, -4);
    b.rela(rela, 0x0B, 2, R_X86_64_PC32, -4);
    b.build()
}

#[test]
fn change_call_symbol_rewrites_every_matching_relocation() {
    let file = write_temp(&object_with_printk_calls());
    let path = file.path().to_str().unwrap();
    let replaced = change_call_symbol(path, "printk", "pr_info").unwrap();
    assert_eq!(replaced, 3);

    let elf = Elf::open(path).unwrap();
    let (pr_info, _) = elf.find_symbol_by_name("pr_info").unwrap().unwrap();
    let rela_index = elf.section_index_by_name(".rela.text.caller").unwrap();
    for rela in elf.sections[rela_index].relas().unwrap() {
        assert_eq!(rela.r_sym(), pr_info);
        assert_eq!(r_type(rela.r_info), R_X86_64_PC32);
    }
}

#[test]
fn change_call_symbol_reports_when_nothing_matched() {
    let file = write_temp(&object_with_printk_calls());
    let path = file.path().to_str().unwrap();
    let replaced = change_call_symbol(path, "pr_info", "printk").unwrap();
    assert_eq!(replaced, 0);
}

#[test]
fn change_call_symbol_rejects_unknown_symbols() {
    let file = write_temp(&object_with_printk_calls());
    let path = file.path().to_str().unwrap();
    assert!(change_call_symbol(path, "no_such_symbol", "printk").is_err());
}

/// a -> b -> c -> a, with c also reaching the leaf d.
fn cyclic_object() -> Elf {
    let mut b = ObjBuilder::new();
    let call = vec![0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3];
    let ta = b.section(".text.a", SHT_PROGBITS, TEXT, call.clone());
    let tb = b.section(".text.b", SHT_PROGBITS, TEXT, call.clone());
    let tc = b.section(".text.c", SHT_PROGBITS, TEXT, call.clone());
    let td = b.section(".text.d", SHT_PROGBITS, TEXT, vec![0xC3]);
    let sa = b.symbol("a", ta, 0, 6, STB_GLOBAL, STT_FUNC);
    let sb = b.symbol("b", tb, 0, 6, STB_GLOBAL, STT_FUNC);
    let sc = b.symbol("c", tc, 0, 6, STB_GLOBAL, STT_FUNC);
    let sd = b.symbol("d", td, 0, 1, STB_GLOBAL, STT_FUNC);
    let ra = b.rela_section(".rela.text.a", ta);
    b.rela(ra, 1, sb, R_X86_64_PC32, -4);
    let rb = b.rela_section(".rela.text.b", tb);
    b.rela(rb, 1, sc, R_X86_64_PC32, -4);
    let rc = b.rela_section(".rela.text.c", tc);
    b.rela(rc, 1, sa, R_X86_64_PC32, -4);
    b.rela(rc, 1, sd, R_X86_64_PC32, -4);
    b.build()
}

#[test]
fn call_chains_break_cycles_and_reach_leaves() {
    let file = write_temp(&cyclic_object());
    let lines = call_chains(file.path().to_str().unwrap()).unwrap();
    assert!(lines.contains(&"d c b a".to_string()));
    for line in &lines {
        let names: Vec<&str> = line.split(' ').collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(names.len(), unique.len(), "cycle leaked into {line}");
    }
}

#[test]
fn reference_from_finds_calling_functions() {
    let mut b = ObjBuilder::new();
    let target_text = b.section(".text.target", SHT_PROGBITS, TEXT, vec![0xC3]);
    b.symbol("target", target_text, 0, 1, STB_GLOBAL, STT_FUNC);
    let caller_text = b.section(
        ".text.caller",
        SHT_PROGBITS,
        TEXT,
        vec![0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3],
    );
    b.symbol("caller", caller_text, 0, 6, STB_GLOBAL, STT_FUNC);
    let rela = b.rela_section(".rela.text.caller", caller_text);
    b.rela(rela, 1, 1, R_X86_64_PC32, -4);
    // a function pointer in a data section also counts, as a variable
    let data = b.section(".data.handler", SHT_PROGBITS, SHF_ALLOC, vec![0; 8]);
    b.symbol("handler", data, 0, 8, STB_GLOBAL, STT_OBJECT);
    let drela = b.rela_section(".rela.data.handler", data);
    b.rela(drela, 0, 1, kpatchelf::elf::reloc::R_X86_64_64, 0);

    let file = write_temp(&b.build());
    let lines = reference_from(file.path().to_str().unwrap(), "target").unwrap();
    assert!(lines.contains(&"f:caller".to_string()), "{lines:?}");
    assert!(lines.contains(&"v:handler".to_string()), "{lines:?}");
    assert!(!lines.iter().any(|l| l.ends_with(":target")));
}

#[test]
fn disassembly_is_symbolic() {
    let file = write_temp(&object_with_printk_calls());
    let lines = disassemble_symbol(file.path().to_str().unwrap(), "caller", false).unwrap();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].contains("printk"), "{lines:?}");
    assert!(lines[3].starts_with("ret"), "{lines:?}");
}

#[test]
fn disassembly_of_unknown_symbol_fails() {
    let file = write_temp(&object_with_printk_calls());
    assert!(disassemble_symbol(file.path().to_str().unwrap(), "nope", false).is_err());
}
