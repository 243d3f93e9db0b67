mod common;

use common::ObjBuilder;
use kpatchelf::elf::Elf;
use kpatchelf::elf::reloc::{R_X86_64_64, R_X86_64_PC32};
use kpatchelf::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHT_PROGBITS, SHT_RELA};
use kpatchelf::elf::sym::{STB_GLOBAL, STB_LOCAL, STT_FUNC, STT_OBJECT, STT_SECTION};
use kpatchelf::extract::{Extractor, sort_symtab};

const TEXT: u64 = SHF_ALLOC | SHF_EXECINSTR;

/// foo calls bar at offset 0x10 through a raw rel32 displacement, no
/// relocation.
fn object_with_near_call() -> Elf {
    let mut b = ObjBuilder::new();
    let mut code = vec![0x90; 0x30];
    // call bar: E8 <rel32>, rel = 0x20 - 0x15 = 0x0B
    code[0x10..0x15].copy_from_slice(&[0xE8, 0x0B, 0x00, 0x00, 0x00]);
    code[0x20] = 0xB8; // bar: mov $0x7,%eax; ret
    code[0x21..0x25].copy_from_slice(&7u32.to_le_bytes());
    code[0x25] = 0xC3;
    let text = b.section(".text", SHT_PROGBITS, TEXT, code);
    b.symbol("foo", text, 0, 0x20, STB_GLOBAL, STT_FUNC);
    b.symbol("bar", text, 0x20, 0x10, STB_GLOBAL, STT_FUNC);
    b.rela_section(".rela.text", text);
    b.build()
}

fn extract(elf: Elf, names: &[&str]) -> Elf {
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    let mut extractor = Extractor::new(elf).unwrap();
    extractor.run(&names).unwrap();
    extractor.into_output()
}

#[test]
fn near_call_is_promoted_to_a_pc32_relocation() {
    let out = extract(object_with_near_call(), &["foo"]);

    let text = out.section_by_name(".text").expect("text copied");
    // the displacement bytes were zeroed in the copied code
    assert_eq!(&text.data[0x10..0x15], &[0xE8, 0x00, 0x00, 0x00, 0x00]);

    let text_index = out.section_index_by_name(".text").unwrap();
    let rela_index = out.rela_section_for(text_index).expect("rela copied");
    let relas = out.sections[rela_index].relas().unwrap();
    assert_eq!(relas.len(), 1);
    assert_eq!(relas[0].r_offset, 0x11);
    assert_eq!(relas[0].r_addend, -4);
    assert_eq!(relas[0].r_type(), R_X86_64_PC32);

    // bar stays external: an undefined global
    let target = out.symtab().unwrap().symbol(relas[0].r_sym()).unwrap();
    assert_eq!(out.sym_name(&target).unwrap(), "bar");
    assert_eq!(target.st_shndx, 0);
    assert_eq!(target.st_size, 0);
    assert_eq!(target.st_bind(), STB_GLOBAL);
}

#[test]
fn extracted_function_is_rebound_global_and_renamed_dot_free() {
    let mut b = ObjBuilder::new();
    let text = b.section(".text.foo.cold", SHT_PROGBITS, TEXT, vec![0xC3]);
    b.symbol("foo.cold", text, 0, 1, STB_LOCAL, STT_FUNC);
    b.rela_section(".rela.text.foo.cold", text);
    let out = extract(b.build(), &["foo.cold"]);

    let (index, sym) = out.find_symbol_by_name("foo_cold").unwrap().unwrap();
    assert!(index > 0);
    assert_eq!(sym.st_bind(), STB_GLOBAL);
    assert_ne!(sym.st_shndx, 0);
}

#[test]
fn output_symtab_is_partitioned_and_indices_stay_valid() {
    let out = extract(object_with_near_call(), &["foo"]);
    let symtab = out.symtab().unwrap();
    let syms = symtab.symbols().unwrap();
    let first_global = symtab.header.sh_info as usize;
    for (i, sym) in syms.iter().enumerate() {
        if i < first_global {
            assert_eq!(sym.st_bind(), STB_LOCAL);
        } else {
            assert_ne!(sym.st_bind(), STB_LOCAL);
        }
    }
    for section in &out.sections {
        if section.header.sh_type != SHT_RELA {
            continue;
        }
        for rela in section.relas().unwrap() {
            assert!(rela.r_sym() < syms.len());
        }
    }
}

#[test]
fn closure_has_no_local_references() {
    let out = extract(object_with_near_call(), &["foo"]);
    let symtab = out.symtab().unwrap();
    for section in &out.sections {
        if section.header.sh_type != SHT_RELA {
            continue;
        }
        for rela in section.relas().unwrap() {
            let sym = symtab.symbol(rela.r_sym()).unwrap();
            // every reference is either into a copied section or an
            // undefined global
            if sym.st_shndx == 0 {
                assert_eq!(sym.st_bind(), STB_GLOBAL);
            } else {
                assert!((sym.st_shndx as usize) < out.sections.len());
            }
        }
    }
}

#[test]
fn sort_rewrites_relocation_indices_to_the_same_names() {
    let mut b = ObjBuilder::new();
    let text = b.section(".text", SHT_PROGBITS, TEXT, vec![0x90; 8]);
    let g = b.symbol("early_global", text, 0, 4, STB_GLOBAL, STT_FUNC);
    let l = b.symbol("late_local", text, 4, 4, STB_LOCAL, STT_FUNC);
    let rela = b.rela_section(".rela.text", text);
    b.rela(rela, 0, g, R_X86_64_PC32, -4);
    b.rela(rela, 4, l, R_X86_64_PC32, -4);
    let mut elf = b.build();

    let before: Vec<String> = {
        let rs = elf.rela_section_for(text).unwrap();
        elf.sections[rs]
            .relas()
            .unwrap()
            .iter()
            .map(|r| {
                let sym = elf.symtab().unwrap().symbol(r.r_sym()).unwrap();
                elf.sym_name(&sym).unwrap().to_string()
            })
            .collect()
    };
    sort_symtab(&mut elf).unwrap();
    let rs = elf.rela_section_for(text).unwrap();
    let after: Vec<String> = elf.sections[rs]
        .relas()
        .unwrap()
        .iter()
        .map(|r| {
            let sym = elf.symtab().unwrap().symbol(r.r_sym()).unwrap();
            elf.sym_name(&sym).unwrap().to_string()
        })
        .collect();
    assert_eq!(before, after);
    assert_eq!(elf.symtab().unwrap().header.sh_info, 2);
}

/// A static-key bearing function drags the key symbol along, and the
/// surviving jump-table triple is compacted to one 16-byte entry.
#[test]
fn jump_table_is_filtered_and_compacted() {
    let mut b = ObjBuilder::new();
    let mut code = vec![0x90; 0x60];
    code[0x20] = 0x66;
    code[0x21] = 0x90;
    let text = b.section(".text.foo", SHT_PROGBITS, TEXT, code);
    let jt = b.section("__jump_table", SHT_PROGBITS, SHF_ALLOC, vec![0; 32]);
    b.symbol("", text, 0, 0, STB_LOCAL, STT_SECTION);
    b.symbol("foo", text, 0, 0x60, STB_GLOBAL, STT_FUNC);
    let key_data = b.section(".data.once", SHT_PROGBITS, SHF_ALLOC, vec![0; 8]);
    b.symbol("once_key", key_data, 0, 8, STB_GLOBAL, STT_OBJECT);
    let other = b.section(".text.other", SHT_PROGBITS, TEXT, vec![0x66, 0x90, 0xC3]);
    b.symbol("other", other, 0, 3, STB_GLOBAL, STT_FUNC);
    b.rela_section(".rela.text.foo", text);
    let jt_rela = b.rela_section(".rela__jump_table", jt);
    // entry 0: foo's site
    b.rela(jt_rela, 0, 1, R_X86_64_64, 0x20);
    b.rela(jt_rela, 4, 1, R_X86_64_64, 0x40);
    b.rela(jt_rela, 8, 3, R_X86_64_64, 0);
    // entry 1: other's site, dropped since other is not extracted
    b.rela(jt_rela, 16, 4, R_X86_64_64, 0);
    b.rela(jt_rela, 20, 4, R_X86_64_64, 2);
    b.rela(jt_rela, 24, 3, R_X86_64_64, 0);
    let out = extract(b.build(), &["foo"]);

    // the key symbol came along as part of the closure
    assert!(out.find_symbol_by_name("once_key").unwrap().is_some());

    let jt_out = out.section_index_by_name("__jump_table").unwrap();
    assert_eq!(out.sections[jt_out].header.sh_size, 16);
    let rela_out = out.rela_section_for(jt_out).unwrap();
    let relas = out.sections[rela_out].relas().unwrap();
    assert_eq!(relas.len(), 3);
    let offsets: Vec<u64> = relas.iter().map(|r| r.r_offset).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
}
