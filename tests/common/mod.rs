//! Shared fixture builder: synthetic relocatable objects assembled through
//! the crate's own model.

#![allow(dead_code)]

use kpatchelf::elf::reloc::{Rela, SIZEOF_RELA, r_info};
use kpatchelf::elf::section_header::{SHT_RELA, SectionHeader};
use kpatchelf::elf::sym::{Sym, st_info};
use kpatchelf::elf::{Elf, Section};

pub struct ObjBuilder {
    pub elf: Elf,
}

impl ObjBuilder {
    pub fn new() -> ObjBuilder {
        ObjBuilder {
            elf: Elf::create_rel(),
        }
    }

    pub fn section(&mut self, name: &str, sh_type: u32, sh_flags: u64, data: Vec<u8>) -> usize {
        self.elf
            .push_section(
                name,
                Section {
                    header: SectionHeader {
                        sh_type,
                        sh_flags,
                        sh_addralign: 1,
                        ..Default::default()
                    },
                    data,
                    ..Default::default()
                },
            )
            .unwrap()
    }

    pub fn symbol(
        &mut self,
        name: &str,
        shndx: usize,
        value: u64,
        size: u64,
        bind: u8,
        typ: u8,
    ) -> usize {
        let strtab = self.elf.section_index_by_name(".strtab").unwrap();
        let st_name = if name.is_empty() {
            0
        } else {
            self.elf.sections[strtab].append_str(name) as u32
        };
        let symtab = self.elf.symtab_index().unwrap();
        self.elf.sections[symtab]
            .push_symbol(Sym {
                st_name,
                st_info: st_info(bind, typ),
                st_other: 0,
                st_shndx: shndx as u16,
                st_value: value,
                st_size: size,
            })
            .unwrap()
    }

    pub fn rela_section(&mut self, name: &str, parent: usize) -> usize {
        let symtab = self.elf.symtab_index().unwrap();
        self.elf
            .push_section(
                name,
                Section {
                    header: SectionHeader {
                        sh_type: SHT_RELA,
                        sh_link: symtab as u32,
                        sh_info: parent as u32,
                        sh_entsize: SIZEOF_RELA as u64,
                        sh_addralign: 8,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap()
    }

    pub fn rela(&mut self, section: usize, offset: u64, sym: usize, typ: u32, addend: i64) {
        self.elf.sections[section]
            .push_rela(Rela {
                r_offset: offset,
                r_info: r_info(sym as u64, typ),
                r_addend: addend,
            })
            .unwrap();
    }

    pub fn build(self) -> Elf {
        self.elf
    }
}
