//! The owned, mutable model of a relocatable ELF-64 object.
//!
//! An [`Elf`] is a header plus an ordered list of [`Section`]s, each owning
//! its payload bytes. Symbol tables, relocation sections and string tables
//! are read and written through typed accessors on `Section`; growing a
//! section reallocates the payload and updates `sh_size` as one operation,
//! so a section never silently truncates.
//!
//! Only 64-bit little-endian `EM_X86_64` objects are modelled. Anything
//! else is rejected up front; a missing `.symtab` or `.strtab` is fatal on
//! open, since no downstream pass can do anything useful without them.

pub mod header;
pub mod reloc;
pub mod section_header;
pub mod sym;

pub use header::Header;
pub use reloc::Rela;
pub use section_header::SectionHeader;
pub use sym::Sym;

use scroll::{LE, Pread, Pwrite};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::strtab;

use header::{SIZEOF_EHDR, SIZEOF_SHDR};
use reloc::SIZEOF_RELA;
use section_header::{SHT_NOBITS, SHT_NULL, SHT_RELA, SHT_STRTAB, SHT_SYMTAB};
use sym::SIZEOF_SYM;

/// A section: its resolved name, its header, and its owned payload.
///
/// For `SHT_NOBITS` sections the payload is empty and `sh_size` is the only
/// record of the section's extent; for everything else the two agree.
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub name: String,
    pub header: SectionHeader,
    pub data: Vec<u8>,
}

impl Section {
    /// Number of `sh_entsize`-sized entries in this section.
    pub fn entry_count(&self) -> usize {
        self.header.entry_count()
    }

    fn sync_size(&mut self) {
        self.header.sh_size = self.data.len() as u64;
    }

    /// Read the symbol at `index`.
    pub fn symbol(&self, index: usize) -> Result<Sym> {
        Ok(self.data.pread_with(index * SIZEOF_SYM, LE)?)
    }

    /// Overwrite the symbol at `index`.
    pub fn set_symbol(&mut self, index: usize, sym: Sym) -> Result<()> {
        self.data.pwrite_with(sym, index * SIZEOF_SYM, LE)?;
        Ok(())
    }

    /// Append a symbol, growing the payload, and return its index.
    pub fn push_symbol(&mut self, sym: Sym) -> Result<usize> {
        let index = self.data.len() / SIZEOF_SYM;
        self.data.resize(self.data.len() + SIZEOF_SYM, 0);
        self.data.pwrite_with(sym, index * SIZEOF_SYM, LE)?;
        self.sync_size();
        Ok(index)
    }

    /// Every symbol in the section, in storage order.
    pub fn symbols(&self) -> Result<Vec<Sym>> {
        let count = self.data.len() / SIZEOF_SYM;
        let mut syms = Vec::with_capacity(count);
        for i in 0..count {
            syms.push(self.symbol(i)?);
        }
        Ok(syms)
    }

    /// Read the relocation at `index`.
    pub fn rela(&self, index: usize) -> Result<Rela> {
        Ok(self.data.pread_with(index * SIZEOF_RELA, LE)?)
    }

    /// Overwrite the relocation at `index`.
    pub fn set_rela(&mut self, index: usize, rela: Rela) -> Result<()> {
        self.data.pwrite_with(rela, index * SIZEOF_RELA, LE)?;
        Ok(())
    }

    /// Append a relocation, growing the payload, and return its index.
    pub fn push_rela(&mut self, rela: Rela) -> Result<usize> {
        let index = self.data.len() / SIZEOF_RELA;
        self.data.resize(self.data.len() + SIZEOF_RELA, 0);
        self.data.pwrite_with(rela, index * SIZEOF_RELA, LE)?;
        self.sync_size();
        Ok(index)
    }

    /// Every relocation in the section, in storage order.
    pub fn relas(&self) -> Result<Vec<Rela>> {
        let count = self.data.len() / SIZEOF_RELA;
        let mut relas = Vec::with_capacity(count);
        for i in 0..count {
            relas.push(self.rela(i)?);
        }
        Ok(relas)
    }

    /// Append a nul-terminated string to a string-table section; the
    /// returned offset is the pre-append size.
    pub fn append_str(&mut self, text: &str) -> u64 {
        let offset = strtab::append(&mut self.data, text);
        self.sync_size();
        offset
    }

    /// The nul-terminated string at `offset` of this section's payload.
    pub fn str_at(&self, offset: usize) -> Result<&str> {
        strtab::get(&self.data, offset)
    }
}

/// An owned ELF object.
#[derive(Debug, Clone)]
pub struct Elf {
    pub header: Header,
    pub sections: Vec<Section>,
}

impl Elf {
    /// Parse an object out of raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Elf> {
        let ehdr: Header = bytes.pread_with(0, LE)?;
        ehdr.check_ident()?;
        let shoff = ehdr.e_shoff as usize;
        let shnum = ehdr.e_shnum as usize;
        let shstrndx = ehdr.e_shstrndx as usize;
        if shnum > 0 && shstrndx >= shnum {
            return Err(Error::Malformed(format!(
                "e_shstrndx {shstrndx} is out of range ({shnum} sections)"
            )));
        }
        let mut sections = Vec::with_capacity(shnum);
        for i in 0..shnum {
            let shdr: SectionHeader = bytes.pread_with(shoff + i * SIZEOF_SHDR, LE)?;
            let data = if shdr.sh_type == SHT_NOBITS || shdr.sh_type == SHT_NULL {
                Vec::new()
            } else {
                let start = shdr.sh_offset as usize;
                let end = start
                    .checked_add(shdr.sh_size as usize)
                    .ok_or_else(|| Error::Malformed(format!("section {i} size overflows")))?;
                bytes
                    .get(start..end)
                    .ok_or_else(|| {
                        Error::Malformed(format!(
                            "section {i} payload [0x{start:x}..0x{end:x}] is out of bounds"
                        ))
                    })?
                    .to_vec()
            };
            sections.push(Section {
                name: String::new(),
                header: shdr,
                data,
            });
        }
        let mut names = Vec::with_capacity(shnum);
        for section in &sections {
            let name_off = section.header.sh_name as usize;
            names.push(strtab::get(&sections[shstrndx].data, name_off)?.to_string());
        }
        for (section, name) in sections.iter_mut().zip(names) {
            section.name = name;
        }
        Ok(Elf {
            header: ehdr,
            sections,
        })
    }

    /// Load an object from disk and verify it carries the mandatory
    /// `.symtab` and `.strtab` sections.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Elf> {
        let bytes = fs::read(path.as_ref())?;
        let elf = Elf::parse(&bytes)?;
        if elf.section_index_by_name(".strtab").is_none() {
            return Err(Error::Malformed("Failed to find .strtab section".into()));
        }
        if elf.section_index_by_name(".symtab").is_none() {
            return Err(Error::Malformed("Failed to find .symtab section".into()));
        }
        Ok(elf)
    }

    /// A fresh relocatable object: the null section, `.shstrtab` at index 1
    /// (as `e_shstrndx` advertises), an empty `.strtab` and a `.symtab`
    /// holding the single null entry.
    pub fn create_rel() -> Elf {
        let mut shstr = strtab::new_table();
        let strtab_name = strtab::append(&mut shstr, ".strtab");
        let symtab_name = strtab::append(&mut shstr, ".symtab");
        let shstrtab_name = strtab::append(&mut shstr, ".shstrtab");

        let shstrtab = Section {
            name: ".shstrtab".into(),
            header: SectionHeader {
                sh_name: shstrtab_name as u32,
                sh_type: SHT_STRTAB,
                sh_size: shstr.len() as u64,
                sh_addralign: 1,
                ..Default::default()
            },
            data: shstr,
        };
        let strtab = Section {
            name: ".strtab".into(),
            header: SectionHeader {
                sh_name: strtab_name as u32,
                sh_type: SHT_STRTAB,
                sh_size: 1,
                sh_addralign: 1,
                ..Default::default()
            },
            data: strtab::new_table(),
        };
        let symtab = Section {
            name: ".symtab".into(),
            header: SectionHeader {
                sh_name: symtab_name as u32,
                sh_type: SHT_SYMTAB,
                sh_size: SIZEOF_SYM as u64,
                sh_link: 2,
                sh_entsize: SIZEOF_SYM as u64,
                sh_addralign: 8,
                ..Default::default()
            },
            data: vec![0; SIZEOF_SYM],
        };
        Elf {
            header: Header::new_rel(),
            sections: vec![Section::default(), shstrtab, strtab, symtab],
        }
    }

    /// Index of the first section with the given name.
    pub fn section_index_by_name(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    /// The first section with the given name.
    pub fn section_by_name(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Index of the `SHT_RELA` section whose `sh_info` names `index`.
    pub fn rela_section_for(&self, index: usize) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.header.sh_type == SHT_RELA && s.header.sh_info as usize == index)
    }

    /// Append a new section, naming it through `.shstrtab`, and return its
    /// index.
    pub fn push_section(&mut self, name: &str, mut section: Section) -> Result<usize> {
        let shstrndx = self.header.e_shstrndx as usize;
        let name_off = self
            .sections
            .get_mut(shstrndx)
            .ok_or_else(|| Error::Malformed("no section name table".into()))?
            .append_str(name);
        section.header.sh_name = name_off as u32;
        section.name = name.to_string();
        self.sections.push(section);
        Ok(self.sections.len() - 1)
    }

    /// Index of `.symtab`.
    pub fn symtab_index(&self) -> Result<usize> {
        self.section_index_by_name(".symtab")
            .ok_or_else(|| Error::Malformed("Failed to find .symtab section".into()))
    }

    /// The `.symtab` section.
    pub fn symtab(&self) -> Result<&Section> {
        Ok(&self.sections[self.symtab_index()?])
    }

    /// The `.symtab` section, mutably.
    pub fn symtab_mut(&mut self) -> Result<&mut Section> {
        let index = self.symtab_index()?;
        Ok(&mut self.sections[index])
    }

    /// A symbol's name, resolved through the string table `.symtab` links.
    pub fn sym_name(&self, sym: &Sym) -> Result<&str> {
        let symtab = self.symtab()?;
        let link = symtab.header.sh_link as usize;
        let strtab = self
            .sections
            .get(link)
            .ok_or_else(|| Error::Malformed(format!("symtab links to bad section {link}")))?;
        strtab.str_at(sym.st_name as usize)
    }

    /// The name of the section a symbol is defined in, or `""` when the
    /// section index is reserved or out of range.
    pub fn section_name_of(&self, sym: &Sym) -> &str {
        self.sections
            .get(sym.st_shndx as usize)
            .map(|s| s.name.as_str())
            .unwrap_or("")
    }

    /// The first symbol (from entry 1 on) with the given name.
    pub fn find_symbol_by_name(&self, name: &str) -> Result<Option<(usize, Sym)>> {
        let symtab = self.symtab()?;
        for (i, sym) in symtab.symbols()?.into_iter().enumerate().skip(1) {
            if self.sym_name(&sym)? == name {
                return Ok(Some((i, sym)));
            }
        }
        Ok(None)
    }

    /// The first local or global symbol of type `stt` with the given name.
    pub fn find_symbol_by_name_type(&self, name: &str, stt: u8) -> Result<Option<(usize, Sym)>> {
        let symtab = self.symtab()?;
        for (i, s) in symtab.symbols()?.into_iter().enumerate() {
            if (s.st_info == sym::st_info(sym::STB_LOCAL, stt)
                || s.st_info == sym::st_info(sym::STB_GLOBAL, stt))
                && self.sym_name(&s)? == name
            {
                return Ok(Some((i, s)));
            }
        }
        Ok(None)
    }

    /// The first named symbol of section `shndx` whose value is exactly
    /// `offset`.
    pub fn find_symbol_starting_at(&self, shndx: u16, offset: u64) -> Result<Option<(usize, Sym)>> {
        let symtab = self.symtab()?;
        for (i, s) in symtab.symbols()?.into_iter().enumerate() {
            if s.st_name != 0 && s.st_shndx == shndx && s.st_value == offset {
                return Ok(Some((i, s)));
            }
        }
        Ok(None)
    }

    /// The first named symbol of section `shndx` whose `[value, value+size)`
    /// interval covers `offset`.
    pub fn find_symbol_covering(&self, shndx: u16, offset: u64) -> Result<Option<(usize, Sym)>> {
        let symtab = self.symtab()?;
        for (i, s) in symtab.symbols()?.into_iter().enumerate() {
            if s.st_name != 0
                && s.st_shndx == shndx
                && offset >= s.st_value
                && offset < s.st_value.saturating_add(s.st_size)
            {
                return Ok(Some((i, s)));
            }
        }
        Ok(None)
    }

    /// Serialize the whole object: header, payloads, then the section
    /// header table.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let shnum = self.sections.len();
        let mut offset = SIZEOF_EHDR;
        let mut offsets = vec![0usize; shnum];
        for (i, s) in self.sections.iter().enumerate().skip(1) {
            let align = match s.header.sh_type {
                SHT_SYMTAB | SHT_RELA => 8,
                _ => s.header.sh_addralign.max(1) as usize,
            };
            offset = offset.div_ceil(align) * align;
            offsets[i] = offset;
            if s.header.sh_type != SHT_NOBITS {
                offset += s.data.len();
            }
        }
        let shoff = offset.div_ceil(8) * 8;

        let mut ehdr = self.header;
        ehdr.e_shoff = shoff as u64;
        ehdr.e_shnum = shnum as u16;
        ehdr.e_shentsize = SIZEOF_SHDR as u16;
        ehdr.e_ehsize = SIZEOF_EHDR as u16;

        let mut buf = vec![0u8; shoff + shnum * SIZEOF_SHDR];
        buf.pwrite_with(ehdr, 0, LE)?;
        for (i, s) in self.sections.iter().enumerate().skip(1) {
            if s.header.sh_type != SHT_NOBITS {
                buf[offsets[i]..offsets[i] + s.data.len()].copy_from_slice(&s.data);
            }
        }
        for (i, s) in self.sections.iter().enumerate() {
            let mut shdr = s.header;
            shdr.sh_offset = offsets[i] as u64;
            if i != 0 && shdr.sh_type != SHT_NOBITS {
                shdr.sh_size = s.data.len() as u64;
            }
            buf.pwrite_with(shdr, shoff + i * SIZEOF_SHDR, LE)?;
        }
        Ok(buf)
    }

    /// Write the object out in one pass.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        fs::write(path.as_ref(), bytes)?;
        Ok(())
    }
}
