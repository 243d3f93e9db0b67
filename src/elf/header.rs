use scroll::ctx::{self};
use scroll::{Endian, Pread, Pwrite};

use crate::error;

/// No file type.
pub const ET_NONE: u16 = 0;
/// Relocatable file.
pub const ET_REL: u16 = 1;
/// Executable file.
pub const ET_EXEC: u16 = 2;
/// Shared object file.
pub const ET_DYN: u16 = 3;
/// Core file.
pub const ET_CORE: u16 = 4;

/// The ELF magic number.
pub const ELFMAG: &[u8; 4] = b"\x7FELF";

/// File class byte index.
pub const EI_CLASS: usize = 4;
/// Invalid class.
pub const ELFCLASSNONE: u8 = 0;
/// 32-bit objects.
pub const ELFCLASS32: u8 = 1;
/// 64-bit objects.
pub const ELFCLASS64: u8 = 2;

/// Data encoding byte index.
pub const EI_DATA: usize = 5;
/// 2's complement, little endian.
pub const ELFDATA2LSB: u8 = 1;
/// 2's complement, big endian.
pub const ELFDATA2MSB: u8 = 2;

/// File version byte index.
pub const EI_VERSION: usize = 6;
/// Current ELF version.
pub const EV_CURRENT: u8 = 1;

/// AMD x86-64 architecture.
pub const EM_X86_64: u16 = 62;

/// Number of bytes in an identifier.
pub const SIZEOF_IDENT: usize = 16;
/// Size of a 64-bit ELF header in bytes.
pub const SIZEOF_EHDR: usize = 64;
/// Size of a 64-bit section header in bytes.
pub const SIZEOF_SHDR: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq)]
/// A 64-bit ELF header
pub struct Header {
    /// Magic number and other info
    pub e_ident: [u8; SIZEOF_IDENT],
    /// Object file type
    pub e_type: u16,
    /// Architecture
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u64,
    /// Program header table file offset
    pub e_phoff: u64,
    /// Section header table file offset
    pub e_shoff: u64,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size in bytes
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section header string table index
    pub e_shstrndx: u16,
}

impl Header {
    /// A fresh `ET_REL` header for `EM_X86_64`, class 64, little-endian,
    /// current version, with the section name table at index 1.
    pub fn new_rel() -> Header {
        let mut e_ident = [0u8; SIZEOF_IDENT];
        e_ident[..4].copy_from_slice(ELFMAG);
        e_ident[EI_CLASS] = ELFCLASS64;
        e_ident[EI_DATA] = ELFDATA2LSB;
        e_ident[EI_VERSION] = EV_CURRENT;
        Header {
            e_ident,
            e_type: ET_REL,
            e_machine: EM_X86_64,
            e_version: u32::from(EV_CURRENT),
            e_ehsize: SIZEOF_EHDR as u16,
            e_shentsize: SIZEOF_SHDR as u16,
            e_shstrndx: 1,
            ..Default::default()
        }
    }

    /// Reject anything that is not 64-bit little-endian ELF.
    pub fn check_ident(&self) -> error::Result<()> {
        if &self.e_ident[..4] != ELFMAG {
            let magic = u64::from_le_bytes([
                self.e_ident[0],
                self.e_ident[1],
                self.e_ident[2],
                self.e_ident[3],
                0,
                0,
                0,
                0,
            ]);
            return Err(error::Error::BadMagic(magic));
        }
        if self.e_ident[EI_CLASS] != ELFCLASS64 {
            return Err(error::Error::Malformed(format!(
                "unsupported ELF class: {}",
                self.e_ident[EI_CLASS]
            )));
        }
        if self.e_ident[EI_DATA] != ELFDATA2LSB {
            return Err(error::Error::Malformed(format!(
                "unsupported data encoding: {}",
                self.e_ident[EI_DATA]
            )));
        }
        Ok(())
    }
}

impl core::fmt::Debug for Header {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header")
            .field("e_ident", &format_args!("{:02x?}", self.e_ident))
            .field("e_type", &self.e_type)
            .field("e_machine", &format_args!("0x{:x}", self.e_machine))
            .field("e_shoff", &format_args!("0x{:x}", self.e_shoff))
            .field("e_shnum", &self.e_shnum)
            .field("e_shstrndx", &self.e_shstrndx)
            .finish()
    }
}

impl ctx::TryFromCtx<'_, Endian> for Header {
    type Error = scroll::Error;
    fn try_from_ctx(bytes: &[u8], le: Endian) -> Result<(Self, usize), Self::Error> {
        let offset = &mut 0;
        let mut e_ident = [0u8; SIZEOF_IDENT];
        for byte in e_ident.iter_mut() {
            *byte = bytes.gread(offset)?;
        }
        let header = Header {
            e_ident,
            e_type: bytes.gread_with(offset, le)?,
            e_machine: bytes.gread_with(offset, le)?,
            e_version: bytes.gread_with(offset, le)?,
            e_entry: bytes.gread_with(offset, le)?,
            e_phoff: bytes.gread_with(offset, le)?,
            e_shoff: bytes.gread_with(offset, le)?,
            e_flags: bytes.gread_with(offset, le)?,
            e_ehsize: bytes.gread_with(offset, le)?,
            e_phentsize: bytes.gread_with(offset, le)?,
            e_phnum: bytes.gread_with(offset, le)?,
            e_shentsize: bytes.gread_with(offset, le)?,
            e_shnum: bytes.gread_with(offset, le)?,
            e_shstrndx: bytes.gread_with(offset, le)?,
        };
        Ok((header, *offset))
    }
}

impl ctx::TryIntoCtx<Endian> for Header {
    type Error = scroll::Error;
    fn try_into_ctx(self, bytes: &mut [u8], le: Endian) -> Result<usize, Self::Error> {
        let offset = &mut 0;
        for byte in self.e_ident.iter() {
            bytes.gwrite(*byte, offset)?;
        }
        bytes.gwrite_with(self.e_type, offset, le)?;
        bytes.gwrite_with(self.e_machine, offset, le)?;
        bytes.gwrite_with(self.e_version, offset, le)?;
        bytes.gwrite_with(self.e_entry, offset, le)?;
        bytes.gwrite_with(self.e_phoff, offset, le)?;
        bytes.gwrite_with(self.e_shoff, offset, le)?;
        bytes.gwrite_with(self.e_flags, offset, le)?;
        bytes.gwrite_with(self.e_ehsize, offset, le)?;
        bytes.gwrite_with(self.e_phentsize, offset, le)?;
        bytes.gwrite_with(self.e_phnum, offset, le)?;
        bytes.gwrite_with(self.e_shentsize, offset, le)?;
        bytes.gwrite_with(self.e_shnum, offset, le)?;
        bytes.gwrite_with(self.e_shstrndx, offset, le)?;
        Ok(*offset)
    }
}
