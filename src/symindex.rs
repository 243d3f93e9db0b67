//! Symbol rank lookup for the kernel build integration.
//!
//! A symbol name can occur many times in a linked object, once per static
//! of that name across translation units. The build system needs the
//! 1-based rank of the occurrence that belongs to a given source file,
//! where the file is located by byte-searching the archive index for its
//! `.o/` member path.

use memchr::memmem;

use crate::elf::Elf;
use crate::elf::sym::STT_FILE;
use crate::error::{Error, Result};

/// How many times the archive member's bare name appears before the full
/// member path does; this is the 0-based index distinguishing identically
/// named members from different directories.
pub fn find_obj_index(archive: &[u8], src_file: &str) -> Result<usize> {
    let mut obj_path = src_file.to_string();
    obj_path.pop();
    obj_path.push('o');
    obj_path.push('/');
    let base_start = src_file.rfind('/').map(|p| p + 1).unwrap_or(0);
    let obj_name = &obj_path[base_start..];

    let file_pos = memmem::find(archive, obj_path.as_bytes())
        .ok_or_else(|| Error::Unresolved(format!("object path for {src_file} in archive")))?;

    let mut index = 0;
    let mut at = 0;
    loop {
        let Some(rel) = memmem::find(&archive[at..], obj_name.as_bytes()) else {
            return Err(Error::Unresolved(format!(
                "object index for {src_file} in archive"
            )));
        };
        let pos = at + rel;
        if pos + obj_path.len() > file_pos {
            break;
        }
        index += 1;
        at = pos + obj_name.len();
    }
    Ok(index)
}

/// The 1-based rank of the `obj_index`th source-file-owned occurrence of
/// `name` among all same-named symbols of kind `kind`, ordered by address.
///
/// `STT_FILE` markers in the symbol table tell which source file the
/// following symbols came from.
pub fn symbol_rank(
    elf: &Elf,
    src_path: &str,
    name: &str,
    kind: u8,
    obj_index: usize,
) -> Result<u32> {
    let src_file = src_path.rsplit('/').next().unwrap_or(src_path);
    let mut found_file = false;
    let mut chosen: u64 = 0;
    let mut remaining = obj_index as i64;
    let mut addresses = Vec::new();
    for sym in elf.symtab()?.symbols()? {
        let sym_name = elf.sym_name(&sym)?;
        if sym.st_type() == STT_FILE {
            found_file = sym_name == src_file;
        } else if sym.st_type() == kind && sym_name == name {
            if found_file {
                if remaining == 0 {
                    chosen = sym.st_value;
                }
                found_file = false;
                remaining -= 1;
            }
            addresses.push(sym.st_value);
        }
    }
    if addresses.is_empty() {
        return Err(Error::NotFound(format!("symbol {name}")));
    }
    let rank = addresses.iter().filter(|a| **a < chosen).count() as u32;
    Ok(rank + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn obj_index_counts_same_named_members() {
        // an index blob mentioning foo.o/ twice under different dirs
        let archive = b"!<arch>\x0adrivers/a/foo.o/................net/b/foo.o/....";
        assert_eq!(find_obj_index(archive, "net/b/foo.c").unwrap(), 1);
        assert_eq!(find_obj_index(archive, "drivers/a/foo.c").unwrap(), 0);
        assert!(find_obj_index(archive, "net/c/foo.c").is_err());
    }
}
