//! # kpatchelf
//!
//! Object-file surgery for kernel live patching.
//!
//! Given relocatable ELF-64 objects built from kernel source, this crate:
//!
//! - diffs two builds of one translation unit and reports which functions
//!   and variables changed semantically, not textually ([`diff`]);
//! - extracts the transitive closure of changed symbols into a fresh,
//!   self-contained relocatable object whose relocations resolve against
//!   the live kernel image ([`extract`]);
//! - converts a finished module into a kernel livepatch module with
//!   `.klp.sym.*` symbols and `.klp.rela.*` sections ([`livepatch`]);
//! - disassembles x86-64 functions symbolically and promotes hardcoded
//!   near displacements to real relocations ([`disasm`], [`queries`]).
//!
//! Everything operates on the owned object model in [`elf`], single
//! threaded, with the whole input in memory and the output written in one
//! pass.
//!
//! # Example
//!
//! ```no_run
//! use kpatchelf::elf::Elf;
//! use kpatchelf::resolve::Symbols;
//!
//! let elf = Elf::open("kernel/sched/core.o").unwrap();
//! let symbols = Symbols::read(&elf).unwrap();
//! for info in symbols.iter().filter(|s| s.is_fun) {
//!     println!("{}", info.name);
//! }
//! ```

pub mod diff;
pub mod disasm;
pub mod elf;
pub mod error;
pub mod extract;
pub mod livepatch;
pub mod queries;
pub mod resolve;
pub mod strtab;
pub mod symindex;

pub use crate::error::{Error, Result};
