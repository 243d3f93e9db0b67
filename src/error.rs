//! A custom error and result type used across the crate.
//!
//! Every fallible operation in the library returns [`Result`]; only the
//! command-line driver maps errors onto process exit codes.

use core::fmt;
use core::result;
use std::error;
use std::io;

#[derive(Debug)]
/// A custom kpatchelf error
pub enum Error {
    /// The ELF is malformed somehow: a mandatory section is missing, an index
    /// is out of range, or a size does not agree with `sh_entsize`
    Malformed(String),
    /// The ident bytes do not describe a 64-bit little-endian object
    BadMagic(u64),
    /// An error emitted by scroll while reading or writing raw entries
    Scroll(scroll::Error),
    /// An IO based error
    IO(io::Error),
    /// A symbol (or section) name was not present in the object
    Unresolved(String),
    /// A byte pattern did not match any known shape, e.g. a static-key site
    /// that is neither a nop nor a jump
    Unrecognized(String),
    /// The operation ran to completion but changed nothing
    EmptyResult(String),
    /// The query matched nothing; domain-specific "no result" as opposed to
    /// a broken input
    NotFound(String),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::IO(ref io) => Some(io),
            Error::Scroll(ref scroll) => Some(scroll),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl From<scroll::Error> for Error {
    fn from(err: scroll::Error) -> Error {
        Error::Scroll(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::IO(ref err) => write!(fmt, "{err}"),
            Error::Scroll(ref err) => write!(fmt, "{err}"),
            Error::BadMagic(magic) => write!(fmt, "Invalid magic number: 0x{magic:x}"),
            Error::Malformed(ref msg) => write!(fmt, "Malformed entity: {msg}"),
            Error::Unresolved(ref msg) => write!(fmt, "Can't find symbol: {msg}"),
            Error::Unrecognized(ref msg) => write!(fmt, "Unrecognized: {msg}"),
            Error::EmptyResult(ref msg) => write!(fmt, "{msg}"),
            Error::NotFound(ref msg) => write!(fmt, "No match: {msg}"),
        }
    }
}

/// Result alias with the crate error baked in
pub type Result<T> = result::Result<T, Error>;
