//! Decode errors (§7: `InvalidBitcode`), matching the taxonomy this
//! crate-family uses for malformed-input errors: specific, matchable
//! variants rather than a single opaque string.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of input while reading {context}")]
    Truncated { context: &'static str },

    #[error("bad magic number: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u32, found: u32 },

    #[error("unknown opcode byte {0:#x}")]
    UnknownOpcode(u8),

    #[error("unknown discriminant {value:#x} while decoding {context}")]
    BadDiscriminant { context: &'static str, value: u32 },

    #[error("index {index} out of range (table has {len} entries) while decoding {context}")]
    BadIndex {
        context: &'static str,
        index: u32,
        len: u32,
    },

    #[error("string is not valid UTF-8 while decoding {context}")]
    BadString { context: &'static str },

    #[error(transparent)]
    Symbol(#[from] crate::ir::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
