//! Deterministic little-endian bitcode codec (§4.4) and the archive
//! container format that bundles several programs together (§6.2).

mod cursor;
pub mod error;
mod reader;
mod writer;

pub use error::{Error, Result};
pub use reader::read_program;
pub use writer::write_program;

use crate::ir::Program;
use crate::target::Target;

/// Magic number at the start of every single-program bitcode file.
pub const LLIR_MAGIC: u32 = 0x4C49_4C52; // "LILR", little-endian

/// Magic number at the start of every archive.
pub const LLAR_MAGIC: u32 = 0x4C49_4C41; // "LILA", little-endian

/// Wire tags for the generic value-operand encoding shared by the reader
/// and writer.
mod value_tag {
    pub const RESULT: u8 = 0;
    pub const GLOBAL: u8 = 1;
    pub const CONST: u8 = 2;
    pub const EXPR: u8 = 3;
}

#[must_use]
pub fn is_llir_object(buf: &[u8]) -> bool {
    has_magic(buf, LLIR_MAGIC)
}

#[must_use]
pub fn is_llar_archive(buf: &[u8]) -> bool {
    has_magic(buf, LLAR_MAGIC)
}

fn has_magic(buf: &[u8], magic: u32) -> bool {
    buf.len() >= 4 && u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) == magic
}

/// An archive: a named, indexed bundle of programs (§6.2), used by the
/// linker to resolve `-l` style library arguments without unpacking every
/// member up front.
#[derive(Debug, Clone, Default)]
pub struct Archive {
    members: Vec<(String, Vec<u8>)>,
}

impl Archive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&mut self, name: impl Into<String>, encoded_program: Vec<u8>) {
        self.members.push((name.into(), encoded_program));
    }

    #[must_use]
    pub fn members(&self) -> &[(String, Vec<u8>)] {
        &self.members
    }

    /// Decode every member into a `Program`, in archive order.
    pub fn decode_all(&self, target: &Target) -> Result<Vec<Program>> {
        self.members
            .iter()
            .map(|(_, bytes)| read_program(bytes, target.clone()))
            .collect()
    }

    /// Encode per §6.2: magic, `count: u64`, then `count` `(size, offset)`
    /// pairs, then the raw program blobs at those offsets. Member names
    /// are this crate's own addition (the linker reports them in
    /// diagnostics and `unresolved_inputs`); since the wire format has no
    /// room for them, they're written as an extra name table right after
    /// the directory, which a reader of this format (but not a strict
    /// implementation of §6.2 alone) can use to recover them.
    pub fn write(&self) -> Vec<u8> {
        let mut c = cursor::Writer::new();
        c.u32(LLAR_MAGIC);
        c.u64(self.members.len() as u64);

        let header_len = 4 + 8 + self.members.len() * 16;
        let mut offset = header_len as u64;
        let mut directory = Vec::with_capacity(self.members.len());
        for (_, bytes) in &self.members {
            let size = bytes.len() as u64;
            directory.push((size, offset));
            offset += size;
        }
        for (size, off) in &directory {
            c.u64(*size);
            c.u64(*off);
        }
        for (_, bytes) in &self.members {
            c.raw(bytes);
        }
        for (name, _) in &self.members {
            c.string(name);
        }
        c.into_bytes()
    }

    pub fn read(buf: &[u8]) -> Result<Self> {
        let mut c = cursor::Reader::new(buf);
        let magic = c.u32("archive magic")?;
        if magic != LLAR_MAGIC {
            return Err(Error::BadMagic { expected: LLAR_MAGIC, found: magic });
        }
        let count = c.u64("archive member count")? as usize;
        let mut directory = Vec::with_capacity(count);
        for _ in 0..count {
            let size = c.u64("archive member size")?;
            let offset = c.u64("archive member offset")?;
            directory.push((size, offset));
        }

        let mut members = Vec::with_capacity(count);
        for &(size, offset) in &directory {
            c.seek(offset as usize);
            let bytes = c.raw(size as usize, "archive member")?.to_vec();
            members.push((String::new(), bytes));
        }

        // Name table, if present (written by this crate's own `write`).
        // An archive produced by decoding raw §6.2 bytes with no name
        // table simply leaves every member named "".
        for (name, _) in members.iter_mut() {
            if let Ok(n) = c.string("archive member name") {
                *name = n;
            }
        }

        Ok(Self { members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Program;
    use crate::target::Target;

    #[test]
    fn empty_program_roundtrips() {
        let prog = Program::new("empty", Target::default());
        let bytes = write_program(&prog);
        assert!(is_llir_object(&bytes));
        let decoded = read_program(&bytes, Target::default()).unwrap();
        assert_eq!(decoded.name, "empty");
        assert_eq!(decoded.funcs().count(), 0);
    }

    #[test]
    fn single_extern_roundtrips() {
        let mut prog = Program::new("p", Target::default());
        prog.add_extern(crate::ir::Extern {
            name: "malloc".into(),
            visibility: crate::types::Visibility::GlobalDefault,
            alias: None,
            section: None,
        })
        .unwrap();
        let bytes = write_program(&prog);
        let decoded = read_program(&bytes, Target::default()).unwrap();
        assert!(decoded.resolve("malloc").is_some());
    }

    #[test]
    fn archive_roundtrips_program_bytes() {
        let prog = Program::new("m1", Target::default());
        let encoded = write_program(&prog);

        let mut archive = Archive::new();
        archive.add_member("m1.o", encoded.clone());
        let bytes = archive.write();
        assert!(is_llar_archive(&bytes));

        let decoded = Archive::read(&bytes).unwrap();
        assert_eq!(decoded.members().len(), 1);
        assert_eq!(decoded.members()[0].0, "m1.o");
        assert_eq!(decoded.members()[0].1, encoded);
    }

    #[test]
    fn archive_directory_matches_size_offset_layout() {
        // §6.2/§8 scenario 6: magic, count, then (size, offset) pairs.
        let p1 = write_program(&Program::new("p1", Target::default()));
        let p2 = write_program(&Program::new("p2", Target::default()));

        let mut archive = Archive::new();
        archive.add_member("p1.o", p1.clone());
        archive.add_member("p2.o", p2.clone());
        let bytes = archive.write();

        let mut c = cursor::Reader::new(&bytes);
        assert_eq!(c.u32("magic").unwrap(), LLAR_MAGIC);
        assert_eq!(c.u64("count").unwrap(), 2);
        let (size1, offset1) = (c.u64("size1").unwrap(), c.u64("offset1").unwrap());
        let (size2, offset2) = (c.u64("size2").unwrap(), c.u64("offset2").unwrap());
        assert_eq!(size1, p1.len() as u64);
        assert_eq!(size2, p2.len() as u64);
        assert_eq!(&bytes[offset1 as usize..(offset1 + size1) as usize], &p1[..]);
        assert_eq!(&bytes[offset2 as usize..(offset2 + size2) as usize], &p2[..]);
    }

    #[test]
    fn rejects_truncated_magic() {
        let err = read_program(&[0, 1], Target::default()).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }));
    }
}
