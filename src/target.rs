//! Target triple handling.
//!
//! The core IR is target-parametric only in pointer width and architecture
//! family; everything else (instruction selection, register allocation,
//! ABI lowering) lives in the external back-ends named in §6.4.

use target_lexicon::{Architecture, PointerWidth, Triple};

/// One of the four architectures this optimizer's back-ends cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
    PowerPc,
    Riscv,
}

/// A resolved compilation target: an architecture plus the pointer width
/// derived from its triple (32 or 64 bits, per §3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    triple: Triple,
    arch: Arch,
}

/// A triple names an architecture this optimizer has no back-end for.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unsupported target architecture: {0}")]
pub struct UnsupportedArch(String);

impl Target {
    /// Parse a target triple string (e.g. `x86_64-unknown-linux-gnu`).
    pub fn parse(triple: &str) -> Result<Self, UnsupportedArch> {
        let triple: Triple = triple
            .parse()
            .map_err(|_| UnsupportedArch(triple.to_string()))?;
        Self::from_triple(triple)
    }

    pub fn from_triple(triple: Triple) -> Result<Self, UnsupportedArch> {
        let arch = match triple.architecture {
            Architecture::X86_64 => Arch::X86_64,
            Architecture::Aarch64(_) => Arch::Aarch64,
            Architecture::Powerpc | Architecture::Powerpc64 | Architecture::Powerpc64le => {
                Arch::PowerPc
            }
            Architecture::Riscv32(_) | Architecture::Riscv64(_) => Arch::Riscv,
            other => return Err(UnsupportedArch(other.to_string())),
        };
        Ok(Self { triple, arch })
    }

    #[must_use]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[must_use]
    pub fn triple(&self) -> &Triple {
        &self.triple
    }

    /// Pointer width in bits: 32 or 64, per §3.1.
    #[must_use]
    pub fn pointer_width_bits(&self) -> u32 {
        match self.triple.pointer_width() {
            Ok(PointerWidth::U16) => 16,
            Ok(PointerWidth::U32) => 32,
            Ok(PointerWidth::U64) => 64,
            Err(_) => match self.arch {
                Arch::X86_64 | Arch::Aarch64 | Arch::Riscv | Arch::PowerPc => 64,
            },
        }
    }
}

impl Default for Target {
    /// `x86_64-unknown-linux-gnu`, matching the optimizer's primary target.
    fn default() -> Self {
        Self::parse("x86_64-unknown-linux-gnu").expect("default triple is always supported")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_architectures() {
        assert_eq!(Target::parse("x86_64-unknown-linux-gnu").unwrap().arch(), Arch::X86_64);
        assert_eq!(Target::parse("aarch64-unknown-linux-gnu").unwrap().arch(), Arch::Aarch64);
        assert_eq!(Target::parse("riscv64gc-unknown-linux-gnu").unwrap().arch(), Arch::Riscv);
        assert_eq!(Target::parse("powerpc64le-unknown-linux-gnu").unwrap().arch(), Arch::PowerPc);
    }

    #[test]
    fn rejects_unsupported_architecture() {
        assert!(Target::parse("wasm32-unknown-unknown").is_err());
    }

    #[test]
    fn default_is_64_bit() {
        assert_eq!(Target::default().pointer_width_bits(), 64);
    }
}
