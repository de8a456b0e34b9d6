//! Instruction opcodes (§3.4, §4.2) and the capability categories the
//! visitor dispatches on. This crate implements a representative,
//! fully-functional subset of each category named in the specification
//! rather than a mechanical enumeration of every historical
//! architecture-specific variant — see `DESIGN.md` for the full mapping.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The capability set an opcode belongs to, used for visitor dispatch
/// (§4.2: "Polymorphic over the capability sets `{Unary, Binary,
/// MemoryLoad, MemoryStore, CallSite, BitCountInst, ...}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Terminator,
    Unary,
    Binary,
    MemoryLoad,
    MemoryStore,
    CallSite,
    Control,
    Phi,
    Frame,
    ArchSpecific,
}

/// Every opcode this IR supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // --- terminators ---
    Jump = 0,
    JumpCond = 1,
    Switch = 2,
    Return = 3,
    Trap = 4,
    Raise = 5,
    Call = 6,
    TailCall = 7,
    Invoke = 8,

    // --- unary ---
    Neg = 20,
    BitNot = 21,
    Abs = 22,
    SExt = 23,
    ZExt = 24,
    FExt = 25,
    Trunc = 26,
    BitCast = 27,
    ByteSwap = 28,
    Clz = 29,
    Ctz = 30,
    Popcnt = 31,

    // --- binary ---
    Add = 40,
    Sub = 41,
    And = 42,
    Or = 43,
    Xor = 44,
    Shl = 45,
    Shr = 46,
    AShr = 47,
    Mul = 48,
    UDiv = 49,
    SDiv = 50,
    URem = 51,
    SRem = 52,
    Cmp = 53,

    // --- memory ---
    Load = 60,
    Store = 61,

    // --- control / misc ---
    Phi = 70,
    Select = 71,
    Mov = 72,
    Arg = 73,
    Undef = 74,
    Frame = 75,
    Alloca = 76,
    VaStart = 77,

    // --- escape hatch for machine-specific instructions this core
    // doesn't model structurally; the back-end interprets the payload. ---
    ArchSpecific = 90,
}

impl Opcode {
    #[must_use]
    pub fn category(self) -> Category {
        use Opcode::*;
        match self {
            Jump | JumpCond | Switch | Return | Trap | Raise | TailCall | Invoke => {
                Category::Terminator
            }
            Call => Category::CallSite,
            Neg | BitNot | Abs | SExt | ZExt | FExt | Trunc | BitCast | ByteSwap | Clz | Ctz
            | Popcnt => Category::Unary,
            Add | Sub | And | Or | Xor | Shl | Shr | AShr | Mul | UDiv | SDiv | URem | SRem
            | Cmp => Category::Binary,
            Load => Category::MemoryLoad,
            Store => Category::MemoryStore,
            Phi => Category::Phi,
            Select | Mov | Arg | Undef | VaStart => Category::Control,
            Frame | Alloca => Category::Frame,
            ArchSpecific => Category::ArchSpecific,
        }
    }

    /// True for `CallSite` opcodes that are also terminators (`TailCall`,
    /// `Invoke`) in addition to the structural-terminator category above.
    #[must_use]
    pub fn is_terminator(self) -> bool {
        matches!(self.category(), Category::Terminator)
            || matches!(self, Opcode::TailCall | Opcode::Invoke)
    }

    #[must_use]
    pub fn is_call_site(self) -> bool {
        matches!(self, Opcode::Call | Opcode::TailCall | Opcode::Invoke)
    }

    /// Whether evaluating this instruction can be observed other than
    /// through its return value (memory effects, control transfer, calls).
    #[must_use]
    pub fn has_side_effects(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Store | Call | TailCall | Invoke | Trap | Raise | VaStart | Alloca
        ) || self.is_terminator()
    }
}
