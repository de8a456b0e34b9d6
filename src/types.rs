//! Core type tags, calling conventions, visibilities, condition codes and
//! annotation kinds shared across the IR.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// A scalar machine type.
///
/// `V64` is a tagged 64-bit word whose dynamic value is a garbage-collected
/// OCaml value; the rest are ordinary integer and floating-point widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Type {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    I128 = 4,
    V64 = 5,
    F32 = 6,
    F64 = 7,
    F80 = 8,
    F128 = 9,
}

impl Type {
    /// Size in bytes, for the types with a fixed size independent of the
    /// target's pointer width.
    #[must_use]
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Type::I8 => 1,
            Type::I16 => 2,
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::V64 | Type::F64 => 8,
            Type::I128 | Type::F128 => 16,
            Type::F80 => 10,
        }
    }

    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::I128 | Type::V64
        )
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        !self.is_integer()
    }
}

/// Global visibility, controlling linker symbol resolution (§4.3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Visibility {
    Local = 0,
    GlobalDefault = 1,
    GlobalHidden = 2,
    WeakDefault = 3,
    WeakHidden = 4,
}

impl Visibility {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Visibility::Local)
    }

    #[must_use]
    pub fn is_weak(self) -> bool {
        matches!(self, Visibility::WeakDefault | Visibility::WeakHidden)
    }

    #[must_use]
    pub fn is_hidden(self) -> bool {
        matches!(self, Visibility::GlobalHidden | Visibility::WeakHidden)
    }

    #[must_use]
    pub fn is_exported(self) -> bool {
        !self.is_local() && !self.is_hidden()
    }
}

/// Calling convention tag carried by `Func` and by call-site instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CallingConv {
    C = 0,
    Fast = 1,
    /// OCaml convention: parameter 0 is the exception pointer (`Ptr`),
    /// parameter 1 is the allocation pointer (`Young`).
    Caml = 2,
    CamlAlloc = 3,
    CamlGc = 4,
    Setjmp = 5,
}

impl CallingConv {
    #[must_use]
    pub fn is_caml(self) -> bool {
        matches!(
            self,
            CallingConv::Caml | CallingConv::CamlAlloc | CallingConv::CamlGc
        )
    }
}

bitflags::bitflags! {
    /// Per-parameter flags, analogous to LLVM's parameter attributes. Only
    /// the handful that affect codegen-relevant ABI decisions are modelled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParamFlags: u8 {
        const BYVAL = 0b0000_0001;
        const SEXT  = 0b0000_0010;
        const ZEXT  = 0b0000_0100;
    }
}

/// A typed, flagged function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub ty: Type,
    pub flags: ParamFlags,
}

impl Param {
    #[must_use]
    pub fn new(ty: Type) -> Self {
        Self {
            ty,
            flags: ParamFlags::empty(),
        }
    }
}

/// Integer comparison condition codes used by `Cmp` instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CondCode {
    Eq = 0,
    Ne = 1,
    Lt = 2,
    Le = 3,
    Gt = 4,
    Ge = 5,
    /// Unsigned variants.
    Ult = 6,
    Ule = 7,
    Ugt = 8,
    Uge = 9,
    /// Unordered-or-* floating point comparisons.
    Uo = 10,
    O = 11,
}

impl CondCode {
    #[must_use]
    pub fn negate(self) -> Self {
        use CondCode::*;
        match self {
            Eq => Ne,
            Ne => Eq,
            Lt => Ge,
            Le => Gt,
            Gt => Le,
            Ge => Lt,
            Ult => Uge,
            Ule => Ugt,
            Ugt => Ule,
            Uge => Ult,
            Uo => O,
            O => Uo,
        }
    }
}

/// Constructor/destructor kind for `Xtor` records (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum XtorKind {
    Ctor = 0,
    Dtor = 1,
}

/// Debug-info chain entry referenced from a `CamlFrame` annotation:
/// a source location paired with the file and definition it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub location: u32,
    pub file: String,
    pub definition: String,
}

/// The only two annotation kinds carried by instructions (§3.4).
#[derive(Debug, Clone, PartialEq)]
pub enum Annot {
    /// GC stack-frame descriptor: allocation-site offsets plus a chain of
    /// debug-info entries.
    CamlFrame {
        allocas: Vec<u32>,
        debug_infos: Vec<DebugInfo>,
    },
    /// Branch-weight hint, expressed as a rational `n / d`.
    Probability { n: u32, d: u32 },
}

impl Annot {
    #[must_use]
    pub fn kind_tag(&self) -> u8 {
        match self {
            Annot::CamlFrame { .. } => 0,
            Annot::Probability { .. } => 1,
        }
    }
}

/// A set of annotations attached to an instruction. At most one annotation
/// of each kind is meaningful; the set preserves insertion order since the
/// bitcode writer re-emits annotations in the order they were read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnotSet(Vec<Annot>);

impl AnnotSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, annot: Annot) {
        self.0.push(annot);
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &Annot> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn probability(&self) -> Option<(u32, u32)> {
        self.0.iter().find_map(|a| match a {
            Annot::Probability { n, d } => Some((*n, *d)),
            _ => None,
        })
    }

    #[must_use]
    pub fn caml_frame(&self) -> Option<&Annot> {
        self.0.iter().find(|a| matches!(a, Annot::CamlFrame { .. }))
    }
}
