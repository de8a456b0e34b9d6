//! The instruction hierarchy (§3.4, §4.2): kind, operand and return-type
//! contracts, and visitor dispatch.

pub mod opcode;

use cranelift_entity::entity_impl;
use smallvec::SmallVec;

pub use opcode::{Category, Opcode};

use crate::ir::BlockId;
use crate::types::{AnnotSet, CallingConv, CondCode, Type};
use crate::value::ValueRef;

/// Arena index of an instruction, unique across the whole `Program` (§9
/// design notes: arena-allocated nodes addressed by integer indices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// Scalar metadata that does not fit the generic operand list: calling
/// convention, condition codes, stack-object indices, and the like.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Cmp {
        cc: CondCode,
    },
    CallSite {
        cc: CallingConv,
        /// `Some(n)` marks the boundary between fixed and variadic
        /// arguments for a var-arg callee.
        fixed_args: Option<u16>,
    },
    Frame {
        index: u16,
        offset: i64,
    },
    Alloca {
        align: u32,
    },
    Arg {
        index: u32,
    },
    /// Raw payload for an architecture-specific instruction this core does
    /// not model structurally; interpreted only by the back-end visitor.
    ArchSpecific {
        mnemonic: String,
    },
}

/// An instruction: an opcode, its parent block, an ordered operand list
/// (each a `Ref<Value>`, §3.4), zero or more return types, and an
/// `AnnotSet`.
///
/// `Phi` is the one opcode whose operand list has structured meaning
/// beyond "flat list of `Ref<Value>`": operands are stored as alternating
/// `(Global(Block), value)` pairs, which [`Self::phi_incoming`] decodes.
/// Every other opcode's operand layout is documented on [`Opcode`].
#[derive(Debug, Clone, PartialEq)]
pub struct InstData {
    pub kind: Opcode,
    pub parent: BlockId,
    pub rets: SmallVec<[Type; 2]>,
    pub operands: SmallVec<[ValueRef; 4]>,
    pub annots: AnnotSet,
    pub payload: Payload,
}

impl InstData {
    #[must_use]
    pub fn new(kind: Opcode, parent: BlockId) -> Self {
        Self {
            kind,
            parent,
            rets: SmallVec::new(),
            operands: SmallVec::new(),
            annots: AnnotSet::new(),
            payload: Payload::None,
        }
    }

    #[must_use]
    pub fn num_returns(&self) -> usize {
        self.rets.len()
    }

    #[must_use]
    pub fn return_type(&self, slot: usize) -> Option<Type> {
        self.rets.get(slot).copied()
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        self.kind.is_terminator()
    }

    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.kind.has_side_effects()
    }

    #[must_use]
    pub fn operand_values(&self) -> &[ValueRef] {
        &self.operands
    }

    pub fn set_operand(&mut self, slot: usize, value: ValueRef) -> ValueRef {
        std::mem::replace(&mut self.operands[slot], value)
    }

    /// Decode `Phi` operands (stored as alternating block/value pairs) into
    /// `(predecessor, incoming value)` pairs. Panics if called on a
    /// non-`Phi` instruction or with a malformed (odd-length) operand list
    /// — the bitcode reader and every builder in this crate maintain the
    /// even-pairing invariant, so this is an internal-invariant check, not
    /// user-facing validation.
    #[must_use]
    pub fn phi_incoming(&self) -> Vec<(BlockId, ValueRef)> {
        assert_eq!(self.kind, Opcode::Phi, "phi_incoming on non-phi instruction");
        assert_eq!(self.operands.len() % 2, 0, "phi operand list must be paired");
        self.operands
            .chunks_exact(2)
            .map(|pair| {
                let block = pair[0].as_block().expect("phi predecessor must be a block");
                (block, pair[1])
            })
            .collect()
    }

    /// Call-site contract (§3.4): operand 0 is the callee, operands
    /// `1..n-k` are arguments, and the final `k` operands are control
    /// successors (`k` = 1 for `Call`, 2 for `Invoke`, 0 for `TailCall`).
    #[must_use]
    pub fn call_callee(&self) -> ValueRef {
        assert!(self.kind.is_call_site());
        self.operands[0]
    }

    #[must_use]
    pub fn call_args(&self) -> &[ValueRef] {
        assert!(self.kind.is_call_site());
        let tail = match self.kind {
            Opcode::Call => 1,
            Opcode::Invoke => 2,
            Opcode::TailCall => 0,
            _ => unreachable!(),
        };
        &self.operands[1..self.operands.len() - tail]
    }

    #[must_use]
    pub fn call_continuation(&self) -> Option<BlockId> {
        match self.kind {
            Opcode::Call | Opcode::Invoke => {
                self.operands[self.operands.len() - if self.kind == Opcode::Invoke { 2 } else { 1 }]
                    .as_block()
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn invoke_landing_pad(&self) -> Option<BlockId> {
        match self.kind {
            Opcode::Invoke => self.operands[self.operands.len() - 1].as_block(),
            _ => None,
        }
    }
}

/// A visitor which receives callbacks while walking the IR (§4.2, §6.4).
/// Every method defaults to the generic `visit_default` hook so a partial
/// visitor (one that only cares about, say, call sites) still compiles —
/// the "default case propagates to a generic `visit(Inst)` hook" the
/// specification describes.
pub trait InstVisitor {
    fn visit_default(&mut self, _inst: &InstData) {}

    fn visit_terminator(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_unary(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_binary(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_memory_load(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_memory_store(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_call_site(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_control(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_phi(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_frame(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
    fn visit_arch_specific(&mut self, inst: &InstData) {
        self.visit_default(inst);
    }
}

/// Dispatch `inst` to the visitor method matching its category.
pub fn dispatch(inst: &InstData, visitor: &mut dyn InstVisitor) {
    match inst.kind.category() {
        Category::Terminator => visitor.visit_terminator(inst),
        Category::Unary => visitor.visit_unary(inst),
        Category::Binary => visitor.visit_binary(inst),
        Category::MemoryLoad => visitor.visit_memory_load(inst),
        Category::MemoryStore => visitor.visit_memory_store(inst),
        Category::CallSite => visitor.visit_call_site(inst),
        Category::Control => visitor.visit_control(inst),
        Category::Phi => visitor.visit_phi(inst),
        Category::Frame => visitor.visit_frame(inst),
        Category::ArchSpecific => visitor.visit_arch_specific(inst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::GlobalId;

    fn bid(n: u32) -> BlockId {
        cranelift_entity::EntityRef::new(n as usize)
    }

    #[test]
    fn phi_incoming_decodes_pairs() {
        let mut inst = InstData::new(Opcode::Phi, bid(0));
        inst.rets.push(Type::I64);
        inst.operands.push(ValueRef::Global(GlobalId::Block(bid(1))));
        inst.operands.push(ValueRef::Result(Inst::from_u32(0), 0));
        inst.operands.push(ValueRef::Global(GlobalId::Block(bid(2))));
        inst.operands.push(ValueRef::Result(Inst::from_u32(1), 0));

        let incoming = inst.phi_incoming();
        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[0].0, bid(1));
        assert_eq!(incoming[1].0, bid(2));
    }

    #[test]
    fn call_site_splits_args_and_continuation() {
        let mut call = InstData::new(Opcode::Call, bid(0));
        call.payload = Payload::CallSite {
            cc: CallingConv::C,
            fixed_args: None,
        };
        call.operands.push(ValueRef::Global(GlobalId::Func(cranelift_entity::EntityRef::new(0))));
        call.operands.push(ValueRef::Result(Inst::from_u32(3), 0));
        call.operands.push(ValueRef::Global(GlobalId::Block(bid(5))));
        assert_eq!(call.call_args().len(), 1);
        assert_eq!(call.call_continuation(), Some(bid(5)));
    }
}
