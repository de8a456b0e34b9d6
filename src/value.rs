//! The value graph (§4.1): `Value`/`Use`/`User` with use-chains.
//!
//! Rather than the source's intrusive doubly linked lists, every definable
//! value is addressed by a small `Copy` key (an arena index, or a pair of
//! one) and use-chains are kept in a side table keyed by that value — the
//! arena-indexed replacement the design notes (§9) call for.

use std::collections::HashMap;

use crate::constant::{ConstId, ExprId};
use crate::inst::Inst;
use crate::ir::GlobalId;

/// A reference to a value: one return slot of an instruction, a named
/// global (func/extern/atom/block), an interned symbol+offset expression,
/// or an interned constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRef {
    /// The `index`-th return value of `Inst`.
    Result(Inst, u16),
    Global(GlobalId),
    Expr(ExprId),
    Const(ConstId),
}

impl ValueRef {
    #[must_use]
    pub fn as_result(self) -> Option<(Inst, u16)> {
        match self {
            ValueRef::Result(i, s) => Some((i, s)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_global(self) -> Option<GlobalId> {
        match self {
            ValueRef::Global(g) => Some(g),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_block(self) -> Option<crate::ir::BlockId> {
        match self {
            ValueRef::Global(GlobalId::Block(b)) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_func(self) -> Option<crate::ir::FuncId> {
        match self {
            ValueRef::Global(GlobalId::Func(f)) => Some(f),
            _ => None,
        }
    }
}

/// One (user, operand-slot) edge in a value's use-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Use {
    pub user: Inst,
    pub slot: u16,
}

/// Use-chains for every value defined across a program: maps a defined
/// value to the set of `(user, slot)` edges that reference it.
#[derive(Debug, Clone, Default)]
pub struct UseTracker {
    uses: HashMap<ValueRef, Vec<Use>>,
}

impl UseTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_use(&mut self, referent: ValueRef, user: Inst, slot: u16) {
        self.uses.entry(referent).or_default().push(Use { user, slot });
    }

    pub fn remove_use(&mut self, referent: ValueRef, user: Inst, slot: u16) {
        if let Some(list) = self.uses.get_mut(&referent) {
            if let Some(pos) = list.iter().position(|u| u.user == user && u.slot == slot) {
                list.swap_remove(pos);
            }
            if list.is_empty() {
                self.uses.remove(&referent);
            }
        }
    }

    #[must_use]
    pub fn uses_of(&self, referent: ValueRef) -> &[Use] {
        self.uses.get(&referent).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn has_uses(&self, referent: ValueRef) -> bool {
        self.uses.get(&referent).is_some_and(|v| !v.is_empty())
    }

    /// `replace_all_uses_with`: detach every use of `old` and reattach it to
    /// `new`, returning the detached edges so the caller can rewrite each
    /// user's operand storage. The use-chain itself does not own operand
    /// storage (that lives on the instruction), so this alone does not
    /// rewrite operands; callers must also patch `Inst` operand slots, which
    /// `Func::replace_all_uses_with` and `Program::replace_all_uses_with` do.
    pub fn take_uses(&mut self, old: ValueRef) -> Vec<Use> {
        self.uses.remove(&old).unwrap_or_default()
    }

    pub fn retarget(&mut self, new: ValueRef, edges: &[Use]) {
        if !edges.is_empty() {
            self.uses.entry(new).or_default().extend_from_slice(edges);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ExternId, GlobalId};

    fn inst(n: u32) -> Inst {
        cranelift_entity::EntityRef::new(n as usize)
    }

    #[test]
    fn add_remove_roundtrip() {
        let mut t = UseTracker::new();
        let g = ValueRef::Global(GlobalId::Extern(ExternId::from_u32(0)));
        t.add_use(g, inst(1), 0);
        t.add_use(g, inst(2), 1);
        assert_eq!(t.uses_of(g).len(), 2);
        t.remove_use(g, inst(1), 0);
        assert_eq!(t.uses_of(g).len(), 1);
        assert!(t.has_uses(g));
    }

    #[test]
    fn replace_all_uses_with_moves_edges() {
        let mut t = UseTracker::new();
        let old = ValueRef::Global(GlobalId::Extern(ExternId::from_u32(0)));
        let new = ValueRef::Global(GlobalId::Extern(ExternId::from_u32(1)));
        t.add_use(old, inst(1), 0);
        t.add_use(old, inst(2), 0);
        let edges = t.take_uses(old);
        t.retarget(new, &edges);
        assert!(!t.has_uses(old));
        assert_eq!(t.uses_of(new).len(), 2);
    }
}
