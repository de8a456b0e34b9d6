//! Type-and-tag abstract-interpretation analysis (§4.6): a forward fixed
//! point over a lattice of machine-level tags (unknown, integer with
//! known-bit mask, OCaml heap/young/value pointers, raw and stack
//! addresses, undef), plus the backward refinement pass §4.6.3 describes
//! by the three examples it gives: `jcc(and x,1)` narrows `x` to odd on
//! the taken edge, a successful `cmp.eq x,y` narrows both operands to
//! their meet on the taken edge, and a store `*p = v` with `v : Val`
//! narrows `p` to `Ptr`.
//!
//! Each of the first two is recorded as a (split-point block, refined
//! type) pair in [`Engine::refinements`] rather than as a rewrite of the
//! value's own global type — the same value is used unrefined outside the
//! dominated region, so only [`Engine::refined_value_of`]'s callers (which
//! already know their own block) ever observe the narrower type. The
//! refinement round alternates recomputing these pairs from the current
//! type assignment with re-stepping every instruction so a refined
//! premise can sharpen a downstream result, until a round changes
//! nothing (bounded by instruction count, same backstop as the forward
//! pass).
//!
//! The lattice's "key relations" in §4.6.1 are explicitly a summary, not
//! a complete partial order — the full table lives only in the original
//! `tags.cpp`'s `operator<`, which this distillation doesn't carry. This
//! module models the relations spec.md actually lists and falls back to
//! a documented, conservative join (see [`join`]) for any pair outside
//! them; see `DESIGN.md` for the resulting scope decision.

use std::collections::{HashMap, HashSet, VecDeque};

use log::debug;

use crate::cfg::{ControlFlowGraph, Dominators};
use crate::constant::Constant;
use crate::inst::{Inst, InstData, Opcode, Payload};
use crate::ir::{BlockId, FuncId, GlobalId, Program};
use crate::types::{CondCode, Type};
use crate::value::ValueRef;

/// Errors raised by [`analyze`] (§7: `ConvergenceError`).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("type analysis did not converge: {0}")]
    NotMonotonic(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-bit knowledge about an integer value (§4.6.2): `known` marks which
/// bits are pinned, `value` holds their pinned bits. Bits outside `known`
/// in `value` are always zero — every constructor and operation maintains
/// that invariant so two `MaskedType`s with the same meaning compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskedType {
    value: u64,
    known: u64,
}

impl MaskedType {
    #[must_use]
    pub fn new(value: u64, known: u64) -> Self {
        Self { value: value & known, known }
    }

    #[must_use]
    pub fn exact(value: u64) -> Self {
        Self { value, known: u64::MAX }
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self { value: 0, known: 0 }
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.value
    }

    #[must_use]
    pub fn known(self) -> u64 {
        self.known
    }

    /// §4.6.2: an int "clears the page" when at least one of the upper 52
    /// bits (i.e. above a 4KiB page boundary, assuming a 64-bit word) is
    /// known to be zero — the property a mask needs for the analysis to
    /// conclude the masked result can no longer reach into heap territory.
    #[must_use]
    pub fn clears_page(self) -> bool {
        const PAGE_BITS: u64 = 0xFFFF_FFFF_FFFF_F000; // bits 12..64
        self.known & PAGE_BITS & !self.value != 0
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        let value = self.value.wrapping_add(other.value);
        let first_unknown = (!self.known | !other.known).trailing_zeros();
        Self::new(value, low_bits(first_unknown))
    }

    #[must_use]
    pub fn not(self) -> Self {
        Self::new(!self.value, self.known)
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        self.add(other.not().add(Self::exact(1)))
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let known_zero = (self.known & !self.value) | (other.known & !other.value);
        let known_one = self.known & self.value & other.known & other.value;
        Self::new(known_one, known_zero | known_one)
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        let known_one = (self.known & self.value) | (other.known & other.value);
        let known_zero = self.known & !self.value & other.known & !other.value;
        Self::new(known_one, known_one | known_zero)
    }

    #[must_use]
    pub fn xor(self, other: Self) -> Self {
        let known = self.known & other.known;
        Self::new(self.value ^ other.value, known)
    }

    /// Join of two `Int`s (§4.6.1): the known bits on which they agree,
    /// with disagreeing or either-side-unknown bits demoted to unknown.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        let agree = !(self.value ^ other.value);
        let known = self.known & other.known & agree;
        Self::new(self.value, known)
    }

    /// `self <= other` per §4.6.1: `other`'s known bits are a subset of
    /// `self`'s, and they agree on the bits `other` claims to know.
    #[must_use]
    pub fn is_le(self, other: Self) -> bool {
        let shared = self.known & other.known;
        (other.known & !self.known) == 0 && (self.value & shared) == (other.value & shared)
    }
}

fn low_bits(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// A lattice type assigned to an instruction value (§4.6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaggedType {
    /// Bottom: nothing has been computed for this value yet.
    Unknown,
    /// A value no instruction on this path actually produces (e.g. the
    /// argument side of a dead phi edge).
    Undef,
    Int(MaskedType),
    /// An OCaml-tagged value: either an odd-tagged immediate or a heap
    /// pointer, not yet known which.
    Val,
    /// A pointer into the managed heap (major or minor).
    Heap,
    /// A pointer into the minor (young) heap generation.
    Young,
    /// A heap pointer offset from its header, mid-traversal.
    HeapOff,
    /// A plain, non-tagged pointer.
    Ptr,
    /// A value that is either a plain pointer or a plain integer.
    PtrInt,
    /// A plain pointer, or null.
    PtrNull,
    /// A raw address (stack slot, static symbol) distinct from the
    /// managed heap.
    Addr,
    AddrInt,
    AddrNull,
}

/// Direct (non-transitive) supertypes of `t` in the partial order §4.6.1
/// describes. Anything not listed here (`Val`, `HeapOff`, `PtrNull`,
/// `AddrNull`, `Int`) has no modelled supertype beyond itself.
fn direct_supers(t: TaggedType) -> &'static [TaggedType] {
    use TaggedType::{AddrInt, Heap, HeapOff, Ptr, PtrInt, PtrNull, Val, Young};
    match t {
        Young => &[Heap, Val, Ptr, PtrInt],
        Heap => &[Val, HeapOff, Ptr, PtrNull, PtrInt, TaggedType::Addr, TaggedType::AddrNull, AddrInt],
        TaggedType::Addr => &[Ptr, PtrInt, AddrInt],
        Ptr => &[PtrInt, PtrNull],
        _ => &[],
    }
}

/// `a <= b` in the lattice (§4.6.1).
#[must_use]
pub fn is_le(a: TaggedType, b: TaggedType) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (TaggedType::Unknown, _) => true,
        (_, TaggedType::Unknown) => false,
        (TaggedType::Undef, _) => true,
        (TaggedType::Int(m1), TaggedType::Int(m2)) => m1.is_le(m2),
        (TaggedType::Int(_), _) | (_, TaggedType::Int(_)) => false,
        _ => {
            let mut seen = HashSet::new();
            let mut stack = vec![a];
            while let Some(cur) = stack.pop() {
                if !seen.insert(cur) {
                    continue;
                }
                if cur == b {
                    return true;
                }
                stack.extend(direct_supers(cur));
            }
            false
        }
    }
}

/// Least upper bound of `a` and `b`.
///
/// For the pair types §4.6.1 actually relates, this is the graph's join.
/// For two pointer-family types with no modelled relation (the lattice's
/// "key relations" are a stated summary, not the full table) this falls
/// back to `PtrInt`, the most general tag both the heap and the address
/// families are defined to flow into — a conservative choice recorded as
/// an open decision in `DESIGN.md` rather than a faithfully-transcribed
/// rule, since the full partial order isn't available in this pack.
#[must_use]
pub fn join(a: TaggedType, b: TaggedType) -> TaggedType {
    use TaggedType::{PtrInt, Undef, Unknown};
    if a == b {
        return a;
    }
    match (a, b) {
        (Unknown, x) | (x, Unknown) => x,
        (Undef, x) | (x, Undef) => x,
        (TaggedType::Int(m1), TaggedType::Int(m2)) => TaggedType::Int(m1.join(m2)),
        (TaggedType::Int(_), _) | (_, TaggedType::Int(_)) => PtrInt,
        _ if is_le(a, b) => b,
        _ if is_le(b, a) => a,
        _ => PtrInt,
    }
}

/// A value of declared machine type `v64` is clamped to `Val` or below on
/// every update (§4.6.1's "cast to `Val` at each assignment").
fn clamp_to_decl(ty: TaggedType, decl: Option<Type>) -> TaggedType {
    if decl == Some(Type::V64) && !is_le(ty, TaggedType::Val) {
        TaggedType::Val
    } else {
        ty
    }
}

fn default_for_type(ty: Option<Type>) -> TaggedType {
    match ty {
        Some(Type::V64) => TaggedType::Val,
        Some(t) if t.is_integer() => TaggedType::Int(MaskedType::unknown()),
        _ => TaggedType::Unknown,
    }
}

/// §4.6.4's table, plus the conservative `join` fallback for every
/// combination the table doesn't single out.
fn arithmetic_rule(op: Opcode, a: TaggedType, b: TaggedType) -> TaggedType {
    use TaggedType::{Addr, Heap, Int, Ptr, PtrInt, Unknown, Val, Young};

    if a == Unknown || b == Unknown {
        return Unknown;
    }

    match (op, a, b) {
        (Opcode::Add, Int(m1), Int(m2)) => Int(m1.add(m2)),
        (Opcode::Add, Val, Int(_)) | (Opcode::Add, Int(_), Val) => PtrInt,
        (Opcode::Add, Young, _) | (Opcode::Add, _, Young) => Heap,
        (Opcode::Add, Heap, Int(_)) | (Opcode::Add, Int(_), Heap) => Ptr,
        (Opcode::Add, Ptr, Int(_)) | (Opcode::Add, Int(_), Ptr) => Ptr,
        (Opcode::Add, PtrInt, _) | (Opcode::Add, _, PtrInt) => PtrInt,
        (Opcode::Add, Addr, Int(_)) | (Opcode::Add, Int(_), Addr) => Addr,

        (Opcode::Sub, Int(m1), Int(m2)) => Int(m1.sub(m2)),
        (Opcode::Sub, Val, Val) => PtrInt,
        (Opcode::Sub, Ptr, Ptr) => Int(MaskedType::unknown()),
        (Opcode::Sub, Ptr, Int(_)) => Ptr,
        (Opcode::Sub, Addr, Addr) => Int(MaskedType::unknown()),
        (Opcode::Sub, Addr, Int(_)) => Addr,

        (Opcode::And, Int(m1), Int(m2)) => Int(m1.and(m2)),
        (Opcode::And, Int(m), Val) | (Opcode::And, Val, Int(m)) => {
            if m.clears_page() {
                Int(m)
            } else {
                PtrInt
            }
        }
        (Opcode::And, Int(m), PtrInt) | (Opcode::And, PtrInt, Int(m)) => {
            if m.clears_page() {
                Int(m)
            } else {
                PtrInt
            }
        }

        (Opcode::Or, Int(m1), Int(m2)) => Int(m1.or(m2)),
        (Opcode::Or, Heap, Int(m)) | (Opcode::Or, Int(m), Heap) if m.clears_page() => PtrInt,

        (Opcode::Xor, Int(m1), Int(m2)) => Int(m1.xor(m2)),
        (Opcode::Xor, PtrInt, Int(m)) | (Opcode::Xor, Int(m), PtrInt) if m == MaskedType::exact(0) => PtrInt,

        // §4.6.2 defines no shift operation on `MaskedType`; any shift of
        // a pointer-family tag by a runtime amount demotes it to a fully
        // unknown integer rather than guessing at the resulting bits.
        (Opcode::Shl | Opcode::Shr | Opcode::AShr, _, Int(_)) => Int(MaskedType::unknown()),

        _ => join(a, b),
    }
}

fn ext_trunc_rule(op: Opcode, a: TaggedType, out_ty: Option<Type>, ptr_width_bits: u32) -> TaggedType {
    match op {
        Opcode::SExt | Opcode::ZExt | Opcode::FExt | Opcode::BitCast => a,
        Opcode::ByteSwap => match a {
            TaggedType::Int(_) => TaggedType::Int(MaskedType::unknown()),
            other => other,
        },
        Opcode::Trunc => {
            let out_bits = out_ty.map_or(ptr_width_bits, |t| t.size_in_bytes() * 8);
            if out_bits >= ptr_width_bits {
                return a;
            }
            match a {
                TaggedType::Int(m) => TaggedType::Int(MaskedType::new(m.value(), m.known() & low_bits(out_bits))),
                // Truncating a pointer-kind value below pointer width
                // (§4.6.3's "truncation to less than pointer width clamps
                // pointer-kind inputs to Int") loses the pointer tag.
                _ => TaggedType::Int(MaskedType::unknown()),
            }
        }
        _ => a,
    }
}

struct Engine<'a> {
    prog: &'a Program,
    values: HashMap<(Inst, u16), TaggedType>,
    returns: HashMap<FuncId, Vec<TaggedType>>,
    queue: VecDeque<Inst>,
    phi_queue: VecDeque<Inst>,
    queued: HashSet<Inst>,
    /// Per-function dominator tree, used only by the backward-refinement
    /// round (§4.6.3) to decide whether a branch-narrowed type applies at
    /// a given use site.
    doms: HashMap<FuncId, Dominators>,
    /// `(defining inst, slot) -> [(split-point block, refined type)]`: a
    /// value's type as narrowed on the control-flow edge into that block,
    /// per §4.6.3's `jcc(and x,1)` and `cmp.eq` examples. A use at block
    /// `b` picks the most specific entry whose block dominates `b`.
    refinements: HashMap<(Inst, u16), Vec<(BlockId, TaggedType)>>,
}

impl<'a> Engine<'a> {
    fn get(&self, inst: Inst, slot: u16) -> TaggedType {
        self.values.get(&(inst, slot)).copied().unwrap_or(TaggedType::Unknown)
    }

    fn value_of(&self, v: ValueRef) -> TaggedType {
        match v {
            ValueRef::Result(i, s) => self.get(i, s),
            ValueRef::Const(id) => match self.prog.constant(id) {
                Constant::Int(ty, n) => {
                    let bits = ty.size_in_bytes() * 8;
                    TaggedType::Int(MaskedType::new(n as u64, low_bits(bits)))
                }
                Constant::Float(..) | Constant::Reg(_) => TaggedType::Unknown,
            },
            // A symbol+offset expression or a named global (atom, extern,
            // function) denotes a statically known address, distinct from
            // both the managed heap and a stack slot.
            ValueRef::Expr(_) => TaggedType::Addr,
            ValueRef::Global(GlobalId::Block(_)) => TaggedType::Unknown,
            ValueRef::Global(_) => TaggedType::Addr,
        }
    }

    /// `value_of`, but consulting [`Self::refinements`] for a narrower type
    /// that applies at `at_block` (§4.6.3). Only ever returns something
    /// strictly more specific than `value_of` would, never less.
    fn refined_value_of(&self, v: ValueRef, at_block: BlockId, fid: FuncId) -> TaggedType {
        let base = self.value_of(v);
        let Some((inst, slot)) = v.as_result() else { return base };
        let Some(entries) = self.refinements.get(&(inst, slot)) else { return base };
        let Some(doms) = self.doms.get(&fid) else { return base };

        let mut best: Option<TaggedType> = None;
        for &(split_block, refined) in entries {
            if !doms.dominates(split_block, at_block) {
                continue;
            }
            best = Some(match best {
                None => refined,
                Some(cur) if is_le(refined, cur) => refined,
                Some(cur) => cur,
            });
        }
        match best {
            Some(refined) if is_le(refined, base) => refined,
            _ => base,
        }
    }

    fn is_const_one(&self, v: ValueRef) -> bool {
        matches!(v, ValueRef::Const(cid) if matches!(self.prog.constant(cid), Constant::Int(_, 1)))
    }

    /// Recompute every branch-narrowed refinement from the current type
    /// assignment (§4.6.3's `jcc(and x,1)` and `cmp.eq` examples), replacing
    /// whatever was recorded on the previous round.
    fn compute_branch_refinements(&mut self) {
        self.refinements.clear();
        let funcs: Vec<FuncId> = self.prog.funcs().map(|(fid, _)| fid).collect();
        for fid in funcs {
            for &bid in &self.prog.func(fid).blocks {
                let Some(term_id) = self.prog.block(bid).terminator() else { continue };
                let term = self.prog.inst(term_id);
                if term.kind != Opcode::JumpCond {
                    continue;
                }
                let cond = term.operands[0];
                let Some(true_blk) = term.operands.get(1).and_then(|v| v.as_block()) else { continue };
                self.refine_from_condition(cond, true_blk);
            }
        }
    }

    /// The refinement a taken `jcc` edge into `true_blk` implies about
    /// `cond`'s own operands, if `cond` matches one of §4.6.3's two
    /// branch-condition patterns.
    fn refine_from_condition(&mut self, cond: ValueRef, true_blk: BlockId) {
        let Some((cond_inst, _)) = cond.as_result() else { return };
        let cond_data = self.prog.inst(cond_inst).clone();

        match cond_data.kind {
            // `jcc (and x 1)`: on the taken edge, `x` is odd (§4.6.3).
            Opcode::And => {
                let (a, b) = (cond_data.operands[0], cond_data.operands[1]);
                let x = if self.is_const_one(b) {
                    a
                } else if self.is_const_one(a) {
                    b
                } else {
                    return;
                };
                let Some((xi, xs)) = x.as_result() else { return };
                if let TaggedType::Int(m) = self.get(xi, xs) {
                    let refined = TaggedType::Int(MaskedType::new(m.value() | 1, m.known() | 1));
                    self.refinements.entry((xi, xs)).or_default().push((true_blk, refined));
                }
            }
            // `cmp.eq x y` success: `x` and `y` have the same refined type
            // (§4.6.3) — their meet, approximated here as whichever side
            // is already the more specific of the two.
            Opcode::Cmp if matches!(cond_data.payload, Payload::Cmp { cc } if cc == CondCode::Eq) => {
                let (x, y) = (cond_data.operands[0], cond_data.operands[1]);
                let (xt, yt) = (self.value_of(x), self.value_of(y));
                let refined = if is_le(xt, yt) {
                    xt
                } else if is_le(yt, xt) {
                    yt
                } else {
                    return;
                };
                if let Some((xi, xs)) = x.as_result() {
                    self.refinements.entry((xi, xs)).or_default().push((true_blk, refined));
                }
                if let Some((yi, ys)) = y.as_result() {
                    self.refinements.entry((yi, ys)).or_default().push((true_blk, refined));
                }
            }
            _ => {}
        }
    }

    fn enqueue_users(&mut self, v: ValueRef) {
        let edges: Vec<_> = self.prog.uses().uses_of(v).to_vec();
        for u in edges {
            let is_phi = self.prog.inst(u.user).kind == Opcode::Phi;
            if self.queued.insert(u.user) {
                if is_phi {
                    self.phi_queue.push_back(u.user);
                } else {
                    self.queue.push_back(u.user);
                }
            }
        }
    }

    fn update(&mut self, inst: Inst, slot: u16, new: TaggedType) -> Result<()> {
        let old = self.get(inst, slot);
        if new == old {
            return Ok(());
        }
        if !is_le(old, new) {
            return Err(Error::NotMonotonic(format!(
                "{:?} slot {} would regress from {:?} to {:?}",
                inst, slot, old, new
            )));
        }
        self.values.insert((inst, slot), new);
        self.enqueue_users(ValueRef::Result(inst, slot));
        Ok(())
    }

    fn merge_return(&mut self, fid: FuncId, results: Vec<TaggedType>) -> Result<()> {
        let entry = self.returns.entry(fid).or_default();
        if entry.len() < results.len() {
            entry.resize(results.len(), TaggedType::Unknown);
        }
        let mut changed = false;
        for (slot, ty) in results.into_iter().enumerate() {
            let joined = join(entry[slot], ty);
            if joined != entry[slot] {
                if !is_le(entry[slot], joined) {
                    return Err(Error::NotMonotonic(format!(
                        "function '{}' return slot {} would regress from {:?} to {:?}",
                        self.prog.func(fid).name,
                        slot,
                        entry[slot],
                        joined
                    )));
                }
                entry[slot] = joined;
                changed = true;
            }
        }
        if changed {
            // §4.6.3: "all call sites of the function (reached by walking
            // ... users) are re-enqueued" whenever its return vector grows.
            self.enqueue_users(ValueRef::Global(GlobalId::Func(fid)));
        }
        Ok(())
    }

    fn callee_arg_inst(&self, callee: FuncId, index: usize) -> Option<Inst> {
        let entry = self.prog.func(callee).entry()?;
        self.prog.block(entry).insts.iter().copied().find(|&ii| {
            matches!(self.prog.inst(ii).payload, Payload::Arg { index: i } if i as usize == index)
        })
    }

    fn step_call(&mut self, inst_id: Inst, inst: &InstData, caller_fid: FuncId) -> Result<()> {
        let callee = inst.call_callee();
        if let Some(callee_fid) = callee.as_func() {
            let args: Vec<ValueRef> = inst.call_args().to_vec();
            let is_caml = self.prog.func(callee_fid).calling_conv.is_caml();
            for (i, arg) in args.into_iter().enumerate() {
                if let Some(arg_inst) = self.callee_arg_inst(callee_fid, i) {
                    let arg_ty = self.refined_value_of(arg, inst.parent, caller_fid);
                    let joined = join(self.get(arg_inst, 0), arg_ty);
                    self.update(arg_inst, 0, joined)?;
                }
            }
            if let Some(rets) = self.returns.get(&callee_fid).cloned() {
                for (slot, ty) in rets.into_iter().enumerate() {
                    let ty = if is_caml && slot < 2 {
                        if slot == 0 {
                            TaggedType::Ptr
                        } else {
                            TaggedType::Young
                        }
                    } else {
                        ty
                    };
                    self.update(inst_id, slot as u16, ty)?;
                }
            }
        } else {
            for slot in 0..inst.num_returns() as u16 {
                self.update(inst_id, slot, TaggedType::Unknown)?;
            }
        }

        if inst.kind == Opcode::TailCall {
            // A tail call's return types are the caller's return types
            // (§4.6.3: "Tail calls additionally trigger re-propagation of
            // the caller's return types").
            let slots: Vec<TaggedType> = (0..inst.num_returns() as u16).map(|s| self.get(inst_id, s)).collect();
            self.merge_return(caller_fid, slots)?;
        }
        Ok(())
    }

    /// §4.6.3's store-refinement example: "after a store `*p = v` where
    /// `v : Val`, the address `p` is refined to `Ptr`." Unlike the
    /// `jcc`/`cmp.eq` examples, a store has no branch target to scope the
    /// refinement to, so it narrows the address operand's own global type
    /// directly rather than going through [`Self::refinements`].
    fn step_store(&mut self, inst: &InstData, fid: FuncId) -> Result<()> {
        let addr = inst.operands[0];
        let value = inst.operands[1];
        let value_ty = self.refined_value_of(value, inst.parent, fid);
        if value_ty != TaggedType::Unknown && is_le(value_ty, TaggedType::Val) {
            if let Some((addr_inst, slot)) = addr.as_result() {
                let refined = join(self.get(addr_inst, slot), TaggedType::Ptr);
                self.update(addr_inst, slot, refined)?;
            }
        }
        Ok(())
    }

    fn step(&mut self, inst_id: Inst) -> Result<()> {
        let inst = self.prog.inst(inst_id).clone();
        let fid = self.prog.block(inst.parent).parent;

        match inst.kind {
            Opcode::Phi => {
                // Each incoming value is evaluated at its own predecessor
                // block, not at the phi's block: a refinement recorded on
                // the edge into a predecessor applies to what flows along
                // that specific edge (§4.6.3).
                let incoming = inst.phi_incoming();
                let joined = incoming.iter().fold(TaggedType::Unknown, |acc, (pred, v)| {
                    join(acc, self.refined_value_of(*v, *pred, fid))
                });
                self.update(inst_id, 0, joined)
            }
            Opcode::Return => {
                let results: Vec<TaggedType> =
                    inst.operand_values().iter().map(|v| self.refined_value_of(*v, inst.parent, fid)).collect();
                self.merge_return(fid, results)
            }
            Opcode::Call | Opcode::TailCall | Opcode::Invoke => self.step_call(inst_id, &inst, fid),
            Opcode::Store => self.step_store(&inst, fid),
            Opcode::Select => {
                let t = self.refined_value_of(inst.operands[1], inst.parent, fid);
                let f = self.refined_value_of(inst.operands[2], inst.parent, fid);
                self.update(inst_id, 0, join(t, f))
            }
            Opcode::Mov => {
                let a = self.refined_value_of(inst.operands[0], inst.parent, fid);
                self.update(inst_id, 0, clamp_to_decl(a, inst.return_type(0)))
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::AShr
            | Opcode::Mul
            | Opcode::UDiv
            | Opcode::SDiv
            | Opcode::URem
            | Opcode::SRem => {
                let a = self.refined_value_of(inst.operands[0], inst.parent, fid);
                let b = self.refined_value_of(inst.operands[1], inst.parent, fid);
                self.update(inst_id, 0, arithmetic_rule(inst.kind, a, b))
            }
            Opcode::SExt | Opcode::ZExt | Opcode::FExt | Opcode::Trunc | Opcode::BitCast | Opcode::ByteSwap => {
                let a = self.refined_value_of(inst.operands[0], inst.parent, fid);
                let width = self.prog.target.pointer_width_bits();
                self.update(inst_id, 0, ext_trunc_rule(inst.kind, a, inst.return_type(0), width))
            }
            Opcode::Neg | Opcode::BitNot | Opcode::Abs | Opcode::Clz | Opcode::Ctz | Opcode::Popcnt => {
                self.update(inst_id, 0, TaggedType::Int(MaskedType::unknown()))
            }
            _ => Ok(()),
        }
    }

    fn seed(&mut self, fid: FuncId, inst_id: Inst) {
        let func = self.prog.func(fid);
        let inst = self.prog.inst(inst_id);
        let seeded = match inst.kind {
            Opcode::Arg => match inst.payload {
                Payload::Arg { index } if func.calling_conv.is_caml() && index == 0 => Some(TaggedType::Ptr),
                Payload::Arg { index } if func.calling_conv.is_caml() && index == 1 => Some(TaggedType::Young),
                Payload::Arg { index } => {
                    Some(default_for_type(func.params.get(index as usize).map(|p| p.ty)))
                }
                _ => None,
            },
            Opcode::Frame | Opcode::Alloca => Some(TaggedType::Addr),
            Opcode::Undef => Some(TaggedType::Undef),
            Opcode::Load => Some(TaggedType::Unknown),
            // A comparison yields 0 or 1: every bit above the low one is
            // known to be zero.
            Opcode::Cmp => Some(TaggedType::Int(MaskedType::new(0, !1u64))),
            _ => None,
        };
        if let Some(ty) = seeded {
            self.values.insert((inst_id, 0), ty);
        }
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            while let Some(inst_id) = self.queue.pop_front() {
                self.queued.remove(&inst_id);
                self.step(inst_id)?;
            }
            if let Some(inst_id) = self.phi_queue.pop_front() {
                self.queued.remove(&inst_id);
                self.step(inst_id)?;
                continue;
            }
            break;
        }
        Ok(())
    }
}

/// The lattice type assigned to every instruction result once [`analyze`]
/// reaches its fixed point.
#[derive(Debug, Clone, Default)]
pub struct TagAssignment {
    values: HashMap<(Inst, u16), TaggedType>,
}

impl TagAssignment {
    #[must_use]
    pub fn get(&self, inst: Inst, slot: u16) -> TaggedType {
        self.values.get(&(inst, slot)).copied().unwrap_or(TaggedType::Unknown)
    }
}

/// Run the type-and-tag analysis to a fixed point (§4.6.3). Seeds every
/// `Arg`/`Frame`/`Alloca`/`Undef`/`Load`/`Cmp` result from its kind, then
/// drains a forward instruction queue (phis only once the main queue is
/// empty, per §4.6.3) before running a bounded number of store-driven
/// refinement passes.
pub fn analyze(prog: &Program) -> Result<TagAssignment> {
    let mut doms = HashMap::new();
    for (fid, func) in prog.funcs() {
        if let Some(entry) = func.entry() {
            let cfg = ControlFlowGraph::compute(prog, fid);
            doms.insert(fid, Dominators::compute(&cfg, prog, fid, entry));
        }
    }

    let mut engine = Engine {
        prog,
        values: HashMap::new(),
        returns: HashMap::new(),
        queue: VecDeque::new(),
        phi_queue: VecDeque::new(),
        queued: HashSet::new(),
        doms,
        refinements: HashMap::new(),
    };

    let mut all_insts: Vec<(FuncId, Inst)> = Vec::new();
    for (fid, func) in prog.funcs() {
        for &bid in &func.blocks {
            for &inst_id in &prog.block(bid).insts {
                all_insts.push((fid, inst_id));
            }
        }
    }

    // §5: "Worklist-driven fixed points are seeded from reverse-program
    // order and drain FIFO."
    for &(fid, inst_id) in all_insts.iter().rev() {
        engine.seed(fid, inst_id);
    }
    for &(_, inst_id) in all_insts.iter().rev() {
        if engine.queued.insert(inst_id) {
            if prog.inst(inst_id).kind == Opcode::Phi {
                engine.phi_queue.push_back(inst_id);
            } else {
                engine.queue.push_back(inst_id);
            }
        }
    }

    engine.drain()?;

    // Backward refinement round (§4.6.3): recompute the `jcc`/`cmp.eq`
    // split-point refinements from the current type assignment, then
    // re-step every instruction so a refined premise can sharpen whatever
    // it feeds into (stores narrow their own address operand as a direct
    // side effect of stepping; everything else picks up a refined operand
    // through `refined_value_of`). Repeat until a round changes nothing,
    // bounded by the instruction count so a modelling error can't loop
    // forever instead of raising `NotMonotonic`.
    let budget = all_insts.len() + 1;
    let mut refinement_passes = 0;
    for _ in 0..budget {
        refinement_passes += 1;
        let before = engine.values.len();
        engine.compute_branch_refinements();
        for &(_, inst_id) in &all_insts {
            engine.step(inst_id)?;
        }
        engine.drain()?;
        if engine.values.len() == before {
            break;
        }
    }

    debug!(
        "tag analysis on '{}' converged after {} refinement pass(es), {} values assigned",
        prog.name,
        refinement_passes,
        engine.values.len()
    );

    Ok(TagAssignment { values: engine.values })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Func, Placement};
    use crate::target::Target;
    use crate::types::{CallingConv, Visibility};

    fn bare_func(name: &str) -> Func {
        Func {
            name: name.to_string(),
            visibility: Visibility::GlobalDefault,
            calling_conv: CallingConv::C,
            params: Vec::new(),
            is_vararg: false,
            is_noinline: false,
            blocks: Vec::new(),
            stack_objects: Vec::new(),
            personality: None,
            alignment: 0,
            cpu: String::new(),
            tune_cpu: String::new(),
            features: String::new(),
        }
    }

    #[test]
    fn masked_type_add_tracks_known_low_bits() {
        let a = MaskedType::new(0b10, !0u64); // exactly 2
        let b = MaskedType::new(0b01, !0u64); // exactly 1
        let sum = a.add(b);
        assert_eq!(sum, MaskedType::exact(3));
    }

    #[test]
    fn masked_type_join_keeps_only_agreeing_bits() {
        // Diamond-phi scenario from §8 scenario 4: Int({0,1},{0xFF,0xFF})
        // joined with Int({1},{0xFF,0xFF}) agrees on the upper 7 bits.
        let a = MaskedType::new(0b0000_0000, 0xFF);
        let b = MaskedType::new(0b0000_0001, 0xFF);
        let joined = a.join(b);
        assert_eq!(joined.known(), 0xFE);
    }

    #[test]
    fn phi_join_of_two_ints_produces_less_precise_int() {
        let mut prog = Program::new("p", Target::default());
        let fid = prog.add_func(bare_func("f"), Placement::Append).unwrap();
        let entry = prog.add_block(fid, "entry");
        let left = prog.add_block(fid, "left");
        let right = prog.add_block(fid, "right");
        let join_bb = prog.add_block(fid, "join");

        let mut jcc = InstData::new(Opcode::JumpCond, entry);
        jcc.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 1))));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(left)));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(right)));
        prog.push_inst(entry, jcc);

        let mut mov_left = InstData::new(Opcode::Mov, left);
        mov_left.rets.push(Type::I32);
        mov_left.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 0x00))));
        let mov_left_id = prog.push_inst(left, mov_left);
        let mut jl = InstData::new(Opcode::Jump, left);
        jl.operands.push(ValueRef::Global(GlobalId::Block(join_bb)));
        prog.push_inst(left, jl);

        let mut mov_right = InstData::new(Opcode::Mov, right);
        mov_right.rets.push(Type::I32);
        mov_right.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 0x01))));
        let mov_right_id = prog.push_inst(right, mov_right);
        let mut jr = InstData::new(Opcode::Jump, right);
        jr.operands.push(ValueRef::Global(GlobalId::Block(join_bb)));
        prog.push_inst(right, jr);

        let mut phi = InstData::new(Opcode::Phi, join_bb);
        phi.rets.push(Type::I32);
        phi.operands.push(ValueRef::Global(GlobalId::Block(left)));
        phi.operands.push(ValueRef::Result(mov_left_id, 0));
        phi.operands.push(ValueRef::Global(GlobalId::Block(right)));
        phi.operands.push(ValueRef::Result(mov_right_id, 0));
        let phi_id = prog.push_inst(join_bb, phi);

        let assignment = analyze(&prog).unwrap();
        match assignment.get(phi_id, 0) {
            TaggedType::Int(m) => assert_eq!(m.known() & 0xFF, 0xFE),
            other => panic!("expected Int, got {:?}", other),
        }
    }

    #[test]
    fn jcc_and_refines_condition_operand_on_taken_edge() {
        // `jcc (and x 1)` — on the taken edge `x` is known odd (§4.6.3
        // scenario 1), even though nothing else narrows `x`'s own type.
        let mut prog = Program::new("p", Target::default());
        let mut f = bare_func("f");
        f.params.push(crate::types::Param::new(Type::I32));
        let fid = prog.add_func(f, Placement::Append).unwrap();
        let entry = prog.add_block(fid, "entry");
        let taken = prog.add_block(fid, "taken");
        let not_taken = prog.add_block(fid, "not_taken");

        let mut arg = InstData::new(Opcode::Arg, entry);
        arg.rets.push(Type::I32);
        arg.payload = Payload::Arg { index: 0 };
        let arg_id = prog.push_inst(entry, arg);
        let x = ValueRef::Result(arg_id, 0);

        let mut and = InstData::new(Opcode::And, entry);
        and.rets.push(Type::I32);
        and.operands.push(x);
        and.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 1))));
        let and_id = prog.push_inst(entry, and);

        let mut jcc = InstData::new(Opcode::JumpCond, entry);
        jcc.operands.push(ValueRef::Result(and_id, 0));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(taken)));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(not_taken)));
        prog.push_inst(entry, jcc);

        let mut mov_taken = InstData::new(Opcode::Mov, taken);
        mov_taken.rets.push(Type::I32);
        mov_taken.operands.push(x);
        let mov_taken_id = prog.push_inst(taken, mov_taken);
        let mut ret_taken = InstData::new(Opcode::Return, taken);
        ret_taken.operands.push(ValueRef::Result(mov_taken_id, 0));
        prog.push_inst(taken, ret_taken);

        let mut mov_not_taken = InstData::new(Opcode::Mov, not_taken);
        mov_not_taken.rets.push(Type::I32);
        mov_not_taken.operands.push(x);
        let mov_not_taken_id = prog.push_inst(not_taken, mov_not_taken);
        let mut ret_not_taken = InstData::new(Opcode::Return, not_taken);
        ret_not_taken.operands.push(ValueRef::Result(mov_not_taken_id, 0));
        prog.push_inst(not_taken, ret_not_taken);

        let assignment = analyze(&prog).unwrap();
        match assignment.get(mov_taken_id, 0) {
            TaggedType::Int(m) => assert_eq!(m.value() & 1, 1, "taken edge must see x as odd"),
            other => panic!("expected Int, got {:?}", other),
        }
        match assignment.get(mov_not_taken_id, 0) {
            TaggedType::Int(m) => assert_eq!(m.known() & 1, 0, "not-taken edge learns nothing about bit 0"),
            other => panic!("expected Int, got {:?}", other),
        }
    }

    #[test]
    fn cmp_eq_refines_both_operands_on_taken_edge() {
        // `cmp.eq x y` success narrows both operands to their shared,
        // more-precise type (§4.6.3 scenario 2).
        let mut prog = Program::new("p", Target::default());
        let mut f = bare_func("f");
        f.params.push(crate::types::Param::new(Type::I32));
        let fid = prog.add_func(f, Placement::Append).unwrap();
        let entry = prog.add_block(fid, "entry");
        let taken = prog.add_block(fid, "taken");
        let not_taken = prog.add_block(fid, "not_taken");

        let mut arg = InstData::new(Opcode::Arg, entry);
        arg.rets.push(Type::I32);
        arg.payload = Payload::Arg { index: 0 };
        let arg_id = prog.push_inst(entry, arg);
        let x = ValueRef::Result(arg_id, 0);
        let exact_five = ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 5)));

        let mut cmp = InstData::new(Opcode::Cmp, entry);
        cmp.rets.push(Type::I32);
        cmp.payload = Payload::Cmp { cc: CondCode::Eq };
        cmp.operands.push(x);
        cmp.operands.push(exact_five);
        let cmp_id = prog.push_inst(entry, cmp);

        let mut jcc = InstData::new(Opcode::JumpCond, entry);
        jcc.operands.push(ValueRef::Result(cmp_id, 0));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(taken)));
        jcc.operands.push(ValueRef::Global(GlobalId::Block(not_taken)));
        prog.push_inst(entry, jcc);

        let mut mov_taken = InstData::new(Opcode::Mov, taken);
        mov_taken.rets.push(Type::I32);
        mov_taken.operands.push(x);
        let mov_taken_id = prog.push_inst(taken, mov_taken);
        let mut ret_taken = InstData::new(Opcode::Return, taken);
        ret_taken.operands.push(ValueRef::Result(mov_taken_id, 0));
        prog.push_inst(taken, ret_taken);

        let mut ret_not_taken = InstData::new(Opcode::Return, not_taken);
        ret_not_taken.operands.push(x);
        prog.push_inst(not_taken, ret_not_taken);

        let assignment = analyze(&prog).unwrap();
        match assignment.get(mov_taken_id, 0) {
            TaggedType::Int(m) => assert_eq!(m, MaskedType::exact(5), "taken edge learns x == 5"),
            other => panic!("expected Int, got {:?}", other),
        }
    }

    #[test]
    fn tail_call_propagates_callee_return_to_caller() {
        let mut prog = Program::new("p", Target::default());

        let gid = prog.add_func(bare_func("g"), Placement::Append).unwrap();
        let g_entry = prog.add_block(gid, "entry");
        let mut ret = InstData::new(Opcode::Return, g_entry);
        ret.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I64, 7))));
        prog.push_inst(g_entry, ret);

        let fid = prog.add_func(bare_func("f"), Placement::Append).unwrap();
        let f_entry = prog.add_block(fid, "entry");
        let mut tail = InstData::new(Opcode::TailCall, f_entry);
        tail.rets.push(Type::I64);
        tail.operands.push(ValueRef::Global(GlobalId::Func(gid)));
        let tail_id = prog.push_inst(f_entry, tail);

        // `g`'s single Return contributes an exact Int(7) to its own return
        // vector; the tail call folds that straight into its own result.
        let assignment = analyze(&prog).unwrap();
        assert_eq!(assignment.get(tail_id, 0), TaggedType::Int(MaskedType::exact(7)));
    }
}
