//! The program-level data model (§3, §4.3): `Program`, functions, basic
//! blocks, data segments and their objects/atoms, externs, and
//! constructor/destructor entries, plus the symbol table that ties names to
//! globals.

use std::collections::HashMap;

use cranelift_entity::{entity_impl, PrimaryMap};

use crate::constant::{Constant, ConstId, Expr, ExprId};
use crate::inst::{Inst, InstData, Opcode};
use crate::target::Target;
use crate::types::{CallingConv, Type, Visibility, XtorKind};
use crate::value::{Use, UseTracker, ValueRef};

/// Function arena index, unique across a `Program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
entity_impl!(FuncId, "func");

/// Basic-block arena index, unique across a `Program` (§9: blocks are
/// addressed by integer index rather than owned in an intrusive list).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);
entity_impl!(BlockId, "block");

/// Extern declaration arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternId(u32);
entity_impl!(ExternId, "extern");

/// Data segment arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(u32);
entity_impl!(DataId, "data");

/// Object (a contiguous run of atoms within a data segment) arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);
entity_impl!(ObjectId, "object");

/// Atom (a named, possibly-aligned sequence of data items) arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(u32);
entity_impl!(AtomId, "atom");

/// Any named top-level entity a symbol can resolve to (§3.2: "A `Global` is
/// anything nameable and linkable": functions, externs, atoms and blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlobalId {
    Func(FuncId),
    Extern(ExternId),
    Atom(AtomId),
    Block(BlockId),
}

impl GlobalId {
    #[must_use]
    pub fn as_func(self) -> Option<FuncId> {
        match self {
            GlobalId::Func(f) => Some(f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_extern(self) -> Option<ExternId> {
        match self {
            GlobalId::Extern(e) => Some(e),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_atom(self) -> Option<AtomId> {
        match self {
            GlobalId::Atom(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_block(self) -> Option<BlockId> {
        match self {
            GlobalId::Block(b) => Some(b),
            _ => None,
        }
    }
}

/// One data item inside an atom (§3.3): a fixed-width integer, a float, an
/// alignment directive, reserved zero-filled space, a string literal, or a
/// symbol+offset expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(u64),
    /// REDESIGN FLAG resolved: alignment is `u32` with `0` meaning
    /// "unaligned", not the dead `u8` encoding some legacy producers wrote.
    Align(u32),
    Space(u32),
    String(String),
    Expr(ExprId),
}

#[derive(Debug, Clone)]
pub struct Atom {
    pub name: String,
    pub align: u32,
    pub visibility: Visibility,
    pub items: Vec<Item>,
    pub parent: ObjectId,
}

#[derive(Debug, Clone, Default)]
pub struct Object {
    pub atoms: Vec<AtomId>,
    pub parent: DataId,
}

/// A data segment: a named section (`.data`, `.bss`, `.const`, ...)
/// containing an ordered list of objects (§3.3).
#[derive(Debug, Clone)]
pub struct DataSeg {
    pub name: String,
    pub objects: Vec<ObjectId>,
}

/// A declared-but-not-defined symbol (§3.2).
#[derive(Debug, Clone)]
pub struct Extern {
    pub name: String,
    pub visibility: Visibility,
    /// The symbol this extern aliases, if it was defined with `= other`.
    pub alias: Option<GlobalId>,
    /// An explicit section placement (e.g. `__DATA,__la_symbol_ptr`), if
    /// one was given (§3.2, §4.4 item 8).
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub parent: FuncId,
    pub insts: Vec<Inst>,
}

impl Block {
    /// The block's terminator (§3.3: "a block's last instruction is a
    /// terminator; all others are non-terminators"), or `None` for a
    /// block under construction that hasn't had one appended yet.
    #[must_use]
    pub fn terminator(&self) -> Option<Inst> {
        self.insts.last().copied()
    }
}

/// A function (§3.1): parameters, calling convention, varargs flag, an
/// ordered list of blocks (first is entry), and a stack-object table.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub visibility: Visibility,
    pub calling_conv: CallingConv,
    pub params: Vec<crate::types::Param>,
    pub is_vararg: bool,
    pub is_noinline: bool,
    pub blocks: Vec<BlockId>,
    /// Stack objects addressed by `Frame` instructions: `(size, align)`.
    pub stack_objects: Vec<(u32, u32)>,
    pub personality: Option<GlobalId>,
    /// Function-level alignment override (§4.4 item 7); `0` means absent.
    pub alignment: u32,
    /// Target CPU, tune-CPU and feature-string overrides (§4.4 item 7),
    /// empty when the function carries no override of its own.
    pub cpu: String,
    pub tune_cpu: String,
    pub features: String,
}

impl Func {
    #[must_use]
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// A module-level constructor or destructor entry (§3.2): run-priority plus
/// the function to invoke.
#[derive(Debug, Clone)]
pub struct Xtor {
    pub priority: i32,
    pub kind: XtorKind,
    pub func: GlobalId,
}

/// Errors raised by the `ir` data model (§7: `InternalInvariant`).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("symbol '{0}' is already defined")]
    DuplicateSymbol(String),
    #[error("no such global '{0}'")]
    MissingGlobal(String),
    #[error("operand {operand} of instruction {inst:?} is out of range")]
    InvalidOperand { inst: Inst, operand: usize },
}

/// Where to place a newly added global relative to an existing one
/// (§4.3: "before" placement for iterator-preserving rebuilds).
#[derive(Debug, Clone, Copy)]
pub enum Placement<T> {
    Append,
    Before(T),
}

/// A whole program (§3.1): the top-level container for every function,
/// extern, data segment and constructor/destructor, plus the arenas that
/// back every instruction and basic block in the program (§9: Program-level
/// arenas, rather than per-function ones, so a `Use` edge alone is enough
/// to locate and rewrite its referencing operand regardless of which
/// function owns the instruction).
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub target: Target,

    funcs: PrimaryMap<FuncId, Func>,
    /// Iteration order over `funcs`, independent of arena (allocation)
    /// order so that `add_func(_, Placement::Before(other))` can splice a
    /// function ahead of `other` without needing the arena itself to
    /// support reordering (§4.3: "place `item`... immediately before
    /// `before`").
    func_order: Vec<FuncId>,
    externs: PrimaryMap<ExternId, Extern>,
    datas: PrimaryMap<DataId, DataSeg>,
    objects: PrimaryMap<ObjectId, Object>,
    atoms: PrimaryMap<AtomId, Atom>,
    blocks: PrimaryMap<BlockId, Block>,
    insts: PrimaryMap<Inst, InstData>,
    xtors: Vec<Xtor>,

    consts: PrimaryMap<ConstId, Constant>,
    const_index: HashMap<Constant, ConstId>,
    exprs: PrimaryMap<ExprId, Expr>,
    expr_index: HashMap<Expr, ExprId>,

    names: HashMap<String, GlobalId>,
    uses: UseTracker,

    /// Funcs/externs dropped by [`Self::retain_reachable`] (§4.5 step 6:
    /// "dead globals, not reached from entry, are dropped"). Their arena
    /// slots stay allocated — nothing else references them any more — but
    /// they no longer appear in `funcs()`/`externs_ordered()`.
    dead_funcs: std::collections::HashSet<FuncId>,
    dead_externs: std::collections::HashSet<ExternId>,

    /// Monotonically increasing suffix counter for the `<name>$local<N>`
    /// rename policy (§4.3 point 3, §9: "move the unique-name suffix
    /// counter... to per-Program fields").
    local_counter: u32,
}

impl Program {
    #[must_use]
    pub fn new(name: impl Into<String>, target: Target) -> Self {
        Self {
            name: name.into(),
            target,
            funcs: PrimaryMap::new(),
            func_order: Vec::new(),
            externs: PrimaryMap::new(),
            datas: PrimaryMap::new(),
            objects: PrimaryMap::new(),
            atoms: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            xtors: Vec::new(),
            consts: PrimaryMap::new(),
            const_index: HashMap::new(),
            exprs: PrimaryMap::new(),
            expr_index: HashMap::new(),
            names: HashMap::new(),
            uses: UseTracker::new(),
            dead_funcs: std::collections::HashSet::new(),
            dead_externs: std::collections::HashSet::new(),
            local_counter: 0,
        }
    }

    // --- name resolution -------------------------------------------------

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<GlobalId> {
        self.names.get(name).copied()
    }

    /// Every name currently bound in this program's symbol table (§6.4:
    /// `Program::globals()`), for a back-end that wants to enumerate
    /// every linkable name rather than walk `funcs()`/`externs_ordered()`/
    /// `atoms_ordered()` separately.
    pub fn globals(&self) -> impl Iterator<Item = (&str, GlobalId)> {
        self.names.iter().map(|(n, g)| (n.as_str(), *g))
    }

    /// Visibility of any already-bound global, needed by the name-conflict
    /// policies below. A `Block` has no visibility of its own in this
    /// model; block labels never participate in policies 2/3 (`add_block`
    /// ignores `bind_name`'s result), so `GlobalDefault` here is just a
    /// harmless default, never actually load-bearing.
    fn visibility_of(&self, id: GlobalId) -> Visibility {
        match id {
            GlobalId::Func(f) => self.funcs[f].visibility,
            GlobalId::Extern(e) => self.externs[e].visibility,
            GlobalId::Atom(a) => self.atoms[a].visibility,
            GlobalId::Block(_) => Visibility::GlobalDefault,
        }
    }

    /// Patch a global's own `name` field in place, used by the rename leg
    /// of policy 3 so the renamed entity's stored name agrees with the
    /// key it's now bound under.
    fn set_global_name(&mut self, id: GlobalId, name: String) {
        match id {
            GlobalId::Func(f) => self.funcs[f].name = name,
            GlobalId::Extern(e) => self.externs[e].name = name,
            GlobalId::Atom(a) => self.atoms[a].name = name,
            GlobalId::Block(_) => {}
        }
    }

    /// Apply §4.3's four name-conflict policies when binding `name` to
    /// `id` (of visibility `visibility`): (1) a real definition replaces a
    /// plain forward-declared extern; (2) if both the incoming and the
    /// already-bound global are weak, the existing one wins and the new
    /// one is left allocated but unbound; (3) if exactly one of the two is
    /// `Local`, the exported one keeps `name` and the local one is renamed
    /// to `<name>$local<N>`; (4) otherwise the conflict is fatal.
    fn bind_name(&mut self, name: String, id: GlobalId, visibility: Visibility) -> Result<(), Error> {
        match self.names.get(&name).copied() {
            None => {
                self.names.insert(name, id);
                Ok(())
            }
            Some(existing) => {
                // Policy 1 — extern-replace: a real definition may supersede
                // a prior forward-declared extern of the same name.
                if let GlobalId::Extern(eid) = existing {
                    if self.externs[eid].alias.is_none() {
                        self.names.insert(name, id);
                        return Ok(());
                    }
                }

                let existing_vis = self.visibility_of(existing);

                // Policy 2 — both weak: the existing definition wins: the
                // newly added global stays allocated in its arena (the
                // caller already pushed it) but is never indexed by name.
                if existing_vis.is_weak() && visibility.is_weak() {
                    return Ok(());
                }

                // Policy 3 — one local, one exported: the exported global
                // keeps `name`; the local one is renamed out of the way.
                if existing_vis.is_local() != visibility.is_local() {
                    let (local_id, exported_id) = if existing_vis.is_local() {
                        (existing, id)
                    } else {
                        (id, existing)
                    };
                    let renamed = format!("{name}$local{}", self.local_counter);
                    self.local_counter += 1;
                    self.set_global_name(local_id, renamed.clone());
                    self.names.insert(renamed, local_id);
                    self.names.insert(name, exported_id);
                    return Ok(());
                }

                Err(Error::DuplicateSymbol(name))
            }
        }
    }

    // --- funcs -------------------------------------------------------------

    pub fn add_func(&mut self, func: Func, placement: Placement<FuncId>) -> Result<FuncId, Error> {
        let name = func.name.clone();
        let visibility = func.visibility;
        let id = self.funcs.push(func);
        if let Err(e) = self.bind_name(name, GlobalId::Func(id), visibility) {
            self.funcs.pop();
            return Err(e);
        }
        match placement {
            Placement::Append => self.func_order.push(id),
            Placement::Before(before) => {
                let at = self.func_order.iter().position(|&f| f == before).unwrap_or(self.func_order.len());
                self.func_order.insert(at, id);
            }
        }
        Ok(id)
    }

    #[must_use]
    pub fn func(&self, id: FuncId) -> &Func {
        &self.funcs[id]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Func {
        &mut self.funcs[id]
    }

    /// Every live func, in `func_order` (placement) order rather than
    /// arena (allocation) order, so `Placement::Before` is observable by
    /// every consumer that walks this iterator (the bitcode writer, the
    /// linker, the tag analysis, the printer).
    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &Func)> {
        self.func_order
            .iter()
            .filter(|id| !self.dead_funcs.contains(id))
            .map(|&id| (id, &self.funcs[id]))
    }

    // --- externs -----------------------------------------------------------

    pub fn add_extern(&mut self, ext: Extern) -> Result<ExternId, Error> {
        let name = ext.name.clone();
        let visibility = ext.visibility;
        let id = self.externs.push(ext);
        if let Err(e) = self.bind_name(name, GlobalId::Extern(id), visibility) {
            self.externs.pop();
            return Err(e);
        }
        Ok(id)
    }

    #[must_use]
    pub fn extern_(&self, id: ExternId) -> &Extern {
        &self.externs[id]
    }

    /// Every extern, in arena (declaration) order.
    #[must_use]
    pub fn externs_ordered(&self) -> Vec<(ExternId, &Extern)> {
        self.externs
            .iter()
            .filter(|(id, _)| !self.dead_externs.contains(id))
            .collect()
    }

    // --- data / objects / atoms ---------------------------------------------

    /// Data segments aren't linkable symbols (§3.3), so lookup is a linear
    /// scan over the (typically small) segment list rather than the name
    /// table.
    pub fn get_or_create_data(&mut self, name: &str) -> DataId {
        if let Some(id) = self.datas.iter().find(|(_, d)| d.name == name).map(|(id, _)| id) {
            return id;
        }
        self.datas.push(DataSeg {
            name: name.to_string(),
            objects: Vec::new(),
        })
    }

    pub fn add_object(&mut self, data: DataId) -> ObjectId {
        let id = self.objects.push(Object {
            atoms: Vec::new(),
            parent: data,
        });
        self.datas[data].objects.push(id);
        id
    }

    pub fn add_atom(&mut self, object: ObjectId, atom: Atom) -> Result<AtomId, Error> {
        let name = atom.name.clone();
        let visibility = atom.visibility;
        let id = self.atoms.push(atom);
        if let Err(e) = self.bind_name(name, GlobalId::Atom(id), visibility) {
            self.atoms.pop();
            return Err(e);
        }
        self.objects[object].atoms.push(id);
        Ok(id)
    }

    #[must_use]
    pub fn atom(&self, id: AtomId) -> &Atom {
        &self.atoms[id]
    }

    #[must_use]
    pub fn object(&self, id: ObjectId) -> &Object {
        &self.objects[id]
    }

    /// Every non-empty data segment, in arena (declaration) order. A
    /// segment whose objects were all pruned by [`Self::retain_reachable`]
    /// is skipped rather than emitted empty.
    #[must_use]
    pub fn data_segments_ordered(&self) -> Vec<&DataSeg> {
        self.datas.values().filter(|d| !d.objects.is_empty()).collect()
    }

    /// Every atom, in data-segment/object declaration order (the order
    /// the bitcode format's global table assigns them).
    #[must_use]
    pub fn atoms_ordered(&self) -> Vec<AtomId> {
        self.datas
            .values()
            .flat_map(|d| d.objects.iter())
            .flat_map(|&oid| self.objects[oid].atoms.iter().copied())
            .collect()
    }

    // --- blocks / instructions ------------------------------------------

    pub fn add_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        let id = self.blocks.push(Block {
            name: name.into(),
            parent: func,
            insts: Vec::new(),
        });
        self.funcs[func].blocks.push(id);
        let _ = self.bind_name(
            format!("{}.{}", self.funcs[func].name, self.blocks[id].name),
            GlobalId::Block(id),
            Visibility::GlobalDefault,
        );
        id
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn push_inst(&mut self, block: BlockId, data: InstData) -> Inst {
        let operands = data.operand_values().to_vec();
        let id = self.insts.push(data);
        for (slot, operand) in operands.into_iter().enumerate() {
            self.uses.add_use(operand, id, slot as u16);
        }
        self.blocks[block].insts.push(id);
        id
    }

    #[must_use]
    pub fn inst(&self, id: Inst) -> &InstData {
        &self.insts[id]
    }

    pub fn inst_mut(&mut self, id: Inst) -> &mut InstData {
        &mut self.insts[id]
    }

    /// Replace every use of `old` with `new` across the whole program
    /// (§4.1's `replaceAllUsesWith`), patching both the use-chain side
    /// table and the referencing instructions' operand storage.
    pub fn replace_all_uses_with(&mut self, old: ValueRef, new: ValueRef) {
        let edges = self.uses.take_uses(old);
        for Use { user, slot } in &edges {
            self.insts[*user].set_operand(*slot as usize, new);
        }
        self.uses.retarget(new, &edges);
    }

    /// Overwrite a single operand slot in place, fixing up its use-chain
    /// edge. Used by the bitcode reader to patch phi arguments that
    /// referenced a not-yet-decoded result when the instruction was first
    /// pushed.
    pub fn replace_operand(&mut self, inst: Inst, slot: usize, new: ValueRef) {
        let old = self.insts[inst].set_operand(slot, new);
        self.uses.remove_use(old, inst, slot as u16);
        self.uses.add_use(new, inst, slot as u16);
    }

    pub fn erase_inst(&mut self, block: BlockId, id: Inst) {
        for (slot, operand) in self.insts[id].operand_values().to_vec().into_iter().enumerate() {
            self.uses.remove_use(operand, id, slot as u16);
        }
        self.blocks[block].insts.retain(|&i| i != id);
    }

    // --- constants / expressions (interned, §4.1) ---------------------------

    pub fn intern_const(&mut self, c: Constant) -> ConstId {
        *self.const_index.entry(c).or_insert_with(|| self.consts.push(c))
    }

    #[must_use]
    pub fn constant(&self, id: ConstId) -> Constant {
        self.consts[id]
    }

    pub fn intern_expr(&mut self, e: Expr) -> ExprId {
        *self.expr_index.entry(e).or_insert_with(|| self.exprs.push(e))
    }

    #[must_use]
    pub fn expr(&self, id: ExprId) -> Expr {
        self.exprs[id]
    }

    // --- bitcode-reader patch points ---------------------------------
    //
    // The bitcode format names globals before it describes their bodies
    // (§4.4), so the reader allocates placeholder `Func`/`Atom`/`Extern`
    // entries up front, during the symbol scan, and fills them in once
    // their bodies are decoded. These setters exist for that one caller;
    // ordinary construction goes through `add_func`/`add_atom`/`add_extern`
    // with a fully-formed value instead.

    pub(crate) fn patch_atom(&mut self, id: AtomId, align: u32, visibility: Visibility, items: Vec<Item>) {
        let atom = &mut self.atoms[id];
        atom.align = align;
        atom.visibility = visibility;
        atom.items = items;
    }

    pub(crate) fn patch_extern(
        &mut self,
        id: ExternId,
        visibility: Visibility,
        alias: Option<GlobalId>,
        section: Option<String>,
    ) {
        let ext = &mut self.externs[id];
        ext.visibility = visibility;
        ext.alias = alias;
        ext.section = section;
    }

    #[allow(clippy::too_many_arguments)]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn patch_func_header(
        &mut self,
        id: FuncId,
        visibility: Visibility,
        calling_conv: CallingConv,
        is_vararg: bool,
        is_noinline: bool,
        personality: Option<GlobalId>,
        params: Vec<crate::types::Param>,
        stack_objects: Vec<(u32, u32)>,
        alignment: u32,
        cpu: String,
        tune_cpu: String,
        features: String,
    ) {
        let func = &mut self.funcs[id];
        func.visibility = visibility;
        func.calling_conv = calling_conv;
        func.is_vararg = is_vararg;
        func.is_noinline = is_noinline;
        func.personality = personality;
        func.params = params;
        func.stack_objects = stack_objects;
        func.alignment = alignment;
        func.cpu = cpu;
        func.tune_cpu = tune_cpu;
        func.features = features;
    }

    /// Drop every `Func`, `Extern` and `Atom` not named in `keep` (§4.5
    /// step 4/6: the linker's transitive closure transfer leaves dead
    /// globals out of the output). Funcs and externs become invisible to
    /// `funcs()`/`externs_ordered()`; atoms are physically unlinked from
    /// their owning object (and now-empty objects from their segment), so
    /// `atoms_ordered()`/`data_segments_ordered()` agree without a
    /// separate liveness check. Name-table entries for dropped globals are
    /// removed so a later `resolve()` correctly reports them absent.
    pub fn retain_reachable(&mut self, keep: &std::collections::HashSet<GlobalId>) {
        for (id, _) in self.funcs.iter() {
            if !keep.contains(&GlobalId::Func(id)) {
                self.dead_funcs.insert(id);
            }
        }
        for (id, _) in self.externs.iter() {
            if !keep.contains(&GlobalId::Extern(id)) {
                self.dead_externs.insert(id);
            }
        }
        for (_, object) in self.objects.iter_mut() {
            object.atoms.retain(|a| keep.contains(&GlobalId::Atom(*a)));
        }
        for (_, seg) in self.datas.iter_mut() {
            seg.objects.retain(|o| !self.objects[*o].atoms.is_empty());
        }
        self.names.retain(|_, gid| match *gid {
            GlobalId::Func(f) => keep.contains(&GlobalId::Func(f)),
            GlobalId::Extern(e) => keep.contains(&GlobalId::Extern(e)),
            GlobalId::Atom(a) => keep.contains(&GlobalId::Atom(a)),
            GlobalId::Block(_) => true,
        });
    }

    // --- xtors ---------------------------------------------------------

    pub fn add_xtor(&mut self, xtor: Xtor) {
        self.xtors.push(xtor);
    }

    #[must_use]
    pub fn xtors(&self) -> &[Xtor] {
        &self.xtors
    }

    #[must_use]
    pub fn uses(&self) -> &UseTracker {
        &self.uses
    }
}

/// Operands that reference a constant directly rather than through an
/// interned id; a small convenience constructor mirroring what a bitcode
/// reader or builder does for every immediate operand it decodes.
#[must_use]
pub fn const_operand(program: &mut Program, c: Constant) -> ValueRef {
    ValueRef::Const(program.intern_const(c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Param;

    fn sample_program() -> Program {
        Program::new("t", Target::default())
    }

    #[test]
    fn add_func_then_extern_of_same_name_conflicts() {
        let mut p = sample_program();
        p.add_func(
            Func {
                name: "f".into(),
                visibility: Visibility::GlobalDefault,
                calling_conv: CallingConv::C,
                params: vec![Param::new(Type::I64)],
                is_vararg: false,
                is_noinline: false,
                blocks: Vec::new(),
                stack_objects: Vec::new(),
                personality: None,
                alignment: 0,
                cpu: String::new(),
                tune_cpu: String::new(),
                features: String::new(),
            },
            Placement::Append,
        )
        .unwrap();
        let err = p
            .add_extern(Extern {
                name: "f".into(),
                visibility: Visibility::GlobalDefault,
                alias: None,
                section: None,
            })
            .unwrap_err();
        assert_eq!(err, Error::DuplicateSymbol("f".into()));
    }

    #[test]
    fn extern_forward_declaration_is_replaced_by_definition() {
        let mut p = sample_program();
        p.add_extern(Extern {
            name: "g".into(),
            visibility: Visibility::GlobalDefault,
            alias: None,
            section: None,
        })
        .unwrap();
        let fid = p
            .add_func(
                Func {
                    name: "g".into(),
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
                },
                Placement::Append,
            )
            .unwrap();
        assert_eq!(p.resolve("g"), Some(GlobalId::Func(fid)));
    }

    #[test]
    fn interning_is_structural() {
        let mut p = sample_program();
        let a = p.intern_const(Constant::Int(Type::I32, 7));
        let b = p.intern_const(Constant::Int(Type::I32, 7));
        assert_eq!(a, b);
    }

    #[test]
    fn replace_all_uses_with_rewrites_operand_storage() {
        let mut p = sample_program();
        let fid = p
            .add_func(
                Func {
                    name: "h".into(),
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
                },
                Placement::Append,
            )
            .unwrap();
        let bid = p.add_block(fid, "entry");
        let old = ValueRef::Const(p.intern_const(Constant::Int(Type::I32, 1)));
        let new = ValueRef::Const(p.intern_const(Constant::Int(Type::I32, 2)));

        let mut data = InstData::new(Opcode::Mov, bid);
        data.rets.push(Type::I32);
        data.operands.push(old);
        let inst = p.push_inst(bid, data);

        p.replace_all_uses_with(old, new);
        assert_eq!(p.inst(inst).operand_values()[0], new);
        assert!(!p.uses().has_uses(old));
        assert!(p.uses().has_uses(new));
    }
}
