//! The symbol-resolution linker (§4.5): merges a set of input modules
//! (and archive members) into a single `Program`, resolving extern
//! declarations against their definitions, rejecting symbol collisions
//! that aren't resolved by visibility rules, and finally dropping every
//! global not transitively reachable from the entry point.
//!
//! Implementation shape: every module's funcs, externs and atoms are
//! declared into the merged program first (so forward and circular
//! references between them resolve uniformly), then bodies are filled in,
//! and only then is the entry point's transitive closure computed and
//! used to prune the merged program down to what's reachable (§4.5 step
//! 4, §8's "dead globals... are dropped"). This costs a bit more
//! intermediate memory than transferring only-reachable nodes as they're
//! discovered, but keeps the merge and the closure computation as two
//! independently testable passes.

use std::collections::HashMap;

use log::{debug, warn};
use thiserror::Error;

use crate::bitcode::{self, Archive};
use crate::inst::InstData;
use crate::ir::{self, GlobalId, Program};
use crate::target::Target;
use crate::types::Visibility;
use crate::value::ValueRef;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("symbol '{0}' is defined in more than one input")]
    DuplicateSymbol(String),
    #[error("no definition found for entry point '{0}'")]
    MissingEntry(String),
    #[error(transparent)]
    Bitcode(#[from] bitcode::Error),
    #[error(transparent)]
    Ir(#[from] ir::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One input the linker couldn't consume directly, bucketed the way the
/// tool this is modelled on buckets them: ordinary object files in a
/// foreign (ELF) format, and archives that aren't in this format either.
/// Both are handed back to the caller to pass to a system linker.
#[derive(Debug, Clone, Default)]
pub struct LinkOutcome {
    pub program: Option<Program>,
    pub unresolved_inputs: Vec<String>,
}

/// Maps every global (and every instruction, for operand rewriting) of one
/// input module onto its counterpart in the merged output program.
#[derive(Default)]
struct ModuleRemap {
    globals: HashMap<GlobalId, GlobalId>,
    insts: HashMap<crate::inst::Inst, crate::inst::Inst>,
    /// Functions whose blocks this module's `declare_owned_funcs` pass actually
    /// created in the merged program (as opposed to resolving to an
    /// earlier module's definition of the same name) — only these get
    /// their bodies filled in by this module's `fill_funcs` pass.
    owned_funcs: std::collections::HashSet<crate::ir::FuncId>,
}

pub struct Linker {
    target: Target,
    entry: String,
    modules: Vec<Program>,
    unresolved_inputs: Vec<String>,
}

impl Linker {
    #[must_use]
    pub fn new(entry: impl Into<String>, target: Target) -> Self {
        Self {
            target,
            entry: entry.into(),
            modules: Vec::new(),
            unresolved_inputs: Vec::new(),
        }
    }

    /// Load one input buffer. Recognizes this crate's own bitcode object
    /// and archive formats by magic; anything else (ELF objects, foreign
    /// archives) is recorded as unresolved for the caller to pass to a
    /// system linker, exactly as the tool this is modelled on does for
    /// ELF inputs.
    pub fn load(&mut self, name: &str, buf: &[u8]) -> Result<()> {
        if bitcode::is_llir_object(buf) {
            let prog = bitcode::read_program(buf, self.target.clone())?;
            debug!("loaded module '{}' ({} functions)", prog.name, prog.funcs().count());
            self.modules.push(prog);
            return Ok(());
        }
        if bitcode::is_llar_archive(buf) {
            let archive = Archive::read(buf)?;
            for prog in archive.decode_all(&self.target)? {
                self.modules.push(prog);
            }
            return Ok(());
        }
        warn!("unrecognized input format for '{}', deferring to system linker", name);
        self.unresolved_inputs.push(name.to_string());
        Ok(())
    }

    pub fn add_module(&mut self, program: Program) {
        self.modules.push(program);
    }

    /// Merge every loaded module into one program, resolving symbols.
    pub fn link(self) -> Result<LinkOutcome> {
        if self.modules.is_empty() {
            return Ok(LinkOutcome {
                program: None,
                unresolved_inputs: self.unresolved_inputs,
            });
        }

        let winners = self.find_definitions()?;
        let entry_defined = self.modules.iter().any(|m| {
            m.resolve(&self.entry)
                .and_then(GlobalId::as_func)
                .map(|f| !m.func(f).visibility.is_hidden())
                .unwrap_or(false)
        });
        if !entry_defined {
            return Err(Error::MissingEntry(self.entry));
        }

        let mut merged = Program::new("a.out", self.target.clone());
        let mut remaps: Vec<ModuleRemap> = (0..self.modules.len()).map(|_| ModuleRemap::default()).collect();

        // Two passes so the *winning* module's definition always gets the
        // fresh `Func`, independent of load order: a weak definition
        // encountered before its strong override must not get to claim the
        // name just by arriving first (§4.3 point 2/4).
        for (idx, module) in self.modules.iter().enumerate() {
            Self::declare_owned_funcs(idx, module, &mut merged, &mut remaps[idx], &winners)?;
        }
        for (idx, module) in self.modules.iter().enumerate() {
            Self::declare_aliased_funcs(module, &mut merged, &mut remaps[idx]);
        }
        // Externs run after funcs are named, so one module's `extern foo`
        // resolves straight to another module's definition of `foo`
        // (`declare_externs`'s `merged.resolve` check below) instead of
        // materializing a second, orphaned `Extern` for the same name.
        for (idx, module) in self.modules.iter().enumerate() {
            Self::declare_externs(module, &mut merged, &mut remaps[idx]);
        }
        for (idx, module) in self.modules.iter().enumerate() {
            Self::declare_data(module, &mut merged, &mut remaps[idx])?;
        }
        // Personality is a global reference like any other operand, so it's
        // only resolvable once every extern/func/atom name above has a
        // counterpart in `merged`.
        for (idx, module) in self.modules.iter().enumerate() {
            Self::fill_personality(module, &mut merged, &remaps[idx]);
        }
        for (idx, module) in self.modules.iter().enumerate() {
            Self::fill_atoms(module, &mut merged, &remaps[idx]);
        }
        for (idx, module) in self.modules.iter().enumerate() {
            Self::fill_funcs(module, &mut merged, &mut remaps[idx]);
        }

        let entry_fid = merged
            .resolve(&self.entry)
            .and_then(GlobalId::as_func)
            .expect("entry was confirmed defined above");
        let reachable = Self::transitive_closure(&merged, entry_fid);
        debug!(
            "entry '{}' reaches {} of {} merged funcs",
            self.entry,
            reachable.iter().filter(|g| g.as_func().is_some()).count(),
            merged.funcs().count()
        );
        merged.retain_reachable(&reachable);

        let fids: Vec<_> = merged.funcs().map(|(fid, _)| fid).collect();
        for fid in fids {
            let is_entry = merged.func(fid).name == self.entry;
            merged.func_mut(fid).visibility = if is_entry {
                Visibility::GlobalDefault
            } else {
                Visibility::GlobalHidden
            };
        }

        Ok(LinkOutcome {
            program: Some(merged),
            unresolved_inputs: self.unresolved_inputs,
        })
    }

    /// Scan every module for function definitions, applying the visibility
    /// policy (hidden symbols never participate in cross-module resolution,
    /// weak definitions yield to a later strong one) and rejecting genuine
    /// collisions before any module content is copied. Returns, for every
    /// non-hidden name, the index of the module whose definition wins —
    /// `declare_owned_funcs` uses this so the strong definition is the one
    /// actually materialized regardless of which module loads first.
    fn find_definitions(&self) -> Result<HashMap<String, usize>> {
        let mut winners: HashMap<String, usize> = HashMap::new();
        let mut seen: HashMap<&str, Visibility> = HashMap::new();
        for (idx, module) in self.modules.iter().enumerate() {
            for (_, func) in module.funcs() {
                if func.visibility.is_hidden() {
                    continue;
                }
                match seen.get(func.name.as_str()) {
                    None => {
                        seen.insert(&func.name, func.visibility);
                        winners.insert(func.name.clone(), idx);
                    }
                    Some(&existing) if existing.is_weak() && !func.visibility.is_weak() => {
                        seen.insert(&func.name, func.visibility);
                        winners.insert(func.name.clone(), idx);
                    }
                    Some(&existing) if func.visibility.is_weak() || existing.is_weak() => {}
                    Some(_) => return Err(Error::DuplicateSymbol(func.name.clone())),
                }
            }
        }
        Ok(winners)
    }

    fn declare_externs(module: &Program, merged: &mut Program, remap: &mut ModuleRemap) {
        for (eid, ext) in module.externs_ordered() {
            if let Some(existing) = merged.resolve(&ext.name) {
                remap.globals.insert(GlobalId::Extern(eid), existing);
                continue;
            }
            if let Ok(new_id) = merged.add_extern(ir::Extern {
                name: ext.name.clone(),
                visibility: ext.visibility,
                alias: None,
                section: ext.section.clone(),
            }) {
                remap.globals.insert(GlobalId::Extern(eid), GlobalId::Extern(new_id));
            }
        }
    }

    fn declare_data(module: &Program, merged: &mut Program, remap: &mut ModuleRemap) -> Result<()> {
        for seg in module.data_segments_ordered() {
            let data_id = merged.get_or_create_data(&seg.name);
            for &object_id in &seg.objects {
                let new_object = merged.add_object(data_id);
                for &atom_id in &module.object(object_id).atoms {
                    let atom = module.atom(atom_id);
                    let new_atom = merged.add_atom(
                        new_object,
                        ir::Atom {
                            name: atom.name.clone(),
                            align: atom.align,
                            visibility: atom.visibility,
                            items: Vec::new(),
                            parent: new_object,
                        },
                    )?;
                    remap.globals.insert(GlobalId::Atom(atom_id), GlobalId::Atom(new_atom));
                }
            }
        }
        Ok(())
    }

    /// Materialize a fresh `Func` for every name this module actually owns:
    /// a hidden (module-private) func always owns its own name, and a
    /// non-hidden one only if `winners` recorded this module as the
    /// strongest definition. Everything else is left for
    /// `declare_aliased_funcs` to remap once the owner has run.
    fn declare_owned_funcs(
        module_idx: usize,
        module: &Program,
        merged: &mut Program,
        remap: &mut ModuleRemap,
        winners: &HashMap<String, usize>,
    ) -> Result<()> {
        for (fid, func) in module.funcs() {
            let owns = func.visibility.is_hidden()
                || winners.get(&func.name).copied().unwrap_or(module_idx) == module_idx;
            if !owns {
                continue;
            }
            let new_id = merged.add_func(
                ir::Func {
                    name: func.name.clone(),
                    visibility: func.visibility,
                    calling_conv: func.calling_conv,
                    params: func.params.clone(),
                    is_vararg: func.is_vararg,
                    is_noinline: func.is_noinline,
                    blocks: Vec::new(),
                    stack_objects: func.stack_objects.clone(),
                    personality: None,
                    alignment: func.alignment,
                    cpu: func.cpu.clone(),
                    tune_cpu: func.tune_cpu.clone(),
                    features: func.features.clone(),
                },
                ir::Placement::Append,
            )?;
            remap.globals.insert(GlobalId::Func(fid), GlobalId::Func(new_id));
            remap.owned_funcs.insert(new_id);

            for &bid in &func.blocks {
                let block = module.block(bid);
                let new_block = merged.add_block(new_id, block.name.clone());
                remap.globals.insert(GlobalId::Block(bid), GlobalId::Block(new_block));
            }
        }
        Ok(())
    }

    /// Point every func name this module only *declares* (an extern-like
    /// duplicate, or a weak definition that lost) at whatever
    /// `declare_owned_funcs` already materialized for that name elsewhere.
    fn declare_aliased_funcs(module: &Program, merged: &mut Program, remap: &mut ModuleRemap) {
        for (fid, func) in module.funcs() {
            if remap.globals.contains_key(&GlobalId::Func(fid)) {
                continue;
            }
            if let Some(existing) = merged.resolve(&func.name) {
                remap.globals.insert(GlobalId::Func(fid), existing);
            }
        }
    }

    /// Resolve each owned func's personality reference through this
    /// module's remap, same as any other global operand (§3.1). Only funcs
    /// this module actually won ownership of are touched, mirroring
    /// `fill_funcs`'s gating: a name resolved to an earlier module's
    /// definition keeps that module's personality too.
    fn fill_personality(module: &Program, merged: &mut Program, remap: &ModuleRemap) {
        for (fid, func) in module.funcs() {
            let Some(p) = func.personality else { continue };
            let Some(&GlobalId::Func(new_fid)) = remap.globals.get(&GlobalId::Func(fid)) else {
                continue;
            };
            if !remap.owned_funcs.contains(&new_fid) {
                continue;
            }
            let new_p = remap.globals.get(&p).copied().unwrap_or(p);
            merged.func_mut(new_fid).personality = Some(new_p);
        }
    }

    /// Fill in atom item lists once every global in this module has a
    /// counterpart in `merged`, re-interning any `Expr` item against the
    /// merged program's own constant/expression arenas.
    fn fill_atoms(module: &Program, merged: &mut Program, remap: &ModuleRemap) {
        for atom_id in module.atoms_ordered() {
            let Some(&GlobalId::Atom(new_atom)) = remap.globals.get(&GlobalId::Atom(atom_id)) else {
                continue;
            };
            let atom = module.atom(atom_id);
            let items = atom
                .items
                .iter()
                .map(|item| Self::remap_item(item, module, merged, remap))
                .collect();
            merged.patch_atom(new_atom, atom.align, atom.visibility, items);
        }
    }

    fn remap_item(item: &ir::Item, module: &Program, merged: &mut Program, remap: &ModuleRemap) -> ir::Item {
        match item {
            ir::Item::Expr(id) => {
                let expr = module.expr(*id);
                let symbol = remap.globals.get(&expr.symbol).copied().unwrap_or(expr.symbol);
                ir::Item::Expr(merged.intern_expr(crate::constant::Expr {
                    symbol,
                    offset: expr.offset,
                }))
            }
            other => other.clone(),
        }
    }

    /// Copy every instruction body, remapping global operands through
    /// `remap.globals` and result-value operands through a per-call
    /// `inst_map` built incrementally as instructions are copied in
    /// program order. A result operand that refers to an instruction not
    /// yet copied (a loop back-edge feeding a `Phi`) is recorded as a
    /// fixup and patched once the whole module has been copied, mirroring
    /// the bitcode reader's forward-reference handling.
    fn fill_funcs(module: &Program, merged: &mut Program, remap: &mut ModuleRemap) {
        let mut fixups: Vec<(crate::inst::Inst, usize, crate::inst::Inst, u16)> = Vec::new();

        for (fid, func) in module.funcs() {
            // Only copy bodies into functions this module actually won
            // ownership of; a name that resolved to an earlier module's
            // definition keeps that module's body.
            let Some(&GlobalId::Func(new_fid)) = remap.globals.get(&GlobalId::Func(fid)) else {
                continue;
            };
            if !remap.owned_funcs.contains(&new_fid) {
                continue;
            }

            for (slot, &bid) in func.blocks.iter().enumerate() {
                let new_bid = merged.func(new_fid).blocks[slot];
                for &old_inst in &module.block(bid).insts {
                    let old_data = module.inst(old_inst);
                    let mut new_data = InstData::new(old_data.kind, new_bid);
                    new_data.rets = old_data.rets.clone();
                    new_data.annots = old_data.annots.clone();
                    new_data.payload = old_data.payload.clone();

                    for (slot_idx, operand) in old_data.operand_values().iter().enumerate() {
                        new_data.operands.push(Self::remap_operand(
                            *operand, module, merged, remap, old_inst, slot_idx, &mut fixups,
                        ));
                    }

                    let new_inst = merged.push_inst(new_bid, new_data);
                    remap.insts.insert(old_inst, new_inst);
                }
            }
        }

        for (new_inst, slot, old_referenced, result_slot) in fixups {
            if let Some(&new_referenced) = remap.insts.get(&old_referenced) {
                merged.replace_operand(new_inst, slot, ValueRef::Result(new_referenced, result_slot));
            }
        }
    }

    /// Walk from `entry` through every operand, expression symbol and
    /// data-item reference reachable from it (§4.5 step 4), returning the
    /// set of globals the output program should keep. Constructor and
    /// destructor entries are additional roots: like an `.init_array`
    /// entry, nothing in the IR calls them directly.
    fn transitive_closure(merged: &Program, entry: crate::ir::FuncId) -> std::collections::HashSet<GlobalId> {
        use std::collections::{HashSet, VecDeque};

        let mut keep: HashSet<GlobalId> = HashSet::new();
        let mut queue: VecDeque<GlobalId> = VecDeque::new();
        queue.push_back(GlobalId::Func(entry));
        for xtor in merged.xtors() {
            queue.push_back(xtor.func);
        }

        while let Some(gid) = queue.pop_front() {
            if !keep.insert(gid) {
                continue;
            }
            match gid {
                GlobalId::Func(fid) => {
                    let func = merged.func(fid);
                    if let Some(p) = func.personality {
                        queue.push_back(p);
                    }
                    for &bid in &func.blocks {
                        for &inst_id in &merged.block(bid).insts {
                            for operand in merged.inst(inst_id).operand_values() {
                                Self::enqueue_operand(merged, *operand, &mut queue);
                            }
                        }
                    }
                }
                GlobalId::Extern(eid) => {
                    if let Some(alias) = merged.extern_(eid).alias {
                        queue.push_back(alias);
                    }
                }
                GlobalId::Atom(aid) => {
                    for item in &merged.atom(aid).items {
                        if let ir::Item::Expr(eid) = item {
                            queue.push_back(merged.expr(*eid).symbol);
                        }
                    }
                }
                GlobalId::Block(_) => {}
            }
        }
        keep
    }

    fn enqueue_operand(merged: &Program, operand: ValueRef, queue: &mut std::collections::VecDeque<GlobalId>) {
        match operand {
            ValueRef::Global(g) => queue.push_back(g),
            ValueRef::Expr(eid) => queue.push_back(merged.expr(eid).symbol),
            ValueRef::Result(_, _) | ValueRef::Const(_) => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn remap_operand(
        operand: ValueRef,
        module: &Program,
        merged: &mut Program,
        remap: &ModuleRemap,
        owner: crate::inst::Inst,
        slot: usize,
        fixups: &mut Vec<(crate::inst::Inst, usize, crate::inst::Inst, u16)>,
    ) -> ValueRef {
        match operand {
            ValueRef::Global(g) => ValueRef::Global(remap.globals.get(&g).copied().unwrap_or(g)),
            ValueRef::Const(id) => ValueRef::Const(merged.intern_const(module.constant(id))),
            ValueRef::Expr(id) => {
                let expr = module.expr(id);
                let symbol = remap.globals.get(&expr.symbol).copied().unwrap_or(expr.symbol);
                ValueRef::Expr(merged.intern_expr(crate::constant::Expr {
                    symbol,
                    offset: expr.offset,
                }))
            }
            ValueRef::Result(old_referenced, result_slot) => {
                if let Some(&new_referenced) = remap.insts.get(&old_referenced) {
                    ValueRef::Result(new_referenced, result_slot)
                } else {
                    // Will be patched once the referenced instruction has
                    // been copied; `owner` is the new instruction, filled
                    // in by the caller after `push_inst` returns its id.
                    fixups.push((owner, slot, old_referenced, result_slot));
                    ValueRef::Const(crate::constant::ConstId::from_u32(0))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Func, Placement};
    use crate::types::CallingConv;

    fn empty_func(name: &str, vis: Visibility) -> Func {
        Func {
            name: name.to_string(),
            visibility: vis,
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
    fn links_single_module_with_entry() {
        let target = Target::default();
        let mut module = Program::new("m", target.clone());
        module.add_func(empty_func("main", Visibility::GlobalDefault), Placement::Append).unwrap();

        let mut linker = Linker::new("main", target);
        linker.add_module(module);
        let outcome = linker.link().unwrap();
        let merged = outcome.program.unwrap();
        assert!(merged.resolve("main").is_some());
    }

    #[test]
    fn missing_entry_point_errors() {
        let target = Target::default();
        let mut module = Program::new("m", target.clone());
        module.add_func(empty_func("other", Visibility::GlobalDefault), Placement::Append).unwrap();

        let mut linker = Linker::new("main", target);
        linker.add_module(module);
        assert_eq!(linker.link().unwrap_err(), Error::MissingEntry("main".into()));
    }

    #[test]
    fn duplicate_strong_symbols_across_modules_error() {
        let target = Target::default();
        let mut m1 = Program::new("m1", target.clone());
        m1.add_func(empty_func("f", Visibility::GlobalDefault), Placement::Append).unwrap();
        let mut m2 = Program::new("m2", target.clone());
        m2.add_func(empty_func("f", Visibility::GlobalDefault), Placement::Append).unwrap();

        let mut linker = Linker::new("f", target);
        linker.add_module(m1);
        linker.add_module(m2);
        assert_eq!(linker.link().unwrap_err(), Error::DuplicateSymbol("f".into()));
    }

    #[test]
    fn weak_definition_yields_to_strong_one() {
        let target = Target::default();
        let mut m1 = Program::new("m1", target.clone());
        m1.add_func(empty_func("f", Visibility::WeakDefault), Placement::Append).unwrap();
        let mut m2 = Program::new("m2", target.clone());
        m2.add_func(empty_func("f", Visibility::GlobalDefault), Placement::Append).unwrap();

        let mut linker = Linker::new("f", target);
        linker.add_module(m1);
        linker.add_module(m2);
        let outcome = linker.link().unwrap();
        assert!(outcome.program.is_some());
    }

    #[test]
    fn phi_back_edge_across_merge_resolves_to_copied_result() {
        use crate::inst::Opcode;
        use crate::types::Type;

        let target = Target::default();
        let mut module = Program::new("m", target.clone());
        let fid = module
            .add_func(empty_func("loopy", Visibility::GlobalDefault), Placement::Append)
            .unwrap();
        let entry = module.add_block(fid, "entry");
        let header = module.add_block(fid, "header");

        let mut jmp = InstData::new(Opcode::Jump, entry);
        jmp.operands.push(ValueRef::Global(GlobalId::Block(header)));
        module.push_inst(entry, jmp);

        let mut phi = InstData::new(Opcode::Phi, header);
        phi.rets.push(Type::I64);
        phi.operands.push(ValueRef::Global(GlobalId::Block(entry)));
        phi.operands.push(ValueRef::Const(module.intern_const(crate::constant::Constant::Int(Type::I64, 0))));
        let phi_inst = module.push_inst(header, phi);

        let mut add = InstData::new(Opcode::Add, header);
        add.rets.push(Type::I64);
        add.operands.push(ValueRef::Result(phi_inst, 0));
        add.operands.push(ValueRef::Const(module.intern_const(crate::constant::Constant::Int(Type::I64, 1))));
        let add_inst = module.push_inst(header, add);

        module.replace_operand(phi_inst, 1, ValueRef::Result(add_inst, 0));

        let mut linker = Linker::new("loopy", target);
        linker.add_module(module);
        let outcome = linker.link().unwrap();
        let merged = outcome.program.unwrap();

        let fid = merged.resolve("loopy").unwrap().as_func().unwrap();
        let header_bid = merged.func(fid).blocks[1];
        let insts = &merged.block(header_bid).insts;
        let new_phi = insts[0];
        let new_add = insts[1];
        assert_eq!(merged.inst(new_phi).phi_incoming()[1].1, ValueRef::Result(new_add, 0));
    }
}
