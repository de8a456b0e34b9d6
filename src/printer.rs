//! Textual debug dump (§6.5): `Program::dump` writes every symbol name,
//! block name, and instruction kind in program order. The format is not
//! machine-readable and carries no stability guarantee across versions of
//! this crate — it exists for diagnostics, the way `cranelift`'s
//! `write_function` exists to eyeball a `Function` rather than to be
//! re-parsed.

use std::io::{self, Write};

use crate::constant::Constant;
use crate::inst::{InstData, Payload};
use crate::ir::{GlobalId, Item, Program};
use crate::types::Annot;
use crate::value::ValueRef;

impl Program {
    /// Write a human-readable dump of this program to `out`.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        write_program(self, out)
    }
}

fn write_program(prog: &Program, out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "program {} ({:?})", prog.name, prog.target.arch())?;

    for (_, ext) in prog.externs_ordered() {
        write!(out, "extern {:?} {}", ext.visibility, ext.name)?;
        if let Some(alias) = ext.alias {
            write!(out, " = {}", global_name(prog, alias))?;
        }
        if let Some(section) = &ext.section {
            write!(out, " section({section})")?;
        }
        writeln!(out)?;
    }

    for seg in prog.data_segments_ordered() {
        writeln!(out, "data {} {{", seg.name)?;
        for &object_id in &seg.objects {
            writeln!(out, "  object {{")?;
            for &atom_id in &prog.object(object_id).atoms {
                write_atom(prog, out, atom_id)?;
            }
            writeln!(out, "  }}")?;
        }
        writeln!(out, "}}")?;
    }

    for (_, func) in prog.funcs() {
        write!(out, "func {:?} {:?}", func.visibility, func.calling_conv)?;
        write!(out, " {}(", func.name)?;
        for (i, param) in func.params.iter().enumerate() {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{:?}", param.ty)?;
        }
        if func.is_vararg {
            write!(out, ", ...")?;
        }
        write!(out, ")")?;
        if func.alignment != 0 {
            write!(out, " align({})", func.alignment)?;
        }
        if !func.cpu.is_empty() {
            write!(out, " cpu({})", func.cpu)?;
        }
        if let Some(p) = func.personality {
            write!(out, " personality({})", global_name(prog, p))?;
        }
        writeln!(out, " {{")?;

        for &bid in &func.blocks {
            let block = prog.block(bid);
            writeln!(out, "{}:", block.name)?;
            for &inst_id in &block.insts {
                write_inst(prog, out, prog.inst(inst_id))?;
            }
        }
        writeln!(out, "}}")?;
    }

    for xtor in prog.xtors() {
        writeln!(
            out,
            "{:?} priority={} {}",
            xtor.kind,
            xtor.priority,
            global_name(prog, xtor.func)
        )?;
    }

    Ok(())
}

fn write_atom(prog: &Program, out: &mut dyn Write, atom_id: crate::ir::AtomId) -> io::Result<()> {
    let atom = prog.atom(atom_id);
    write!(out, "    atom {:?} {} align={}", atom.visibility, atom.name, atom.align)?;
    if atom.items.is_empty() {
        return writeln!(out);
    }
    write!(out, " [")?;
    for (i, item) in atom.items.iter().enumerate() {
        if i > 0 {
            write!(out, ", ")?;
        }
        write_item(prog, out, item)?;
    }
    writeln!(out, "]")
}

fn write_item(prog: &Program, out: &mut dyn Write, item: &Item) -> io::Result<()> {
    match item {
        Item::Int8(v) => write!(out, "i8 {v}"),
        Item::Int16(v) => write!(out, "i16 {v}"),
        Item::Int32(v) => write!(out, "i32 {v}"),
        Item::Int64(v) => write!(out, "i64 {v}"),
        Item::Float64(bits) => write!(out, "f64 {}", f64::from_bits(*bits)),
        Item::Align(a) => write!(out, "align {a}"),
        Item::Space(n) => write!(out, "space {n}"),
        Item::String(s) => write!(out, "{s:?}"),
        Item::Expr(id) => {
            let expr = prog.expr(*id);
            write!(out, "{}+{}", global_name(prog, expr.symbol), expr.offset)
        }
    }
}

fn write_inst(prog: &Program, out: &mut dyn Write, inst: &InstData) -> io::Result<()> {
    write!(out, "    ")?;
    if inst.rets.len() == 1 {
        write!(out, "%<r> = ")?;
    } else if inst.rets.len() > 1 {
        write!(out, "(")?;
        for i in 0..inst.rets.len() {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "%<r{i}>")?;
        }
        write!(out, ") = ")?;
    }
    write!(out, "{:?}", inst.kind)?;

    if inst.kind == crate::inst::Opcode::Phi {
        for (block, value) in inst.phi_incoming() {
            write!(out, " [{}: {}]", prog.block(block).name, write_operand(prog, value))?;
        }
    } else {
        for operand in inst.operand_values() {
            write!(out, " {}", write_operand(prog, *operand))?;
        }
    }

    match &inst.payload {
        Payload::Cmp { cc } => write!(out, " cc={cc:?}")?,
        Payload::CallSite { cc, fixed_args } => {
            write!(out, " cc={cc:?}")?;
            if let Some(n) = fixed_args {
                write!(out, " fixed={n}")?;
            }
        }
        Payload::Frame { index, offset } => write!(out, " slot={index} off={offset}")?,
        Payload::Alloca { align } => write!(out, " align={align}")?,
        Payload::Arg { index } => write!(out, " #{index}")?,
        Payload::ArchSpecific { mnemonic } => write!(out, " {mnemonic:?}")?,
        Payload::None => {}
    }

    for annot in inst.annots.iter() {
        write_annot(out, annot)?;
    }

    writeln!(out)
}

fn write_annot(out: &mut dyn Write, annot: &Annot) -> io::Result<()> {
    match annot {
        Annot::CamlFrame { allocas, .. } => write!(out, " ; camlframe(allocas={})", allocas.len()),
        Annot::Probability { n, d } => write!(out, " ; prob={n}/{d}"),
    }
}

fn write_operand(prog: &Program, value: ValueRef) -> String {
    match value {
        ValueRef::Result(inst, slot) => format!("%{}.{}", inst.as_u32(), slot),
        ValueRef::Global(g) => format!("@{}", global_name(prog, g)),
        ValueRef::Const(id) => match prog.constant(id) {
            Constant::Int(ty, v) => format!("{v}:{ty:?}"),
            Constant::Float(ty, bits) => format!("{}:{ty:?}", f64::from_bits(bits)),
            Constant::Reg(reg) => format!("reg{}", reg.0),
        },
        ValueRef::Expr(id) => {
            let expr = prog.expr(id);
            format!("{}+{}", global_name(prog, expr.symbol), expr.offset)
        }
    }
}

fn global_name(prog: &Program, g: GlobalId) -> String {
    match g {
        GlobalId::Func(f) => prog.func(f).name.clone(),
        GlobalId::Extern(e) => prog.extern_(e).name.clone(),
        GlobalId::Atom(a) => prog.atom(a).name.clone(),
        GlobalId::Block(b) => prog.block(b).name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::{InstData, Opcode};
    use crate::ir::{Func, Placement};
    use crate::target::Target;
    use crate::types::{CallingConv, Type, Visibility};

    #[test]
    fn dump_contains_symbol_and_block_names_in_order() {
        let mut prog = Program::new("p", Target::default());
        let fid = prog
            .add_func(
                Func {
                    name: "main".into(),
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
        let bid = prog.add_block(fid, "entry");
        let mut ret = InstData::new(Opcode::Return, bid);
        ret.operands.push(ValueRef::Const(prog.intern_const(Constant::Int(Type::I32, 0))));
        prog.push_inst(bid, ret);

        let mut buf = Vec::new();
        prog.dump(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();

        assert!(text.contains("main"));
        assert!(text.contains("entry:"));
        assert!(text.contains("Return"));
        assert!(text.find("main").unwrap() < text.find("entry:").unwrap());
    }
}
