//! Bitcode decoding (§4.4): turns a byte buffer into a [`Program`].
//!
//! Unlike the LLVM bitstream format this crate's teacher parses, this
//! format has a fixed, non-bit-packed layout: every field is read in the
//! exact order it was written, with no abbreviation table or block
//! structure to navigate. Global references use a flat table built while
//! symbol names are read, and a function's instruction results are
//! referenced through a flat `result_map`, one entry per return value of
//! each instruction decoded so far, mirroring the `map` vector the format
//! this is modelled on builds while each block's instructions are
//! appended.

use super::cursor::Reader as Cursor;
use super::error::{Error, Result};
use super::{value_tag, LLIR_MAGIC};
use crate::constant::{Constant, Expr, Reg};
use crate::inst::{Inst, InstData, Opcode, Payload};
use crate::ir::{Atom, BlockId, Extern, Func, FuncId, GlobalId, Item, Placement, Program, Xtor};
use crate::target::Target;
use crate::types::{
    Annot, AnnotSet, CallingConv, CondCode, DebugInfo, Param, ParamFlags, Type, Visibility,
    XtorKind,
};
use crate::value::ValueRef;

/// Decode a whole program from `buf`.
pub fn read_program(buf: &[u8], target: Target) -> Result<Program> {
    let mut c = Cursor::new(buf);

    let magic = c.u32("magic")?;
    if magic != LLIR_MAGIC {
        return Err(Error::BadMagic {
            expected: LLIR_MAGIC,
            found: magic,
        });
    }

    let name = c.string("program name")?;
    let mut prog = Program::new(name, target);

    // Flat table of every global in declaration order: externs, then
    // atoms (in data/object order), then functions.
    let mut globals: Vec<GlobalId> = Vec::new();

    let n_externs = c.u32("extern count")?;
    for _ in 0..n_externs {
        let name = c.string("extern name")?;
        let id = prog
            .add_extern(Extern {
                name,
                visibility: Visibility::GlobalDefault,
                alias: None,
                section: None,
            })
            ?;
        globals.push(GlobalId::Extern(id));
    }

    let n_data = c.u32("data segment count")?;
    for _ in 0..n_data {
        let seg_name = c.string("data segment name")?;
        let data_id = prog.get_or_create_data(&seg_name);
        let n_objects = c.u32("object count")?;
        for _ in 0..n_objects {
            let object_id = prog.add_object(data_id);
            let n_atoms = c.u32("atom count")?;
            for _ in 0..n_atoms {
                let atom_name = c.string("atom name")?;
                let id = prog
                    .add_atom(
                        object_id,
                        Atom {
                            name: atom_name,
                            align: 0,
                            visibility: Visibility::GlobalDefault,
                            items: Vec::new(),
                            parent: object_id,
                        },
                    )
                    ?;
                globals.push(GlobalId::Atom(id));
            }
        }
    }

    let n_funcs = c.u32("function count")?;
    let mut func_ids: Vec<FuncId> = Vec::with_capacity(n_funcs as usize);
    for _ in 0..n_funcs {
        let fname = c.string("function name")?;
        let fid = prog
            .add_func(
                Func {
                    name: fname,
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
            ?;
        globals.push(GlobalId::Func(fid));
        func_ids.push(fid);

        let n_blocks = c.u32("block count")?;
        for _ in 0..n_blocks {
            let bname = c.string("block name")?;
            let _vis = read_visibility(&mut c)?; // blocks carry no visibility in this core's data model
            let bid = prog.add_block(fid, bname);
            globals.push(GlobalId::Block(bid));
        }
    }

    let atom_globals: Vec<_> = globals.iter().filter_map(|g| g.as_atom()).collect();
    for atom_id in atom_globals {
        read_atom_body(&mut c, &mut prog, atom_id, &globals)?;
    }

    for fid in func_ids {
        read_func_body(&mut c, &mut prog, fid, &globals)?;
    }

    let extern_globals: Vec<_> = globals.iter().filter_map(|g| g.as_extern()).collect();
    for ext_id in extern_globals {
        let vis = read_visibility(&mut c)?;
        let alias_idx = c.u32("extern alias index")?;
        let alias = if alias_idx == 0 {
            None
        } else {
            Some(*resolve_global(&globals, alias_idx - 1, "extern alias")?)
        };
        let has_section = c.u8("extern has-section flag")?;
        let section = if has_section == 0 {
            None
        } else {
            Some(c.string("extern section name")?)
        };
        prog.patch_extern(ext_id, vis, alias, section);
    }

    let n_xtors = c.u32("xtor count")?;
    for _ in 0..n_xtors {
        let priority = c.i32("xtor priority")?;
        let kind = match c.u8("xtor kind")? {
            0 => XtorKind::Ctor,
            1 => XtorKind::Dtor,
            v => return Err(Error::BadDiscriminant { context: "xtor kind", value: v as u32 }),
        };
        let func_idx = c.u32("xtor function index")?;
        let func = *resolve_global(&globals, func_idx, "xtor function")?;
        prog.add_xtor(Xtor { priority, kind, func });
    }

    Ok(prog)
}

fn resolve_global<'a>(globals: &'a [GlobalId], index: u32, context: &'static str) -> Result<&'a GlobalId> {
    globals.get(index as usize).ok_or(Error::BadIndex {
        context,
        index,
        len: globals.len() as u32,
    })
}

fn read_visibility(c: &mut Cursor) -> Result<Visibility> {
    let v = c.u8("visibility")?;
    Visibility::try_from(v).map_err(|_| Error::BadDiscriminant { context: "visibility", value: v as u32 })
}

fn read_type(c: &mut Cursor) -> Result<Type> {
    let v = c.u8("type")?;
    Type::try_from(v).map_err(|_| Error::BadDiscriminant { context: "type", value: v as u32 })
}

fn read_atom_body(c: &mut Cursor, prog: &mut Program, atom_id: crate::ir::AtomId, globals: &[GlobalId]) -> Result<()> {
    let align = c.u32("atom alignment")?;
    let visibility = read_visibility(c)?;
    let n_items = c.u32("item count")?;
    let mut items = Vec::with_capacity(n_items as usize);
    for _ in 0..n_items {
        let kind = c.u8("item kind")?;
        let item = match kind {
            0 => Item::Int8(c.u8("int8 item")? as i8),
            1 => Item::Int16(c.u16("int16 item")? as i16),
            2 => Item::Int32(c.i32("int32 item")?),
            3 => Item::Int64(c.i64("int64 item")?),
            4 => Item::Float64(c.u64("float64 item")?),
            5 => Item::Align(c.u32("align item")?),
            6 => Item::Space(c.u32("space item")?),
            7 => Item::String(c.string("string item")?),
            8 => {
                let sym_idx = c.u32("expr symbol index")?;
                let symbol = *resolve_global(globals, sym_idx, "expr symbol")?;
                let offset = c.i64("expr offset")?;
                Item::Expr(prog.intern_expr(Expr { symbol, offset }))
            }
            v => return Err(Error::BadDiscriminant { context: "item kind", value: v as u32 }),
        };
        items.push(item);
    }
    prog.patch_atom(atom_id, align, visibility, items);
    Ok(())
}

fn read_func_body(c: &mut Cursor, prog: &mut Program, fid: FuncId, globals: &[GlobalId]) -> Result<()> {
    let visibility = read_visibility(c)?;
    let cc = {
        let v = c.u8("calling convention")?;
        CallingConv::try_from(v)
            .map_err(|_| Error::BadDiscriminant { context: "calling convention", value: v as u32 })?
    };
    let is_vararg = c.u8("vararg flag")? != 0;
    let is_noinline = c.u8("noinline flag")? != 0;
    let alignment = c.u32("function alignment")?;
    let cpu = c.string("function cpu")?;
    let tune_cpu = c.string("function tune-cpu")?;
    let features = c.string("function features")?;
    let personality_idx = c.u32("personality index")?;
    let personality = if personality_idx == 0 {
        None
    } else {
        Some(*resolve_global(globals, personality_idx - 1, "personality")?)
    };

    let n_stack = c.u16("stack object count")?;
    let mut stack_objects = Vec::with_capacity(n_stack as usize);
    for _ in 0..n_stack {
        let _index = c.u16("stack object index")?;
        let size = c.u32("stack object size")?;
        let align = c.u32("stack object alignment")?;
        stack_objects.push((size, align));
    }

    let n_params = c.u16("parameter count")?;
    let mut params = Vec::with_capacity(n_params as usize);
    for _ in 0..n_params {
        let ty = read_type(c)?;
        let flags = ParamFlags::from_bits_truncate(c.u8("parameter flags")?);
        params.push(Param { ty, flags });
    }

    prog.patch_func_header(
        fid, visibility, cc, is_vararg, is_noinline, personality, params, stack_objects, alignment, cpu, tune_cpu,
        features,
    );

    let block_ids: Vec<BlockId> = prog.func(fid).blocks.clone();
    let mut result_map: Vec<ValueRef> = Vec::new();
    // A phi argument may reference a result that hasn't been decoded yet
    // (a loop back edge); those slots are patched once the whole function
    // has been read and `result_map` is complete.
    let mut fixups: Vec<(Inst, usize, u32)> = Vec::new();

    for block_id in block_ids {
        let n_insts = c.u32("instruction count")?;
        for _ in 0..n_insts {
            let (mut data, result_fixups) = read_inst(c, block_id, &result_map, globals, prog)?;
            let n_rets = data.rets.len();
            // Reserve operand slots for deferred phi fixups so the vector
            // has the right shape before `push_inst` records use-edges.
            for (slot, _) in &result_fixups {
                if *slot >= data.operands.len() {
                    data.operands.resize(slot + 1, ValueRef::Const(crate::constant::ConstId::from_u32(0)));
                }
            }
            let inst_id = prog.push_inst(block_id, data);
            for slot in 0..n_rets {
                result_map.push(ValueRef::Result(inst_id, slot as u16));
            }
            for (operand_slot, index) in result_fixups {
                fixups.push((inst_id, operand_slot, index));
            }
        }
    }

    for (inst_id, slot, index) in fixups {
        let value = *result_map.get(index as usize).ok_or(Error::BadIndex {
            context: "phi result reference",
            index,
            len: result_map.len() as u32,
        })?;
        prog.replace_operand(inst_id, slot, value);
    }

    Ok(())
}

/// One decoded value operand, tagged so the caller can tell a resolved
/// reference apart from a phi argument still waiting on a forward result.
enum DecodedValue {
    Resolved(ValueRef),
    PendingResult(u32),
}

fn read_value(
    c: &mut Cursor,
    result_map: &[ValueRef],
    globals: &[GlobalId],
    prog: &mut Program,
    allow_forward_result: bool,
) -> Result<DecodedValue> {
    let tag = c.u8("value tag")?;
    match tag {
        value_tag::RESULT => {
            let index = c.u32("result index")?;
            if let Some(v) = result_map.get(index as usize) {
                Ok(DecodedValue::Resolved(*v))
            } else if allow_forward_result {
                Ok(DecodedValue::PendingResult(index))
            } else {
                Err(Error::BadIndex { context: "result reference", index, len: result_map.len() as u32 })
            }
        }
        value_tag::GLOBAL => {
            let index = c.u32("global index")?;
            let global = *resolve_global(globals, index, "value global")?;
            Ok(DecodedValue::Resolved(ValueRef::Global(global)))
        }
        value_tag::CONST => {
            let kind = c.u8("constant kind")?;
            let constant = match kind {
                0 => {
                    let ty = read_type(c)?;
                    Constant::Int(ty, c.i64("constant int")?)
                }
                1 => {
                    let ty = read_type(c)?;
                    Constant::Float(ty, c.u64("constant float bits")?)
                }
                2 => Constant::Reg(Reg(c.u8("constant register")?)),
                v => return Err(Error::BadDiscriminant { context: "constant kind", value: v as u32 }),
            };
            Ok(DecodedValue::Resolved(ValueRef::Const(prog.intern_const(constant))))
        }
        value_tag::EXPR => {
            let sym_idx = c.u32("expr symbol index")?;
            let symbol = *resolve_global(globals, sym_idx, "expr symbol")?;
            let offset = c.i64("expr offset")?;
            Ok(DecodedValue::Resolved(ValueRef::Expr(prog.intern_expr(Expr { symbol, offset }))))
        }
        v => Err(Error::BadDiscriminant { context: "value tag", value: v as u32 }),
    }
}

fn read_cond_code(c: &mut Cursor) -> Result<CondCode> {
    let v = c.u8("condition code")?;
    CondCode::try_from(v).map_err(|_| Error::BadDiscriminant { context: "condition code", value: v as u32 })
}

fn read_annot(c: &mut Cursor) -> Result<Annot> {
    let kind = c.u8("annotation kind")?;
    match kind {
        0 => {
            let n_allocas = c.u32("camlframe alloca count")?;
            let mut allocas = Vec::with_capacity(n_allocas as usize);
            for _ in 0..n_allocas {
                allocas.push(c.u32("camlframe alloca")?);
            }
            let n_debug = c.u32("camlframe debug info count")?;
            let mut debug_infos = Vec::with_capacity(n_debug as usize);
            for _ in 0..n_debug {
                debug_infos.push(DebugInfo {
                    location: c.u32("debug info location")?,
                    file: c.string("debug info file")?,
                    definition: c.string("debug info definition")?,
                });
            }
            Ok(Annot::CamlFrame { allocas, debug_infos })
        }
        1 => Ok(Annot::Probability {
            n: c.u32("probability numerator")?,
            d: c.u32("probability denominator")?,
        }),
        v => Err(Error::BadDiscriminant { context: "annotation kind", value: v as u32 }),
    }
}

/// Decode one instruction, returning phi/forward-result operand slots
/// (`(slot, result_map index)`) that couldn't be resolved immediately.
fn read_inst(
    c: &mut Cursor,
    parent: BlockId,
    result_map: &[ValueRef],
    globals: &[GlobalId],
    prog: &mut Program,
) -> Result<(InstData, Vec<(usize, u32)>)> {
    let n_annots = c.u8("annotation count")?;
    let mut annots = AnnotSet::new();
    for _ in 0..n_annots {
        annots.push(read_annot(c)?);
    }

    let n_types = c.u8("return type count")?;
    let mut rets = smallvec::SmallVec::new();
    for _ in 0..n_types {
        rets.push(read_type(c)?);
    }

    let opcode_byte = c.u8("opcode")?;
    let opcode = Opcode::try_from(opcode_byte).map_err(|_| Error::UnknownOpcode(opcode_byte))?;

    let mut data = InstData::new(opcode, parent);
    data.rets = rets;
    data.annots = annots;

    let mut fixups = Vec::new();

    if opcode == Opcode::Phi {
        let n = c.u16("phi pair count")?;
        if n % 2 != 0 {
            return Err(Error::BadDiscriminant { context: "phi operand count", value: n as u32 });
        }
        for pair in 0..n / 2 {
            match read_value(c, result_map, globals, prog, false)? {
                DecodedValue::Resolved(block_ref) => data.operands.push(block_ref),
                DecodedValue::PendingResult(_) => {
                    return Err(Error::BadDiscriminant { context: "phi predecessor", value: pair as u32 })
                }
            }
            match read_value(c, result_map, globals, prog, true)? {
                DecodedValue::Resolved(v) => data.operands.push(v),
                DecodedValue::PendingResult(index) => {
                    let slot = data.operands.len();
                    data.operands.push(ValueRef::Const(crate::constant::ConstId::from_u32(0)));
                    fixups.push((slot, index));
                }
            }
        }
        return Ok((data, fixups));
    }

    let n_operands = c.u16("operand count")?;
    for _ in 0..n_operands {
        match read_value(c, result_map, globals, prog, false)? {
            DecodedValue::Resolved(v) => data.operands.push(v),
            DecodedValue::PendingResult(_) => unreachable!("forward refs are only permitted on phi arguments"),
        }
    }

    data.payload = match opcode {
        Opcode::Cmp => Payload::Cmp { cc: read_cond_code(c)? },
        Opcode::Call | Opcode::TailCall | Opcode::Invoke => {
            let cc_byte = c.u8("call convention")?;
            let cc = CallingConv::try_from(cc_byte)
                .map_err(|_| Error::BadDiscriminant { context: "call convention", value: cc_byte as u32 })?;
            let has_fixed = c.u8("call fixed-arg marker")?;
            let fixed_args = if has_fixed == 0 { None } else { Some(c.u16("call fixed-arg count")? ) };
            Payload::CallSite { cc, fixed_args }
        }
        Opcode::Frame => Payload::Frame {
            index: c.u16("frame index")?,
            offset: c.i64("frame offset")?,
        },
        Opcode::Alloca => Payload::Alloca { align: c.u32("alloca alignment")? },
        Opcode::Arg => Payload::Arg { index: c.u32("argument index")? },
        Opcode::ArchSpecific => Payload::ArchSpecific { mnemonic: c.string("arch-specific mnemonic")? },
        _ => Payload::None,
    };

    Ok((data, fixups))
}
