//! End-to-end scenarios spanning the codec, the linker and the tag
//! analysis together, the way a consumer of this crate would exercise it:
//! build or decode a `Program`, link several of them, then read results
//! back off the merged program. Unit tests colocated with each module
//! cover that module's internals; these exercise the crate's public
//! surface the way `scenarios 1-6 in §8 of the originating spec describe.

use llir_core::bitcode::{read_program, write_program, Archive};
use llir_core::inst::{InstData, Opcode};
use llir_core::ir::{Extern, Func, GlobalId, Item, Placement, Program};
use llir_core::link::Linker;
use llir_core::tags::{self, TaggedType};
use llir_core::target::Target;
use llir_core::types::{CallingConv, Type, Visibility};
use llir_core::value::ValueRef;

fn target() -> Target {
    Target::default()
}

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

/// Scenario 1: an empty, nameless-of-symbols program round-trips through
/// the bitcode codec byte-for-byte on re-encode.
#[test]
fn empty_program_round_trips_byte_identical_on_reencode() {
    let prog = Program::new("t", target());
    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    assert_eq!(decoded.name, "t");
    assert_eq!(decoded.funcs().count(), 0);
    assert_eq!(decoded.externs_ordered().len(), 0);

    let reencoded = write_program(&decoded);
    assert_eq!(bytes, reencoded);
}

/// Scenario 2: a single extern with no alias and no section decodes back
/// to the same shape, and survives a subsequent link that resolves it
/// against a real definition.
#[test]
fn single_extern_round_trips_and_resolves_against_a_definition() {
    let mut prog = Program::new("caller", target());
    prog.add_extern(Extern {
        name: "puts".into(),
        visibility: Visibility::GlobalDefault,
        alias: None,
        section: None,
    })
    .unwrap();
    let fid = prog
        .add_func(empty_func("main", Visibility::GlobalDefault), Placement::Append)
        .unwrap();
    let entry = prog.add_block(fid, "entry");
    let mut call = InstData::new(Opcode::Call, entry);
    call.payload = llir_core::inst::Payload::CallSite { cc: CallingConv::C, fixed_args: None };
    call.operands.push(ValueRef::Global(prog.resolve("puts").unwrap()));
    let cont = prog.add_block(fid, "cont");
    call.operands.push(ValueRef::Global(GlobalId::Block(cont)));
    prog.push_inst(entry, call);
    let ret = InstData::new(Opcode::Return, cont);
    prog.push_inst(cont, ret);

    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    assert!(decoded.resolve("puts").is_some());

    let mut definer = Program::new("libc", target());
    definer
        .add_func(empty_func("puts", Visibility::GlobalDefault), Placement::Append)
        .unwrap();

    let mut linker = Linker::new("main", target());
    linker.add_module(decoded);
    linker.add_module(definer);
    let outcome = linker.link().unwrap();
    let merged = outcome.program.unwrap();

    assert!(merged.resolve("puts").unwrap().as_func().is_some());
    assert!(merged.externs_ordered().is_empty(), "extern must be resolved away, not carried through");
}

/// Scenario 6: an archive built from two programs exposes the
/// magic/count/(size,offset)-pair directory layout, and every member
/// decodes back to its original program.
#[test]
fn archive_of_two_programs_round_trips_each_member() {
    let p1 = Program::new("p1", target());
    let mut p2 = Program::new("p2", target());
    p2.add_extern(Extern {
        name: "exit".into(),
        visibility: Visibility::GlobalDefault,
        alias: None,
        section: Some(".text.exit".into()),
    })
    .unwrap();

    let mut archive = Archive::new();
    archive.add_member("p1.o", write_program(&p1));
    archive.add_member("p2.o", write_program(&p2));
    let bytes = archive.write();

    assert!(llir_core::bitcode::is_llar_archive(&bytes));
    let decoded_archive = Archive::read(&bytes).unwrap();
    let programs = decoded_archive.decode_all(&target()).unwrap();
    assert_eq!(programs.len(), 2);
    assert_eq!(programs[0].name, "p1");
    assert_eq!(programs[1].name, "p2");
    let ext = programs[1].extern_(programs[1].resolve("exit").unwrap().as_extern().unwrap());
    assert_eq!(ext.section.as_deref(), Some(".text.exit"));
}

/// An extern with an explicit section survives a round trip through the
/// bitcode codec (§4.4 item 8's has-section flag plus optional name).
#[test]
fn extern_section_name_round_trips() {
    let mut prog = Program::new("p", target());
    prog.add_extern(Extern {
        name: "environ".into(),
        visibility: Visibility::GlobalDefault,
        alias: None,
        section: Some(".data.rel.ro".into()),
    })
    .unwrap();

    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    let eid = decoded.resolve("environ").unwrap().as_extern().unwrap();
    assert_eq!(decoded.extern_(eid).section.as_deref(), Some(".data.rel.ro"));
}

/// Scenario 5: module A declares `extern foo`, module B defines it; after
/// linking with an entry in A that calls it, the merged program contains
/// `foo` as a Func (not an Extern), and every former use in A now points
/// at B's definition.
#[test]
fn linker_resolves_extern_against_cross_module_definition() {
    let mut a = Program::new("a", target());
    a.add_extern(Extern {
        name: "foo".into(),
        visibility: Visibility::GlobalDefault,
        alias: None,
        section: None,
    })
    .unwrap();
    let main_fid = a.add_func(empty_func("main", Visibility::GlobalDefault), Placement::Append).unwrap();
    let entry = a.add_block(main_fid, "entry");
    let mut call = InstData::new(Opcode::TailCall, entry);
    call.payload = llir_core::inst::Payload::CallSite { cc: CallingConv::C, fixed_args: None };
    call.operands.push(ValueRef::Global(a.resolve("foo").unwrap()));
    a.push_inst(entry, call);

    let mut b = Program::new("b", target());
    b.add_func(empty_func("foo", Visibility::GlobalDefault), Placement::Append).unwrap();

    let mut linker = Linker::new("main", target());
    linker.add_module(a);
    linker.add_module(b);
    let outcome = linker.link().unwrap();
    let merged = outcome.program.unwrap();

    assert!(merged.externs_ordered().is_empty());
    let foo = merged.resolve("foo").unwrap();
    assert!(foo.as_func().is_some());

    let main_fid = merged.resolve("main").unwrap().as_func().unwrap();
    let entry = merged.func(main_fid).blocks[0];
    let call_inst = merged.block(entry).insts[0];
    assert_eq!(merged.inst(call_inst).call_callee(), ValueRef::Global(foo));
}

/// Scenario 3: `f` tail-calls `g`, which returns an exact integer; the
/// analysis folds that straight into `f`'s own tail-call result, without
/// needing a separate `Return` in `f` to observe the value through.
#[test]
fn tail_call_chain_propagates_callee_return_type_through_codec_and_analysis() {
    let mut prog = Program::new("m", target());

    let gid = prog.add_func(empty_func("g", Visibility::GlobalDefault), Placement::Append).unwrap();
    let g_entry = prog.add_block(gid, "entry");
    let mut ret = InstData::new(Opcode::Return, g_entry);
    ret.operands.push(ValueRef::Const(prog.intern_const(llir_core::constant::Constant::Int(Type::I64, 42))));
    prog.push_inst(g_entry, ret);

    let fid = prog.add_func(empty_func("f", Visibility::GlobalDefault), Placement::Append).unwrap();
    let f_entry = prog.add_block(fid, "entry");
    let mut tail = InstData::new(Opcode::TailCall, f_entry);
    tail.rets.push(Type::I64);
    tail.payload = llir_core::inst::Payload::CallSite { cc: CallingConv::C, fixed_args: None };
    tail.operands.push(ValueRef::Global(GlobalId::Func(gid)));
    let tail_id = prog.push_inst(f_entry, tail);

    // Round-trip through the codec before analyzing, exercising the full
    // pipeline a consumer actually drives: decode, then analyze.
    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    let assignment = tags::analyze(&decoded).unwrap();

    let f_fid = decoded.resolve("f").unwrap().as_func().unwrap();
    let f_entry = decoded.func(f_fid).blocks[0];
    let tail_in_decoded = decoded.block(f_entry).insts[0];
    assert_eq!(tail_in_decoded, tail_id, "instruction indices are stable across a round trip with one function");
    match assignment.get(tail_in_decoded, 0) {
        TaggedType::Int(m) => assert_eq!(m.value(), 42),
        other => panic!("expected an exact Int(42), got {other:?}"),
    }
}

/// A program with a data segment carrying a `string` and an `expr` item
/// round-trips through the codec, including the symbol+offset reference.
#[test]
fn data_segment_with_string_and_symbol_offset_expr_round_trips() {
    let mut prog = Program::new("p", target());
    let fid = prog.add_func(empty_func("target", Visibility::GlobalDefault), Placement::Append).unwrap();
    prog.add_block(fid, "entry");

    let data_id = prog.get_or_create_data(".rodata");
    let object_id = prog.add_object(data_id);
    let expr_id = prog.intern_expr(llir_core::constant::Expr {
        symbol: GlobalId::Func(fid),
        offset: 8,
    });
    prog.add_atom(
        object_id,
        llir_core::ir::Atom {
            name: "msg".into(),
            align: 8,
            visibility: Visibility::Local,
            items: vec![Item::String("hello".into()), Item::Expr(expr_id)],
            parent: object_id,
        },
    )
    .unwrap();

    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    let segs = decoded.data_segments_ordered();
    assert_eq!(segs.len(), 1);
    assert_eq!(segs[0].name, ".rodata");
    let atom_id = decoded.object(segs[0].objects[0]).atoms[0];
    let atom = decoded.atom(atom_id);
    assert_eq!(atom.items.len(), 2);
    match &atom.items[0] {
        Item::String(s) => assert_eq!(s, "hello"),
        other => panic!("expected a string item, got {other:?}"),
    }
    match &atom.items[1] {
        Item::Expr(id) => {
            let expr = decoded.expr(*id);
            assert_eq!(expr.offset, 8);
            assert_eq!(expr.symbol.as_func(), Some(fid));
        }
        other => panic!("expected an expr item, got {other:?}"),
    }
}

/// An empty function (no blocks at all) round-trips, per §8's boundary
/// behaviors.
#[test]
fn empty_function_with_no_blocks_round_trips() {
    let mut prog = Program::new("p", target());
    prog.add_func(empty_func("noop", Visibility::GlobalDefault), Placement::Append).unwrap();

    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    let fid = decoded.resolve("noop").unwrap().as_func().unwrap();
    assert!(decoded.func(fid).blocks.is_empty());
}

/// A function's personality routine (an extern, the common case for
/// `__gxx_personality_v0`-style unwinders) round-trips through the codec
/// and survives a link against the module that defines it.
#[test]
fn function_personality_round_trips_and_resolves_through_link() {
    let mut prog = Program::new("p", target());
    prog.add_extern(Extern {
        name: "__gxx_personality_v0".into(),
        visibility: Visibility::GlobalDefault,
        alias: None,
        section: None,
    })
    .unwrap();
    let personality = prog.resolve("__gxx_personality_v0").unwrap();

    let mut main = empty_func("main", Visibility::GlobalDefault);
    main.personality = Some(personality);
    prog.add_func(main, Placement::Append).unwrap();

    let bytes = write_program(&prog);
    let decoded = read_program(&bytes, target()).unwrap();
    let fid = decoded.resolve("main").unwrap().as_func().unwrap();
    assert_eq!(decoded.func(fid).personality, decoded.resolve("__gxx_personality_v0"));

    let mut unwinder = Program::new("libstdc++", target());
    unwinder
        .add_func(empty_func("__gxx_personality_v0", Visibility::GlobalDefault), Placement::Append)
        .unwrap();

    let mut linker = Linker::new("main", target());
    linker.add_module(decoded);
    linker.add_module(unwinder);
    let outcome = linker.link().unwrap();
    let merged = outcome.program.unwrap();

    let main_fid = merged.resolve("main").unwrap().as_func().unwrap();
    let personality_fid = merged.resolve("__gxx_personality_v0").unwrap().as_func().unwrap();
    assert_eq!(merged.func(main_fid).personality, Some(GlobalId::Func(personality_fid)));
}
