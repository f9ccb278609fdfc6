// End-to-end lowering scenarios: textual shaders compiled with the default key, checked
// both structurally (which instructions the module contains, in which order) and, where
// the result depends on per-lane state, by running the module on the lane interpreter in
// tests/common.

mod common;

use common::{compile, compile_err, compile_with, ssbo_addr, Machine, LANES};
use virgen::core::{CompileError, CompileKey, ErrorKind};
use virgen::lower::{allocate_with_fallback, LinearScan};
use virgen::vir::{
    BranchCond, Dst, Inst, Module, Opcode, Operand, TmuOp, TmuType, UniformContents, UpdateFlag,
    ValueKind, Waddr,
};

fn tmu_requests(module: &Module) -> Vec<&Inst> {
    module
        .instructions()
        .map(|(_, _, inst)| inst)
        .filter(|inst| matches!(inst.dst, Dst::Magic(Waddr::Tmuau | Waddr::Tmua)))
        .collect()
}

fn run(module: &Module) -> Machine<'_> {
    let mut machine = Machine::new(module);
    machine
        .run()
        .unwrap_or_else(|e| panic!("execution failed: {e}\n{module}"));
    machine
}

#[test]
fn test_ubo_vector_load_is_one_request() {
    let module = compile(
        "\
stage compute
%idx:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%v:32x2 = load_ubo %idx %lane
%sum:32x1 = iadd %v.x %v.y
store_ssbo %sum %idx %lane
",
    );

    let requests = tmu_requests(&module);
    // One load, one store.
    assert_eq!(requests.len(), 2, "{module}");
    let load = requests[0];
    let tag = load.tmu.expect("tagged request");
    assert_eq!(tag.op, TmuOp::Regular);
    assert_eq!(tag.ty, TmuType::Vec2);
    assert_eq!(tag.components, 2);

    // The dynamic offset is added to the buffer base right before the request.
    let insts: Vec<_> = module.instructions().map(|(_, _, inst)| inst).collect();
    let pos = insts
        .iter()
        .position(|inst| std::ptr::eq(*inst, load))
        .expect("request in the instruction stream");
    let add = insts[pos - 1];
    assert_eq!(add.op, Opcode::Add);
    assert_eq!(load.srcs[0], Operand::Temp(add.dst.temp().expect("temp address")));

    let base_uniform = module
        .uniforms
        .iter()
        .any(|(_, c)| matches!(c, UniformContents::UboAddr { index: 1, offset: 0 }));
    assert!(base_uniform, "UBO 0 maps to address uniform index 1");

    let ldtmu = insts.iter().filter(|inst| inst.op == Opcode::LdTmu).count();
    assert_eq!(ldtmu, 2);
}

#[test]
fn test_uniform_if_has_no_exec_mask() {
    let module = compile(
        "\
stage compute
%zero:32x1 = load_const 0
%u:32x1 = load_uniform %zero {base=0}
%c:1x1 = ilt %u %zero
if %c uniform {
  %one:32x1 = load_const 1
  store_ssbo %one %zero %zero
}
",
    );

    assert!(module.exec_masks.is_empty(), "{module}");
    let conditional: Vec<_> = module
        .instructions()
        .filter_map(|(_, _, inst)| inst.branch)
        .filter(|branch| branch.cond != BranchCond::Always)
        .collect();
    assert_eq!(conditional.len(), 1, "{module}");
    assert!(matches!(
        conditional[0].cond,
        BranchCond::AllA | BranchCond::AllNa
    ));
}

#[test]
fn test_uniform_if_branches_around_then_block() {
    let text = "\
stage compute
%zero:32x1 = load_const 0
%four:32x1 = load_const 4
%lane:32x1 = load_subgroup_id
%off:32x1 = ishl %lane %four
%u:32x1 = load_uniform %zero {base=0}
%c:1x1 = ieq %u %zero
if %c uniform {
  %seven:32x1 = load_const 7
  store_ssbo %seven %zero %off
} else {
  %nine:32x1 = load_const 9
  store_ssbo %nine %zero %off
}
";
    let module = compile(text);

    for (slot, expected) in [(0, 7), (3, 9)] {
        let mut machine = Machine::new(&module);
        machine.uniform_slots.insert(0, slot);
        machine.run().unwrap_or_else(|e| panic!("{e}\n{module}"));
        for lane in 0..LANES as u32 {
            assert_eq!(machine.load(ssbo_addr(0, lane * 16)), Some(expected));
        }
    }
}

#[test]
fn test_discard_under_divergent_if_respects_exec() {
    let module = compile(
        "\
stage fragment
%lane:32x1 = load_subgroup_id
%five:32x1 = load_const 5
%ten:32x1 = load_const 10
%outer:1x1 = ilt %lane %five
if %outer {
  %d:1x1 = ilt %lane %ten
  discard_if %d
}
",
    );

    assert!(module.uses_discard);
    assert_eq!(module.exec_masks.len(), 1);
    let exec = module.exec_masks[0];

    let insts: Vec<_> = module.instructions().map(|(_, _, inst)| inst).collect();
    let setmsf = insts
        .iter()
        .position(|inst| inst.op == Opcode::Setmsf)
        .expect("setmsf emitted");
    let gate = insts[setmsf - 1];
    assert_eq!(gate.op, Opcode::Mov);
    assert!(matches!(gate.uf, Some(UpdateFlag::AndZ | UpdateFlag::NorNz)));
    assert_eq!(gate.srcs, vec![Operand::Temp(exec)]);
    assert_eq!(module.value(exec).kind, ValueKind::ExecMask);

    let machine = run(&module);
    for lane in 0..LANES {
        let expected = if lane < 5 { 0 } else { 0xf };
        assert_eq!(machine.msf[lane], expected, "lane {lane}");
    }
}

#[test]
fn test_partial_write_mask_splits_store() {
    let module = compile(
        "\
stage compute
%zero:32x1 = load_const 0
%v:32x4 = load_const 11 22 33 44
store_ssbo %v %zero %zero {write_mask=0xb}
",
    );

    let tags: Vec<_> = tmu_requests(&module)
        .iter()
        .map(|inst| inst.tmu.expect("tagged request"))
        .collect();
    assert_eq!(tags.len(), 2);
    assert_eq!((tags[0].components, tags[0].ty), (2, TmuType::Vec2));
    assert_eq!((tags[1].components, tags[1].ty), (1, TmuType::Uint32));

    let machine = run(&module);
    assert_eq!(machine.load(ssbo_addr(0, 0)), Some(11));
    assert_eq!(machine.load(ssbo_addr(0, 4)), Some(22));
    assert_eq!(machine.load(ssbo_addr(0, 8)), None);
    assert_eq!(machine.load(ssbo_addr(0, 12)), Some(44));
}

#[test]
fn test_uniform_loop_with_uniform_break() {
    let module = compile(
        "\
stage compute
var $i comps=1 bits=32
%zero:32x1 = load_const 0
%one:32x1 = load_const 1
%four:32x1 = load_const 4
$i = mov %zero
loop uniform {
  %cur:32x1 = mov $i
  %done:1x1 = ige %cur %four
  if %done uniform {
    break
  }
  %next:32x1 = iadd %cur %one
  $i = mov %next
}
%res:32x1 = mov $i
%lane:32x1 = load_subgroup_id
%two:32x1 = load_const 2
%off:32x1 = ishl %lane %two
store_ssbo %res %zero %off
",
    );

    assert!(module.exec_masks.is_empty(), "{module}");
    assert_eq!(module.loops, 1);

    let machine = run(&module);
    for lane in 0..LANES as u32 {
        assert_eq!(machine.load(ssbo_addr(0, lane * 4)), Some(4), "lane {lane}");
    }
}

#[test]
fn test_atomic_increment_returns_old_values() {
    let module = compile(
        "\
stage compute
%zero:32x1 = load_const 0
%one:32x1 = load_const 1
%two:32x1 = load_const 2
%old:32x1 = ssbo_atomic_add %zero %zero %one
%lane:32x1 = load_subgroup_id
%off:32x1 = ishl %lane %two
store_ssbo %old %one %off
",
    );

    let tag = tmu_requests(&module)[0].tmu.expect("tagged request");
    assert_eq!(tag.op, TmuOp::WriteAndReadInc);
    assert!(module.has_side_effect_memory_op);

    let machine = run(&module);
    assert_eq!(machine.load(ssbo_addr(0, 0)), Some(LANES as u32));
    let mut olds: Vec<u32> = (0..LANES as u32)
        .map(|lane| machine.load(ssbo_addr(1, lane * 4)).unwrap_or(u32::MAX))
        .collect();
    olds.sort_unstable();
    assert_eq!(olds, (0..LANES as u32).collect::<Vec<_>>());
}

#[test]
fn test_return_jump_is_unsupported() {
    let err = compile_err(
        "\
stage compute
return
",
    );
    assert!(matches!(err, CompileError::Unsupported { construct: "jump", .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_geometry_emission_is_unsupported() {
    let err = compile_err(
        "\
stage geometry
emit_vertex
",
    );
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_texture_without_coordinate_is_malformed() {
    let err = compile_err(
        "\
stage fragment
%lod:32x1 = load_const 0
%t:32x4 = txl lod=%lod {texture=0 dim=2d}
",
    );
    assert!(matches!(err, CompileError::MalformedTexture { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn test_constant_index_past_array_end() {
    let err = compile_err(
        "\
stage compute
var $v comps=1 bits=32 array=4
%zero:32x1 = load_const 0
$v[5] = mov %zero
",
    );
    match &err {
        CompileError::VariableOutOfBounds { index, len, .. } => {
            assert_eq!((*index, *len), (5, 4));
        }
        other => panic!("expected an out-of-bounds error, got {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Structural);
}

#[test]
fn test_register_pressure_after_fallback() {
    let mut module = compile_with(
        "\
stage compute
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%a:32x1 = iadd %lane %lane
%b:32x1 = iadd %a %lane
%c:32x1 = iadd %a %b
store_ssbo %c %zero %lane
",
        &CompileKey::default(),
    )
    .unwrap_or_else(|e| panic!("{e}"));

    let err = allocate_with_fallback(&mut module, &mut LinearScan { budget: Some(1) })
        .expect_err("one register cannot hold this shader");
    assert!(matches!(err, CompileError::RegisterPressure { .. }));
    assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
    assert_eq!(module.threads, module.min_threads.max(1));
}
