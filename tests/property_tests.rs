// Properties every lowered module must satisfy, checked over small families of shaders:
// SSA temporaries have one producer, lanes a divergent branch leaves alone keep their
// values, partial write masks land exactly the masked components, TMU results are only
// read after a thread switch, and divergent loops run each lane for its own trip count.

mod common;

use common::{compile, compile_with, ssbo_addr, Machine, LANES};
use virgen::core::CompileKey;
use virgen::vir::{Dst, Module, Opcode, ValueId, ValueKind, Waddr};

fn run(module: &Module) -> Machine<'_> {
    let mut machine = Machine::new(module);
    machine
        .run()
        .unwrap_or_else(|e| panic!("execution failed: {e}\n{module}"));
    machine
}

const BRANCHY: &str = "\
stage compute
var $v comps=1 bits=32
var $n comps=1 bits=32
%zero:32x1 = load_const 0
%one:32x1 = load_const 1
%two:32x1 = load_const 2
%six:32x1 = load_const 6
%hundred:32x1 = load_const 100
%lane:32x1 = load_subgroup_id
$n = mov %zero
%c:1x1 = ilt %lane %six
if %c {
  %a:32x1 = iadd %lane %hundred
  $v = mov %a
} else {
  %b:32x1 = iadd %lane %lane
  $v = mov %b
  %odd:32x1 = iand %lane %one
  %is_odd:1x1 = ine %odd %zero
  if %is_odd {
    $n = mov %one
  }
}
%r:32x1 = mov $v
%n:32x1 = mov $n
%off:32x1 = ishl %lane %two
store_ssbo %r %zero %off
store_ssbo %n %one %off
";

#[test]
fn test_ssa_values_have_one_producer() {
    let module = compile(BRANCHY);
    for (index, info) in module.values.iter().enumerate() {
        let value = ValueId(index as u32);
        let defs = module.defs_of(value).len();
        match info.kind {
            ValueKind::Ssa { .. } => assert!(defs <= 1, "%{index} has {defs} producers"),
            ValueKind::Retired => assert_eq!(defs, 0, "retired %{index} is still written"),
            _ => {}
        }
    }
}

#[test]
fn test_divergent_if_else_writes_every_lane_once() {
    let module = compile(BRANCHY);
    assert!(!module.exec_masks.is_empty());

    let machine = run(&module);
    for lane in 0..LANES as u32 {
        let expected = if lane < 6 { lane + 100 } else { lane * 2 };
        assert_eq!(machine.load(ssbo_addr(0, lane * 4)), Some(expected), "lane {lane}");
    }
}

#[test]
fn test_inactive_lanes_keep_variable_values() {
    let module = compile(BRANCHY);
    let machine = run(&module);
    // $n is only overwritten in odd lanes at or above 6.
    for lane in 0..LANES as u32 {
        let expected = u32::from(lane >= 6 && lane % 2 == 1);
        assert_eq!(machine.load(ssbo_addr(1, lane * 4)), Some(expected), "lane {lane}");
    }
}

#[test]
fn test_write_masks_store_exactly_their_components() {
    for mask in 1u32..16 {
        let text = format!(
            "\
stage compute
%zero:32x1 = load_const 0
%v:32x4 = load_const 11 22 33 44
store_ssbo %v %zero %zero {{write_mask={mask:#x}}}
"
        );
        let module = compile(&text);

        let written: u32 = module
            .instructions()
            .filter_map(|(_, _, inst)| inst.tmu)
            .map(|tag| tag.components as u32)
            .sum();
        assert_eq!(written, mask.count_ones(), "mask {mask:#x}");

        let machine = run(&module);
        for c in 0..4 {
            let stored = machine.load(ssbo_addr(0, c * 4));
            if mask & (1 << c) != 0 {
                assert_eq!(stored, Some(11 * (c + 1)), "mask {mask:#x} component {c}");
            } else {
                assert_eq!(stored, None, "mask {mask:#x} component {c}");
            }
        }
    }
}

#[test]
fn test_tmu_results_read_after_thread_switch() {
    let text = "\
stage compute
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%two:32x1 = load_const 2
%off:32x1 = ishl %lane %two
%a:32x4 = load_ssbo %zero %off
%b:32x2 = load_ubo %zero %off
%s:32x1 = iadd %a.w %b.y
store_ssbo %s %zero %off
";
    for threads in [2, 4] {
        let module = compile_with(text, &CompileKey::default().with_threads(threads))
            .unwrap_or_else(|e| panic!("{e}"));
        for &block in &module.layout {
            let mut outstanding = false;
            for &id in &module.block(block).insts {
                let inst = module.inst(id);
                if matches!(inst.dst, Dst::Magic(Waddr::Tmuau | Waddr::Tmua)) {
                    outstanding = true;
                }
                if inst.is_thrsw() {
                    outstanding = false;
                }
                if inst.op == Opcode::LdTmu {
                    assert!(
                        !outstanding,
                        "ldtmu before a thread switch at {threads} threads:\n{module}"
                    );
                }
            }
        }
    }
}

#[test]
fn test_divergent_loop_runs_per_lane_trip_counts() {
    let module = compile(
        "\
stage compute
var $i comps=1 bits=32
%zero:32x1 = load_const 0
%one:32x1 = load_const 1
%two:32x1 = load_const 2
%lane:32x1 = load_subgroup_id
$i = mov %zero
loop {
  %cur:32x1 = mov $i
  %done:1x1 = ige %cur %lane
  if %done {
    break
  }
  %next:32x1 = iadd %cur %one
  $i = mov %next
}
%res:32x1 = mov $i
%off:32x1 = ishl %lane %two
store_ssbo %res %zero %off
",
    );

    assert_eq!(module.exec_masks.len(), 1, "{module}");
    let machine = run(&module);
    for lane in 0..LANES as u32 {
        assert_eq!(machine.load(ssbo_addr(0, lane * 4)), Some(lane), "lane {lane}");
    }
}

#[test]
fn test_lowering_is_deterministic() {
    let first = compile(BRANCHY).to_string();
    let second = compile(BRANCHY).to_string();
    assert_eq!(first, second);
}
