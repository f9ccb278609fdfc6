// This module places thread switches. A switch (NOP with the thrsw signal) lets another
// resident lane group run while this one waits on the TMU, so one goes after every TMU
// request and before its results are read; with a single lane group there is nobody to
// switch to and it is elided. The lowering remembers the most recent switch and whether it
// sat outside all control flow, because the program has to end with exactly one switch
// marked last_thrsw that every lane executes: if the last one was inside an if or loop
// another is appended at the top level, and targets before 4.1 cannot do that at all and
// fall back to one lane group. TLB color reads must not straddle a switch that only some
// lanes took, and a switch after a TLB read asks the scheduler to lock the scoreboard.
// remove_thrsw() strips every switch from a finished module for the one-group fallback.

//! Thread-switch placement.

use super::Compiler;
use crate::ir::Stage;
use crate::vir::{Dst, InstId, Module, Opcode};

/// Thread-switch bookkeeping of one compile.
#[derive(Debug, Default)]
pub(super) struct SyncState {
    pub last_thrsw: Option<InstId>,
    pub last_thrsw_at_top_level: bool,
    pub emitted_tlb_load: bool,
}

/// Remove every thread switch from `module`. Returns how many were removed.
pub fn remove_thrsw(module: &mut Module) -> usize {
    let mut removed = 0;
    for &block in &module.layout {
        let insts = &mut module.blocks[block.index()].insts;
        let before = insts.len();
        let all = &module.insts;
        insts.retain(|&i| !all[i.index()].sig.thrsw);
        removed += before - insts.len();
    }
    for inst in &mut module.insts {
        inst.sig.last_thrsw = false;
    }
    log::debug!("removed {removed} thread switches");
    removed
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn emit_thrsw(&mut self) {
        if self.module.threads == 1 {
            return;
        }
        let id = self.emit_with(Opcode::Nop, Dst::Null, &[], |i| i.sig.thrsw = true);
        self.sync.last_thrsw = Some(id);
        self.sync.last_thrsw_at_top_level = self.cf_depth == 0;
        if self.sync.emitted_tlb_load {
            self.module.lock_scoreboard_on_first_thrsw = true;
        }
        self.session.record_thrsw();
    }

    /// Make sure the program ends with one unconditional, marked thread switch.
    pub(super) fn emit_last_thrsw(&mut self) {
        // Before 4.1 a switch needs an outstanding TMU op, so a program whose
        // last switch is missing or nested cannot be threaded at all.
        if !self.sync.last_thrsw_at_top_level && self.key.ver < 41 {
            log::debug!(
                "ver {} has no top-level thread switch to end on, using one thread",
                self.key.ver
            );
            self.module.threads = 1;
            if self.sync.last_thrsw.take().is_some() {
                remove_thrsw(&mut self.module);
            }
            return;
        }

        if self.sync.last_thrsw.is_some() && !self.sync.last_thrsw_at_top_level {
            self.emit_thrsw();
        }
        if self.sync.last_thrsw.is_none() && self.shader.stage == Stage::Fragment {
            self.emit_thrsw();
        }

        if self.module.threads == 1 {
            if self.sync.last_thrsw.take().is_some() {
                remove_thrsw(&mut self.module);
            }
            return;
        }
        if let Some(last) = self.sync.last_thrsw {
            self.module.inst_mut(last).sig.last_thrsw = true;
        }
    }

    /// Sync rule before the first TLB color read.
    pub(super) fn prepare_tlb_read(&mut self) {
        if self.sync.emitted_tlb_load {
            return;
        }
        if !self.sync.last_thrsw_at_top_level {
            self.emit_thrsw();
        }
        self.sync.emitted_tlb_load = true;
    }
}

#[cfg(test)]
mod tests {
    use super::super::compile_text;
    use super::*;
    use crate::core::CompileKey;
    use crate::vir::Inst;

    const COLOR_ONLY: &str = "\
stage fragment
output color loc=2 comps=4
%one:32x4 = load_const 1.0 1.0 1.0 1.0
%zero:32x1 = load_const 0
store_output %one %zero {base=0}
";

    const NESTED_LOAD: &str = "\
stage compute
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%c:1x1 = ieq %lane %zero
if %c {
  %v:32x1 = load_ssbo %zero %zero
  store_ssbo %v %zero %zero
}
";

    #[test]
    fn test_pre_41_without_tmu_ops_runs_single_threaded() {
        let key = CompileKey::default().with_ver(33);
        let module = compile_text(COLOR_ONLY, &key).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(module.threads, 1);
        assert!(module.thrsw_insts().is_empty(), "{module}");

        // 4.1 and later end on an appended switch instead.
        let module = compile_text(COLOR_ONLY, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(module.threads, 4);
        let switches = module.thrsw_insts();
        assert_eq!(switches.len(), 1);
        assert!(module.inst(switches[0]).sig.last_thrsw);
    }

    #[test]
    fn test_pre_41_nested_last_switch_runs_single_threaded() {
        let module = compile_text(NESTED_LOAD, &CompileKey::default().with_ver(40))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(module.threads, 1);
        assert!(module.thrsw_insts().is_empty(), "{module}");

        let module = compile_text(NESTED_LOAD, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(module.threads, 4);
        let last = module.thrsw_insts().into_iter().filter(|&i| module.inst(i).sig.last_thrsw);
        assert_eq!(last.count(), 1);
    }

    const TLB_AFTER_NESTED_LOAD: &str = "\
stage fragment
output color loc=2 comps=4
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%c:1x1 = ieq %lane %zero
if %c {
  %v:32x1 = load_ssbo %zero %zero
  store_ssbo %v %zero %zero
}
%r:32x1 = load_tlb_color %zero {base=0 component=0}
%out:32x4 = vec4 %r %r %r %r
store_output %out %zero {base=0}
";

    const TLB_IN_BRANCH: &str = "\
stage fragment
output color loc=2 comps=4
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%c:1x1 = ieq %lane %zero
if %c {
  %r:32x1 = load_tlb_color %zero {base=0 component=0}
  store_ssbo %r %zero %zero
}
%one:32x4 = load_const 1.0 1.0 1.0 1.0
store_output %one %zero {base=0}
";

    const TLB_THEN_LOAD: &str = "\
stage fragment
output color loc=2 comps=4
%zero:32x1 = load_const 0
%r:32x1 = load_tlb_color %zero {base=0 component=0}
%v:32x1 = load_ssbo %zero %zero
%s:32x1 = fadd %r %v
%out:32x4 = vec4 %s %s %s %s
store_output %out %zero {base=0}
";

    /// The instruction right before the first configured TLB read.
    fn before_first_tlb_read(module: &Module) -> &Inst {
        let (block, id, _) = module
            .instructions()
            .find(|(_, _, inst)| inst.op == Opcode::LdTlbU)
            .unwrap_or_else(|| panic!("no TLB read in\n{module}"));
        let insts = &module.block(block).insts;
        let at = insts.iter().position(|&i| i == id).unwrap();
        assert!(at > 0, "TLB read opens its block\n{module}");
        module.inst(insts[at - 1])
    }

    #[test]
    fn test_first_tlb_read_switches_after_nested_switch() {
        let module =
            compile_text(TLB_AFTER_NESTED_LOAD, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(module.threads, 4);
        assert!(before_first_tlb_read(&module).sig.thrsw, "{module}");
        // Every switch comes before the read: two nested, one forced at top level.
        assert!(!module.lock_scoreboard_on_first_thrsw);
        assert_eq!(module.thrsw_insts().len(), 3);
    }

    #[test]
    fn test_tlb_read_in_branch_locks_scoreboard() {
        let module = compile_text(TLB_IN_BRANCH, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert!(before_first_tlb_read(&module).sig.thrsw, "{module}");
        // The store's switch follows the read.
        assert!(module.lock_scoreboard_on_first_thrsw);
        // The closing switch is appended at top level.
        assert_eq!(module.thrsw_insts().len(), 3);
        let thrsws = module.thrsw_insts();
        let last: Vec<_> = thrsws.iter().filter(|&&i| module.inst(i).sig.last_thrsw).collect();
        assert_eq!(last.len(), 1);
    }

    #[test]
    fn test_switch_after_tlb_read_locks_scoreboard() {
        let module = compile_text(TLB_THEN_LOAD, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert!(before_first_tlb_read(&module).sig.thrsw, "{module}");
        assert!(module.lock_scoreboard_on_first_thrsw);

        // A shader whose only switch precedes the read keeps the scoreboard unlocked.
        let module =
            compile_text(TLB_AFTER_NESTED_LOAD, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert!(!module.lock_scoreboard_on_first_thrsw);
    }

    #[test]
    fn test_remove_thrsw() {
        let mut m = Module::new("t", Stage::Fragment, 2);
        let b = m.new_block();
        m.layout.push(b);
        let mut nop = Inst::new(Opcode::Nop, Dst::Null, vec![]);
        nop.sig.thrsw = true;
        m.append(b, nop.clone());
        m.append(b, Inst::new(Opcode::LdTmu, Dst::Null, vec![]));
        nop.sig.last_thrsw = true;
        let last = m.append(b, nop);

        assert_eq!(m.thrsw_insts().len(), 2);
        assert_eq!(remove_thrsw(&mut m), 2);
        assert!(m.thrsw_insts().is_empty());
        assert_eq!(m.instruction_count(), 1);
        assert!(!m.inst(last).sig.last_thrsw);
    }
}
