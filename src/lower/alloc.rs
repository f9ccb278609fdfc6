// Register allocation is not part of lowering, but its failure feeds back into it: each
// resident lane group owns an equal share of the physical register file, so a shader that
// does not fit at four groups may fit at two or one. allocate_with_fallback() drives that
// retry loop around any allocator implementing RegisterAllocator, halving the module's
// thread count on every OutOfRegisters and stripping the thread switches once a single group
// remains. When the count is already at the target minimum the failure is reported as
// register pressure.
//
// LinearScan is the allocator used by the CLI and the tests. It numbers instructions in
// layout order, gives every value the interval from its first to its last mention, widens
// intervals that cross a loop back edge to the end of the loop, and then hands out registers
// from a free bitmask in interval order.

//! Register allocation with thread-count fallback.

use super::sync::remove_thrsw;
use crate::core::{CompileError, CompileResult};
use crate::vir::{Dst, Module, Operand, ValueId, ValueKind};
use thiserror::Error;

/// Physical registers shared by all lane groups of one QPU.
pub const PHYSICAL_REGISTERS: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocFailure {
    #[error("out of registers")]
    OutOfRegisters,
}

/// A register allocator for finished modules.
pub trait RegisterAllocator {
    type Assignment;

    /// Assign registers for the current `module.threads`.
    fn allocate(&mut self, module: &Module) -> Result<Self::Assignment, AllocFailure>;
}

/// Allocate, halving the thread count until the allocation fits.
pub fn allocate_with_fallback<A: RegisterAllocator>(
    module: &mut Module,
    allocator: &mut A,
) -> CompileResult<A::Assignment> {
    loop {
        match allocator.allocate(module) {
            Ok(assignment) => return Ok(assignment),
            Err(AllocFailure::OutOfRegisters) => {
                if module.threads <= module.min_threads.max(1) {
                    return Err(CompileError::RegisterPressure {
                        threads: module.threads,
                    });
                }
                module.threads /= 2;
                log::debug!(
                    "{}: out of registers, retrying with {} threads",
                    module.name,
                    module.threads
                );
                if module.threads == 1 {
                    remove_thrsw(module);
                }
            }
        }
    }
}

/// Register per value; `None` for values that never reach the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMap {
    pub regs: Vec<Option<u8>>,
    pub used: u32,
}

impl RegisterMap {
    pub fn get(&self, value: ValueId) -> Option<u8> {
        self.regs.get(value.index()).copied().flatten()
    }
}

/// Interval-based allocator over the block layout.
#[derive(Debug, Default)]
pub struct LinearScan {
    /// Override of the per-thread register budget, for testing.
    pub budget: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    value: ValueId,
    start: usize,
    end: usize,
}

impl LinearScan {
    fn budget(&self, module: &Module) -> u32 {
        self.budget
            .unwrap_or(PHYSICAL_REGISTERS / module.threads.max(1))
            .min(64)
    }

    fn intervals(module: &Module) -> Vec<Interval> {
        let mut span: Vec<Option<(usize, usize)>> = vec![None; module.values.len()];
        let mut block_range = vec![(0usize, 0usize); module.blocks.len()];
        let mut pos = 0;
        for &block in &module.layout {
            let start = pos;
            for &id in &module.block(block).insts {
                let inst = module.inst(id);
                let temps = inst
                    .srcs
                    .iter()
                    .filter_map(|src| match src {
                        Operand::Temp(v) => Some(*v),
                        _ => None,
                    })
                    .chain(match inst.dst {
                        Dst::Temp(v) => Some(v),
                        _ => None,
                    });
                for v in temps {
                    let entry = &mut span[v.index()];
                    *entry = Some(match *entry {
                        Some((s, e)) => (s.min(pos), e.max(pos)),
                        None => (pos, pos),
                    });
                }
                pos += 1;
            }
            block_range[block.index()] = (start, pos.saturating_sub(1).max(start));
        }

        // A value live into a loop header stays live until the back edge.
        let mut loops = Vec::new();
        for &block in &module.layout {
            let (_, end) = block_range[block.index()];
            for succ in module.block(block).succs.iter().flatten() {
                let (header, _) = block_range[succ.index()];
                if header <= end {
                    loops.push((header, end));
                }
            }
        }
        let mut changed = true;
        while changed {
            changed = false;
            for (s, e) in span.iter_mut().flatten() {
                for &(header, back) in &loops {
                    if *s < header && *e >= header && *e < back {
                        *e = back;
                        changed = true;
                    }
                }
            }
        }

        let mut intervals: Vec<Interval> = span
            .into_iter()
            .enumerate()
            .filter_map(|(i, span)| {
                let value = ValueId(i as u32);
                if matches!(module.value(value).kind, ValueKind::Retired) {
                    return None;
                }
                span.map(|(start, end)| Interval { value, start, end })
            })
            .collect();
        intervals.sort_by_key(|i| (i.start, i.end));
        intervals
    }
}

impl RegisterAllocator for LinearScan {
    type Assignment = RegisterMap;

    fn allocate(&mut self, module: &Module) -> Result<RegisterMap, AllocFailure> {
        let budget = self.budget(module);
        let mut regs = vec![None; module.values.len()];
        let mut free: u64 = if budget == 64 { !0 } else { (1u64 << budget) - 1 };
        let mut active: Vec<Interval> = Vec::new();
        let mut used = 0;

        for interval in Self::intervals(module) {
            active.retain(|live| {
                if live.end < interval.start {
                    if let Some(reg) = regs[live.value.index()] {
                        free |= 1u64 << reg;
                    }
                    false
                } else {
                    true
                }
            });
            if free == 0 {
                log::trace!(
                    "{}: {} live values exceed {} registers",
                    module.name,
                    active.len() + 1,
                    budget
                );
                return Err(AllocFailure::OutOfRegisters);
            }
            let reg = free.trailing_zeros() as u8;
            free &= !(1u64 << reg);
            used = used.max(u32::from(reg) + 1);
            regs[interval.value.index()] = Some(reg);
            active.push(interval);
        }
        Ok(RegisterMap { regs, used })
    }
}
