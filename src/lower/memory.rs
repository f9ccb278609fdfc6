// This module lowers general-memory intrinsics (dynamically indexed default-block uniforms,
// UBO, SSBO, shared and scratch loads, stores and atomics) onto the TMU request protocol.
// Each request is a sequence of TMUD data writes followed by one address write to TMUAU
// that carries the config word as its uniform; the address is the resource base (a UBO
// address or SSBO offset uniform, the shared base, or the per-lane spill base) plus any
// constant offset folded in and any dynamic offset added with an ADD. Store write masks
// are split into runs of consecutive components and loads into chunks no larger than the
// per-request component limit. Before a request the lane-group count is halved until its
// TMU writes fit in each group's share of the FIFO. After it comes a thread switch, then
// one LdTmu per returned component or a TMUWT when nothing is returned.

//! General-memory TMU lowering.

use super::Compiler;
use crate::core::{CompileError, CompileResult};
use crate::ir::{AtomicOp, IntrinsicInstr, MemAccess, MemSpace, Src};
use crate::vir::{
    tmu_config, BarrierClass, Cond, Dst, Opcode, Operand, RegClass, TmuOp, TmuTag, TmuType,
    UniformContents, Waddr,
};

/// Split a write mask into runs of consecutive components.
///
/// Returns `(first, count)` pairs in ascending order; runs longer than
/// `max_components` are cut into several pieces.
pub fn write_mask_runs(mask: u32, max_components: u32) -> Vec<(u32, u32)> {
    let max_components = max_components.max(1);
    let mut runs = Vec::new();
    let mut remaining = mask;
    while remaining != 0 {
        let first = remaining.trailing_zeros();
        let mut count = 0;
        while first + count < 32 && remaining & (1 << (first + count)) != 0 && count < max_components {
            count += 1;
        }
        let run_bits = if count == 32 { !0 } else { ((1u32 << count) - 1) << first };
        remaining &= !run_bits;
        runs.push((first, count));
    }
    runs
}

/// TMU operation for an atomic, with the increment/decrement strength reduction.
pub(super) fn atomic_tmu_op(op: AtomicOp, data: Option<u32>, has_inc_dec: bool) -> (TmuOp, bool) {
    if op == AtomicOp::Add && has_inc_dec {
        match data {
            Some(1) => return (TmuOp::WriteAndReadInc, true),
            Some(0xffff_ffff) => return (TmuOp::WriteOrReadDec, true),
            _ => {}
        }
    }
    let tmu = match op {
        AtomicOp::Add => TmuOp::WriteAddReadPrefetch,
        AtomicOp::IMin => TmuOp::WriteSmin,
        AtomicOp::UMin => TmuOp::WriteUminFullL1Clear,
        AtomicOp::IMax => TmuOp::WriteSmax,
        AtomicOp::UMax => TmuOp::WriteUmax,
        AtomicOp::And => TmuOp::WriteAndReadInc,
        AtomicOp::Or => TmuOp::WriteOrReadDec,
        AtomicOp::Xor => TmuOp::WriteXorReadNot,
        AtomicOp::Exchange => TmuOp::WriteXchgReadFlush,
        AtomicOp::CompSwap => TmuOp::WriteCmpxchgReadFlush,
    };
    (tmu, false)
}

/// Components per request and the byte stride between components. 8- and
/// 16-bit accesses move one value per request.
fn request_shape(bit_size: u8, max_components: u32) -> (u32, u32) {
    match bit_size {
        8 | 16 => (1, u32::from(bit_size / 8)),
        _ => (max_components, 4),
    }
}

/// One TMU request of a general-memory access.
struct Request {
    data: Vec<Operand>,
    /// Byte offset added to the base, beyond any dynamic offset.
    offset: u32,
    /// Components returned, or 0.
    results: u32,
    /// First destination component the results land in.
    first_result: usize,
    tag: TmuTag,
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    /// Halve the lane-group count until `writes` fit in the TMU FIFO share.
    pub(super) fn fit_tmu_fifo(&mut self, writes: u32) -> CompileResult<()> {
        let depth = self.key.tmu_fifo_depth;
        let fits = move |threads: u32| writes <= depth / threads;
        while !fits(self.module.threads) && self.module.threads > self.module.min_threads {
            self.module.threads /= 2;
            self.session.record_thread_halving();
            log::debug!(
                "{} TMU writes overflow the FIFO share, dropping to {} threads",
                writes,
                self.module.threads
            );
        }
        if !fits(self.module.threads) {
            return Err(CompileError::unsupported(
                "TMU request size",
                format!(
                    "{writes} writes overflow a {depth}-entry FIFO at {} threads",
                    self.module.threads
                ),
            ));
        }
        Ok(())
    }

    pub(super) fn emit_tmu_general(
        &mut self,
        instr: &IntrinsicInstr,
        space: MemSpace,
        access: MemAccess,
    ) -> CompileResult<()> {
        let has_index = matches!(space, MemSpace::Ubo | MemSpace::Ssbo);
        let (offset_src, index_src) = match access {
            MemAccess::Store => (1 + usize::from(has_index), 1),
            MemAccess::Load | MemAccess::Atomic(_) => (usize::from(has_index), 0),
        };
        let offset_op = instr.srcs.get(offset_src).ok_or_else(|| {
            CompileError::structural(format!("{} is missing its offset", instr.op))
        })?;
        let buffer_index = if has_index {
            let src = instr.srcs.get(index_src).ok_or_else(|| {
                CompileError::structural(format!("{} is missing its buffer index", instr.op))
            })?;
            Some(self.values.constant_u32(src, 0).ok_or_else(|| {
                CompileError::unsupported("buffer index", format!("{} with a non-constant index", instr.op))
            })?)
        } else {
            None
        };

        let const_offset = self.values.constant_u32(offset_op, 0);
        let base_index = instr.indices.base;

        // The UBO forms fold the whole constant offset into the address uniform.
        let (base, offset, barrier) = match space {
            MemSpace::Uniform => {
                let folded = base_index.wrapping_add(const_offset.unwrap_or(0));
                let base = self.uniform(UniformContents::UboAddr { index: 0, offset: folded });
                (base, 0, BarrierClass::TMU)
            }
            MemSpace::Ubo => {
                let index = buffer_index.unwrap_or(0) + 1;
                let base = self.uniform(UniformContents::UboAddr {
                    index,
                    offset: const_offset.unwrap_or(0),
                });
                (base, 0, BarrierClass::TMU)
            }
            MemSpace::Ssbo => {
                let base = self.uniform(UniformContents::SsboOffset(buffer_index.unwrap_or(0)));
                (base, const_offset.unwrap_or(0), BarrierClass::TMU | BarrierClass::BUFFER)
            }
            MemSpace::Shared => {
                let base = self.io.shared_base.ok_or_else(|| {
                    CompileError::unsupported("shared memory", "access without a shared allocation")
                })?;
                (
                    base,
                    const_offset.unwrap_or(0).wrapping_add(base_index),
                    BarrierClass::TMU | BarrierClass::SHARED,
                )
            }
            MemSpace::Scratch => {
                let base = self.io.spill_base.ok_or_else(|| {
                    CompileError::unsupported("scratch memory", "access without a scratch allocation")
                })?;
                (
                    base,
                    const_offset.unwrap_or(0),
                    BarrierClass::TMU | BarrierClass::SCRATCH,
                )
            }
        };
        let dynamic = if const_offset.is_none() {
            Some(self.get_src(offset_op, 0)?)
        } else {
            None
        };

        let requests = self.plan_requests(instr, access, offset)?;
        if !matches!(access, MemAccess::Load) {
            self.module.has_side_effect_memory_op = true;
        }
        for request in requests {
            self.emit_request(instr, request, base, dynamic, barrier)?;
        }
        Ok(())
    }

    fn plan_requests(
        &mut self,
        instr: &IntrinsicInstr,
        access: MemAccess,
        offset: u32,
    ) -> CompileResult<Vec<Request>> {
        let max = self.key.max_tmu_components;
        let mut requests = Vec::new();
        match access {
            MemAccess::Load => {
                let total = instr.dest_components() as u32;
                let bit_size = match &instr.dest {
                    Some(crate::ir::Dest::Ssa(def)) => def.bit_size,
                    _ => 32,
                };
                let (per_request, stride) = request_shape(bit_size, max);
                let mut first = 0;
                while first < total.max(1) {
                    let count = (total - first).min(per_request).max(1);
                    requests.push(Request {
                        data: Vec::new(),
                        offset: offset.wrapping_add(first * stride),
                        results: count,
                        first_result: first as usize,
                        tag: TmuTag {
                            op: TmuOp::Regular,
                            ty: TmuType::for_access(bit_size, count),
                            components: count as u8,
                            per_pixel: true,
                        },
                    });
                    first += count;
                }
            }
            MemAccess::Store => {
                let value = instr.srcs.first().ok_or_else(|| {
                    CompileError::structural(format!("{} is missing its value", instr.op))
                })?;
                let mask = match instr.indices.write_mask {
                    0 => (1u32 << instr.num_components) - 1,
                    mask => mask as u32,
                };
                let bit_size = self.src_bit_size(value)?;
                let (per_request, stride) = request_shape(bit_size, max);
                for (first, count) in write_mask_runs(mask, per_request) {
                    let mut data = Vec::with_capacity(count as usize);
                    for c in first..first + count {
                        data.push(self.get_src(value, c as usize)?);
                    }
                    requests.push(Request {
                        data,
                        offset: offset.wrapping_add(first * stride),
                        results: 0,
                        first_result: 0,
                        tag: TmuTag {
                            op: TmuOp::Regular,
                            ty: TmuType::for_access(bit_size, count),
                            components: count as u8,
                            per_pixel: true,
                        },
                    });
                }
            }
            MemAccess::Atomic(op) => {
                let first_data = instr.srcs.len().checked_sub(op.num_data()).ok_or_else(|| {
                    CompileError::structural(format!("{} is missing its data", instr.op))
                })?;
                let data_src = &instr.srcs[first_data];
                let (tmu_op, no_data) = atomic_tmu_op(
                    op,
                    self.values.constant_u32(data_src, 0),
                    self.key.has_atomic_inc_dec,
                );
                let mut data = Vec::new();
                if !no_data {
                    for src in &instr.srcs[first_data..] {
                        data.push(self.get_src(src, 0)?);
                    }
                }
                let results = u32::from(instr.dest.is_some());
                requests.push(Request {
                    data,
                    offset,
                    results,
                    first_result: 0,
                    tag: TmuTag {
                        op: tmu_op,
                        ty: TmuType::Uint32,
                        components: 1,
                        per_pixel: true,
                    },
                });
            }
        }
        Ok(requests)
    }

    fn emit_request(
        &mut self,
        instr: &IntrinsicInstr,
        request: Request,
        base: Operand,
        dynamic: Option<Operand>,
        barrier: BarrierClass,
    ) -> CompileResult<()> {
        self.fit_tmu_fifo(request.data.len() as u32 + 1)?;

        for &data in &request.data {
            self.emit_with(Opcode::Mov, Dst::Magic(Waddr::Tmud), &[data], |i| {
                i.barrier = barrier
            });
        }

        let full = RegClass::Full;
        let mut address = base;
        if let Some(offset) = dynamic {
            address = self.emit(Opcode::Add, full, &[address, offset]).operand();
        }
        if request.offset != 0 {
            let offset = self.imm(request.offset);
            address = self.emit(Opcode::Add, full, &[address, offset]).operand();
        }

        let divergent = self.in_divergent_flow();
        if divergent {
            self.push_exec_z()?;
        }
        let tag = request.tag;
        let config = tmu_config(tag.op, tag.ty, tag.per_pixel);
        let config = self.module.uniforms.add(UniformContents::Constant(config));
        self.emit_with(Opcode::Mov, Dst::Magic(Waddr::Tmuau), &[address], |i| {
            i.uniform = Some(config);
            i.tmu = Some(tag);
            i.barrier = barrier;
            if divergent {
                i.cond = Cond::IfA;
            }
        });
        self.session.record_tmu_request();

        self.emit_thrsw();

        if request.results == 0 {
            self.emit_with(Opcode::Tmuwt, Dst::Null, &[], |i| i.barrier = barrier);
            return Ok(());
        }
        let dest = instr
            .dest
            .as_ref()
            .ok_or_else(|| CompileError::structural(format!("{} has no destination", instr.op)))?;
        let class = match dest {
            crate::ir::Dest::Ssa(def) => RegClass::for_bit_size(def.bit_size),
            crate::ir::Dest::Var(_) => full,
        };
        for i in 0..request.results as usize {
            let result = self.emit(Opcode::LdTmu, class, &[]);
            self.store_dest(dest, request.first_result + i, result)?;
        }
        Ok(())
    }

    /// Constant source helper for memory-like intrinsics.
    pub(super) fn const_index(&self, src: Option<&Src>, what: &'static str) -> CompileResult<u32> {
        src.and_then(|s| self.values.constant_u32(s, 0))
            .ok_or_else(|| CompileError::unsupported(what, "non-constant index"))
    }
}
