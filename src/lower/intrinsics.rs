// This module dispatches intrinsic instructions. General-memory accesses go to the TMU
// lowering, images to the image path and stage I/O to the varying code; everything else
// is handled here directly. Most of the rest are single reads: lane-uniform values come
// from the uniform pool (direct default-block uniforms, buffer sizes, clip planes, the
// viewport transform, alpha reference, framebuffer layers, workgroup counts) and per-lane
// values from special registers (sample mask, facing, element index) or from the compute
// payload words saved at entry. Discards clear the pixel's coverage mask, predicated on
// the execution mask in divergent flow, and control barriers issue a sync-unit request
// that only blocks at the following thread switch.

//! Intrinsic lowering.

use super::Compiler;
use crate::core::{CompileError, CompileResult};
use crate::ir::{Dest, Intrinsic, IntrinsicInstr, Stage};
use crate::vir::{
    BarrierClass, Cond, Dst, Opcode, Operand, PushFlag, RegClass, UniformContents, UpdateFlag,
    Waddr,
};

/// Sync-unit request: wait for the whole workgroup, then increment.
const TSY_WAIT_INC_CHECK: u32 = 3;

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn emit_intrinsic(&mut self, instr: &'s IntrinsicInstr) -> CompileResult<()> {
        if let Some((space, access)) = instr.op.memory_access() {
            if instr.op == Intrinsic::LoadUniform {
                return self.emit_load_uniform(instr);
            }
            return self.emit_tmu_general(instr, space, access);
        }

        let full = RegClass::Full;
        match instr.op {
            Intrinsic::ImageLoad | Intrinsic::ImageStore | Intrinsic::ImageAtomic(_) => {
                self.emit_image_load_store(instr)
            }
            Intrinsic::ImageSize => self.emit_image_size(instr),

            Intrinsic::GetBufferSize => {
                let index = self.const_index(instr.srcs.first(), "buffer index")?;
                self.store_uniform(instr, 0, UniformContents::SsboSize(index))
            }
            Intrinsic::LoadUserClipPlane => {
                for i in 0..instr.dest_components() {
                    let plane = instr.indices.ucp_id * 4 + i as u32;
                    self.store_uniform(instr, i, UniformContents::UserClipPlane(plane))?;
                }
                Ok(())
            }
            Intrinsic::LoadViewportXScale => {
                self.store_uniform(instr, 0, UniformContents::ViewportXScale)
            }
            Intrinsic::LoadViewportYScale => {
                self.store_uniform(instr, 0, UniformContents::ViewportYScale)
            }
            Intrinsic::LoadViewportZScale => {
                self.store_uniform(instr, 0, UniformContents::ViewportZScale)
            }
            Intrinsic::LoadViewportZOffset => {
                self.store_uniform(instr, 0, UniformContents::ViewportZOffset)
            }
            Intrinsic::LoadAlphaRef => self.store_uniform(instr, 0, UniformContents::AlphaRef),
            Intrinsic::LoadFbLayers => self.store_uniform(instr, 0, UniformContents::FbLayers),
            Intrinsic::LoadNumWorkGroups => {
                for i in 0..3 {
                    self.store_uniform(instr, i, UniformContents::NumWorkGroups(i as u8))?;
                }
                Ok(())
            }

            Intrinsic::LoadSampleMaskIn => {
                let value = self.emit(Opcode::Msf, full, &[]);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadHelperInvocation => {
                self.emit_with(Opcode::Msf, Dst::Null, &[], |i| i.pf = Some(PushFlag::PushZ));
                let on = self.imm(!0);
                let off = self.imm(0);
                let sel = self.emit_cond(Opcode::Sel, full, Cond::IfA, &[on, off]).operand();
                let value = self.mov(sel);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadFrontFace => {
                // REVF is 0 for front faces; true must be ~0.
                let minus_one = self.imm(!0);
                let revf = self.emit(Opcode::Revf, full, &[]).operand();
                let value = self.emit(Opcode::Add, full, &[minus_one, revf]);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadInstanceId => {
                let iid = self.io.iid.ok_or_else(|| {
                    CompileError::unsupported("intrinsic", "load_instance_id outside a vertex shader")
                })?;
                let value = self.mov(iid);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadVertexId => {
                let vid = self.io.vid.ok_or_else(|| {
                    CompileError::unsupported("intrinsic", "load_vertex_id outside a vertex shader")
                })?;
                let value = self.mov(vid);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadLocalInvocationIndex => {
                let [_, payload1] = self.cs_payload(instr)?;
                let shift = self.imm(32 - self.module.local_invocation_index_bits);
                let value = self.emit(Opcode::Shr, full, &[payload1, shift]);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadWorkGroupId => {
                let [payload0, payload1] = self.cs_payload(instr)?;
                let low = self.imm(0xffff);
                let sixteen = self.imm(16);
                let x = self.emit(Opcode::And, full, &[payload0, low]);
                self.store_result(instr, 0, x)?;
                let y = self.emit(Opcode::Shr, full, &[payload0, sixteen]);
                self.store_result(instr, 1, y)?;
                let z = self.emit(Opcode::And, full, &[payload1, low]);
                self.store_result(instr, 2, z)
            }
            Intrinsic::LoadSubgroupId => {
                let value = self.emit(Opcode::Eidx, full, &[]);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadPrimitiveId => {
                // Written by the primitive setup into the first VPM header word.
                let row = self.imm(0);
                let value = self.emit(Opcode::LdVpmVIn, full, &[row]);
                self.store_result(instr, 0, value)
            }
            Intrinsic::LoadInvocationId => {
                let value = self.emit(Opcode::Iid, full, &[]);
                self.store_result(instr, 0, value)
            }

            Intrinsic::LoadInput => self.emit_load_input(instr),
            Intrinsic::LoadPerVertexInput => self.emit_load_per_vertex_input(instr),
            Intrinsic::StoreOutput => self.emit_store_output(instr),
            Intrinsic::LoadTlbColor => self.emit_load_tlb_color(instr),
            Intrinsic::StoreTlbSampleColor => self.emit_store_tlb_sample_color(instr),

            Intrinsic::Discard => {
                if self.in_divergent_flow() {
                    self.push_exec_z()?;
                    self.emit_with(Opcode::Setmsf, Dst::Null, &[Operand::SmallImm(0)], |i| {
                        i.cond = Cond::IfA
                    });
                } else {
                    self.emit_with(Opcode::Setmsf, Dst::Null, &[Operand::SmallImm(0)], |_| {});
                }
                self.module.uses_discard = true;
                Ok(())
            }
            Intrinsic::DiscardIf => {
                let condition = instr
                    .srcs
                    .first()
                    .ok_or_else(|| CompileError::structural("discard_if without a condition"))?;
                let mut cond = self.bool_to_cond(condition, 0)?;
                if let Some(exec) = self.exec {
                    // Only active lanes may discard.
                    let uf = if cond == Cond::IfA {
                        UpdateFlag::AndZ
                    } else {
                        cond = Cond::IfA;
                        UpdateFlag::NorNz
                    };
                    self.emit_update(Opcode::Mov, &[Operand::Temp(exec)], uf);
                }
                self.emit_with(Opcode::Setmsf, Dst::Null, &[Operand::SmallImm(0)], |i| {
                    i.cond = cond
                });
                self.module.uses_discard = true;
                Ok(())
            }

            // TMU accesses on either side are already ordered by their thread
            // switch and LdTmu/TMUWT sequence.
            Intrinsic::MemoryBarrier => Ok(()),
            Intrinsic::ControlBarrier => {
                if self.key.ver >= 42 {
                    self.emit_with(Opcode::BarrierId, Dst::Magic(Waddr::SyncB), &[], |i| {
                        i.barrier = BarrierClass::SYNC
                    });
                } else {
                    let uniform = self
                        .module
                        .uniforms
                        .add(UniformContents::Constant(0xffffff00 | TSY_WAIT_INC_CHECK));
                    self.emit_with(Opcode::BarrierId, Dst::Magic(Waddr::SyncU), &[], |i| {
                        i.uniform = Some(uniform);
                        i.barrier = BarrierClass::SYNC;
                    });
                }
                // The sync request blocks at the next thread switch.
                self.emit_thrsw();
                Ok(())
            }

            Intrinsic::EmitVertex | Intrinsic::EndPrimitive => Err(CompileError::unsupported(
                "intrinsic",
                format!("{} must be lowered to VPM stores before the backend", instr.op),
            )),

            // Memory intrinsics were dispatched above.
            Intrinsic::LoadUniform
            | Intrinsic::LoadUbo
            | Intrinsic::LoadSsbo
            | Intrinsic::StoreSsbo
            | Intrinsic::SsboAtomic(_)
            | Intrinsic::LoadShared
            | Intrinsic::StoreShared
            | Intrinsic::SharedAtomic(_)
            | Intrinsic::LoadScratch
            | Intrinsic::StoreScratch => Err(CompileError::structural(format!(
                "{} has no memory access kind",
                instr.op
            ))),
        }
    }

    fn dest<'i>(&self, instr: &'i IntrinsicInstr) -> CompileResult<&'i Dest> {
        instr
            .dest
            .as_ref()
            .ok_or_else(|| CompileError::structural(format!("{} has no destination", instr.op)))
    }

    fn store_result(
        &mut self,
        instr: &IntrinsicInstr,
        index: usize,
        value: super::Pending,
    ) -> CompileResult<()> {
        let dest = self.dest(instr)?;
        self.store_dest(dest, index, value)
    }

    fn store_uniform(
        &mut self,
        instr: &IntrinsicInstr,
        index: usize,
        contents: UniformContents,
    ) -> CompileResult<()> {
        let value = self.uniform_pending(contents);
        self.store_result(instr, index, value)
    }

    fn cs_payload(&self, instr: &IntrinsicInstr) -> CompileResult<[Operand; 2]> {
        match (self.shader.stage, self.io.cs_payload) {
            (Stage::Compute, [Some(p0), Some(p1)]) => Ok([p0, p1]),
            _ => Err(CompileError::unsupported(
                "intrinsic",
                format!("{} outside a compute shader", instr.op),
            )),
        }
    }

    fn emit_load_uniform(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let Some(offset) = instr
            .srcs
            .first()
            .and_then(|src| self.values.constant_u32(src, 0))
        else {
            let (space, access) = instr
                .op
                .memory_access()
                .ok_or_else(|| CompileError::structural("load_uniform without a memory kind"))?;
            return self.emit_tmu_general(instr, space, access);
        };

        let offset = instr.indices.base.wrapping_add(offset);
        if offset % 4 != 0 {
            return Err(CompileError::unsupported(
                "uniform offset",
                format!("byte offset {offset} is not word aligned"),
            ));
        }
        for i in 0..instr.dest_components() {
            self.store_uniform(instr, i, UniformContents::Uniform(offset / 4 + i as u32))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::compile_text;
    use super::TSY_WAIT_INC_CHECK;
    use crate::core::{CompileKey, ErrorKind};
    use crate::vir::{Dst, Module, Opcode, UniformContents, Waddr};

    fn lower(text: &str, key: &CompileKey) -> Module {
        compile_text(text, key).unwrap_or_else(|e| panic!("{e}"))
    }

    fn uniforms_read(module: &Module) -> Vec<UniformContents> {
        module
            .instructions()
            .filter_map(|(_, _, inst)| inst.uniform)
            .filter_map(|id| module.uniforms.get(id).copied())
            .collect()
    }

    #[test]
    fn test_control_barrier_blocks_at_next_thread_switch() {
        let text = "stage compute\ncontrol_barrier\n";
        let module = lower(text, &CompileKey::default());
        let insts: Vec<_> = module.instructions().map(|(_, _, inst)| inst).collect();
        let barrier = insts
            .iter()
            .position(|inst| inst.op == Opcode::BarrierId && inst.dst == Dst::Magic(Waddr::SyncB))
            .unwrap_or_else(|| panic!("no syncb write:\n{module}"));
        assert!(insts[barrier + 1].is_thrsw(), "{module}");

        let module = lower(text, &CompileKey::default().with_ver(40));
        let request = module
            .instructions()
            .find(|(_, _, inst)| inst.dst == Dst::Magic(Waddr::SyncU))
            .and_then(|(_, _, inst)| inst.uniform)
            .and_then(|id| module.uniforms.get(id).copied());
        assert_eq!(
            request,
            Some(UniformContents::Constant(0xffffff00 | TSY_WAIT_INC_CHECK))
        );
    }

    #[test]
    fn test_load_uniform_reads_default_block_words() {
        let module = lower(
            "stage compute\n%zero:32x1 = load_const 0\n%u:32x2 = load_uniform %zero {base=8}\n",
            &CompileKey::default(),
        );
        assert_eq!(
            uniforms_read(&module),
            vec![UniformContents::Uniform(2), UniformContents::Uniform(3)]
        );

        let err = compile_text(
            "stage compute\n%zero:32x1 = load_const 0\n%u:32x1 = load_uniform %zero {base=6}\n",
            &CompileKey::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_buffer_size_is_a_uniform() {
        let module = lower(
            "stage compute\n%one:32x1 = load_const 1\n%s:32x1 = get_buffer_size %one\n",
            &CompileKey::default(),
        );
        assert_eq!(uniforms_read(&module), vec![UniformContents::SsboSize(1)]);
    }

    #[test]
    fn test_stage_specific_reads_are_checked() {
        let err = compile_text("stage compute\n%v:32x1 = load_vertex_id\n", &CompileKey::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let err = compile_text("stage fragment\n%w:32x3 = load_work_group_id\n", &CompileKey::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
