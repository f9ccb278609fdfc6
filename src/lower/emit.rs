// This module is the instruction emitter every other lowering step goes through. It
// appends instructions to the current block (tracing each one and counting it in the
// session histogram), legalizes immediates (at most one inline small immediate per
// instruction, and only on opcodes that accept one; everything else becomes an ldunif of
// a pooled constant), and resolves portable-IR sources to operands: SSA words come from
// the value table, deferred comparisons are materialized on demand, and variable reads
// with an indirect index become a compare-and-select chain into a scratch temporary.
// Results are handed back as Pending handles. Binding a Pending to an SSA definition just
// records its operand; storing it into a variable performs the pending rewrite, which
// retargets the producing instruction (or a fallback MOV) to the variable slot and, in
// divergent flow, predicates it on the execution mask.

//! Instruction emission and operand resolution.

use super::Compiler;
use crate::core::{CompileError, CompileResult};
use crate::ir::{Dest, Src, SsaId, VarRef};
use crate::vir::{
    BlockId, Branch, BranchCond, Cond, Dst, Inst, InstId, Opcode, Operand, PushFlag, RegClass,
    UniformContents, UpdateFlag, ValueId, ValueKind,
};

/// Whether `bits` fits the inline small-immediate field.
///
/// Encodable values are the integers -16..=15 and the positive float powers
/// of two from 2^-8 to 2^7.
pub fn small_imm_encodable(bits: u32) -> bool {
    if (-16..=15).contains(&(bits as i32)) {
        return true;
    }
    let value = f32::from_bits(bits);
    (-8..=7).any(|exp| value == 2f32.powi(exp))
}

/// Result of an emitted instruction that has not been bound yet.
///
/// A pending result is consumed exactly once: bound to an SSA definition,
/// stored into a variable slot, or used as an operand.
#[must_use = "a pending result must be bound, stored or used"]
#[derive(Debug)]
pub struct Pending {
    inst: InstId,
    value: ValueId,
}

impl Pending {
    pub fn inst(&self) -> InstId {
        self.inst
    }

    pub fn value(&self) -> ValueId {
        self.value
    }

    /// Consume the handle as a plain source operand.
    pub fn operand(self) -> Operand {
        Operand::Temp(self.value)
    }
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    /// Continue emission at the end of `block`, placing it next in the layout.
    pub(super) fn set_emit_block(&mut self, block: BlockId) {
        self.cur_block = block;
        self.module.layout.push(block);
    }

    fn push(&mut self, inst: Inst) -> InstId {
        let op = inst.op;
        let id = self.module.append(self.cur_block, inst);
        self.session.record_instruction(op.name());
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("block{}: {}", self.cur_block.0, self.module.display_inst(id));
        }
        id
    }

    pub(super) fn new_temp(&mut self, class: RegClass) -> ValueId {
        self.module.new_value(class, ValueKind::Ssa { def: None })
    }

    fn legalize(&mut self, op: Opcode, srcs: &[Operand]) -> Vec<Operand> {
        let mut small_imm_used = !op.info().small_imm;
        let mut out = Vec::with_capacity(srcs.len());
        for &src in srcs {
            match src {
                Operand::SmallImm(bits) if small_imm_used => {
                    out.push(self.uniform(UniformContents::Constant(bits)));
                }
                Operand::SmallImm(_) => {
                    small_imm_used = true;
                    out.push(src);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Emit an instruction with an arbitrary destination and modifiers.
    pub(super) fn emit_with(
        &mut self,
        op: Opcode,
        dst: Dst,
        srcs: &[Operand],
        modify: impl FnOnce(&mut Inst),
    ) -> InstId {
        let srcs = self.legalize(op, srcs);
        let mut inst = Inst::new(op, dst, srcs);
        modify(&mut inst);
        self.push(inst)
    }

    /// Emit `op` into a fresh temporary.
    pub(super) fn emit(&mut self, op: Opcode, class: RegClass, srcs: &[Operand]) -> Pending {
        self.emit_cond(op, class, Cond::Always, srcs)
    }

    pub(super) fn emit_cond(
        &mut self,
        op: Opcode,
        class: RegClass,
        cond: Cond,
        srcs: &[Operand],
    ) -> Pending {
        let value = self.new_temp(class);
        let inst = self.emit_with(op, Dst::Temp(value), srcs, |i| i.cond = cond);
        Pending { inst, value }
    }

    pub(super) fn emit_unpack(
        &mut self,
        op: Opcode,
        class: RegClass,
        unpack: crate::vir::Unpack,
        srcs: &[Operand],
    ) -> Pending {
        let value = self.new_temp(class);
        let inst = self.emit_with(op, Dst::Temp(value), srcs, |i| i.unpack = unpack);
        Pending { inst, value }
    }

    /// Emit `op` for its flag push only.
    pub(super) fn emit_flags(&mut self, op: Opcode, srcs: &[Operand], pf: PushFlag) -> InstId {
        self.emit_with(op, Dst::Null, srcs, |i| i.pf = Some(pf))
    }

    /// Emit `op` for its flag update only.
    pub(super) fn emit_update(&mut self, op: Opcode, srcs: &[Operand], uf: UpdateFlag) -> InstId {
        self.emit_with(op, Dst::Null, srcs, |i| i.uf = Some(uf))
    }

    pub(super) fn mov(&mut self, src: Operand) -> Pending {
        self.emit(Opcode::Mov, RegClass::Full, &[src])
    }

    /// Load a uniform-pool entry into a fresh temporary.
    pub(super) fn uniform_pending(&mut self, contents: UniformContents) -> Pending {
        let id = self.module.uniforms.add(contents);
        let value = self.new_temp(RegClass::Full);
        let inst = self.push({
            let mut inst = Inst::new(Opcode::LdUnif, Dst::Temp(value), Vec::new());
            inst.uniform = Some(id);
            inst
        });
        Pending { inst, value }
    }

    pub(super) fn uniform(&mut self, contents: UniformContents) -> Operand {
        self.uniform_pending(contents).operand()
    }

    /// A 32-bit immediate: inline when encodable, otherwise from the pool.
    pub(super) fn imm(&mut self, bits: u32) -> Operand {
        if small_imm_encodable(bits) {
            Operand::SmallImm(bits)
        } else {
            self.uniform(UniformContents::Constant(bits))
        }
    }

    pub(super) fn fimm(&mut self, value: f32) -> Operand {
        self.imm(value.to_bits())
    }

    pub(super) fn branch(&mut self, cond: BranchCond, target: BlockId, msfign: bool) -> InstId {
        self.emit_with(Opcode::Branch, Dst::Null, &[], |i| {
            i.branch = Some(Branch {
                cond,
                msfign,
                target,
            })
        })
    }

    pub(super) fn exec_mask(&self) -> CompileResult<ValueId> {
        self.exec
            .ok_or_else(|| CompileError::structural("execution mask used in uniform flow"))
    }

    /// `MOV.pushz -, exec`: A is set on the active lanes.
    pub(super) fn push_exec_z(&mut self) -> CompileResult<InstId> {
        let exec = self.exec_mask()?;
        Ok(self.emit_flags(Opcode::Mov, &[Operand::Temp(exec)], PushFlag::PushZ))
    }

    /// Bind word `index` of an SSA destination.
    pub(super) fn bind_ssa(&mut self, def: &crate::ir::SsaDef, index: usize, operand: Operand) -> CompileResult<()> {
        if !self.values.is_bound(def.id) {
            self.values.bind(def)?;
        }
        self.values.set(def.id, index, operand)
    }

    /// Store word `index` (`component * words + word`) of a destination.
    pub(super) fn store_dest(&mut self, dest: &Dest, index: usize, pending: Pending) -> CompileResult<()> {
        match dest {
            Dest::Ssa(def) => self.bind_ssa(def, index, pending.operand()),
            Dest::Var(vref) => {
                let words = self.values.variable(vref.var)?.words as usize;
                let component = vref.component as u32 + (index / words) as u32;
                let word = (index % words) as u32;
                match vref.indirect {
                    Some(_) => self.write_var_indirect(vref, component, word, pending.operand()),
                    None => {
                        let slot =
                            self.values
                                .var_slot(vref.var, vref.base_offset, component, word)?;
                        self.store_var(pending, slot);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Pending rewrite of a result into a variable slot.
    pub(super) fn store_var(&mut self, pending: Pending, slot: ValueId) {
        let divergent = self.in_divergent_flow();
        let inst = self.module.inst(pending.inst);
        let needs_mov = self.module.last_inst(self.cur_block) != Some(pending.inst)
            || (divergent && (inst.reads_flags() || inst.is_ld_signal() || inst.pf.is_some()));

        let target = if needs_mov {
            self.mov(Operand::Temp(pending.value))
        } else {
            pending
        };

        self.module.value_mut(target.value).kind = ValueKind::Retired;
        self.module.inst_mut(target.inst).dst = Dst::Temp(slot);

        if let Some(exec) = self.exec {
            let mut test = Inst::new(Opcode::Mov, Dst::Null, vec![Operand::Temp(exec)]);
            test.pf = Some(PushFlag::PushZ);
            self.module.insert_before(self.cur_block, target.inst, test);
            self.session.record_instruction(Opcode::Mov.name());
            self.module.inst_mut(target.inst).cond = Cond::IfA;
        }
    }

    /// Resolve word `index` of an SSA value, materializing a deferred comparison.
    pub(super) fn ssa_word(&mut self, id: SsaId, index: usize) -> CompileResult<Operand> {
        if let Some(instr) = self.values.deferred(id) {
            self.materialize_comparison(id, instr)?;
        }
        self.values.lookup_word(id, index)
    }

    /// Resolve word `index` (`component * words + word`) of a source.
    pub(super) fn get_src(&mut self, src: &Src, index: usize) -> CompileResult<Operand> {
        match src {
            Src::Ssa(id) => self.ssa_word(*id, index),
            Src::Var(vref) => {
                let words = self.values.variable(vref.var)?.words as usize;
                let component = vref.component as u32 + (index / words) as u32;
                self.read_var(vref, component, (index % words) as u32)
            }
        }
    }

    fn check_element(&self, vref: &VarRef) -> CompileResult<(u32, RegClass)> {
        let slots = self.values.variable(vref.var)?;
        if vref.base_offset >= slots.elements {
            return Err(CompileError::VariableOutOfBounds {
                var: slots.name.clone(),
                index: vref.base_offset,
                len: slots.elements,
            });
        }
        let class = self
            .shader
            .variables
            .get(vref.var.index())
            .map(|v| RegClass::for_bit_size(v.bit_size))
            .unwrap_or(RegClass::Full);
        Ok((slots.elements, class))
    }

    fn read_var(&mut self, vref: &VarRef, component: u32, word: u32) -> CompileResult<Operand> {
        let Some(index) = vref.indirect else {
            let slot = self
                .values
                .var_slot(vref.var, vref.base_offset, component, word)?;
            return Ok(Operand::Temp(slot));
        };

        let (elements, class) = self.check_element(vref)?;
        let index = self.ssa_word(index, 0)?;
        self.module.uses_indirect = true;

        // Out-of-range indices read the first addressable element.
        let result = self.module.new_value(class, ValueKind::Scratch);
        let first = self
            .values
            .var_slot(vref.var, vref.base_offset, component, word)?;
        self.emit_with(Opcode::Mov, Dst::Temp(result), &[Operand::Temp(first)], |_| {});
        for element in vref.base_offset + 1..elements {
            let key = self.imm(element - vref.base_offset);
            self.emit_flags(Opcode::Xor, &[index, key], PushFlag::PushZ);
            let slot = self.values.var_slot(vref.var, element, component, word)?;
            self.emit_with(Opcode::Mov, Dst::Temp(result), &[Operand::Temp(slot)], |i| {
                i.cond = Cond::IfA
            });
        }
        Ok(Operand::Temp(result))
    }

    fn write_var_indirect(
        &mut self,
        vref: &VarRef,
        component: u32,
        word: u32,
        value: Operand,
    ) -> CompileResult<()> {
        let (elements, _) = self.check_element(vref)?;
        let Some(index) = vref.indirect else {
            return Err(CompileError::structural("indirect store without an index"));
        };
        let index = self.ssa_word(index, 0)?;
        self.module.uses_indirect = true;

        for element in vref.base_offset..elements {
            let key = self.imm(element - vref.base_offset);
            self.emit_flags(Opcode::Xor, &[index, key], PushFlag::PushZ);
            if let Some(exec) = self.exec {
                self.emit_update(Opcode::Mov, &[Operand::Temp(exec)], UpdateFlag::AndZ);
            }
            let slot = self.values.var_slot(vref.var, element, component, word)?;
            self.emit_with(Opcode::Mov, Dst::Temp(slot), &[value], |i| i.cond = Cond::IfA);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CompilationSession, CompileKey};
    use crate::ir::{ShaderBuilder, Stage};
    use bumpalo::Bump;

    #[test]
    fn test_store_var_moves_flag_updates_in_divergent_flow() {
        let shader = ShaderBuilder::new(Stage::Compute).finish().unwrap();
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let key = CompileKey::default();
        let mut c = Compiler::new(&session, &shader, &key);
        c.exec = Some(c.module.new_value(RegClass::Full, ValueKind::ExecMask));

        let value = c.new_temp(RegClass::Full);
        let inst = c.emit_with(Opcode::Mov, Dst::Temp(value), &[Operand::SmallImm(1)], |i| {
            i.uf = Some(UpdateFlag::AndZ)
        });
        let slot = c.module.new_value(RegClass::Full, ValueKind::Scratch);
        c.store_var(Pending { inst, value }, slot);

        // The flag update keeps its destination and is not preceded by a push.
        assert_eq!(c.module.inst(inst).dst, Dst::Temp(value));
        assert_eq!(c.module.inst(inst).pf, None);
        let insts = &c.module.block(c.cur_block).insts;
        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0], inst);
        let test = c.module.inst(insts[1]);
        assert_eq!(test.pf, Some(PushFlag::PushZ));
        let write = c.module.inst(insts[2]);
        assert_eq!(write.op, Opcode::Mov);
        assert_eq!(write.dst, Dst::Temp(slot));
        assert_eq!(write.cond, Cond::IfA);
    }

    #[test]
    fn test_small_imm_encoding() {
        assert!(small_imm_encodable(0));
        assert!(small_imm_encodable(15));
        assert!(small_imm_encodable(-16i32 as u32));
        assert!(!small_imm_encodable(16));
        assert!(!small_imm_encodable(-17i32 as u32));
        assert!(small_imm_encodable(1.0f32.to_bits()));
        assert!(small_imm_encodable(0.5f32.to_bits()));
        assert!(small_imm_encodable(128.0f32.to_bits()));
        assert!(small_imm_encodable((1.0f32 / 256.0).to_bits()));
        assert!(!small_imm_encodable(256.0f32.to_bits()));
        assert!(!small_imm_encodable(3.0f32.to_bits()));
        assert!(!small_imm_encodable((-1.0f32).to_bits()));
        assert!(!small_imm_encodable(0xffff));
    }
}
