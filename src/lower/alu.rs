// This module lowers portable-IR ALU instructions, constants and undefs. ALU operations
// are scalar: vecN and multi-component moves become one MOV per channel, everything else
// writes channel 0 through a single machine opcode or a short expansion (integer multiply
// from 24-bit halves, range-reduced sine/cosine, sign through predicated moves). Booleans
// follow a small state machine: a comparison whose only use is a predicate position is
// left unmaterialized and re-emitted as a flag push right where that use is lowered; any
// other comparison is materialized immediately with SEL ~0, 0 (or 1.0, 0.0 for the
// float-producing forms). bool_to_cond() is the single entry point that turns any boolean
// source into a flag push plus a lane condition. 64-bit values are carried as two 32-bit
// words and only support moves, constants and the 2x32 split pack/unpack.

//! ALU lowering and the boolean state machine.

use super::{Compiler, Pending};
use crate::core::{CompileError, CompileResult};
use crate::ir::{AluInstr, AluOp, Dest, Src, SsaDef, SsaId};
use crate::vir::{Cond, Dst, Opcode, Operand, PushFlag, RegClass, Unpack, ValueKind};

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn src_bit_size(&self, src: &Src) -> CompileResult<u8> {
        match src {
            Src::Ssa(id) => Ok(self.values.shape(*id)?.1),
            Src::Var(vref) => self
                .shader
                .variables
                .get(vref.var.index())
                .map(|v| v.bit_size)
                .ok_or_else(|| {
                    CompileError::structural(format!("reference to undeclared variable {}", vref.var.0))
                }),
        }
    }

    fn dest_bit_size(&self, dest: &Dest) -> CompileResult<u8> {
        match dest {
            Dest::Ssa(def) => Ok(def.bit_size),
            Dest::Var(vref) => self.src_bit_size(&Src::Var(*vref)),
        }
    }

    /// Word `word` of channel `chan` of ALU source `i`.
    fn alu_src_word(
        &mut self,
        instr: &AluInstr,
        i: usize,
        chan: usize,
        word: usize,
    ) -> CompileResult<Operand> {
        let src = instr.srcs.get(i).ok_or_else(|| {
            CompileError::structural(format!("{} is missing source {i}", instr.op))
        })?;
        let words = if self.src_bit_size(&src.src)? == 64 { 2 } else { 1 };
        let component = src.swizzle.get(chan).copied().unwrap_or(0) as usize;
        self.get_src(&src.src, component * words + word)
    }

    fn alu_src(&mut self, instr: &AluInstr, i: usize) -> CompileResult<Operand> {
        self.alu_src_word(instr, i, 0, 0)
    }

    fn can_defer(&self, instr: &AluInstr) -> bool {
        !instr.op.produces_float_bool()
            && instr.srcs.iter().all(|s| match s.src {
                Src::Ssa(id) => matches!(self.values.shape(id), Ok((_, 32))),
                Src::Var(_) => false,
            })
    }

    pub(super) fn emit_alu(&mut self, instr: &'s AluInstr) -> CompileResult<()> {
        let info = instr.op.info();
        if instr.srcs.len() < info.num_srcs {
            return Err(CompileError::structural(format!(
                "{} takes {} sources, got {}",
                instr.op,
                info.num_srcs,
                instr.srcs.len()
            )));
        }

        if info.is_comparison {
            if let Dest::Ssa(def) = &instr.dest {
                if def.num_components == 1
                    && self.values.is_predicate_only(def.id)
                    && self.can_defer(instr)
                {
                    log::trace!("deferring {} for %{} to its predicate use", instr.op, def.id.0);
                    return self.values.defer(def.id, instr);
                }
            }
        }

        let dest_bits = self.dest_bit_size(&instr.dest)?;
        let mut wide = dest_bits == 64;
        for src in &instr.srcs {
            wide |= self.src_bit_size(&src.src)? == 64;
        }
        if wide {
            return self.emit_alu64(instr);
        }

        match instr.op {
            AluOp::Mov | AluOp::Vec2 | AluOp::Vec3 | AluOp::Vec4 => {
                for chan in 0..self.channels(instr)? {
                    let (i, c) = if instr.op == AluOp::Mov { (0, chan) } else { (chan, 0) };
                    let value = self.alu_src_word(instr, i, c, 0)?;
                    let moved = self.mov(value);
                    self.store_dest(&instr.dest, chan, moved)?;
                }
                Ok(())
            }
            _ => {
                let class = RegClass::for_bit_size(dest_bits);
                let result = self.emit_alu_scalar(instr, class, dest_bits)?;
                self.store_dest(&instr.dest, 0, result)
            }
        }
    }

    /// Channels written by a move or vector gather.
    fn channels(&self, instr: &AluInstr) -> CompileResult<usize> {
        Ok(match (instr.op, &instr.dest) {
            (AluOp::Vec2, _) => 2,
            (AluOp::Vec3, _) => 3,
            (AluOp::Vec4, _) => 4,
            (_, Dest::Ssa(def)) => def.num_components as usize,
            (_, Dest::Var(_)) => match instr.srcs[0].src {
                Src::Ssa(id) => self.values.shape(id)?.0 as usize,
                Src::Var(_) => 1,
            },
        })
    }

    fn unary(&mut self, instr: &AluInstr, op: Opcode, class: RegClass) -> CompileResult<Pending> {
        let a = self.alu_src(instr, 0)?;
        Ok(self.emit(op, class, &[a]))
    }

    fn binary(&mut self, instr: &AluInstr, op: Opcode, class: RegClass) -> CompileResult<Pending> {
        let a = self.alu_src(instr, 0)?;
        let b = self.alu_src(instr, 1)?;
        Ok(self.emit(op, class, &[a, b]))
    }

    fn emit_alu_scalar(
        &mut self,
        instr: &AluInstr,
        class: RegClass,
        dest_bits: u8,
    ) -> CompileResult<Pending> {
        let result = match instr.op {
            AluOp::Fneg => {
                let a = self.alu_src(instr, 0)?;
                let sign = self.imm(if dest_bits == 16 { 1 << 15 } else { 1 << 31 });
                self.emit(Opcode::Xor, class, &[a, sign])
            }
            AluOp::Ineg => self.unary(instr, Opcode::Neg, class)?,
            AluOp::Fabs => {
                let a = self.alu_src(instr, 0)?;
                self.emit_unpack(Opcode::Fmov, class, Unpack::Abs, &[a])
            }
            AluOp::Iabs => {
                let a = self.alu_src(instr, 0)?;
                let neg = self.emit(Opcode::Neg, class, &[a]).operand();
                self.emit(Opcode::Max, class, &[a, neg])
            }
            AluOp::Fadd => self.binary(instr, Opcode::Fadd, class)?,
            AluOp::Fsub => self.binary(instr, Opcode::Fsub, class)?,
            AluOp::Fmul => self.binary(instr, Opcode::Fmul, class)?,
            AluOp::Fmin => self.binary(instr, Opcode::Fmin, class)?,
            AluOp::Fmax => self.binary(instr, Opcode::Fmax, class)?,
            AluOp::Iadd => self.binary(instr, Opcode::Add, class)?,
            AluOp::Isub => self.binary(instr, Opcode::Sub, class)?,
            AluOp::Imul => {
                let a = self.alu_src(instr, 0)?;
                let b = self.alu_src(instr, 1)?;
                self.umul(a, b)
            }
            AluOp::Imin => self.binary(instr, Opcode::Min, class)?,
            AluOp::Imax => self.binary(instr, Opcode::Max, class)?,
            AluOp::Umin => self.binary(instr, Opcode::Umin, class)?,
            AluOp::Umax => self.binary(instr, Opcode::Umax, class)?,
            AluOp::Iand => self.binary(instr, Opcode::And, class)?,
            AluOp::Ior => self.binary(instr, Opcode::Or, class)?,
            AluOp::Ixor => self.binary(instr, Opcode::Xor, class)?,
            AluOp::Inot => self.unary(instr, Opcode::Not, class)?,
            AluOp::Ishl => self.binary(instr, Opcode::Shl, class)?,
            AluOp::Ishr => self.binary(instr, Opcode::Asr, class)?,
            AluOp::Ushr => self.binary(instr, Opcode::Shr, class)?,
            AluOp::UfindMsb => {
                let a = self.alu_src(instr, 0)?;
                let clz = self.emit(Opcode::Clz, class, &[a]).operand();
                let top = self.imm(31);
                self.emit(Opcode::Sub, class, &[top, clz])
            }
            AluOp::F2i32 => {
                let rounded = match instr.srcs[0].src {
                    Src::Ssa(id) => self
                        .values
                        .alu_def(id)
                        .filter(|parent| parent.op == AluOp::FroundEven),
                    Src::Var(_) => None,
                };
                match rounded {
                    Some(parent) => {
                        let a = self.alu_src(parent, 0)?;
                        self.emit(Opcode::Ftoin, class, &[a])
                    }
                    None => self.unary(instr, Opcode::Ftoiz, class)?,
                }
            }
            AluOp::F2u32 => self.unary(instr, Opcode::Ftouz, class)?,
            AluOp::I2f32 => self.unary(instr, Opcode::Itof, class)?,
            AluOp::U2f32 => self.unary(instr, Opcode::Utof, class)?,
            AluOp::B2f32 => {
                let a = self.alu_src(instr, 0)?;
                let one = self.fimm(1.0);
                self.emit(Opcode::And, class, &[a, one])
            }
            AluOp::B2i32 => {
                let a = self.alu_src(instr, 0)?;
                self.emit(Opcode::And, class, &[a, Operand::SmallImm(1)])
            }
            AluOp::F2f16 => {
                let a = self.alu_src(instr, 0)?;
                self.emit(Opcode::Vfpack, RegClass::Half, &[a, Operand::SmallImm(0)])
            }
            AluOp::F2f32 => {
                let a = self.alu_src(instr, 0)?;
                self.emit_unpack(Opcode::Fmov, RegClass::Full, Unpack::L, &[a])
            }
            AluOp::Frcp => self.unary(instr, Opcode::Recip, class)?,
            AluOp::Frsq => self.unary(instr, Opcode::Rsqrt, class)?,
            AluOp::Fexp2 => self.unary(instr, Opcode::Exp, class)?,
            AluOp::Flog2 => self.unary(instr, Opcode::Log, class)?,
            AluOp::Fceil => self.unary(instr, Opcode::Fceil, class)?,
            AluOp::Ffloor => self.unary(instr, Opcode::Ffloor, class)?,
            AluOp::FroundEven => self.unary(instr, Opcode::Fround, class)?,
            AluOp::Ftrunc => self.unary(instr, Opcode::Ftrunc, class)?,
            AluOp::Fsin | AluOp::Fcos => {
                let a = self.alu_src(instr, 0)?;
                self.fsincos(a, instr.op == AluOp::Fcos)
            }
            AluOp::Fsign => {
                let a = self.alu_src(instr, 0)?;
                self.fsign(a)
            }
            AluOp::Fddx => self.unary(instr, Opcode::Fdx, class)?,
            AluOp::Fddy => self.unary(instr, Opcode::Fdy, class)?,
            op if op.info().is_comparison => {
                let cond = self.emit_comparison(instr)?;
                self.sel_bool(cond, op.produces_float_bool())
            }
            AluOp::Bcsel => {
                let b = self.alu_src(instr, 1)?;
                let c = self.alu_src(instr, 2)?;
                let selector = instr.srcs[0];
                let cond = self.bool_to_cond(&selector.src, selector.swizzle[0] as usize)?;
                self.emit_cond(Opcode::Sel, class, cond, &[b, c])
            }
            AluOp::Fcsel => {
                let a = self.alu_src(instr, 0)?;
                let b = self.alu_src(instr, 1)?;
                let c = self.alu_src(instr, 2)?;
                self.emit_flags(Opcode::Mov, &[a], PushFlag::PushZ);
                self.emit_cond(Opcode::Sel, class, Cond::IfNa, &[b, c])
            }
            AluOp::UaddCarry => {
                let a = self.alu_src(instr, 0)?;
                let b = self.alu_src(instr, 1)?;
                self.emit_flags(Opcode::Add, &[a, b], PushFlag::PushC);
                self.sel_bool(Cond::IfA, false)
            }
            AluOp::PackHalf2x16Split => self.binary(instr, Opcode::Vfpack, RegClass::Full)?,
            AluOp::UnpackHalf2x16SplitX | AluOp::UnpackHalf2x16SplitY => {
                let a = self.alu_src(instr, 0)?;
                let half = if instr.op == AluOp::UnpackHalf2x16SplitX {
                    Unpack::L
                } else {
                    Unpack::H
                };
                self.emit_unpack(Opcode::Fmov, RegClass::Full, half, &[a])
            }
            op => {
                return Err(CompileError::unsupported(
                    "ALU op",
                    format!("{op} on {dest_bits}-bit values"),
                ))
            }
        };
        Ok(result)
    }

    fn emit_alu64(&mut self, instr: &AluInstr) -> CompileResult<()> {
        match instr.op {
            AluOp::Mov | AluOp::Vec2 | AluOp::Vec3 | AluOp::Vec4 => {
                for chan in 0..self.channels(instr)? {
                    let (i, c) = if instr.op == AluOp::Mov { (0, chan) } else { (chan, 0) };
                    for word in 0..2 {
                        let value = self.alu_src_word(instr, i, c, word)?;
                        let moved = self.mov(value);
                        self.store_dest(&instr.dest, chan * 2 + word, moved)?;
                    }
                }
                Ok(())
            }
            AluOp::Pack64_2x32Split => {
                let lo = self.alu_src(instr, 0)?;
                let hi = self.alu_src(instr, 1)?;
                let lo = self.mov(lo);
                self.store_dest(&instr.dest, 0, lo)?;
                let hi = self.mov(hi);
                self.store_dest(&instr.dest, 1, hi)
            }
            AluOp::Unpack64_2x32SplitX | AluOp::Unpack64_2x32SplitY => {
                let word = usize::from(instr.op == AluOp::Unpack64_2x32SplitY);
                let value = self.alu_src_word(instr, 0, 0, word)?;
                let moved = self.mov(value);
                self.store_dest(&instr.dest, 0, moved)
            }
            op => Err(CompileError::unsupported("64-bit ALU op", op.to_string())),
        }
    }

    /// Emit the flag push of a comparison and return the condition it leaves.
    pub(super) fn emit_comparison(&mut self, instr: &AluInstr) -> CompileResult<Cond> {
        let a = self.alu_src(instr, 0)?;
        let cond = match instr.op {
            AluOp::I2b => {
                self.emit_flags(Opcode::Mov, &[a], PushFlag::PushZ);
                Cond::IfNa
            }
            AluOp::F2b => {
                self.emit_flags(Opcode::Fmov, &[a], PushFlag::PushZ);
                Cond::IfNa
            }
            op => {
                let b = self.alu_src(instr, 1)?;
                match op {
                    AluOp::Feq | AluOp::Seq | AluOp::Fne | AluOp::Sne => {
                        self.emit_flags(Opcode::Fcmp, &[a, b], PushFlag::PushZ);
                        if matches!(op, AluOp::Feq | AluOp::Seq) {
                            Cond::IfA
                        } else {
                            Cond::IfNa
                        }
                    }
                    AluOp::Flt | AluOp::Slt => {
                        self.emit_flags(Opcode::Fcmp, &[a, b], PushFlag::PushN);
                        Cond::IfA
                    }
                    AluOp::Fge | AluOp::Sge => {
                        self.emit_flags(Opcode::Fcmp, &[b, a], PushFlag::PushC);
                        Cond::IfA
                    }
                    AluOp::Ieq | AluOp::Ine => {
                        self.emit_flags(Opcode::Xor, &[a, b], PushFlag::PushZ);
                        if op == AluOp::Ieq {
                            Cond::IfA
                        } else {
                            Cond::IfNa
                        }
                    }
                    AluOp::Ilt | AluOp::Ige => {
                        self.emit_flags(Opcode::Min, &[b, a], PushFlag::PushC);
                        if op == AluOp::Ilt {
                            Cond::IfA
                        } else {
                            Cond::IfNa
                        }
                    }
                    AluOp::Ult | AluOp::Uge => {
                        self.emit_flags(Opcode::Sub, &[a, b], PushFlag::PushC);
                        if op == AluOp::Ult {
                            Cond::IfA
                        } else {
                            Cond::IfNa
                        }
                    }
                    other => {
                        return Err(CompileError::structural(format!(
                            "{other} is not a comparison"
                        )))
                    }
                }
            }
        };
        Ok(cond)
    }

    /// `SEL.cond ~0, 0`, or `1.0, 0.0` for float booleans.
    fn sel_bool(&mut self, cond: Cond, float: bool) -> Pending {
        let (on, off) = if float {
            (self.fimm(1.0), self.fimm(0.0))
        } else {
            (self.imm(!0), self.imm(0))
        };
        self.emit_cond(Opcode::Sel, RegClass::Full, cond, &[on, off])
    }

    /// Bind a deferred comparison to a real boolean value.
    pub(super) fn materialize_comparison(
        &mut self,
        id: SsaId,
        instr: &AluInstr,
    ) -> CompileResult<()> {
        log::trace!("materializing deferred {} for %{}", instr.op, id.0);
        let cond = self.emit_comparison(instr)?;
        let value = self.sel_bool(cond, instr.op.produces_float_bool());
        self.values.clear_deferred(id);
        self.values.set(id, 0, value.operand())
    }

    /// Turn a boolean source into flags and the condition selecting true lanes.
    pub(super) fn bool_to_cond(&mut self, src: &Src, component: usize) -> CompileResult<Cond> {
        if let Src::Ssa(id) = src {
            if let Some(instr) = self.values.deferred(*id) {
                return self.emit_comparison(instr);
            }
        }
        let value = self.get_src(src, component)?;
        self.emit_flags(Opcode::Mov, &[value], PushFlag::PushZ);
        Ok(Cond::IfNa)
    }

    /// 32-bit multiply from 24-bit partial products.
    pub(super) fn umul(&mut self, a: Operand, b: Operand) -> Pending {
        let full = RegClass::Full;
        let shift = self.imm(24);
        let a_hi = self.emit(Opcode::Shr, full, &[a, shift]).operand();
        let b_hi = self.emit(Opcode::Shr, full, &[b, shift]).operand();
        let lolo = self.emit(Opcode::Umul24, full, &[a, b]).operand();
        let hilo = self.emit(Opcode::Umul24, full, &[a_hi, b]).operand();
        let lohi = self.emit(Opcode::Umul24, full, &[a, b_hi]).operand();
        let cross = self.emit(Opcode::Add, full, &[hilo, lohi]).operand();
        let cross = self.emit(Opcode::Shl, full, &[cross, shift]).operand();
        self.emit(Opcode::Add, full, &[lolo, cross])
    }

    fn fsincos(&mut self, src: Operand, is_cos: bool) -> Pending {
        let full = RegClass::Full;
        let inv_pi = self.fimm(std::f32::consts::FRAC_1_PI);
        let mut input = self.emit(Opcode::Fmul, full, &[src, inv_pi]).operand();
        if is_cos {
            let half = self.fimm(0.5);
            input = self.emit(Opcode::Fadd, full, &[input, half]).operand();
        }
        let periods = self.emit(Opcode::Fround, full, &[input]).operand();
        let reduced = self.emit(Opcode::Fsub, full, &[input, periods]).operand();
        let sin = self.emit(Opcode::Sin, full, &[reduced]).operand();
        let whole = self.emit(Opcode::Ftoin, full, &[periods]).operand();
        let sign = self
            .emit(Opcode::Shl, full, &[whole, Operand::SmallImm(-1i32 as u32)])
            .operand();
        self.emit(Opcode::Xor, full, &[sin, sign])
    }

    fn fsign(&mut self, src: Operand) -> Pending {
        let t = self.module.new_value(RegClass::Full, ValueKind::Scratch);
        self.emit_with(Opcode::Mov, Dst::Temp(t), &[Operand::SmallImm(0)], |_| {});
        self.emit_flags(Opcode::Fmov, &[src], PushFlag::PushZ);
        let one = self.fimm(1.0);
        self.emit_with(Opcode::Mov, Dst::Temp(t), &[one], |i| i.cond = Cond::IfNa);
        self.emit_flags(Opcode::Fmov, &[src], PushFlag::PushN);
        let minus_one = self.fimm(-1.0);
        self.emit_with(Opcode::Mov, Dst::Temp(t), &[minus_one], |i| i.cond = Cond::IfA);
        self.mov(Operand::Temp(t))
    }

    pub(super) fn emit_load_const(&mut self, def: &SsaDef, values: &[u64]) -> CompileResult<()> {
        if values.len() != def.num_components as usize {
            return Err(CompileError::structural(format!(
                "constant %{} has {} values for {} components",
                def.id.0,
                values.len(),
                def.num_components
            )));
        }
        self.values.bind(def)?;
        self.values.set_constant(def.id, values)?;
        let words = def.words();
        for (c, &value) in values.iter().enumerate() {
            let parts: [u32; 2] = match def.bit_size {
                64 => [value as u32, (value >> 32) as u32],
                1 => [if value != 0 { !0 } else { 0 }, 0],
                8 => [value as u8 as u32, 0],
                16 => [value as u16 as u32, 0],
                _ => [value as u32, 0],
            };
            for (w, &bits) in parts.iter().take(words).enumerate() {
                let operand = self.imm(bits);
                self.values.set(def.id, c * words + w, operand)?;
            }
        }
        Ok(())
    }

    pub(super) fn emit_undef(&mut self, def: &SsaDef) -> CompileResult<()> {
        self.values.bind(def)?;
        for index in 0..def.num_components as usize * def.words() {
            let zero = self.uniform(crate::vir::UniformContents::Constant(0));
            self.values.set(def.id, index, zero)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::compile_text;
    use crate::core::{CompileKey, ErrorKind};
    use crate::vir::{Module, Opcode, PushFlag, UniformContents};

    fn lower(text: &str) -> Module {
        compile_text(text, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"))
    }

    fn count(module: &Module, op: Opcode) -> usize {
        module.instructions().filter(|(_, _, inst)| inst.op == op).count()
    }

    const HEADER: &str = "\
stage compute
%six:32x1 = load_const 6
%lane:32x1 = load_subgroup_id
%c:1x1 = ilt %lane %six
";

    #[test]
    fn test_single_predicate_use_stays_deferred() {
        let module = lower(&format!("{HEADER}%x:32x1 = bcsel %c %lane %six\n"));
        // Only the bcsel itself selects; the comparison became its flag push.
        assert_eq!(count(&module, Opcode::Sel), 1, "{module}");
    }

    #[test]
    fn test_shared_comparison_is_materialized() {
        let module = lower(&format!(
            "{HEADER}%x:32x1 = bcsel %c %lane %six\n%y:32x1 = bcsel %c %six %lane\n"
        ));
        assert_eq!(count(&module, Opcode::Sel), 3, "{module}");
        let tests = module
            .instructions()
            .filter(|(_, _, inst)| inst.op == Opcode::Mov && inst.pf == Some(PushFlag::PushZ))
            .count();
        assert_eq!(tests, 2, "{module}");
    }

    #[test]
    fn test_imul_uses_24_bit_products() {
        let module = lower("stage compute\n%lane:32x1 = load_subgroup_id\n%m:32x1 = imul %lane %lane\n");
        assert_eq!(count(&module, Opcode::Umul24), 3);
    }

    #[test]
    fn test_fsign_predicates_on_zero_and_negative() {
        let module = lower("stage compute\n%lane:32x1 = load_subgroup_id\n%s:32x1 = fsign %lane\n");
        let pushes: Vec<_> = module
            .instructions()
            .filter(|(_, _, inst)| inst.op == Opcode::Fmov)
            .map(|(_, _, inst)| inst.pf)
            .collect();
        assert_eq!(pushes, vec![Some(PushFlag::PushZ), Some(PushFlag::PushN)]);
    }

    #[test]
    fn test_64_bit_arithmetic_is_unsupported() {
        let text = "stage compute\n%a:64x1 = load_const 4294967298\n%b:64x1 = iadd %a %a\n";
        let err = compile_text(text, &CompileKey::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        let module = lower("stage compute\n%a:64x1 = load_const 4294967298\n%hi:32x1 = unpack_64_2x32_split_y %a\n");
        // The two compute payload saves, then the high word.
        assert_eq!(count(&module, Opcode::Mov), 3);
    }

    #[test]
    fn test_undef_reads_zero_uniform() {
        let module = lower("stage compute\n%u:32x2 = undef\n%s:32x1 = iadd %u.x %u.y\n");
        let zero_loads = module
            .instructions()
            .filter(|(_, _, inst)| {
                inst.op == Opcode::LdUnif
                    && inst.uniform.and_then(|u| module.uniforms.get(u)) == Some(&UniformContents::Constant(0))
            })
            .count();
        assert_eq!(zero_loads, 2);
    }
}
