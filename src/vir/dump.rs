// This module renders a Module as text: a header with the stage, name and lane-group
// count, then every block in layout order with its predecessors, one instruction per line.
// The line format is `op.modifiers dst, src0, src1 ; annotations`, where the annotations
// name the uniform (with its contents), the TMU type tag, signals and barrier classes.
// This is what the virc tool prints and what the CHECK-directive tests match against.

use super::*;
use std::fmt::{self, Write};

fn fmt_operand(op: &Operand) -> String {
    match op {
        Operand::Temp(v) => format!("%{}", v.0),
        Operand::Hw(reg) => reg.to_string(),
        Operand::SmallImm(bits) => {
            let signed = *bits as i32;
            if (-16..=15).contains(&signed) {
                format!("#{signed}")
            } else {
                format!("#{:?}", f32::from_bits(*bits))
            }
        }
        Operand::Null => "-".to_string(),
    }
}

fn fmt_dst(dst: &Dst) -> String {
    match dst {
        Dst::Temp(v) => format!("%{}", v.0),
        Dst::Magic(w) => w.name().to_string(),
        Dst::Null => "-".to_string(),
    }
}

impl Module {
    /// Render one instruction.
    pub fn display_inst(&self, id: InstId) -> String {
        let inst = self.inst(id);
        let mut line = String::new();
        line.push_str(inst.op.name());
        line.push_str(&opcode::modifier_suffix(inst.cond, inst.pf, inst.uf, inst.unpack));

        if let Some(branch) = &inst.branch {
            let _ = write!(line, ".{}", branch.cond.name());
            if branch.msfign {
                line.push_str(".msfign");
            }
            let _ = write!(line, " block{}", branch.target.0);
        } else if inst.dst != Dst::Null || !inst.srcs.is_empty() {
            let mut operands = vec![fmt_dst(&inst.dst)];
            operands.extend(inst.srcs.iter().map(fmt_operand));
            line.push(' ');
            line.push_str(&operands.join(", "));
        }

        let mut notes = Vec::new();
        if let Some(u) = inst.uniform {
            match self.uniforms.get(u) {
                Some(contents) => notes.push(format!("u{}={}", u.0, contents)),
                None => notes.push(format!("u{}=?", u.0)),
            }
        }
        if let Some(tag) = &inst.tmu {
            notes.push(format!(
                "tmu({} {} {})",
                tag.op.name(),
                tag.ty.name(),
                tag.components
            ));
        }
        if inst.sig.thrsw {
            notes.push("thrsw".to_string());
        }
        if inst.sig.last_thrsw {
            notes.push("last_thrsw".to_string());
        }
        if !inst.barrier.is_empty() {
            notes.push(format!("barrier({})", inst.barrier));
        }
        if !notes.is_empty() {
            line.push_str(" ; ");
            line.push_str(&notes.join(" "));
        }
        line
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shader {} {}", self.stage.name(), self.name)?;
        writeln!(f, "threads {}", self.threads)?;
        for &block in &self.layout {
            let b = self.block(block);
            write!(f, "block{}:", block.0)?;
            if !b.preds.is_empty() {
                let preds: Vec<_> = b.preds.iter().map(|p| format!("block{}", p.0)).collect();
                write!(f, " ; preds {}", preds.join(", "))?;
            }
            writeln!(f)?;
            for &inst in &b.insts {
                writeln!(f, "  {}", self.display_inst(inst))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_format() {
        let mut m = Module::new("main", Stage::Fragment, 2);
        let b0 = m.new_block();
        let b1 = m.new_block();
        m.layout.extend([b0, b1]);
        m.link(b0, b1);

        let v = m.new_value(RegClass::Full, ValueKind::Ssa { def: None });
        let mut ld = Inst::new(Opcode::LdUnif, Dst::Temp(v), vec![]);
        ld.uniform = Some(m.uniforms.add(UniformContents::Constant(0x3f800000)));
        m.append(b0, ld);

        let mut push = Inst::new(Opcode::Mov, Dst::Null, vec![Operand::Temp(v)]);
        push.pf = Some(PushFlag::PushZ);
        m.append(b0, push);

        let mut br = Inst::new(Opcode::Branch, Dst::Null, vec![]);
        br.branch = Some(Branch {
            cond: BranchCond::AnyA,
            msfign: true,
            target: b1,
        });
        m.append(b0, br);

        let mut nop = Inst::new(Opcode::Nop, Dst::Null, vec![]);
        nop.sig.thrsw = true;
        m.append(b1, nop);

        let mut store = Inst::new(Opcode::Mov, Dst::Magic(Waddr::Tmud), vec![Operand::SmallImm(-1i32 as u32)]);
        store.cond = Cond::IfA;
        m.append(b1, store);

        let text = m.to_string();
        let expected = "shader fragment main\n\
                        threads 2\n\
                        block0:\n  ldunif %0 ; u0=0x3f800000\n  mov.pushz -, %0\n  branch.anya.msfign block1\n\
                        block1: ; preds block0\n  nop ; thrsw\n  mov.ifa tmud, #-1\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_small_imm_float_rendering() {
        assert_eq!(fmt_operand(&Operand::SmallImm(2.0f32.to_bits())), "#2.0");
        assert_eq!(fmt_operand(&Operand::SmallImm(15)), "#15");
        assert_eq!(fmt_operand(&Operand::Hw(HwReg::R5)), "r5");
    }
}
