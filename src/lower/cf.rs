// This module linearizes the structured control-flow tree into the flat block graph. The
// tree is walked with an explicit worklist allocated in the session arena: a node task
// lowers one tree node, and the end-of-then, end-of-if and end-of-loop tasks finish a
// construct after its body has been emitted, so arbitrarily deep nesting never recurses.
// Uniform ifs are plain conditional branches. Divergent ifs and loops keep an execution
// mask per lane that is 0 for active lanes and otherwise names the block the lane resumes
// at; each block that can be resumed reactivates its waiting lanes on entry, and branches
// skip a region only when no lane is active in it. A loop is lowered with real branches
// when it is flagged uniform, flow is uniform at entry, and none of its break/continue
// jumps sits under a divergent if; otherwise break/continue just park lanes in the mask.

//! Control-flow linearization.

use super::Compiler;
use crate::core::{CompileError, CompileResult};
use crate::ir::{CfNode, IfNode, Instr, JumpKind, LoopNode, Src};
use crate::vir::{
    BlockId, BranchCond, Cond, Dst, Opcode, Operand, PushFlag, RegClass, UpdateFlag, ValueId,
    ValueKind,
};
use bumpalo::collections::Vec as BumpVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LoopKind {
    Uniform,
    Divergent,
}

/// Jump targets of the innermost loop.
#[derive(Debug, Clone, Copy)]
pub(super) struct LoopTargets {
    kind: LoopKind,
    cont: BlockId,
    brk: BlockId,
}

#[derive(Debug, Clone, Copy)]
struct IfState<'s> {
    node: &'s IfNode,
    divergent: bool,
    was_uniform: bool,
    else_block: BlockId,
    after_block: BlockId,
}

#[derive(Debug, Clone, Copy)]
struct LoopState {
    targets: LoopTargets,
    was_uniform: bool,
}

enum Task<'s> {
    Node(&'s CfNode),
    ThenEnd(IfState<'s>),
    IfEnd(IfState<'s>),
    LoopEnd(LoopState),
}

/// Whether a break/continue of this loop sits under a divergent if.
fn has_divergent_jump(body: &[CfNode]) -> bool {
    let mut stack: Vec<(&[CfNode], bool)> = vec![(body, false)];
    while let Some((nodes, divergent)) = stack.pop() {
        for node in nodes {
            match node {
                CfNode::Block(instrs) => {
                    let jumps = instrs.iter().any(|i| {
                        matches!(i, Instr::Jump(JumpKind::Break | JumpKind::Continue))
                    });
                    if jumps && divergent {
                        return true;
                    }
                }
                CfNode::If(node) => {
                    let divergent = divergent || !node.uniform;
                    stack.push((&node.then_body, divergent));
                    stack.push((&node.else_body, divergent));
                }
                // Jumps in nested loops belong to those loops.
                CfNode::Loop(_) => {}
            }
        }
    }
    false
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    /// Lower the whole control-flow tree.
    pub(super) fn emit_body(&mut self) -> CompileResult<()> {
        let arena = self.session.arena();
        let mut work: BumpVec<'_, Task<'s>> = BumpVec::new_in(arena);
        for node in self.shader.body.iter().rev() {
            work.push(Task::Node(node));
        }

        while let Some(task) = work.pop() {
            match task {
                Task::Node(CfNode::Block(instrs)) => {
                    for instr in instrs {
                        self.emit_instr(instr)?;
                    }
                }
                Task::Node(CfNode::If(node)) => {
                    let state = self.begin_if(node)?;
                    work.push(Task::IfEnd(state));
                    work.push(Task::ThenEnd(state));
                    for child in node.then_body.iter().rev() {
                        work.push(Task::Node(child));
                    }
                }
                Task::Node(CfNode::Loop(node)) => {
                    let state = self.begin_loop(node)?;
                    work.push(Task::LoopEnd(state));
                    for child in node.body.iter().rev() {
                        work.push(Task::Node(child));
                    }
                }
                Task::ThenEnd(state) => {
                    if self.end_then(&state)? {
                        for child in state.node.else_body.iter().rev() {
                            work.push(Task::Node(child));
                        }
                    }
                }
                Task::IfEnd(state) => self.end_if(&state)?,
                Task::LoopEnd(state) => self.end_loop(&state)?,
            }
        }
        Ok(())
    }

    fn emit_instr(&mut self, instr: &'s Instr) -> CompileResult<()> {
        match instr {
            Instr::Alu(alu) => self.emit_alu(alu),
            Instr::Intrinsic(intr) => self.emit_intrinsic(intr),
            Instr::Tex(tex) => self.emit_tex(tex),
            Instr::LoadConst { def, values } => self.emit_load_const(def, values),
            Instr::Undef(def) => self.emit_undef(def),
            Instr::Jump(kind) => self.emit_jump(*kind),
        }
    }

    fn enter_cf(&mut self) {
        self.cf_depth += 1;
        self.module.max_cf_depth = self.module.max_cf_depth.max(self.cf_depth);
    }

    /// Start divergent flow with every lane active.
    fn introduce_exec(&mut self) -> ValueId {
        let exec = self.module.new_value(RegClass::Full, ValueKind::ExecMask);
        self.module.exec_masks.push(exec);
        self.emit_with(Opcode::Mov, Dst::Temp(exec), &[Operand::SmallImm(0)], |_| {});
        self.exec = Some(exec);
        exec
    }

    /// Reactivate the lanes waiting on the current block.
    fn activate_exec_for_block(&mut self) -> CompileResult<()> {
        let exec = self.exec_mask()?;
        let index = self.imm(self.cur_block.0);
        self.emit_flags(Opcode::Xor, &[Operand::Temp(exec), index], PushFlag::PushZ);
        self.emit_with(Opcode::Mov, Dst::Temp(exec), &[Operand::SmallImm(0)], |i| {
            i.cond = Cond::IfA
        });
        Ok(())
    }

    fn check_condition(&self, condition: &Src) -> CompileResult<()> {
        let (components, bits) = match condition {
            Src::Ssa(id) => self.values.shape(*id)?,
            Src::Var(_) => (1, self.src_bit_size(condition)?),
        };
        if components != 1 || !matches!(bits, 1 | 32) {
            return Err(CompileError::unsupported(
                "if condition",
                format!("{components}x{bits}-bit value"),
            ));
        }
        Ok(())
    }

    fn begin_if(&mut self, node: &'s IfNode) -> CompileResult<IfState<'s>> {
        self.check_condition(&node.condition)?;
        let divergent = !node.uniform || self.in_divergent_flow();
        self.session.record_if(divergent);
        log::debug!(
            "{} if at depth {}",
            if divergent { "divergent" } else { "uniform" },
            self.cf_depth
        );
        self.enter_cf();

        let then_block = self.module.new_block();
        let after_block = self.module.new_block();
        let else_block = if node.else_body.is_empty() {
            after_block
        } else {
            self.module.new_block()
        };
        let state = IfState {
            node,
            divergent,
            was_uniform: self.exec.is_none(),
            else_block,
            after_block,
        };

        if divergent {
            let exec = match self.exec {
                Some(exec) => exec,
                None => self.introduce_exec(),
            };
            let mut cond = self.bool_to_cond(&node.condition, 0)?;
            if state.was_uniform {
                cond = cond.invert();
            } else {
                // Lanes that are active and fail the condition.
                let uf = if cond == Cond::IfA {
                    UpdateFlag::NorNz
                } else {
                    UpdateFlag::AndZ
                };
                self.emit_update(Opcode::Mov, &[Operand::Temp(exec)], uf);
                cond = Cond::IfA;
            }
            let else_index = self.imm(else_block.0);
            self.emit_with(Opcode::Mov, Dst::Temp(exec), &[else_index], |i| i.cond = cond);
            self.push_exec_z()?;
            self.branch(BranchCond::AllNa, else_block, false);
        } else {
            let cond = self.bool_to_cond(&node.condition, 0)?;
            let branch = if cond == Cond::IfA {
                BranchCond::AllNa
            } else {
                BranchCond::AllA
            };
            self.branch(branch, else_block, false);
        }
        self.module.link(self.cur_block, else_block);
        self.module.link(self.cur_block, then_block);
        self.set_emit_block(then_block);
        Ok(state)
    }

    /// Finish the then branch. Returns whether an else body follows.
    fn end_then(&mut self, state: &IfState<'s>) -> CompileResult<bool> {
        if state.node.else_body.is_empty() {
            return Ok(false);
        }
        if state.divergent {
            let exec = self.exec_mask()?;
            self.push_exec_z()?;
            let after_index = self.imm(state.after_block.0);
            self.emit_with(Opcode::Mov, Dst::Temp(exec), &[after_index], |i| {
                i.cond = Cond::IfA
            });
            self.emit_flags(Opcode::Xor, &[Operand::Temp(exec), after_index], PushFlag::PushZ);
            self.branch(BranchCond::AllA, state.after_block, false);
            self.module.link(self.cur_block, state.after_block);
            self.module.link(self.cur_block, state.else_block);
            self.set_emit_block(state.else_block);
            self.activate_exec_for_block()?;
        } else {
            self.branch(BranchCond::Always, state.after_block, false);
            self.module.link(self.cur_block, state.after_block);
            self.set_emit_block(state.else_block);
        }
        Ok(true)
    }

    fn end_if(&mut self, state: &IfState<'s>) -> CompileResult<()> {
        self.module.link(self.cur_block, state.after_block);
        self.set_emit_block(state.after_block);
        if state.divergent {
            if state.was_uniform {
                self.exec = None;
            } else {
                self.activate_exec_for_block()?;
            }
        }
        self.cf_depth -= 1;
        Ok(())
    }

    fn begin_loop(&mut self, node: &'s LoopNode) -> CompileResult<LoopState> {
        let uniform = node.uniform && self.exec.is_none() && !has_divergent_jump(&node.body);
        self.session.record_loop(!uniform);
        log::debug!(
            "{} loop at depth {}",
            if uniform { "uniform" } else { "divergent" },
            self.cf_depth
        );
        self.enter_cf();

        let was_uniform = self.exec.is_none();
        if !uniform && was_uniform {
            self.introduce_exec();
        }
        let cont = self.module.new_block();
        let brk = self.module.new_block();
        let targets = LoopTargets {
            kind: if uniform {
                LoopKind::Uniform
            } else {
                LoopKind::Divergent
            },
            cont,
            brk,
        };
        self.loops.push(targets);

        self.module.link(self.cur_block, cont);
        self.set_emit_block(cont);
        if !uniform {
            // Lanes parked by `continue` in the previous iteration resume here.
            self.activate_exec_for_block()?;
        }
        Ok(LoopState {
            targets,
            was_uniform,
        })
    }

    fn end_loop(&mut self, state: &LoopState) -> CompileResult<()> {
        let LoopTargets { kind, cont, brk } = state.targets;
        match kind {
            LoopKind::Uniform => {
                self.branch(BranchCond::Always, cont, false);
                self.module.link(self.cur_block, cont);
                self.set_emit_block(brk);
            }
            LoopKind::Divergent => {
                let exec = self.exec_mask()?;
                let cont_index = self.imm(cont.0);
                self.emit_flags(Opcode::Xor, &[Operand::Temp(exec), cont_index], PushFlag::PushZ);
                self.emit_with(Opcode::Mov, Dst::Temp(exec), &[Operand::SmallImm(0)], |i| {
                    i.cond = Cond::IfA
                });
                self.push_exec_z()?;
                self.branch(BranchCond::AnyA, cont, true);
                self.module.link(self.cur_block, cont);
                self.module.link(self.cur_block, brk);
                self.set_emit_block(brk);
                if state.was_uniform {
                    self.exec = None;
                } else {
                    self.activate_exec_for_block()?;
                }
            }
        }
        self.loops.pop();
        self.module.loops += 1;
        self.cf_depth -= 1;
        Ok(())
    }

    fn emit_jump(&mut self, kind: JumpKind) -> CompileResult<()> {
        let target = match kind {
            JumpKind::Return => {
                return Err(CompileError::unsupported(
                    "jump",
                    "return must be lowered before the backend",
                ))
            }
            JumpKind::Break | JumpKind::Continue => {
                let targets = self.loops.last().copied().ok_or_else(|| {
                    CompileError::structural(format!("{kind:?} outside of a loop"))
                })?;
                let block = if kind == JumpKind::Break {
                    targets.brk
                } else {
                    targets.cont
                };
                (targets.kind, block)
            }
        };

        match target {
            (LoopKind::Uniform, block) => {
                self.branch(BranchCond::Always, block, false);
                self.module.link(self.cur_block, block);
                let dead = self.module.new_block();
                self.set_emit_block(dead);
            }
            (LoopKind::Divergent, block) => {
                let exec = self.exec_mask()?;
                self.push_exec_z()?;
                let index = self.imm(block.0);
                self.emit_with(Opcode::Mov, Dst::Temp(exec), &[index], |i| i.cond = Cond::IfA);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ShaderBuilder, Stage};

    #[test]
    fn test_divergent_jump_detection() {
        let mut b = ShaderBuilder::new(Stage::Fragment);
        let c = b.imm(1);
        b.begin_loop(true);
        b.begin_if(Src::Ssa(c), true);
        b.jump(JumpKind::Break);
        b.end_if().unwrap();
        b.end_loop().unwrap();
        let shader = b.finish().unwrap();
        let CfNode::Loop(uniform_if_loop) = &shader.body[1] else {
            panic!("expected loop");
        };
        assert!(!has_divergent_jump(&uniform_if_loop.body));

        let mut b = ShaderBuilder::new(Stage::Fragment);
        let c = b.imm(1);
        b.begin_loop(true);
        b.begin_if(Src::Ssa(c), false);
        b.begin_loop(false);
        b.jump(JumpKind::Break);
        b.end_loop().unwrap();
        b.jump(JumpKind::Continue);
        b.end_if().unwrap();
        b.end_loop().unwrap();
        let shader = b.finish().unwrap();
        let CfNode::Loop(divergent_loop) = &shader.body[1] else {
            panic!("expected loop");
        };
        assert!(has_divergent_jump(&divergent_loop.body));
    }
}
