// This module provides ShaderBuilder, a small programmatic constructor for portable-IR
// shaders. It hands out dense SSA ids, appends instructions to the innermost open
// block, and keeps a stack of open if/loop frames so nested control flow can be written
// in program order with begin_if/begin_else/end_if and begin_loop/end_loop. The textual
// parser in crate::text drives this same builder, and the integration tests use it
// directly for shaders that are awkward to spell in text. finish() refuses to produce a
// shader while frames are still open.

//! Programmatic construction of portable-IR shaders.

use super::*;
use crate::core::{CompileError, CompileResult};

enum Frame {
    Then {
        condition: Src,
        uniform: bool,
        nodes: Vec<CfNode>,
    },
    Else {
        condition: Src,
        uniform: bool,
        then_body: Vec<CfNode>,
        nodes: Vec<CfNode>,
    },
    Loop {
        uniform: bool,
        nodes: Vec<CfNode>,
    },
}

impl Frame {
    fn nodes_mut(&mut self) -> &mut Vec<CfNode> {
        match self {
            Frame::Then { nodes, .. } | Frame::Else { nodes, .. } | Frame::Loop { nodes, .. } => {
                nodes
            }
        }
    }
}

/// Incremental shader builder.
pub struct ShaderBuilder {
    shader: Shader,
    open: Vec<Frame>,
}

impl ShaderBuilder {
    pub fn new(stage: Stage) -> Self {
        Self {
            shader: Shader::new(stage),
            open: Vec::new(),
        }
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.shader.info.name = name.into();
        self
    }

    pub fn info_mut(&mut self) -> &mut ShaderInfo {
        &mut self.shader.info
    }

    pub fn input(&mut self, var: IoVariable) -> &mut Self {
        self.shader.inputs.push(var);
        self
    }

    pub fn output(&mut self, var: IoVariable) -> &mut Self {
        self.shader.outputs.push(var);
        self
    }

    /// Declare a legacy variable.
    pub fn variable(&mut self, var: Variable) -> VarId {
        let id = VarId(self.shader.variables.len() as u32);
        self.shader.variables.push(var);
        id
    }

    /// Allocate a fresh SSA definition without emitting anything.
    pub fn def(&mut self, num_components: u8, bit_size: u8) -> SsaDef {
        let id = SsaId(self.shader.ssa_count);
        self.shader.ssa_count += 1;
        SsaDef {
            id,
            num_components,
            bit_size,
        }
    }

    /// Append an instruction to the innermost open block.
    pub fn push(&mut self, instr: Instr) {
        let nodes = match self.open.last_mut() {
            Some(frame) => frame.nodes_mut(),
            None => &mut self.shader.body,
        };
        match nodes.last_mut() {
            Some(CfNode::Block(instrs)) => instrs.push(instr),
            _ => nodes.push(CfNode::Block(vec![instr])),
        }
    }

    pub fn load_const(&mut self, bit_size: u8, values: &[u64]) -> SsaDef {
        let def = self.def(values.len() as u8, bit_size);
        self.push(Instr::LoadConst {
            def,
            values: values.to_vec(),
        });
        def
    }

    /// 32-bit scalar constant.
    pub fn imm(&mut self, value: u32) -> SsaId {
        self.load_const(32, &[value as u64]).id
    }

    pub fn fimm(&mut self, value: f32) -> SsaId {
        self.imm(value.to_bits())
    }

    pub fn undef(&mut self, num_components: u8, bit_size: u8) -> SsaDef {
        let def = self.def(num_components, bit_size);
        self.push(Instr::Undef(def));
        def
    }

    /// ALU op writing a fresh scalar (or vecN) SSA value.
    pub fn alu(&mut self, op: AluOp, srcs: &[AluSrc], num_components: u8, bit_size: u8) -> SsaId {
        let def = self.def(num_components, bit_size);
        self.push(Instr::Alu(AluInstr {
            op,
            dest: Dest::Ssa(def),
            srcs: srcs.to_vec(),
        }));
        def.id
    }

    /// Scalar 32-bit ALU op over whole SSA sources.
    pub fn alu32(&mut self, op: AluOp, srcs: &[SsaId]) -> SsaId {
        let srcs: Vec<_> = srcs.iter().map(|s| AluSrc::new(Src::Ssa(*s))).collect();
        let bits = if op.info().is_comparison && !op.produces_float_bool() {
            1
        } else {
            32
        };
        self.alu(op, &srcs, 1, bits)
    }

    /// ALU op writing a variable.
    pub fn alu_to_var(&mut self, op: AluOp, dest: VarRef, srcs: &[AluSrc]) {
        self.push(Instr::Alu(AluInstr {
            op,
            dest: Dest::Var(dest),
            srcs: srcs.to_vec(),
        }));
    }

    /// Intrinsic with an optional fresh SSA destination.
    pub fn intrinsic(
        &mut self,
        op: Intrinsic,
        srcs: &[Src],
        dest: Option<(u8, u8)>,
        indices: IntrinsicIndices,
    ) -> Option<SsaId> {
        let def = dest.map(|(components, bits)| self.def(components, bits));
        let num_components = def.map(|d| d.num_components).unwrap_or_else(|| {
            // Stores count the components of their value operand.
            indices.write_mask.count_ones().max(1) as u8
        });
        self.push(Instr::Intrinsic(IntrinsicInstr {
            op,
            srcs: srcs.to_vec(),
            dest: def.map(Dest::Ssa),
            num_components,
            indices,
        }));
        def.map(|d| d.id)
    }

    pub fn tex(&mut self, mut instr: TexInstr, num_components: u8) -> SsaId {
        let def = self.def(num_components, 32);
        instr.dest = def;
        self.push(Instr::Tex(instr));
        def.id
    }

    pub fn jump(&mut self, kind: JumpKind) {
        self.push(Instr::Jump(kind));
    }

    pub fn begin_if(&mut self, condition: Src, uniform: bool) {
        self.open.push(Frame::Then {
            condition,
            uniform,
            nodes: Vec::new(),
        });
    }

    pub fn begin_else(&mut self) -> CompileResult<()> {
        match self.open.pop() {
            Some(Frame::Then {
                condition,
                uniform,
                nodes,
            }) => {
                self.open.push(Frame::Else {
                    condition,
                    uniform,
                    then_body: nodes,
                    nodes: Vec::new(),
                });
                Ok(())
            }
            other => {
                if let Some(frame) = other {
                    self.open.push(frame);
                }
                Err(CompileError::structural("else without a matching if"))
            }
        }
    }

    pub fn end_if(&mut self) -> CompileResult<()> {
        let node = match self.open.pop() {
            Some(Frame::Then {
                condition,
                uniform,
                nodes,
            }) => IfNode {
                condition,
                uniform,
                then_body: nodes,
                else_body: Vec::new(),
            },
            Some(Frame::Else {
                condition,
                uniform,
                then_body,
                nodes,
            }) => IfNode {
                condition,
                uniform,
                then_body,
                else_body: nodes,
            },
            other => {
                if let Some(frame) = other {
                    self.open.push(frame);
                }
                return Err(CompileError::structural("end of if without a matching if"));
            }
        };
        self.push_node(CfNode::If(node));
        Ok(())
    }

    pub fn begin_loop(&mut self, uniform: bool) {
        self.open.push(Frame::Loop {
            uniform,
            nodes: Vec::new(),
        });
    }

    pub fn end_loop(&mut self) -> CompileResult<()> {
        match self.open.pop() {
            Some(Frame::Loop { uniform, nodes }) => {
                self.push_node(CfNode::Loop(LoopNode {
                    uniform,
                    body: nodes,
                }));
                Ok(())
            }
            other => {
                if let Some(frame) = other {
                    self.open.push(frame);
                }
                Err(CompileError::structural("end of loop without a matching loop"))
            }
        }
    }

    /// Whether any if/loop is still open.
    pub fn is_nested(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn finish(self) -> CompileResult<Shader> {
        if !self.open.is_empty() {
            return Err(CompileError::structural(format!(
                "{} control-flow node(s) left open",
                self.open.len()
            )));
        }
        Ok(self.shader)
    }

    fn push_node(&mut self, node: CfNode) {
        match self.open.last_mut() {
            Some(frame) => frame.nodes_mut().push(node),
            None => self.shader.body.push(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_nesting() {
        let mut b = ShaderBuilder::new(Stage::Fragment);
        let c = b.imm(1);
        b.begin_if(Src::Ssa(c), false);
        b.begin_loop(true);
        b.jump(JumpKind::Break);
        b.end_loop().unwrap();
        b.begin_else().unwrap();
        b.undef(1, 32);
        b.end_if().unwrap();
        let shader = b.finish().unwrap();

        assert_eq!(shader.ssa_count, 2);
        assert_eq!(shader.body.len(), 2);
        match &shader.body[1] {
            CfNode::If(node) => {
                assert!(matches!(node.then_body[0], CfNode::Loop(_)));
                assert_eq!(node.else_body.len(), 1);
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_builder_rejects_unbalanced() {
        let mut b = ShaderBuilder::new(Stage::Vertex);
        assert!(b.end_if().is_err());
        b.begin_loop(false);
        assert!(b.begin_else().is_err());
        assert!(b.is_nested());
        assert!(b.finish().is_err());
    }
}
