// This module maps portable-IR SSA values and legacy variables to machine operands. SSA ids
// are dense, so the table is a vector indexed by id and sized from Shader::ssa_count; each
// entry holds one operand per 32-bit word of every component once the definition has been
// lowered, the constant payload of LoadConst definitions (so memory lowering can fold
// offsets and atomics can be strength-reduced), the varying offset of fragment inputs that
// were loaded straight from an interpolated varying (texture prefetch keys off that), and a
// deferred comparison when a boolean is consumed only as a predicate. A pre-pass over the
// whole control-flow tree counts uses and records which of them are predicate positions
// (if conditions, bcsel selectors, discard_if operands); that is what decides whether a
// comparison may stay unmaterialized. Variables are pre-allocated as flat slot lists.

//! SSA value and variable bookkeeping.

use crate::core::{CompileError, CompileResult};
use crate::ir::{AluInstr, AluOp, CfNode, Dest, Instr, Intrinsic, Shader, Src, SsaDef, SsaId, VarId};
use crate::vir::{Operand, VariableSlots};

#[derive(Debug, Default, Clone)]
struct Entry<'s> {
    bound: bool,
    num_components: u8,
    bit_size: u8,
    words: Vec<Option<Operand>>,
    constant: Option<Vec<u64>>,
    input_offset: Option<u32>,
    deferred: Option<&'s AluInstr>,
    alu_def: Option<&'s AluInstr>,
}

/// How often an SSA value is read, and from where.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UseInfo {
    pub count: u32,
    /// Reads as an if condition, bcsel selector or discard_if operand.
    pub predicate_uses: u32,
}

/// Per-compile SSA and variable table.
pub struct ValueTable<'s> {
    entries: Vec<Entry<'s>>,
    uses: Vec<UseInfo>,
    variables: Vec<VariableSlots>,
}

impl<'s> ValueTable<'s> {
    /// Size the table for `shader` and count every use.
    pub fn new(shader: &'s Shader) -> Self {
        let count = shader.ssa_count as usize;
        let mut table = Self {
            entries: vec![Entry::default(); count],
            uses: vec![UseInfo::default(); count],
            variables: Vec::new(),
        };
        table.scan(shader);
        table
    }

    fn scan(&mut self, shader: &'s Shader) {
        let mut stack: Vec<&'s [CfNode]> = vec![&shader.body];
        while let Some(nodes) = stack.pop() {
            for node in nodes {
                match node {
                    CfNode::Block(instrs) => {
                        for instr in instrs {
                            self.scan_instr(instr);
                        }
                    }
                    CfNode::If(node) => {
                        self.note_src(&node.condition, true);
                        stack.push(&node.then_body);
                        stack.push(&node.else_body);
                    }
                    CfNode::Loop(node) => stack.push(&node.body),
                }
            }
        }
    }

    fn scan_instr(&mut self, instr: &'s Instr) {
        match instr {
            Instr::Alu(alu) => {
                if let Dest::Ssa(def) = &alu.dest {
                    if let Some(entry) = self.entries.get_mut(def.id.index()) {
                        entry.alu_def = Some(alu);
                    }
                }
                self.note_dest(&alu.dest);
                for (i, src) in alu.srcs.iter().enumerate() {
                    let predicate = i == 0 && alu.op == AluOp::Bcsel;
                    self.note_src(&src.src, predicate);
                }
            }
            Instr::Intrinsic(intr) => {
                if let Some(dest) = &intr.dest {
                    self.note_dest(dest);
                }
                for (i, src) in intr.srcs.iter().enumerate() {
                    let predicate = i == 0 && intr.op == Intrinsic::DiscardIf;
                    self.note_src(src, predicate);
                }
            }
            Instr::Tex(tex) => {
                for src in &tex.srcs {
                    self.note_src(&src.src, false);
                }
            }
            Instr::LoadConst { .. } | Instr::Undef(_) | Instr::Jump(_) => {}
        }
    }

    fn note_ssa(&mut self, id: SsaId, predicate: bool) {
        if let Some(info) = self.uses.get_mut(id.index()) {
            info.count += 1;
            if predicate {
                info.predicate_uses += 1;
            }
        }
    }

    fn note_src(&mut self, src: &Src, predicate: bool) {
        match src {
            Src::Ssa(id) => self.note_ssa(*id, predicate),
            Src::Var(vref) => {
                if let Some(index) = vref.indirect {
                    self.note_ssa(index, false);
                }
            }
        }
    }

    fn note_dest(&mut self, dest: &Dest) {
        if let Dest::Var(vref) = dest {
            if let Some(index) = vref.indirect {
                self.note_ssa(index, false);
            }
        }
    }

    fn entry(&self, id: SsaId) -> CompileResult<&Entry<'s>> {
        self.entries
            .get(id.index())
            .ok_or(CompileError::UndefinedValue { id: id.0 })
    }

    fn entry_mut(&mut self, id: SsaId) -> CompileResult<&mut Entry<'s>> {
        self.entries
            .get_mut(id.index())
            .ok_or(CompileError::UndefinedValue { id: id.0 })
    }

    /// Create storage for a definition. Words are filled in with [`set`](Self::set).
    pub fn bind(&mut self, def: &SsaDef) -> CompileResult<()> {
        let entry = self.entry_mut(def.id)?;
        if entry.bound {
            return Err(CompileError::structural(format!(
                "SSA value %{} defined twice",
                def.id.0
            )));
        }
        entry.bound = true;
        entry.num_components = def.num_components;
        entry.bit_size = def.bit_size;
        entry.words = vec![None; def.num_components as usize * def.words()];
        Ok(())
    }

    pub fn is_bound(&self, id: SsaId) -> bool {
        self.entries.get(id.index()).is_some_and(|e| e.bound)
    }

    /// Set word `index` (`component * words + word`) of a bound value.
    pub fn set(&mut self, id: SsaId, index: usize, operand: Operand) -> CompileResult<()> {
        let entry = self.entry_mut(id)?;
        match entry.words.get_mut(index) {
            Some(slot) => {
                *slot = Some(operand);
                Ok(())
            }
            None => Err(CompileError::structural(format!(
                "word {index} of %{} is out of range",
                id.0
            ))),
        }
    }

    /// All words of a value, in component order.
    pub fn lookup(&self, id: SsaId) -> CompileResult<Vec<Operand>> {
        let entry = self.entry(id)?;
        if !entry.bound {
            return Err(CompileError::UndefinedValue { id: id.0 });
        }
        entry
            .words
            .iter()
            .map(|w| w.ok_or(CompileError::UndefinedValue { id: id.0 }))
            .collect()
    }

    pub fn lookup_word(&self, id: SsaId, index: usize) -> CompileResult<Operand> {
        let entry = self.entry(id)?;
        entry
            .words
            .get(index)
            .copied()
            .flatten()
            .ok_or(CompileError::UndefinedValue { id: id.0 })
    }

    /// `(num_components, bit_size)` of a bound value.
    pub fn shape(&self, id: SsaId) -> CompileResult<(u8, u8)> {
        let entry = self.entry(id)?;
        if !entry.bound {
            return Err(CompileError::UndefinedValue { id: id.0 });
        }
        Ok((entry.num_components, entry.bit_size))
    }

    pub fn set_constant(&mut self, id: SsaId, values: &[u64]) -> CompileResult<()> {
        self.entry_mut(id)?.constant = Some(values.to_vec());
        Ok(())
    }

    pub fn constant(&self, id: SsaId) -> Option<&[u64]> {
        self.entries.get(id.index())?.constant.as_deref()
    }

    /// Constant component of a source, truncated to 32 bits.
    pub fn constant_u32(&self, src: &Src, component: usize) -> Option<u32> {
        match src {
            Src::Ssa(id) => self.constant(*id)?.get(component).map(|v| *v as u32),
            Src::Var(_) => None,
        }
    }

    pub fn set_input_offset(&mut self, id: SsaId, offset: u32) -> CompileResult<()> {
        self.entry_mut(id)?.input_offset = Some(offset);
        Ok(())
    }

    pub fn input_offset(&self, id: SsaId) -> Option<u32> {
        self.entries.get(id.index())?.input_offset
    }

    /// Leave a comparison unmaterialized until its predicate use.
    pub fn defer(&mut self, id: SsaId, instr: &'s AluInstr) -> CompileResult<()> {
        let entry = self.entry_mut(id)?;
        entry.bound = true;
        entry.num_components = 1;
        entry.bit_size = 1;
        entry.words = vec![None];
        entry.deferred = Some(instr);
        Ok(())
    }

    pub fn deferred(&self, id: SsaId) -> Option<&'s AluInstr> {
        self.entries.get(id.index())?.deferred
    }

    /// Forget a deferral once the value has been materialized.
    pub fn clear_deferred(&mut self, id: SsaId) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            entry.deferred = None;
        }
    }

    /// ALU instruction defining `id`, if any.
    pub fn alu_def(&self, id: SsaId) -> Option<&'s AluInstr> {
        self.entries.get(id.index())?.alu_def
    }

    pub fn uses(&self, id: SsaId) -> UseInfo {
        self.uses.get(id.index()).copied().unwrap_or_default()
    }

    /// Whether a comparison result may be consumed directly as a predicate.
    pub fn is_predicate_only(&self, id: SsaId) -> bool {
        let info = self.uses(id);
        info.count == 1 && info.predicate_uses == 1
    }

    pub fn add_variable(&mut self, slots: VariableSlots) {
        self.variables.push(slots);
    }

    pub fn variable(&self, var: VarId) -> CompileResult<&VariableSlots> {
        self.variables.get(var.index()).ok_or_else(|| {
            CompileError::structural(format!("reference to undeclared variable {}", var.0))
        })
    }

    /// Storage slot of `(element, component, word)` of a variable.
    pub fn var_slot(
        &self,
        var: VarId,
        element: u32,
        component: u32,
        word: u32,
    ) -> CompileResult<crate::vir::ValueId> {
        let slots = self.variable(var)?;
        if element >= slots.elements {
            return Err(CompileError::VariableOutOfBounds {
                var: slots.name.clone(),
                index: element,
                len: slots.elements,
            });
        }
        if component >= slots.num_components as u32 {
            return Err(CompileError::structural(format!(
                "component {component} of variable {} is out of range",
                slots.name
            )));
        }
        let index = slots.slot_index(element, component, word);
        slots
            .slots
            .get(index)
            .copied()
            .ok_or_else(|| CompileError::structural(format!("missing slot {index} of {}", slots.name)))
    }

    pub fn into_variables(self) -> Vec<VariableSlots> {
        self.variables
    }
}
