// This module defines the machine IR ("VIR") the lowering produces and the downstream
// register allocator consumes. Everything is stored in dense vectors owned by Module and
// addressed by small index newtypes: values (each tagged with a register class and a kind
// saying whether it is an SSA temporary, a variable slot, the execution mask, a scratch
// temporary or a retired definition), instructions (opcode, destination, sources and the
// predicate, flag, unpack, uniform, signal, branch, TMU and barrier modifiers), and blocks
// (instruction id lists with at most two successors). The block layout list records the
// emission order, which is also the fall-through order: a block whose last instruction is
// not an unconditional branch continues with the next block in the layout. The module
// also carries the input/output slot tables, the lane-group count, the aggregate counters
// and the unresolved texture-prefetch placeholders.

//! Machine IR data model.

pub mod dump;
pub mod opcode;
pub mod uniform;

pub use opcode::{
    tmu_config, BarrierClass, BranchCond, Cond, HwReg, OpInfo, Opcode, PushFlag, TmuOp, TmuType,
    Unpack, UpdateFlag, Waddr, TMU_CONFIG_PER_PIXEL,
};
pub use uniform::{SizeQuery, UniformContents, UniformId, UniformPool};

use crate::ir::{Stage, VarId};

/// Dense machine value index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Dense block index, assigned on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Dense instruction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl InstId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Register class of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// 8/16-bit data.
    Half,
    Full,
}

impl RegClass {
    pub fn for_bit_size(bit_size: u8) -> RegClass {
        if bit_size == 8 || bit_size == 16 {
            RegClass::Half
        } else {
            RegClass::Full
        }
    }
}

/// What a value stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Single-definition temporary.
    Ssa { def: Option<InstId> },
    /// Storage slot of a legacy variable.
    Variable { var: VarId, slot: u32 },
    /// Per-lane resume target, 0 for active lanes.
    ExecMask,
    /// Multi-write temporary used by indirect variable reads.
    Scratch,
    /// Temporary whose definition was retargeted into a variable.
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueInfo {
    pub class: RegClass,
    pub kind: ValueKind,
}

/// Instruction source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Temp(ValueId),
    Hw(HwReg),
    /// Raw bits of an inline small immediate.
    SmallImm(u32),
    Null,
}

impl Operand {
    pub fn temp(&self) -> Option<ValueId> {
        match self {
            Operand::Temp(v) => Some(*v),
            _ => None,
        }
    }
}

/// Instruction destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dst {
    Temp(ValueId),
    Magic(Waddr),
    Null,
}

impl Dst {
    pub fn temp(&self) -> Option<ValueId> {
        match self {
            Dst::Temp(v) => Some(*v),
            _ => None,
        }
    }
}

/// Instruction signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals {
    pub thrsw: bool,
    pub last_thrsw: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Branch {
    pub cond: BranchCond,
    /// Ignore lanes with no pixel coverage when aggregating.
    pub msfign: bool,
    pub target: BlockId,
}

/// Type tag of a TMU request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TmuTag {
    pub op: TmuOp,
    pub ty: TmuType,
    pub components: u8,
    pub per_pixel: bool,
}

/// A machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Opcode,
    pub dst: Dst,
    pub srcs: Vec<Operand>,
    pub cond: Cond,
    pub pf: Option<PushFlag>,
    pub uf: Option<UpdateFlag>,
    pub unpack: Unpack,
    pub uniform: Option<UniformId>,
    pub sig: Signals,
    pub branch: Option<Branch>,
    pub tmu: Option<TmuTag>,
    pub barrier: BarrierClass,
}

impl Inst {
    pub fn new(op: Opcode, dst: Dst, srcs: Vec<Operand>) -> Self {
        Self {
            op,
            dst,
            srcs,
            cond: Cond::Always,
            pf: None,
            uf: None,
            unpack: Unpack::None,
            uniform: None,
            sig: Signals::default(),
            branch: None,
            tmu: None,
            barrier: BarrierClass::NONE,
        }
    }

    /// Whether the result comes from a load signal.
    pub fn is_ld_signal(&self) -> bool {
        self.op.info().ld_signal
    }

    /// Whether execution depends on the current flags.
    pub fn reads_flags(&self) -> bool {
        self.cond != Cond::Always || self.uf.is_some()
    }

    pub fn is_thrsw(&self) -> bool {
        self.sig.thrsw
    }

    /// Whether control never falls through to the next block.
    pub fn is_unconditional_branch(&self) -> bool {
        matches!(
            self.branch,
            Some(Branch {
                cond: BranchCond::Always,
                ..
            })
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<InstId>,
    pub succs: [Option<BlockId>; 2],
    pub preds: Vec<BlockId>,
}

/// Interpolation of one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterpFlags {
    pub flat: bool,
    pub noperspective: bool,
    pub centroid: bool,
}

/// Hardware input slot, in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub location: u32,
    pub component: u8,
    pub interp: InterpFlags,
}

/// Output slot, indexed by `driver_location * 4 + component`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSlot {
    pub location: u32,
    pub component: u8,
}

/// Texture fetch the hardware may issue before the shader starts.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchPlaceholder {
    /// The `TexPrefetch` instructions, one per result component.
    pub insts: Vec<InstId>,
    /// `driver_location * 4 + component` of the coordinate varying.
    pub input_offset: u32,
    pub texture: u32,
    pub sampler: u32,
    pub wrmask: u8,
    pub half_precision: bool,
    /// Packed input slot, filled in by the output collector.
    pub resolved_slot: Option<u32>,
}

/// Storage slots of one legacy variable.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSlots {
    pub name: String,
    pub num_components: u8,
    /// 32-bit words per component.
    pub words: u8,
    pub elements: u32,
    pub slots: Vec<ValueId>,
}

impl VariableSlots {
    /// Flat slot index of `(element, component, word)`.
    pub fn slot_index(&self, element: u32, component: u32, word: u32) -> usize {
        let comps = self.num_components as usize;
        let words = self.words as usize;
        (element as usize * comps + component as usize) * words + word as usize
    }
}

/// A compiled shader variant.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub stage: Stage,
    pub values: Vec<ValueInfo>,
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
    /// Emission order, which is also fall-through order.
    pub layout: Vec<BlockId>,
    pub uniforms: UniformPool,
    pub variables: Vec<VariableSlots>,
    /// Every execution mask introduced, in order.
    pub exec_masks: Vec<ValueId>,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<Option<OutputSlot>>,
    /// Vertex attribute sizes in words, by attribute index.
    pub vattr_sizes: Vec<u8>,
    /// Requested number of resident lane groups.
    pub threads: u32,
    /// Fewest lane groups the allocation fallback may go down to.
    pub min_threads: u32,
    pub prefetches: Vec<PrefetchPlaceholder>,

    pub scratch_bytes: u32,
    pub shared_bytes: u32,
    pub uses_indirect: bool,
    pub has_side_effect_memory_op: bool,
    pub uses_discard: bool,
    pub writes_z: bool,
    pub loops: u32,
    pub max_cf_depth: u32,
    pub lock_scoreboard_on_first_thrsw: bool,
    pub uses_center_w: bool,
    pub uses_implicit_point_line_varyings: bool,
    pub local_invocation_index_bits: u32,
}

impl Module {
    pub fn new(name: impl Into<String>, stage: Stage, threads: u32) -> Self {
        Self {
            name: name.into(),
            stage,
            values: Vec::new(),
            insts: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            uniforms: UniformPool::new(),
            variables: Vec::new(),
            exec_masks: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            vattr_sizes: Vec::new(),
            threads,
            min_threads: 1,
            prefetches: Vec::new(),
            scratch_bytes: 0,
            shared_bytes: 0,
            uses_indirect: false,
            has_side_effect_memory_op: false,
            uses_discard: false,
            writes_z: false,
            loops: 0,
            max_cf_depth: 0,
            lock_scoreboard_on_first_thrsw: false,
            uses_center_w: false,
            uses_implicit_point_line_varyings: false,
            local_invocation_index_bits: 0,
        }
    }

    pub fn new_value(&mut self, class: RegClass, kind: ValueKind) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(ValueInfo { class, kind });
        id
    }

    pub fn value(&self, id: ValueId) -> &ValueInfo {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut ValueInfo {
        &mut self.values[id.index()]
    }

    /// Create a block. It is not placed in the layout until emission starts there.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            insts: Vec::new(),
            succs: [None, None],
            preds: Vec::new(),
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    /// Append an instruction to the end of `block`.
    pub fn append(&mut self, block: BlockId, inst: Inst) -> InstId {
        let id = self.alloc_inst(inst);
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Insert an instruction into `block` immediately before `before`.
    pub fn insert_before(&mut self, block: BlockId, before: InstId, inst: Inst) -> InstId {
        let id = self.alloc_inst(inst);
        let insts = &mut self.blocks[block.index()].insts;
        let pos = insts.iter().position(|&i| i == before).unwrap_or(insts.len());
        insts.insert(pos, id);
        id
    }

    fn alloc_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        if let Dst::Temp(v) = inst.dst {
            if let ValueKind::Ssa { def } = &mut self.values[v.index()].kind {
                *def = Some(id);
            }
        }
        self.insts.push(inst);
        id
    }

    /// Add a control-flow edge.
    pub fn link(&mut self, from: BlockId, to: BlockId) {
        let succs = &mut self.blocks[from.index()].succs;
        if succs[0].is_none() {
            succs[0] = Some(to);
        } else {
            succs[1] = Some(to);
        }
        self.blocks[to.index()].preds.push(from);
    }

    /// Last instruction of a block.
    pub fn last_inst(&self, block: BlockId) -> Option<InstId> {
        self.blocks[block.index()].insts.last().copied()
    }

    /// Instructions in layout order.
    pub fn instructions(&self) -> impl Iterator<Item = (BlockId, InstId, &Inst)> + '_ {
        self.layout.iter().flat_map(move |&b| {
            self.blocks[b.index()]
                .insts
                .iter()
                .map(move |&i| (b, i, &self.insts[i.index()]))
        })
    }

    /// Number of instructions reachable from the layout.
    pub fn instruction_count(&self) -> usize {
        self.layout
            .iter()
            .map(|b| self.blocks[b.index()].insts.len())
            .sum()
    }

    /// Every instruction whose destination is `value`.
    pub fn defs_of(&self, value: ValueId) -> Vec<InstId> {
        self.instructions()
            .filter(|(_, _, inst)| inst.dst == Dst::Temp(value))
            .map(|(_, id, _)| id)
            .collect()
    }

    /// Block that follows `block` when it does not branch away.
    pub fn fallthrough(&self, block: BlockId) -> Option<BlockId> {
        let pos = self.layout.iter().position(|&b| b == block)?;
        self.layout.get(pos + 1).copied()
    }

    /// Thread-switch instructions in layout order.
    pub fn thrsw_insts(&self) -> Vec<InstId> {
        self.instructions()
            .filter(|(_, _, inst)| inst.is_thrsw())
            .map(|(_, id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_records_ssa_def() {
        let mut m = Module::new("t", Stage::Fragment, 4);
        let b = m.new_block();
        m.layout.push(b);
        let v = m.new_value(RegClass::Full, ValueKind::Ssa { def: None });
        let i = m.append(b, Inst::new(Opcode::Mov, Dst::Temp(v), vec![Operand::SmallImm(1)]));

        assert_eq!(m.value(v).kind, ValueKind::Ssa { def: Some(i) });
        assert_eq!(m.defs_of(v), vec![i]);
        assert_eq!(m.last_inst(b), Some(i));
    }

    #[test]
    fn test_link_and_fallthrough() {
        let mut m = Module::new("t", Stage::Compute, 4);
        let a = m.new_block();
        let b = m.new_block();
        let c = m.new_block();
        m.layout.extend([a, c, b]);
        m.link(a, b);
        m.link(a, c);

        assert_eq!(m.block(a).succs, [Some(b), Some(c)]);
        assert_eq!(m.block(c).preds, vec![a]);
        assert_eq!(m.fallthrough(a), Some(c));
        assert_eq!(m.fallthrough(b), None);
    }

    #[test]
    fn test_insert_before() {
        let mut m = Module::new("t", Stage::Vertex, 4);
        let b = m.new_block();
        m.layout.push(b);
        let first = m.append(b, Inst::new(Opcode::Nop, Dst::Null, vec![]));
        let second = m.insert_before(b, first, Inst::new(Opcode::Tmuwt, Dst::Null, vec![]));
        assert_eq!(m.block(b).insts, vec![second, first]);
        assert_eq!(m.instruction_count(), 2);
    }

    #[test]
    fn test_variable_slot_index() {
        let slots = VariableSlots {
            name: "v".into(),
            num_components: 3,
            words: 2,
            elements: 4,
            slots: Vec::new(),
        };
        assert_eq!(slots.slot_index(0, 0, 0), 0);
        assert_eq!(slots.slot_index(0, 1, 1), 3);
        assert_eq!(slots.slot_index(2, 2, 0), 16);
    }
}
