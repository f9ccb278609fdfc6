// Shared helpers for the integration tests: compiling textual shaders, and a small
// lane-level interpreter for VIR modules. The interpreter runs all sixteen lanes of one
// lane group in lockstep over the block layout, honouring lane predicates, flag pushes and
// updates, group-wide branch conditions and the general-memory TMU protocol (TMUD data,
// an address write carrying the config uniform, LdTmu results). Memory is a flat word map;
// uniforms resolve to fixed fake addresses so the tests can find buffers again.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use bumpalo::Bump;
use virgen::core::{CompilationSession, CompileError, CompileKey, CompileResult};
use virgen::lower::compile_shader;
use virgen::text::parse_shader;
use virgen::vir::{
    BranchCond, Cond, Dst, HwReg, Inst, Module, Opcode, Operand, PushFlag, TmuOp, UniformContents,
    Unpack, UpdateFlag, ValueId, Waddr,
};

pub const LANES: usize = 16;

pub type Lanes = [u32; LANES];

pub const SSBO_BASE: u32 = 0x10_0000;
pub const UBO_BASE: u32 = 0x20_0000;
pub const SHARED_BASE: u32 = 0x30_0000;
const STEP_LIMIT: usize = 100_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn compile_with(text: &str, key: &CompileKey) -> CompileResult<Module> {
    init_logging();
    let shader = parse_shader(text).unwrap_or_else(|e| panic!("parse failed: {e}\n{text}"));
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    compile_shader(&session, &shader, key)
}

pub fn compile(text: &str) -> Module {
    compile_with(text, &CompileKey::default()).unwrap_or_else(|e| panic!("compile failed: {e}"))
}

pub fn compile_err(text: &str) -> CompileError {
    match compile_with(text, &CompileKey::default()) {
        Ok(module) => panic!("expected a compile error, got:\n{module}"),
        Err(err) => err,
    }
}

/// Address of word `offset / 4` of SSBO `index`.
pub fn ssbo_addr(index: u32, offset: u32) -> u32 {
    SSBO_BASE + index * 0x1000 + offset
}

/// One lane group executing a module.
pub struct Machine<'m> {
    module: &'m Module,
    regs: HashMap<ValueId, Lanes>,
    flags: [bool; LANES],
    pub msf: Lanes,
    pub memory: HashMap<u32, u32>,
    /// Default-block uniform slots, by word.
    pub uniform_slots: HashMap<u32, u32>,
    pub payload: [Lanes; 3],
    tmu_data: Vec<Vec<u32>>,
    tmu_results: Vec<VecDeque<u32>>,
    /// Writes to magic addresses other than general-memory TMU ones.
    pub magic_writes: Vec<(Waddr, Lanes)>,
    pub steps: usize,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            regs: HashMap::new(),
            flags: [false; LANES],
            msf: [0xf; LANES],
            memory: HashMap::new(),
            uniform_slots: HashMap::new(),
            payload: [[0; LANES]; 3],
            tmu_data: vec![Vec::new(); LANES],
            tmu_results: vec![VecDeque::new(); LANES],
            magic_writes: Vec::new(),
            steps: 0,
        }
    }

    pub fn reg(&self, value: ValueId) -> Lanes {
        self.regs.get(&value).copied().unwrap_or([0; LANES])
    }

    pub fn load(&self, addr: u32) -> Option<u32> {
        self.memory.get(&addr).copied()
    }

    pub fn run(&mut self) -> Result<(), String> {
        let module = self.module;
        let position: HashMap<_, _> = module
            .layout
            .iter()
            .enumerate()
            .map(|(i, &b)| (b, i))
            .collect();

        let mut pos = 0;
        while pos < module.layout.len() {
            let block = module.layout[pos];
            let mut next = pos + 1;
            for &id in &module.block(block).insts {
                self.steps += 1;
                if self.steps > STEP_LIMIT {
                    return Err(format!("step limit exceeded in block{}", block.0));
                }
                let inst = module.inst(id);
                if let Some(branch) = &inst.branch {
                    if self.branch_taken(branch.cond) {
                        next = *position
                            .get(&branch.target)
                            .ok_or_else(|| format!("branch to unplaced block{}", branch.target.0))?;
                        break;
                    }
                    continue;
                }
                self.exec(inst)
                    .map_err(|e| format!("{e} at `{}`", module.display_inst(id)))?;
            }
            pos = next;
        }
        Ok(())
    }

    fn branch_taken(&self, cond: BranchCond) -> bool {
        match cond {
            BranchCond::Always => true,
            BranchCond::AllA => self.flags.iter().all(|&a| a),
            BranchCond::AllNa => self.flags.iter().all(|&a| !a),
            BranchCond::AnyA => self.flags.iter().any(|&a| a),
            BranchCond::AnyNa => self.flags.iter().any(|&a| !a),
        }
    }

    fn lane_enabled(&self, cond: Cond, lane: usize) -> bool {
        match cond {
            Cond::Always => true,
            Cond::IfA => self.flags[lane],
            Cond::IfNa => !self.flags[lane],
        }
    }

    fn uniform_value(&self, contents: UniformContents) -> u32 {
        match contents {
            UniformContents::Constant(v) => v,
            UniformContents::Uniform(slot) => self.uniform_slots.get(&slot).copied().unwrap_or(0),
            UniformContents::UboAddr { index, offset } => UBO_BASE + index * 0x1000 + offset,
            UniformContents::SsboOffset(index) => ssbo_addr(index, 0),
            UniformContents::SharedOffset => SHARED_BASE,
            _ => 0,
        }
    }

    fn operand(&self, op: &Operand) -> Lanes {
        match op {
            Operand::Temp(v) => self.reg(*v),
            Operand::SmallImm(bits) => [*bits; LANES],
            Operand::Hw(HwReg::Payload(n)) => self.payload.get(*n as usize).copied().unwrap_or([0; LANES]),
            Operand::Hw(HwReg::R5) | Operand::Null => [0; LANES],
        }
    }

    fn exec(&mut self, inst: &Inst) -> Result<(), String> {
        let srcs: Vec<Lanes> = inst.srcs.iter().map(|s| self.operand(s)).collect();
        let a = srcs.first().copied().unwrap_or([0; LANES]);
        let b = srcs.get(1).copied().unwrap_or([0; LANES]);
        let a = match inst.unpack {
            Unpack::None => a,
            Unpack::Abs => a.map(|x| x & 0x7fff_ffff),
            other => return Err(format!("unpack {other:?} not modelled")),
        };

        let mut result = [0u32; LANES];
        let mut has_result = true;
        for lane in 0..LANES {
            let (x, y) = (a[lane], b[lane]);
            let (fx, fy) = (f32::from_bits(x), f32::from_bits(y));
            result[lane] = match inst.op {
                Opcode::Fadd => (fx + fy).to_bits(),
                Opcode::Fsub => (fx - fy).to_bits(),
                Opcode::Fmul => (fx * fy).to_bits(),
                Opcode::Fmin => fx.min(fy).to_bits(),
                Opcode::Fmax => fx.max(fy).to_bits(),
                Opcode::Fcmp => (fx - fy).to_bits(),
                Opcode::Fmov => x,
                Opcode::Fround => fx.round_ties_even().to_bits(),
                Opcode::Ftrunc => fx.trunc().to_bits(),
                Opcode::Ffloor => fx.floor().to_bits(),
                Opcode::Fceil => fx.ceil().to_bits(),
                Opcode::Ftoin => fx.round_ties_even() as i32 as u32,
                Opcode::Ftoiz => fx as i32 as u32,
                Opcode::Ftouz => fx as u32,
                Opcode::Itof => (x as i32 as f32).to_bits(),
                Opcode::Utof => (x as f32).to_bits(),
                Opcode::Recip => (1.0 / fx).to_bits(),
                Opcode::Rsqrt => (1.0 / fx.sqrt()).to_bits(),
                Opcode::Exp => fx.exp2().to_bits(),
                Opcode::Log => fx.log2().to_bits(),
                Opcode::Sin => (fx * std::f32::consts::PI).sin().to_bits(),
                Opcode::Add => x.wrapping_add(y),
                Opcode::Sub => x.wrapping_sub(y),
                Opcode::Neg => x.wrapping_neg(),
                Opcode::Min => (x as i32).min(y as i32) as u32,
                Opcode::Max => (x as i32).max(y as i32) as u32,
                Opcode::Umin => x.min(y),
                Opcode::Umax => x.max(y),
                Opcode::Umul24 => (x & 0xff_ffff).wrapping_mul(y & 0xff_ffff),
                Opcode::Smul24 => {
                    let sx = ((x << 8) as i32) >> 8;
                    let sy = ((y << 8) as i32) >> 8;
                    sx.wrapping_mul(sy) as u32
                }
                Opcode::Shl => x.wrapping_shl(y & 31),
                Opcode::Shr => x.wrapping_shr(y & 31),
                Opcode::Asr => ((x as i32).wrapping_shr(y & 31)) as u32,
                Opcode::And => x & y,
                Opcode::Or => x | y,
                Opcode::Xor => x ^ y,
                Opcode::Not => !x,
                Opcode::Clz => x.leading_zeros(),
                Opcode::Mov => x,
                Opcode::Sel => {
                    if self.lane_enabled(inst.cond, lane) {
                        x
                    } else {
                        y
                    }
                }
                Opcode::Msf => self.msf[lane],
                Opcode::Eidx => lane as u32,
                Opcode::Tidx | Opcode::Revf | Opcode::Iid | Opcode::Sampid => 0,
                Opcode::Xcd | Opcode::Ycd | Opcode::Fxcd | Opcode::Fycd => 0,
                Opcode::LdUnif => {
                    let id = inst.uniform.ok_or("ldunif without a uniform")?;
                    let contents = *self
                        .module
                        .uniforms
                        .get(id)
                        .ok_or("ldunif of an unknown uniform")?;
                    self.uniform_value(contents)
                }
                Opcode::LdTmu => self.tmu_results[lane].pop_front().unwrap_or(0),
                Opcode::LdVary
                | Opcode::LdTlb
                | Opcode::LdTlbU
                | Opcode::LdVpmVIn
                | Opcode::LdVpmGIn => 0,
                Opcode::Setmsf => {
                    if self.lane_enabled(inst.cond, lane) {
                        self.msf[lane] = x;
                    }
                    has_result = false;
                    0
                }
                Opcode::Tmuwt => {
                    self.tmu_results[lane].clear();
                    has_result = false;
                    0
                }
                Opcode::Nop
                | Opcode::Vpmwt
                | Opcode::StVpmV
                | Opcode::BarrierId
                | Opcode::TexPrefetch
                | Opcode::Vfpack
                | Opcode::Ftoc
                | Opcode::Fdx
                | Opcode::Fdy
                | Opcode::Setrevf
                | Opcode::Branch => {
                    has_result = false;
                    0
                }
            };
        }

        if let Some(pf) = inst.pf {
            for lane in 0..LANES {
                let (x, y, r) = (a[lane], b[lane], result[lane]);
                self.flags[lane] = match (inst.op, pf) {
                    (Opcode::Fcmp, PushFlag::PushZ) => f32::from_bits(x) == f32::from_bits(y),
                    (Opcode::Fcmp, PushFlag::PushN) => f32::from_bits(x) < f32::from_bits(y),
                    (Opcode::Fcmp, PushFlag::PushC) => f32::from_bits(x) <= f32::from_bits(y),
                    (Opcode::Fmov, PushFlag::PushZ) => f32::from_bits(r) == 0.0,
                    (Opcode::Fmov, PushFlag::PushN) => f32::from_bits(r) < 0.0,
                    (Opcode::Min, PushFlag::PushC) => (x as i32) > (y as i32),
                    (Opcode::Sub, PushFlag::PushC) => x < y,
                    (Opcode::Add, PushFlag::PushC) => x.overflowing_add(y).1,
                    (_, PushFlag::PushZ) => r == 0,
                    (_, PushFlag::PushN) => (r as i32) < 0,
                    (op, PushFlag::PushC) => return Err(format!("carry push on {op} not modelled")),
                };
            }
        }
        if let Some(uf) = inst.uf {
            for lane in 0..LANES {
                let zero = result[lane] == 0;
                self.flags[lane] = match uf {
                    UpdateFlag::AndZ => self.flags[lane] && zero,
                    UpdateFlag::NorNz => !self.flags[lane] && zero,
                };
            }
        }

        if !has_result {
            return Ok(());
        }
        match inst.dst {
            Dst::Null => Ok(()),
            Dst::Temp(v) => {
                let mut value = self.reg(v);
                for lane in 0..LANES {
                    if inst.op == Opcode::Sel || self.lane_enabled(inst.cond, lane) {
                        value[lane] = result[lane];
                    }
                }
                self.regs.insert(v, value);
                Ok(())
            }
            Dst::Magic(Waddr::Tmud) => {
                for lane in 0..LANES {
                    if self.lane_enabled(inst.cond, lane) {
                        self.tmu_data[lane].push(result[lane]);
                    }
                }
                Ok(())
            }
            Dst::Magic(Waddr::Tmua | Waddr::Tmuau) => self.tmu_request(inst, &result),
            Dst::Magic(waddr) => {
                self.magic_writes.push((waddr, result));
                Ok(())
            }
        }
    }

    fn tmu_request(&mut self, inst: &Inst, address: &Lanes) -> Result<(), String> {
        let tag = inst.tmu.ok_or("general-memory request without a tag")?;
        for lane in 0..LANES {
            let data = std::mem::take(&mut self.tmu_data[lane]);
            if !self.lane_enabled(inst.cond, lane) {
                continue;
            }
            let addr = address[lane];
            match (tag.op, data.is_empty()) {
                (TmuOp::Regular, true) => {
                    for c in 0..tag.components as u32 {
                        let word = self.memory.get(&(addr + 4 * c)).copied().unwrap_or(0);
                        self.tmu_results[lane].push_back(word);
                    }
                }
                (TmuOp::Regular, false) => {
                    for (c, &word) in data.iter().enumerate() {
                        self.memory.insert(addr + 4 * c as u32, word);
                    }
                }
                (op, _) => {
                    let old = self.memory.get(&addr).copied().unwrap_or(0);
                    let operand = data.first().copied().unwrap_or(0);
                    let new = match op {
                        TmuOp::WriteAddReadPrefetch => old.wrapping_add(operand),
                        TmuOp::WriteSubReadClear => old.wrapping_sub(operand),
                        TmuOp::WriteXchgReadFlush => operand,
                        TmuOp::WriteAndReadInc if data.is_empty() => old.wrapping_add(1),
                        TmuOp::WriteOrReadDec if data.is_empty() => old.wrapping_sub(1),
                        TmuOp::WriteAndReadInc => old & operand,
                        TmuOp::WriteOrReadDec => old | operand,
                        TmuOp::WriteXorReadNot => old ^ operand,
                        TmuOp::WriteUminFullL1Clear => old.min(operand),
                        TmuOp::WriteUmax => old.max(operand),
                        TmuOp::WriteSmin => (old as i32).min(operand as i32) as u32,
                        TmuOp::WriteSmax => (old as i32).max(operand as i32) as u32,
                        TmuOp::WriteCmpxchgReadFlush => {
                            let replacement = data.get(1).copied().unwrap_or(0);
                            if old == operand {
                                replacement
                            } else {
                                old
                            }
                        }
                        TmuOp::Regular => old,
                    };
                    self.memory.insert(addr, new);
                    self.tmu_results[lane].push_back(old);
                }
            }
        }
        Ok(())
    }
}
