// This module enumerates the target SIMD instruction set as the lowering sees it. Opcode is
// a flat enum whose static properties (mnemonic, source count, whether an inline small
// immediate is accepted, whether the instruction is a load signal, whether it has side
// effects) come from a const fn info() table, so every consumer matches exhaustively and
// nobody keeps a parallel name list. The file also defines the per-instruction modifiers:
// lane predicates (Cond), flag pushes and flag updates with their exact semantics, branch
// aggregates, input unpacks, magic write addresses for the TMU/TLB/VPM/sync ports, the
// hardware registers readable as sources, the TMU operation and type encodings used in
// general-memory config words, and the barrier class bit set consulted by the scheduler.

//! Machine opcodes and instruction modifiers.

use std::fmt;

/// Static description of an [`Opcode`].
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub name: &'static str,
    pub num_srcs: usize,
    /// Accepts one inline small immediate among its sources.
    pub small_imm: bool,
    /// Result arrives through a load signal rather than the ALU.
    pub ld_signal: bool,
    /// Must be kept even without a live destination.
    pub side_effect: bool,
}

const fn alu(name: &'static str, num_srcs: usize) -> OpInfo {
    OpInfo {
        name,
        num_srcs,
        small_imm: true,
        ld_signal: false,
        side_effect: false,
    }
}

const fn sfu(name: &'static str) -> OpInfo {
    OpInfo {
        name,
        num_srcs: 1,
        small_imm: false,
        ld_signal: false,
        side_effect: false,
    }
}

const fn read(name: &'static str) -> OpInfo {
    OpInfo {
        name,
        num_srcs: 0,
        small_imm: false,
        ld_signal: false,
        side_effect: false,
    }
}

const fn ld(name: &'static str, num_srcs: usize) -> OpInfo {
    OpInfo {
        name,
        num_srcs,
        small_imm: false,
        ld_signal: true,
        side_effect: false,
    }
}

const fn effect(name: &'static str, num_srcs: usize) -> OpInfo {
    OpInfo {
        name,
        num_srcs,
        small_imm: false,
        ld_signal: false,
        side_effect: true,
    }
}

/// Machine opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Float ALU.
    Fadd,
    Fsub,
    Fmul,
    Fmin,
    Fmax,
    Fcmp,
    Fmov,
    Fround,
    Ftrunc,
    Ffloor,
    Fceil,
    Ftoin,
    Ftoiz,
    Ftouz,
    /// Float alpha to a coverage mask.
    Ftoc,
    Itof,
    Utof,
    Fdx,
    Fdy,
    Vfpack,

    // Integer ALU.
    Add,
    Sub,
    Neg,
    Min,
    Max,
    Umin,
    Umax,
    Umul24,
    Smul24,
    Shl,
    Shr,
    Asr,
    And,
    Or,
    Xor,
    Not,
    Clz,
    Mov,
    /// `dst = cond ? src0 : src1`.
    Sel,

    // Special functions.
    Recip,
    Rsqrt,
    Exp,
    Log,
    Sin,

    // Special register reads.
    Msf,
    Revf,
    Fxcd,
    Fycd,
    Xcd,
    Ycd,
    Tidx,
    Eidx,
    Iid,
    Sampid,
    BarrierId,

    // Load signals.
    LdUnif,
    LdTmu,
    LdVary,
    LdTlb,
    LdTlbU,
    LdVpmVIn,
    LdVpmGIn,

    // Side effects.
    Nop,
    Setmsf,
    Setrevf,
    Tmuwt,
    Vpmwt,
    StVpmV,
    Branch,
    /// Unresolved texture prefetch; rewritten or dropped by the driver.
    TexPrefetch,
}

impl Opcode {
    pub const fn info(self) -> OpInfo {
        match self {
            Opcode::Fadd => alu("fadd", 2),
            Opcode::Fsub => alu("fsub", 2),
            Opcode::Fmul => alu("fmul", 2),
            Opcode::Fmin => alu("fmin", 2),
            Opcode::Fmax => alu("fmax", 2),
            Opcode::Fcmp => alu("fcmp", 2),
            Opcode::Fmov => alu("fmov", 1),
            Opcode::Fround => alu("fround", 1),
            Opcode::Ftrunc => alu("ftrunc", 1),
            Opcode::Ffloor => alu("ffloor", 1),
            Opcode::Fceil => alu("fceil", 1),
            Opcode::Ftoin => alu("ftoin", 1),
            Opcode::Ftoiz => alu("ftoiz", 1),
            Opcode::Ftouz => alu("ftouz", 1),
            Opcode::Ftoc => alu("ftoc", 1),
            Opcode::Itof => alu("itof", 1),
            Opcode::Utof => alu("utof", 1),
            Opcode::Fdx => alu("fdx", 1),
            Opcode::Fdy => alu("fdy", 1),
            Opcode::Vfpack => alu("vfpack", 2),
            Opcode::Add => alu("add", 2),
            Opcode::Sub => alu("sub", 2),
            Opcode::Neg => alu("neg", 1),
            Opcode::Min => alu("min", 2),
            Opcode::Max => alu("max", 2),
            Opcode::Umin => alu("umin", 2),
            Opcode::Umax => alu("umax", 2),
            Opcode::Umul24 => alu("umul24", 2),
            Opcode::Smul24 => alu("smul24", 2),
            Opcode::Shl => alu("shl", 2),
            Opcode::Shr => alu("shr", 2),
            Opcode::Asr => alu("asr", 2),
            Opcode::And => alu("and", 2),
            Opcode::Or => alu("or", 2),
            Opcode::Xor => alu("xor", 2),
            Opcode::Not => alu("not", 1),
            Opcode::Clz => alu("clz", 1),
            Opcode::Mov => alu("mov", 1),
            Opcode::Sel => alu("sel", 2),
            Opcode::Recip => sfu("recip"),
            Opcode::Rsqrt => sfu("rsqrt"),
            Opcode::Exp => sfu("exp"),
            Opcode::Log => sfu("log"),
            Opcode::Sin => sfu("sin"),
            Opcode::Msf => read("msf"),
            Opcode::Revf => read("revf"),
            Opcode::Fxcd => read("fxcd"),
            Opcode::Fycd => read("fycd"),
            Opcode::Xcd => read("xcd"),
            Opcode::Ycd => read("ycd"),
            Opcode::Tidx => read("tidx"),
            Opcode::Eidx => read("eidx"),
            Opcode::Iid => read("iid"),
            Opcode::Sampid => read("sampid"),
            Opcode::BarrierId => effect("barrierid", 0),
            Opcode::LdUnif => ld("ldunif", 0),
            Opcode::LdTmu => ld("ldtmu", 0),
            Opcode::LdVary => ld("ldvary", 0),
            Opcode::LdTlb => ld("ldtlb", 0),
            Opcode::LdTlbU => ld("ldtlbu", 0),
            Opcode::LdVpmVIn => ld("ldvpmv_in", 1),
            Opcode::LdVpmGIn => ld("ldvpmg_in", 2),
            Opcode::Nop => effect("nop", 0),
            Opcode::Setmsf => effect("setmsf", 1),
            Opcode::Setrevf => effect("setrevf", 1),
            Opcode::Tmuwt => effect("tmuwt", 0),
            Opcode::Vpmwt => effect("vpmwt", 0),
            Opcode::StVpmV => effect("stvpmv", 2),
            Opcode::Branch => effect("branch", 0),
            Opcode::TexPrefetch => effect("tex_prefetch", 0),
        }
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Whether the ALU may set flags from this opcode.
    pub fn can_push_flags(self) -> bool {
        let info = self.info();
        !info.ld_signal && self != Opcode::Branch && self != Opcode::TexPrefetch
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-lane write predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Cond {
    #[default]
    Always,
    /// Write lanes whose A flag is set.
    IfA,
    /// Write lanes whose A flag is clear.
    IfNa,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Always => Cond::Always,
            Cond::IfA => Cond::IfNa,
            Cond::IfNa => Cond::IfA,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Cond::Always => "",
            Cond::IfA => ".ifa",
            Cond::IfNa => ".ifna",
        }
    }
}

/// Flag push: replaces A with a predicate of the result.
///
/// `PushZ` sets A where the result is zero and `PushN` where it is negative.
/// `PushC` depends on the opcode: for `fcmp` it is `src0 <= src1`, for
/// `min` it is `src0 > src1` (signed), for `sub` it is `src0 < src1`
/// (unsigned) and for `add` it is the unsigned carry out. For `fcmp`, Z
/// means `src0 == src1` and N means `src0 < src1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushFlag {
    PushZ,
    PushN,
    PushC,
}

impl PushFlag {
    fn suffix(self) -> &'static str {
        match self {
            PushFlag::PushZ => ".pushz",
            PushFlag::PushN => ".pushn",
            PushFlag::PushC => ".pushc",
        }
    }
}

/// Flag update: combines A with a zero test of the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateFlag {
    /// `A = A && result == 0`
    AndZ,
    /// `A = !A && result == 0`
    NorNz,
}

impl UpdateFlag {
    fn suffix(self) -> &'static str {
        match self {
            UpdateFlag::AndZ => ".andz",
            UpdateFlag::NorNz => ".nornz",
        }
    }
}

/// Unpack applied to the first source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Unpack {
    #[default]
    None,
    /// Low half-float.
    L,
    /// High half-float.
    H,
    Abs,
}

impl Unpack {
    fn suffix(self) -> &'static str {
        match self {
            Unpack::None => "",
            Unpack::L => ".l",
            Unpack::H => ".h",
            Unpack::Abs => ".abs",
        }
    }
}

/// Branch condition, aggregated over the lanes of the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchCond {
    Always,
    /// A set on all lanes.
    AllA,
    /// A clear on all lanes.
    AllNa,
    /// A set on some lane.
    AnyA,
    /// A clear on some lane.
    AnyNa,
}

impl BranchCond {
    pub fn name(self) -> &'static str {
        match self {
            BranchCond::Always => "always",
            BranchCond::AllA => "alla",
            BranchCond::AllNa => "allna",
            BranchCond::AnyA => "anya",
            BranchCond::AnyNa => "anyna",
        }
    }
}

/// Magic write addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waddr {
    Tlb,
    TlbU,
    /// TMU data.
    Tmud,
    /// General-memory address.
    Tmua,
    /// General-memory address with a config uniform.
    Tmuau,
    Tmus,
    Tmut,
    Tmur,
    Tmui,
    Tmub,
    Tmudref,
    Tmuoff,
    /// Image/texture coordinate S with config uniform.
    Tmusf,
    Vpm,
    SyncB,
    SyncU,
    Sync,
}

impl Waddr {
    pub fn name(self) -> &'static str {
        match self {
            Waddr::Tlb => "tlb",
            Waddr::TlbU => "tlbu",
            Waddr::Tmud => "tmud",
            Waddr::Tmua => "tmua",
            Waddr::Tmuau => "tmuau",
            Waddr::Tmus => "tmus",
            Waddr::Tmut => "tmut",
            Waddr::Tmur => "tmur",
            Waddr::Tmui => "tmui",
            Waddr::Tmub => "tmub",
            Waddr::Tmudref => "tmudref",
            Waddr::Tmuoff => "tmuoff",
            Waddr::Tmusf => "tmusf",
            Waddr::Vpm => "vpm",
            Waddr::SyncB => "syncb",
            Waddr::SyncU => "syncu",
            Waddr::Sync => "sync",
        }
    }

    /// Whether this address feeds the TMU.
    pub fn is_tmu(self) -> bool {
        matches!(
            self,
            Waddr::Tmud
                | Waddr::Tmua
                | Waddr::Tmuau
                | Waddr::Tmus
                | Waddr::Tmut
                | Waddr::Tmur
                | Waddr::Tmui
                | Waddr::Tmub
                | Waddr::Tmudref
                | Waddr::Tmuoff
                | Waddr::Tmusf
        )
    }
}

/// Hardware registers readable as sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwReg {
    /// Accumulator receiving the varying C coefficient.
    R5,
    /// Thread payload register, written by the hardware at dispatch.
    Payload(u8),
}

impl fmt::Display for HwReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwReg::R5 => f.write_str("r5"),
            HwReg::Payload(n) => write!(f, "payload{n}"),
        }
    }
}

/// General-memory TMU operations, as encoded in the config word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmuOp {
    WriteAddReadPrefetch = 0,
    WriteSubReadClear = 1,
    WriteXchgReadFlush = 2,
    WriteCmpxchgReadFlush = 3,
    WriteUminFullL1Clear = 4,
    WriteUmax = 5,
    WriteSmin = 6,
    WriteSmax = 7,
    WriteAndReadInc = 8,
    WriteOrReadDec = 9,
    WriteXorReadNot = 10,
    Regular = 15,
}

impl TmuOp {
    pub fn name(self) -> &'static str {
        match self {
            TmuOp::WriteAddReadPrefetch => "add",
            TmuOp::WriteSubReadClear => "sub",
            TmuOp::WriteXchgReadFlush => "xchg",
            TmuOp::WriteCmpxchgReadFlush => "cmpxchg",
            TmuOp::WriteUminFullL1Clear => "umin",
            TmuOp::WriteUmax => "umax",
            TmuOp::WriteSmin => "smin",
            TmuOp::WriteSmax => "smax",
            TmuOp::WriteAndReadInc => "and_inc",
            TmuOp::WriteOrReadDec => "or_dec",
            TmuOp::WriteXorReadNot => "xor_not",
            TmuOp::Regular => "regular",
        }
    }
}

/// General-memory request types, as encoded in the config word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TmuType {
    Int8 = 0,
    Int16 = 1,
    Vec2 = 2,
    Vec3 = 3,
    Vec4 = 4,
    Uint8 = 5,
    Uint16 = 6,
    Uint32 = 7,
}

impl TmuType {
    /// Request type for a 32-bit access of `components` words.
    pub fn for_components(components: u32) -> TmuType {
        match components {
            2 => TmuType::Vec2,
            3 => TmuType::Vec3,
            4 => TmuType::Vec4,
            _ => TmuType::Uint32,
        }
    }

    /// Request type for `components` values of `bit_size` bits. Sub-word
    /// types return a single value per request.
    pub fn for_access(bit_size: u8, components: u32) -> TmuType {
        match bit_size {
            8 => TmuType::Uint8,
            16 => TmuType::Uint16,
            _ => TmuType::for_components(components),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TmuType::Int8 => "i8",
            TmuType::Int16 => "i16",
            TmuType::Vec2 => "vec2",
            TmuType::Vec3 => "vec3",
            TmuType::Vec4 => "vec4",
            TmuType::Uint8 => "u8",
            TmuType::Uint16 => "u16",
            TmuType::Uint32 => "u32",
        }
    }
}

/// Per-pixel bit of the general-memory config word.
pub const TMU_CONFIG_PER_PIXEL: u32 = 1 << 7;

/// Config word of a general-memory request.
pub fn tmu_config(op: TmuOp, ty: TmuType, per_pixel: bool) -> u32 {
    let mut config = 0xffffff00 | (op as u32) << 3 | ty as u32;
    if per_pixel {
        config |= TMU_CONFIG_PER_PIXEL;
    }
    config
}

/// Resource classes an instruction accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BarrierClass(u8);

impl BarrierClass {
    pub const NONE: BarrierClass = BarrierClass(0);
    pub const TMU: BarrierClass = BarrierClass(1 << 0);
    pub const IMAGE: BarrierClass = BarrierClass(1 << 1);
    pub const BUFFER: BarrierClass = BarrierClass(1 << 2);
    pub const SHARED: BarrierClass = BarrierClass(1 << 3);
    pub const SCRATCH: BarrierClass = BarrierClass(1 << 4);
    pub const TLB: BarrierClass = BarrierClass(1 << 5);
    pub const VPM: BarrierClass = BarrierClass(1 << 6);
    pub const SYNC: BarrierClass = BarrierClass(1 << 7);

    const NAMES: [&'static str; 8] = [
        "tmu", "image", "buffer", "shared", "scratch", "tlb", "vpm", "sync",
    ];

    pub const fn union(self, other: BarrierClass) -> BarrierClass {
        BarrierClass(self.0 | other.0)
    }

    pub const fn contains(self, other: BarrierClass) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for BarrierClass {
    type Output = BarrierClass;

    fn bitor(self, rhs: BarrierClass) -> BarrierClass {
        self.union(rhs)
    }
}

impl fmt::Display for BarrierClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, name) in Self::NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Instruction modifier suffix, e.g. `.ifa.pushz`.
pub(crate) fn modifier_suffix(
    cond: Cond,
    pf: Option<PushFlag>,
    uf: Option<UpdateFlag>,
    unpack: Unpack,
) -> String {
    let mut s = String::new();
    s.push_str(cond.suffix());
    if let Some(pf) = pf {
        s.push_str(pf.suffix());
    }
    if let Some(uf) = uf {
        s.push_str(uf.suffix());
    }
    s.push_str(unpack.suffix());
    s
}
