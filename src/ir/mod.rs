// This module defines the portable, architecture-neutral shader IR that the backend consumes.
// A Shader is a structured control-flow tree: straight-line blocks of instructions, if nodes
// carrying their condition and a lane-uniformity bit computed by the upstream optimizer, and
// loop nodes that are exited only through break jumps. Instructions are SSA-form ALU ops
// (scalarized, with per-source swizzles), named intrinsics with fixed argument order and
// index parameters (base, component, write mask, ...), texture operations with explicitly
// tagged sources, constant loads, undefs and jumps. State the front end did not convert to
// SSA lives in Variables: mutable, optionally arrayed storage read and written through
// VarRefs that may carry an indirect element index. Input/output declarations with their
// locations and interpolation modes form the side table the I/O lowering works from.

//! Portable SSA shader IR.
//!
//! The types here are produced by an external front end (or by
//! [`ShaderBuilder`] and the [`crate::text`] parser in tests) and consumed
//! read-only by [`crate::lower`].

pub mod builder;

pub use builder::ShaderBuilder;

use std::fmt;

/// Dense SSA value identifier, `0..Shader::ssa_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SsaId(pub u32);

impl SsaId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into [`Shader::variables`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Vertex => "vertex",
            Stage::Geometry => "geometry",
            Stage::Fragment => "fragment",
            Stage::Compute => "compute",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        match name {
            "vertex" => Some(Stage::Vertex),
            "geometry" => Some(Stage::Geometry),
            "fragment" => Some(Stage::Fragment),
            "compute" => Some(Stage::Compute),
            _ => None,
        }
    }
}

/// An SSA definition: 1-16 components of 1, 8, 16, 32 or 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsaDef {
    pub id: SsaId,
    pub num_components: u8,
    pub bit_size: u8,
}

impl SsaDef {
    /// Number of 32-bit machine words per component.
    pub fn words(&self) -> usize {
        if self.bit_size == 64 {
            2
        } else {
            1
        }
    }
}

/// Reference to (part of) a legacy variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarRef {
    pub var: VarId,
    /// Constant array element.
    pub base_offset: u32,
    /// Dynamic array element, added to `base_offset`.
    pub indirect: Option<SsaId>,
    /// First component accessed.
    pub component: u8,
}

impl VarRef {
    pub fn direct(var: VarId) -> Self {
        Self {
            var,
            base_offset: 0,
            indirect: None,
            component: 0,
        }
    }

    pub fn element(var: VarId, base_offset: u32) -> Self {
        Self {
            base_offset,
            ..Self::direct(var)
        }
    }
}

/// Instruction source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src {
    Ssa(SsaId),
    Var(VarRef),
}

/// Instruction destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Ssa(SsaDef),
    Var(VarRef),
}

impl Dest {
    pub fn ssa(&self) -> Option<&SsaDef> {
        match self {
            Dest::Ssa(def) => Some(def),
            Dest::Var(_) => None,
        }
    }
}

/// ALU source with a component swizzle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluSrc {
    pub src: Src,
    pub swizzle: [u8; 4],
}

impl AluSrc {
    pub fn new(src: Src) -> Self {
        Self {
            src,
            swizzle: [0, 1, 2, 3],
        }
    }

    /// Source reading a single component.
    pub fn comp(src: Src, component: u8) -> Self {
        Self {
            src,
            swizzle: [component; 4],
        }
    }
}

/// Static description of an ALU opcode.
#[derive(Debug, Clone, Copy)]
pub struct AluOpInfo {
    pub name: &'static str,
    pub num_srcs: usize,
    /// Produces a boolean from a comparison and can feed a predicate directly.
    pub is_comparison: bool,
}

macro_rules! alu_ops {
    ($($variant:ident => ($name:literal, $srcs:literal, $cmp:literal)),* $(,)?) => {
        /// Scalar ALU operations.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AluOp {
            $($variant),*
        }

        impl AluOp {
            pub const ALL: &'static [AluOp] = &[$(AluOp::$variant),*];

            pub const fn info(self) -> AluOpInfo {
                match self {
                    $(AluOp::$variant => AluOpInfo {
                        name: $name,
                        num_srcs: $srcs,
                        is_comparison: $cmp,
                    }),*
                }
            }

            pub fn from_name(name: &str) -> Option<AluOp> {
                match name {
                    $($name => Some(AluOp::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

alu_ops! {
    Mov => ("mov", 1, false),
    Vec2 => ("vec2", 2, false),
    Vec3 => ("vec3", 3, false),
    Vec4 => ("vec4", 4, false),
    Fneg => ("fneg", 1, false),
    Ineg => ("ineg", 1, false),
    Fabs => ("fabs", 1, false),
    Iabs => ("iabs", 1, false),
    Fadd => ("fadd", 2, false),
    Fsub => ("fsub", 2, false),
    Fmul => ("fmul", 2, false),
    Fmin => ("fmin", 2, false),
    Fmax => ("fmax", 2, false),
    Iadd => ("iadd", 2, false),
    Isub => ("isub", 2, false),
    Imul => ("imul", 2, false),
    Imin => ("imin", 2, false),
    Imax => ("imax", 2, false),
    Umin => ("umin", 2, false),
    Umax => ("umax", 2, false),
    Iand => ("iand", 2, false),
    Ior => ("ior", 2, false),
    Ixor => ("ixor", 2, false),
    Inot => ("inot", 1, false),
    Ishl => ("ishl", 2, false),
    Ishr => ("ishr", 2, false),
    Ushr => ("ushr", 2, false),
    UfindMsb => ("ufind_msb", 1, false),
    F2i32 => ("f2i32", 1, false),
    F2u32 => ("f2u32", 1, false),
    I2f32 => ("i2f32", 1, false),
    U2f32 => ("u2f32", 1, false),
    B2f32 => ("b2f32", 1, false),
    B2i32 => ("b2i32", 1, false),
    F2f16 => ("f2f16", 1, false),
    F2f32 => ("f2f32", 1, false),
    Frcp => ("frcp", 1, false),
    Frsq => ("frsq", 1, false),
    Fexp2 => ("fexp2", 1, false),
    Flog2 => ("flog2", 1, false),
    Fceil => ("fceil", 1, false),
    Ffloor => ("ffloor", 1, false),
    FroundEven => ("fround_even", 1, false),
    Ftrunc => ("ftrunc", 1, false),
    Fsin => ("fsin", 1, false),
    Fcos => ("fcos", 1, false),
    Fsign => ("fsign", 1, false),
    Fddx => ("fddx", 1, false),
    Fddy => ("fddy", 1, false),
    Feq => ("feq", 2, true),
    Fne => ("fne", 2, true),
    Flt => ("flt", 2, true),
    Fge => ("fge", 2, true),
    Ieq => ("ieq", 2, true),
    Ine => ("ine", 2, true),
    Ilt => ("ilt", 2, true),
    Ige => ("ige", 2, true),
    Ult => ("ult", 2, true),
    Uge => ("uge", 2, true),
    I2b => ("i2b", 1, true),
    F2b => ("f2b", 1, true),
    Seq => ("seq", 2, true),
    Sne => ("sne", 2, true),
    Slt => ("slt", 2, true),
    Sge => ("sge", 2, true),
    Bcsel => ("bcsel", 3, false),
    Fcsel => ("fcsel", 3, false),
    UaddCarry => ("uadd_carry", 2, false),
    PackHalf2x16Split => ("pack_half_2x16_split", 2, false),
    UnpackHalf2x16SplitX => ("unpack_half_2x16_split_x", 1, false),
    UnpackHalf2x16SplitY => ("unpack_half_2x16_split_y", 1, false),
    Pack64_2x32Split => ("pack_64_2x32_split", 2, false),
    Unpack64_2x32SplitX => ("unpack_64_2x32_split_x", 1, false),
    Unpack64_2x32SplitY => ("unpack_64_2x32_split_y", 1, false),
}

impl AluOp {
    /// Comparisons whose result is a float 1.0/0.0 rather than a boolean.
    pub fn produces_float_bool(self) -> bool {
        matches!(self, AluOp::Seq | AluOp::Sne | AluOp::Slt | AluOp::Sge)
    }
}

impl fmt::Display for AluOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.info().name)
    }
}

/// Scalar ALU instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct AluInstr {
    pub op: AluOp,
    pub dest: Dest,
    pub srcs: Vec<AluSrc>,
}

/// Atomic read-modify-write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    IMin,
    UMin,
    IMax,
    UMax,
    And,
    Or,
    Xor,
    Exchange,
    CompSwap,
}

impl AtomicOp {
    pub const ALL: [AtomicOp; 10] = [
        AtomicOp::Add,
        AtomicOp::IMin,
        AtomicOp::UMin,
        AtomicOp::IMax,
        AtomicOp::UMax,
        AtomicOp::And,
        AtomicOp::Or,
        AtomicOp::Xor,
        AtomicOp::Exchange,
        AtomicOp::CompSwap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AtomicOp::Add => "add",
            AtomicOp::IMin => "imin",
            AtomicOp::UMin => "umin",
            AtomicOp::IMax => "imax",
            AtomicOp::UMax => "umax",
            AtomicOp::And => "and",
            AtomicOp::Or => "or",
            AtomicOp::Xor => "xor",
            AtomicOp::Exchange => "exchange",
            AtomicOp::CompSwap => "comp_swap",
        }
    }

    pub fn from_name(name: &str) -> Option<AtomicOp> {
        AtomicOp::ALL.iter().copied().find(|op| op.name() == name)
    }

    /// Number of data operands.
    pub fn num_data(self) -> usize {
        if self == AtomicOp::CompSwap {
            2
        } else {
            1
        }
    }
}

/// Which memory an intrinsic addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSpace {
    /// Default uniform block, dynamically indexed.
    Uniform,
    Ubo,
    Ssbo,
    Shared,
    Scratch,
}

/// How an intrinsic accesses memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Load,
    Store,
    Atomic(AtomicOp),
}

/// Named intrinsic operations.
///
/// Source order follows the usual conventions: stores take the value first,
/// buffer accesses take the buffer index before the offset, atomics take the
/// data operands last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    LoadUniform,
    LoadUbo,
    LoadSsbo,
    StoreSsbo,
    SsboAtomic(AtomicOp),
    LoadShared,
    StoreShared,
    SharedAtomic(AtomicOp),
    LoadScratch,
    StoreScratch,
    ImageLoad,
    ImageStore,
    ImageAtomic(AtomicOp),
    ImageSize,
    GetBufferSize,
    LoadInput,
    LoadPerVertexInput,
    StoreOutput,
    LoadTlbColor,
    StoreTlbSampleColor,
    LoadUserClipPlane,
    LoadViewportXScale,
    LoadViewportYScale,
    LoadViewportZScale,
    LoadViewportZOffset,
    LoadAlphaRef,
    LoadSampleMaskIn,
    LoadHelperInvocation,
    LoadFrontFace,
    LoadInstanceId,
    LoadVertexId,
    LoadNumWorkGroups,
    LoadLocalInvocationIndex,
    LoadWorkGroupId,
    LoadSubgroupId,
    LoadPrimitiveId,
    LoadInvocationId,
    LoadFbLayers,
    Discard,
    DiscardIf,
    MemoryBarrier,
    ControlBarrier,
    EmitVertex,
    EndPrimitive,
}

const SIMPLE_INTRINSICS: &[(Intrinsic, &str)] = &[
    (Intrinsic::LoadUniform, "load_uniform"),
    (Intrinsic::LoadUbo, "load_ubo"),
    (Intrinsic::LoadSsbo, "load_ssbo"),
    (Intrinsic::StoreSsbo, "store_ssbo"),
    (Intrinsic::LoadShared, "load_shared"),
    (Intrinsic::StoreShared, "store_shared"),
    (Intrinsic::LoadScratch, "load_scratch"),
    (Intrinsic::StoreScratch, "store_scratch"),
    (Intrinsic::ImageLoad, "image_load"),
    (Intrinsic::ImageStore, "image_store"),
    (Intrinsic::ImageSize, "image_size"),
    (Intrinsic::GetBufferSize, "get_buffer_size"),
    (Intrinsic::LoadInput, "load_input"),
    (Intrinsic::LoadPerVertexInput, "load_per_vertex_input"),
    (Intrinsic::StoreOutput, "store_output"),
    (Intrinsic::LoadTlbColor, "load_tlb_color"),
    (Intrinsic::StoreTlbSampleColor, "store_tlb_sample_color"),
    (Intrinsic::LoadUserClipPlane, "load_user_clip_plane"),
    (Intrinsic::LoadViewportXScale, "load_viewport_x_scale"),
    (Intrinsic::LoadViewportYScale, "load_viewport_y_scale"),
    (Intrinsic::LoadViewportZScale, "load_viewport_z_scale"),
    (Intrinsic::LoadViewportZOffset, "load_viewport_z_offset"),
    (Intrinsic::LoadAlphaRef, "load_alpha_ref"),
    (Intrinsic::LoadSampleMaskIn, "load_sample_mask_in"),
    (Intrinsic::LoadHelperInvocation, "load_helper_invocation"),
    (Intrinsic::LoadFrontFace, "load_front_face"),
    (Intrinsic::LoadInstanceId, "load_instance_id"),
    (Intrinsic::LoadVertexId, "load_vertex_id"),
    (Intrinsic::LoadNumWorkGroups, "load_num_work_groups"),
    (Intrinsic::LoadLocalInvocationIndex, "load_local_invocation_index"),
    (Intrinsic::LoadWorkGroupId, "load_work_group_id"),
    (Intrinsic::LoadSubgroupId, "load_subgroup_id"),
    (Intrinsic::LoadPrimitiveId, "load_primitive_id"),
    (Intrinsic::LoadInvocationId, "load_invocation_id"),
    (Intrinsic::LoadFbLayers, "load_fb_layers"),
    (Intrinsic::Discard, "discard"),
    (Intrinsic::DiscardIf, "discard_if"),
    (Intrinsic::MemoryBarrier, "memory_barrier"),
    (Intrinsic::ControlBarrier, "control_barrier"),
    (Intrinsic::EmitVertex, "emit_vertex"),
    (Intrinsic::EndPrimitive, "end_primitive"),
];

impl Intrinsic {
    pub fn from_name(name: &str) -> Option<Intrinsic> {
        if let Some(op) = name.strip_prefix("ssbo_atomic_") {
            return AtomicOp::from_name(op).map(Intrinsic::SsboAtomic);
        }
        if let Some(op) = name.strip_prefix("shared_atomic_") {
            return AtomicOp::from_name(op).map(Intrinsic::SharedAtomic);
        }
        if let Some(op) = name.strip_prefix("image_atomic_") {
            return AtomicOp::from_name(op).map(Intrinsic::ImageAtomic);
        }
        SIMPLE_INTRINSICS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(op, _)| *op)
    }

    /// Memory space and access kind for general memory intrinsics.
    pub fn memory_access(self) -> Option<(MemSpace, MemAccess)> {
        let access = match self {
            Intrinsic::LoadUniform => (MemSpace::Uniform, MemAccess::Load),
            Intrinsic::LoadUbo => (MemSpace::Ubo, MemAccess::Load),
            Intrinsic::LoadSsbo => (MemSpace::Ssbo, MemAccess::Load),
            Intrinsic::StoreSsbo => (MemSpace::Ssbo, MemAccess::Store),
            Intrinsic::SsboAtomic(op) => (MemSpace::Ssbo, MemAccess::Atomic(op)),
            Intrinsic::LoadShared => (MemSpace::Shared, MemAccess::Load),
            Intrinsic::StoreShared => (MemSpace::Shared, MemAccess::Store),
            Intrinsic::SharedAtomic(op) => (MemSpace::Shared, MemAccess::Atomic(op)),
            Intrinsic::LoadScratch => (MemSpace::Scratch, MemAccess::Load),
            Intrinsic::StoreScratch => (MemSpace::Scratch, MemAccess::Store),
            _ => return None,
        };
        Some(access)
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intrinsic::SsboAtomic(op) => write!(f, "ssbo_atomic_{}", op.name()),
            Intrinsic::SharedAtomic(op) => write!(f, "shared_atomic_{}", op.name()),
            Intrinsic::ImageAtomic(op) => write!(f, "image_atomic_{}", op.name()),
            other => {
                let name = SIMPLE_INTRINSICS
                    .iter()
                    .find(|(op, _)| op == other)
                    .map(|(_, n)| *n)
                    .unwrap_or("unknown");
                f.write_str(name)
            }
        }
    }
}

/// Sampler/image dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamplerDim {
    Dim1D,
    #[default]
    Dim2D,
    Dim3D,
    Cube,
    Rect,
    Ms,
    Buf,
}

impl SamplerDim {
    /// Number of coordinate components, excluding any array index.
    pub fn coord_components(self) -> usize {
        match self {
            SamplerDim::Dim1D | SamplerDim::Buf => 1,
            SamplerDim::Dim2D | SamplerDim::Rect | SamplerDim::Ms => 2,
            SamplerDim::Dim3D | SamplerDim::Cube => 3,
        }
    }

    pub fn from_name(name: &str) -> Option<SamplerDim> {
        match name {
            "1d" => Some(SamplerDim::Dim1D),
            "2d" => Some(SamplerDim::Dim2D),
            "3d" => Some(SamplerDim::Dim3D),
            "cube" => Some(SamplerDim::Cube),
            "rect" => Some(SamplerDim::Rect),
            "ms" => Some(SamplerDim::Ms),
            "buf" => Some(SamplerDim::Buf),
            _ => None,
        }
    }
}

/// Named index parameters of an intrinsic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntrinsicIndices {
    pub base: u32,
    pub component: u8,
    pub write_mask: u16,
    pub ucp_id: u32,
    pub range: u32,
    pub image_dim: SamplerDim,
    pub image_array: bool,
}

/// Intrinsic instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct IntrinsicInstr {
    pub op: Intrinsic,
    pub srcs: Vec<Src>,
    pub dest: Option<Dest>,
    /// Component count of the value loaded or stored.
    pub num_components: u8,
    pub indices: IntrinsicIndices,
}

impl IntrinsicInstr {
    /// Number of components written to the destination.
    pub fn dest_components(&self) -> usize {
        match &self.dest {
            Some(Dest::Ssa(def)) => def.num_components as usize,
            Some(Dest::Var(_)) => self.num_components as usize,
            None => 0,
        }
    }
}

/// Kind of a texture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexSrcKind {
    Coord,
    Bias,
    Lod,
    Comparator,
    Offset,
    Ddx,
    Ddy,
    MsIndex,
    Projector,
}

impl TexSrcKind {
    pub fn name(self) -> &'static str {
        match self {
            TexSrcKind::Coord => "coord",
            TexSrcKind::Bias => "bias",
            TexSrcKind::Lod => "lod",
            TexSrcKind::Comparator => "comparator",
            TexSrcKind::Offset => "offset",
            TexSrcKind::Ddx => "ddx",
            TexSrcKind::Ddy => "ddy",
            TexSrcKind::MsIndex => "ms_index",
            TexSrcKind::Projector => "projector",
        }
    }

    pub fn from_name(name: &str) -> Option<TexSrcKind> {
        [
            TexSrcKind::Coord,
            TexSrcKind::Bias,
            TexSrcKind::Lod,
            TexSrcKind::Comparator,
            TexSrcKind::Offset,
            TexSrcKind::Ddx,
            TexSrcKind::Ddy,
            TexSrcKind::MsIndex,
            TexSrcKind::Projector,
        ]
        .into_iter()
        .find(|k| k.name() == name)
    }
}

/// Texture operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexOp {
    Tex,
    Txb,
    Txl,
    Txd,
    Txf,
    TxfMs,
    Txs,
    QueryLevels,
    Lod,
    Tg4,
    /// Sample that may be issued by the hardware before the shader starts.
    TexPrefetch,
}

impl TexOp {
    pub fn name(self) -> &'static str {
        match self {
            TexOp::Tex => "tex",
            TexOp::Txb => "txb",
            TexOp::Txl => "txl",
            TexOp::Txd => "txd",
            TexOp::Txf => "txf",
            TexOp::TxfMs => "txf_ms",
            TexOp::Txs => "txs",
            TexOp::QueryLevels => "query_levels",
            TexOp::Lod => "lod",
            TexOp::Tg4 => "tg4",
            TexOp::TexPrefetch => "tex_prefetch",
        }
    }

    pub fn from_name(name: &str) -> Option<TexOp> {
        [
            TexOp::Tex,
            TexOp::Txb,
            TexOp::Txl,
            TexOp::Txd,
            TexOp::Txf,
            TexOp::TxfMs,
            TexOp::Txs,
            TexOp::QueryLevels,
            TexOp::Lod,
            TexOp::Tg4,
            TexOp::TexPrefetch,
        ]
        .into_iter()
        .find(|op| op.name() == name)
    }
}

/// Tagged texture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexSrc {
    pub kind: TexSrcKind,
    pub src: Src,
    pub num_components: u8,
}

/// Texture instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct TexInstr {
    pub op: TexOp,
    pub dest: SsaDef,
    pub srcs: Vec<TexSrc>,
    pub texture_index: u32,
    pub sampler_index: u32,
    pub dim: SamplerDim,
    pub is_array: bool,
    pub is_shadow: bool,
    /// Gathered component for `tg4`.
    pub component: u8,
}

impl TexInstr {
    pub fn src(&self, kind: TexSrcKind) -> Option<&TexSrc> {
        self.srcs.iter().find(|s| s.kind == kind)
    }
}

/// Jump kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Break,
    Continue,
    Return,
}

/// A portable-IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Alu(AluInstr),
    Intrinsic(IntrinsicInstr),
    Tex(TexInstr),
    LoadConst { def: SsaDef, values: Vec<u64> },
    Undef(SsaDef),
    Jump(JumpKind),
}

/// Structured `if`.
#[derive(Debug, Clone, PartialEq)]
pub struct IfNode {
    pub condition: Src,
    /// The condition is provably identical across all lanes.
    pub uniform: bool,
    pub then_body: Vec<CfNode>,
    pub else_body: Vec<CfNode>,
}

/// Structured infinite loop, exited through `break`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopNode {
    /// Every lane runs the same number of iterations.
    pub uniform: bool,
    pub body: Vec<CfNode>,
}

/// Control-flow tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum CfNode {
    Block(Vec<Instr>),
    If(IfNode),
    Loop(LoopNode),
}

/// Conventional varying slot numbers.
pub mod varying_slot {
    pub const POS: u32 = 0;
    pub const COL0: u32 = 1;
    pub const COL1: u32 = 2;
    pub const BFC0: u32 = 13;
    pub const BFC1: u32 = 14;
    pub const PNTC: u32 = 25;
    pub const VAR0: u32 = 32;
}

/// Conventional fragment result numbers.
pub mod frag_result {
    pub const DEPTH: u32 = 0;
    pub const STENCIL: u32 = 1;
    pub const COLOR: u32 = 2;
    pub const SAMPLE_MASK: u32 = 3;
    pub const DATA0: u32 = 4;
}

/// Scalar base type of an I/O variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseType {
    #[default]
    Float,
    Int,
    Uint,
    Bool,
}

/// Interpolation qualifier of a fragment input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    #[default]
    None,
    Smooth,
    NoPerspective,
    Flat,
}

/// Input or output variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct IoVariable {
    pub name: String,
    pub location: u32,
    pub driver_location: u32,
    pub location_frac: u8,
    pub num_components: u8,
    /// 0 for non-arrays.
    pub array_len: u32,
    pub base_type: BaseType,
    pub interpolation: Interpolation,
    pub centroid: bool,
}

impl IoVariable {
    pub fn new(name: impl Into<String>, location: u32, driver_location: u32, num_components: u8) -> Self {
        Self {
            name: name.into(),
            location,
            driver_location,
            location_frac: 0,
            num_components,
            array_len: 0,
            base_type: BaseType::Float,
            interpolation: Interpolation::None,
            centroid: false,
        }
    }
}

/// Legacy (non-SSA) variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub num_components: u8,
    pub bit_size: u8,
    /// 0 for non-arrays.
    pub array_len: u32,
    /// Reads before the first write observe zero.
    pub zero_init: bool,
}

impl Variable {
    /// Number of array elements, counting a scalar variable as one.
    pub fn elements(&self) -> u32 {
        self.array_len.max(1)
    }
}

/// Shader-wide information gathered by the front end.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderInfo {
    pub name: String,
    pub early_fragment_tests: bool,
    pub local_size: [u32; 3],
    /// Bytes of shared memory per workgroup.
    pub shared_size: u32,
    /// Bytes of scratch memory per lane.
    pub scratch_size: u32,
    pub reads_instance_id: bool,
    pub reads_vertex_id: bool,
}

impl Default for ShaderInfo {
    fn default() -> Self {
        Self {
            name: String::from("main"),
            early_fragment_tests: false,
            local_size: [1, 1, 1],
            shared_size: 0,
            scratch_size: 0,
            reads_instance_id: false,
            reads_vertex_id: false,
        }
    }
}

/// A complete shader variant.
#[derive(Debug, Clone, PartialEq)]
pub struct Shader {
    pub stage: Stage,
    pub info: ShaderInfo,
    pub inputs: Vec<IoVariable>,
    pub outputs: Vec<IoVariable>,
    pub variables: Vec<Variable>,
    pub ssa_count: u32,
    pub body: Vec<CfNode>,
}

impl Shader {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            info: ShaderInfo::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            variables: Vec::new(),
            ssa_count: 0,
            body: Vec::new(),
        }
    }

    /// Iterate over every instruction in program order.
    pub fn instrs(&self) -> InstrIter<'_> {
        InstrIter {
            stack: vec![self.body.iter()],
            block: [].iter(),
        }
    }

    /// Whether any discard intrinsic is present.
    pub fn uses_discard(&self) -> bool {
        self.instrs().any(|instr| {
            matches!(
                instr,
                Instr::Intrinsic(IntrinsicInstr {
                    op: Intrinsic::Discard | Intrinsic::DiscardIf,
                    ..
                })
            )
        })
    }
}

/// Pre-order iterator over the instructions of a control-flow tree.
pub struct InstrIter<'a> {
    stack: Vec<std::slice::Iter<'a, CfNode>>,
    block: std::slice::Iter<'a, Instr>,
}

impl<'a> Iterator for InstrIter<'a> {
    type Item = &'a Instr;

    fn next(&mut self) -> Option<&'a Instr> {
        loop {
            if let Some(instr) = self.block.next() {
                return Some(instr);
            }
            let top = self.stack.last_mut()?;
            match top.next() {
                None => {
                    self.stack.pop();
                }
                Some(CfNode::Block(instrs)) => self.block = instrs.iter(),
                Some(CfNode::If(node)) => {
                    self.stack.push(node.else_body.iter());
                    self.stack.push(node.then_body.iter());
                }
                Some(CfNode::Loop(node)) => self.stack.push(node.body.iter()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_name_round_trip() {
        for op in AluOp::ALL {
            assert_eq!(AluOp::from_name(op.info().name), Some(*op));
        }
        assert_eq!(
            Intrinsic::from_name("ssbo_atomic_comp_swap"),
            Some(Intrinsic::SsboAtomic(AtomicOp::CompSwap))
        );
        assert_eq!(Intrinsic::from_name("discard_if"), Some(Intrinsic::DiscardIf));
        assert_eq!(Intrinsic::SharedAtomic(AtomicOp::UMax).to_string(), "shared_atomic_umax");
        assert_eq!(Intrinsic::from_name("bogus"), None);
    }

    #[test]
    fn test_memory_access() {
        assert_eq!(
            Intrinsic::StoreSsbo.memory_access(),
            Some((MemSpace::Ssbo, MemAccess::Store))
        );
        assert_eq!(
            Intrinsic::SharedAtomic(AtomicOp::Add).memory_access(),
            Some((MemSpace::Shared, MemAccess::Atomic(AtomicOp::Add)))
        );
        assert_eq!(Intrinsic::ImageLoad.memory_access(), None);
    }

    #[test]
    fn test_instr_iter_visits_nested_bodies() {
        let mut shader = Shader::new(Stage::Fragment);
        let def = SsaDef { id: SsaId(0), num_components: 1, bit_size: 32 };
        shader.body = vec![
            CfNode::Block(vec![Instr::Undef(def)]),
            CfNode::If(IfNode {
                condition: Src::Ssa(SsaId(0)),
                uniform: false,
                then_body: vec![CfNode::Loop(LoopNode {
                    uniform: false,
                    body: vec![CfNode::Block(vec![Instr::Jump(JumpKind::Break)])],
                })],
                else_body: vec![CfNode::Block(vec![Instr::Jump(JumpKind::Return)])],
            }),
        ];

        let kinds: Vec<_> = shader
            .instrs()
            .map(|i| match i {
                Instr::Undef(_) => "undef",
                Instr::Jump(JumpKind::Break) => "break",
                Instr::Jump(JumpKind::Return) => "return",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["undef", "break", "return"]);
    }
}
