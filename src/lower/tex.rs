// This module lowers texture and image instructions onto the TMU. Size and level-count
// queries never reach the TMU: the driver uploads them as uniforms, and the lowering only
// minifies the size by the requested level. Sampling writes each parameter to its own
// magic register (coordinates to TMUT/TMUR, the array or sample index to TMUI, bias or
// level to TMUB, the shadow reference to TMUDREF, a dynamic texel offset to TMUOFF) and
// finishes with the S coordinate, whose write carries the config uniform and launches the
// request. Static state (fetch vs filter, shadow, gather component, constant offsets, array
// and dimension bits, returned components) is packed into that config word. A prefetchable
// top-level fragment sample becomes a placeholder that the hardware can issue before the
// shader starts. Image loads, stores and atomics follow the same shape with the data words
// written to TMUD first and an image config uniform on the launching write.

//! Texture and image lowering.

use super::{Compiler, MAX_TEX_PREFETCH};
use crate::core::{CompileError, CompileResult};
use crate::ir::{
    AtomicOp, Intrinsic, IntrinsicInstr, SamplerDim, Src, Stage, TexInstr, TexOp, TexSrc,
    TexSrcKind,
};
use crate::vir::{
    BarrierClass, Cond, Dst, Opcode, Operand, PrefetchPlaceholder, RegClass, SizeQuery,
    TmuOp, TmuTag, TmuType, UniformContents, Waddr,
};

use super::memory::atomic_tmu_op;

/// Config flag bits of a texture or image request.
pub mod flags {
    pub const FETCH: u32 = 1 << 0;
    pub const SHADOW: u32 = 1 << 1;
    pub const BIAS: u32 = 1 << 2;
    pub const LOD: u32 = 1 << 3;
    pub const GATHER: u32 = 1 << 4;
    pub const GATHER_COMPONENT_SHIFT: u32 = 5;
    pub const LOD_QUERY: u32 = 1 << 7;
    pub const OFFSET_SHIFT: u32 = 8;
    pub const ARRAY: u32 = 1 << 20;
    pub const DIM_SHIFT: u32 = 21;
    pub const WRMASK_SHIFT: u32 = 24;
    /// Images only: the TMU operation.
    pub const IMAGE_OP_SHIFT: u32 = 28;
}

fn dim_bits(dim: SamplerDim) -> u32 {
    match dim {
        SamplerDim::Dim1D => 0,
        SamplerDim::Dim2D => 1,
        SamplerDim::Dim3D => 2,
        SamplerDim::Cube => 3,
        SamplerDim::Rect => 4,
        SamplerDim::Ms => 5,
        SamplerDim::Buf => 6,
    }
}

/// Pack constant texel offsets, four signed bits per axis.
fn pack_offsets(offsets: &[u32]) -> u32 {
    offsets
        .iter()
        .enumerate()
        .fold(0, |acc, (i, &o)| acc | (o & 0xf) << (flags::OFFSET_SHIFT + 4 * i as u32))
}

/// Reject source combinations the TMU cannot express.
fn validate(instr: &TexInstr) -> CompileResult<()> {
    let malformed = |reason: String| -> CompileResult<()> {
        Err(CompileError::MalformedTexture { reason })
    };
    let op = instr.op.name();
    let has = |kind| instr.src(kind).is_some();

    if instr.op == TexOp::Txd {
        return Err(CompileError::unsupported(
            "texture",
            "explicit-gradient sampling has no hardware path",
        ));
    }
    if matches!(instr.op, TexOp::Txs | TexOp::QueryLevels) {
        return Ok(());
    }
    if !has(TexSrcKind::Coord) {
        return malformed(format!("{op} without a coordinate"));
    }
    if has(TexSrcKind::Bias) && has(TexSrcKind::Lod) {
        return malformed(format!("{op} with both bias and lod"));
    }
    if has(TexSrcKind::Comparator) && !instr.is_shadow {
        return malformed(format!("{op} has a comparator on a non-shadow sampler"));
    }
    if has(TexSrcKind::Ddx) || has(TexSrcKind::Ddy) {
        return malformed(format!("{op} has derivative sources"));
    }
    if has(TexSrcKind::MsIndex) && instr.op != TexOp::TxfMs {
        return malformed(format!("{op} has a sample index"));
    }
    if has(TexSrcKind::Projector) {
        return malformed(format!("{op} still has a projector"));
    }
    if instr.op == TexOp::TxfMs && instr.is_array {
        return Err(CompileError::unsupported(
            "texture",
            "multisample array fetches",
        ));
    }
    Ok(())
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn emit_tex(&mut self, instr: &'s TexInstr) -> CompileResult<()> {
        validate(instr)?;
        match instr.op {
            TexOp::QueryLevels => {
                let levels = self.uniform_pending(UniformContents::TextureSize {
                    texture: instr.texture_index,
                    query: SizeQuery::Levels,
                });
                self.bind_ssa(&instr.dest, 0, levels.operand())
            }
            TexOp::Txs => self.emit_txs(instr),
            TexOp::TexPrefetch if self.try_emit_prefetch(instr)? => Ok(()),
            _ => self.emit_sample(instr),
        }
    }

    fn emit_txs(&mut self, instr: &TexInstr) -> CompileResult<()> {
        let count = instr.dest.num_components as usize;
        let lod = match instr.src(TexSrcKind::Lod) {
            Some(lod) if self.values.constant_u32(&lod.src, 0) != Some(0) => {
                Some(self.get_src(&lod.src, 0)?)
            }
            _ => None,
        };
        let queries = [SizeQuery::Width, SizeQuery::Height, SizeQuery::Depth];
        for i in 0..count {
            let array_size = instr.is_array && i == count - 1;
            let query = if array_size {
                SizeQuery::ArraySize
            } else {
                *queries.get(i).ok_or_else(|| {
                    CompileError::MalformedTexture {
                        reason: format!("txs with {count} components"),
                    }
                })?
            };
            let size = self.uniform(UniformContents::TextureSize {
                texture: instr.texture_index,
                query,
            });
            let size = match lod {
                Some(lod) if !array_size && instr.dim != SamplerDim::Rect => {
                    let shifted = self.emit(Opcode::Shr, RegClass::Full, &[size, lod]).operand();
                    let one = self.imm(1);
                    self.emit(Opcode::Max, RegClass::Full, &[shifted, one]).operand()
                }
                _ => size,
            };
            self.bind_ssa(&instr.dest, i, size)?;
        }
        Ok(())
    }

    fn try_emit_prefetch(&mut self, instr: &TexInstr) -> CompileResult<bool> {
        let eligible = self.shader.stage == Stage::Fragment
            && self.cf_depth == 0
            && instr.srcs.len() == 1
            && self.module.prefetches.len() < MAX_TEX_PREFETCH;
        let coord_input = match instr.src(TexSrcKind::Coord) {
            Some(TexSrc { src: Src::Ssa(id), .. }) if eligible => self.values.input_offset(*id),
            _ => None,
        };
        let Some(input_offset) = coord_input else {
            log::debug!("texture prefetch on unit {} falls back to sampling", instr.texture_index);
            return Ok(false);
        };

        let class = RegClass::for_bit_size(instr.dest.bit_size);
        let mut insts = Vec::with_capacity(instr.dest.num_components as usize);
        for i in 0..instr.dest.num_components as usize {
            let value = self.emit(Opcode::TexPrefetch, class, &[]);
            insts.push(value.inst());
            self.bind_ssa(&instr.dest, i, value.operand())?;
        }
        log::debug!(
            "texture prefetch {} on unit {} from input {}",
            self.module.prefetches.len(),
            instr.texture_index,
            input_offset
        );
        self.module.prefetches.push(PrefetchPlaceholder {
            insts,
            input_offset,
            texture: instr.texture_index,
            sampler: instr.sampler_index,
            wrmask: ((1u32 << instr.dest.num_components) - 1) as u8,
            half_precision: instr.dest.bit_size == 16,
            resolved_slot: None,
        });
        Ok(true)
    }

    fn emit_sample(&mut self, instr: &TexInstr) -> CompileResult<()> {
        let components = instr.dest.num_components as u32;
        let mut config = ((1u32 << components) - 1) << flags::WRMASK_SHIFT
            | dim_bits(instr.dim) << flags::DIM_SHIFT;
        if instr.is_array {
            config |= flags::ARRAY;
        }
        match instr.op {
            TexOp::Txf | TexOp::TxfMs => config |= flags::FETCH,
            TexOp::Lod => config |= flags::LOD_QUERY,
            TexOp::Tg4 => {
                config |= flags::GATHER | (instr.component as u32) << flags::GATHER_COMPONENT_SHIFT
            }
            _ => {}
        }
        if instr.is_shadow {
            config |= flags::SHADOW;
        }

        let coord = instr
            .src(TexSrcKind::Coord)
            .ok_or_else(|| CompileError::MalformedTexture {
                reason: format!("{} without a coordinate", instr.op.name()),
            })?;
        let axes = instr.dim.coord_components();
        let mut writes: Vec<(Waddr, Operand)> = Vec::new();
        let mut s = None;
        for axis in 0..axes {
            let value = self.get_src(&coord.src, axis)?;
            match axis {
                0 => s = Some(value),
                1 => writes.push((Waddr::Tmut, value)),
                _ => writes.push((Waddr::Tmur, value)),
            }
        }
        if instr.is_array {
            let index = self.get_src(&coord.src, axes)?;
            writes.push((Waddr::Tmui, index));
        }
        if let Some(sample) = instr.src(TexSrcKind::MsIndex) {
            let index = self.get_src(&sample.src, 0)?;
            writes.push((Waddr::Tmui, index));
        }
        if let Some(bias) = instr.src(TexSrcKind::Bias) {
            config |= flags::BIAS;
            let value = self.get_src(&bias.src, 0)?;
            writes.push((Waddr::Tmub, value));
        }
        if let Some(lod) = instr.src(TexSrcKind::Lod) {
            config |= flags::LOD;
            let value = self.get_src(&lod.src, 0)?;
            writes.push((Waddr::Tmub, value));
        }
        if let Some(comparator) = instr.src(TexSrcKind::Comparator) {
            let value = self.get_src(&comparator.src, 0)?;
            writes.push((Waddr::Tmudref, value));
        }
        if let Some(offset) = instr.src(TexSrcKind::Offset) {
            let count = offset.num_components as usize;
            let constant: Option<Vec<u32>> = (0..count)
                .map(|c| self.values.constant_u32(&offset.src, c))
                .collect();
            match constant {
                Some(offsets) => config |= pack_offsets(&offsets),
                None => {
                    let packed = self.pack_dynamic_offsets(&offset.src, count)?;
                    writes.push((Waddr::Tmuoff, packed));
                }
            }
        }
        let s = s.ok_or_else(|| CompileError::MalformedTexture {
            reason: format!("{} has no s coordinate", instr.op.name()),
        })?;

        self.fit_tmu_fifo(writes.len() as u32 + 1)?;
        let barrier = BarrierClass::TMU;
        for (waddr, value) in writes {
            self.emit_with(Opcode::Mov, Dst::Magic(waddr), &[value], |i| i.barrier = barrier);
        }
        let launch = if config & flags::FETCH != 0 { Waddr::Tmusf } else { Waddr::Tmus };
        let uniform = self.module.uniforms.add(UniformContents::TexConfig {
            texture: instr.texture_index,
            sampler: instr.sampler_index,
            flags: config,
        });
        let tag = TmuTag {
            op: TmuOp::Regular,
            ty: TmuType::for_components(components),
            components: components as u8,
            per_pixel: true,
        };
        self.emit_with(Opcode::Mov, Dst::Magic(launch), &[s], |i| {
            i.uniform = Some(uniform);
            i.tmu = Some(tag);
            i.barrier = barrier;
        });
        self.session.record_tmu_request();

        self.emit_thrsw();

        let class = RegClass::for_bit_size(instr.dest.bit_size);
        for i in 0..components as usize {
            let result = self.emit(Opcode::LdTmu, class, &[]);
            self.bind_ssa(&instr.dest, i, result.operand())?;
        }
        Ok(())
    }

    /// Pack non-constant texel offsets the way the config word holds them.
    fn pack_dynamic_offsets(&mut self, src: &Src, count: usize) -> CompileResult<Operand> {
        let full = RegClass::Full;
        let mask = self.imm(0xf);
        let mut packed: Option<Operand> = None;
        for c in 0..count {
            let value = self.get_src(src, c)?;
            let mut field = self.emit(Opcode::And, full, &[value, mask]).operand();
            if c > 0 {
                let shift = self.imm(4 * c as u32);
                field = self.emit(Opcode::Shl, full, &[field, shift]).operand();
            }
            packed = Some(match packed {
                Some(acc) => self.emit(Opcode::Or, full, &[acc, field]).operand(),
                None => field,
            });
        }
        packed.ok_or_else(|| CompileError::MalformedTexture {
            reason: "empty texel offset".to_string(),
        })
    }

    /// Image load, store or atomic: `[image, coord, data...]`.
    pub(super) fn emit_image_load_store(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let image = self.const_index(instr.srcs.first(), "image index")?;
        let coord = instr
            .srcs
            .get(1)
            .ok_or_else(|| CompileError::structural(format!("{} is missing its coordinate", instr.op)))?;
        let dim = instr.indices.image_dim;
        if dim == SamplerDim::Ms {
            return Err(CompileError::unsupported("image", "multisample images"));
        }

        let (op, results, data) = match instr.op {
            Intrinsic::ImageLoad => (TmuOp::Regular, instr.dest_components() as u32, Vec::new()),
            Intrinsic::ImageStore => {
                let value = instr.srcs.get(2).ok_or_else(|| {
                    CompileError::structural("image_store is missing its value")
                })?;
                let mut data = Vec::with_capacity(instr.num_components as usize);
                for c in 0..instr.num_components as usize {
                    data.push(self.get_src(value, c)?);
                }
                (TmuOp::Regular, 0, data)
            }
            Intrinsic::ImageAtomic(atomic) => self.image_atomic_data(instr, atomic)?,
            _ => {
                return Err(CompileError::structural(format!(
                    "{} is not an image access",
                    instr.op
                )))
            }
        };
        if instr.op != Intrinsic::ImageLoad {
            self.module.has_side_effect_memory_op = true;
        }

        let axes = dim.coord_components();
        let mut writes: Vec<(Waddr, Operand)> =
            data.iter().map(|&d| (Waddr::Tmud, d)).collect();
        let mut s = None;
        for axis in 0..axes {
            let value = self.get_src(coord, axis)?;
            match axis {
                0 => s = Some(value),
                1 => writes.push((Waddr::Tmut, value)),
                _ => writes.push((Waddr::Tmur, value)),
            }
        }
        if instr.indices.image_array {
            let index = self.get_src(coord, axes)?;
            writes.push((Waddr::Tmui, index));
        }
        let s = s.ok_or_else(|| CompileError::structural("image coordinate has no s"))?;

        let components = match instr.op {
            Intrinsic::ImageStore => data.len() as u32,
            _ => results.max(1),
        };
        let mut config = ((1u32 << components) - 1) << flags::WRMASK_SHIFT
            | dim_bits(dim) << flags::DIM_SHIFT
            | (op as u32) << flags::IMAGE_OP_SHIFT;
        if instr.indices.image_array {
            config |= flags::ARRAY;
        }

        self.fit_tmu_fifo(writes.len() as u32 + 1)?;
        let barrier = BarrierClass::TMU | BarrierClass::IMAGE;
        for (waddr, value) in writes {
            self.emit_with(Opcode::Mov, Dst::Magic(waddr), &[value], |i| i.barrier = barrier);
        }
        let predicated = self.in_divergent_flow() && instr.op != Intrinsic::ImageLoad;
        if predicated {
            self.push_exec_z()?;
        }
        let uniform = self.module.uniforms.add(UniformContents::ImageConfig {
            image,
            flags: config,
        });
        let tag = TmuTag {
            op,
            ty: TmuType::for_components(components),
            components: components as u8,
            per_pixel: true,
        };
        self.emit_with(Opcode::Mov, Dst::Magic(Waddr::Tmus), &[s], |i| {
            i.uniform = Some(uniform);
            i.tmu = Some(tag);
            i.barrier = barrier;
            if predicated {
                i.cond = Cond::IfA;
            }
        });
        self.session.record_tmu_request();

        self.emit_thrsw();

        if results == 0 {
            self.emit_with(Opcode::Tmuwt, Dst::Null, &[], |i| i.barrier = barrier);
            return Ok(());
        }
        let dest = instr
            .dest
            .as_ref()
            .ok_or_else(|| CompileError::structural(format!("{} has no destination", instr.op)))?;
        for i in 0..results as usize {
            let result = self.emit(Opcode::LdTmu, RegClass::Full, &[]);
            self.store_dest(dest, i, result)?;
        }
        Ok(())
    }

    fn image_atomic_data(
        &mut self,
        instr: &IntrinsicInstr,
        atomic: AtomicOp,
    ) -> CompileResult<(TmuOp, u32, Vec<Operand>)> {
        let data_srcs = instr.srcs.get(2..).unwrap_or_default();
        if data_srcs.len() < atomic.num_data() {
            return Err(CompileError::structural(format!("{} is missing its data", instr.op)));
        }
        let constant = data_srcs.first().and_then(|s| self.values.constant_u32(s, 0));
        let (op, no_data) = atomic_tmu_op(atomic, constant, self.key.has_atomic_inc_dec);
        let mut data = Vec::new();
        if !no_data {
            for src in data_srcs {
                data.push(self.get_src(src, 0)?);
            }
        }
        Ok((op, u32::from(instr.dest.is_some()), data))
    }

    pub(super) fn emit_image_size(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let image = self.const_index(instr.srcs.first(), "image index")?;
        let dest = instr
            .dest
            .as_ref()
            .ok_or_else(|| CompileError::structural("image_size has no destination"))?;
        let count = instr.dest_components();
        let queries = [SizeQuery::Width, SizeQuery::Height, SizeQuery::Depth];
        for i in 0..count {
            let query = if instr.indices.image_array && i == count - 1 {
                SizeQuery::ArraySize
            } else {
                *queries.get(i).ok_or_else(|| {
                    CompileError::structural(format!("image_size with {count} components"))
                })?
            };
            let size = self.uniform_pending(UniformContents::ImageSize { image, query });
            self.store_dest(dest, i, size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::compile_text;
    use super::*;
    use crate::core::CompileKey;
    use crate::ir::SsaDef;
    use crate::vir::{Inst, Module, PushFlag};

    fn tex(op: TexOp, kinds: &[TexSrcKind]) -> TexInstr {
        TexInstr {
            op,
            dest: SsaDef {
                id: crate::ir::SsaId(9),
                num_components: 4,
                bit_size: 32,
            },
            srcs: kinds
                .iter()
                .enumerate()
                .map(|(i, &kind)| TexSrc {
                    kind,
                    src: Src::Ssa(crate::ir::SsaId(i as u32)),
                    num_components: 1,
                })
                .collect(),
            texture_index: 0,
            sampler_index: 0,
            dim: SamplerDim::Dim2D,
            is_array: false,
            is_shadow: false,
            component: 0,
        }
    }

    #[test]
    fn test_pack_offsets() {
        assert_eq!(pack_offsets(&[1, 2]), 1 << 8 | 2 << 12);
        // -1 keeps its low four bits.
        assert_eq!(pack_offsets(&[0xffff_ffff]), 0xf << 8);
    }

    #[test]
    fn test_validate() {
        use TexSrcKind::*;
        assert!(validate(&tex(TexOp::Tex, &[Coord])).is_ok());
        assert!(validate(&tex(TexOp::Txs, &[Lod])).is_ok());

        let err = validate(&tex(TexOp::Tex, &[Bias])).unwrap_err();
        assert!(matches!(err, CompileError::MalformedTexture { .. }));
        assert!(validate(&tex(TexOp::Txb, &[Coord, Bias, Lod])).is_err());
        assert!(validate(&tex(TexOp::Tex, &[Coord, Comparator])).is_err());
        assert!(validate(&tex(TexOp::Txf, &[Coord, MsIndex])).is_err());
        assert!(validate(&tex(TexOp::TxfMs, &[Coord, MsIndex])).is_ok());
        assert!(validate(&tex(TexOp::Tex, &[Coord, Projector])).is_err());

        let mut shadow = tex(TexOp::Tex, &[Coord, Comparator]);
        shadow.is_shadow = true;
        assert!(validate(&shadow).is_ok());

        let err = validate(&tex(TexOp::Txd, &[Coord, Ddx, Ddy])).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }));
    }

    const IMAGE_COPY: &str = "\
stage compute
%zero:32x1 = load_const 0
%one:32x1 = load_const 1
%coord:32x2 = vec2 %zero %one
%texel:32x4 = image_load %zero %coord {dim=2d}
image_store %one %coord %texel {dim=2d}
";

    const NESTED_IMAGE_STORE: &str = "\
stage compute
%zero:32x1 = load_const 0
%lane:32x1 = load_subgroup_id
%coord:32x2 = vec2 %lane %zero
%val:32x4 = vec4 %lane %lane %lane %lane
%c:1x1 = ieq %lane %zero
if %c {
  image_store %zero %coord %val {dim=2d}
  %old:32x1 = image_atomic_add %zero %coord %lane {dim=2d}
}
";

    fn launches(module: &Module) -> Vec<&Inst> {
        module
            .instructions()
            .filter(|(_, _, inst)| inst.dst == Dst::Magic(Waddr::Tmus))
            .map(|(_, _, inst)| inst)
            .collect()
    }

    fn image_configs(module: &Module) -> Vec<(u32, u32)> {
        launches(module)
            .iter()
            .filter_map(|inst| match inst.uniform.and_then(|u| module.uniforms.get(u)) {
                Some(&UniformContents::ImageConfig { image, flags }) => Some((image, flags)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_image_load_and_store_at_top_level() {
        let module = compile_text(IMAGE_COPY, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert!(module.has_side_effect_memory_op);

        let configs = image_configs(&module);
        assert_eq!(configs.len(), 2, "{module}");
        let wrmask = 0xf << flags::WRMASK_SHIFT;
        assert_eq!(configs[0].0, 0);
        assert_eq!(configs[0].1 & wrmask, wrmask);
        assert_eq!(configs[1].0, 1);
        assert_eq!(configs[1].1 & wrmask, wrmask);

        // Uniform control flow needs no predication.
        assert!(launches(&module).iter().all(|inst| inst.cond == Cond::Always));

        let ldtmu = module.instructions().filter(|(_, _, i)| i.op == Opcode::LdTmu).count();
        assert_eq!(ldtmu, 4);
        let data = module
            .instructions()
            .filter(|(_, _, i)| i.dst == Dst::Magic(Waddr::Tmud))
            .count();
        assert_eq!(data, 4);
        let tmuwt = module.instructions().filter(|(_, _, i)| i.op == Opcode::Tmuwt).count();
        assert_eq!(tmuwt, 1);
    }

    #[test]
    fn test_divergent_image_writes_are_predicated() {
        let module =
            compile_text(NESTED_IMAGE_STORE, &CompileKey::default()).unwrap_or_else(|e| panic!("{e}"));
        assert!(module.has_side_effect_memory_op);

        let mut launched = 0;
        for (block, id, inst) in module.instructions() {
            if inst.dst != Dst::Magic(Waddr::Tmus) {
                continue;
            }
            launched += 1;
            assert_eq!(inst.cond, Cond::IfA, "{module}");
            let insts = &module.block(block).insts;
            let at = insts.iter().position(|&i| i == id).unwrap();
            let push = module.inst(insts[at - 1]);
            assert_eq!(push.op, Opcode::Mov);
            assert_eq!(push.pf, Some(PushFlag::PushZ));
        }
        assert_eq!(launched, 2);

        // The atomic returns its old value.
        let ldtmu = module.instructions().filter(|(_, _, i)| i.op == Opcode::LdTmu).count();
        assert_eq!(ldtmu, 1);
    }

    #[test]
    fn test_multisample_image_is_unsupported() {
        let text = "\
stage compute
%zero:32x1 = load_const 0
%coord:32x2 = vec2 %zero %zero
%texel:32x4 = image_load %zero %coord {dim=ms}
";
        let err = compile_text(text, &CompileKey::default()).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { .. }), "{err}");
    }
}
