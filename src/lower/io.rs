// This module owns everything that crosses a shader stage boundary. At entry it reads the
// hardware payload registers (fragment W, centroid W and Z; compute workgroup and local
// ids), computes the shared-memory and spill bases, fetches fragment varyings in
// driver_location order with their interpolation (perspective, noperspective, flat, and
// the flat-shading override for unqualified color slots), sizes the vertex attributes and
// reads the instance and vertex ids, and records the input and output slot tables the
// driver uses to link stages. During the body it serves load_input, per-vertex loads,
// store_output (an output value table in fragment shaders, VPM writes elsewhere), the
// per-sample color table and cached TLB color reads. At the end it emits the stage
// epilogue: alpha-to-coverage, the depth or passthrough-Z write and the per-render-target
// TLB color writes for fragment shaders, and the VPM write barrier for vertex and geometry.

//! Stage entry, varying I/O and epilogues.

use super::Compiler;
use crate::core::{CompileError, CompileResult, MAX_DRAW_BUFFERS, MAX_SAMPLES, QPU_CHANNELS};
use crate::ir::{
    frag_result, varying_slot, BaseType, Dest, Instr, Interpolation, Intrinsic, IntrinsicInstr,
    IoVariable, Stage,
};
use crate::vir::{
    BarrierClass, Dst, HwReg, InputSlot, InterpFlags, Opcode, Operand, OutputSlot, RegClass,
    UniformContents, Unpack, Waddr,
};
use hashbrown::HashMap;

const TLB_TYPE_F16_COLOR: u32 = 3 << 6;
const TLB_TYPE_I32_COLOR: u32 = 1 << 6;
const TLB_TYPE_F32_COLOR: u32 = 0;
const TLB_TYPE_DEPTH: u32 = 2 << 6;
const TLB_RENDER_TARGET_SHIFT: u32 = 3;
const TLB_SAMPLE_MODE_PER_PIXEL: u32 = 1 << 2;
const TLB_F16_SWAP_HI_LO: u32 = 1 << 1;
const TLB_VEC_SIZE_4_F16: u32 = 1 << 0;
const TLB_DEPTH_TYPE_PER_PIXEL: u32 = 1 << 2;
const TLB_V42_DEPTH_TYPE_PER_PIXEL: u32 = 1 << 3;

/// Stage-boundary values of one compile.
#[derive(Debug, Default)]
pub(super) struct IoState {
    pub payload_w: Option<Operand>,
    pub payload_w_centroid: Option<Operand>,
    pub payload_z: Option<Operand>,
    pub point_x: Option<Operand>,
    pub point_y: Option<Operand>,
    /// Fragment inputs by `driver_location * 4 + component`.
    pub inputs: Vec<Option<Operand>>,
    /// Packed input slot of each `driver_location * 4 + component`.
    pub input_slot_of: HashMap<u32, u32>,
    /// Fragment output values by `driver_location * 4 + component`.
    pub outputs: Vec<Option<Operand>>,
    /// Index into the shader outputs of each render target's color variable.
    pub output_color_var: [Option<usize>; MAX_DRAW_BUFFERS],
    pub depth_index: Option<usize>,
    pub sample_mask_index: Option<usize>,
    pub sample_colors: Vec<Option<Operand>>,
    pub color_reads: Vec<Option<Operand>>,
    pub iid: Option<Operand>,
    pub vid: Option<Operand>,
    pub cs_payload: [Option<Operand>; 2],
    pub shared_base: Option<Operand>,
    pub spill_base: Option<Operand>,
}

/// Whether `var` is replaced by the point coordinate.
fn needs_point_coord(var: &IoVariable, point_sprite_mask: u32) -> bool {
    if var.location == varying_slot::PNTC {
        return true;
    }
    var.location >= varying_slot::VAR0
        && var.location - varying_slot::VAR0 < 32
        && point_sprite_mask & (1 << (var.location - varying_slot::VAR0)) != 0
}

fn is_int_type(var: &IoVariable) -> bool {
    matches!(var.base_type, BaseType::Int | BaseType::Uint)
}

/// Inputs in driver_location order.
fn sorted_inputs(inputs: &[IoVariable]) -> Vec<&IoVariable> {
    let mut sorted: Vec<&IoVariable> = inputs.iter().collect();
    sorted.sort_by_key(|v| v.driver_location);
    sorted
}

fn set_slot(table: &mut Vec<Option<Operand>>, index: usize, value: Operand) {
    if table.len() <= index {
        table.resize(index + 1, None);
    }
    table[index] = Some(value);
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn setup_fs_payload(&mut self) {
        self.io.payload_w = Some(self.mov(Operand::Hw(HwReg::Payload(0))).operand());
        self.io.payload_w_centroid = Some(self.mov(Operand::Hw(HwReg::Payload(1))).operand());
        self.io.payload_z = Some(self.mov(Operand::Hw(HwReg::Payload(2))).operand());

        let key = self.key;
        let fs = &key.fs;
        let reads_point_coord = self
            .shader
            .inputs
            .iter()
            .any(|v| needs_point_coord(v, fs.point_sprite_mask));
        if fs.is_points && (self.key.ver < 40 || reads_point_coord) {
            self.io.point_x = Some(self.emit_perspective_varying(None));
            self.io.point_y = Some(self.emit_perspective_varying(None));
            self.module.uses_implicit_point_line_varyings = true;
        } else if fs.is_lines && self.key.ver < 40 {
            // The line coordinate still has to be consumed.
            let _line_x = self.emit_perspective_varying(None);
            self.module.uses_implicit_point_line_varyings = true;
        }
    }

    pub(super) fn setup_cs_payload(&mut self) {
        if self.key.ver < 42 {
            self.emit_with(Opcode::BarrierId, Dst::Magic(Waddr::Sync), &[], |i| {
                i.barrier = BarrierClass::SYNC
            });
        }
        let payload0 = self.mov(Operand::Hw(HwReg::Payload(0))).operand();
        let payload1 = self.mov(Operand::Hw(HwReg::Payload(2))).operand();
        self.io.cs_payload = [Some(payload0), Some(payload1)];

        let shader = self.shader;
        let info = &shader.info;
        let wg_size: u32 = info.local_size.iter().product();
        let bits = wg_size.max(64).next_power_of_two().trailing_zeros();
        self.module.local_invocation_index_bits = bits;
        log::debug!("local invocation index uses {bits} payload bits");

        let shared_size = info.shared_size;
        if shared_size == 0 {
            return;
        }
        let full = RegClass::Full;
        let sixteen = self.imm(16);
        let mut wg_in_mem = self.emit(Opcode::Shr, full, &[payload1, sixteen]).operand();
        if info.local_size != [1, 1, 1] {
            let wg_bits = 16 - bits;
            let mask = self.imm((1 << wg_bits) - 1);
            wg_in_mem = self.emit(Opcode::And, full, &[wg_in_mem, mask]).operand();
        }
        let per_wg = self.imm(shared_size);
        let offset = self.umul(wg_in_mem, per_wg).operand();
        let base = self.uniform(UniformContents::SharedOffset);
        self.io.shared_base = Some(self.emit(Opcode::Add, full, &[base, offset]).operand());
        self.module.shared_bytes = shared_size;
    }

    /// Per-lane base address of the scratch area.
    pub(super) fn setup_scratch(&mut self) {
        let scratch_size = self.shader.info.scratch_size;
        if scratch_size == 0 {
            return;
        }
        let full = RegClass::Full;
        let tidx = self.emit(Opcode::Tidx, full, &[]).operand();
        let per_thread = self.uniform(UniformContents::SpillSizePerThread);
        let thread_offset = self.umul(tidx, per_thread).operand();
        let eidx = self.emit(Opcode::Eidx, full, &[]).operand();
        let two = self.imm(2);
        let element_offset = self.emit(Opcode::Shl, full, &[eidx, two]).operand();
        let lane_offset = self
            .emit(Opcode::Add, full, &[thread_offset, element_offset])
            .operand();
        let spill_offset = self.uniform(UniformContents::SpillOffset);
        self.io.spill_base = Some(self.emit(Opcode::Add, full, &[lane_offset, spill_offset]).operand());
        self.module.scratch_bytes = QPU_CHANNELS * scratch_size;
    }

    fn shader_reads(&self, op: Intrinsic) -> bool {
        self.shader
            .instrs()
            .any(|i| matches!(i, Instr::Intrinsic(intr) if intr.op == op))
    }

    fn reads_instance_id(&self) -> bool {
        self.shader.info.reads_instance_id || self.shader_reads(Intrinsic::LoadInstanceId)
    }

    fn reads_vertex_id(&self) -> bool {
        self.shader.info.reads_vertex_id || self.shader_reads(Intrinsic::LoadVertexId)
    }

    pub(super) fn setup_vs_inputs(&mut self) {
        let shader = self.shader;
        for var in &shader.inputs {
            let loc = var.driver_location as usize;
            if self.module.vattr_sizes.len() <= loc {
                self.module.vattr_sizes.resize(loc + 1, 0);
            }
            let size = var.location_frac + var.num_components;
            self.module.vattr_sizes[loc] = self.module.vattr_sizes[loc].max(size);
        }

        let mut queued = 0;
        if self.reads_instance_id() {
            let index = self.imm(queued);
            queued += 1;
            self.io.iid = Some(self.emit(Opcode::LdVpmVIn, RegClass::Full, &[index]).operand());
        }
        if self.reads_vertex_id() {
            let index = self.imm(queued);
            self.io.vid = Some(self.emit(Opcode::LdVpmVIn, RegClass::Full, &[index]).operand());
        }
        log::debug!("vertex attribute sizes {:?}", self.module.vattr_sizes);
    }

    pub(super) fn setup_gs_inputs(&mut self) {
        let shader = self.shader;
        for var in sorted_inputs(&shader.inputs) {
            for j in 0..var.array_len.max(1) {
                for k in 0..var.num_components {
                    let chan = var.location_frac + k;
                    self.module.inputs.push(InputSlot {
                        location: var.location + j,
                        component: chan,
                        interp: InterpFlags::default(),
                    });
                }
            }
        }
    }

    /// `vary * W + r5`, without an input slot.
    fn emit_perspective_varying(&mut self, w: Option<Operand>) -> Operand {
        let full = RegClass::Full;
        let vary = self.emit(Opcode::LdVary, full, &[]).operand();
        let w = w.or(self.io.payload_w).unwrap_or(Operand::SmallImm(0));
        let scaled = self.emit(Opcode::Fmul, full, &[vary, w]).operand();
        self.emit(Opcode::Fadd, full, &[scaled, Operand::Hw(HwReg::R5)]).operand()
    }

    fn emit_fragment_varying(&mut self, var: &IoVariable, chan: u8, array_index: u32) -> CompileResult<Operand> {
        let location = var.location + array_index;
        let is_color = matches!(
            location,
            varying_slot::COL0 | varying_slot::COL1 | varying_slot::BFC0 | varying_slot::BFC1
        );
        let mut interp = InterpFlags::default();
        let mode = match var.interpolation {
            Interpolation::None if is_color && self.key.fs.shade_model_flat => Interpolation::Flat,
            Interpolation::None => Interpolation::Smooth,
            mode => mode,
        };

        let full = RegClass::Full;
        let r5 = Operand::Hw(HwReg::R5);
        let result = match mode {
            Interpolation::Flat => {
                interp.flat = true;
                let _vary = self.emit(Opcode::LdVary, full, &[]);
                self.mov(r5).operand()
            }
            Interpolation::NoPerspective => {
                interp.noperspective = true;
                let vary = self.emit(Opcode::LdVary, full, &[]).operand();
                self.emit(Opcode::Fadd, full, &[vary, r5]).operand()
            }
            Interpolation::Smooth | Interpolation::None => {
                let w = if var.centroid {
                    interp.centroid = true;
                    self.io.payload_w_centroid
                } else {
                    self.io.payload_w
                };
                let w = w.ok_or_else(|| CompileError::structural("varying read before the payload"))?;
                self.emit_perspective_varying(Some(w))
            }
        };

        self.module.inputs.push(InputSlot {
            location,
            component: chan,
            interp,
        });
        Ok(result)
    }

    pub(super) fn setup_fs_inputs(&mut self) -> CompileResult<()> {
        let point_sprite_mask = self.key.fs.point_sprite_mask;
        let shader = self.shader;
        for var in sorted_inputs(&shader.inputs) {
            let loc = var.driver_location;
            if var.location == varying_slot::POS {
                let full = RegClass::Full;
                let base = loc as usize * 4;
                let x = self.emit(Opcode::Fxcd, full, &[]).operand();
                let y = self.emit(Opcode::Fycd, full, &[]).operand();
                set_slot(&mut self.io.inputs, base, x);
                set_slot(&mut self.io.inputs, base + 1, y);
                if let Some(z) = self.io.payload_z {
                    set_slot(&mut self.io.inputs, base + 2, z);
                }
                if let Some(w) = self.io.payload_w {
                    let rcp = self.emit(Opcode::Recip, full, &[w]).operand();
                    set_slot(&mut self.io.inputs, base + 3, rcp);
                }
            } else if needs_point_coord(var, point_sprite_mask) {
                let base = loc as usize * 4;
                if let (Some(x), Some(y)) = (self.io.point_x, self.io.point_y) {
                    set_slot(&mut self.io.inputs, base, x);
                    set_slot(&mut self.io.inputs, base + 1, y);
                }
            } else {
                for j in 0..var.array_len.max(1) {
                    for k in 0..var.num_components {
                        let chan = var.location_frac + k;
                        let slot = self.module.inputs.len() as u32;
                        let value = self.emit_fragment_varying(var, chan, j)?;
                        let offset = (loc + j) * 4 + chan as u32;
                        set_slot(&mut self.io.inputs, offset as usize, value);
                        self.io.input_slot_of.insert(offset, slot);
                    }
                }
            }
        }
        log::debug!("{} fragment input slots", self.module.inputs.len());
        Ok(())
    }

    pub(super) fn setup_outputs(&mut self) {
        let shader = self.shader;
        let fragment = shader.stage == Stage::Fragment;
        for (index, var) in shader.outputs.iter().enumerate() {
            let base = var.driver_location as usize * 4;
            for chan in var.location_frac..4 {
                let offset = base + chan as usize;
                if self.module.outputs.len() <= offset {
                    self.module.outputs.resize(offset + 1, None);
                }
                self.module.outputs[offset] = Some(OutputSlot {
                    location: var.location,
                    component: chan,
                });
            }

            if !fragment {
                continue;
            }
            match var.location {
                frag_result::COLOR => self.io.output_color_var = [Some(index); MAX_DRAW_BUFFERS],
                frag_result::DEPTH => self.io.depth_index = Some(base),
                frag_result::SAMPLE_MASK => self.io.sample_mask_index = Some(base),
                location if location >= frag_result::DATA0 => {
                    let rt = (location - frag_result::DATA0) as usize;
                    if rt < MAX_DRAW_BUFFERS {
                        self.io.output_color_var[rt] = Some(index);
                    }
                }
                _ => {}
            }
        }
    }

    /// Storage slots for every legacy variable.
    pub(super) fn setup_variables(&mut self) {
        let shader = self.shader;
        for (index, var) in shader.variables.iter().enumerate() {
            let var_id = crate::ir::VarId(index as u32);
            let words: u8 = if var.bit_size == 64 { 2 } else { 1 };
            let class = RegClass::for_bit_size(var.bit_size);
            let count = var.elements() * var.num_components as u32 * words as u32;
            let slots: Vec<_> = (0..count)
                .map(|slot| {
                    self.module
                        .new_value(class, crate::vir::ValueKind::Variable { var: var_id, slot })
                })
                .collect();
            if var.zero_init {
                for &slot in &slots {
                    self.emit_with(Opcode::Mov, Dst::Temp(slot), &[Operand::SmallImm(0)], |_| {});
                }
            }
            log::trace!("variable {} gets {} slots", var.name, slots.len());
            self.values.add_variable(crate::vir::VariableSlots {
                name: var.name.clone(),
                num_components: var.num_components,
                words,
                elements: var.elements(),
                slots,
            });
        }
    }

    fn io_dest<'i>(&self, instr: &'i IntrinsicInstr) -> CompileResult<&'i Dest> {
        instr
            .dest
            .as_ref()
            .ok_or_else(|| CompileError::structural(format!("{} has no destination", instr.op)))
    }

    pub(super) fn emit_load_input(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let offset = instr.indices.base + self.const_index(instr.srcs.first(), "input offset")?;
        let component = instr.indices.component as u32;
        let dest = self.io_dest(instr)?;
        let count = instr.dest_components();

        match self.shader.stage {
            Stage::Fragment => {
                for i in 0..count {
                    let index = (offset * 4 + component) as usize + i;
                    let input = self.io.inputs.get(index).copied().flatten().ok_or_else(|| {
                        CompileError::structural(format!("input {offset}.{} was never set up", component as usize + i))
                    })?;
                    let value = self.mov(input);
                    self.store_dest(dest, i, value)?;
                }
                if let Dest::Ssa(def) = dest {
                    self.values.set_input_offset(def.id, offset * 4 + component)?;
                }
                Ok(())
            }
            Stage::Vertex => {
                let mut index = u32::from(self.io.iid.is_some()) + u32::from(self.io.vid.is_some());
                index += self
                    .module
                    .vattr_sizes
                    .iter()
                    .take(offset as usize)
                    .map(|&s| s as u32)
                    .sum::<u32>();
                index += component;
                for i in 0..count {
                    let row = self.imm(index);
                    index += 1;
                    let value = self.emit(Opcode::LdVpmVIn, RegClass::Full, &[row]);
                    self.store_dest(dest, i, value)?;
                }
                Ok(())
            }
            Stage::Geometry | Stage::Compute => Err(CompileError::unsupported(
                "intrinsic",
                format!("load_input in a {} shader", self.shader.stage.name()),
            )),
        }
    }

    pub(super) fn emit_load_per_vertex_input(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let vertex = instr
            .srcs
            .first()
            .ok_or_else(|| CompileError::structural("load_per_vertex_input without a vertex index"))?;
        let column = self.get_src(vertex, 0)?;
        let dest = self.io_dest(instr)?;
        let mut row = instr.indices.base * 4 + instr.indices.component as u32;
        for i in 0..instr.dest_components() {
            let row_op = self.imm(row);
            row += 1;
            let value = self.emit(Opcode::LdVpmGIn, RegClass::Full, &[row_op, column]);
            self.store_dest(dest, i, value)?;
        }
        Ok(())
    }

    pub(super) fn emit_store_output(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let value = instr
            .srcs
            .first()
            .ok_or_else(|| CompileError::structural("store_output without a value"))?;
        let base = instr.indices.base;
        match self.shader.stage {
            Stage::Fragment => {
                let offset = (base + self.const_index(instr.srcs.get(1), "output offset")?) * 4
                    + instr.indices.component as u32;
                for i in 0..instr.num_components as usize {
                    let src = self.get_src(value, i)?;
                    let copy = self.mov(src).operand();
                    set_slot(&mut self.io.outputs, offset as usize + i, copy);
                }
                Ok(())
            }
            Stage::Vertex => {
                for i in 0..instr.num_components as u32 {
                    let src = self.get_src(value, i as usize)?;
                    let index = self.imm(base + i);
                    self.emit_with(Opcode::StVpmV, Dst::Null, &[index, src], |inst| {
                        inst.barrier = BarrierClass::VPM
                    });
                }
                Ok(())
            }
            Stage::Geometry => {
                let dynamic = instr
                    .srcs
                    .get(1)
                    .ok_or_else(|| CompileError::structural("store_output without an offset"))?;
                let dynamic = self.get_src(dynamic, 0)?;
                let base = self.imm(base);
                let offset = self.emit(Opcode::Add, RegClass::Full, &[base, dynamic]).operand();
                let src = self.get_src(value, 0)?;

                // Geometry shaders write vertices from inside control flow.
                let divergent = self.in_divergent_flow();
                if divergent {
                    self.push_exec_z()?;
                }
                self.emit_with(Opcode::StVpmV, Dst::Null, &[offset, src], |inst| {
                    inst.barrier = BarrierClass::VPM;
                    if divergent {
                        inst.cond = crate::vir::Cond::IfA;
                    }
                });
                Ok(())
            }
            Stage::Compute => Err(CompileError::unsupported("intrinsic", "store_output in a compute shader")),
        }
    }

    pub(super) fn emit_store_tlb_sample_color(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        let value = instr
            .srcs
            .first()
            .ok_or_else(|| CompileError::structural("store_tlb_sample_color without a value"))?;
        let rt = self.const_index(instr.srcs.get(1), "render target")? as usize;
        let sample = instr.indices.base as usize;
        if rt >= MAX_DRAW_BUFFERS || sample >= MAX_SAMPLES {
            return Err(CompileError::structural(format!(
                "sample color for render target {rt} sample {sample} is out of range"
            )));
        }
        let offset = (rt * MAX_SAMPLES + sample) * 4;
        for i in 0..instr.num_components as usize {
            let src = self.get_src(value, i)?;
            let copy = self.mov(src).operand();
            set_slot(&mut self.io.sample_colors, offset + i, copy);
        }
        Ok(())
    }

    /// TLB color type and size bits shared by reads and writes.
    fn tlb_color_format(&self, rt: usize, is_int: bool, num_components: u32) -> (u32, bool) {
        let is_32b = is_int || self.key.fs.f32_color_rb & (1 << rt) != 0;
        let bits = if is_32b {
            let ty = if is_int && self.key.ver < 42 {
                TLB_TYPE_I32_COLOR
            } else {
                TLB_TYPE_F32_COLOR
            };
            ty | (num_components - 1)
        } else {
            let size = if num_components >= 3 { TLB_VEC_SIZE_4_F16 } else { 0 };
            TLB_TYPE_F16_COLOR | TLB_F16_SWAP_HI_LO | size
        };
        (bits, is_32b)
    }

    fn color_var(&self, rt: usize) -> Option<&'s IoVariable> {
        let index = (*self.io.output_color_var.get(rt)?)?;
        let shader: &'s crate::ir::Shader = self.shader;
        shader.outputs.get(index)
    }

    fn tlb_read(&mut self, conf: Option<u32>) -> Operand {
        let value = self.new_temp(RegClass::Full);
        let uniform = conf.map(|conf| self.module.uniforms.add(UniformContents::TlbConfig(conf)));
        let op = if uniform.is_some() { Opcode::LdTlbU } else { Opcode::LdTlb };
        self.emit_with(op, Dst::Temp(value), &[], |i| {
            i.uniform = uniform;
            i.barrier = BarrierClass::TLB;
        });
        Operand::Temp(value)
    }

    pub(super) fn emit_load_tlb_color(&mut self, instr: &IntrinsicInstr) -> CompileResult<()> {
        if self.shader.stage != Stage::Fragment {
            return Err(CompileError::unsupported("intrinsic", "load_tlb_color outside a fragment shader"));
        }
        let rt = self.const_index(instr.srcs.first(), "render target")? as usize;
        let sample = instr.indices.base as usize;
        let component = instr.indices.component as usize;
        if rt >= MAX_DRAW_BUFFERS || sample >= MAX_SAMPLES || component >= 4 {
            return Err(CompileError::structural(format!(
                "TLB read of render target {rt} sample {sample} component {component} is out of range"
            )));
        }

        self.prepare_tlb_read();
        let table_len = MAX_DRAW_BUFFERS * MAX_SAMPLES * 4;
        if self.io.color_reads.len() < table_len {
            self.io.color_reads.resize(table_len, None);
        }

        let key = (rt * MAX_SAMPLES + sample) * 4;
        if self.io.color_reads[key + component].is_none() {
            let var = self.color_var(rt).ok_or_else(|| {
                CompileError::structural(format!("TLB read of render target {rt} without a color output"))
            })?;
            let swap_rb = self.key.fs.swap_color_rb & (1 << rt) != 0;
            let mut num_components = self.key.fs.color_components[rt].max(1) as u32;
            if swap_rb {
                num_components = num_components.max(3);
            }
            let (format, is_32b) = self.tlb_color_format(rt, is_int_type(var), num_components);
            let msaa = self.key.fs.msaa;
            let mut conf = 0xffffff00 | format | (7 - rt as u32) << TLB_RENDER_TARGET_SHIFT;
            if !msaa {
                conf |= TLB_SAMPLE_MODE_PER_PIXEL;
            }
            log::debug!("TLB read of render target {rt} with config {conf:#x}");

            let num_samples = if msaa { MAX_SAMPLES } else { 1 };
            for i in 0..num_samples {
                let first_conf = (i == 0).then_some(conf);
                let mut color = [None; 4];
                if is_32b {
                    color[0] = Some(self.tlb_read(first_conf));
                    for c in 1..num_components as usize {
                        color[c] = Some(self.tlb_read(None));
                    }
                } else {
                    let rg = self.tlb_read(first_conf);
                    color[0] = Some(self.emit_unpack(Opcode::Fmov, RegClass::Full, Unpack::L, &[rg]).operand());
                    color[1] = Some(self.emit_unpack(Opcode::Fmov, RegClass::Full, Unpack::H, &[rg]).operand());
                    if num_components > 2 {
                        let ba = self.tlb_read(None);
                        color[2] = Some(self.emit_unpack(Opcode::Fmov, RegClass::Full, Unpack::L, &[ba]).operand());
                        color[3] = Some(self.emit_unpack(Opcode::Fmov, RegClass::Full, Unpack::H, &[ba]).operand());
                    }
                }
                if swap_rb {
                    color.swap(0, 2);
                }
                let base = (rt * MAX_SAMPLES + i) * 4;
                for (c, value) in color.into_iter().enumerate().take(num_components as usize) {
                    self.io.color_reads[base + c] = value;
                }
            }
        }

        let cached = self.io.color_reads[key + component].ok_or_else(|| {
            CompileError::structural(format!("render target {rt} has no component {component}"))
        })?;
        let dest = self.io_dest(instr)?;
        let value = self.mov(cached);
        self.store_dest(dest, 0, value)
    }

    fn output_or_zero(&mut self, index: usize) -> Operand {
        match self.io.outputs.get(index).copied().flatten() {
            Some(value) => value,
            None => self.imm(0),
        }
    }

    fn has_tlb_color_write(&self, rt: usize) -> bool {
        self.key.fs.cbufs & (1 << rt) != 0 && self.io.output_color_var[rt].is_some()
    }

    pub(super) fn emit_frag_end(&mut self) -> CompileResult<()> {
        let has_any_color_write = (0..MAX_DRAW_BUFFERS).any(|rt| self.has_tlb_color_write(rt));
        let full = RegClass::Full;

        if self.key.fs.sample_alpha_to_coverage {
            if let Some(var) = self.color_var(0) {
                let alpha = self.output_or_zero(var.driver_location as usize * 4 + 3);
                let msf = self.emit(Opcode::Msf, full, &[]).operand();
                let coverage = self.emit(Opcode::Ftoc, full, &[alpha]).operand();
                let mask = self.emit(Opcode::And, full, &[msf, coverage]).operand();
                self.emit_with(Opcode::Setmsf, Dst::Null, &[mask], |_| {});
            }
        }

        if let Some(index) = self.io.depth_index {
            let depth = self.output_or_zero(index);
            let mut specifier = TLB_TYPE_DEPTH;
            if self.key.ver >= 42 {
                specifier |= TLB_V42_DEPTH_TYPE_PER_PIXEL | TLB_SAMPLE_MODE_PER_PIXEL;
            } else {
                specifier |= TLB_DEPTH_TYPE_PER_PIXEL;
            }
            let uniform = self.module.uniforms.add(UniformContents::TlbConfig(0xffffff00 | specifier));
            self.emit_with(Opcode::Mov, Dst::Magic(Waddr::TlbU), &[depth], |i| {
                i.uniform = Some(uniform);
                i.barrier = BarrierClass::TLB;
            });
            self.module.writes_z = true;
        } else if self.module.uses_discard
            || self.shader.uses_discard()
            || !self.shader.info.early_fragment_tests
            || self.key.fs.sample_alpha_to_coverage
            || !has_any_color_write
        {
            // Passthrough Z, delayed to the end for discards; it also serves as the
            // mandatory TLB write when no color is written.
            self.module.uses_discard = true;
            let mut specifier = TLB_TYPE_DEPTH;
            if self.key.ver >= 42 {
                specifier |= TLB_SAMPLE_MODE_PER_PIXEL;
            }
            let uniform = self.module.uniforms.add(UniformContents::TlbConfig(0xffffff00 | specifier));
            self.emit_with(Opcode::Mov, Dst::Magic(Waddr::TlbU), &[Operand::Null], |i| {
                i.uniform = Some(uniform);
                i.barrier = BarrierClass::TLB;
            });
            self.module.writes_z = true;
        }

        for rt in 0..MAX_DRAW_BUFFERS {
            self.emit_tlb_color_write(rt);
        }
        Ok(())
    }

    fn emit_tlb_color_write(&mut self, rt: usize) {
        if !self.has_tlb_color_write(rt) {
            return;
        }
        let Some(var) = self.color_var(rt) else {
            return;
        };
        let key = self.key;
        let fs = &key.fs;
        let swap_rb = fs.swap_color_rb & (1 << rt) != 0;
        let per_sample = fs.per_sample_output;
        let alpha_to_one = fs.sample_alpha_to_one;

        let mut num_components = var.num_components.max(1) as u32;
        if swap_rb {
            num_components = num_components.max(3);
        }
        let (format, is_32b) = self.tlb_color_format(rt, is_int_type(var), num_components);
        let mut conf = 0xffffff00 | format | (7 - rt as u32) << TLB_RENDER_TARGET_SHIFT;
        if !per_sample {
            conf |= TLB_SAMPLE_MODE_PER_PIXEL;
        }
        log::debug!("TLB write of render target {rt} with config {conf:#x}");

        let num_samples = if per_sample { MAX_SAMPLES } else { 1 };
        for i in 0..num_samples {
            let mut color = [Operand::Null; 4];
            for (c, slot) in color.iter_mut().enumerate() {
                *slot = if per_sample {
                    let index = (rt * MAX_SAMPLES + i) * 4 + c;
                    match self.io.sample_colors.get(index).copied().flatten() {
                        Some(value) => value,
                        None => self.imm(0),
                    }
                } else {
                    self.output_or_zero(var.driver_location as usize * 4 + c)
                };
            }
            if swap_rb {
                color.swap(0, 2);
            }
            if alpha_to_one {
                color[3] = self.fimm(1.0);
            }
            let [r, g, b, a] = color;

            let uniform = (i == 0).then(|| self.module.uniforms.add(UniformContents::TlbConfig(conf)));
            let first_dst = if uniform.is_some() { Waddr::TlbU } else { Waddr::Tlb };
            if is_32b {
                self.emit_with(Opcode::Mov, Dst::Magic(first_dst), &[r], |inst| {
                    inst.uniform = uniform;
                    inst.barrier = BarrierClass::TLB;
                });
                for &value in [g, b, a].iter().take(num_components as usize - 1) {
                    self.emit_with(Opcode::Mov, Dst::Magic(Waddr::Tlb), &[value], |inst| {
                        inst.barrier = BarrierClass::TLB
                    });
                }
            } else {
                self.emit_with(Opcode::Vfpack, Dst::Magic(first_dst), &[r, g], |inst| {
                    inst.uniform = uniform;
                    inst.barrier = BarrierClass::TLB;
                });
                if num_components >= 3 {
                    self.emit_with(Opcode::Vfpack, Dst::Magic(Waddr::Tlb), &[b, a], |inst| {
                        inst.barrier = BarrierClass::TLB
                    });
                }
            }
        }
    }

    /// VPM writes must complete before the program ends.
    pub(super) fn emit_vpm_end(&mut self) {
        if (40..=42).contains(&self.key.ver) {
            self.emit_with(Opcode::Vpmwt, Dst::Null, &[], |i| i.barrier = BarrierClass::VPM);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_coord_detection() {
        let pntc = IoVariable::new("pc", varying_slot::PNTC, 0, 2);
        let var3 = IoVariable::new("v3", varying_slot::VAR0 + 3, 1, 4);
        let col = IoVariable::new("c", varying_slot::COL0, 2, 4);
        assert!(needs_point_coord(&pntc, 0));
        assert!(!needs_point_coord(&var3, 0));
        assert!(needs_point_coord(&var3, 1 << 3));
        assert!(!needs_point_coord(&col, !0));
    }

    #[test]
    fn test_sorted_inputs() {
        let inputs = vec![
            IoVariable::new("b", varying_slot::VAR0 + 1, 2, 4),
            IoVariable::new("a", varying_slot::VAR0, 0, 4),
            IoVariable::new("c", varying_slot::VAR0 + 2, 1, 4),
        ];
        let names: Vec<_> = sorted_inputs(&inputs).iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c", "b"]);
    }
}
