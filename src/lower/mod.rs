// This module is the lowering core: it turns one portable-IR shader variant into a VIR
// module. compile_shader() validates the key, brackets the compile in the session, and
// drives a single owned Compiler through a fixed pipeline: stage entry setup (payload
// registers, compute ids, the shared and spill bases), input and output tables, legacy
// variable slots, the control-flow tree, the final thread switch, the stage epilogue, and
// finally the output collector that seals the module. The Compiler itself is split across
// the submodules by concern (operand emission, ALU ops, general memory, textures and
// images, varyings and epilogues, intrinsics, control flow, thread switches, collection),
// each contributing an impl block, so every lowering step sees the same state through
// &mut self. Allocation fallback lives in alloc and runs after the core has finished.

//! Portable IR to VIR lowering.

pub mod alloc;
mod alu;
mod cf;
mod collect;
mod emit;
mod intrinsics;
mod io;
mod memory;
pub mod sync;
mod tex;
pub mod values;

pub use alloc::{allocate_with_fallback, AllocFailure, LinearScan, RegisterAllocator, RegisterMap};
pub use emit::{small_imm_encodable, Pending};
pub use memory::write_mask_runs;
pub use sync::remove_thrsw;

use crate::core::{CompilationSession, CompileError, CompileKey, CompileResult};
use crate::ir::{Shader, Stage};
use crate::vir::{BlockId, Module, ValueId};
use cf::LoopTargets;
use io::IoState;
use sync::SyncState;
use values::ValueTable;

/// Most texture prefetches the hardware can issue before the shader starts.
pub const MAX_TEX_PREFETCH: usize = 4;

/// Compile one shader variant.
pub fn compile_shader(
    session: &CompilationSession<'_>,
    shader: &Shader,
    key: &CompileKey,
) -> CompileResult<Module> {
    key.validate()?;
    let name = session
        .begin_shader(&shader.info.name)
        .map_err(|e| CompileError::structural(e.to_string()))?;

    log::debug!(
        "compiling {} shader {} (ver {}, {} threads)",
        shader.stage.name(),
        name,
        key.ver,
        key.threads
    );
    let result = Compiler::new(session, shader, key).run();
    session.end_shader();
    let module = result?;

    session.record_shader_compiled(name, module.instruction_count(), module.layout.len());
    log::info!(
        "compiled {} shader {}: {} instructions in {} blocks, {} uniforms, {} threads",
        module.stage.name(),
        name,
        module.instruction_count(),
        module.layout.len(),
        module.uniforms.len(),
        module.threads
    );
    Ok(module)
}

/// Lowering state for one shader variant.
pub struct Compiler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    shader: &'s Shader,
    key: &'s CompileKey,
    module: Module,
    values: ValueTable<'s>,
    cur_block: BlockId,
    /// Execution mask; `None` while control flow is uniform.
    exec: Option<ValueId>,
    cf_depth: u32,
    loops: Vec<LoopTargets>,
    sync: SyncState,
    io: IoState,
}

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub fn new(
        session: &'s CompilationSession<'arena>,
        shader: &'s Shader,
        key: &'s CompileKey,
    ) -> Self {
        let mut module = Module::new(shader.info.name.clone(), shader.stage, key.threads);
        module.min_threads = key.min_threads();
        let entry = module.new_block();
        let mut compiler = Self {
            session,
            shader,
            key,
            module,
            values: ValueTable::new(shader),
            cur_block: entry,
            exec: None,
            cf_depth: 0,
            loops: Vec::new(),
            sync: SyncState::default(),
            io: IoState::default(),
        };
        compiler.set_emit_block(entry);
        compiler
    }

    /// Run the whole pipeline and return the sealed module.
    pub fn run(mut self) -> CompileResult<Module> {
        match self.shader.stage {
            Stage::Fragment => self.setup_fs_payload(),
            Stage::Compute => self.setup_cs_payload(),
            Stage::Vertex | Stage::Geometry => {}
        }
        self.setup_scratch();

        match self.shader.stage {
            Stage::Vertex => self.setup_vs_inputs(),
            Stage::Geometry => self.setup_gs_inputs(),
            Stage::Fragment => self.setup_fs_inputs()?,
            Stage::Compute => {}
        }
        self.setup_outputs();
        self.setup_variables();

        self.emit_body()?;
        self.emit_last_thrsw();

        match self.shader.stage {
            Stage::Fragment => self.emit_frag_end()?,
            Stage::Vertex | Stage::Geometry => self.emit_vpm_end(),
            Stage::Compute => {}
        }
        self.collect()
    }

    fn in_divergent_flow(&self) -> bool {
        self.exec.is_some()
    }
}

/// Parse and lower a textual shader, for the per-module tests.
#[cfg(test)]
pub(crate) fn compile_text(text: &str, key: &CompileKey) -> CompileResult<Module> {
    let shader = crate::text::parse_shader(text).map_err(|e| CompileError::structural(e.to_string()))?;
    let arena = bumpalo::Bump::new();
    let session = CompilationSession::new(&arena);
    compile_shader(&session, &shader, key)
}
