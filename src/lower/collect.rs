// The output collector seals a lowered shader into its final Module. Input slots were
// packed in declaration order while the fragment inputs were set up; here every texture
// prefetch placeholder gets its unpacked `location * 4 + component` offset translated into
// that packed slot, and a placeholder naming an input that was never declared is a broken
// shader. It then derives the aggregate flags the driver reads (whether center W is
// consumed) and moves the variable storage layout out of the value table.

//! Final module assembly.

use super::Compiler;
use crate::core::{CompileError, CompileResult};
use crate::vir::{Module, Operand};

impl<'s, 'arena> Compiler<'s, 'arena> {
    pub(super) fn collect(mut self) -> CompileResult<Module> {
        for prefetch in &mut self.module.prefetches {
            let slot = self
                .io
                .input_slot_of
                .get(&prefetch.input_offset)
                .copied()
                .ok_or_else(|| {
                    CompileError::structural(format!(
                        "texture prefetch reads undeclared input {}",
                        prefetch.input_offset
                    ))
                })?;
            prefetch.resolved_slot = Some(slot);
        }

        if let Some(Operand::Temp(w)) = self.io.payload_w {
            let reads_w = self
                .module
                .instructions()
                .any(|(_, _, inst)| inst.srcs.contains(&Operand::Temp(w)));
            self.module.uses_center_w = reads_w;
        }

        let mut module = self.module;
        module.variables = self.values.into_variables();
        log::debug!(
            "collected {}: {} input slots, {} prefetches, {} loops, cf depth {}, center w {}",
            module.name,
            module.inputs.len(),
            module.prefetches.len(),
            module.loops,
            module.max_cf_depth,
            module.uses_center_w
        );
        Ok(module)
    }
}
