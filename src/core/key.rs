// This module defines the compile key: the per-variant configuration the pipeline manager
// hands to the backend alongside the shader. It carries the target revision (which decides
// barrier encodings, thread-switch rules and TLB type fields), the requested lane-group
// count, the TMU FIFO depth and per-request component limit used by the memory lowering,
// whether the TMU implements the dedicated increment/decrement atomics, and the
// fixed-function fragment state that changes code generation (render target formats,
// flat shading, point sprites, multisampling). Keys are plain data with Default and
// chained with_* setters; validate() rejects configurations the lowering cannot honour.

//! Compile-time key and target configuration.

use crate::core::error::{CompileError, CompileResult};

/// Number of lanes in a lane group.
pub const QPU_CHANNELS: u32 = 16;

/// Maximum number of color render targets.
pub const MAX_DRAW_BUFFERS: usize = 4;

/// Maximum number of samples per pixel.
pub const MAX_SAMPLES: usize = 4;

/// Fixed-function fragment state that affects code generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsKey {
    /// Bit mask of enabled color render targets.
    pub cbufs: u8,
    /// Render targets using a 32-bit float format.
    pub f32_color_rb: u8,
    /// Render targets using an integer format.
    pub int_color_rb: u8,
    /// Render targets with swapped R/B channels.
    pub swap_color_rb: u8,
    /// Number of components of each render target format.
    pub color_components: [u8; MAX_DRAW_BUFFERS],
    pub msaa: bool,
    pub sample_alpha_to_coverage: bool,
    pub sample_alpha_to_one: bool,
    /// `glShadeModel(GL_FLAT)`: unqualified color inputs become flat.
    pub shade_model_flat: bool,
    pub is_points: bool,
    pub is_lines: bool,
    /// Generic varyings replaced by the point coordinate.
    pub point_sprite_mask: u32,
    /// Colors are written per sample rather than per pixel.
    pub per_sample_output: bool,
}

/// Per-variant compile key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileKey {
    /// Target revision times ten (42 for 4.2).
    pub ver: u32,
    /// Requested number of resident lane groups (1, 2 or 4).
    pub threads: u32,
    /// Depth of the TMU request FIFO shared by all resident lane groups.
    pub tmu_fifo_depth: u32,
    /// Maximum components fetched or written by one general TMU request.
    pub max_tmu_components: u32,
    /// The TMU implements increment/decrement atomic operations.
    pub has_atomic_inc_dec: bool,
    pub fs: FsKey,
}

impl Default for CompileKey {
    fn default() -> Self {
        Self {
            ver: 42,
            threads: 4,
            tmu_fifo_depth: 16,
            max_tmu_components: 4,
            has_atomic_inc_dec: true,
            fs: FsKey {
                cbufs: 0x1,
                color_components: [4; MAX_DRAW_BUFFERS],
                ..FsKey::default()
            },
        }
    }
}

impl CompileKey {
    pub fn with_ver(mut self, ver: u32) -> Self {
        self.ver = ver;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_tmu_components(mut self, components: u32) -> Self {
        self.max_tmu_components = components;
        self
    }

    pub fn with_atomic_inc_dec(mut self, enabled: bool) -> Self {
        self.has_atomic_inc_dec = enabled;
        self
    }

    pub fn with_fs(mut self, fs: FsKey) -> Self {
        self.fs = fs;
        self
    }

    /// Smallest lane-group count the register allocator may fall back to.
    pub fn min_threads(&self) -> u32 {
        if self.ver >= 41 {
            2
        } else {
            1
        }
    }

    /// Check that the key describes something the lowering can honour.
    pub fn validate(&self) -> CompileResult<()> {
        if !matches!(self.threads, 1 | 2 | 4) {
            return Err(CompileError::unsupported(
                "thread count",
                format!("{} (expected 1, 2 or 4)", self.threads),
            ));
        }
        if self.threads < self.min_threads() {
            return Err(CompileError::unsupported(
                "thread count",
                format!("{} is below the minimum of {} for ver {}", self.threads, self.min_threads(), self.ver),
            ));
        }
        if self.tmu_fifo_depth < self.threads {
            return Err(CompileError::unsupported(
                "TMU FIFO depth",
                format!("{} cannot serve {} threads", self.tmu_fifo_depth, self.threads),
            ));
        }
        if !(1..=4).contains(&self.max_tmu_components) {
            return Err(CompileError::unsupported(
                "TMU request size",
                format!("{} components", self.max_tmu_components),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_key_is_valid() {
        let key = CompileKey::default();
        assert!(key.validate().is_ok());
        assert_eq!(key.min_threads(), 2);
        assert_eq!(key.fs.cbufs, 1);
    }

    #[test]
    fn test_min_threads_by_version() {
        assert_eq!(CompileKey::default().with_ver(33).min_threads(), 1);
        assert_eq!(CompileKey::default().with_ver(41).min_threads(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_keys() {
        assert!(CompileKey::default().with_threads(3).validate().is_err());
        assert!(CompileKey::default().with_threads(1).validate().is_err());
        assert!(CompileKey::default()
            .with_ver(33)
            .with_threads(1)
            .validate()
            .is_ok());
        assert!(CompileKey::default().with_max_tmu_components(0).validate().is_err());
        assert!(CompileKey::default().with_max_tmu_components(5).validate().is_err());
    }
}
