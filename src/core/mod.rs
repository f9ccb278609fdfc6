// This module serves as the hub for the backend's shared infrastructure: the error taxonomy
// every lowering step propagates, the arena-backed compilation session that owns per-compile
// scratch memory and accumulates statistics across shader variants, and the compile key
// that carries target revision, lane-group budget and fixed-function state. None of these
// know anything about the instruction set; they are the ambient layer the IR, VIR and
// lowering modules build on.

//! Core infrastructure shared by the IR, VIR and lowering modules.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Compilation statistics across shader variants
//!
//! ## Errors (`error`)
//! - `CompileError` and its `ErrorKind` classification
//!
//! ## Configuration (`key`)
//! - `CompileKey` and the fragment fixed-function `FsKey`

pub mod session;
pub mod error;
pub mod key;

pub use session::{
    CompilationSession,
    SessionStats,
    SessionError,
};

pub use error::{
    CompileError,
    CompileResult,
    ErrorKind,
};

pub use key::{
    CompileKey,
    FsKey,
    QPU_CHANNELS,
    MAX_DRAW_BUFFERS,
    MAX_SAMPLES,
};
