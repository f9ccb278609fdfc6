//! virgen - portable shader IR to VIR lowering.
//!
//! virgen is the instruction-selection and control-flow linearization core
//! of a SIMD shader backend. It takes one variant of a shader in a portable
//! SSA IR together with a compile key, and produces a VIR module: a flat
//! graph of QPU machine instructions over virtual registers, ready for an
//! external register allocator and scheduler.
//!
//! # Primary Usage
//!
//! ```ignore
//! use virgen::core::{CompilationSession, CompileKey};
//! use virgen::lower::compile_shader;
//! use virgen::text::parse_shader;
//! use bumpalo::Bump;
//!
//! let shader = parse_shader(source)?;
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let module = compile_shader(&session, &shader, &CompileKey::default())?;
//! println!("{module}");
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Session, error taxonomy and compile key
//! - [`ir`] - The portable SSA shader IR and its builder
//! - [`vir`] - The machine IR, opcode tables, uniforms and dump format
//! - [`lower`] - The lowering itself plus register allocation fallback
//! - [`text`] - Textual shader parser and CHECK-directive test runner

pub mod core;
pub mod ir;
pub mod lower;
pub mod text;
pub mod vir;

pub use core::{CompilationSession, CompileError, CompileKey, CompileResult, ErrorKind, FsKey};
pub use ir::{Shader, ShaderBuilder, Stage};
pub use lower::compile_shader;
pub use vir::Module;
