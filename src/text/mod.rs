//! Textual portable IR and CHECK-directive test support.
//!
//! The text form exists so shaders can be written by hand for the `virc`
//! tool and for file-based tests, without a front end.
//!
//! # Format
//!
//! ```text
//! ; Comments start with a semicolon
//! stage fragment
//! info name=tint
//! input v_color loc=32 comps=4 interp=smooth
//! output color loc=2 comps=4
//!
//! %zero:32x1 = load_const 0
//! %c:32x4 = load_input %zero {base=0}
//! %half:32x1 = load_const 0.5
//! %r:32x1 = fmul %c.x %half
//! %out:32x4 = vec4 %r %c.y %c.z %c.w
//! store_output %out %zero {base=0 write_mask=0xf}
//! ```

pub mod check;
pub mod parser;

pub use check::{run_compile, CheckDirective, RunDirective, RunOptions, TestRunner, TestSpec};
pub use parser::{parse_shader, ParseError};
