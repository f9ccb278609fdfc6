// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the caller's arena and accumulates statistics across
// every shader variant compiled through it. The arena backs interned shader names and the
// scratch structures of a single compile (the control-flow worklist), so nothing allocated
// there needs an explicit lifetime beyond the session. The session also guards against
// re-entrant use: one shader is compiled at a time, bracketed by begin_shader/end_shader.
// SessionStats tracks instruction counts per opcode (in a hashbrown map), blocks, thread
// switches, TMU requests, and how many if/loop constructs took the uniform or the divergent
// lowering path, which is what one looks at when tuning the uniformity analysis upstream.

//! Arena-based compilation session management.
//!
//! All per-compile scratch data is allocated in the session arena, and
//! statistics accumulate over every shader compiled with the same session.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for compilation objects.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// String interning for shader names.
    interned_strings: RefCell<HashMap<String, &'arena str>>,

    /// Shader currently being compiled.
    current_shader: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
            current_shader: RefCell::new(None),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    /// Mark the start of a shader compile.
    pub fn begin_shader(&self, name: &str) -> Result<&'arena str, SessionError> {
        let mut current = self.current_shader.borrow_mut();
        if let Some(active) = *current {
            return Err(SessionError::InvalidState(format!(
                "shader {active} is still being compiled"
            )));
        }
        let name = self.intern_str(name);
        *current = Some(name);
        Ok(name)
    }

    /// Mark the end of the current shader compile.
    pub fn end_shader(&self) {
        *self.current_shader.borrow_mut() = None;
    }

    /// Name of the shader currently being compiled.
    pub fn current_shader(&self) -> Option<&'arena str> {
        *self.current_shader.borrow()
    }

    /// Record that a shader variant was compiled.
    pub fn record_shader_compiled(&self, name: &str, instructions: usize, blocks: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.shaders_compiled += 1;
        stats.blocks_emitted += blocks;

        if stats.largest_shader_size < instructions {
            stats.largest_shader_size = instructions;
            stats.largest_shader_name = name.to_string();
        }
    }

    /// Record an emitted machine instruction.
    pub fn record_instruction(&self, opcode: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_emitted += 1;
        *stats.instruction_counts.entry(opcode).or_insert(0) += 1;
    }

    /// Record a thread switch.
    pub fn record_thrsw(&self) {
        self.stats.borrow_mut().thread_switches += 1;
    }

    /// Record a TMU request.
    pub fn record_tmu_request(&self) {
        self.stats.borrow_mut().tmu_requests += 1;
    }

    /// Record an `if` lowering decision.
    pub fn record_if(&self, divergent: bool) {
        let mut stats = self.stats.borrow_mut();
        if divergent {
            stats.divergent_ifs += 1;
        } else {
            stats.uniform_ifs += 1;
        }
    }

    /// Record a `loop` lowering decision.
    pub fn record_loop(&self, divergent: bool) {
        let mut stats = self.stats.borrow_mut();
        if divergent {
            stats.divergent_loops += 1;
        } else {
            stats.uniform_loops += 1;
        }
    }

    /// Record a lane-group count reduction.
    pub fn record_thread_halving(&self) {
        self.stats.borrow_mut().thread_halvings += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of shader variants compiled.
    pub shaders_compiled: usize,

    /// Number of machine instructions emitted.
    pub instructions_emitted: usize,

    /// Count of each opcode emitted.
    pub instruction_counts: HashMap<&'static str, usize>,

    /// Number of blocks in all emitted modules.
    pub blocks_emitted: usize,

    /// Largest shader compiled, in instructions.
    pub largest_shader_size: usize,

    /// Name of the largest shader.
    pub largest_shader_name: String,

    pub thread_switches: usize,
    pub tmu_requests: usize,
    pub uniform_ifs: usize,
    pub divergent_ifs: usize,
    pub uniform_loops: usize,
    pub divergent_loops: usize,

    /// Times the lane-group count was halved, by FIFO pressure or allocation fallback.
    pub thread_halvings: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Shaders compiled: {}", self.shaders_compiled)?;
        writeln!(f, "  Instructions emitted: {}", self.instructions_emitted)?;
        writeln!(f, "  Blocks emitted: {}", self.blocks_emitted)?;
        writeln!(f, "  Thread switches: {}", self.thread_switches)?;
        writeln!(f, "  TMU requests: {}", self.tmu_requests)?;
        writeln!(
            f,
            "  Ifs: {} uniform, {} divergent",
            self.uniform_ifs, self.divergent_ifs
        )?;
        writeln!(
            f,
            "  Loops: {} uniform, {} divergent",
            self.uniform_loops, self.divergent_loops
        )?;
        writeln!(f, "  Thread halvings: {}", self.thread_halvings)?;

        if !self.largest_shader_name.is_empty() {
            writeln!(
                f,
                "  Largest shader: {} ({} instructions)",
                self.largest_shader_name, self.largest_shader_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

/// Error types for compilation session operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Invalid session state.
    InvalidState(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidState(msg) => write!(f, "Invalid session state: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compilation_session_creation() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let stats = session.stats();
        assert_eq!(stats.shaders_compiled, 0);
        assert_eq!(stats.instructions_emitted, 0);
        assert!(session.current_shader().is_none());
    }

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        let s1 = session.intern_str("hello");
        let s2 = session.intern_str("hello");
        let s3 = session.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_begin_shader_rejects_reentry() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        assert_eq!(session.begin_shader("fs0"), Ok("fs0"));
        assert!(matches!(
            session.begin_shader("fs1"),
            Err(SessionError::InvalidState(_))
        ));
        session.end_shader();
        assert!(session.begin_shader("fs1").is_ok());
        assert_eq!(session.current_shader(), Some("fs1"));
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);

        session.record_shader_compiled("fs0", 40, 3);
        session.record_shader_compiled("vs0", 12, 1);
        session.record_instruction("add");
        session.record_instruction("ldtmu");
        session.record_instruction("add");
        session.record_thrsw();
        session.record_tmu_request();
        session.record_if(true);
        session.record_if(false);
        session.record_loop(true);

        let stats = session.stats();
        assert_eq!(stats.shaders_compiled, 2);
        assert_eq!(stats.blocks_emitted, 4);
        assert_eq!(stats.instructions_emitted, 3);
        assert_eq!(stats.instruction_counts.get("add"), Some(&2));
        assert_eq!(stats.largest_shader_name, "fs0");
        assert_eq!(stats.divergent_ifs, 1);
        assert_eq!(stats.uniform_ifs, 1);
        assert_eq!(stats.divergent_loops, 1);
    }

    #[test]
    fn test_stats_display() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        session.record_shader_compiled("fs0", 10, 2);
        session.record_instruction("mov");

        let output = session.stats().to_string();
        assert!(output.contains("Shaders compiled: 1"));
        assert!(output.contains("Largest shader: fs0 (10 instructions)"));
        assert!(output.contains("mov: 1"));
    }
}
