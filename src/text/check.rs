// This module runs file-based lowering tests. A test file is a textual shader whose
// comment lines carry directives: `; RUN: virc [flags]` compiles the shader with a key
// built from the flags (the same ones the virc tool takes), `; RUN: not virc ...` expects
// the compile to fail and checks the error text instead, and the CHECK family matches the
// resulting VIR dump in order. CHECK finds a pattern at or after the current line,
// CHECK-NEXT must match the very next line, CHECK-LABEL resynchronizes on a block header,
// CHECK-NOT forbids a pattern between the surrounding matches, and CHECK-EMPTY expects a
// blank line.

//! FileCheck-style validation of lowering output.

use super::parse_shader;
use crate::core::{CompilationSession, CompileKey};
use crate::lower::{allocate_with_fallback, compile_shader, LinearScan};
use bumpalo::Bump;

/// A CHECK directive extracted from a test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckDirective {
    /// `CHECK: pattern`
    Check(String),
    /// `CHECK-LABEL: pattern`
    CheckLabel(String),
    /// `CHECK-NEXT: pattern`
    CheckNext(String),
    /// `CHECK-NOT: pattern`
    CheckNot(String),
    /// `CHECK-EMPTY`
    CheckEmpty,
    /// `COM: comment`
    Comment(String),
}

/// One RUN line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirective {
    pub command: String,
    pub args: Vec<String>,
    pub expect_failure: bool,
}

/// Directives and shader text of one test file.
#[derive(Debug)]
pub struct TestSpec {
    pub run_directives: Vec<RunDirective>,
    pub check_directives: Vec<CheckDirective>,
    pub shader_text: String,
}

const PREFIXES: [&str; 6] = [
    "CHECK-LABEL:",
    "CHECK-NEXT:",
    "CHECK-NOT:",
    "CHECK-EMPTY",
    "CHECK:",
    "COM:",
];

impl TestSpec {
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut run_directives = Vec::new();
        let mut check_directives = Vec::new();

        for line in content.lines() {
            let Some(comment) = line.trim().strip_prefix(';') else {
                continue;
            };
            let comment = comment.trim();
            if let Some(run) = comment.strip_prefix("RUN:") {
                let run = run.trim();
                let (expect_failure, run) = match run.strip_prefix("not ") {
                    Some(cmd) => (true, cmd.trim()),
                    None => (false, run),
                };
                let mut parts = run.split_whitespace();
                let command = parts
                    .next()
                    .ok_or_else(|| "empty RUN directive".to_string())?
                    .to_string();
                run_directives.push(RunDirective {
                    command,
                    args: parts.filter(|a| *a != "%s").map(str::to_string).collect(),
                    expect_failure,
                });
                continue;
            }
            let Some(prefix) = PREFIXES.iter().find(|p| comment.starts_with(*p)) else {
                continue;
            };
            let pattern = comment[prefix.len()..].trim().to_string();
            check_directives.push(match *prefix {
                "CHECK-LABEL:" => CheckDirective::CheckLabel(pattern),
                "CHECK-NEXT:" => CheckDirective::CheckNext(pattern),
                "CHECK-NOT:" => CheckDirective::CheckNot(pattern),
                "CHECK-EMPTY" => CheckDirective::CheckEmpty,
                "CHECK:" => CheckDirective::Check(pattern),
                _ => CheckDirective::Comment(pattern),
            });
        }

        if run_directives.is_empty() {
            return Err("test has no RUN directive".to_string());
        }
        Ok(TestSpec {
            run_directives,
            check_directives,
            shader_text: content.to_string(),
        })
    }
}

/// Compile key and tool options described by command-line style flags.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub key: CompileKey,
    /// Run the register allocator fallback after lowering.
    pub allocate: bool,
}

impl RunOptions {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut options = RunOptions::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let (flag, inline) = match arg.split_once('=') {
                Some((flag, value)) => (flag, Some(value.to_string())),
                None => (arg.as_str(), None),
            };
            let mut value = || -> Result<u32, String> {
                let text = match &inline {
                    Some(v) => v.clone(),
                    None => iter
                        .next()
                        .cloned()
                        .ok_or_else(|| format!("{flag} needs a value"))?,
                };
                let parsed = match text.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => text.parse(),
                };
                parsed.map_err(|_| format!("{flag}: invalid number '{text}'"))
            };
            let key = &mut options.key;
            match flag {
                "--ver" => key.ver = value()?,
                "--threads" => key.threads = value()?,
                "--max-tmu-components" => key.max_tmu_components = value()?,
                "--tmu-fifo-depth" => key.tmu_fifo_depth = value()?,
                "--no-inc-dec" => key.has_atomic_inc_dec = false,
                "--cbufs" => key.fs.cbufs = value()? as u8,
                "--f32-rb" => key.fs.f32_color_rb = value()? as u8,
                "--int-rb" => key.fs.int_color_rb = value()? as u8,
                "--swap-rb" => key.fs.swap_color_rb = value()? as u8,
                "--points" => key.fs.is_points = true,
                "--lines" => key.fs.is_lines = true,
                "--point-sprite-mask" => key.fs.point_sprite_mask = value()?,
                "--flat-shade" => key.fs.shade_model_flat = true,
                "--msaa" => key.fs.msaa = true,
                "--alpha-to-coverage" => key.fs.sample_alpha_to_coverage = true,
                "--alpha-to-one" => key.fs.sample_alpha_to_one = true,
                "--per-sample" => key.fs.per_sample_output = true,
                "--alloc" => options.allocate = true,
                other => return Err(format!("unknown flag '{other}'")),
            }
        }
        Ok(options)
    }
}

/// Compile `text` with `options`, returning the VIR dump.
pub fn run_compile(text: &str, options: &RunOptions) -> Result<String, String> {
    let shader = parse_shader(text).map_err(|e| e.to_string())?;
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = compile_shader(&session, &shader, &options.key).map_err(|e| e.to_string())?;
    let mut output = String::new();
    if options.allocate {
        let map = allocate_with_fallback(&mut module, &mut LinearScan::default())
            .map_err(|e| e.to_string())?;
        output.push_str(&format!("registers {}\n", map.used));
    }
    output.push_str(&module.to_string());
    Ok(output)
}

/// Runs parsed test files.
pub struct TestRunner {
    verbose: bool,
}

impl TestRunner {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn run_test(&self, spec: &TestSpec) -> Result<(), String> {
        for run in &spec.run_directives {
            if run.command != "virc" {
                return Err(format!("unknown RUN command '{}'", run.command));
            }
            let options = RunOptions::from_args(&run.args)?;
            let output = match (run_compile(&spec.shader_text, &options), run.expect_failure) {
                (Ok(dump), false) => dump,
                (Err(error), true) => format!("error: {error}"),
                (Ok(_), true) => return Err("expected the compile to fail".to_string()),
                (Err(error), false) => return Err(format!("compile failed: {error}")),
            };
            if self.verbose {
                log::debug!("output of virc {}:\n{}", run.args.join(" "), output);
            }
            self.validate_output(&output, &spec.check_directives)?;
        }
        Ok(())
    }

    /// Validate output against CHECK directives, in order.
    pub fn validate_output(&self, output: &str, directives: &[CheckDirective]) -> Result<(), String> {
        let lines: Vec<&str> = output.lines().collect();
        let mut line_idx = 0;
        let mut pending_not: Vec<&str> = Vec::new();

        for directive in directives {
            let pattern = match directive {
                CheckDirective::Comment(_) => continue,
                CheckDirective::CheckNot(pattern) => {
                    pending_not.push(pattern);
                    continue;
                }
                CheckDirective::CheckEmpty => {
                    match lines.get(line_idx) {
                        None => {}
                        Some(line) if line.trim().is_empty() => line_idx += 1,
                        Some(line) => {
                            return Err(format!("CHECK-EMPTY: expected empty line but got '{line}'"))
                        }
                    }
                    continue;
                }
                CheckDirective::CheckNext(pattern) => {
                    let line = lines
                        .get(line_idx)
                        .ok_or_else(|| format!("CHECK-NEXT: no more lines, expected '{pattern}'"))?;
                    if !line.contains(pattern.as_str()) {
                        return Err(format!("CHECK-NEXT: expected '{pattern}' but got '{line}'"));
                    }
                    if self.verbose {
                        log::debug!("CHECK-NEXT: '{pattern}' matches at line {line_idx}");
                    }
                    line_idx += 1;
                    continue;
                }
                CheckDirective::Check(pattern) | CheckDirective::CheckLabel(pattern) => pattern,
            };

            let found = lines
                .iter()
                .skip(line_idx)
                .position(|line| line.contains(pattern.as_str()))
                .ok_or_else(|| format!("CHECK: pattern '{pattern}' not found in output"))?;
            for forbidden in pending_not.drain(..) {
                if let Some(line) = lines[line_idx..line_idx + found]
                    .iter()
                    .find(|line| line.contains(forbidden))
                {
                    return Err(format!("CHECK-NOT: '{forbidden}' found in '{line}'"));
                }
            }
            line_idx += found + 1;
            if self.verbose {
                log::debug!("CHECK: '{pattern}' found at line {}", line_idx - 1);
            }
        }

        for forbidden in pending_not {
            if let Some(line) = lines[line_idx.min(lines.len())..]
                .iter()
                .find(|line| line.contains(forbidden))
            {
                return Err(format!("CHECK-NOT: '{forbidden}' found in '{line}'"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        let content = "\
; RUN: virc %s --threads 2 --points
; RUN: not virc %s --ver 33
; CHECK-LABEL: block0:
; CHECK: ldvary
; CHECK-NEXT: fmul
; CHECK-NOT: thrsw
; COM: plain comment
stage fragment
";
        let spec = TestSpec::parse(content).unwrap();
        assert_eq!(spec.run_directives.len(), 2);
        assert_eq!(spec.run_directives[0].args, vec!["--threads", "2", "--points"]);
        assert!(spec.run_directives[1].expect_failure);
        assert_eq!(spec.check_directives.len(), 5);
        assert_eq!(
            spec.check_directives[0],
            CheckDirective::CheckLabel("block0:".to_string())
        );
        assert!(spec.shader_text.contains("stage fragment"));
    }

    #[test]
    fn test_run_options() {
        let args: Vec<String> = ["--ver", "41", "--threads=2", "--cbufs", "0x3", "--flat-shade"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = RunOptions::from_args(&args).unwrap();
        assert_eq!(options.key.ver, 41);
        assert_eq!(options.key.threads, 2);
        assert_eq!(options.key.fs.cbufs, 3);
        assert!(options.key.fs.shade_model_flat);
        assert!(RunOptions::from_args(&["--bogus".to_string()]).is_err());
    }

    #[test]
    fn test_check_matching() {
        let runner = TestRunner::new(false);
        let output = "block0:\n  ldvary %1\n  fmul %2, %1, %0\nblock1:\n  nop ; thrsw\n";
        let directives = vec![
            CheckDirective::CheckLabel("block0:".to_string()),
            CheckDirective::Check("ldvary".to_string()),
            CheckDirective::CheckNext("fmul".to_string()),
            CheckDirective::CheckNot("thrsw".to_string()),
            CheckDirective::Check("block1:".to_string()),
        ];
        runner.validate_output(output, &directives).unwrap();
    }

    #[test]
    fn test_check_failures() {
        let runner = TestRunner::new(false);
        let output = "Line 1\nLine 2\nLine 3\n";

        let next = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNext("Line 3".to_string()),
        ];
        assert!(runner.validate_output(output, &next).unwrap_err().contains("CHECK-NEXT"));

        let not = vec![
            CheckDirective::Check("Line 1".to_string()),
            CheckDirective::CheckNot("Line 2".to_string()),
            CheckDirective::Check("Line 3".to_string()),
        ];
        assert!(runner.validate_output(output, &not).unwrap_err().contains("CHECK-NOT"));
    }
}
