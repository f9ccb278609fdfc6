// virc compiles a textual shader into VIR and prints the module dump. The compile key is
// assembled from the command line (target revision, lane-group count, TMU limits and the
// fragment fixed-function state), so one shader file can be inspected under every variant
// the driver would request. With --alloc the linear-scan allocator runs afterwards and the
// dump reflects any lane-group fallback it forced.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use bumpalo::Bump;
use clap::Parser;

use virgen::core::{CompilationSession, CompileKey, FsKey};
use virgen::lower::{allocate_with_fallback, compile_shader, LinearScan};
use virgen::text::parse_shader;

/// Compile textual shaders to VIR
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input shader files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Target revision times ten
    #[arg(long, default_value_t = 42)]
    ver: u32,

    /// Resident lane groups: 1, 2 or 4
    #[arg(long, default_value_t = 4)]
    threads: u32,

    /// Components per general TMU request
    #[arg(long, default_value_t = 4)]
    max_tmu_components: u32,

    /// TMU request FIFO depth
    #[arg(long, default_value_t = 16)]
    tmu_fifo_depth: u32,

    /// The TMU lacks increment/decrement atomics
    #[arg(long)]
    no_inc_dec: bool,

    /// Enabled color render targets (bit mask)
    #[arg(long, default_value = "1", value_parser = parse_mask)]
    cbufs: u32,

    /// Render targets with 32-bit float formats (bit mask)
    #[arg(long, default_value = "0", value_parser = parse_mask)]
    f32_rb: u32,

    /// Render targets with integer formats (bit mask)
    #[arg(long, default_value = "0", value_parser = parse_mask)]
    int_rb: u32,

    /// Render targets with swapped red/blue (bit mask)
    #[arg(long, default_value = "0", value_parser = parse_mask)]
    swap_rb: u32,

    /// Generic varyings replaced by the point coordinate (bit mask)
    #[arg(long, default_value = "0", value_parser = parse_mask)]
    point_sprite_mask: u32,

    /// Rasterizing points
    #[arg(long)]
    points: bool,

    /// Rasterizing lines
    #[arg(long)]
    lines: bool,

    /// Flat shading of color inputs
    #[arg(long)]
    flat_shade: bool,

    /// Multisampled framebuffer
    #[arg(long)]
    msaa: bool,

    #[arg(long)]
    alpha_to_coverage: bool,

    #[arg(long)]
    alpha_to_one: bool,

    /// Write colors per sample
    #[arg(long)]
    per_sample: bool,

    /// Run the register allocator after lowering
    #[arg(long)]
    alloc: bool,

    /// Print session statistics
    #[arg(long)]
    stats: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_mask(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| format!("invalid mask '{s}'"))
}

impl Cli {
    fn key(&self) -> CompileKey {
        let fs = FsKey {
            cbufs: self.cbufs as u8,
            f32_color_rb: self.f32_rb as u8,
            int_color_rb: self.int_rb as u8,
            swap_color_rb: self.swap_rb as u8,
            msaa: self.msaa,
            sample_alpha_to_coverage: self.alpha_to_coverage,
            sample_alpha_to_one: self.alpha_to_one,
            shade_model_flat: self.flat_shade,
            is_points: self.points,
            is_lines: self.lines,
            point_sprite_mask: self.point_sprite_mask,
            per_sample_output: self.per_sample,
            ..CompileKey::default().fs
        };

        let mut key = CompileKey::default()
            .with_ver(self.ver)
            .with_threads(self.threads)
            .with_max_tmu_components(self.max_tmu_components)
            .with_atomic_inc_dec(!self.no_inc_dec)
            .with_fs(fs);
        key.tmu_fifo_depth = self.tmu_fifo_depth;
        key
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let key = cli.key();

    let mut failed = false;
    for input in &cli.inputs {
        if let Err(err) = compile_file(&session, &key, input, cli.alloc) {
            eprintln!("error: {}: {err}", input.display());
            failed = true;
        }
    }

    if cli.stats {
        eprint!("{}", session.stats());
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn compile_file(
    session: &CompilationSession<'_>,
    key: &CompileKey,
    path: &Path,
    alloc: bool,
) -> Result<(), String> {
    let source = std::fs::read_to_string(path).map_err(|e| format!("failed to read: {e}"))?;
    let shader = parse_shader(&source).map_err(|e| e.to_string())?;
    let mut module = compile_shader(session, &shader, key).map_err(|e| e.to_string())?;

    if alloc {
        let map = allocate_with_fallback(&mut module, &mut LinearScan::default())
            .map_err(|e| e.to_string())?;
        if module.threads < key.threads {
            session.record_thread_halving();
        }
        println!("; {} registers at {} threads", map.used, module.threads);
    }
    print!("{module}");
    Ok(())
}
