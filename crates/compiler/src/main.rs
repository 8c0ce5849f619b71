//! MF Compiler CLI
//!
//! Command-line interface for compiling `.mf` programs to Windows/x64
//! executables and for running front-end checks.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use mfc::{CompilerConfig, OptimizationLevel};

#[derive(ClapParser)]
#[command(name = "mfc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MF compiler - compile .mf programs to executables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an .mf file to a PE executable
    Build {
        /// Input .mf source file
        input: PathBuf,

        /// Output executable path (defaults to the input with an .exe extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Optimization level (0 disables the IR optimizer)
        #[arg(short = 'O', long = "opt-level", default_value_t = 1)]
        opt_level: u8,

        /// Write the optimized IR listing next to the output
        #[arg(long)]
        dump_ir: bool,

        /// Override the PE TimeDateStamp (0 keeps builds reproducible)
        #[arg(long)]
        timestamp: Option<u32>,

        /// Path to an mf.toml configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the front end only and report diagnostics
    Check {
        /// Input .mf source file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            output,
            opt_level,
            dump_ir,
            timestamp,
            config,
        } => {
            let output = output.unwrap_or_else(|| input.with_extension("exe"));
            run_build(&input, &output, opt_level, dump_ir, timestamp, config.as_deref());
        }
        Commands::Check { input } => run_check(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "mfc", &mut io::stdout());
        }
    }
}

fn load_config(explicit: Option<&Path>) -> CompilerConfig {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let default = PathBuf::from("mf.toml");
            if !default.exists() {
                return CompilerConfig::default();
            }
            default
        }
    };
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("error reading {}: {}", path.display(), e);
            process::exit(1);
        }
    };
    match CompilerConfig::from_toml(&content) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

fn run_build(
    input: &Path,
    output: &Path,
    opt_level: u8,
    dump_ir: bool,
    timestamp: Option<u32>,
    config_path: Option<&Path>,
) {
    let mut config = load_config(config_path)
        .with_optimization_level(OptimizationLevel::from_number(opt_level));
    if dump_ir {
        config.dump_ir = true;
    }
    if let Some(timestamp) = timestamp {
        config.timestamp = timestamp;
    }

    let started = Instant::now();
    match mfc::compile_file(input, output, &config) {
        Ok(report) => {
            for diag in report.diagnostics.iter() {
                eprintln!(
                    "{}:{}:{}: {} {}: {}",
                    input.display(),
                    diag.line,
                    diag.column,
                    diag.level,
                    diag.code,
                    diag.message
                );
                if let Some(hint) = &diag.hint {
                    eprintln!("  hint: {}", hint);
                }
            }
            println!(
                "Compiled {} -> {} in {:.2}s",
                input.display(),
                output.display(),
                started.elapsed().as_secs_f64()
            );
            if report.diagnostics.warning_count() > 0 {
                println!("{} warning(s)", report.diagnostics.warning_count());
            }
            if config.dump_ir {
                println!("IR saved to {}", output.with_extension("ir").display());
            }
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn run_check(input: &Path) {
    match mfc::check_file(input) {
        Ok(report) => {
            for diag in report.diagnostics.iter() {
                eprintln!(
                    "{}:{}:{}: {} {}: {}",
                    input.display(),
                    diag.line,
                    diag.column,
                    diag.level,
                    diag.code,
                    diag.message
                );
                if let Some(hint) = &diag.hint {
                    eprintln!("  hint: {}", hint);
                }
            }
            if report.diagnostics.has_errors() {
                process::exit(1);
            }
            println!(
                "No errors in {} ({} declarations, {} warnings)",
                input.display(),
                report.stats.declarations,
                report.diagnostics.warning_count()
            );
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}
