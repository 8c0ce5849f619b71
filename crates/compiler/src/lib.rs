//! MF Compiler Library
//!
//! Ahead-of-time compilation from `.mf` source to a Windows/x64 PE32+
//! executable, with no external toolchain on the path: the back end emits
//! machine bytes directly and writes the container itself.
//!
//! The pipeline is strictly staged; each stage consumes the previous
//! stage's immutable output:
//!
//! ```text
//! source → tokens → AST → (checked AST) → IR → (optimized IR) → x64 + data → PE
//! ```
//!
//! The front end (lexer, parser, analyzer) recovers from errors and keeps
//! going so one run can report several problems; everything from IR
//! generation on fails fast. Any error diagnostic aborts before machine
//! code is produced.
//!
//! ```rust,ignore
//! use mfc::{CompilerConfig, compile_file};
//!
//! let config = CompilerConfig::default();
//! let report = compile_file(Path::new("app.mf"), Path::new("app.exe"), &config)?;
//! println!("{} warnings", report.diagnostics.warning_count());
//! ```

pub mod analyzer;
pub mod ast;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod ir;
pub mod lexer;
pub mod optimizer;
pub mod parser;

pub use analyzer::{Analysis, Analyzer};
pub use ast::Program;
pub use codegen::CodeGenError;
pub use config::{CompilerConfig, OptimizationLevel};
pub use diagnostics::{Code, Diagnostic, Diagnostics, Level};
pub use ir::{IrGenerator, IrModule};
pub use lexer::Lexer;
pub use parser::Parser;

use std::fs;
use std::path::Path;

/// Counters gathered across one compilation.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompileStats {
    pub tokens: usize,
    pub declarations: usize,
    pub ir_instructions: usize,
    pub optimizer_rounds: usize,
    pub spilled_temps: usize,
    pub text_bytes: usize,
    pub data_bytes: usize,
}

/// The result of a successful run: statistics, every diagnostic emitted
/// (warnings included) and, when requested, the optimized IR listing.
#[derive(Debug)]
pub struct CompileReport {
    pub stats: CompileStats,
    pub diagnostics: Diagnostics,
    pub ir_dump: Option<String>,
}

/// Compile a source file to an executable.
///
/// On failure the rendered diagnostics (or the I/O error) come back as the
/// error string; a partial output file is never left behind.
pub fn compile_file(
    source_path: &Path,
    output_path: &Path,
    config: &CompilerConfig,
) -> Result<CompileReport, String> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| format!("failed to read `{}`: {}", source_path.display(), e))?;

    let (bytes, report) = compile_to_image(&source, source_path, config)?;

    if let Some(dump) = &report.ir_dump {
        let ir_path = output_path.with_extension("ir");
        fs::write(&ir_path, dump)
            .map_err(|e| format!("failed to write `{}`: {}", ir_path.display(), e))?;
    }

    tracing::info!("writing {} ({} bytes)", output_path.display(), bytes.len());
    fs::write(output_path, &bytes).map_err(|e| {
        let _ = fs::remove_file(output_path);
        format!("failed to write `{}`: {}", output_path.display(), e)
    })?;

    Ok(report)
}

/// Compile source text to PE image bytes.
///
/// This is the whole pipeline short of touching the filesystem, which
/// keeps it directly testable.
pub fn compile_to_image(
    source: &str,
    file_name: &Path,
    config: &CompilerConfig,
) -> Result<(Vec<u8>, CompileReport), String> {
    let mut diags = Diagnostics::new(file_name);
    let mut stats = CompileStats::default();

    tracing::info!("stage: lexical analysis");
    let tokens = Lexer::new(source).tokenize(&mut diags);
    stats.tokens = tokens.len();
    tracing::debug!("{} tokens", stats.tokens);

    tracing::info!("stage: parsing");
    let program = Parser::new(tokens).parse(&mut diags);
    stats.declarations = program.decls.len();
    tracing::debug!("{} top-level declarations", stats.declarations);

    tracing::info!("stage: semantic analysis");
    let _analysis = Analyzer::new(&mut diags).analyze(&program);

    if program.find_function("main").is_none() {
        diags.error_with_hint(
            Code::UndefinedFunction,
            "no entry point: function `main` is not defined",
            0,
            0,
            "define `fn main() -> i32 { ... }`",
        );
    }

    if diags.has_errors() {
        return Err(fail(&diags));
    }

    tracing::info!("stage: IR generation");
    let mut module = match IrGenerator::new().generate(&program) {
        Ok(module) => module,
        Err(e) => {
            diags.error(Code::CompilationError, e.message, e.loc.line, e.loc.column);
            return Err(fail(&diags));
        }
    };
    stats.ir_instructions = module.instruction_count();
    tracing::debug!("{} IR instructions", stats.ir_instructions);

    if config.optimization_level.runs_optimizer() {
        tracing::info!("stage: optimization");
        stats.optimizer_rounds = optimizer::optimize_module(&mut module);
        tracing::debug!(
            "{} instructions after {} rounds",
            module.instruction_count(),
            stats.optimizer_rounds
        );
    }

    let ir_dump = config.dump_ir.then(|| module.dump());

    tracing::info!("stage: native code generation");
    let (image, backend) =
        match codegen::build_image(&module, config.image_base, config.timestamp) {
            Ok(result) => result,
            Err(e) => {
                let code = match &e {
                    CodeGenError::UndefinedSymbol(_) => Code::UndefinedSymbol,
                    CodeGenError::UndefinedLabel(_) => Code::UndefinedLabel,
                    CodeGenError::Layout(_) => Code::LayoutOverflow,
                    _ => Code::UnsupportedShape,
                };
                diags.error(code, e.to_string(), 0, 0);
                return Err(fail(&diags));
            }
        };
    stats.spilled_temps = backend.spilled_temps;
    stats.text_bytes = backend.text_size;
    stats.data_bytes = backend.data_size;

    let bytes = match image.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            diags.error(Code::LayoutOverflow, e, 0, 0);
            return Err(fail(&diags));
        }
    };

    tracing::info!(
        "compiled: {} tokens, {} decls, {} IR instructions, text {}B, data {}B",
        stats.tokens,
        stats.declarations,
        stats.ir_instructions,
        stats.text_bytes,
        stats.data_bytes
    );

    Ok((
        bytes,
        CompileReport {
            stats,
            diagnostics: diags,
            ir_dump,
        },
    ))
}

/// Run the front end only (lex, parse, analyze) and report.
pub fn check_file(source_path: &Path) -> Result<CompileReport, String> {
    let source = fs::read_to_string(source_path)
        .map_err(|e| format!("failed to read `{}`: {}", source_path.display(), e))?;
    Ok(check_source(&source, source_path))
}

pub fn check_source(source: &str, file_name: &Path) -> CompileReport {
    let mut diags = Diagnostics::new(file_name);
    let mut stats = CompileStats::default();

    let tokens = Lexer::new(source).tokenize(&mut diags);
    stats.tokens = tokens.len();
    let program = Parser::new(tokens).parse(&mut diags);
    stats.declarations = program.decls.len();
    let _ = Analyzer::new(&mut diags).analyze(&program);

    CompileReport {
        stats,
        diagnostics: diags,
        ir_dump: None,
    }
}

fn fail(diags: &Diagnostics) -> String {
    format!(
        "{}error: compilation failed with {} error(s)",
        diags.render(),
        diags.error_count()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn compile(source: &str) -> Result<(Vec<u8>, CompileReport), String> {
        compile_to_image(source, &PathBuf::from("test.mf"), &CompilerConfig::default())
    }

    fn read_u16(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(b[at..at + 2].try_into().unwrap())
    }

    fn read_u32(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(b[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn test_minimal_program_produces_valid_pe() {
        let (bytes, report) = compile("fn main() -> i32 { return 0; }").unwrap();

        // MZ magic, PE signature behind e_lfanew.
        assert_eq!(&bytes[0..2], &[0x4D, 0x5A]);
        let e_lfanew = read_u32(&bytes, 0x3C) as usize;
        assert_eq!(&bytes[e_lfanew..e_lfanew + 4], &[0x50, 0x45, 0x00, 0x00]);

        // Entry point RVA is 0x1000.
        let opt = e_lfanew + 4 + 20;
        assert_eq!(read_u32(&bytes, opt + 16), 0x1000);

        // .text begins with the standard prologue.
        let section_table = opt + 240;
        let text_raw = read_u32(&bytes, section_table + 20) as usize;
        assert_eq!(&bytes[text_raw..text_raw + 4], &[0x55, 0x48, 0x89, 0xE5]);

        assert!(!report.diagnostics.has_errors());
    }

    #[test]
    fn test_empty_source_fails_with_no_entry_point() {
        let err = compile("").unwrap_err();
        assert!(err.contains("no entry point"), "{}", err);
        assert!(err.contains("E009"));
    }

    #[test]
    fn test_syntax_error_fails_compilation() {
        let err = compile("fn main( { return 0; }").unwrap_err();
        assert!(err.contains("error"), "{}", err);
    }

    #[test]
    fn test_warnings_do_not_fail() {
        let (_, report) = compile("fn main() -> i32 { let unused: i32 = 1; return 0; }").unwrap();
        assert_eq!(report.diagnostics.warning_count(), 1);
        assert!(!report.diagnostics.has_errors());
    }

    #[test]
    fn test_string_literal_populates_import_directory() {
        let source = r#"
            import "c" "stdio.h";
            fn main() -> i32 { printf("hello"); return 0; }
        "#;
        let (bytes, _) = compile(source).unwrap();
        let e_lfanew = read_u32(&bytes, 0x3C) as usize;
        let opt = e_lfanew + 4 + 20;

        // Data directory #1 covers two DLL entries plus the terminator.
        let dir1 = opt + 112 + 8;
        assert!(read_u32(&bytes, dir1) > 0);
        assert_eq!(read_u32(&bytes, dir1 + 4), 3 * 20);

        // Three sections, the last being .idata.
        let file_header = e_lfanew + 4;
        assert_eq!(read_u16(&bytes, file_header + 2), 3);
        let idata_header = opt + 240 + 2 * 40;
        assert_eq!(&bytes[idata_header..idata_header + 6], b".idata");

        // The payload carries the literal with its NUL.
        assert!(bytes.windows(6).any(|w| w == b"hello\0"));
    }

    #[test]
    fn test_byte_reproducible_builds() {
        let source = r#"
            import "c" "stdio.h";
            fn greet(n: i32) -> i32 {
                if (n > 0) { printf("hi"); }
                return n * 2;
            }
            fn main() -> i32 { return greet(21); }
        "#;
        let (a, _) = compile(source).unwrap();
        let (b, _) = compile(source).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_o0_skips_the_optimizer() {
        let config = CompilerConfig::new().with_optimization_level(OptimizationLevel::O0);
        let (_, report) =
            compile_to_image("fn main() -> i32 { return 2 + 3; }", &PathBuf::from("t.mf"), &config)
                .unwrap();
        assert_eq!(report.stats.optimizer_rounds, 0);
    }

    #[test]
    fn test_dump_ir_reports_folded_constant() {
        let config = CompilerConfig::new().with_dump_ir(true);
        let (_, report) = compile_to_image(
            "fn main() -> i32 { return 2 + 3 * 4; }",
            &PathBuf::from("t.mf"),
            &config,
        )
        .unwrap();
        let dump = report.ir_dump.unwrap();
        assert!(dump.contains("load_const 14"), "{}", dump);
    }

    #[test]
    fn test_compile_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.mf");
        let out = dir.path().join("app.exe");
        fs::write(&src, "fn main() -> i32 { return 0; }").unwrap();

        let report = compile_file(&src, &out, &CompilerConfig::default()).unwrap();
        assert!(out.exists());
        assert!(report.stats.text_bytes > 0);

        let bytes = fs::read(&out).unwrap();
        assert_eq!(&bytes[0..2], b"MZ");
    }

    #[test]
    fn test_check_reports_without_building() {
        let report = check_source(
            "fn main() -> i32 { return ghost; }",
            &PathBuf::from("t.mf"),
        );
        assert!(report.diagnostics.has_errors());
    }

    #[test]
    fn test_semantic_errors_abort_before_ir() {
        let err = compile("fn main() -> i32 { return ghost; }").unwrap_err();
        assert!(err.contains("E008"), "{}", err);
    }

    #[test]
    fn test_virtual_dispatch_end_to_end() {
        let source = "
            class B {
                fn greet() -> i32 { return 1; }
            }
            class D extends B {
                fn greet() -> i32 { return 2; }
            }
            fn main() -> i32 {
                let d: D = new D();
                return d.greet();
            }
        ";
        let (bytes, report) = compile(source).unwrap();
        assert!(!report.diagnostics.has_errors());
        // Vtable slots land in .data as absolute addresses inside .text
        // under the default image base.
        let text_lo = codegen::pe::DEFAULT_IMAGE_BASE + 0x1000;
        let text_hi = text_lo + 0x1000;
        let patched = bytes
            .windows(8)
            .map(|w| u64::from_le_bytes(w.try_into().unwrap()))
            .filter(|&v| v >= text_lo && v < text_hi)
            .count();
        assert!(patched >= 2, "expected patched vtable slots, got {}", patched);
    }
}
