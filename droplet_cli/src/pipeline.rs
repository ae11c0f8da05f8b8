//! Compilation pipeline: source → tokens → AST → checked AST → DLBC → VM.
//!
//! Each CLI mode flows through here. Parse errors are reported in batch
//! (the parser recovers at statement boundaries); everything downstream
//! stops at the first diagnostic.

use droplet_compiler::codegen::CodeGenerator;
use droplet_compiler::{DbcBuilder, ModuleLoader, TypeChecker, TypeInfo};
use droplet_core::DropletResult;
use droplet_parser::ast::Program;
use droplet_parser::lexer::Lexer;
use droplet_parser::parser::Parser;
use droplet_vm::{loader, Vm};
use std::path::Path;
use std::process::ExitCode;

const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;
const EXIT_IO_ERROR: u8 = 74;

/// Compile and run a `.drop` source file.
pub fn run_file(path: &Path) -> ExitCode {
    let builder = match compile_file(path) {
        Ok((builder, _)) => builder,
        Err(code) => return code,
    };
    run_builder(builder)
}

/// Compile a `.drop` source file to a `.dbc` artifact.
pub fn build_file(path: &Path, output: Option<&Path>) -> ExitCode {
    let (mut builder, _) = match compile_file(path) {
        Ok(result) => result,
        Err(code) => return code,
    };

    let out_path = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| path.with_extension("dbc"));
    match builder.write_to_file(&out_path) {
        Ok(()) => {
            println!("wrote {}", out_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("droplet: {e}");
            ExitCode::from(EXIT_IO_ERROR)
        }
    }
}

/// Execute an already-compiled `.dbc` artifact.
pub fn exec_file(path: &Path) -> ExitCode {
    let mut vm = Vm::new();
    if let Err(e) = loader::load_file(&mut vm, path) {
        eprintln!("droplet: {e}");
        return ExitCode::from(EXIT_IO_ERROR);
    }
    match vm.run_program() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("droplet: {e}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// Print a bytecode listing for a source file.
pub fn disasm_file(path: &Path) -> ExitCode {
    let (mut builder, _) = match compile_file(path) {
        Ok(result) => result,
        Err(code) => return code,
    };
    // Serialize so function name constants are interned before display.
    let _ = builder.to_bytes();
    for function in &builder.functions {
        println!(
            "fn {} (args {}, locals {}):",
            function.name, function.arg_count, function.local_count
        );
        print!(
            "{}",
            droplet_compiler::bytecode::disasm::disassemble(&function.code, builder.constants())
        );
        println!();
    }
    ExitCode::SUCCESS
}

// =============================================================================
// Shared compilation
// =============================================================================

fn compile_file(path: &Path) -> Result<(DbcBuilder, TypeInfo), ExitCode> {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("droplet: cannot open '{}': {e}", path.display());
            return Err(ExitCode::from(EXIT_IO_ERROR));
        }
    };

    let program = parse_with_diagnostics(&source, path)?;

    // Imports resolve relative to the source file's directory first.
    let mut module_loader = ModuleLoader::new();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        module_loader.add_search_path(dir);
    }

    let info = match TypeChecker::check(&program, Some(&mut module_loader)) {
        Ok(info) => info,
        Err(e) => {
            eprintln!("droplet: {e}");
            return Err(ExitCode::from(EXIT_COMPILE_ERROR));
        }
    };

    let mut generator = CodeGenerator::new(&info);
    generator.set_source_file(&path.display().to_string());
    let result = generator.generate_with_modules(&program, &module_loader);
    match result {
        Ok((builder, _debug)) => Ok((builder, info)),
        Err(e) => {
            eprintln!("droplet: {e}");
            Err(ExitCode::from(EXIT_COMPILE_ERROR))
        }
    }
}

fn parse_with_diagnostics(source: &str, path: &Path) -> Result<Program, ExitCode> {
    let tokens = match Lexer::new(source).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            eprintln!("{}: {e}", path.display());
            return Err(ExitCode::from(EXIT_COMPILE_ERROR));
        }
    };

    let (program, errors) = Parser::new(tokens).parse_all();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{}: {e}", path.display());
        }
        return Err(ExitCode::from(EXIT_COMPILE_ERROR));
    }
    Ok(program)
}

fn run_builder(mut builder: DbcBuilder) -> ExitCode {
    let bytes = builder.to_bytes();
    let mut vm = Vm::new();
    if let Err(e) = loader::load_bytes(&mut vm, &bytes) {
        eprintln!("droplet: {e}");
        return ExitCode::from(EXIT_RUNTIME_ERROR);
    }
    match vm.run_program() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("droplet: {e}");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// Compile source text and run it in a fresh VM, returning captured output.
/// Used by tests and embedders that drive the pipeline in-process.
pub fn run_source_captured(source: &str) -> DropletResult<String> {
    let mut builder = droplet_compiler::compile_source(source)?;
    let bytes = builder.to_bytes();
    let mut vm = Vm::new();
    vm.capture_output();
    loader::load_bytes(&mut vm, &bytes)?;
    vm.run_program()?;
    Ok(vm.take_output())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_source_captured_end_to_end() {
        let out = run_source_captured("fn main() { println(1 + 2 * 3) }").expect("run");
        assert_eq!(out, "7\n");
    }

    #[test]
    fn test_compile_error_surfaces() {
        assert!(run_source_captured("fn main() { let x = missing }").is_err());
    }
}
