//! The Droplet compiler back half: semantic analysis and bytecode emission.
//!
//! Pipeline position: the parser's AST enters [`typechecker::TypeChecker`],
//! which produces per-expression annotations ([`typechecker::TypeInfo`]);
//! [`codegen::CodeGenerator`] then walks the annotated AST and assembles a
//! DLBC artifact through [`bytecode::DbcBuilder`]. Imports are resolved and
//! memoized by [`module_loader::ModuleLoader`].

pub mod bytecode;
pub mod classes;
pub mod codegen;
pub mod debug_info;
pub mod module_loader;
pub mod scope;
pub mod typechecker;
pub mod types;

pub use bytecode::{Constant, DbcBuilder, Op};
pub use codegen::CodeGenerator;
pub use module_loader::{ModuleInfo, ModuleLoader};
pub use typechecker::{TypeChecker, TypeInfo};

use droplet_core::DropletResult;
use droplet_parser::ast::Program;

/// Check and compile a standalone program (no imports) to a DLBC builder.
pub fn compile(program: &Program) -> DropletResult<DbcBuilder> {
    let info = TypeChecker::check(program, None)?;
    codegen::compile_program(program, &info)
}

/// Check and compile source text end to end.
pub fn compile_source(source: &str) -> DropletResult<DbcBuilder> {
    let program = droplet_parser::parse(source)?;
    compile(&program)
}
