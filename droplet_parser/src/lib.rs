//! Lexer, AST, and recursive-descent parser for Droplet source files.
//!
//! The pipeline front half: UTF-8 source text is tokenized by [`lexer::Lexer`],
//! then parsed by [`parser::Parser`] into a [`ast::Program`] ready for the
//! type checker. Every AST node carries the line/column of its first
//! significant token for diagnostics and debug-info emission.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod token;

use droplet_core::DropletResult;

/// Convenience entry point: lex and parse a complete source file.
///
/// Stops at the first diagnostic. Use [`parser::Parser::parse_all`] for
/// batch diagnostics with statement-boundary recovery.
pub fn parse(source: &str) -> DropletResult<ast::Program> {
    let tokens = lexer::Lexer::new(source).tokenize()?;
    parser::Parser::new(tokens).parse()
}
