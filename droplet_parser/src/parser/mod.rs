//! Recursive-descent parser for Droplet.
//!
//! Top-level declaration parsing lives here; statement and expression
//! parsing are split into [`stmt`] and [`expr`] impl blocks. The parser
//! produces one diagnostic per broken construct and re-synchronizes at
//! statement boundaries (`;`) or the start keyword of the next construct, so
//! a single pass can report multiple errors.

mod expr;
mod stmt;

use crate::ast::{
    ClassDecl, Expr, ExprId, ExprKind, FfiInfo, FieldDecl, FunctionDecl, ImportDecl, Parameter,
    Program, Visibility,
};
use crate::token::{Token, TokenKind};
use droplet_core::{DropletError, DropletResult, SourceLocation};

/// The Droplet parser.
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    next_expr_id: u32,
}

impl Parser {
    /// Create a parser over a token stream (must end with EOF).
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            current: 0,
            next_expr_id: 0,
        }
    }

    /// Parse a complete program, stopping at the first diagnostic.
    pub fn parse(self) -> DropletResult<Program> {
        let (program, mut errors) = self.parse_all();
        match errors.is_empty() {
            true => Ok(program),
            false => Err(errors.remove(0)),
        }
    }

    /// Parse a complete program, recovering at statement boundaries and
    /// collecting every diagnostic.
    pub fn parse_all(mut self) -> (Program, Vec<DropletError>) {
        let mut program = Program::default();
        let mut errors = Vec::new();

        // Optional module self-declaration.
        if self.check(TokenKind::Mod) {
            match self.parse_module_decl() {
                Ok(name) => program.module_name = Some(name),
                Err(e) => {
                    errors.push(e);
                    self.synchronize();
                }
            }
        }

        // Imports come before other declarations.
        while self.check(TokenKind::Import) || self.check(TokenKind::Use) {
            match self.parse_import() {
                Ok(import) => program.imports.push(import),
                Err(e) => {
                    errors.push(e);
                    self.synchronize();
                }
            }
        }

        // Top-level declarations.
        while !self.is_at_end() {
            self.skip_semicolons();
            if self.is_at_end() {
                break;
            }

            let result = if self.check(TokenKind::AtFfi) {
                self.parse_ffi_function().map(|f| program.functions.push(f))
            } else if self.check(TokenKind::AtDeprecated) {
                // Deprecation is advisory; consume and parse the declaration.
                self.advance();
                continue;
            } else if self.check(TokenKind::Class) || self.check(TokenKind::Seal) {
                self.parse_class().map(|c| program.classes.push(c))
            } else if self.check(TokenKind::Fn) {
                self.parse_function().map(|f| program.functions.push(f))
            } else {
                Err(self.error_here("expected class, function, or FFI declaration"))
            };

            if let Err(e) = result {
                errors.push(e);
                self.synchronize();
            }
        }

        (program, errors)
    }

    /// Number of expression nodes created; side tables can be sized from it.
    #[must_use]
    pub fn expr_count(&self) -> usize {
        self.next_expr_id as usize
    }

    // =========================================================================
    // Cursor helpers
    // =========================================================================

    pub(crate) fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    pub(crate) fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    pub(crate) fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    pub(crate) fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) -> DropletResult<Token> {
        if self.check(kind) {
            Ok(self.advance().clone())
        } else {
            Err(self.error_here(message))
        }
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    pub(crate) fn error_here(&self, message: &str) -> DropletError {
        let token = self.peek();
        DropletError::syntax(
            format!("{message} (found {})", token.kind),
            token.location,
        )
    }

    /// Allocate a fresh expression node.
    pub(crate) fn make_expr(&mut self, kind: ExprKind, location: SourceLocation) -> Expr {
        let id = ExprId(self.next_expr_id);
        self.next_expr_id += 1;
        Expr { id, kind, location }
    }

    /// Skip to a statement boundary or the start of the next construct.
    pub(crate) fn synchronize(&mut self) {
        self.advance();
        while !self.is_at_end() {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            match self.peek().kind {
                TokenKind::Class
                | TokenKind::Fn
                | TokenKind::Seal
                | TokenKind::AtFfi
                | TokenKind::Import
                | TokenKind::Use
                | TokenKind::Let
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    pub(crate) fn skip_semicolons(&mut self) {
        while self.match_token(TokenKind::Semicolon) {}
    }

    // =========================================================================
    // Declarations
    // =========================================================================

    fn parse_module_decl(&mut self) -> DropletResult<String> {
        self.consume(TokenKind::Mod, "expected 'mod'")?;
        self.parse_qualified_name()
    }

    fn parse_import(&mut self) -> DropletResult<ImportDecl> {
        let keyword = self.advance().clone(); // 'import' or 'use'
        let module_path = self.parse_qualified_name()?;

        let mut symbols = Vec::new();
        let mut is_wildcard = false;

        if self.match_token(TokenKind::LBrace) {
            loop {
                if self.match_token(TokenKind::Star) {
                    is_wildcard = true;
                    break;
                }
                let symbol = self.consume(TokenKind::Identifier, "expected symbol name")?;
                symbols.push(symbol.lexeme);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RBrace, "expected '}' after import symbols")?;
        } else {
            // A bare import pulls in every export.
            is_wildcard = true;
        }

        Ok(ImportDecl {
            module_path,
            symbols,
            is_wildcard,
            location: keyword.location,
        })
    }

    fn parse_class(&mut self) -> DropletResult<ClassDecl> {
        let is_sealed = self.match_token(TokenKind::Seal);
        let class_kw = self.consume(TokenKind::Class, "expected 'class'")?;
        let name = self.consume(TokenKind::Identifier, "expected class name")?;
        let type_params = self.parse_type_params()?;

        let parent = if self.match_token(TokenKind::Colon) {
            Some(
                self.consume(TokenKind::Identifier, "expected parent class name")?
                    .lexeme,
            )
        } else {
            None
        };

        self.consume(TokenKind::LBrace, "expected '{' after class header")?;

        let mut class = ClassDecl {
            name: name.lexeme,
            type_params,
            parent,
            fields: Vec::new(),
            methods: Vec::new(),
            constructor: None,
            is_sealed,
            location: class_kw.location,
        };

        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            self.skip_semicolons();
            if self.check(TokenKind::RBrace) {
                break;
            }

            let visibility = self.parse_visibility();
            let is_static = self.match_token(TokenKind::Static);
            let member_sealed = self.match_token(TokenKind::Seal);

            if self.check(TokenKind::New) {
                class.constructor = Some(self.parse_constructor()?);
            } else if self.check(TokenKind::Op) {
                class.methods.push(self.parse_operator_overload(visibility)?);
            } else if self.check(TokenKind::Fn) {
                let mut method = self.parse_function()?;
                method.is_static = is_static;
                method.is_sealed = member_sealed;
                method.visibility = visibility;
                class.methods.push(method);
            } else {
                class.fields.push(self.parse_field(visibility, is_static)?);
            }
        }

        self.consume(TokenKind::RBrace, "expected '}' after class body")?;
        Ok(class)
    }

    fn parse_function(&mut self) -> DropletResult<FunctionDecl> {
        let fn_kw = self.consume(TokenKind::Fn, "expected 'fn'")?;
        let name = self.consume(TokenKind::Identifier, "expected function name")?;

        self.consume(TokenKind::LParen, "expected '(' after function name")?;
        let params = self.parse_parameters()?;
        self.consume(TokenKind::RParen, "expected ')' after parameters")?;

        let return_type = if self.match_token(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        // `-> T!` marks a fallible return.
        let may_return_error = self.match_token(TokenKind::Not);

        let body = self.parse_block_stmt()?;

        let mut func = FunctionDecl::plain(
            name.lexeme,
            params,
            return_type,
            Some(body),
            fn_kw.location,
        );
        func.may_return_error = may_return_error;
        Ok(func)
    }

    fn parse_ffi_function(&mut self) -> DropletResult<FunctionDecl> {
        let at_ffi = self.consume(TokenKind::AtFfi, "expected '@ffi'")?;
        self.consume(TokenKind::LParen, "expected '(' after @ffi")?;

        let lib = self.consume(TokenKind::Str, "expected library name string")?;

        let mut signature = String::new();
        while self.match_token(TokenKind::Comma) {
            let key = self.consume(TokenKind::Identifier, "expected parameter name")?;
            self.consume(TokenKind::Assign, "expected '=' after parameter name")?;
            let value = self.consume(TokenKind::Str, "expected string value")?;
            if key.lexeme == "sig" {
                signature = value.lexeme;
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after FFI parameters")?;

        self.consume(TokenKind::Fn, "expected 'fn' after FFI annotation")?;
        let name = self.consume(TokenKind::Identifier, "expected function name")?;

        self.consume(TokenKind::LParen, "expected '(' after function name")?;
        let params = self.parse_parameters()?;
        self.consume(TokenKind::RParen, "expected ')' after parameters")?;

        let return_type = if self.match_token(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        // Foreign functions are declarations only; no body.
        let mut func =
            FunctionDecl::plain(name.lexeme, params, return_type, None, at_ffi.location);
        func.ffi = Some(FfiInfo {
            lib_name: lib.lexeme,
            signature,
        });
        Ok(func)
    }

    fn parse_constructor(&mut self) -> DropletResult<FunctionDecl> {
        let new_kw = self.consume(TokenKind::New, "expected 'new'")?;
        self.consume(TokenKind::LParen, "expected '(' after 'new'")?;
        let params = self.parse_parameters()?;
        self.consume(TokenKind::RParen, "expected ')' after parameters")?;
        let body = self.parse_block_stmt()?;

        Ok(FunctionDecl::plain(
            "new",
            params,
            None,
            Some(body),
            new_kw.location,
        ))
    }

    fn parse_operator_overload(&mut self, visibility: Visibility) -> DropletResult<FunctionDecl> {
        let op_kw = self.consume(TokenKind::Op, "expected 'op'")?;
        let op_token = self.advance().clone();

        let suffix = match op_token.kind {
            TokenKind::Plus => "add",
            TokenKind::Minus => "sub",
            TokenKind::Star => "mul",
            TokenKind::Slash => "div",
            TokenKind::Percent => "mod",
            TokenKind::Eq => "eq",
            TokenKind::Neq => "neq",
            TokenKind::Lt => "lt",
            TokenKind::Lte => "lte",
            TokenKind::Gt => "gt",
            TokenKind::Gte => "gte",
            TokenKind::Not => "not",
            TokenKind::LBracket => {
                self.consume(TokenKind::RBracket, "expected ']' after '['")?;
                "index_get"
            }
            _ => {
                return Err(DropletError::syntax(
                    format!("operator {} cannot be overloaded", op_token.kind),
                    op_token.location,
                ));
            }
        };
        let name = format!("op${suffix}");

        self.consume(TokenKind::LParen, "expected '(' after operator")?;
        let params = self.parse_parameters()?;
        self.consume(TokenKind::RParen, "expected ')' after parameters")?;

        let return_type = if self.match_token(TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block_stmt()?;

        let mut func =
            FunctionDecl::plain(name, params, return_type, Some(body), op_kw.location);
        func.is_operator = true;
        func.visibility = visibility;
        Ok(func)
    }

    fn parse_field(&mut self, visibility: Visibility, is_static: bool) -> DropletResult<FieldDecl> {
        let name = self.consume(TokenKind::Identifier, "expected field name")?;
        self.consume(TokenKind::Colon, "expected ':' after field name")?;
        let ty = self.parse_type()?;

        let initializer = if self.match_token(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(FieldDecl {
            name: name.lexeme,
            ty,
            initializer,
            is_static,
            visibility,
            location: name.location,
        })
    }

    // =========================================================================
    // Shared pieces
    // =========================================================================

    fn parse_visibility(&mut self) -> Visibility {
        if self.match_token(TokenKind::Pub) {
            Visibility::Public
        } else if self.match_token(TokenKind::Priv) {
            Visibility::Private
        } else if self.match_token(TokenKind::Prot) {
            Visibility::Protected
        } else {
            Visibility::Public
        }
    }

    /// Parse a written type like `int`, `list[int]`, or `dict[str,int]` into
    /// its textual form; the type checker resolves the string.
    pub(crate) fn parse_type(&mut self) -> DropletResult<String> {
        let base = self.consume(TokenKind::Identifier, "expected type name")?;
        let mut ty = base.lexeme;

        if self.match_token(TokenKind::LBracket) {
            ty.push('[');
            ty.push_str(&self.parse_type()?);
            while self.match_token(TokenKind::Comma) {
                ty.push(',');
                ty.push_str(&self.parse_type()?);
            }
            self.consume(TokenKind::RBracket, "expected ']' after type parameters")?;
            ty.push(']');
        }

        Ok(ty)
    }

    pub(crate) fn parse_type_params(&mut self) -> DropletResult<Vec<String>> {
        let mut params = Vec::new();
        if self.match_token(TokenKind::LBracket) {
            loop {
                let p = self.consume(TokenKind::Identifier, "expected type parameter")?;
                params.push(p.lexeme);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
            self.consume(TokenKind::RBracket, "expected ']' after type parameters")?;
        }
        Ok(params)
    }

    fn parse_parameters(&mut self) -> DropletResult<Vec<Parameter>> {
        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let name = self.consume(TokenKind::Identifier, "expected parameter name")?;
                self.consume(TokenKind::Colon, "expected ':' after parameter name")?;
                let ty = self.parse_type()?;
                params.push(Parameter {
                    name: name.lexeme,
                    ty,
                });
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        Ok(params)
    }

    fn parse_qualified_name(&mut self) -> DropletResult<String> {
        let first = self.consume(TokenKind::Identifier, "expected identifier")?;
        let mut name = first.lexeme;
        while self.match_token(TokenKind::Dot) {
            let next = self.consume(TokenKind::Identifier, "expected identifier after '.'")?;
            name.push('.');
            name.push_str(&next.lexeme);
        }
        Ok(name)
    }
}
