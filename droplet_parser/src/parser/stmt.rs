//! Statement parsing.

use super::Parser;
use crate::ast::{Stmt, StmtKind};
use crate::token::TokenKind;
use droplet_core::DropletResult;

impl Parser {
    /// Parse a single statement. Trailing semicolons are consumed as
    /// separators.
    pub(crate) fn parse_statement(&mut self) -> DropletResult<Stmt> {
        let stmt = if self.match_token(TokenKind::Let) {
            self.parse_var_decl()?
        } else if self.match_token(TokenKind::If) {
            self.parse_if()?
        } else if self.match_token(TokenKind::While) {
            self.parse_while()?
        } else if self.match_token(TokenKind::For) {
            self.parse_for()?
        } else if self.match_token(TokenKind::Loop) {
            self.parse_loop()?
        } else if self.match_token(TokenKind::Return) {
            self.parse_return()?
        } else if self.match_token(TokenKind::Break) {
            Stmt {
                kind: StmtKind::Break,
                location: self.previous().location,
            }
        } else if self.match_token(TokenKind::Continue) {
            Stmt {
                kind: StmtKind::Continue,
                location: self.previous().location,
            }
        } else if self.check(TokenKind::LBrace) {
            self.parse_block_stmt()?
        } else {
            let location = self.peek().location;
            let expr = self.parse_expression()?;
            Stmt {
                kind: StmtKind::Expr(expr),
                location,
            }
        };

        self.skip_semicolons();
        Ok(stmt)
    }

    fn parse_var_decl(&mut self) -> DropletResult<Stmt> {
        let let_location = self.previous().location;
        let name = self.consume(TokenKind::Identifier, "expected variable name")?;

        let ty = if self.match_token(TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };

        let initializer = if self.match_token(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::VarDecl {
                name: name.lexeme,
                ty,
                initializer,
            },
            location: let_location,
        })
    }

    fn parse_if(&mut self) -> DropletResult<Stmt> {
        let if_location = self.previous().location;
        let condition = self.parse_expression()?;
        let then_branch = Box::new(self.parse_block_stmt()?);

        let else_branch = if self.match_token(TokenKind::Else) {
            if self.match_token(TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                Some(Box::new(self.parse_block_stmt()?))
            }
        } else {
            None
        };

        Ok(Stmt {
            kind: StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            location: if_location,
        })
    }

    fn parse_while(&mut self) -> DropletResult<Stmt> {
        let location = self.previous().location;
        let condition = self.parse_expression()?;
        let body = Box::new(self.parse_block_stmt()?);
        Ok(Stmt {
            kind: StmtKind::While { condition, body },
            location,
        })
    }

    fn parse_for(&mut self) -> DropletResult<Stmt> {
        let location = self.previous().location;
        let variable = self.consume(TokenKind::Identifier, "expected loop variable")?;
        self.consume(TokenKind::In, "expected 'in' after loop variable")?;
        let iterable = self.parse_expression()?;
        let body = Box::new(self.parse_block_stmt()?);
        Ok(Stmt {
            kind: StmtKind::For {
                variable: variable.lexeme,
                iterable,
                body,
            },
            location,
        })
    }

    fn parse_loop(&mut self) -> DropletResult<Stmt> {
        let location = self.previous().location;
        let body = Box::new(self.parse_block_stmt()?);
        Ok(Stmt {
            kind: StmtKind::Loop { body },
            location,
        })
    }

    fn parse_return(&mut self) -> DropletResult<Stmt> {
        let location = self.previous().location;
        let value = if self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check(TokenKind::Eof)
        {
            None
        } else {
            Some(self.parse_expression()?)
        };
        Ok(Stmt {
            kind: StmtKind::Return(value),
            location,
        })
    }

    /// Parse a braced block as a statement.
    pub(crate) fn parse_block_stmt(&mut self) -> DropletResult<Stmt> {
        let open = self.consume(TokenKind::LBrace, "expected '{'")?;

        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.is_at_end() {
            self.skip_semicolons();
            if self.check(TokenKind::RBrace) {
                break;
            }
            statements.push(self.parse_statement()?);
        }

        self.consume(TokenKind::RBrace, "expected '}'")?;
        Ok(Stmt {
            kind: StmtKind::Block(statements),
            location: open.location,
        })
    }
}
