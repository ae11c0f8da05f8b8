//! Expression parsing.
//!
//! Precedence climbing, lowest to highest: assignment (right-associative),
//! logical or, logical and, equality, comparison, additive, multiplicative,
//! unary, postfix (call, field access, index, `as`, `is`), primary.

use super::Parser;
use crate::ast::{BinaryOp, CompoundOp, Expr, ExprKind, Literal, UnaryOp};
use crate::token::TokenKind;
use droplet_core::{DropletError, DropletResult};

impl Parser {
    /// Parse one expression.
    pub(crate) fn parse_expression(&mut self) -> DropletResult<Expr> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> DropletResult<Expr> {
        let location = self.peek().location;
        let expr = self.parse_logical_or()?;

        if self.match_token(TokenKind::Assign) {
            let value = self.parse_assignment()?;
            return Ok(self.make_expr(
                ExprKind::Assign {
                    target: Box::new(expr),
                    value: Box::new(value),
                },
                location,
            ));
        }

        if self.match_token(TokenKind::PlusEq) {
            let value = self.parse_assignment()?;
            return Ok(self.make_expr(
                ExprKind::CompoundAssign {
                    op: CompoundOp::Add,
                    target: Box::new(expr),
                    value: Box::new(value),
                },
                location,
            ));
        }

        if self.match_token(TokenKind::MinusEq) {
            let value = self.parse_assignment()?;
            return Ok(self.make_expr(
                ExprKind::CompoundAssign {
                    op: CompoundOp::Sub,
                    target: Box::new(expr),
                    value: Box::new(value),
                },
                location,
            ));
        }

        Ok(expr)
    }

    fn parse_binary_level<F>(
        &mut self,
        mut next: F,
        ops: &[(TokenKind, BinaryOp)],
    ) -> DropletResult<Expr>
    where
        F: FnMut(&mut Self) -> DropletResult<Expr>,
    {
        let location = self.peek().location;
        let mut expr = next(self)?;

        'outer: loop {
            for &(token, op) in ops {
                if self.match_token(token) {
                    let right = next(self)?;
                    expr = self.make_expr(
                        ExprKind::Binary {
                            op,
                            left: Box::new(expr),
                            right: Box::new(right),
                        },
                        location,
                    );
                    continue 'outer;
                }
            }
            break;
        }

        Ok(expr)
    }

    fn parse_logical_or(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(
            Self::parse_logical_and,
            &[(TokenKind::OrOr, BinaryOp::Or)],
        )
    }

    fn parse_logical_and(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(Self::parse_equality, &[(TokenKind::AndAnd, BinaryOp::And)])
    }

    fn parse_equality(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(
            Self::parse_comparison,
            &[(TokenKind::Eq, BinaryOp::Eq), (TokenKind::Neq, BinaryOp::Neq)],
        )
    }

    fn parse_comparison(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(
            Self::parse_term,
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Lte, BinaryOp::Lte),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Gte, BinaryOp::Gte),
            ],
        )
    }

    fn parse_term(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(
            Self::parse_factor,
            &[
                (TokenKind::Plus, BinaryOp::Add),
                (TokenKind::Minus, BinaryOp::Sub),
            ],
        )
    }

    fn parse_factor(&mut self) -> DropletResult<Expr> {
        self.parse_binary_level(
            Self::parse_unary,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
            ],
        )
    }

    fn parse_unary(&mut self) -> DropletResult<Expr> {
        let location = self.peek().location;

        if self.match_token(TokenKind::Not) {
            let operand = self.parse_unary()?;
            return Ok(self.make_expr(
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
                location,
            ));
        }

        if self.match_token(TokenKind::Minus) {
            let operand = self.parse_unary()?;
            return Ok(self.make_expr(
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                },
                location,
            ));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> DropletResult<Expr> {
        let mut expr = self.parse_primary()?;

        loop {
            if self.match_token(TokenKind::LParen) {
                let location = self.previous().location;
                let arguments = self.parse_call_arguments()?;
                expr = self.make_expr(
                    ExprKind::Call {
                        callee: Box::new(expr),
                        arguments,
                    },
                    location,
                );
            } else if self.match_token(TokenKind::Dot) {
                let location = self.previous().location;
                let field = self.consume(TokenKind::Identifier, "expected field name after '.'")?;
                expr = self.make_expr(
                    ExprKind::FieldAccess {
                        object: Box::new(expr),
                        field: field.lexeme,
                    },
                    location,
                );
            } else if self.match_token(TokenKind::LBracket) {
                let location = self.previous().location;
                let index = self.parse_expression()?;
                self.consume(TokenKind::RBracket, "expected ']' after index")?;
                expr = self.make_expr(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    location,
                );
            } else if self.match_token(TokenKind::As) {
                let location = self.previous().location;
                let target_type = self.parse_type()?;
                expr = self.make_expr(
                    ExprKind::Cast {
                        expr: Box::new(expr),
                        target_type,
                    },
                    location,
                );
            } else if self.match_token(TokenKind::Is) {
                let location = self.previous().location;
                let target_type = self.parse_type()?;
                expr = self.make_expr(
                    ExprKind::IsType {
                        expr: Box::new(expr),
                        target_type,
                    },
                    location,
                );
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> DropletResult<Expr> {
        let token = self.peek().clone();

        if self.match_token(TokenKind::Int) {
            let value: i64 = token.lexeme.parse().map_err(|_| {
                DropletError::syntax(
                    format!("integer literal '{}' out of range", token.lexeme),
                    token.location,
                )
            })?;
            return Ok(self.make_expr(ExprKind::Literal(Literal::Int(value)), token.location));
        }

        if self.match_token(TokenKind::Float) {
            let value: f64 = token.lexeme.parse().map_err(|_| {
                DropletError::syntax(
                    format!("invalid float literal '{}'", token.lexeme),
                    token.location,
                )
            })?;
            return Ok(self.make_expr(ExprKind::Literal(Literal::Float(value)), token.location));
        }

        if self.match_token(TokenKind::Bool) {
            let value = token.lexeme == "true";
            return Ok(self.make_expr(ExprKind::Literal(Literal::Bool(value)), token.location));
        }

        if self.match_token(TokenKind::Str) {
            return Ok(self.make_expr(
                ExprKind::Literal(Literal::Str(token.lexeme)),
                token.location,
            ));
        }

        if self.match_token(TokenKind::Null) {
            return Ok(self.make_expr(ExprKind::Literal(Literal::Null), token.location));
        }

        if self.match_token(TokenKind::Identifier) {
            return Ok(self.make_expr(ExprKind::Identifier(token.lexeme), token.location));
        }

        if self.match_token(TokenKind::SelfKw) {
            return Ok(self.make_expr(
                ExprKind::Identifier("self".to_string()),
                token.location,
            ));
        }

        if self.match_token(TokenKind::New) {
            return self.parse_new();
        }

        if self.match_token(TokenKind::LBracket) {
            return self.parse_list_literal();
        }

        if self.match_token(TokenKind::LParen) {
            let expr = self.parse_expression()?;
            self.consume(TokenKind::RParen, "expected ')' after expression")?;
            return Ok(expr);
        }

        Err(self.error_here("expected expression"))
    }

    fn parse_new(&mut self) -> DropletResult<Expr> {
        let location = self.previous().location;
        let class_name = self.consume(TokenKind::Identifier, "expected class name after 'new'")?;
        let type_args = self.parse_type_params()?;

        self.consume(TokenKind::LParen, "expected '(' after class name")?;
        let arguments = self.parse_call_arguments()?;

        Ok(self.make_expr(
            ExprKind::New {
                class_name: class_name.lexeme,
                type_args,
                arguments,
            },
            location,
        ))
    }

    fn parse_list_literal(&mut self) -> DropletResult<Expr> {
        let location = self.previous().location;
        let mut elements = Vec::new();

        if !self.check(TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RBracket, "expected ']' after list elements")?;

        Ok(self.make_expr(ExprKind::List(elements), location))
    }

    /// Parse call arguments; the opening paren has been consumed.
    fn parse_call_arguments(&mut self) -> DropletResult<Vec<Expr>> {
        let mut arguments = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                arguments.push(self.parse_expression()?);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "expected ')' after arguments")?;
        Ok(arguments)
    }
}
