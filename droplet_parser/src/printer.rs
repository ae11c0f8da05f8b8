//! AST pretty-printer.
//!
//! Renders a [`Program`] back to parseable Droplet source. Printing is
//! idempotent modulo formatting: re-parsing the printed text and printing
//! again yields the same text, and lexing it yields an equivalent token
//! stream. Used by tooling and the round-trip tests.

use crate::ast::{
    BinaryOp, ClassDecl, CompoundOp, Expr, ExprKind, FieldDecl, FunctionDecl, Literal, Program,
    Stmt, StmtKind, UnaryOp, Visibility,
};
use std::fmt::Write as _;

/// Render a whole program.
#[must_use]
pub fn print_program(program: &Program) -> String {
    let mut out = String::new();

    if let Some(name) = &program.module_name {
        let _ = writeln!(out, "mod {name}");
    }
    for import in &program.imports {
        let _ = write!(out, "import {}", import.module_path);
        if !import.is_wildcard && !import.symbols.is_empty() {
            let _ = write!(out, " {{ {} }}", import.symbols.join(", "));
        }
        out.push('\n');
    }

    for class in &program.classes {
        print_class(&mut out, class);
    }
    for func in &program.functions {
        print_function(&mut out, func, 0);
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn visibility_prefix(vis: Visibility) -> &'static str {
    match vis {
        Visibility::Public => "pub ",
        Visibility::Private => "priv ",
        Visibility::Protected => "prot ",
    }
}

fn print_class(out: &mut String, class: &ClassDecl) {
    if class.is_sealed {
        out.push_str("seal ");
    }
    let _ = write!(out, "class {}", class.name);
    if !class.type_params.is_empty() {
        let _ = write!(out, "[{}]", class.type_params.join(", "));
    }
    if let Some(parent) = &class.parent {
        let _ = write!(out, " : {parent}");
    }
    out.push_str(" {\n");

    for field in &class.fields {
        print_field(out, field);
    }
    if let Some(ctor) = &class.constructor {
        indent(out, 1);
        let _ = write!(out, "new({})", params_text(ctor));
        print_body(out, ctor, 1);
    }
    for method in &class.methods {
        print_method(out, method);
    }
    out.push_str("}\n");
}

fn print_field(out: &mut String, field: &FieldDecl) {
    indent(out, 1);
    out.push_str(visibility_prefix(field.visibility));
    if field.is_static {
        out.push_str("static ");
    }
    let _ = write!(out, "{}: {}", field.name, field.ty);
    if let Some(init) = &field.initializer {
        let _ = write!(out, " = {}", print_expr(init));
    }
    out.push('\n');
}

fn print_method(out: &mut String, method: &FunctionDecl) {
    indent(out, 1);
    out.push_str(visibility_prefix(method.visibility));
    if method.is_static {
        out.push_str("static ");
    }
    if method.is_sealed {
        out.push_str("seal ");
    }
    if method.is_operator {
        let symbol = operator_symbol(&method.name);
        let _ = write!(out, "op {symbol} ({})", params_text(method));
    } else {
        let _ = write!(out, "fn {}({})", method.name, params_text(method));
    }
    print_signature_tail(out, method);
    print_body(out, method, 1);
}

fn print_function(out: &mut String, func: &FunctionDecl, depth: usize) {
    if let Some(ffi) = &func.ffi {
        indent(out, depth);
        let _ = write!(out, "@ffi(\"{}\"", ffi.lib_name);
        if !ffi.signature.is_empty() {
            let _ = write!(out, ", sig=\"{}\"", ffi.signature);
        }
        out.push_str(")\n");
    }
    indent(out, depth);
    let _ = write!(out, "fn {}({})", func.name, params_text(func));
    print_signature_tail(out, func);
    if func.body.is_some() {
        print_body(out, func, depth);
    } else {
        out.push('\n');
    }
}

fn print_signature_tail(out: &mut String, func: &FunctionDecl) {
    if let Some(ret) = &func.return_type {
        let _ = write!(out, " -> {ret}");
    }
    if func.may_return_error {
        out.push('!');
    }
}

fn print_body(out: &mut String, func: &FunctionDecl, depth: usize) {
    match &func.body {
        Some(body) => {
            out.push(' ');
            print_stmt(out, body, depth);
        }
        None => out.push('\n'),
    }
}

fn params_text(func: &FunctionDecl) -> String {
    func.params
        .iter()
        .map(|p| format!("{}: {}", p.name, p.ty))
        .collect::<Vec<_>>()
        .join(", ")
}

fn operator_symbol(name: &str) -> &'static str {
    match name {
        "op$add" => "+",
        "op$sub" => "-",
        "op$mul" => "*",
        "op$div" => "/",
        "op$mod" => "%",
        "op$eq" => "==",
        "op$neq" => "!=",
        "op$lt" => "<",
        "op$lte" => "<=",
        "op$gt" => ">",
        "op$gte" => ">=",
        "op$not" => "!",
        "op$index_get" => "[]",
        _ => "?",
    }
}

fn print_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    match &stmt.kind {
        StmtKind::VarDecl {
            name,
            ty,
            initializer,
        } => {
            indent(out, depth);
            let _ = write!(out, "let {name}");
            if let Some(ty) = ty {
                let _ = write!(out, ": {ty}");
            }
            if let Some(init) = initializer {
                let _ = write!(out, " = {}", print_expr(init));
            }
            out.push('\n');
        }
        StmtKind::Block(stmts) => {
            out.push_str("{\n");
            for s in stmts {
                print_stmt(out, s, depth + 1);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            indent(out, depth);
            let _ = write!(out, "if {} ", print_expr(condition));
            print_block_inline(out, then_branch, depth);
            if let Some(else_branch) = else_branch {
                indent(out, depth);
                out.push_str("else ");
                match &else_branch.kind {
                    StmtKind::If { .. } => {
                        // `else if` chains re-enter statement printing.
                        let mut chained = String::new();
                        print_stmt(&mut chained, else_branch, depth);
                        out.push_str(chained.trim_start());
                    }
                    _ => print_block_inline(out, else_branch, depth),
                }
            }
        }
        StmtKind::While { condition, body } => {
            indent(out, depth);
            let _ = write!(out, "while {} ", print_expr(condition));
            print_block_inline(out, body, depth);
        }
        StmtKind::For {
            variable,
            iterable,
            body,
        } => {
            indent(out, depth);
            let _ = write!(out, "for {variable} in {} ", print_expr(iterable));
            print_block_inline(out, body, depth);
        }
        StmtKind::Loop { body } => {
            indent(out, depth);
            out.push_str("loop ");
            print_block_inline(out, body, depth);
        }
        StmtKind::Return(value) => {
            indent(out, depth);
            match value {
                Some(expr) => {
                    let _ = writeln!(out, "return {}", print_expr(expr));
                }
                None => out.push_str("return\n"),
            }
        }
        StmtKind::Break => {
            indent(out, depth);
            out.push_str("break\n");
        }
        StmtKind::Continue => {
            indent(out, depth);
            out.push_str("continue\n");
        }
        StmtKind::Expr(expr) => {
            indent(out, depth);
            let _ = writeln!(out, "{}", print_expr(expr));
        }
    }
}

fn print_block_inline(out: &mut String, stmt: &Stmt, depth: usize) {
    match &stmt.kind {
        StmtKind::Block(_) => print_stmt(out, stmt, depth),
        _ => {
            // Normalize a bare statement into a block.
            out.push_str("{\n");
            print_stmt(out, stmt, depth + 1);
            indent(out, depth);
            out.push_str("}\n");
        }
    }
}

/// Render one expression. Sub-expressions are parenthesized, which keeps
/// printing faithful without tracking precedence.
#[must_use]
pub fn print_expr(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Literal(lit) => match lit {
            Literal::Int(v) => v.to_string(),
            Literal::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            Literal::Bool(v) => v.to_string(),
            Literal::Str(s) => format!("\"{s}\""),
            Literal::Null => "null".to_string(),
        },
        ExprKind::Identifier(name) => name.clone(),
        ExprKind::Binary { op, left, right } => {
            let symbol = match op {
                BinaryOp::Add => "+",
                BinaryOp::Sub => "-",
                BinaryOp::Mul => "*",
                BinaryOp::Div => "/",
                BinaryOp::Mod => "%",
                BinaryOp::Eq => "==",
                BinaryOp::Neq => "!=",
                BinaryOp::Lt => "<",
                BinaryOp::Lte => "<=",
                BinaryOp::Gt => ">",
                BinaryOp::Gte => ">=",
                BinaryOp::And => "&&",
                BinaryOp::Or => "||",
            };
            format!("({} {symbol} {})", print_expr(left), print_expr(right))
        }
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("(-{})", print_expr(operand)),
            UnaryOp::Not => format!("(!{})", print_expr(operand)),
        },
        ExprKind::Assign { target, value } => {
            format!("{} = {}", print_expr(target), print_expr(value))
        }
        ExprKind::CompoundAssign { op, target, value } => {
            let symbol = match op {
                CompoundOp::Add => "+=",
                CompoundOp::Sub => "-=",
            };
            format!("{} {symbol} {}", print_expr(target), print_expr(value))
        }
        ExprKind::Call { callee, arguments } => {
            let args: Vec<String> = arguments.iter().map(print_expr).collect();
            format!("{}({})", print_expr(callee), args.join(", "))
        }
        ExprKind::FieldAccess { object, field } => {
            format!("{}.{field}", print_expr(object))
        }
        ExprKind::Index { object, index } => {
            format!("{}[{}]", print_expr(object), print_expr(index))
        }
        ExprKind::New {
            class_name,
            type_args,
            arguments,
        } => {
            let args: Vec<String> = arguments.iter().map(print_expr).collect();
            if type_args.is_empty() {
                format!("new {class_name}({})", args.join(", "))
            } else {
                format!(
                    "new {class_name}[{}]({})",
                    type_args.join(", "),
                    args.join(", ")
                )
            }
        }
        ExprKind::List(elements) => {
            let parts: Vec<String> = elements.iter().map(print_expr).collect();
            format!("[{}]", parts.join(", "))
        }
        ExprKind::Dict(pairs) => {
            let parts: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", print_expr(k), print_expr(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        ExprKind::Cast { expr, target_type } => {
            format!("({} as {target_type})", print_expr(expr))
        }
        ExprKind::IsType { expr, target_type } => {
            format!("({} is {target_type})", print_expr(expr))
        }
    }
}
