//! Bytecode emission.
//!
//! The generator walks the type-annotated AST and emits one bytecode
//! function per top-level function, method, constructor, and static-field
//! initializer, writing through the [`DbcBuilder`]. Every function is
//! registered in the table (obtaining its 32-bit index) before any body is
//! emitted, so call sites may reference functions declared later in the
//! program or in another module.
//!
//! Expression emission leaves exactly one value on the operand stack.
//! Branches emit a 4-byte little-endian placeholder that is patched once the
//! target is known; a function is only finished when its loop stack is empty.

use crate::bytecode::{DbcBuilder, FunctionBuilder, Op};
use crate::debug_info::{DebugLocation, DebugTables, FunctionDebugInfo};
use crate::module_loader::ModuleLoader;
use crate::typechecker::TypeInfo;
use crate::types::TypeKind;
use droplet_core::{DropletError, DropletResult, SourceLocation};
use droplet_parser::ast::{
    BinaryOp, ClassDecl, CompoundOp, Expr, ExprKind, FunctionDecl, Literal, Program, Stmt,
    StmtKind, UnaryOp,
};
use rustc_hash::FxHashMap;

/// Intrinsics emitted as `CALL_NATIVE`.
const NATIVE_FNS: &[&str] = &[
    "print", "println", "input", "str", "int", "float", "len", "exit",
];

/// Mangle a member name: `ClassName$$member`.
#[must_use]
pub fn mangle(class_name: &str, member: &str) -> String {
    format!("{class_name}$${member}")
}

/// A compile-time local binding.
#[derive(Clone, Debug)]
struct LocalVar {
    name: String,
    slot: u8,
    depth: u32,
}

/// Per-function emission state. Slots are assigned monotonically and never
/// reused, so `next_slot` doubles as the final local count.
#[derive(Debug, Default)]
struct FunctionContext {
    locals: Vec<LocalVar>,
    depth: u32,
    next_slot: u16,
    class_name: Option<String>,
    hidden_counter: u32,
}

impl FunctionContext {
    fn enter_scope(&mut self) {
        self.depth += 1;
    }

    fn exit_scope(&mut self) {
        while self
            .locals
            .last()
            .is_some_and(|local| local.depth >= self.depth)
        {
            self.locals.pop();
        }
        self.depth = self.depth.saturating_sub(1);
    }

    fn add_local(&mut self, name: &str) -> DropletResult<u8> {
        // local_count is a u8, so at most 255 slots fit in a frame.
        if self.next_slot >= 255 {
            return Err(DropletError::compile(format!(
                "too many locals in one function while declaring '{name}'"
            )));
        }
        let slot = self.next_slot as u8;
        self.next_slot += 1;
        self.locals.push(LocalVar {
            name: name.to_string(),
            slot,
            depth: self.depth,
        });
        Ok(slot)
    }

    /// A fresh hidden slot for lowering (loop cursors, store temporaries).
    fn add_hidden(&mut self, tag: &str) -> DropletResult<u8> {
        self.hidden_counter += 1;
        let name = format!("${tag}{}", self.hidden_counter);
        self.add_local(&name)
    }

    fn find_local(&self, name: &str) -> Option<u8> {
        self.locals
            .iter()
            .rev()
            .find(|local| local.name == name)
            .map(|local| local.slot)
    }

    fn local_count(&self) -> u8 {
        self.next_slot as u8
    }
}

/// Pending break/continue fix-ups for one loop nesting level.
#[derive(Debug, Default)]
struct LoopContext {
    /// Byte offsets of `break` jump operands.
    break_patches: Vec<u32>,
    /// Byte offsets of `continue` jump operands.
    continue_patches: Vec<u32>,
}

/// The Droplet code generator.
pub struct CodeGenerator<'a> {
    builder: DbcBuilder,
    info: &'a TypeInfo,
    function_indices: FxHashMap<String, u32>,
    ctx: FunctionContext,
    loop_stack: Vec<LoopContext>,

    emit_debug: bool,
    debug_tables: DebugTables,
    source_file: String,
    current_fn_index: u32,
    last_recorded: SourceLocation,
}

impl<'a> CodeGenerator<'a> {
    /// Create a generator for a checked program.
    #[must_use]
    pub fn new(info: &'a TypeInfo) -> Self {
        Self {
            builder: DbcBuilder::new(),
            info,
            function_indices: FxHashMap::default(),
            ctx: FunctionContext::default(),
            loop_stack: Vec::new(),
            emit_debug: false,
            debug_tables: DebugTables::new(),
            source_file: String::new(),
            current_fn_index: 0,
            last_recorded: SourceLocation::none(),
        }
    }

    /// Enable IP → source-location and local-slot table recording.
    pub fn enable_debug_info(&mut self, source_file: &str) {
        self.emit_debug = true;
        self.source_file = source_file.to_string();
    }

    /// Name the source file used in debug tables.
    pub fn set_source_file(&mut self, source_file: &str) {
        self.source_file = source_file.to_string();
    }

    /// Generate bytecode for a single program (no modules).
    pub fn generate(mut self, program: &Program) -> DropletResult<(DbcBuilder, DebugTables)> {
        self.register_unit(program);
        let info = self.info;
        self.emit_unit(program, info)?;
        Ok((self.builder, self.debug_tables))
    }

    /// Generate bytecode for a program plus every module its imports pulled
    /// in. Modules are emitted first, then the main program; the function
    /// index space is shared.
    pub fn generate_with_modules(
        mut self,
        program: &Program,
        loader: &'a ModuleLoader,
    ) -> DropletResult<(DbcBuilder, DebugTables)> {
        let main_info = self.info;

        // Registration pass: all functions of all units obtain indices
        // before any body is emitted.
        for module in loader.modules() {
            self.register_unit(&module.ast);
        }
        self.register_unit(program);

        // Emission pass, same unit order.
        for module in loader.modules() {
            let Some(info) = module.type_info.as_ref() else {
                continue;
            };
            self.info = info;
            let file = module.file_path.display().to_string();
            let previous = std::mem::replace(&mut self.source_file, file);
            self.emit_unit(&module.ast, info)?;
            self.source_file = previous;
        }

        self.info = main_info;
        self.emit_unit(program, main_info)?;
        Ok((self.builder, self.debug_tables))
    }

    // =========================================================================
    // Registration pass
    // =========================================================================

    /// Reserve table slots for every function a unit will emit, in the same
    /// order `emit_unit` walks them.
    fn register_unit(&mut self, program: &Program) {
        for class in &program.classes {
            if class.constructor.is_some() {
                self.register_function(&mangle(&class.name, "new"));
            }
            for method in &class.methods {
                self.register_function(&mangle(&class.name, &method.name));
            }
            for field in &class.fields {
                if field.is_static && field.initializer.is_some() {
                    self.register_function(&format!("{}$init", mangle(&class.name, &field.name)));
                }
            }
        }
        for func in &program.functions {
            // Foreign functions have no body; calls route through CALL_FFI.
            if func.ffi.is_none() {
                self.register_function(&func.name);
            }
        }
    }

    fn register_function(&mut self, name: &str) {
        if self.function_indices.contains_key(name) {
            return;
        }
        let idx = self.builder.functions.len() as u32;
        self.builder.add_function(name);
        self.function_indices.insert(name.to_string(), idx);
    }

    // =========================================================================
    // Emission pass
    // =========================================================================

    fn emit_unit(&mut self, program: &Program, info: &'a TypeInfo) -> DropletResult<()> {
        self.info = info;
        for class in &program.classes {
            self.emit_class(class)?;
        }
        for func in &program.functions {
            if func.ffi.is_none() {
                self.emit_function(func)?;
            }
        }
        Ok(())
    }

    fn begin_function(&mut self, name: &str) -> (u32, FunctionBuilder) {
        let idx = self.function_indices[name];
        self.current_fn_index = idx;
        self.last_recorded = SourceLocation::none();
        if self.emit_debug {
            let entry = self.debug_tables.entry(idx).or_default();
            entry.name = name.to_string();
            entry.file = self.source_file.clone();
        }
        let fb = FunctionBuilder {
            name: name.to_string(),
            ..FunctionBuilder::default()
        };
        (idx, fb)
    }

    fn finish_function(&mut self, idx: u32, mut fb: FunctionBuilder, arg_count: u8) {
        debug_assert!(self.loop_stack.is_empty(), "unpatched loop context");
        fb.arg_count = arg_count;
        fb.local_count = self.ctx.local_count();
        if self.emit_debug {
            let entry = self.debug_tables.entry(idx).or_default();
            for local in &self.ctx.locals {
                entry.local_slots.insert(local.name.clone(), local.slot);
            }
        }
        self.builder.functions[idx as usize] = fb;
    }

    fn emit_class(&mut self, class: &ClassDecl) -> DropletResult<()> {
        if class.constructor.is_some() {
            self.emit_constructor(class)?;
        }
        for method in &class.methods {
            self.emit_method(class, method)?;
        }
        for field in &class.fields {
            if !field.is_static {
                continue;
            }
            let Some(init) = &field.initializer else {
                continue;
            };
            // Static fields live in globals under their mangled name; the
            // runner invokes every `*$init` function before `main`.
            let global = mangle(&class.name, &field.name);
            let init_name = format!("{global}$init");
            let global_idx = self.builder.add_string(&global);

            self.ctx = FunctionContext::default();
            let (idx, mut fb) = self.begin_function(&init_name);
            self.emit_expr(init, &mut fb)?;
            fb.store_global(global_idx);
            fb.ret(0);
            self.finish_function(idx, fb, 0);
        }
        Ok(())
    }

    fn emit_constructor(&mut self, class: &ClassDecl) -> DropletResult<()> {
        let ctor = class.constructor.as_ref().expect("caller checked");
        let name = mangle(&class.name, "new");

        self.ctx = FunctionContext {
            class_name: Some(class.name.clone()),
            ..FunctionContext::default()
        };
        let (idx, mut fb) = self.begin_function(&name);

        // Arguments occupy slots 0..argc; `self` is a synthesized local.
        for param in &ctor.params {
            self.ctx.add_local(&param.name)?;
        }
        let class_name_idx = self.builder.add_string(&class.name);
        fb.new_object(class_name_idx);
        let self_slot = self.ctx.add_local("self")?;
        fb.store_local(self_slot);

        // Initialize declared instance fields: a constructor parameter of
        // the same name wins, then the field initializer, then nil.
        for field in &class.fields {
            if field.is_static {
                continue;
            }
            let field_idx = self.builder.add_string(&field.name);
            fb.load_local(self_slot);

            let param_slot = ctor
                .params
                .iter()
                .position(|p| p.name == field.name)
                .map(|i| i as u8);
            match (param_slot, &field.initializer) {
                (Some(slot), _) => {
                    fb.load_local(slot);
                }
                (None, Some(init)) => {
                    self.emit_expr(init, &mut fb)?;
                }
                (None, None) => {
                    let nil = self.builder.add_nil();
                    fb.push_const(nil);
                }
            }
            fb.set_field(field_idx);
        }

        if let Some(body) = &ctor.body {
            self.emit_body_statements(body, &mut fb)?;
        }

        fb.load_local(self_slot);
        fb.ret(1);
        self.finish_function(idx, fb, ctor.params.len() as u8);
        Ok(())
    }

    fn emit_method(&mut self, class: &ClassDecl, method: &FunctionDecl) -> DropletResult<()> {
        let name = mangle(&class.name, &method.name);

        self.ctx = FunctionContext {
            class_name: Some(class.name.clone()),
            ..FunctionContext::default()
        };
        let (idx, mut fb) = self.begin_function(&name);

        if !method.is_static {
            self.ctx.add_local("self")?;
        }
        for param in &method.params {
            self.ctx.add_local(&param.name)?;
        }

        if let Some(body) = &method.body {
            self.emit_body_statements(body, &mut fb)?;
        }

        // Fall-through return.
        let nil = self.builder.add_nil();
        fb.push_const(nil);
        fb.ret(1);

        let argc = if method.is_static {
            method.params.len() as u8
        } else {
            method.params.len() as u8 + 1
        };
        self.finish_function(idx, fb, argc);
        Ok(())
    }

    fn emit_function(&mut self, func: &FunctionDecl) -> DropletResult<()> {
        self.ctx = FunctionContext::default();
        let (idx, mut fb) = self.begin_function(&func.name);

        for param in &func.params {
            self.ctx.add_local(&param.name)?;
        }

        if let Some(body) = &func.body {
            self.emit_body_statements(body, &mut fb)?;
        }

        // Every function leaves a value for its caller; falling off the end
        // returns nil.
        let nil = self.builder.add_nil();
        fb.push_const(nil);
        fb.ret(1);

        self.finish_function(idx, fb, func.params.len() as u8);
        Ok(())
    }

    /// Emit a function body block without opening another scope (parameters
    /// share the body scope).
    fn emit_body_statements(&mut self, body: &Stmt, fb: &mut FunctionBuilder) -> DropletResult<()> {
        match &body.kind {
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.emit_stmt(stmt, fb)?;
                }
                Ok(())
            }
            _ => self.emit_stmt(body, fb),
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn emit_stmt(&mut self, stmt: &Stmt, fb: &mut FunctionBuilder) -> DropletResult<()> {
        self.record_debug_location(fb, stmt.location);
        match &stmt.kind {
            StmtKind::VarDecl {
                name, initializer, ..
            } => {
                let slot = self.ctx.add_local(name)?;
                match initializer {
                    Some(init) => self.emit_expr(init, fb)?,
                    None => {
                        let nil = self.builder.add_nil();
                        fb.push_const(nil);
                    }
                }
                fb.store_local(slot);
                Ok(())
            }
            StmtKind::Block(stmts) => {
                self.ctx.enter_scope();
                for s in stmts {
                    self.emit_stmt(s, fb)?;
                }
                self.ctx.exit_scope();
                Ok(())
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.emit_if(condition, then_branch, else_branch.as_deref(), fb),
            StmtKind::While { condition, body } => self.emit_while(condition, body, fb),
            StmtKind::For {
                variable,
                iterable,
                body,
            } => self.emit_for(variable, iterable, body, fb),
            StmtKind::Loop { body } => self.emit_loop(body, fb),
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => {
                        self.emit_expr(expr, fb)?;
                    }
                    None => {
                        let nil = self.builder.add_nil();
                        fb.push_const(nil);
                    }
                }
                self.record_debug_location(fb, stmt.location);
                fb.ret(1);
                Ok(())
            }
            StmtKind::Break => {
                let hole = fb.current_pos() + 1;
                fb.jump(0);
                if let Some(ctx) = self.loop_stack.last_mut() {
                    ctx.break_patches.push(hole);
                }
                Ok(())
            }
            StmtKind::Continue => {
                let hole = fb.current_pos() + 1;
                fb.jump(0);
                if let Some(ctx) = self.loop_stack.last_mut() {
                    ctx.continue_patches.push(hole);
                }
                Ok(())
            }
            StmtKind::Expr(expr) => {
                self.emit_expr(expr, fb)?;
                fb.emit(Op::Pop);
                Ok(())
            }
        }
    }

    fn emit_if(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        self.emit_expr(condition, fb)?;

        let else_hole = fb.current_pos() + 1;
        fb.jump_if_false(0);

        self.emit_stmt(then_branch, fb)?;

        match else_branch {
            Some(else_branch) => {
                let end_hole = fb.current_pos() + 1;
                fb.jump(0);
                fb.patch_u32(else_hole, fb.current_pos());
                self.emit_stmt(else_branch, fb)?;
                fb.patch_u32(end_hole, fb.current_pos());
            }
            None => {
                fb.patch_u32(else_hole, fb.current_pos());
            }
        }
        Ok(())
    }

    fn emit_while(
        &mut self,
        condition: &Expr,
        body: &Stmt,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        let header = fb.current_pos();
        self.loop_stack.push(LoopContext::default());

        self.emit_expr(condition, fb)?;
        let exit_hole = fb.current_pos() + 1;
        fb.jump_if_false(0);

        self.emit_stmt(body, fb)?;
        fb.jump(header);

        let exit = fb.current_pos();
        fb.patch_u32(exit_hole, exit);
        self.patch_loop(fb, exit, header);
        Ok(())
    }

    /// `for v in xs` checks the index against `len(xs)` each iteration, so
    /// lists may legally contain nil; `continue` targets the increment step.
    fn emit_for(
        &mut self,
        variable: &str,
        iterable: &Expr,
        body: &Stmt,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        self.ctx.enter_scope();

        self.emit_expr(iterable, fb)?;
        let iter_slot = self.ctx.add_hidden("iter")?;
        fb.store_local(iter_slot);

        let idx_slot = self.ctx.add_hidden("idx")?;
        let zero = self.builder.add_int(0);
        fb.push_const(zero);
        fb.store_local(idx_slot);

        let var_slot = self.ctx.add_local(variable)?;

        let len_idx = self.builder.add_string("len");
        let one = self.builder.add_int(1);

        let header = fb.current_pos();
        self.loop_stack.push(LoopContext::default());

        // idx < len(iter)
        fb.load_local(idx_slot);
        fb.load_local(iter_slot);
        fb.call_native(len_idx, 1);
        fb.emit(Op::Lt);
        let exit_hole = fb.current_pos() + 1;
        fb.jump_if_false(0);

        // v = iter[idx]
        fb.load_local(iter_slot);
        fb.load_local(idx_slot);
        fb.emit(Op::ArrayGet);
        fb.store_local(var_slot);

        self.emit_stmt(body, fb)?;

        // idx = idx + 1
        let increment = fb.current_pos();
        fb.load_local(idx_slot);
        fb.push_const(one);
        fb.emit(Op::Add);
        fb.store_local(idx_slot);
        fb.jump(header);

        let exit = fb.current_pos();
        fb.patch_u32(exit_hole, exit);
        self.patch_loop(fb, exit, increment);

        self.ctx.exit_scope();
        Ok(())
    }

    fn emit_loop(&mut self, body: &Stmt, fb: &mut FunctionBuilder) -> DropletResult<()> {
        let header = fb.current_pos();
        self.loop_stack.push(LoopContext::default());

        self.emit_stmt(body, fb)?;
        fb.jump(header);

        let exit = fb.current_pos();
        self.patch_loop(fb, exit, header);
        Ok(())
    }

    /// Pop the innermost loop context, patching breaks to `break_target` and
    /// continues to `continue_target`.
    fn patch_loop(&mut self, fb: &mut FunctionBuilder, break_target: u32, continue_target: u32) {
        let ctx = self.loop_stack.pop().expect("loop context pushed by caller");
        for hole in ctx.break_patches {
            fb.patch_u32(hole, break_target);
        }
        for hole in ctx.continue_patches {
            fb.patch_u32(hole, continue_target);
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn emit_expr(&mut self, expr: &Expr, fb: &mut FunctionBuilder) -> DropletResult<()> {
        self.record_debug_location(fb, expr.location);
        match &expr.kind {
            ExprKind::Literal(lit) => {
                let idx = match lit {
                    Literal::Int(v) => self.builder.add_int(*v as i32),
                    Literal::Float(v) => self.builder.add_float(*v),
                    Literal::Bool(v) => self.builder.add_bool(*v),
                    Literal::Str(v) => self.builder.add_string(v),
                    Literal::Null => self.builder.add_nil(),
                };
                fb.push_const(idx);
                Ok(())
            }
            ExprKind::Identifier(name) => {
                match self.ctx.find_local(name) {
                    Some(slot) => {
                        fb.load_local(slot);
                    }
                    None => {
                        let idx = self.builder.add_string(name);
                        fb.load_global(idx);
                    }
                }
                Ok(())
            }
            ExprKind::Binary { op, left, right } => self.emit_binary(expr, *op, left, right, fb),
            ExprKind::Unary { op, operand } => self.emit_unary(expr, *op, operand, fb),
            ExprKind::Assign { target, value } => self.emit_assign(target, value, fb),
            ExprKind::CompoundAssign { op, target, value } => {
                self.emit_compound_assign(*op, target, value, fb)
            }
            ExprKind::Call { callee, arguments } => self.emit_call(expr, callee, arguments, fb),
            ExprKind::FieldAccess { object, field } => self.emit_field_access(object, field, fb),
            ExprKind::Index { object, index } => self.emit_index(expr, object, index, fb),
            ExprKind::New {
                class_name,
                arguments,
                ..
            } => self.emit_new(class_name, arguments, fb),
            ExprKind::List(elements) => {
                fb.emit(Op::NewArray);
                for (i, element) in elements.iter().enumerate() {
                    fb.emit(Op::Dup);
                    let idx = self.builder.add_int(i as i32);
                    fb.push_const(idx);
                    self.emit_expr(element, fb)?;
                    fb.emit(Op::ArraySet);
                }
                Ok(())
            }
            ExprKind::Dict(pairs) => {
                fb.emit(Op::NewMap);
                for (key, value) in pairs {
                    fb.emit(Op::Dup);
                    self.emit_expr(key, fb)?;
                    self.emit_expr(value, fb)?;
                    fb.emit(Op::MapSet);
                }
                Ok(())
            }
            ExprKind::Cast { expr: inner, .. } => {
                // Casts are checked statically; at runtime they are identity.
                self.emit_expr(inner, fb)
            }
            ExprKind::IsType {
                expr: inner,
                target_type,
            } => {
                self.emit_expr(inner, fb)?;
                let idx = self.builder.add_string(target_type);
                fb.is_instance(idx);
                Ok(())
            }
        }
    }

    fn emit_binary(
        &mut self,
        expr: &Expr,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        // Resolved operator overload: the binary becomes a method call with
        // the left operand as the receiver.
        if let Some(method) = self.info.overloads.get(&expr.id).cloned() {
            let class_name = self.expr_class_name(left);
            let mangled = mangle(&class_name, &method);
            if let Some(&fn_idx) = self.function_indices.get(&mangled) {
                self.emit_expr(left, fb)?;
                self.emit_expr(right, fb)?;
                self.record_debug_location(fb, expr.location);
                fb.call(fn_idx, 2);
                return Ok(());
            }
            eprintln!("droplet: operator method '{mangled}' missing from function table");
            let nil = self.builder.add_nil();
            fb.push_const(nil);
            return Ok(());
        }

        self.emit_expr(left, fb)?;
        self.emit_expr(right, fb)?;
        self.record_debug_location(fb, expr.location);

        // Two string operands turn + into the dedicated concat instruction.
        if op == BinaryOp::Add && self.expr_is_str(left) && self.expr_is_str(right) {
            fb.emit(Op::StringConcat);
            return Ok(());
        }

        fb.emit(match op {
            BinaryOp::Add => Op::Add,
            BinaryOp::Sub => Op::Sub,
            BinaryOp::Mul => Op::Mul,
            BinaryOp::Div => Op::Div,
            BinaryOp::Mod => Op::Mod,
            BinaryOp::Eq => Op::Eq,
            BinaryOp::Neq => Op::Neq,
            BinaryOp::Lt => Op::Lt,
            BinaryOp::Lte => Op::Lte,
            BinaryOp::Gt => Op::Gt,
            BinaryOp::Gte => Op::Gte,
            BinaryOp::And => Op::And,
            BinaryOp::Or => Op::Or,
        });
        Ok(())
    }

    fn emit_unary(
        &mut self,
        expr: &Expr,
        op: UnaryOp,
        operand: &Expr,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        if let Some(method) = self.info.overloads.get(&expr.id).cloned() {
            let class_name = self.expr_class_name(operand);
            let mangled = mangle(&class_name, &method);
            if let Some(&fn_idx) = self.function_indices.get(&mangled) {
                self.emit_expr(operand, fb)?;
                fb.call(fn_idx, 1);
                return Ok(());
            }
        }

        self.emit_expr(operand, fb)?;
        match op {
            UnaryOp::Neg => {
                // 0 - x
                let zero = self.builder.add_int(0);
                fb.push_const(zero);
                fb.emit(Op::Swap);
                fb.emit(Op::Sub);
            }
            UnaryOp::Not => {
                fb.emit(Op::Not);
            }
        }
        Ok(())
    }

    fn emit_assign(
        &mut self,
        target: &Expr,
        value: &Expr,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        match &target.kind {
            ExprKind::Identifier(name) => {
                self.emit_expr(value, fb)?;
                fb.emit(Op::Dup);
                match self.ctx.find_local(name) {
                    Some(slot) => {
                        fb.store_local(slot);
                    }
                    None => {
                        let idx = self.builder.add_string(name);
                        fb.store_global(idx);
                    }
                }
                Ok(())
            }
            ExprKind::FieldAccess { object, field } => {
                // Static field: ClassName.field lives in a mangled global.
                if let Some(class_name) = self.static_receiver(object) {
                    self.emit_expr(value, fb)?;
                    fb.emit(Op::Dup);
                    let idx = self.builder.add_string(&mangle(&class_name, field));
                    fb.store_global(idx);
                    return Ok(());
                }
                // obj value value -> obj value, leaving one copy on the stack.
                self.emit_expr(object, fb)?;
                self.emit_expr(value, fb)?;
                fb.emit(Op::Dup);
                fb.emit(Op::Rot);
                fb.emit(Op::Swap);
                let idx = self.builder.add_string(field);
                fb.set_field(idx);
                Ok(())
            }
            ExprKind::Index { object, index } => {
                self.emit_expr(object, fb)?;
                self.emit_expr(index, fb)?;
                self.emit_expr(value, fb)?;
                // Stash the value so assignment still yields it after the
                // three-operand store consumes the stack.
                fb.emit(Op::Dup);
                let tmp = self.ctx.add_hidden("val")?;
                fb.store_local(tmp);
                fb.emit(self.index_store_op(object));
                fb.load_local(tmp);
                Ok(())
            }
            _ => Err(DropletError::compile(
                "invalid assignment target".to_string(),
            )),
        }
    }

    fn emit_compound_assign(
        &mut self,
        op: CompoundOp,
        target: &Expr,
        value: &Expr,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        let arith = match op {
            CompoundOp::Add => Op::Add,
            CompoundOp::Sub => Op::Sub,
        };

        match &target.kind {
            ExprKind::Identifier(name) => {
                let local = self.ctx.find_local(name);
                match local {
                    Some(slot) => {
                        fb.load_local(slot);
                    }
                    None => {
                        let idx = self.builder.add_string(name);
                        fb.load_global(idx);
                    }
                }
                self.emit_expr(value, fb)?;
                fb.emit(arith);
                fb.emit(Op::Dup);
                match local {
                    Some(slot) => {
                        fb.store_local(slot);
                    }
                    None => {
                        let idx = self.builder.add_string(name);
                        fb.store_global(idx);
                    }
                }
                Ok(())
            }
            ExprKind::FieldAccess { object, field } => {
                if let Some(class_name) = self.static_receiver(object) {
                    let idx = self.builder.add_string(&mangle(&class_name, field));
                    fb.load_global(idx);
                    self.emit_expr(value, fb)?;
                    fb.emit(arith);
                    fb.emit(Op::Dup);
                    fb.store_global(idx);
                    return Ok(());
                }
                let field_idx = self.builder.add_string(field);
                let tmp = self.ctx.add_hidden("val")?;
                self.emit_expr(object, fb)?;
                fb.emit(Op::Dup);
                fb.get_field(field_idx);
                self.emit_expr(value, fb)?;
                fb.emit(arith);
                fb.emit(Op::Dup);
                fb.store_local(tmp);
                fb.set_field(field_idx);
                fb.load_local(tmp);
                Ok(())
            }
            ExprKind::Index { object, index } => {
                let obj_tmp = self.ctx.add_hidden("obj")?;
                let idx_tmp = self.ctx.add_hidden("idx")?;
                let val_tmp = self.ctx.add_hidden("val")?;

                self.emit_expr(object, fb)?;
                fb.store_local(obj_tmp);
                self.emit_expr(index, fb)?;
                fb.store_local(idx_tmp);

                fb.load_local(obj_tmp);
                fb.load_local(idx_tmp);
                fb.emit(self.index_load_op(object));

                self.emit_expr(value, fb)?;
                fb.emit(arith);
                fb.store_local(val_tmp);

                fb.load_local(obj_tmp);
                fb.load_local(idx_tmp);
                fb.load_local(val_tmp);
                fb.emit(self.index_store_op(object));
                fb.load_local(val_tmp);
                Ok(())
            }
            _ => Err(DropletError::compile(
                "invalid compound assignment target".to_string(),
            )),
        }
    }

    fn emit_call(
        &mut self,
        expr: &Expr,
        callee: &Expr,
        arguments: &[Expr],
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        if let ExprKind::FieldAccess { object, field } = &callee.kind {
            // Static method call: arguments only, no receiver.
            if let Some(class_name) = self.static_receiver(object) {
                let mangled = mangle(&class_name, field);
                if let Some(&fn_idx) = self.function_indices.get(&mangled) {
                    for arg in arguments {
                        self.emit_expr(arg, fb)?;
                    }
                    self.record_debug_location(fb, expr.location);
                    fb.call(fn_idx, arguments.len() as u8);
                    return Ok(());
                }
                eprintln!("droplet: static method '{mangled}' missing from function table");
                let nil = self.builder.add_nil();
                fb.push_const(nil);
                return Ok(());
            }

            // Instance method call: receiver first, then arguments; argc
            // includes the receiver.
            let class_name = self.expr_class_name(object);
            if let Some(mangled) = self.find_method_slot(&class_name, field) {
                if let Some(&fn_idx) = self.function_indices.get(&mangled) {
                    self.emit_expr(object, fb)?;
                    for arg in arguments {
                        self.emit_expr(arg, fb)?;
                    }
                    self.record_debug_location(fb, expr.location);
                    fb.call(fn_idx, arguments.len() as u8 + 1);
                    return Ok(());
                }
            }
            eprintln!(
                "droplet: could not resolve method '{}' on class '{}'",
                field, class_name
            );
            let nil = self.builder.add_nil();
            fb.push_const(nil);
            return Ok(());
        }

        if let ExprKind::Identifier(name) = &callee.kind {
            // Foreign function: routed through CALL_FFI.
            if let Some(ffi) = self.info.ffi_functions.get(name).cloned() {
                for arg in arguments {
                    self.emit_expr(arg, fb)?;
                }
                let lib_idx = self.builder.add_string(&ffi.lib_name);
                let sym_idx = self.builder.add_string(name);
                let sig_idx = self.builder.add_string(&ffi.signature);
                self.record_debug_location(fb, expr.location);
                eprintln!(
                    "droplet: note: '{name}' is a foreign function; the call yields nil unless \
                     an FFI dispatcher is installed"
                );
                fb.call_ffi(lib_idx, sym_idx, arguments.len() as u8, sig_idx);
                return Ok(());
            }

            // Intrinsics.
            if NATIVE_FNS.contains(&name.as_str()) {
                for arg in arguments {
                    self.emit_expr(arg, fb)?;
                }
                let name_idx = self.builder.add_string(name);
                self.record_debug_location(fb, expr.location);
                fb.call_native(name_idx, arguments.len() as u8);
                return Ok(());
            }

            // Constructor call spelled as a plain call: C(...).
            let ctor = mangle(name, "new");
            if let Some(&fn_idx) = self.function_indices.get(&ctor) {
                for arg in arguments {
                    self.emit_expr(arg, fb)?;
                }
                fb.call(fn_idx, arguments.len() as u8);
                return Ok(());
            }
            if self.info.classes.contains_key(name) {
                // Constructor-less class: allocate directly.
                for arg in arguments {
                    self.emit_expr(arg, fb)?;
                }
                let idx = self.builder.add_string(name);
                fb.new_object(idx);
                return Ok(());
            }

            // Plain function call.
            if let Some(&fn_idx) = self.function_indices.get(name.as_str()) {
                for arg in arguments {
                    self.emit_expr(arg, fb)?;
                }
                self.record_debug_location(fb, expr.location);
                fb.call(fn_idx, arguments.len() as u8);
                return Ok(());
            }

            eprintln!("droplet: undefined function '{name}' at code generation");
            let nil = self.builder.add_nil();
            fb.push_const(nil);
            return Ok(());
        }

        Err(DropletError::compile("expression is not callable".to_string()))
    }

    fn emit_field_access(
        &mut self,
        object: &Expr,
        field: &str,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        if let Some(class_name) = self.static_receiver(object) {
            let idx = self.builder.add_string(&mangle(&class_name, field));
            fb.load_global(idx);
            return Ok(());
        }
        self.emit_expr(object, fb)?;
        let idx = self.builder.add_string(field);
        fb.get_field(idx);
        Ok(())
    }

    fn emit_index(
        &mut self,
        expr: &Expr,
        object: &Expr,
        index: &Expr,
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        // op$index_get overload: the index becomes the single argument.
        if let Some(method) = self.info.overloads.get(&expr.id).cloned() {
            let class_name = self.expr_class_name(object);
            let mangled = mangle(&class_name, &method);
            if let Some(&fn_idx) = self.function_indices.get(&mangled) {
                self.emit_expr(object, fb)?;
                self.emit_expr(index, fb)?;
                fb.call(fn_idx, 2);
                return Ok(());
            }
        }

        self.emit_expr(object, fb)?;
        self.emit_expr(index, fb)?;
        fb.emit(self.index_load_op(object));
        Ok(())
    }

    fn emit_new(
        &mut self,
        class_name: &str,
        arguments: &[Expr],
        fb: &mut FunctionBuilder,
    ) -> DropletResult<()> {
        let ctor = mangle(class_name, "new");
        if let Some(&fn_idx) = self.function_indices.get(&ctor) {
            for arg in arguments {
                self.emit_expr(arg, fb)?;
            }
            fb.call(fn_idx, arguments.len() as u8);
            return Ok(());
        }

        // Constructor-less classes allocate an empty instance directly.
        let idx = self.builder.add_string(class_name);
        fb.new_object(idx);
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The static class name of an expression, per the checker's annotation.
    fn expr_class_name(&self, expr: &Expr) -> String {
        self.info
            .expr_types
            .get(&expr.id)
            .filter(|t| t.kind == TypeKind::Object)
            .map(|t| t.class_name.clone())
            .unwrap_or_default()
    }

    fn expr_is_str(&self, expr: &Expr) -> bool {
        self.info
            .expr_types
            .get(&expr.id)
            .is_some_and(|t| t.kind == TypeKind::Str)
    }

    /// `Some(class)` when the receiver expression is a bare identifier that
    /// names a class rather than a binding — a static member access.
    fn static_receiver(&self, object: &Expr) -> Option<String> {
        let ExprKind::Identifier(name) = &object.kind else {
            return None;
        };
        if self.ctx.find_local(name).is_some() {
            return None;
        }
        if self.info.classes.contains_key(name) {
            Some(name.clone())
        } else {
            None
        }
    }

    /// Walk the hierarchy for the class that declares `method`, returning
    /// its mangled name.
    fn find_method_slot(&self, class_name: &str, method: &str) -> Option<String> {
        crate::classes::find_method(&self.info.classes, class_name, method)
            .map(|(declaring, _)| mangle(&declaring, method))
    }

    /// `MAP_GET`/`ARRAY_GET` by the receiver's static type.
    fn index_load_op(&self, object: &Expr) -> Op {
        match self.info.expr_types.get(&object.id).map(|t| t.kind) {
            Some(TypeKind::Dict) => Op::MapGet,
            _ => Op::ArrayGet,
        }
    }

    /// `MAP_SET`/`ARRAY_SET` by the receiver's static type.
    fn index_store_op(&self, object: &Expr) -> Op {
        match self.info.expr_types.get(&object.id).map(|t| t.kind) {
            Some(TypeKind::Dict) => Op::MapSet,
            _ => Op::ArraySet,
        }
    }

    fn record_debug_location(&mut self, fb: &FunctionBuilder, location: SourceLocation) {
        if !self.emit_debug || !location.is_known() {
            return;
        }
        if location == self.last_recorded {
            return;
        }
        let ip = fb.current_pos();
        let entry = self.debug_tables.entry(self.current_fn_index).or_default();
        entry.ip_to_location.insert(
            ip,
            DebugLocation {
                file: self.source_file.clone(),
                line: location.line,
                column: location.column,
            },
        );
        self.last_recorded = location;
    }
}

/// Convenience: type-check and compile a program in one call.
pub fn compile_program(program: &Program, info: &TypeInfo) -> DropletResult<DbcBuilder> {
    let generator = CodeGenerator::new(info);
    let (builder, _) = generator.generate(program)?;
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typechecker::TypeChecker;
    use droplet_parser::parse;

    fn compile(source: &str) -> DbcBuilder {
        let program = parse(source).expect("parse");
        let info = TypeChecker::check(&program, None).expect("check");
        compile_program(&program, &info).expect("compile")
    }

    fn function<'b>(builder: &'b DbcBuilder, name: &str) -> &'b FunctionBuilder {
        builder
            .functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("function '{name}' not emitted"))
    }

    #[test]
    fn test_mangling() {
        assert_eq!(mangle("Point", "sum"), "Point$$sum");
        assert_eq!(mangle("V", "op$add"), "V$$op$add");
    }

    #[test]
    fn test_main_emitted_with_trailing_return() {
        let builder = compile("fn main() { println(1 + 2 * 3) }");
        let main = function(&builder, "main");
        // Ends with PUSH_CONST nil; RETURN 1.
        let code = &main.code;
        assert_eq!(code[code.len() - 2], Op::Return as u8);
        assert_eq!(code[code.len() - 1], 1);
    }

    #[test]
    fn test_constructor_and_method_mangled_names() {
        let builder = compile(
            "class Point { pub x:int=0\n new(a:int){ self.x=a }\n pub fn get()->int{ return self.x } }\nfn main(){ let p = new Point(1); p.get() }",
        );
        assert!(builder.functions.iter().any(|f| f.name == "Point$$new"));
        assert!(builder.functions.iter().any(|f| f.name == "Point$$get"));
    }

    #[test]
    fn test_constructor_arg_and_local_counts() {
        let builder = compile("class P { pub x:int=0\n new(a:int,b:int){ } }\nfn main(){ }");
        let ctor = function(&builder, "P$$new");
        assert_eq!(ctor.arg_count, 2);
        // Two params + self.
        assert_eq!(ctor.local_count, 3);
    }

    #[test]
    fn test_instance_method_argc_includes_self() {
        let builder = compile(
            "class C { pub fn id(x:int)->int { return x } }\nfn main(){ let c = new C(); c.id(4) }",
        );
        let method = function(&builder, "C$$id");
        assert_eq!(method.arg_count, 2);
    }

    #[test]
    fn test_static_method_argc_excludes_self() {
        let builder = compile(
            "class M { pub static fn twice(x:int)->int { return x + x } }\nfn main() { M.twice(21) }",
        );
        let method = function(&builder, "M$$twice");
        assert_eq!(method.arg_count, 1);
    }

    #[test]
    fn test_static_field_initializer_function() {
        let builder = compile("class C { pub static counter:int = 7 }\nfn main(){ }");
        assert!(builder
            .functions
            .iter()
            .any(|f| f.name == "C$$counter$init"));
    }

    #[test]
    fn test_string_concat_instruction_selected() {
        let builder = compile("fn main() { let s = \"a\" + \"b\" }");
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::StringConcat as u8)));
        assert!(!main.code.contains(&(Op::Add as u8)));
    }

    #[test]
    fn test_operator_overload_becomes_call() {
        let builder = compile(
            "class V { pub n:int=0\n new(x:int){ self.n=x }\n pub op + (o:V)->V { return new V(self.n + o.n) } }\nfn main(){ let a=new V(1); let b=new V(2); let c = a + b }",
        );
        assert!(builder.functions.iter().any(|f| f.name == "V$$op$add"));
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::Call as u8)));
    }

    #[test]
    fn test_forward_reference_between_functions() {
        let builder = compile("fn first()->int { return second() }\nfn second()->int { return 1 }\nfn main(){ first() }");
        let first = function(&builder, "first");
        assert!(first.code.contains(&(Op::Call as u8)));
    }

    #[test]
    fn test_is_emits_is_instance() {
        let builder = compile(
            "fn f(s:str)->int! { return 1 }\nfn main(){ let r = f(\"\"); if r is Error { return } println(r) }",
        );
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::IsInstance as u8)));
    }

    #[test]
    fn test_for_in_uses_len_native() {
        let builder = compile("fn main(){ for v in [1,2,3] { println(v) } }");
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::CallNative as u8)));
        assert!(main.code.contains(&(Op::ArrayGet as u8)));
        assert!(main.code.contains(&(Op::Lt as u8)));
    }

    #[test]
    fn test_all_jumps_patched() {
        let builder = compile(
            "fn main(){ let i = 0; while i < 10 { if i == 5 { break } i = i + 1; continue } }",
        );
        let main = function(&builder, "main");
        // Walk the code and check every jump target is in-bounds.
        let code = &main.code;
        let mut ip = 0usize;
        while ip < code.len() {
            let op = Op::from_u8(code[ip]).expect("valid opcode stream");
            ip += 1;
            match op {
                Op::Jump | Op::JumpIfFalse | Op::JumpIfTrue => {
                    let target = u32::from_le_bytes(code[ip..ip + 4].try_into().unwrap());
                    assert!((target as usize) <= code.len(), "jump out of bounds");
                    ip += 4;
                }
                Op::PushConst
                | Op::LoadGlobal
                | Op::StoreGlobal
                | Op::NewObject
                | Op::GetField
                | Op::SetField
                | Op::IsInstance => ip += 4,
                Op::LoadLocal | Op::StoreLocal | Op::Return => ip += 1,
                Op::Call => ip += 5,
                Op::CallNative => ip += 5,
                Op::CallFfi => ip += 13,
                Op::StringSubstr => ip += 8,
                _ => {}
            }
        }
    }

    #[test]
    fn test_compound_assign_on_field_target() {
        let builder = compile(
            "class C { pub n:int=0 }\nfn main(){ let c = new C(); c.n += 2 }",
        );
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::GetField as u8)));
        assert!(main.code.contains(&(Op::SetField as u8)));
    }

    #[test]
    fn test_index_assignment_emits_array_set() {
        let builder = compile("fn main(){ let xs = [1,2]; xs[0] = 9 }");
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::ArraySet as u8)));
    }

    #[test]
    fn test_debug_info_records_positions_and_locals() {
        let program = parse("fn main() {\n let x = 1\n let y = 2\n}").expect("parse");
        let info = TypeChecker::check(&program, None).expect("check");
        let mut generator = CodeGenerator::new(&info);
        generator.enable_debug_info("test.drop");
        let (_, tables) = generator.generate(&program).expect("compile");

        let main_debug = tables.values().find(|d| d.name == "main").expect("tables");
        assert!(!main_debug.ip_to_location.is_empty());
        assert_eq!(main_debug.local_slots.get("x"), Some(&0));
        assert_eq!(main_debug.local_slots.get("y"), Some(&1));
        assert_eq!(main_debug.file, "test.drop");
    }

    #[test]
    fn test_new_without_constructor_allocates_directly() {
        let builder = compile("class E { }\nfn main(){ let e = new E() }");
        let main = function(&builder, "main");
        assert!(main.code.contains(&(Op::NewObject as u8)));
    }
}
