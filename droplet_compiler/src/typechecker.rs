//! Multi-pass semantic analysis.
//!
//! Checking runs in five phases: seed built-ins, process imports, collect
//! class declarations, analyze the class hierarchy, then check every
//! function, constructor, and method body. The checker does not mutate the
//! AST; per-expression facts (inferred types, resolved operator overloads)
//! are recorded in side tables keyed by [`ExprId`] and handed to the code
//! generator as a [`TypeInfo`].
//!
//! The fallible-return discipline lives here: a value of type `T!` cannot be
//! consumed until an `is Error` branch narrows it, and the guard pattern
//! (`if v is Error { return }`) narrows it for the remainder of the
//! enclosing scope.

use crate::classes::{find_field, find_method, is_subclass_of, ClassInfo, ClassTable, FieldInfo, MethodSig};
use crate::module_loader::ModuleLoader;
use crate::scope::{ScopeStack, Symbol, SymbolKind};
use crate::types::{Type, TypeKind};
use droplet_core::{DropletError, DropletResult};
use droplet_parser::ast::{
    BinaryOp, ClassDecl, Expr, ExprId, ExprKind, FunctionDecl, ImportDecl, Literal, Program, Stmt,
    StmtKind, UnaryOp, Visibility,
};
use rustc_hash::FxHashMap;

/// Intrinsic functions available without imports.
const BUILTIN_FNS: &[&str] = &[
    "print", "println", "input", "str", "int", "float", "len", "exit",
];

/// A registered foreign function.
#[derive(Clone, Debug)]
pub struct FfiSig {
    pub lib_name: String,
    pub signature: String,
    pub param_types: Vec<Type>,
    pub return_type: Type,
}

/// The result of a successful type check.
#[derive(Clone, Debug, Default)]
pub struct TypeInfo {
    /// Inferred type of every expression.
    pub expr_types: FxHashMap<ExprId, Type>,
    /// Binary/unary/index expressions resolved to operator-overload methods,
    /// by canonical `op$...` name.
    pub overloads: FxHashMap<ExprId, String>,
    /// The class table, imported classes included.
    pub classes: ClassTable,
    /// Top-level function signatures this unit exports.
    pub exported_functions: FxHashMap<String, Type>,
    /// Foreign functions declared with `@ffi`.
    pub ffi_functions: FxHashMap<String, FfiSig>,
}

/// The Droplet type checker.
pub struct TypeChecker<'ld> {
    scopes: ScopeStack,
    classes: ClassTable,
    current_class: Option<String>,
    current_return_type: Type,
    current_may_return_error: bool,
    /// Suppresses the fallible-consumption check inside `x is Error`.
    in_is_error_check: bool,
    expr_types: FxHashMap<ExprId, Type>,
    overloads: FxHashMap<ExprId, String>,
    exported_functions: FxHashMap<String, Type>,
    ffi_functions: FxHashMap<String, FfiSig>,
    loader: Option<&'ld mut ModuleLoader>,
}

impl<'ld> TypeChecker<'ld> {
    /// Type-check a program. Pass a module loader to resolve imports;
    /// without one, any import is an error.
    pub fn check(
        program: &Program,
        loader: Option<&'ld mut ModuleLoader>,
    ) -> DropletResult<TypeInfo> {
        let mut checker = TypeChecker {
            scopes: ScopeStack::new(),
            classes: ClassTable::default(),
            current_class: None,
            current_return_type: Type::void(),
            current_may_return_error: false,
            in_is_error_check: false,
            expr_types: FxHashMap::default(),
            overloads: FxHashMap::default(),
            exported_functions: FxHashMap::default(),
            ffi_functions: FxHashMap::default(),
            loader,
        };
        checker.run(program)?;
        Ok(TypeInfo {
            expr_types: checker.expr_types,
            overloads: checker.overloads,
            classes: checker.classes,
            exported_functions: checker.exported_functions,
            ffi_functions: checker.ffi_functions,
        })
    }

    fn run(&mut self, program: &Program) -> DropletResult<()> {
        // Phase 1: built-ins.
        self.register_builtin_types();
        self.register_builtins();
        self.register_ffi_functions(program);

        // Phase 2: imports.
        self.process_imports(program)?;

        // Phase 3: collect classes, then analyze the hierarchy.
        for class in &program.classes {
            self.collect_class(class)?;
        }
        self.analyze_hierarchy()?;

        // Phase 4: register top-level function signatures (forward refs).
        for func in &program.functions {
            let fn_type = self.function_type(func, &[]);
            self.exported_functions
                .insert(func.name.clone(), fn_type.clone());
            self.scopes
                .define_global(Symbol::new(SymbolKind::Function, &func.name, fn_type));
        }

        // Phase 5: check bodies.
        for func in &program.functions {
            if func.body.is_some() {
                self.check_function(func, None)?;
            }
        }
        for class in &program.classes {
            self.current_class = Some(class.name.clone());
            self.check_field_initializers(class)?;
            if let Some(ctor) = &class.constructor {
                self.check_function(ctor, Some(class))?;
            }
            for method in &class.methods {
                self.check_function(method, Some(class))?;
            }
            self.current_class = None;
        }
        Ok(())
    }

    // =========================================================================
    // Phase 1: built-ins
    // =========================================================================

    fn register_builtin_types(&mut self) {
        for name in ["list", "dict", "str", "Error"] {
            let mut info = ClassInfo {
                name: name.to_string(),
                ..ClassInfo::default()
            };
            match name {
                "list" => info.type_params = vec!["T".to_string()],
                "dict" => info.type_params = vec!["K".to_string(), "V".to_string()],
                _ => {}
            }
            self.classes.insert(name.to_string(), info);
        }
    }

    fn register_builtins(&mut self) {
        let sigs: &[(&str, Vec<Type>, Type)] = &[
            ("print", vec![], Type::void()),
            ("println", vec![], Type::void()),
            ("input", vec![], Type::str()),
            ("str", vec![Type::unknown()], Type::str()),
            ("int", vec![Type::unknown()], Type::int()),
            ("float", vec![Type::unknown()], Type::float()),
            ("len", vec![Type::unknown()], Type::int()),
            ("exit", vec![Type::int()], Type::void()),
        ];
        for (name, params, ret) in sigs {
            let ty = Type::function(params.clone(), ret.clone());
            self.scopes
                .define_global(Symbol::new(SymbolKind::Function, *name, ty));
        }
    }

    fn register_ffi_functions(&mut self, program: &Program) {
        for func in &program.functions {
            if let Some(ffi) = &func.ffi {
                let param_types = func
                    .params
                    .iter()
                    .map(|p| self.resolve_type(&p.ty))
                    .collect();
                let return_type = func
                    .return_type
                    .as_deref()
                    .map_or_else(Type::void, |t| self.resolve_type(t));
                self.ffi_functions.insert(
                    func.name.clone(),
                    FfiSig {
                        lib_name: ffi.lib_name.clone(),
                        signature: ffi.signature.clone(),
                        param_types,
                        return_type,
                    },
                );
            }
        }
    }

    // =========================================================================
    // Phase 2: imports
    // =========================================================================

    fn process_imports(&mut self, program: &Program) -> DropletResult<()> {
        if program.imports.is_empty() {
            return Ok(());
        }
        if self.loader.is_none() {
            return Err(self.error(format!(
                "cannot resolve import '{}': no module loader configured",
                program.imports[0].module_path
            )));
        }

        for import in &program.imports {
            let loader = self.loader.as_deref_mut().expect("checked above");
            loader.load_module(&import.module_path)?;

            // An import cycle re-entering a module whose check is still on
            // the stack is skipped; its exports splice in at the outer level.
            if loader.is_checking(&import.module_path) {
                continue;
            }

            let needs_check = loader
                .get(&import.module_path)
                .is_some_and(|m| m.type_info.is_none());
            if needs_check {
                let ast = loader
                    .get(&import.module_path)
                    .expect("just loaded")
                    .ast
                    .clone();
                loader.begin_check(&import.module_path);
                let result = TypeChecker::check(&ast, Some(loader));
                let loader = self.loader.as_deref_mut().expect("checked above");
                loader.end_check(&import.module_path);
                let info = result?;
                loader
                    .get_mut(&import.module_path)
                    .expect("just loaded")
                    .type_info = Some(info);
            }

            let loader = self.loader.as_deref_mut().expect("checked above");
            let module_info = loader
                .get(&import.module_path)
                .and_then(|m| m.type_info.clone())
                .expect("type-checked above");

            // Splice classes; already-present names are not redefined.
            for (name, class_info) in &module_info.classes {
                self.classes
                    .entry(name.clone())
                    .or_insert_with(|| class_info.clone());
            }
            // Foreign declarations travel with their module so importers
            // emit CALL_FFI for them.
            for (name, sig) in &module_info.ffi_functions {
                self.ffi_functions
                    .entry(name.clone())
                    .or_insert_with(|| sig.clone());
            }
            self.import_symbols(&module_info, import)?;
        }
        Ok(())
    }

    fn import_symbols(&mut self, module: &TypeInfo, import: &ImportDecl) -> DropletResult<()> {
        if import.is_wildcard || import.symbols.is_empty() {
            for (name, fn_type) in &module.exported_functions {
                self.scopes
                    .define_global(Symbol::new(SymbolKind::Function, name, fn_type.clone()));
            }
            return Ok(());
        }

        for symbol in &import.symbols {
            if let Some(fn_type) = module.exported_functions.get(symbol) {
                self.scopes
                    .define_global(Symbol::new(SymbolKind::Function, symbol, fn_type.clone()));
            } else if module.classes.contains_key(symbol) {
                // Classes were already spliced into the class table.
            } else {
                return Err(self.error(format!(
                    "Symbol '{}' not found in module {}",
                    symbol, import.module_path
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Phase 3: class collection
    // =========================================================================

    fn collect_class(&mut self, class: &ClassDecl) -> DropletResult<()> {
        if self.classes.contains_key(&class.name) {
            return Err(self.error(format!("Class '{}' is already defined", class.name)));
        }

        let mut info = ClassInfo {
            name: class.name.clone(),
            parent: class.parent.clone(),
            type_params: class.type_params.clone(),
            is_sealed: class.is_sealed,
            ..ClassInfo::default()
        };

        for field in &class.fields {
            if info.field(&field.name).is_some() {
                return Err(self.error(format!(
                    "Duplicate field '{}' in class '{}'",
                    field.name, class.name
                )));
            }
            let mut ty = self.resolve_type_with_generics(&field.ty, &class.type_params);
            ty.visibility = field.visibility;
            info.fields.push(FieldInfo {
                name: field.name.clone(),
                ty,
                visibility: field.visibility,
                is_static: field.is_static,
            });
        }

        for method in &class.methods {
            info.methods.insert(
                method.name.clone(),
                self.method_sig(method, &class.type_params),
            );
        }
        if let Some(ctor) = &class.constructor {
            info.constructor = Some(self.method_sig(ctor, &class.type_params));
        }

        self.classes.insert(class.name.clone(), info);
        Ok(())
    }

    fn method_sig(&self, func: &FunctionDecl, type_params: &[String]) -> MethodSig {
        let params = func
            .params
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    self.resolve_type_with_generics(&p.ty, type_params),
                )
            })
            .collect();
        let mut return_type = func
            .return_type
            .as_deref()
            .map_or_else(Type::void, |t| self.resolve_type_with_generics(t, type_params));
        if func.may_return_error {
            return_type = return_type.fallible();
        }
        MethodSig {
            name: func.name.clone(),
            params,
            return_type,
            visibility: func.visibility,
            is_static: func.is_static,
            may_return_error: func.may_return_error,
        }
    }

    fn function_type(&self, func: &FunctionDecl, type_params: &[String]) -> Type {
        let params = func
            .params
            .iter()
            .map(|p| self.resolve_type_with_generics(&p.ty, type_params))
            .collect();
        let mut ret = func
            .return_type
            .as_deref()
            .map_or_else(Type::void, |t| self.resolve_type_with_generics(t, type_params));
        if func.may_return_error {
            ret = ret.fallible();
        }
        Type::function(params, ret)
    }

    // =========================================================================
    // Phase 4: hierarchy analysis
    // =========================================================================

    fn analyze_hierarchy(&mut self) -> DropletResult<()> {
        // Cycle detection and parent validation.
        for name in self.classes.keys().cloned().collect::<Vec<_>>() {
            let mut visited: Vec<String> = Vec::new();
            let mut current = name.clone();
            loop {
                if visited.contains(&current) {
                    return Err(self.error(format!(
                        "Circular inheritance detected involving class '{name}'"
                    )));
                }
                visited.push(current.clone());

                let Some(info) = self.classes.get(&current) else {
                    break;
                };
                let Some(parent) = info.parent.clone() else {
                    break;
                };
                let Some(parent_info) = self.classes.get(&parent) else {
                    return Err(self.error(format!("Parent class '{parent}' not found")));
                };
                if parent_info.is_sealed {
                    return Err(
                        self.error(format!("Cannot inherit from sealed class '{parent}'"))
                    );
                }
                current = parent;
            }
        }

        // Field slot tables: parent slots first, then own instance fields;
        // shadowing a parent field is rejected.
        let mut memo: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for name in self.classes.keys().cloned().collect::<Vec<_>>() {
            let slots = self.compute_field_slots(&name, &mut memo)?;
            if let Some(info) = self.classes.get_mut(&name) {
                info.field_slots = slots;
            }
        }
        Ok(())
    }

    fn compute_field_slots(
        &self,
        class_name: &str,
        memo: &mut FxHashMap<String, Vec<String>>,
    ) -> DropletResult<Vec<String>> {
        if let Some(slots) = memo.get(class_name) {
            return Ok(slots.clone());
        }

        let Some(info) = self.classes.get(class_name) else {
            return Ok(Vec::new());
        };

        let mut slots = match &info.parent {
            Some(parent) => self.compute_field_slots(parent, memo)?,
            None => Vec::new(),
        };

        for field in info.instance_fields() {
            if slots.contains(&field.name) {
                return Err(self.error(format!(
                    "Field '{}' shadows parent field in class '{}'",
                    field.name, class_name
                )));
            }
            slots.push(field.name.clone());
        }

        memo.insert(class_name.to_string(), slots.clone());
        Ok(slots)
    }

    // =========================================================================
    // Phase 5: body checking
    // =========================================================================

    fn check_field_initializers(&mut self, class: &ClassDecl) -> DropletResult<()> {
        for field in &class.fields {
            if let Some(init) = &field.initializer {
                let field_type = self.resolve_type_with_generics(&field.ty, &class.type_params);
                let init_type = self.check_expr(init)?;
                if !self.is_assignable(&field_type, &init_type) {
                    return Err(self.error(format!(
                        "Field '{}' initializer type mismatch: expected {}, got {}",
                        field.name, field_type, init_type
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_function(&mut self, func: &FunctionDecl, class: Option<&ClassDecl>) -> DropletResult<()> {
        self.scopes.push();

        let type_params: &[String] = class.map_or(&[], |c| &c.type_params);
        let mut return_type = func
            .return_type
            .as_deref()
            .map_or_else(Type::void, |t| self.resolve_type_with_generics(t, type_params));
        if func.may_return_error {
            return_type = return_type.fallible();
        }
        self.current_return_type = return_type;
        self.current_may_return_error = func.may_return_error;

        // `self` is implicitly bound in non-static members (including the
        // constructor).
        if let Some(class) = class {
            if !func.is_static {
                self.scopes.define(Symbol::new(
                    SymbolKind::Parameter,
                    "self",
                    Type::object(&class.name),
                ));
            }
        }

        for param in &func.params {
            let ty = self.resolve_type_with_generics(&param.ty, type_params);
            self.scopes
                .define(Symbol::new(SymbolKind::Parameter, &param.name, ty));
        }

        if let Some(body) = &func.body {
            self.check_stmt(body)?;
        }

        self.scopes.pop();
        Ok(())
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> DropletResult<()> {
        match &stmt.kind {
            StmtKind::VarDecl {
                name,
                ty,
                initializer,
            } => self.check_var_decl(name, ty.as_deref(), initializer.as_ref()),
            StmtKind::Block(stmts) => {
                self.scopes.push();
                for s in stmts {
                    self.check_stmt(s)?;
                }
                self.scopes.pop();
                Ok(())
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.check_if(condition, then_branch, else_branch.as_deref()),
            StmtKind::While { condition, body } => {
                let cond = self.check_expr(condition)?;
                if cond.kind != TypeKind::Bool {
                    return Err(self.error(format!("While condition must be bool, got {cond}")));
                }
                self.check_stmt(body)
            }
            StmtKind::For {
                variable,
                iterable,
                body,
            } => {
                let iter_type = self.check_expr(iterable)?;
                let elem = if iter_type.kind == TypeKind::List {
                    iter_type
                        .type_params
                        .first()
                        .cloned()
                        .unwrap_or_else(Type::unknown)
                } else {
                    return Err(self.error(format!(
                        "For loop requires iterable type, got {iter_type}"
                    )));
                };
                self.scopes.push();
                self.scopes
                    .define(Symbol::new(SymbolKind::Variable, variable, elem));
                self.check_stmt(body)?;
                self.scopes.pop();
                Ok(())
            }
            StmtKind::Loop { body } => self.check_stmt(body),
            StmtKind::Return(value) => self.check_return(value.as_ref()),
            StmtKind::Break | StmtKind::Continue => Ok(()),
            StmtKind::Expr(expr) => {
                self.check_expr(expr)?;
                Ok(())
            }
        }
    }

    fn check_var_decl(
        &mut self,
        name: &str,
        ty: Option<&str>,
        initializer: Option<&Expr>,
    ) -> DropletResult<()> {
        let mut var_type = ty.map(|t| self.resolve_type(t));

        if let Some(init) = initializer {
            let init_type = self.check_expr(init)?;
            match &var_type {
                Some(declared) => {
                    if !self.is_assignable(declared, &init_type) {
                        return Err(self.error(format!(
                            "Variable '{name}' type mismatch: expected {declared}, got {init_type}"
                        )));
                    }
                    // A fallible initializer keeps its discipline even under
                    // an explicit annotation.
                    if init_type.needs_error_check() {
                        var_type = Some(declared.clone().fallible());
                    }
                }
                None => var_type = Some(init_type),
            }
        }

        let Some(var_type) = var_type else {
            return Err(self.error(format!(
                "Variable '{name}' must have type annotation or initializer"
            )));
        };

        self.scopes
            .define(Symbol::new(SymbolKind::Variable, name, var_type));
        Ok(())
    }

    fn check_if(
        &mut self,
        condition: &Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
    ) -> DropletResult<()> {
        let cond_type = self.check_expr(condition)?;
        if cond_type.kind != TypeKind::Bool {
            return Err(self.error(format!("If condition must be bool, got {cond_type}")));
        }

        // `if x is Error { ... }` narrows `x` in both branches.
        let narrowed = match &condition.kind {
            ExprKind::IsType { expr, target_type } if target_type == "Error" => {
                match &expr.kind {
                    ExprKind::Identifier(name) => Some(name.clone()),
                    _ => None,
                }
            }
            _ => None,
        };

        let fallible_binding = narrowed.as_ref().and_then(|name| {
            self.scopes
                .resolve(name)
                .filter(|s| s.ty.can_fail)
                .map(|s| s.ty.clone())
        });

        // THEN branch: the value is the Error.
        self.scopes.push();
        if let (Some(name), Some(_)) = (&narrowed, &fallible_binding) {
            self.scopes.define(Symbol::new(
                SymbolKind::Variable,
                name,
                Type::object("Error"),
            ));
        }
        self.check_stmt(then_branch)?;
        let then_returns = Self::definitely_returns(then_branch);
        self.scopes.pop();

        // ELSE branch: the value is the unwrapped success type.
        if let Some(else_branch) = else_branch {
            self.scopes.push();
            if let (Some(name), Some(orig)) = (&narrowed, &fallible_binding) {
                self.scopes
                    .define(Symbol::new(SymbolKind::Variable, name, orig.unwrapped()));
            }
            self.check_stmt(else_branch)?;
            self.scopes.pop();
        }

        // Guard pattern: a returning `is Error` branch narrows the value for
        // the rest of the enclosing scope.
        if else_branch.is_none() && then_returns {
            if let (Some(name), Some(orig)) = (&narrowed, &fallible_binding) {
                self.scopes
                    .define(Symbol::new(SymbolKind::Variable, name, orig.unwrapped()));
            }
        }
        Ok(())
    }

    fn check_return(&mut self, value: Option<&Expr>) -> DropletResult<()> {
        match value {
            Some(expr) => {
                let return_type = self.check_expr(expr)?;
                if self.is_assignable(&self.current_return_type.clone(), &return_type) {
                    return Ok(());
                }
                // A fallible function may return an Error (or subclass)
                // instance instead of the declared type.
                if self.current_may_return_error
                    && return_type.kind == TypeKind::Object
                    && (return_type.class_name == "Error"
                        || is_subclass_of(&self.classes, &return_type.class_name, "Error"))
                {
                    return Ok(());
                }
                Err(self.error(format!(
                    "Return type mismatch: expected {}, got {}",
                    self.current_return_type, return_type
                )))
            }
            None => {
                if self.current_return_type.kind != TypeKind::Void {
                    return Err(self.error(format!(
                        "Function must return {}",
                        self.current_return_type
                    )));
                }
                Ok(())
            }
        }
    }

    /// Whether a statement definitely transfers control out of the function:
    /// a `return`, an `exit(...)` call, or a block containing either.
    fn definitely_returns(stmt: &Stmt) -> bool {
        match &stmt.kind {
            StmtKind::Return(_) => true,
            StmtKind::Expr(expr) => {
                if let ExprKind::Call { callee, .. } = &expr.kind {
                    matches!(&callee.kind, ExprKind::Identifier(name) if name == "exit")
                } else {
                    false
                }
            }
            StmtKind::Block(stmts) => stmts.iter().any(Self::definitely_returns),
            _ => false,
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn check_expr(&mut self, expr: &Expr) -> DropletResult<Type> {
        let ty = match &expr.kind {
            ExprKind::Literal(lit) => Self::literal_type(lit),
            ExprKind::Identifier(name) => self.check_identifier(name)?,
            ExprKind::Binary { op, left, right } => self.check_binary(expr.id, *op, left, right)?,
            ExprKind::Unary { op, operand } => self.check_unary(expr.id, *op, operand)?,
            ExprKind::Assign { target, value } => self.check_assign(target, value)?,
            ExprKind::CompoundAssign { target, value, .. } => {
                self.check_compound_assign(target, value)?
            }
            ExprKind::Call { callee, arguments } => self.check_call(callee, arguments)?,
            ExprKind::FieldAccess { object, field } => self.check_field_access(object, field)?,
            ExprKind::Index { object, index } => self.check_index(expr.id, object, index)?,
            ExprKind::New {
                class_name,
                arguments,
                ..
            } => self.check_new(class_name, arguments)?,
            ExprKind::List(elements) => self.check_list(elements)?,
            ExprKind::Dict(pairs) => self.check_dict(pairs)?,
            ExprKind::Cast { expr, target_type } => self.check_cast(expr, target_type)?,
            ExprKind::IsType { expr, .. } => self.check_is(expr)?,
        };
        self.expr_types.insert(expr.id, ty.clone());
        Ok(ty)
    }

    fn literal_type(lit: &Literal) -> Type {
        match lit {
            Literal::Int(_) => Type::int(),
            Literal::Float(_) => Type::float(),
            Literal::Bool(_) => Type::bool(),
            Literal::Str(_) => Type::str(),
            Literal::Null => Type::null(),
        }
    }

    fn check_identifier(&mut self, name: &str) -> DropletResult<Type> {
        let Some(symbol) = self.scopes.resolve(name) else {
            return Err(self.error(format!("Undefined variable '{name}'")));
        };
        let ty = symbol.ty.clone();
        self.enforce_error_check(name, &ty)?;
        Ok(ty)
    }

    fn enforce_error_check(&self, name: &str, ty: &Type) -> DropletResult<()> {
        if self.in_is_error_check {
            return Ok(());
        }
        if ty.needs_error_check() {
            return Err(self.error(format!(
                "Cannot use a possibly failing value of type {ty} without handling the Error \
                 first. Use 'if {name} is Error {{ ... }}' to check."
            )));
        }
        Ok(())
    }

    fn check_binary(
        &mut self,
        id: ExprId,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> DropletResult<Type> {
        let left_type = self.check_expr(left)?;
        let right_type = self.check_expr(right)?;

        // Operator overloading: left operand of object type with a matching
        // canonical `op$...` method.
        if left_type.kind == TypeKind::Object {
            if let Some(name) = op.overload_name() {
                if let Some((_, sig)) = find_method(&self.classes, &left_type.class_name, name) {
                    let sig = sig.clone();
                    if sig.params.len() != 1 {
                        return Err(self.error(format!(
                            "Operator '{}' in class '{}' must have exactly one parameter",
                            name, left_type.class_name
                        )));
                    }
                    if !self.is_assignable(&sig.params[0].1, &right_type) {
                        return Err(self.error(format!(
                            "Operator '{}' expects right operand of type {}, got {}",
                            name, sig.params[0].1, right_type
                        )));
                    }
                    self.overloads.insert(id, name.to_string());
                    return Ok(sig.return_type);
                }
            }
        }

        match op {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Mul
            | BinaryOp::Div
            | BinaryOp::Mod => {
                if left_type.is_numeric() && right_type.is_numeric() {
                    if op == BinaryOp::Div {
                        // Division always yields float.
                        return Ok(Type::float());
                    }
                    return Ok(Type::promote_numeric(&left_type, &right_type));
                }
                if op == BinaryOp::Add
                    && left_type.kind == TypeKind::Str
                    && right_type.kind == TypeKind::Str
                {
                    return Ok(Type::str());
                }
                Err(self.error(format!(
                    "Invalid operands for arithmetic operation: {left_type} and {right_type}"
                )))
            }
            BinaryOp::Eq | BinaryOp::Neq => Ok(Type::bool()),
            BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte => {
                if left_type.is_numeric() && right_type.is_numeric() {
                    Ok(Type::bool())
                } else if left_type.kind == TypeKind::Str && right_type.kind == TypeKind::Str {
                    // Strings compare lexicographically at runtime.
                    Ok(Type::bool())
                } else {
                    Err(self.error(format!(
                        "Comparison operators require numeric types, got {left_type} and {right_type}"
                    )))
                }
            }
            BinaryOp::And | BinaryOp::Or => {
                if left_type.kind == TypeKind::Bool && right_type.kind == TypeKind::Bool {
                    Ok(Type::bool())
                } else {
                    Err(self.error("Logical operators require bool types".to_string()))
                }
            }
        }
    }

    fn check_unary(&mut self, id: ExprId, op: UnaryOp, operand: &Expr) -> DropletResult<Type> {
        let operand_type = self.check_expr(operand)?;
        match op {
            UnaryOp::Neg => {
                if operand_type.is_numeric() {
                    Ok(operand_type)
                } else {
                    Err(self.error("Unary negation requires numeric type".to_string()))
                }
            }
            UnaryOp::Not => {
                if operand_type.kind == TypeKind::Bool {
                    return Ok(Type::bool());
                }
                // `op$not` overload on object operands.
                if operand_type.kind == TypeKind::Object {
                    if let Some((_, sig)) =
                        find_method(&self.classes, &operand_type.class_name, "op$not")
                    {
                        let sig = sig.clone();
                        if sig.params.is_empty() {
                            self.overloads.insert(id, "op$not".to_string());
                            return Ok(sig.return_type);
                        }
                    }
                }
                Err(self.error("Logical not requires bool type".to_string()))
            }
        }
    }

    fn check_assign(&mut self, target: &Expr, value: &Expr) -> DropletResult<Type> {
        let target_type = self.check_expr(target)?;
        let value_type = self.check_expr(value)?;

        if !self.is_assignable(&target_type, &value_type) {
            return Err(self.error(format!(
                "Assignment type mismatch: cannot assign {value_type} to {target_type}"
            )));
        }
        Ok(value_type)
    }

    fn check_compound_assign(&mut self, target: &Expr, value: &Expr) -> DropletResult<Type> {
        if !matches!(
            target.kind,
            ExprKind::Identifier(_) | ExprKind::FieldAccess { .. } | ExprKind::Index { .. }
        ) {
            return Err(self.error("Invalid compound assignment target".to_string()));
        }
        let target_type = self.check_expr(target)?;
        let value_type = self.check_expr(value)?;
        if !target_type.is_numeric() || !value_type.is_numeric() {
            return Err(self.error("Compound assignment requires numeric types".to_string()));
        }
        Ok(target_type)
    }

    fn check_call(&mut self, callee: &Expr, arguments: &[Expr]) -> DropletResult<Type> {
        // Method call: obj.m(...) or ClassName.m(...).
        if let ExprKind::FieldAccess { object, field } = &callee.kind {
            // Static call: the receiver is a class name not shadowed by a
            // local binding.
            if let ExprKind::Identifier(name) = &object.kind {
                if self.classes.contains_key(name) && self.scopes.resolve(name).is_none() {
                    return self.check_static_call(name, field, arguments);
                }
            }
            return self.check_instance_call(object, field, arguments);
        }

        // Plain identifier call.
        if let ExprKind::Identifier(name) = &callee.kind {
            // Constructor call without `new`.
            if self.classes.contains_key(name) && self.scopes.resolve(name).is_none() {
                let name = name.clone();
                return self.check_new(&name, arguments);
            }

            if BUILTIN_FNS.contains(&name.as_str()) {
                return self.check_builtin_call(name, arguments);
            }

            if let Some(symbol) = self.scopes.resolve(name) {
                if symbol.kind == SymbolKind::Function && symbol.ty.kind == TypeKind::Function {
                    let fn_type = symbol.ty.clone();
                    let name = name.clone();
                    if arguments.len() != fn_type.param_types.len() {
                        return Err(self.error(format!(
                            "Function '{}' expects {} arguments, got {}",
                            name,
                            fn_type.param_types.len(),
                            arguments.len()
                        )));
                    }
                    for (i, arg) in arguments.iter().enumerate() {
                        let arg_type = self.check_expr(arg)?;
                        if !self.is_assignable(&fn_type.param_types[i], &arg_type) {
                            return Err(self.error(format!(
                                "Argument {} type mismatch in call to '{}': expected {}, got {}",
                                i + 1,
                                name,
                                fn_type.param_types[i],
                                arg_type
                            )));
                        }
                    }
                    return Ok(fn_type
                        .return_type
                        .map_or_else(Type::void, |t| *t));
                }
            }

            // Foreign functions declared with @ffi.
            if let Some(ffi) = self.ffi_functions.get(name) {
                let ffi = ffi.clone();
                if arguments.len() != ffi.param_types.len() {
                    return Err(self.error(format!(
                        "FFI function '{}' expects {} arguments, got {}",
                        name,
                        ffi.param_types.len(),
                        arguments.len()
                    )));
                }
                for (i, arg) in arguments.iter().enumerate() {
                    let arg_type = self.check_expr(arg)?;
                    if !self.is_assignable(&ffi.param_types[i], &arg_type) {
                        return Err(self.error(format!(
                            "Argument {} type mismatch in FFI call '{}'",
                            i + 1,
                            name
                        )));
                    }
                }
                return Ok(ffi.return_type);
            }

            return Err(self.error(format!("Undefined function '{name}'")));
        }

        Err(self.error("Expression is not callable".to_string()))
    }

    fn check_builtin_call(&mut self, name: &str, arguments: &[Expr]) -> DropletResult<Type> {
        for arg in arguments {
            self.check_expr(arg)?;
        }
        let (min, max): (usize, usize) = match name {
            "print" | "println" => (0, usize::MAX),
            "input" => (0, 1),
            "str" | "int" | "float" | "len" | "exit" => (1, 1),
            _ => (0, usize::MAX),
        };
        if arguments.len() < min || arguments.len() > max {
            return Err(self.error(format!(
                "Built-in '{name}' called with {} arguments",
                arguments.len()
            )));
        }
        Ok(match name {
            "input" | "str" => Type::str(),
            "int" | "len" => Type::int(),
            "float" => Type::float(),
            _ => Type::void(),
        })
    }

    fn check_static_call(
        &mut self,
        class_name: &str,
        method: &str,
        arguments: &[Expr],
    ) -> DropletResult<Type> {
        let Some((_, sig)) = find_method(&self.classes, class_name, method) else {
            return Err(self.error(format!(
                "Class '{class_name}' has no static method '{method}'"
            )));
        };
        let sig = sig.clone();

        if !sig.is_static {
            return Err(self.error(format!(
                "Cannot call non-static method '{method}' on class '{class_name}'"
            )));
        }
        self.check_method_arguments(method, &sig, arguments)?;
        Ok(sig.return_type)
    }

    fn check_instance_call(
        &mut self,
        object: &Expr,
        method: &str,
        arguments: &[Expr],
    ) -> DropletResult<Type> {
        let object_type = self.check_expr(object)?;

        if object_type.kind != TypeKind::Object {
            return Err(self.error(format!(
                "Cannot call method '{}' on non-object type {}",
                method, object_type
            )));
        }

        let Some((declaring, sig)) = find_method(&self.classes, &object_type.class_name, method)
        else {
            return Err(self.error(format!(
                "Class '{}' has no method '{}'",
                object_type.class_name, method
            )));
        };
        let sig = sig.clone();

        self.check_member_visibility(&declaring, method, sig.visibility, "method")?;
        self.check_method_arguments(method, &sig, arguments)?;
        Ok(sig.return_type)
    }

    fn check_method_arguments(
        &mut self,
        method: &str,
        sig: &MethodSig,
        arguments: &[Expr],
    ) -> DropletResult<()> {
        if arguments.len() != sig.params.len() {
            return Err(self.error(format!(
                "Method '{}' expects {} arguments, got {}",
                method,
                sig.params.len(),
                arguments.len()
            )));
        }
        for (i, arg) in arguments.iter().enumerate() {
            let arg_type = self.check_expr(arg)?;
            if !self.is_assignable(&sig.params[i].1, &arg_type) {
                return Err(self.error(format!(
                    "Argument {} type mismatch: expected {}, got {}",
                    i + 1,
                    sig.params[i].1,
                    arg_type
                )));
            }
        }
        Ok(())
    }

    fn check_member_visibility(
        &self,
        declaring_class: &str,
        member: &str,
        visibility: Visibility,
        what: &str,
    ) -> DropletResult<()> {
        match visibility {
            Visibility::Public => Ok(()),
            Visibility::Private => {
                if self.current_class.as_deref() == Some(declaring_class) {
                    Ok(())
                } else {
                    Err(self.error(format!(
                        "Private {what} '{member}' of class '{declaring_class}' is not accessible here"
                    )))
                }
            }
            Visibility::Protected => {
                let accessible = self.current_class.as_deref().is_some_and(|current| {
                    is_subclass_of(&self.classes, current, declaring_class)
                });
                if accessible {
                    Ok(())
                } else {
                    Err(self.error(format!(
                        "Protected {what} '{member}' of class '{declaring_class}' is not accessible here"
                    )))
                }
            }
        }
    }

    fn check_field_access(&mut self, object: &Expr, field: &str) -> DropletResult<Type> {
        // Static field access: ClassName.field.
        if let ExprKind::Identifier(name) = &object.kind {
            if self.classes.contains_key(name) && self.scopes.resolve(name).is_none() {
                let Some((declaring, field_info)) = find_field(&self.classes, name, field) else {
                    return Err(self.error(format!(
                        "Class '{name}' has no field or method '{field}'"
                    )));
                };
                let field_info = field_info.clone();
                if !field_info.is_static {
                    return Err(self.error(format!(
                        "Field '{field}' of class '{name}' is not static"
                    )));
                }
                self.check_member_visibility(&declaring, field, field_info.visibility, "field")?;
                return Ok(field_info.ty);
            }
        }

        let object_type = self.check_expr(object)?;

        if object_type.kind == TypeKind::Object {
            if let Some((declaring, field_info)) =
                find_field(&self.classes, &object_type.class_name, field)
            {
                let field_info = field_info.clone();
                self.check_member_visibility(&declaring, field, field_info.visibility, "field")?;
                return Ok(field_info.ty);
            }
            if let Some((declaring, sig)) =
                find_method(&self.classes, &object_type.class_name, field)
            {
                let sig = sig.clone();
                self.check_member_visibility(&declaring, field, sig.visibility, "method")?;
                // A bound-method reference.
                let params = sig.params.iter().map(|(_, t)| t.clone()).collect();
                return Ok(Type::function(params, sig.return_type));
            }
            return Err(self.error(format!(
                "Class '{}' has no field or method '{}'",
                object_type.class_name, field
            )));
        }

        // Non-object receivers have no fields; resolved permissively.
        Ok(Type::unknown())
    }

    fn check_index(&mut self, id: ExprId, object: &Expr, index: &Expr) -> DropletResult<Type> {
        let object_type = self.check_expr(object)?;
        let index_type = self.check_expr(index)?;

        match object_type.kind {
            TypeKind::List => {
                if index_type.kind != TypeKind::Int {
                    return Err(self.error("List index must be int".to_string()));
                }
                Ok(object_type
                    .type_params
                    .first()
                    .cloned()
                    .unwrap_or_else(Type::unknown))
            }
            TypeKind::Dict => {
                if !self.is_assignable(
                    object_type.type_params.first().unwrap_or(&Type::unknown()),
                    &index_type,
                ) {
                    return Err(self.error("Dict key type mismatch".to_string()));
                }
                Ok(object_type
                    .type_params
                    .get(1)
                    .cloned()
                    .unwrap_or_else(Type::unknown))
            }
            TypeKind::Object => {
                // `op$index_get` overload.
                if let Some((_, sig)) =
                    find_method(&self.classes, &object_type.class_name, "op$index_get")
                {
                    let sig = sig.clone();
                    if sig.params.len() == 1 && self.is_assignable(&sig.params[0].1, &index_type) {
                        self.overloads.insert(id, "op$index_get".to_string());
                        return Ok(sig.return_type);
                    }
                }
                Err(self.error(format!(
                    "Index operation requires list or dict type, got {object_type}"
                )))
            }
            _ => Err(self.error(format!(
                "Index operation requires list or dict type, got {object_type}"
            ))),
        }
    }

    fn check_new(&mut self, class_name: &str, arguments: &[Expr]) -> DropletResult<Type> {
        let Some(info) = self.classes.get(class_name) else {
            return Err(self.error(format!("Unknown class '{class_name}'")));
        };
        let ctor = info.constructor.clone();

        match ctor {
            Some(ctor) => {
                if arguments.len() != ctor.params.len() {
                    return Err(self.error(format!(
                        "Constructor of '{}' expects {} arguments, got {}",
                        class_name,
                        ctor.params.len(),
                        arguments.len()
                    )));
                }
                for (i, arg) in arguments.iter().enumerate() {
                    let arg_type = self.check_expr(arg)?;
                    if !self.is_assignable(&ctor.params[i].1, &arg_type) {
                        return Err(self.error(format!(
                            "Constructor argument {} type mismatch: expected {}, got {}",
                            i + 1,
                            ctor.params[i].1,
                            arg_type
                        )));
                    }
                }
            }
            None => {
                if !arguments.is_empty() {
                    return Err(self.error(format!(
                        "Class '{class_name}' has no constructor but arguments were provided"
                    )));
                }
            }
        }
        Ok(Type::object(class_name))
    }

    fn check_list(&mut self, elements: &[Expr]) -> DropletResult<Type> {
        let Some(first) = elements.first() else {
            return Ok(Type::list(Type::unknown()));
        };
        let first_type = self.check_expr(first)?;
        for element in &elements[1..] {
            let element_type = self.check_expr(element)?;
            if !element_type.same_as(&first_type) {
                return Err(self.error("List elements must have uniform type".to_string()));
            }
        }
        Ok(Type::list(first_type))
    }

    fn check_dict(&mut self, pairs: &[(Expr, Expr)]) -> DropletResult<Type> {
        let Some((first_key, first_val)) = pairs.first() else {
            return Ok(Type::dict(Type::unknown(), Type::unknown()));
        };
        let key_type = self.check_expr(first_key)?;
        let val_type = self.check_expr(first_val)?;
        for (key, value) in &pairs[1..] {
            if !self.check_expr(key)?.same_as(&key_type) {
                return Err(self.error("Dictionary keys must have uniform type".to_string()));
            }
            if !self.check_expr(value)?.same_as(&val_type) {
                return Err(self.error("Dictionary values must have uniform type".to_string()));
            }
        }
        Ok(Type::dict(key_type, val_type))
    }

    fn check_cast(&mut self, expr: &Expr, target_type: &str) -> DropletResult<Type> {
        let source = self.check_expr(expr)?;
        let target = self.resolve_type(target_type);

        if source.kind == TypeKind::Object && source.class_name != target_type {
            // Upcasts only: the target must be an ancestor.
            if !is_subclass_of(&self.classes, &source.class_name, target_type) {
                return Err(self.error(format!(
                    "Cannot convert type {} to type {}",
                    source.class_name, target_type
                )));
            }
        }
        Ok(target)
    }

    fn check_is(&mut self, expr: &Expr) -> DropletResult<Type> {
        // The tested expression is exactly the construct that performs the
        // narrowing, so fallible consumption is allowed inside it.
        let was = self.in_is_error_check;
        self.in_is_error_check = true;
        let result = self.check_expr(expr);
        self.in_is_error_check = was;
        result?;
        Ok(Type::bool())
    }

    // =========================================================================
    // Type resolution & compatibility
    // =========================================================================

    /// Resolve a written type, honoring a trailing `!`.
    fn resolve_type(&self, type_str: &str) -> Type {
        self.resolve_type_with_generics(type_str, &[])
    }

    fn resolve_type_with_generics(&self, type_str: &str, type_params: &[String]) -> Type {
        if let Some(base) = type_str.strip_suffix('!') {
            return self.resolve_type_with_generics(base, type_params).fallible();
        }

        if type_params.iter().any(|p| p == type_str) {
            return Type::generic(type_str);
        }

        match type_str {
            "int" => return Type::int(),
            "float" => return Type::float(),
            "bool" => return Type::bool(),
            "str" => return Type::str(),
            "void" => return Type::void(),
            "null" => return Type::null(),
            _ => {}
        }

        // Parametric types: list[T], dict[K,V] (possibly nested).
        if let Some(open) = type_str.find('[') {
            if let Some(close) = type_str.rfind(']') {
                let base = &type_str[..open];
                let inner = &type_str[open + 1..close];
                match base {
                    "list" => {
                        return Type::list(self.resolve_type_with_generics(inner, type_params));
                    }
                    "dict" => {
                        let (key, value) = Self::split_top_level(inner);
                        return Type::dict(
                            self.resolve_type_with_generics(key, type_params),
                            self.resolve_type_with_generics(value, type_params),
                        );
                    }
                    _ => {}
                }
            }
        }

        if self.classes.contains_key(type_str) {
            return Type::object(type_str);
        }

        Type::unknown()
    }

    /// Split `K,V` at the first comma not nested inside brackets.
    fn split_top_level(inner: &str) -> (&str, &str) {
        let mut depth = 0usize;
        for (i, c) in inner.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => return (&inner[..i], &inner[i + 1..]),
                _ => {}
            }
        }
        (inner, "")
    }

    fn is_assignable(&self, target: &Type, source: &Type) -> bool {
        // Null is assignable to any reference type.
        if source.kind == TypeKind::Null
            && matches!(
                target.kind,
                TypeKind::Object | TypeKind::List | TypeKind::Dict
            )
        {
            return true;
        }
        if target.same_as(source) {
            return true;
        }
        // Widening int -> float.
        if target.kind == TypeKind::Float && source.kind == TypeKind::Int {
            return true;
        }
        // Subclasses are assignable to their ancestors.
        if target.kind == TypeKind::Object && source.kind == TypeKind::Object {
            return is_subclass_of(&self.classes, &source.class_name, &target.class_name);
        }
        // Generic parameters and unknowns accept anything; they are
        // substituted at their use sites and cannot be checked further here.
        if matches!(target.kind, TypeKind::Generic | TypeKind::Unknown) {
            return true;
        }
        false
    }

    fn error(&self, message: String) -> DropletError {
        DropletError::type_error(message)
    }
}
