//! Lexical scopes for the type checker.
//!
//! Scopes are a stack of hash maps owned by the checker; entering a block
//! pushes, leaving pops. Resolution walks from the innermost scope outward.
//! `define` overwrites within the current scope, which is how `is Error`
//! narrowing installs a refined binding that shadows the outer one.

use crate::types::Type;
use droplet_parser::ast::Visibility;
use rustc_hash::FxHashMap;

/// What a name refers to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SymbolKind {
    Variable,
    Function,
    Class,
    Field,
    Method,
    Parameter,
}

/// A resolved name.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub ty: Type,
    pub visibility: Visibility,
}

impl Symbol {
    /// Create a symbol with public visibility.
    #[must_use]
    pub fn new(kind: SymbolKind, name: impl Into<String>, ty: Type) -> Self {
        Self {
            kind,
            name: name.into(),
            ty,
            visibility: Visibility::Public,
        }
    }
}

/// The scope stack. Index 0 is the global scope and is never popped.
#[derive(Debug)]
pub struct ScopeStack {
    scopes: Vec<FxHashMap<String, Symbol>>,
}

impl ScopeStack {
    /// Create a stack containing only the global scope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            scopes: vec![FxHashMap::default()],
        }
    }

    /// Enter a nested scope.
    pub fn push(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    /// Leave the innermost scope. The global scope is kept.
    pub fn pop(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Define (or overwrite) a symbol in the innermost scope.
    pub fn define(&mut self, symbol: Symbol) {
        let top = self.scopes.last_mut().expect("global scope always present");
        top.insert(symbol.name.clone(), symbol);
    }

    /// Define a symbol in the global scope regardless of nesting.
    pub fn define_global(&mut self, symbol: Symbol) {
        self.scopes[0].insert(symbol.name.clone(), symbol);
    }

    /// Resolve a name, innermost scope first.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// Resolve a name skipping the innermost scope (the enclosing binding).
    #[must_use]
    pub fn resolve_enclosing(&self, name: &str) -> Option<&Symbol> {
        self.scopes
            .iter()
            .rev()
            .skip(1)
            .find_map(|scope| scope.get(name))
    }

    /// Whether the innermost scope defines this name directly.
    #[must_use]
    pub fn has_local(&self, name: &str) -> bool {
        self.scopes
            .last()
            .is_some_and(|scope| scope.contains_key(name))
    }

    /// Current nesting depth (1 = global only).
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str, ty: Type) -> Symbol {
        Symbol::new(SymbolKind::Variable, name, ty)
    }

    #[test]
    fn test_resolution_climbs_scopes() {
        let mut scopes = ScopeStack::new();
        scopes.define(var("x", Type::int()));
        scopes.push();
        scopes.define(var("y", Type::str()));

        assert!(scopes.resolve("x").is_some());
        assert!(scopes.resolve("y").is_some());
        scopes.pop();
        assert!(scopes.resolve("y").is_none());
    }

    #[test]
    fn test_shadowing_in_inner_scope() {
        let mut scopes = ScopeStack::new();
        scopes.define(var("v", Type::int().fallible()));
        scopes.push();
        scopes.define(var("v", Type::int()));

        assert!(!scopes.resolve("v").unwrap().ty.needs_error_check());
        assert!(scopes
            .resolve_enclosing("v")
            .unwrap()
            .ty
            .needs_error_check());
        scopes.pop();
        assert!(scopes.resolve("v").unwrap().ty.needs_error_check());
    }

    #[test]
    fn test_define_overwrites_current_scope() {
        let mut scopes = ScopeStack::new();
        scopes.define(var("n", Type::int()));
        scopes.define(var("n", Type::float()));
        assert!(scopes.resolve("n").unwrap().ty.same_as(&Type::float()));
    }

    #[test]
    fn test_global_scope_survives_pop() {
        let mut scopes = ScopeStack::new();
        scopes.pop();
        scopes.define(var("g", Type::bool()));
        assert!(scopes.resolve("g").is_some());
        assert_eq!(scopes.depth(), 1);
    }

    #[test]
    fn test_define_global_from_nested_scope() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        scopes.define_global(var("f", Type::function(vec![], Type::void())));
        scopes.pop();
        assert!(scopes.resolve("f").is_some());
    }
}
