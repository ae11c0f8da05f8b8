//! Module resolution and caching.
//!
//! A dotted module path `a.b.c` maps to the relative path `a/b/c.drop`,
//! searched under an ordered list of roots (by default the current directory
//! and a project-local `.dp_modules` folder) with a bounded recursive
//! traversal. Each module is parsed at most once per process; recursive
//! import graphs terminate because a module is registered before its own
//! imports are loaded. Failed resolution or parsing never leaves partial
//! state in the cache.

use crate::typechecker::TypeInfo;
use droplet_core::{DropletError, DropletResult};
use droplet_parser::ast::Program;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory depth limit for the recursive search under each root.
const MAX_SEARCH_DEPTH: usize = 8;

/// A loaded module.
#[derive(Debug)]
pub struct ModuleInfo {
    /// Dotted module path, e.g. `std.collections`.
    pub module_path: String,
    /// Resolved source file.
    pub file_path: PathBuf,
    /// Parsed AST.
    pub ast: Program,
    /// Where compiled bytecode for this module would land.
    pub dbc_path: PathBuf,
    /// Names of top-level functions this module exports.
    pub exported_functions: Vec<String>,
    /// Names of classes this module exports.
    pub exported_classes: Vec<String>,
    /// Cached type-check result; filled on first import.
    pub type_info: Option<TypeInfo>,
}

/// Resolves, parses, and memoizes modules.
#[derive(Debug)]
pub struct ModuleLoader {
    search_paths: Vec<PathBuf>,
    /// Loaded modules in deterministic (sorted) order for stable codegen.
    modules: BTreeMap<String, ModuleInfo>,
    /// Modules currently being type-checked; guards against import cycles
    /// re-entering an unfinished check.
    in_check: Vec<String>,
}

impl ModuleLoader {
    /// Create a loader with the default search roots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            search_paths: vec![PathBuf::from("."), PathBuf::from("./.dp_modules")],
            modules: BTreeMap::new(),
            in_check: Vec::new(),
        }
    }

    /// Append a search root; roots are probed in insertion order.
    pub fn add_search_path(&mut self, path: impl Into<PathBuf>) {
        self.search_paths.push(path.into());
    }

    /// Whether a module is already in the cache.
    #[must_use]
    pub fn is_loaded(&self, module_path: &str) -> bool {
        self.modules.contains_key(module_path)
    }

    /// Get a loaded module.
    #[must_use]
    pub fn get(&self, module_path: &str) -> Option<&ModuleInfo> {
        self.modules.get(module_path)
    }

    /// Get a loaded module mutably.
    pub fn get_mut(&mut self, module_path: &str) -> Option<&mut ModuleInfo> {
        self.modules.get_mut(module_path)
    }

    /// All loaded modules in sorted order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }

    // =========================================================================
    // Type-check re-entrancy guard
    // =========================================================================

    /// Mark a module as being type-checked.
    pub fn begin_check(&mut self, module_path: &str) {
        self.in_check.push(module_path.to_string());
    }

    /// Unmark after its check finishes.
    pub fn end_check(&mut self, module_path: &str) {
        if let Some(pos) = self.in_check.iter().position(|m| m == module_path) {
            self.in_check.remove(pos);
        }
    }

    /// Whether the module's check is currently on the stack.
    #[must_use]
    pub fn is_checking(&self, module_path: &str) -> bool {
        self.in_check.iter().any(|m| m == module_path)
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Load a module (and, transitively, its imports). Returns the cached
    /// entry if the module was loaded before.
    pub fn load_module(&mut self, module_path: &str) -> DropletResult<&ModuleInfo> {
        if self.modules.contains_key(module_path) {
            return Ok(&self.modules[module_path]);
        }

        let file_path = self.resolve_module_path(module_path).ok_or_else(|| {
            DropletError::module(format!(
                "module '{module_path}' not found in search paths {:?}",
                self.search_paths
            ))
        })?;

        let source = std::fs::read_to_string(&file_path)?;
        let ast = droplet_parser::parse(&source).map_err(|e| {
            DropletError::module(format!(
                "failed to parse module '{module_path}' ({}): {e}",
                file_path.display()
            ))
        })?;

        let exported_functions = ast.functions.iter().map(|f| f.name.clone()).collect();
        let exported_classes = ast.classes.iter().map(|c| c.name.clone()).collect();
        let dbc_path = file_path.with_extension("dbc");

        let import_paths: Vec<String> =
            ast.imports.iter().map(|i| i.module_path.clone()).collect();

        self.modules.insert(
            module_path.to_string(),
            ModuleInfo {
                module_path: module_path.to_string(),
                file_path,
                ast,
                dbc_path,
                exported_functions,
                exported_classes,
                type_info: None,
            },
        );

        // Recursively load this module's own imports. The entry above is
        // already registered, so cyclic graphs terminate.
        for import in import_paths {
            self.load_module(&import)?;
        }

        Ok(&self.modules[module_path])
    }

    /// Map `a.b.c` to the first `a/b/c.drop` found under the search roots.
    #[must_use]
    pub fn resolve_module_path(&self, module_path: &str) -> Option<PathBuf> {
        let relative = Self::module_path_to_relative(module_path);

        for root in &self.search_paths {
            if !root.exists() {
                continue;
            }
            if let Some(found) = Self::find_under(root, &relative, MAX_SEARCH_DEPTH) {
                return Some(found);
            }
        }
        None
    }

    fn module_path_to_relative(module_path: &str) -> PathBuf {
        let mut rel = PathBuf::new();
        for part in module_path.split('.') {
            rel.push(part);
        }
        rel.set_extension("drop");
        rel
    }

    fn find_under(dir: &Path, relative: &Path, depth: usize) -> Option<PathBuf> {
        let candidate = dir.join(relative);
        if candidate.is_file() {
            return Some(candidate);
        }
        if depth == 0 {
            return None;
        }
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if let Some(found) = Self::find_under(&path, relative, depth - 1) {
                    return Some(found);
                }
            }
        }
        None
    }
}

impl Default for ModuleLoader {
    fn default() -> Self {
        Self::new()
    }
}
