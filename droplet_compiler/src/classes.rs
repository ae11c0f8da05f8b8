//! Class table: per-class metadata collected by the type checker.
//!
//! Field declaration order matters — the slot table lists inherited fields
//! first, then the class's own, and that ordering is an invariant both the
//! checker and constructor codegen rely on — so fields are kept in a `Vec`
//! rather than a map.

use crate::types::Type;
use droplet_parser::ast::Visibility;
use rustc_hash::FxHashMap;

/// One declared field.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub name: String,
    pub ty: Type,
    pub visibility: Visibility,
    pub is_static: bool,
}

/// A method or constructor signature as the checker sees it.
#[derive(Clone, Debug)]
pub struct MethodSig {
    pub name: String,
    /// Parameter names with resolved types (generic params stay `Generic`).
    pub params: Vec<(String, Type)>,
    pub return_type: Type,
    pub visibility: Visibility,
    pub is_static: bool,
    pub may_return_error: bool,
}

/// Everything the compiler knows about one class.
#[derive(Clone, Debug, Default)]
pub struct ClassInfo {
    pub name: String,
    pub parent: Option<String>,
    pub type_params: Vec<String>,
    /// Own fields in declaration order (statics included, flagged).
    pub fields: Vec<FieldInfo>,
    pub methods: FxHashMap<String, MethodSig>,
    pub constructor: Option<MethodSig>,
    pub is_sealed: bool,
    /// Ordered instance-field slot table: parent slots first, then own.
    /// Filled by hierarchy analysis.
    pub field_slots: Vec<String>,
}

impl ClassInfo {
    /// Look up an own field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Own instance (non-static) fields in declaration order.
    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| !f.is_static)
    }

    /// Total instance-field count including inherited slots.
    #[must_use]
    pub fn total_field_count(&self) -> usize {
        self.field_slots.len()
    }

    /// The slot index of an instance field, inherited slots included.
    #[must_use]
    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.field_slots.iter().position(|f| f == name)
    }
}

/// The class table.
pub type ClassTable = FxHashMap<String, ClassInfo>;

/// Whether `child` names `ancestor` or transitively inherits from it.
/// A cycle in the parent chain terminates the walk (cycles are rejected
/// earlier by hierarchy analysis).
#[must_use]
pub fn is_subclass_of(classes: &ClassTable, child: &str, ancestor: &str) -> bool {
    let mut current = child.to_string();
    let mut hops = 0usize;
    loop {
        if current == ancestor {
            return true;
        }
        let Some(info) = classes.get(&current) else {
            return false;
        };
        let Some(parent) = &info.parent else {
            return false;
        };
        current = parent.clone();
        hops += 1;
        if hops > classes.len() {
            return false;
        }
    }
}

/// Find the class in `class_name`'s hierarchy (itself first) that declares
/// `method`, returning the declaring class name and the signature.
#[must_use]
pub fn find_method<'a>(
    classes: &'a ClassTable,
    class_name: &str,
    method: &str,
) -> Option<(String, &'a MethodSig)> {
    let mut current = class_name.to_string();
    let mut hops = 0usize;
    loop {
        let info = classes.get(&current)?;
        if let Some(sig) = info.methods.get(method) {
            return Some((current, sig));
        }
        let parent = info.parent.clone()?;
        current = parent;
        hops += 1;
        if hops > classes.len() {
            return None;
        }
    }
}

/// Find the class in `class_name`'s hierarchy (itself first) that declares
/// `field`, returning the declaring class name and the field info.
#[must_use]
pub fn find_field<'a>(
    classes: &'a ClassTable,
    class_name: &str,
    field: &str,
) -> Option<(String, &'a FieldInfo)> {
    let mut current = class_name.to_string();
    let mut hops = 0usize;
    loop {
        let info = classes.get(&current)?;
        if let Some(f) = info.field(field) {
            return Some((current, f));
        }
        let parent = info.parent.clone()?;
        current = parent;
        hops += 1;
        if hops > classes.len() {
            return None;
        }
    }
}
