//! The Droplet type lattice.
//!
//! Types carry two orthogonal flags implementing the fallible-return
//! discipline: `can_fail` marks a value that may instead be an `Error`
//! instance, and `is_checked` is set once an `is Error` branch has narrowed
//! it. A type displays with a trailing `!` while it is fallible and
//! unchecked.

use droplet_parser::ast::Visibility;
use std::fmt;

/// The kind of a type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TypeKind {
    Int,
    Float,
    Bool,
    Str,
    Null,
    Void,
    List,
    Dict,
    Object,
    Function,
    Generic,
    Unknown,
}

/// A resolved Droplet type.
#[derive(Clone, Debug)]
pub struct Type {
    pub kind: TypeKind,
    /// Class name for `Object`, parameter name for `Generic`.
    pub class_name: String,
    /// Element types for `List` (1) and `Dict` (2).
    pub type_params: Vec<Type>,
    /// Parameter types for `Function`.
    pub param_types: Vec<Type>,
    /// Return type for `Function`.
    pub return_type: Option<Box<Type>>,
    /// The value may be an `Error` instance instead.
    pub can_fail: bool,
    /// The fallible value has been narrowed by `is Error`.
    pub is_checked: bool,
    /// Declaration visibility for field/method types.
    pub visibility: Visibility,
}

impl Type {
    fn of(kind: TypeKind) -> Self {
        Self {
            kind,
            class_name: String::new(),
            type_params: Vec::new(),
            param_types: Vec::new(),
            return_type: None,
            can_fail: false,
            is_checked: false,
            visibility: Visibility::Public,
        }
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    #[must_use]
    pub fn int() -> Self {
        Self::of(TypeKind::Int)
    }

    #[must_use]
    pub fn float() -> Self {
        Self::of(TypeKind::Float)
    }

    #[must_use]
    pub fn bool() -> Self {
        Self::of(TypeKind::Bool)
    }

    #[must_use]
    pub fn str() -> Self {
        Self::of(TypeKind::Str)
    }

    #[must_use]
    pub fn null() -> Self {
        Self::of(TypeKind::Null)
    }

    #[must_use]
    pub fn void() -> Self {
        Self::of(TypeKind::Void)
    }

    #[must_use]
    pub fn unknown() -> Self {
        Self::of(TypeKind::Unknown)
    }

    #[must_use]
    pub fn list(element: Type) -> Self {
        let mut t = Self::of(TypeKind::List);
        t.type_params.push(element);
        t
    }

    #[must_use]
    pub fn dict(key: Type, value: Type) -> Self {
        let mut t = Self::of(TypeKind::Dict);
        t.type_params.push(key);
        t.type_params.push(value);
        t
    }

    #[must_use]
    pub fn object(class_name: impl Into<String>) -> Self {
        let mut t = Self::of(TypeKind::Object);
        t.class_name = class_name.into();
        t
    }

    #[must_use]
    pub fn generic(param_name: impl Into<String>) -> Self {
        let mut t = Self::of(TypeKind::Generic);
        t.class_name = param_name.into();
        t
    }

    #[must_use]
    pub fn function(params: Vec<Type>, return_type: Type) -> Self {
        let mut t = Self::of(TypeKind::Function);
        t.param_types = params;
        t.return_type = Some(Box::new(return_type));
        t
    }

    // =========================================================================
    // Flags
    // =========================================================================

    /// Mark this type fallible (`T!`).
    #[must_use]
    pub fn fallible(mut self) -> Self {
        self.can_fail = true;
        self.is_checked = false;
        self
    }

    /// A copy narrowed to the wrapped (non-fallible) type.
    #[must_use]
    pub fn unwrapped(&self) -> Self {
        let mut t = self.clone();
        t.can_fail = false;
        t.is_checked = true;
        t
    }

    /// True while consumption of this value must be rejected.
    #[inline]
    #[must_use]
    pub fn needs_error_check(&self) -> bool {
        self.can_fail && !self.is_checked
    }

    // =========================================================================
    // Queries
    // =========================================================================

    #[inline]
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, TypeKind::Int | TypeKind::Float)
    }

    /// Structural equality ignoring the fallibility flags and visibility.
    #[must_use]
    pub fn same_as(&self, other: &Type) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            TypeKind::Object | TypeKind::Generic => self.class_name == other.class_name,
            TypeKind::List => {
                self.type_params.len() == 1
                    && other.type_params.len() == 1
                    && self.type_params[0].same_as(&other.type_params[0])
            }
            TypeKind::Dict => {
                self.type_params.len() == 2
                    && other.type_params.len() == 2
                    && self.type_params[0].same_as(&other.type_params[0])
                    && self.type_params[1].same_as(&other.type_params[1])
            }
            _ => true,
        }
    }

    /// Numeric promotion: any float operand widens the result.
    #[must_use]
    pub fn promote_numeric(a: &Type, b: &Type) -> Type {
        if a.kind == TypeKind::Float || b.kind == TypeKind::Float {
            Type::float()
        } else {
            Type::int()
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.needs_error_check() { "!" } else { "" };
        match self.kind {
            TypeKind::Int => write!(f, "int{suffix}"),
            TypeKind::Float => write!(f, "float{suffix}"),
            TypeKind::Bool => write!(f, "bool{suffix}"),
            TypeKind::Str => write!(f, "str{suffix}"),
            TypeKind::Null => write!(f, "null{suffix}"),
            TypeKind::Void => write!(f, "void{suffix}"),
            TypeKind::List => {
                let elem = self
                    .type_params
                    .first()
                    .map_or_else(|| "?".to_string(), Type::to_string);
                write!(f, "list[{elem}]{suffix}")
            }
            TypeKind::Dict => {
                if self.type_params.len() < 2 {
                    write!(f, "dict[?,?]{suffix}")
                } else {
                    write!(
                        f,
                        "dict[{},{}]{suffix}",
                        self.type_params[0], self.type_params[1]
                    )
                }
            }
            TypeKind::Object | TypeKind::Generic => write!(f, "{}{suffix}", self.class_name),
            TypeKind::Function => write!(f, "fn(...){suffix}"),
            TypeKind::Unknown => write!(f, "?{suffix}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_forms() {
        assert_eq!(Type::int().to_string(), "int");
        assert_eq!(Type::list(Type::int()).to_string(), "list[int]");
        assert_eq!(
            Type::dict(Type::str(), Type::float()).to_string(),
            "dict[str,float]"
        );
        assert_eq!(Type::object("Point").to_string(), "Point");
        assert_eq!(Type::int().fallible().to_string(), "int!");
        assert_eq!(Type::int().fallible().unwrapped().to_string(), "int");
    }

    #[test]
    fn test_same_as_ignores_flags() {
        assert!(Type::int().same_as(&Type::int().fallible()));
        assert!(!Type::int().same_as(&Type::float()));
        assert!(Type::object("A").same_as(&Type::object("A")));
        assert!(!Type::object("A").same_as(&Type::object("B")));
        assert!(Type::list(Type::int()).same_as(&Type::list(Type::int())));
        assert!(!Type::list(Type::int()).same_as(&Type::list(Type::str())));
    }

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(
            Type::promote_numeric(&Type::int(), &Type::int()).kind,
            TypeKind::Int
        );
        assert_eq!(
            Type::promote_numeric(&Type::int(), &Type::float()).kind,
            TypeKind::Float
        );
        assert_eq!(
            Type::promote_numeric(&Type::float(), &Type::int()).kind,
            TypeKind::Float
        );
    }

    #[test]
    fn test_needs_error_check_transitions() {
        let t = Type::int().fallible();
        assert!(t.needs_error_check());
        assert!(!t.unwrapped().needs_error_check());
        assert!(!Type::int().needs_error_check());
    }
}
