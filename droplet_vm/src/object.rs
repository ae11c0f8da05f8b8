//! Heap object model.
//!
//! Every GC-managed object is one variant of [`HeapObject`]; references
//! between objects are [`ObjRef`] handles stored inside [`Value`]s. An
//! object exposes its reachable children through [`HeapObject::for_each_child`],
//! which the mark phase drives.

use droplet_core::Value;
use rustc_hash::FxHashMap;

/// A garbage-collected heap object.
#[derive(Clone, Debug)]
pub enum HeapObject {
    /// UTF-8 string.
    Str(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed mapping.
    Map(FxHashMap<String, Value>),
    /// Class instance: class-name tag plus name-keyed field table.
    Instance {
        class_name: String,
        fields: FxHashMap<String, Value>,
    },
    /// A first-class handle to a function-table entry.
    FunctionHandle(u32),
    /// A method bound to a receiver.
    BoundMethod { receiver: Value, method: u32 },
}

impl HeapObject {
    /// Visit every value directly reachable from this object.
    pub fn for_each_child(&self, mut visit: impl FnMut(Value)) {
        match self {
            Self::Str(_) | Self::FunctionHandle(_) => {}
            Self::Array(items) => {
                for item in items {
                    visit(*item);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    visit(*value);
                }
            }
            Self::Instance { fields, .. } => {
                for value in fields.values() {
                    visit(*value);
                }
            }
            Self::BoundMethod { receiver, .. } => visit(*receiver),
        }
    }

    /// Short tag used in diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Instance { .. } => "instance",
            Self::FunctionHandle(_) => "function",
            Self::BoundMethod { .. } => "bound method",
        }
    }

    /// Borrow the string payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the array payload, if this is an array.
    #[must_use]
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }
}
