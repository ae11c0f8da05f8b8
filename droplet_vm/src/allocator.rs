//! Typed allocation facade over the GC heap.
//!
//! VM operations allocate through these constructors rather than touching
//! the heap directly; the allocator also owns the collect-if-needed
//! safepoint check that runs at the top of every dispatch.

use crate::gc::Heap;
use crate::object::HeapObject;
use crate::stack::OperandStack;
use droplet_core::{ObjRef, Value};
use rustc_hash::FxHashMap;

/// Allocator wrapping the mark-sweep heap.
#[derive(Debug, Default)]
pub struct Allocator {
    heap: Heap,
}

impl Allocator {
    /// Create an allocator with the default GC threshold.
    #[must_use]
    pub fn new() -> Self {
        Self { heap: Heap::new() }
    }

    /// Create an allocator collecting above the given live-object count.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            heap: Heap::with_threshold(threshold),
        }
    }

    /// Direct heap access.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Direct mutable heap access.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // =========================================================================
    // Constructors
    // =========================================================================

    /// Allocate a string object.
    pub fn alloc_string(&mut self, s: impl Into<String>) -> ObjRef {
        self.heap.alloc(HeapObject::Str(s.into()))
    }

    /// Allocate an empty array.
    pub fn alloc_array(&mut self) -> ObjRef {
        self.heap.alloc(HeapObject::Array(Vec::new()))
    }

    /// Allocate an empty map.
    pub fn alloc_map(&mut self) -> ObjRef {
        self.heap.alloc(HeapObject::Map(FxHashMap::default()))
    }

    /// Allocate an instance with an empty field table.
    pub fn alloc_instance(&mut self, class_name: impl Into<String>) -> ObjRef {
        self.heap.alloc(HeapObject::Instance {
            class_name: class_name.into(),
            fields: FxHashMap::default(),
        })
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Safepoint check: collect when the live count exceeds the threshold.
    /// Roots are every stack slot below `sp` (which covers all frames'
    /// locals) plus every global and loaded constant.
    pub fn collect_if_needed(
        &mut self,
        stack: &OperandStack,
        globals: &FxHashMap<String, Value>,
        constants: &[Value],
    ) {
        if self.heap.should_collect() {
            self.collect(stack, globals, constants);
        }
    }

    /// Run one full mark-sweep cycle.
    pub fn collect(
        &mut self,
        stack: &OperandStack,
        globals: &FxHashMap<String, Value>,
        constants: &[Value],
    ) {
        for value in stack.live_slots() {
            self.heap.mark_value(*value);
        }
        for value in globals.values() {
            self.heap.mark_value(*value);
        }
        for value in constants {
            self.heap.mark_value(*value);
        }
        self.heap.sweep();
    }
}
