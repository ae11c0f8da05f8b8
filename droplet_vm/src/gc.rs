//! Mark-sweep garbage collector.
//!
//! The heap is a slot arena: objects live in `Vec<Option<Slot>>` and are
//! addressed by stable [`ObjRef`] indices; swept slots go on a free list and
//! are reused by later allocations. Collection is stop-the-world: the VM
//! walks its roots (operand stack below `sp`, plus globals) through
//! [`Heap::mark_value`], then [`Heap::sweep`] reclaims everything unmarked.
//! Marking is idempotent, so cyclic object graphs terminate.

use crate::object::HeapObject;
use droplet_core::{ObjRef, Value};

/// Default live-object count that triggers a collection.
pub const DEFAULT_GC_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Slot {
    marked: bool,
    object: HeapObject,
}

/// The object heap.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
    initial_threshold: usize,
    threshold: usize,
}

impl Heap {
    /// Create a heap with the default collection threshold.
    #[must_use]
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    /// Create a heap that collects once the live count exceeds `threshold`.
    #[must_use]
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            initial_threshold: threshold,
            threshold,
        }
    }

    // =========================================================================
    // Allocation and access
    // =========================================================================

    /// Allocate an object, reusing a swept slot when one is free.
    pub fn alloc(&mut self, object: HeapObject) -> ObjRef {
        self.live += 1;
        let slot = Slot {
            marked: false,
            object,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::new(index)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Some(slot));
                ObjRef::new(index)
            }
        }
    }

    /// Borrow an object.
    #[must_use]
    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        self.slots
            .get(r.index())
            .and_then(Option::as_ref)
            .map(|slot| &slot.object)
    }

    /// Borrow an object mutably.
    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        self.slots
            .get_mut(r.index())
            .and_then(Option::as_mut)
            .map(|slot| &mut slot.object)
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Whether the live count has crossed the collection threshold.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.live > self.threshold
    }

    /// The current collection threshold.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Mark the object graph reachable from one root value. Idempotent: an
    /// already-marked object is not revisited, so cycles terminate.
    pub fn mark_value(&mut self, value: Value) {
        let Some(root) = value.as_object() else {
            return;
        };
        let mut worklist = vec![root];
        while let Some(r) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(r.index()).and_then(Option::as_mut) else {
                continue;
            };
            if slot.marked {
                continue;
            }
            slot.marked = true;
            slot.object.for_each_child(|child| {
                if let Some(child_ref) = child.as_object() {
                    worklist.push(child_ref);
                }
            });
        }
    }

    /// Reclaim every unmarked object, clear surviving marks, and retune the
    /// threshold to `max(initial, 2 × live)`.
    pub fn sweep(&mut self) {
        let mut live = 0usize;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => {
                    slot.marked = false;
                    live += 1;
                }
                Some(_) => {
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.live = live;
        self.threshold = self.initial_threshold.max(live * 2);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn test_alloc_and_get() {
        let mut heap = Heap::new();
        let r = heap.alloc(HeapObject::Str("hello".into()));
        assert_eq!(heap.get(r).and_then(HeapObject::as_str), Some("hello"));
        assert_eq!(heap.live_count(), 1);
    }

    #[test]
    fn test_unreachable_object_is_reclaimed() {
        let mut heap = Heap::new();
        let _garbage = heap.alloc(HeapObject::Str("garbage".into()));
        heap.sweep();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_reachable_object_survives() {
        let mut heap = Heap::new();
        let keep = heap.alloc(HeapObject::Str("keep".into()));
        let _garbage = heap.alloc(HeapObject::Str("drop".into()));

        heap.mark_value(Value::object(keep));
        heap.sweep();

        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.get(keep).and_then(HeapObject::as_str), Some("keep"));
    }

    #[test]
    fn test_children_are_traced_through_arrays() {
        let mut heap = Heap::new();
        let inner = heap.alloc(HeapObject::Str("inner".into()));
        let arr = heap.alloc(HeapObject::Array(vec![Value::object(inner)]));

        heap.mark_value(Value::object(arr));
        heap.sweep();

        assert_eq!(heap.live_count(), 2);
        assert!(heap.get(inner).is_some());
    }

    #[test]
    fn test_cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapObject::Array(vec![]));
        let b = heap.alloc(HeapObject::Array(vec![Value::object(a)]));
        if let Some(HeapObject::Array(items)) = heap.get_mut(a) {
            items.push(Value::object(b));
        }

        // Nothing roots the cycle: both members must be reclaimed.
        heap.sweep();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cycle_survives_when_rooted() {
        let mut heap = Heap::new();
        let a = heap.alloc(HeapObject::Array(vec![]));
        let b = heap.alloc(HeapObject::Array(vec![Value::object(a)]));
        if let Some(HeapObject::Array(items)) = heap.get_mut(a) {
            items.push(Value::object(b));
        }

        heap.mark_value(Value::object(a));
        heap.sweep();
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn test_slots_are_reused_after_sweep() {
        let mut heap = Heap::new();
        let first = heap.alloc(HeapObject::Str("one".into()));
        heap.sweep();
        let second = heap.alloc(HeapObject::Str("two".into()));
        assert_eq!(first, second, "freed slot should be reused");
    }

    #[test]
    fn test_marks_cleared_after_sweep() {
        let mut heap = Heap::new();
        let r = heap.alloc(HeapObject::Str("x".into()));
        heap.mark_value(Value::object(r));
        heap.sweep();
        // A second unrooted sweep must now reclaim it.
        heap.sweep();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_threshold_retunes_after_collection() {
        let mut heap = Heap::with_threshold(4);
        let mut roots = Vec::new();
        for i in 0..6 {
            roots.push(heap.alloc(HeapObject::Str(format!("s{i}"))));
        }
        assert!(heap.should_collect());
        for r in &roots {
            heap.mark_value(Value::object(*r));
        }
        heap.sweep();
        assert_eq!(heap.threshold(), 12);
        assert!(!heap.should_collect());
    }

    #[test]
    fn test_instance_fields_traced() {
        let mut heap = Heap::new();
        let name = heap.alloc(HeapObject::Str("field value".into()));
        let mut fields = FxHashMap::default();
        fields.insert("f".to_string(), Value::object(name));
        let inst = heap.alloc(HeapObject::Instance {
            class_name: "C".into(),
            fields,
        });

        heap.mark_value(Value::object(inst));
        heap.sweep();
        assert_eq!(heap.live_count(), 2);
    }
}
