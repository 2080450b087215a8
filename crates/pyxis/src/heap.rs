//! The managed heap: a two-tier allocator under a tracing mark-sweep
//! collector.
//!
//! Objects live in a slot arena. Slots whose payload estimate fits a
//! small-object cell are recycled through [`MultiPool`], a set of per-size-
//! class freelists; larger objects are tracked on a flat large-object list.
//! Collection is mark-sweep: the VM enumerates roots, children are traced
//! through [`ObjPayload::trace`] plus any per-type `gc_mark` hook, and
//! unmarked objects are finalised by their type's destructor and returned
//! to the pool.
//!
//! Collection never runs while the GC lock counter is non-zero; the lock
//! spans windows where freshly built objects are not yet reachable from a
//! root.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::{
    object::{NameDict, ObjPayload},
    types::{TypeId, TypeTable},
    value::{HeapId, Value},
};

/// Payload estimates at or below this use the small-object pool.
pub const SMALL_CELL_SIZE: usize = 128;

/// Collection threshold floor, in allocations.
pub const GC_MIN_THRESHOLD: usize = 16384;

const POOL_CLASSES: usize = 4;

/// A heap object: fixed header plus payload.
#[derive(Debug)]
pub struct HeapObject {
    /// Duplicated in every boxed handle pointing here; the two always
    /// agree.
    pub type_id: TypeId,
    pub is_large: bool,
    pub gc_marked: bool,
    /// Per-instance attribute dictionary; absent for sealed built-ins.
    pub attrs: Option<Box<NameDict>>,
    pub payload: ObjPayload,
}

/// Per-size-class freelists for small-object slots.
///
/// Slot storage is uniform, so a freed slot could serve any allocation;
/// the classes keep reuse size-local so churn in one size band does not
/// fragment the others.
#[derive(Debug, Default)]
struct MultiPool {
    free: [Vec<u32>; POOL_CLASSES],
}

impl MultiPool {
    /// Size class of a payload estimate (32-byte bands).
    fn class_of(size: usize) -> usize {
        (size.saturating_sub(1) / 32).min(POOL_CLASSES - 1)
    }

    fn take(&mut self, class: usize) -> Option<u32> {
        if let Some(idx) = self.free[class].pop() {
            return Some(idx);
        }
        // any free cell can hold any small payload
        self.free.iter_mut().find_map(Vec::pop)
    }

    fn release(&mut self, class: usize, idx: u32) {
        self.free[class].push(idx);
    }

    fn len(&self) -> usize {
        self.free.iter().map(Vec::len).sum()
    }
}

/// Snapshot of heap state, for the `gc` module and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Live objects on the heap.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Live objects on the large-object list.
    pub large_objects: usize,
    /// Live object counts by payload shape.
    pub objects_by_type: BTreeMap<&'static str, usize>,
}

/// The managed heap.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    pool: MultiPool,
    /// Freed slots that last held a large object.
    large_free: Vec<u32>,
    /// Live large-object slot indices, rebuilt at each sweep.
    large_list: Vec<u32>,
    live_count: usize,
    gc_counter: usize,
    gc_threshold: usize,
    gc_lock: usize,
    /// Objects protected from collection regardless of reachability.
    no_gc: Vec<HeapId>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            pool: MultiPool::default(),
            large_free: Vec::new(),
            large_list: Vec::new(),
            live_count: 0,
            gc_counter: 0,
            gc_threshold: GC_MIN_THRESHOLD,
            gc_lock: 0,
            no_gc: Vec::new(),
        }
    }

    /// Allocates an object with no attribute dictionary.
    pub fn alloc(&mut self, type_id: TypeId, payload: ObjPayload) -> HeapId {
        self.alloc_inner(type_id, payload, None)
    }

    /// Allocates an object with an (initially empty) attribute dictionary.
    pub fn alloc_with_attrs(&mut self, type_id: TypeId, payload: ObjPayload) -> HeapId {
        self.alloc_inner(type_id, payload, Some(Box::new(NameDict::new())))
    }

    fn alloc_inner(&mut self, type_id: TypeId, payload: ObjPayload, attrs: Option<Box<NameDict>>) -> HeapId {
        let size = payload.estimate_size();
        let is_large = size > SMALL_CELL_SIZE;
        let obj = HeapObject {
            type_id,
            is_large,
            gc_marked: false,
            attrs,
            payload,
        };

        let idx = if is_large {
            self.large_free.pop()
        } else {
            self.pool.take(MultiPool::class_of(size))
        };
        let idx = match idx {
            Some(free) => {
                debug_assert!(self.slots[free as usize].is_none());
                self.slots[free as usize] = Some(obj);
                free as usize
            }
            None => {
                self.slots.push(Some(obj));
                self.slots.len() - 1
            }
        };
        if is_large {
            self.large_list.push(u32::try_from(idx).expect("heap slot exceeds u32"));
        }
        self.live_count += 1;
        self.gc_counter += 1;
        HeapId::from_index(idx)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapObject {
        self.slots[id.index()].as_ref().expect("dangling heap handle")
    }

    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapObject {
        self.slots[id.index()].as_mut().expect("dangling heap handle")
    }

    #[inline]
    #[must_use]
    pub fn payload(&self, id: HeapId) -> &ObjPayload {
        &self.get(id).payload
    }

    #[inline]
    pub fn payload_mut(&mut self, id: HeapId) -> &mut ObjPayload {
        &mut self.get_mut(id).payload
    }

    /// The object's attribute dictionary, if it has one.
    #[must_use]
    pub fn attrs(&self, id: HeapId) -> Option<&NameDict> {
        self.get(id).attrs.as_deref()
    }

    /// The attribute dictionary, created on first use.
    pub fn attrs_mut(&mut self, id: HeapId) -> &mut NameDict {
        self.get_mut(id).attrs.get_or_insert_with(|| Box::new(NameDict::new()))
    }

    /// True when the allocation counter has reached the threshold and the
    /// GC lock is free.
    #[must_use]
    pub fn should_gc(&self) -> bool {
        self.gc_counter >= self.gc_threshold && self.gc_lock == 0
    }

    /// Defers collection until the matching [`Self::unlock_gc`].
    pub fn lock_gc(&mut self) {
        self.gc_lock += 1;
    }

    pub fn unlock_gc(&mut self) {
        debug_assert!(self.gc_lock > 0, "unbalanced GC unlock");
        self.gc_lock -= 1;
    }

    /// Protects an object from collection for the heap's lifetime.
    pub fn push_no_gc(&mut self, id: HeapId) {
        self.no_gc.push(id);
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Allocations since the last collection.
    #[must_use]
    pub fn allocations_since_gc(&self) -> usize {
        self.gc_counter
    }

    /// Runs a full mark-sweep collection and returns the number of objects
    /// freed. `roots` must enumerate every root value: the VM passes its
    /// frames, stack window, registry, retval, exception and type table.
    ///
    /// # Panics
    ///
    /// Panics when invoked while the GC lock is held; callers gate on
    /// [`Self::should_gc`] or release the lock first.
    pub fn collect(&mut self, types: &TypeTable, roots: impl FnOnce(&mut dyn FnMut(Value))) -> usize {
        assert_eq!(self.gc_lock, 0, "collection under GC lock");
        self.mark(types, roots);
        let freed = self.sweep(types);
        self.gc_counter = 0;
        self.gc_threshold = (self.live_count * 2).max(GC_MIN_THRESHOLD);
        freed
    }

    fn mark(&mut self, types: &TypeTable, roots: impl FnOnce(&mut dyn FnMut(Value))) {
        let mut worklist: Vec<HeapId> = Vec::new();

        let mut root_values: Vec<Value> = Vec::new();
        roots(&mut |v| root_values.push(v));
        for v in root_values {
            self.mark_one(v, &mut worklist);
        }
        for i in 0..self.no_gc.len() {
            let id = self.no_gc[i];
            self.mark_one(Value::Boxed(self.get(id).type_id, id), &mut worklist);
        }

        while let Some(id) = worklist.pop() {
            // Children are gathered before marking them: marking mutates
            // slot headers, which cannot alias the payload borrow.
            let mut children: SmallVec<[Value; 16]> = SmallVec::new();
            {
                let obj = self.get(id);
                obj.payload.trace(&mut |v| children.push(v));
                if let Some(attrs) = &obj.attrs {
                    for (_, v) in attrs.iter() {
                        children.push(v);
                    }
                }
                if let Some(hook) = types.get(obj.type_id).gc_mark {
                    hook(&obj.payload, &mut |v| children.push(v));
                }
            }
            for v in children {
                self.mark_one(v, &mut worklist);
            }
        }
    }

    /// Marks a single value, queueing its object for tracing if it was
    /// unmarked. Idempotent.
    fn mark_one(&mut self, v: Value, worklist: &mut Vec<HeapId>) {
        if let Value::Boxed(type_id, id) = v {
            let obj = self.get_mut(id);
            debug_assert_eq!(obj.type_id, type_id, "boxed tag disagrees with heap header");
            if !obj.gc_marked {
                obj.gc_marked = true;
                worklist.push(id);
            }
        }
    }

    fn sweep(&mut self, types: &TypeTable) -> usize {
        let mut freed = 0;
        let mut large_list = Vec::new();
        for idx in 0..self.slots.len() {
            let Some(obj) = &mut self.slots[idx] else { continue };
            if obj.gc_marked {
                obj.gc_marked = false;
                if obj.is_large {
                    large_list.push(u32::try_from(idx).expect("heap slot exceeds u32"));
                }
                continue;
            }
            let mut obj = self.slots[idx].take().expect("slot vanished during sweep");
            if let Some(dtor) = types.get(obj.type_id).dtor {
                dtor(&mut obj.payload);
            }
            let idx_u32 = u32::try_from(idx).expect("heap slot exceeds u32");
            if obj.is_large {
                self.large_free.push(idx_u32);
            } else {
                self.pool.release(MultiPool::class_of(obj.payload.estimate_size()), idx_u32);
            }
            freed += 1;
        }
        self.large_list = large_list;
        self.live_count -= freed;
        freed
    }

    /// Snapshot of current heap population.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();
        for obj in self.slots.iter().flatten() {
            *objects_by_type.entry(obj.payload.variant_name()).or_default() += 1;
        }
        HeapStats {
            live_objects: self.live_count,
            free_slots: self.pool.len() + self.large_free.len(),
            total_slots: self.slots.len(),
            large_objects: self.large_list.len(),
            objects_by_type,
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
