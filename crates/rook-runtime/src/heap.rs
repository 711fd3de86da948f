//! Object heap and garbage collector.
//!
//! Objects live in a slot arena indexed by [`ObjRef`]. A freed slot goes on
//! a free list and is reused by the next allocation, so handles stay dense.
//! Each slot carries the object, its mark bit, and the footprint recorded at
//! allocation time.
//!
//! Collection is tracing mark-and-sweep. The heap only implements the
//! mechanism (marking, the gray worklist, sweeping); the [`Vm`] decides when
//! to collect and supplies the roots, because the roots live in VM state
//! (stack, frames, globals, open upvalues, compiler roots).
//!
//! [`Vm`]: crate::vm::Vm

use crate::object::{Obj, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjNative, ObjRef, ObjString, ObjUpvalue};
use crate::value::{number_to_string, Value};

/// Collection threshold before the first cycle.
const FIRST_GC_AT: usize = 1024 * 1024;

/// Heap growth factor applied after each collection.
const HEAP_GROW_FACTOR: usize = 2;

#[derive(Debug)]
struct Slot {
    obj: Obj,
    marked: bool,
    size: usize,
}

/// The object arena with GC bookkeeping.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_AT,
            gray: Vec::new(),
        }
    }

    /// Approximate live bytes.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Current collection threshold.
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when an allocation of `upcoming` bytes should collect first.
    pub fn should_collect(&self, upcoming: usize) -> bool {
        if cfg!(feature = "gc-stress") {
            return true;
        }
        self.bytes_allocated + upcoming > self.next_gc
    }

    /// Places an object into the arena and returns its handle.
    ///
    /// Insertion never collects; the VM checks [`Heap::should_collect`]
    /// before building the object, while every operand is still rooted.
    pub fn insert(&mut self, obj: Obj) -> ObjRef {
        let size = obj.size_hint();
        self.bytes_allocated += size;
        let slot = Slot {
            obj,
            marked: false,
            size,
        };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef::new(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef::new((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Borrows the object behind a handle.
    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()] {
            Some(slot) => &slot.obj,
            None => panic!("use of freed object reference {:?}", r),
        }
    }

    /// Mutably borrows the object behind a handle.
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()] {
            Some(slot) => &mut slot.obj,
            None => panic!("use of freed object reference {:?}", r),
        }
    }

    // Typed accessors. A kind mismatch is a compiler or VM bug, and fatal.

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            other => panic!("expected string, found {}", other.kind_name()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            other => panic!("expected function, found {}", other.kind_name()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            other => panic!("expected closure, found {}", other.kind_name()),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.kind_name()),
        }
    }

    pub fn native(&self, r: ObjRef) -> &ObjNative {
        match self.get(r) {
            Obj::Native(n) => n,
            other => panic!("expected native, found {}", other.kind_name()),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            other => panic!("expected class, found {}", other.kind_name()),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            other => panic!("expected instance, found {}", other.kind_name()),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &ObjBoundMethod {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            other => panic!("expected bound method, found {}", other.kind_name()),
        }
    }

    /// Convenience for error messages and `print`.
    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Str(s) => s.as_str().to_string(),
            Value::Obj(r) => self.object_to_string(r),
        }
    }

    fn object_to_string(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::String(s) => s.chars.to_string(),
            Obj::Function(f) => self.function_name(f),
            Obj::Closure(c) => self.function_name(self.function(c.function)),
            Obj::Upvalue(_) => "upvalue".to_string(),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Class(c) => self.string(c.name).chars.to_string(),
            Obj::Instance(i) => {
                format!("{} instance", self.string(self.class(i.class).name).chars)
            }
            Obj::BoundMethod(b) => self.object_to_string(b.method),
        }
    }

    fn function_name(&self, f: &ObjFunction) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// True if the object is marked in the current cycle.
    pub fn is_marked(&self, r: ObjRef) -> bool {
        match &self.slots[r.index()] {
            Some(slot) => slot.marked,
            None => false,
        }
    }

    /// Marks an object and queues it for tracing.
    pub fn mark(&mut self, r: ObjRef) {
        if let Some(slot) = &mut self.slots[r.index()] {
            if !slot.marked {
                slot.marked = true;
                self.gray.push(r);
            }
        }
    }

    /// Marks the object behind a value, if any.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark(r);
        }
    }

    /// Drains the gray worklist, blackening each object by marking its
    /// outgoing references.
    pub fn trace(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Gather the outgoing references first, then mark them; marking
        // mutates slots, so it cannot overlap a borrow of this object.
        let mut refs: Vec<ObjRef> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    refs.push(name);
                }
                values.extend(f.chunk.constants.iter().copied());
            }
            Obj::Closure(c) => {
                refs.push(c.function);
                refs.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let ObjUpvalue::Closed(value) = u {
                    values.push(*value);
                }
            }
            Obj::Class(c) => {
                refs.push(c.name);
                if let Some(init) = c.initializer {
                    refs.push(init);
                }
                for (key, _, value) in c.methods.entries() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Obj::Instance(i) => {
                refs.push(i.class);
                for (key, _, value) in i.fields.entries() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Obj::BoundMethod(b) => {
                refs.push(b.method);
                values.push(b.receiver);
            }
        }

        for child in refs {
            self.mark(child);
        }
        for value in values {
            self.mark_value(value);
        }
    }

    /// Frees every unmarked slot and clears surviving marks, so all live
    /// objects start the next cycle unmarked. Returns `(freed objects,
    /// freed bytes)`.
    pub fn sweep(&mut self) -> (usize, usize) {
        let mut freed = 0usize;
        let mut freed_bytes = 0usize;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(slot) => {
                    freed += 1;
                    freed_bytes += slot.size;
                    *entry = None;
                    self.free.push(index as u32);
                }
                None => {}
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(FIRST_GC_AT);
        (freed, freed_bytes)
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
