//! Object arena and the precise tri-color mark-sweep collector
//!
//! The heap owns every Lox object behind small `u32` handles: an arena of
//! slots plus a free list stands in for an intrusive object list, so the
//! collector can enumerate all live objects for the sweep. It also owns the
//! shared world the collector must treat as roots regardless of who triggers
//! it: the global variable table, the intern set (weak), the `"init"`
//! sentinel, and a temp-root stack that pins values across multi-allocation
//! helpers.
//!
//! Collection never starts inside an allocation. Allocations only grow the
//! accounting; the VM and the compiler each check [`Heap::should_collect`] at
//! their own safepoints and call [`Heap::collect`] with the roots only they
//! can name (the value stack, frame closures, and open upvalues for the VM;
//! the chain of in-progress functions for the compiler).

use tracing::{debug, trace};

use crate::object::{
    BoundMethod, Class, Closure, Function, Instance, LoxString, Native, NativeFn, Object, Upvalue,
    hash_string,
};
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object. Copyable, identity-comparable; never dangles
/// because the collector is precise and only frees unreachable slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    fn index(self) -> usize {
        self.0 as usize
    }
}

struct Slot {
    marked: bool,
    /// Bytes accounted at allocation time, released verbatim on free.
    size: usize,
    obj: Object,
}

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    objects: Vec<Option<Slot>>,
    free: Vec<u32>,
    /// Intern set: every live string, keyed by itself. Weak during GC.
    strings: Table,
    /// Global variables. Owned here so compile-time collections see them.
    pub globals: Table,
    init_string: ObjRef,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<ObjRef>,
    temp_roots: Vec<Value>,
    /// Collect at every safepoint instead of waiting for the threshold.
    pub stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Heap {
            objects: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            globals: Table::new(),
            init_string: ObjRef(0),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            gray: Vec::new(),
            temp_roots: Vec::new(),
            stress: false,
        };
        heap.init_string = heap.copy_string("init");
        heap
    }

    /// The interned `"init"` string used for constructor dispatch.
    pub fn init_string(&self) -> ObjRef {
        self.init_string
    }

    // =========================================================================
    // Allocation and interning
    // =========================================================================

    fn allocate(&mut self, obj: Object) -> ObjRef {
        let size = size_of::<Slot>() + obj.heap_size();
        self.bytes_allocated += size;
        let slot = Slot {
            marked: false,
            size,
            obj,
        };
        let r = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.objects.push(Some(slot));
                ObjRef((self.objects.len() - 1) as u32)
            }
        };
        trace!(target: "lox::gc", index = r.0, bytes = size, "allocate");
        r
    }

    /// Interns a borrowed string, copying only if it is not already present.
    pub fn copy_string(&mut self, text: &str) -> ObjRef {
        let hash = hash_string(text);
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        self.intern_new(text.to_owned().into_boxed_str(), hash)
    }

    /// Interns an owned string, reusing the buffer when it is new.
    pub fn take_string(&mut self, text: String) -> ObjRef {
        let hash = hash_string(&text);
        if let Some(existing) = self.find_interned(&text, hash) {
            return existing;
        }
        self.intern_new(text.into_boxed_str(), hash)
    }

    fn find_interned(&self, text: &str, hash: u32) -> Option<ObjRef> {
        self.strings.find_string(hash, |r| self.string_text(r) == text)
    }

    fn intern_new(&mut self, text: Box<str>, hash: u32) -> ObjRef {
        let r = self.allocate(Object::Str(LoxString { text, hash }));
        // The intern table holds keys weakly, so pin the new string while the
        // table itself may grow.
        self.temp_push(Value::Obj(r));
        self.strings.set(r, hash, Value::Nil);
        self.temp_pop();
        r
    }

    pub fn new_function(&mut self) -> ObjRef {
        self.allocate(Object::Function(Function::new()))
    }

    pub fn new_native(&mut self, function: NativeFn) -> ObjRef {
        self.allocate(Object::Native(Native { function }))
    }

    pub fn new_closure(&mut self, function: ObjRef) -> ObjRef {
        let count = self.function(function).upvalue_count;
        self.allocate(Object::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(count),
        }))
    }

    pub fn new_upvalue(&mut self, upvalue: Upvalue) -> ObjRef {
        self.allocate(Object::Upvalue(upvalue))
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.allocate(Object::Class(Class {
            name,
            methods: Table::new(),
        }))
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.allocate(Object::Instance(Instance {
            class,
            fields: Table::new(),
        }))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.allocate(Object::BoundMethod(BoundMethod { receiver, method }))
    }

    /// Appends to a function's constant pool, pinning the value so a
    /// collection racing the pool growth cannot reclaim it.
    pub fn add_constant(&mut self, function: ObjRef, value: Value) -> usize {
        self.temp_push(value);
        let index = self.function_mut(function).chunk.add_constant(value);
        self.temp_pop();
        index
    }

    pub fn temp_push(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn temp_pop(&mut self) {
        self.temp_roots.pop();
    }

    // =========================================================================
    // Typed access
    // =========================================================================

    fn slot(&self, r: ObjRef) -> &Slot {
        match &self.objects[r.index()] {
            Some(slot) => slot,
            None => unreachable!("use of freed object"),
        }
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        match &mut self.objects[r.index()] {
            Some(slot) => slot,
            None => unreachable!("use of freed object"),
        }
    }

    pub fn get(&self, r: ObjRef) -> &Object {
        &self.slot(r).obj
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        &mut self.slot_mut(r).obj
    }

    pub fn string(&self, r: ObjRef) -> &LoxString {
        match self.get(r) {
            Object::Str(s) => s,
            _ => unreachable!("not a string"),
        }
    }

    pub fn string_text(&self, r: ObjRef) -> &str {
        &self.string(r).text
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.string(r).hash
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Object::Function(f) => f,
            _ => unreachable!("not a function"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut Function {
        match self.get_mut(r) {
            Object::Function(f) => f,
            _ => unreachable!("not a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Object::Closure(c) => c,
            _ => unreachable!("not a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match self.get_mut(r) {
            Object::Closure(c) => c,
            _ => unreachable!("not a closure"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Object::Upvalue(u) => u,
            _ => unreachable!("not an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Object::Upvalue(u) => u,
            _ => unreachable!("not an upvalue"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            Object::Class(c) => c,
            _ => unreachable!("not a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.get_mut(r) {
            Object::Class(c) => c,
            _ => unreachable!("not a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.get(r) {
            Object::Instance(i) => i,
            _ => unreachable!("not an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.get_mut(r) {
            Object::Instance(i) => i,
            _ => unreachable!("not an instance"),
        }
    }

    pub fn as_instance(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Object::Instance(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_class(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Object::Class(_)) => Some(r),
            _ => None,
        }
    }

    pub fn as_string(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Obj(r) if matches!(self.get(r), Object::Str(_)) => Some(r),
            _ => None,
        }
    }

    // =========================================================================
    // Printing
    // =========================================================================

    pub fn value_to_string(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Obj(r) => self.object_to_string(r),
        }
    }

    fn object_to_string(&self, r: ObjRef) -> String {
        match self.get(r) {
            Object::Str(s) => s.text.to_string(),
            Object::Function(f) => self.function_name(f),
            Object::Closure(c) => self.function_name(self.function(c.function)),
            Object::BoundMethod(b) => {
                let closure = self.closure(b.method);
                self.function_name(self.function(closure.function))
            }
            Object::Class(c) => self.string_text(c.name).to_string(),
            Object::Instance(i) => {
                format!("{} instance", self.string_text(self.class(i.class).name))
            }
            Object::Native(_) => "<native fn>".to_string(),
            Object::Upvalue(_) => "upvalue".to_string(),
        }
    }

    fn function_name(&self, f: &Function) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.string_text(name)),
            None => "<script>".to_string(),
        }
    }

    // =========================================================================
    // Collection
    // =========================================================================

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Runs a full mark-sweep cycle. `value_roots` and `object_roots` are the
    /// caller's execution roots; the heap adds the roots it owns (globals,
    /// the init sentinel, pinned temps) and treats the intern set weakly.
    pub fn collect(&mut self, value_roots: &[Value], object_roots: &[ObjRef]) {
        let before = self.bytes_allocated;
        debug!(target: "lox::gc", bytes = before, "gc begin");

        for &v in value_roots {
            self.mark_value(v);
        }
        for &r in object_roots {
            self.mark_object(r);
        }
        let temps = self.temp_roots.clone();
        for v in temps {
            self.mark_value(v);
        }
        let globals: Vec<(ObjRef, Value)> =
            self.globals.iter().map(|(k, _, v)| (k, v)).collect();
        for (key, value) in globals {
            self.mark_object(key);
            self.mark_value(value);
        }
        self.mark_object(self.init_string);

        self.trace_references();
        self.remove_unmarked_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        debug!(
            target: "lox::gc",
            freed = before - self.bytes_allocated,
            bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn mark_value(&mut self, v: Value) {
        if let Value::Obj(r) = v {
            self.mark_object(r);
        }
    }

    fn mark_object(&mut self, r: ObjRef) {
        let slot = self.slot_mut(r);
        if slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    /// Grays everything reachable through one object.
    fn blacken(&mut self, r: ObjRef) {
        let mut values: Vec<Value> = Vec::new();
        let mut refs: Vec<ObjRef> = Vec::new();
        match self.get(r) {
            Object::Str(_) | Object::Native(_) => {}
            // An open upvalue's slot is reachable through the stack roots.
            Object::Upvalue(Upvalue::Open(_)) => {}
            Object::Upvalue(Upvalue::Closed(v)) => values.push(*v),
            Object::Function(f) => {
                if let Some(name) = f.name {
                    refs.push(name);
                }
                values.extend_from_slice(&f.chunk.constants);
            }
            Object::Closure(c) => {
                refs.push(c.function);
                refs.extend_from_slice(&c.upvalues);
            }
            Object::Class(c) => {
                refs.push(c.name);
                for (key, _, value) in c.methods.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Object::Instance(i) => {
                refs.push(i.class);
                for (key, _, value) in i.fields.iter() {
                    refs.push(key);
                    values.push(value);
                }
            }
            Object::BoundMethod(b) => {
                values.push(b.receiver);
                refs.push(b.method);
            }
        }
        for v in values {
            self.mark_value(v);
        }
        for o in refs {
            self.mark_object(o);
        }
    }

    /// Weak pass over the intern set: strings in the table must not keep
    /// themselves alive.
    fn remove_unmarked_strings(&mut self) {
        let Heap {
            strings, objects, ..
        } = self;
        strings.remove_unmarked_keys(|r| objects[r.index()].as_ref().is_some_and(|s| s.marked));
    }

    fn sweep(&mut self) {
        for index in 0..self.objects.len() {
            let freed_size = match &mut self.objects[index] {
                Some(slot) => {
                    if slot.marked {
                        slot.marked = false;
                        None
                    } else {
                        Some(slot.size)
                    }
                }
                None => None,
            };
            if let Some(size) = freed_size {
                self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
                self.objects[index] = None;
                self.free.push(index as u32);
                trace!(target: "lox::gc", index, bytes = size, "free");
            }
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|s| s.is_some()).count()
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

    #[test]
    fn test_interning_dedups_by_content() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        let c = heap.take_string("hello".to_string());
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, heap.copy_string("world"));
    }

    #[test]
    fn test_collect_frees_unreachable_strings() {
        let mut heap = Heap::new();
        let baseline = heap.object_count();
        heap.copy_string("garbage");
        assert_eq!(heap.object_count(), baseline + 1);
        heap.collect(&[], &[]);
        // Interning is weak; nothing else referenced the string.
        assert_eq!(heap.object_count(), baseline);
    }

    #[test]
    fn test_collect_keeps_rooted_values() {
        let mut heap = Heap::new();
        let s = heap.copy_string("kept");
        heap.collect(&[Value::Obj(s)], &[]);
        assert_eq!(heap.string_text(s), "kept");
        // And the survivor is still interned, not re-created.
        assert_eq!(heap.copy_string("kept"), s);
    }

    #[test]
    fn test_temp_roots_pin_across_collection() {
        let mut heap = Heap::new();
        let s = heap.copy_string("pinned");
        heap.temp_push(Value::Obj(s));
        heap.collect(&[], &[]);
        assert_eq!(heap.string_text(s), "pinned");
        heap.temp_pop();
    }

    #[test]
    fn test_init_sentinel_survives_collection() {
        let mut heap = Heap::new();
        let init = heap.init_string();
        heap.collect(&[], &[]);
        assert_eq!(heap.string_text(init), "init");
    }

    #[test]
    fn test_function_constants_are_traced() {
        let mut heap = Heap::new();
        let function = heap.new_function();
        let s = heap.copy_string("constant");
        heap.add_constant(function, Value::Obj(s));
        heap.collect(&[], &[function]);
        assert_eq!(heap.string_text(s), "constant");
    }

    #[test]
    fn test_closure_traces_upvalues() {
        let mut heap = Heap::new();
        let function = heap.new_function();
        let closure = heap.new_closure(function);
        let captured = heap.copy_string("captured");
        let upvalue = heap.new_upvalue(Upvalue::Closed(Value::Obj(captured)));
        heap.closure_mut(closure).upvalues.push(upvalue);
        heap.collect(&[Value::Obj(closure)], &[]);
        assert_eq!(heap.string_text(captured), "captured");
    }

    #[test]
    fn test_globals_are_roots() {
        let mut heap = Heap::new();
        let name = heap.copy_string("g");
        let value = heap.copy_string("held by a global");
        let hash = heap.str_hash(name);
        heap.globals.set(name, hash, Value::Obj(value));
        heap.collect(&[], &[]);
        assert_eq!(heap.string_text(value), "held by a global");
    }

    #[test]
    fn test_sweep_reclaims_bytes_and_slots() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        let count = heap.object_count();
        for i in 0..16 {
            heap.copy_string(&format!("transient{i}"));
        }
        assert!(heap.bytes_allocated() > before);
        heap.collect(&[], &[]);
        assert_eq!(heap.bytes_allocated(), before);
        assert_eq!(heap.object_count(), count);
        // Freed slots are recycled by the next allocation.
        let total_slots = heap.objects.len();
        heap.copy_string("recycled");
        assert_eq!(heap.objects.len(), total_slots);
    }

    #[test]
    fn test_instance_fields_are_traced() {
        let mut heap = Heap::new();
        let class_name = heap.copy_string("Point");
        let class = heap.new_class(class_name);
        let instance = heap.new_instance(class);
        let field = heap.copy_string("x");
        let field_value = heap.copy_string("one");
        let hash = heap.str_hash(field);
        heap.instance_mut(instance)
            .fields
            .set(field, hash, Value::Obj(field_value));
        heap.collect(&[Value::Obj(instance)], &[]);
        assert_eq!(heap.string_text(class_name), "Point");
        assert_eq!(heap.string_text(field_value), "one");
    }
}
