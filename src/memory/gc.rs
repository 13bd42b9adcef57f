use colored::*;
use std::collections::HashMap;
use std::mem;

use super::object::{
    BoundMethod, Class, Closure, Function, Instance, NativeFn, Object, Upvalue,
};
use super::ptr::Gc;
use super::trace::Traced;
use crate::debug::{LOG_GC, STRESS_GC};
use crate::vm::value::Value;
use crate::vm::CallFrame;

const DEFAULT_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Owns every heap allocated object and reclaims the unreachable ones with a
/// precise mark and sweep collection.
///
/// The collector also owns the VM's root set (value stack, globals, call
/// frames, open upvalues), so root discovery never has to reach back into the
/// VM. The VM and the compiler borrow the collector for the duration of a
/// run.
///
/// A collection may only trigger at a safepoint, i.e. inside one of the
/// `track_*` calls made with `collect = true`. Callers must keep every value
/// they still need reachable from a root across such a call. Compile time
/// allocations (strings, functions) always pass `collect = false`, so the
/// compiler's intermediate state is never a root.
#[derive(Debug)]
pub struct GC {
    /// The value stack, shared with the VM.
    pub stack: Vec<Value>,

    /// Global bindings, shared with the VM.
    pub globals: HashMap<String, Value>,

    /// The call frame stack, shared with the VM.
    pub call_frames: Vec<CallFrame>,

    /// Upvalues still pointing into the value stack, sorted by ascending
    /// stack slot so closing a suffix only touches the tail.
    pub open_upvalues: Vec<Gc<Object>>,

    /// Collect at every safepoint instead of waiting for the threshold.
    pub stress: bool,

    /// All objects tracked by the collector, excluding strings.
    objects: Vec<Box<Traced<Object>>>,

    /// Interned strings; equal strings always share one object.
    interned_strings: HashMap<String, Box<Traced<Object>>>,

    /// Marked objects whose references have not been traced yet.
    gray_list: Vec<Gc<Object>>,

    /// Total bytes currently attributed to live objects.
    bytes_allocated: usize,

    /// Threshold of `bytes_allocated` above which the next safepoint
    /// collects.
    next_gc: usize,
}

impl GC {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(crate::vm::MAX_STACK),
            globals: HashMap::new(),
            call_frames: Vec::with_capacity(crate::vm::MAX_FRAMES),
            open_upvalues: Vec::new(),
            stress: STRESS_GC,
            objects: Vec::new(),
            interned_strings: HashMap::new(),
            gray_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    /// Interns a string. Returns the existing object when an equal string
    /// has been tracked before, so string equality coincides with identity.
    ///
    /// Interning never collects; the fresh object may not be reachable yet.
    pub fn track_string(&mut self, string: String) -> Gc<Object> {
        if !self.interned_strings.contains_key(&string) {
            self.bytes_allocated += mem::size_of::<String>() + string.len();
            self.interned_strings
                .insert(string.clone(), Box::new(Traced::new(Object::String(string.clone()))));
        }
        let object = self
            .interned_strings
            .get_mut(&string)
            .expect("interned string was just inserted");
        Gc::new(object)
    }

    pub fn track_function(&mut self, function: Function) -> Gc<Object> {
        self.track(Object::Function(function), false)
    }

    pub fn track_native(&mut self, native_fn: NativeFn) -> Gc<Object> {
        self.track(Object::Native(native_fn), false)
    }

    pub fn track_closure(&mut self, closure: Closure, collect: bool) -> Gc<Object> {
        self.track(Object::Closure(closure), collect)
    }

    pub fn track_upvalue(&mut self, upvalue: Upvalue, collect: bool) -> Gc<Object> {
        self.track(Object::Upvalue(upvalue), collect)
    }

    pub fn track_class(&mut self, class: Class, collect: bool) -> Gc<Object> {
        self.track(Object::Class(class), collect)
    }

    pub fn track_instance(&mut self, instance: Instance, collect: bool) -> Gc<Object> {
        self.track(Object::Instance(instance), collect)
    }

    pub fn track_bound_method(&mut self, bound: BoundMethod, collect: bool) -> Gc<Object> {
        self.track(Object::BoundMethod(bound), collect)
    }

    /// Registers a new object. With `collect` the call is a safepoint: a
    /// collection may run before the object is inserted, so the object
    /// itself can never be swept here, but everything it references must
    /// already be reachable from a root.
    fn track(&mut self, object: Object, collect: bool) -> Gc<Object> {
        if collect && (self.stress || self.bytes_allocated > self.next_gc) {
            self.collect();
        }
        self.bytes_allocated += Self::size_of_object(&object);
        self.objects.push(Box::new(Traced::new(object)));
        let object = self.objects.last_mut().expect("object was just pushed");
        Gc::new(object)
    }

    fn size_of_object(object: &Object) -> usize {
        match object {
            Object::String(s) => mem::size_of::<String>() + s.len(),
            Object::Function(_) => mem::size_of::<Function>(),
            Object::Native(_) => mem::size_of::<NativeFn>(),
            Object::Closure(_) => mem::size_of::<Closure>(),
            Object::Upvalue(_) => mem::size_of::<Upvalue>(),
            Object::Class(_) => mem::size_of::<Class>(),
            Object::Instance(_) => mem::size_of::<Instance>(),
            Object::BoundMethod(_) => mem::size_of::<BoundMethod>(),
        }
    }

    /// Number of tracked non-string objects, used to observe collections.
    #[cfg(test)]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Traces every object reachable from the roots and frees the rest.
    fn collect(&mut self) {
        let before = self.bytes_allocated;
        if LOG_GC {
            println!("{}\t\tBEGIN", "[GC]".cyan());
        }

        self.mark_roots();
        self.trace_references();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        if LOG_GC {
            println!(
                "{}\t\tcollected {} bytes (from {} to {}), next at {}",
                "[GC]".cyan(),
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
            println!("{}\t\tEND", "[GC]".cyan());
        }
    }

    fn mark_roots(&mut self) {
        let object_values = |value: &Value| match value {
            Value::Object(object) => Some(*object),
            _ => None,
        };

        let mut roots: Vec<Gc<Object>> = self.stack.iter().filter_map(object_values).collect();
        roots.extend(self.globals.values().filter_map(object_values));
        roots.extend(self.call_frames.iter().map(|frame| frame.closure));
        roots.extend(self.open_upvalues.iter().copied());

        for object in roots {
            self.mark_object(object);
        }
    }

    /// Drains the gray list, marking everything the gray objects reference.
    fn trace_references(&mut self) {
        while let Some(object) = self.gray_list.pop() {
            self.blacken(object);
        }
    }

    fn mark_value(&mut self, value: &Value) {
        if let Value::Object(object) = value {
            self.mark_object(*object);
        }
    }

    /// Marks an object as reachable and queues it for tracing. An already
    /// marked object is either gray or black and is not queued again.
    fn mark_object(&mut self, object: Gc<Object>) {
        if !object.marked() {
            if LOG_GC {
                println!("{}\t\tmark {}", "[GC]".cyan(), object.as_ref());
            }
            object.mark();
            self.gray_list.push(object);
        }
    }

    /// Marks everything a gray object can reach, turning it black.
    fn blacken(&mut self, object: Gc<Object>) {
        match object.as_ref() {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(function) => {
                if let Some(name) = function.name {
                    self.mark_object(name);
                }
                for constant in &function.chunk.constants {
                    self.mark_value(constant);
                }
            }
            Object::Closure(closure) => {
                self.mark_object(closure.function);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue);
                }
            }
            Object::Upvalue(upvalue) => match upvalue {
                Upvalue::Closed(value) => self.mark_value(value),
                Upvalue::Open(_) => {}
            },
            Object::Class(class) => {
                self.mark_object(class.name);
                for method in class.methods.values() {
                    self.mark_object(*method);
                }
            }
            Object::Instance(instance) => {
                self.mark_object(instance.class);
                for field in instance.fields.values() {
                    self.mark_value(field);
                }
            }
            Object::BoundMethod(bound) => {
                self.mark_value(&bound.receiver);
                self.mark_object(bound.method);
            }
        }
    }

    /// Frees every object left unmarked and clears the marks on the rest.
    /// The intern map is pruned first; it holds its strings through owned
    /// keys and would otherwise keep dead strings alive forever.
    fn sweep(&mut self) {
        let mut freed = 0;

        self.interned_strings.retain(|key, object| {
            if object.marked() {
                object.set_mark(false);
                true
            } else {
                if LOG_GC {
                    println!("{}\t\tsweep string {}", "[GC]".cyan(), key);
                }
                freed += mem::size_of::<String>() + key.len();
                false
            }
        });

        let mut i = 0;
        while i < self.objects.len() {
            if self.objects[i].marked() {
                self.objects[i].set_mark(false);
                i += 1;
            } else {
                // swap_remove replaces this slot with the last element, so
                // the index is revisited.
                let removed = self.objects.swap_remove(i);
                if LOG_GC {
                    println!("{}\t\tsweep {}", "[GC]".cyan(), removed.data);
                }
                freed += Self::size_of_object(&removed.data);
            }
        }

        self.bytes_allocated -= freed;
    }
}

impl Default for GC {
    fn default() -> Self {
        Self::new()
    }
}
