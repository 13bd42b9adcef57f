use crate::memory::GC;
use crate::vm::value::Value;

/// A cell through which a closure aliases a variable that may outlive its
/// declaring scope.
///
/// While the variable still lives on the value stack the upvalue is open and
/// records the stack slot. When the slot is about to be discarded the value
/// is copied into the upvalue, closing it.
#[derive(Debug)]
pub enum Upvalue {
    /// Points at a live slot on the value stack.
    Open(usize),

    /// Owns the captured value.
    Closed(Value),
}

impl Upvalue {
    /// Copies the captured value into the upvalue itself.
    pub fn close(&mut self, value: Value) {
        *self = Upvalue::Closed(value);
    }

    /// The stack slot an open upvalue refers to.
    pub fn as_open(&self) -> usize {
        match self {
            Upvalue::Open(index) => *index,
            Upvalue::Closed(_) => panic!("Expected open upvalue"),
        }
    }

    /// Reads the captured value, going through the stack while open.
    pub fn get(&self, gc: &GC) -> Value {
        match self {
            Upvalue::Open(index) => gc.stack[*index].clone(),
            Upvalue::Closed(value) => value.clone(),
        }
    }
}
