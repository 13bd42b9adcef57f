use std::fmt;

use crate::vm::value::Value;

/// Signature all native functions share: the callee sees its arguments as a
/// contiguous slice and runs to completion on the VM's thread.
pub type NativeFunction = fn(&[Value]) -> Value;

/// A host function callable from Lox. Natives hold no references into the
/// heap, so the collector never traces through them.
#[derive(Clone)]
pub struct NativeFn {
    pub fun: NativeFunction,
}

impl NativeFn {
    pub fn new(fun: NativeFunction) -> Self {
        Self { fun }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn>")
    }
}
